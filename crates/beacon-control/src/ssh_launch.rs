use std::{path::PathBuf, process::Stdio, time::Duration};

use anyhow::Context;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
    sync::mpsc,
};

use crate::adapters::RemoteLauncher;

const LINE_BUFFER: usize = 256;

/// Runs the launch command over the system `ssh` client.
///
/// The command is expected to detach the game server itself (tmux, screen,
/// systemd-run ...); the session is torn down once the caller drops the
/// output receiver.
#[derive(Debug, Clone)]
pub struct SshLauncher {
    username: String,
    key_path: PathBuf,
    connect_timeout: Duration,
}

impl SshLauncher {
    pub fn new(username: impl Into<String>, key_path: impl Into<PathBuf>, connect_timeout: Duration) -> Self {
        Self {
            username: username.into(),
            key_path: key_path.into(),
            connect_timeout,
        }
    }

    fn command(&self, address: &str, remote_command: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-i")
            .arg(&self.key_path)
            .args([
                "-o",
                "BatchMode=yes",
                "-o",
                "StrictHostKeyChecking=no",
                "-o",
                "UserKnownHostsFile=/dev/null",
                "-o",
            ])
            .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)))
            .arg(format!("{}@{}", self.username, address))
            .arg(remote_command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait::async_trait]
impl RemoteLauncher for SshLauncher {
    async fn launch(&self, address: &str, command: &str) -> anyhow::Result<mpsc::Receiver<String>> {
        let mut child = self
            .command(address, command)
            .spawn()
            .with_context(|| format!("spawn ssh to {address}"))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("ssh stdout was not captured"))?;

        if let Some(err) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(err).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(%line, "[ssh stderr]");
                }
            });
        }

        let (tx, rx) = mpsc::channel(LINE_BUFFER);
        let address = address.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    next = lines.next_line() => match next {
                        Ok(Some(line)) => {
                            tracing::debug!(%line, "[remote stdout]");
                            if tx.send(line).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            tracing::warn!(%err, %address, "reading remote output failed");
                            break;
                        }
                    },
                }
            }

            // Receiver gone or stream ended: close the session.
            let _ = child.start_kill();
            match child.wait().await {
                Ok(status) => tracing::debug!(%status, %address, "ssh session closed"),
                Err(err) => tracing::warn!(%err, %address, "ssh session wait failed"),
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_targets_user_at_address() {
        let launcher = SshLauncher::new("ec2-user", "/keys/id", Duration::from_secs(5));
        let cmd = launcher.command("10.0.1.23", "./run.sh");
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect();
        assert_eq!(args.first().map(String::as_str), Some("-i"));
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"ConnectTimeout=5".to_string()));
        assert_eq!(
            &args[args.len() - 2..],
            &["ec2-user@10.0.1.23".to_string(), "./run.sh".to_string()]
        );
    }
}
