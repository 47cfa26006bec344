use std::time::Duration;

use anyhow::Context;
use beacon_lifecycle::{CloudState, InstanceInfo};
use tokio::process::Command;

use crate::adapters::CloudCompute;
use crate::support::truncate_utf8;

const MAX_STDERR_BYTES: usize = 2 * 1024;

/// EC2 control through the `aws` CLI, so credentials follow the usual
/// profile/env/instance-role resolution.
#[derive(Debug, Clone)]
pub struct AwsCli {
    region: Option<String>,
    profile: Option<String>,
    timeout: Duration,
}

#[derive(Debug, serde::Deserialize)]
struct DescribeRow {
    #[serde(rename = "State")]
    state: Option<String>,
    #[serde(rename = "PublicIp")]
    public_ip: Option<String>,
    #[serde(rename = "PrivateIp")]
    private_ip: Option<String>,
}

impl AwsCli {
    pub fn new(region: Option<String>, profile: Option<String>, timeout: Duration) -> Self {
        Self {
            region,
            profile,
            timeout,
        }
    }

    async fn run(&self, args: &[&str]) -> anyhow::Result<Vec<u8>> {
        let mut cmd = Command::new("aws");
        cmd.args(args);
        if let Some(region) = &self.region {
            cmd.args(["--region", region.as_str()]);
        }
        if let Some(profile) = &self.profile {
            cmd.args(["--profile", profile.as_str()]);
        }
        cmd.kill_on_drop(true);

        let label = format!("aws {}", args.iter().take(2).copied().collect::<Vec<_>>().join(" "));
        tracing::debug!(command = %label, "running cloud cli");

        let out = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| anyhow::anyhow!("timed out after {}s", self.timeout.as_secs()))
            .with_context(|| label.clone())?
            .with_context(|| format!("spawn {label}"))?;

        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            anyhow::bail!(
                "{label} exited with {}: {}",
                out.status,
                truncate_utf8(stderr.trim(), MAX_STDERR_BYTES)
            );
        }
        Ok(out.stdout)
    }
}

pub(crate) fn parse_describe_output(raw: &[u8]) -> anyhow::Result<InstanceInfo> {
    let row: DescribeRow = serde_json::from_slice(raw).context("decode describe-instances output")?;
    let state = row
        .state
        .map(|s| CloudState::parse(&s))
        .ok_or_else(|| anyhow::anyhow!("describe-instances returned no state"))?;
    let non_empty = |v: Option<String>| v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
    Ok(InstanceInfo {
        state,
        public_address: non_empty(row.public_ip),
        private_address: non_empty(row.private_ip),
    })
}

#[async_trait::async_trait]
impl CloudCompute for AwsCli {
    async fn start(&self, instance_id: &str) -> anyhow::Result<()> {
        self.run(&["ec2", "start-instances", "--instance-ids", instance_id])
            .await
            .map(|_| ())
    }

    async fn stop(&self, instance_id: &str) -> anyhow::Result<()> {
        self.run(&["ec2", "stop-instances", "--instance-ids", instance_id])
            .await
            .map(|_| ())
    }

    async fn wait_until_running(&self, instance_id: &str) -> anyhow::Result<()> {
        self.run(&["ec2", "wait", "instance-running", "--instance-ids", instance_id])
            .await
            .map(|_| ())
    }

    async fn wait_until_ready(&self, instance_id: &str) -> anyhow::Result<()> {
        self.run(&["ec2", "wait", "instance-status-ok", "--instance-ids", instance_id])
            .await
            .map(|_| ())
    }

    async fn wait_until_stopped(&self, instance_id: &str) -> anyhow::Result<()> {
        self.run(&["ec2", "wait", "instance-stopped", "--instance-ids", instance_id])
            .await
            .map(|_| ())
    }

    async fn describe(&self, instance_id: &str) -> anyhow::Result<InstanceInfo> {
        let out = self
            .run(&[
                "ec2",
                "describe-instances",
                "--instance-ids",
                instance_id,
                "--query",
                "Reservations[0].Instances[0].{State:State.Name,PublicIp:PublicIpAddress,PrivateIp:PrivateIpAddress}",
                "--output",
                "json",
            ])
            .await?;
        parse_describe_output(&out)
    }
}
