use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use chrono::{DateTime, FixedOffset, Local, Timelike, Utc};
use chrono_tz::Tz;
use serde::Deserialize;

use crate::support::env_string;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub control: ControlConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Cloud instance that hosts the game server.
    pub instance_id: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub aws_profile: Option<String>,

    #[serde(default = "default_idle_timeout_minutes")]
    pub idle_timeout_minutes: u32,
    /// Hour of day (0-23) for the daily restart, in `timezone`.
    #[serde(default = "default_maintenance_hour")]
    pub maintenance_hour: u32,
    /// `local`, an IANA name such as `Asia/Tokyo`, or a fixed offset such as `+09:00`.
    #[serde(default = "default_timezone")]
    pub timezone: String,

    pub ssh_username: String,
    pub ssh_key_path: PathBuf,
    pub run_command: String,
    #[serde(default = "default_ready_sentinel")]
    pub ready_sentinel: String,
    #[serde(default = "default_launch_timeout_secs")]
    pub launch_timeout_secs: u64,

    #[serde(default = "default_query_port")]
    pub query_port: u16,
    #[serde(default = "default_rcon_port")]
    pub rcon_port: u16,
    #[serde(default)]
    pub rcon_password: String,
    /// Wait after a successful console stop, giving the server time to save.
    #[serde(default = "default_console_stop_grace_secs")]
    pub console_stop_grace_secs: u64,

    /// Bound for query and console calls.
    #[serde(default = "default_remote_call_timeout_secs")]
    pub remote_call_timeout_secs: u64,
    /// Bound for each cloud CLI invocation (waiters included).
    #[serde(default = "default_cloud_call_timeout_secs")]
    pub cloud_call_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControlConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// Bearer token required on command routes; unset disables the check.
    #[serde(default)]
    pub command_token: Option<String>,
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            command_token: None,
            reconcile_interval_secs: default_reconcile_interval_secs(),
        }
    }
}

fn default_idle_timeout_minutes() -> u32 {
    10
}

fn default_maintenance_hour() -> u32 {
    4
}

fn default_timezone() -> String {
    "local".to_string()
}

fn default_ready_sentinel() -> String {
    "Done".to_string()
}

fn default_launch_timeout_secs() -> u64 {
    300
}

fn default_query_port() -> u16 {
    25565
}

fn default_rcon_port() -> u16 {
    25575
}

fn default_console_stop_grace_secs() -> u64 {
    10
}

fn default_remote_call_timeout_secs() -> u64 {
    5
}

fn default_cloud_call_timeout_secs() -> u64 {
    15 * 60
}

fn default_listen() -> SocketAddr {
    ([0, 0, 0, 0], 8080).into()
}

fn default_reconcile_interval_secs() -> u64 {
    60
}

/// Zone used to read the wall-clock hour for maintenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Zone {
    Local,
    Named(Tz),
    Fixed(FixedOffset),
}

impl Zone {
    /// Accepts `local`, an IANA name such as `Asia/Tokyo`, or a fixed offset
    /// such as `+09:00`. Unknown names fall back to UTC with a warning.
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let s = raw.trim();
        if s.eq_ignore_ascii_case("local") || s.is_empty() {
            return Ok(Zone::Local);
        }
        if s.starts_with('+') || s.starts_with('-') {
            return parse_offset(s).map(Zone::Fixed);
        }
        if s.eq_ignore_ascii_case("utc") || s == "Z" {
            return Ok(Zone::Named(Tz::UTC));
        }
        match s.parse::<Tz>() {
            Ok(tz) => Ok(Zone::Named(tz)),
            Err(_) => {
                tracing::warn!(timezone = %s, "unknown timezone; using UTC");
                Ok(Zone::Named(Tz::UTC))
            }
        }
    }

    pub fn hour_of(&self, now: DateTime<Utc>) -> u32 {
        match self {
            Zone::Local => now.with_timezone(&Local).hour(),
            Zone::Named(tz) => now.with_timezone(tz).hour(),
            Zone::Fixed(offset) => now.with_timezone(offset).hour(),
        }
    }
}

fn parse_offset(s: &str) -> anyhow::Result<FixedOffset> {
    let (sign, rest) = match s.split_at(1) {
        ("-", rest) => (-1, rest),
        (_, rest) => (1, rest),
    };
    let (h, m) = rest.split_once(':').unwrap_or((rest, "0"));
    let hours: i32 = h.parse().with_context(|| format!("invalid offset hours in {s}"))?;
    let minutes: i32 = m.parse().with_context(|| format!("invalid offset minutes in {s}"))?;
    if !(0..=14).contains(&hours) || !(0..60).contains(&minutes) {
        anyhow::bail!("offset out of range: {s}");
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
        .ok_or_else(|| anyhow::anyhow!("offset out of range: {s}"))
}

impl ServerConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.idle_timeout_minutes) * 60)
    }

    pub fn launch_timeout(&self) -> Duration {
        Duration::from_secs(self.launch_timeout_secs)
    }

    pub fn console_stop_grace(&self) -> Duration {
        Duration::from_secs(self.console_stop_grace_secs)
    }

    pub fn remote_call_timeout(&self) -> Duration {
        Duration::from_secs(self.remote_call_timeout_secs)
    }

    pub fn cloud_call_timeout(&self) -> Duration {
        Duration::from_secs(self.cloud_call_timeout_secs)
    }

    pub fn zone(&self) -> anyhow::Result<Zone> {
        Zone::parse(&self.timezone)
    }
}

impl ControlConfig {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs.max(1))
    }
}

impl Config {
    pub fn from_toml(raw: &str) -> anyhow::Result<Self> {
        let cfg: Config = toml::from_str(raw).context("parse config")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let mut cfg: Config = toml::from_str(&raw)
            .with_context(|| format!("parse config {}", path.display()))?;
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Config path: first CLI argument, then `BEACON_CONFIG`, then `config.toml`.
    pub fn default_path() -> PathBuf {
        std::env::args()
            .nth(1)
            .or_else(|| env_string("BEACON_CONFIG"))
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("config.toml"))
    }

    fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        if let Some(listen) = env_string("BEACON_LISTEN") {
            self.control.listen = listen
                .parse()
                .with_context(|| format!("BEACON_LISTEN is not a socket address: {listen}"))?;
        }
        if let Some(token) = env_string("BEACON_COMMAND_TOKEN") {
            self.control.command_token = Some(token);
        }
        if let Some(passwd) = env_string("BEACON_RCON_PASSWORD") {
            self.server.rcon_password = passwd;
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let s = &self.server;
        if s.instance_id.trim().is_empty() {
            anyhow::bail!("server.instance_id must be non-empty");
        }
        if s.idle_timeout_minutes == 0 {
            anyhow::bail!("server.idle_timeout_minutes must be at least 1");
        }
        if s.maintenance_hour > 23 {
            anyhow::bail!(
                "server.maintenance_hour must be in 0..=23 (got {})",
                s.maintenance_hour
            );
        }
        if s.run_command.trim().is_empty() {
            anyhow::bail!("server.run_command must be non-empty");
        }
        if s.ready_sentinel.is_empty() {
            anyhow::bail!("server.ready_sentinel must be non-empty");
        }
        s.zone().context("server.timezone")?;
        if self
            .control
            .command_token
            .as_deref()
            .is_some_and(|t| t.trim().is_empty())
        {
            anyhow::bail!("control.command_token must be non-empty when set");
        }
        Ok(())
    }
}
