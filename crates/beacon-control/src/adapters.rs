use std::sync::Arc;

use beacon_lifecycle::{InstanceInfo, ObservedStats};
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::notify::{Destination, Notice};

/// Cloud instance control. Waiters block until the instance reaches the state
/// or the provider gives up.
#[async_trait::async_trait]
pub trait CloudCompute: Send + Sync {
    async fn start(&self, instance_id: &str) -> anyhow::Result<()>;
    async fn stop(&self, instance_id: &str) -> anyhow::Result<()>;
    async fn wait_until_running(&self, instance_id: &str) -> anyhow::Result<()>;
    /// Instance passed the provider's status checks.
    async fn wait_until_ready(&self, instance_id: &str) -> anyhow::Result<()>;
    async fn wait_until_stopped(&self, instance_id: &str) -> anyhow::Result<()>;
    async fn describe(&self, instance_id: &str) -> anyhow::Result<InstanceInfo>;
}

/// Starts the game-server process on the instance and streams its stdout.
///
/// The remote session lives as long as the returned receiver; dropping it
/// closes the session.
#[async_trait::async_trait]
pub trait RemoteLauncher: Send + Sync {
    async fn launch(&self, address: &str, command: &str) -> anyhow::Result<mpsc::Receiver<String>>;
}

#[async_trait::async_trait]
pub trait StatsQuery: Send + Sync {
    async fn query_stats(&self, address: &str, port: u16) -> anyhow::Result<ObservedStats>;
}

#[async_trait::async_trait]
pub trait RemoteConsole: Send + Sync {
    /// Returns the server's reply to the stop command.
    async fn send_stop(&self, address: &str, port: u16, password: &str) -> anyhow::Result<String>;
}

#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, destination: &Destination, notice: &Notice) -> anyhow::Result<()>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// The remote collaborators a controller drives.
#[derive(Clone)]
pub struct Remotes {
    pub cloud: Arc<dyn CloudCompute>,
    pub launcher: Arc<dyn RemoteLauncher>,
    pub stats: Arc<dyn StatsQuery>,
    pub console: Arc<dyn RemoteConsole>,
}
