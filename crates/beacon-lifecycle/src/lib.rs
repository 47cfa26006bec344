use std::fmt;

/// Lifecycle state of the managed game server, as tracked by the controller.
///
/// NOTE: This is the controller's view. The cloud provider's own view is
/// [`CloudState`]; the two are reconciled every tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    Maintaining,
}

impl ServerState {
    pub fn as_str(self) -> &'static str {
        match self {
            ServerState::Stopped => "stopped",
            ServerState::Starting => "starting",
            ServerState::Running => "running",
            ServerState::Stopping => "stopping",
            ServerState::Maintaining => "maintaining",
        }
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Instance state names reported by the cloud provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum CloudState {
    Pending,
    Running,
    Stopping,
    Stopped,
    ShuttingDown,
    Terminated,
    Unknown(String),
}

impl CloudState {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" => CloudState::Pending,
            "running" => CloudState::Running,
            "stopping" => CloudState::Stopping,
            "stopped" => CloudState::Stopped,
            "shutting-down" => CloudState::ShuttingDown,
            "terminated" => CloudState::Terminated,
            other => CloudState::Unknown(other.to_string()),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, CloudState::Running)
    }
}

impl fmt::Display for CloudState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloudState::Pending => f.write_str("pending"),
            CloudState::Running => f.write_str("running"),
            CloudState::Stopping => f.write_str("stopping"),
            CloudState::Stopped => f.write_str("stopped"),
            CloudState::ShuttingDown => f.write_str("shutting-down"),
            CloudState::Terminated => f.write_str("terminated"),
            CloudState::Unknown(s) => write!(f, "unknown({s})"),
        }
    }
}

/// Result of describing the cloud instance.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct InstanceInfo {
    pub state: CloudState,
    pub public_address: Option<String>,
    pub private_address: Option<String>,
}

/// One live-stats sample. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ObservedStats {
    pub participant_count: u32,
    pub max_participants: Option<u32>,
    pub motd: Option<String>,
}

impl ObservedStats {
    pub fn with_count(participant_count: u32) -> Self {
        Self {
            participant_count,
            max_participants: None,
            motd: None,
        }
    }
}

/// What the status reporter renders.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StatusReport {
    Starting {
        phase: Option<String>,
    },
    Stopped,
    Running {
        address: Option<String>,
        participants: u32,
        /// Whole minutes the server has been empty; only set when `participants == 0`.
        idle_minutes: Option<i64>,
    },
    ConnectionError,
}
