use std::time::Duration;

use crate::support::format_error_chain;

/// Failures a lifecycle sequence can end with.
///
/// Adapters report `anyhow::Error`; the controller folds them into
/// `RemoteCallFailed` with the flattened cause chain.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    #[error("{call} failed: {message}")]
    RemoteCallFailed { call: &'static str, message: String },

    #[error("game server did not report ready within {}s", .0.as_secs())]
    StartupTimeout(Duration),

    #[error("inconsistent state: {0}")]
    InconsistentState(String),
}

impl LifecycleError {
    pub fn remote(call: &'static str, err: &anyhow::Error) -> Self {
        LifecycleError::RemoteCallFailed {
            call,
            message: format_error_chain(err),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            LifecycleError::RemoteCallFailed { .. } => "remote_call_failed",
            LifecycleError::StartupTimeout(_) => "startup_timeout",
            LifecycleError::InconsistentState(_) => "inconsistent_state",
        }
    }
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;
