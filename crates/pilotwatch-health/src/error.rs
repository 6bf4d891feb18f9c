//! Watcher error types.

use thiserror::Error;

/// Errors that can occur while running a watch cycle.
///
/// None of these stop the watcher. They are reported on the error channel
/// and the affected group, service or instance is left out of (or left
/// unannotated in) the cycle's result.
#[derive(Debug, Clone, Error)]
pub enum WatchError {
    #[error("control plane connection failed: {0}")]
    Connection(String),

    #[error("discovery failed for {scope}: {reason}")]
    Discovery { scope: String, reason: String },

    #[error("machine lookup failed for {machine_id}: {reason}")]
    MachineLookup { machine_id: String, reason: String },

    #[error("request to {uri} failed: {reason}")]
    Fetch { uri: String, reason: String },

    #[error("request to {uri} timed out")]
    Timeout { uri: String },

    #[error("request to {uri} returned {status}")]
    HttpStatus { uri: String, status: u16 },

    #[error("undecodable response from {uri}: {reason}")]
    Decode { uri: String, reason: String },

    #[error("failed to persist {kind} {id}: {reason}")]
    Persist {
        kind: &'static str,
        id: String,
        reason: String,
    },
}

pub type WatchResult<T> = Result<T, WatchError>;

impl WatchError {
    pub(crate) fn discovery(scope: impl Into<String>, err: WatchError) -> Self {
        WatchError::Discovery {
            scope: scope.into(),
            reason: err.to_string(),
        }
    }
}
