//! Event channels between the watcher and its supervisor.

use tokio::sync::mpsc;
use tracing::{debug, warn};

use pilotwatch_state::DeploymentGroup;

use crate::error::WatchError;

/// Receiving ends handed to whoever supervises a [`Watcher`](crate::Watcher).
pub struct WatchEvents {
    /// Full reconciled topology, one message per completed cycle.
    pub results: mpsc::Receiver<Vec<DeploymentGroup>>,
    /// Every recoverable failure, in the order it was observed.
    pub errors: mpsc::Receiver<WatchError>,
}

/// Sending side of the error channel.
///
/// Reporting never blocks: if the supervisor falls behind, the error is
/// still logged but dropped from the channel.
#[derive(Clone)]
pub struct ErrorReporter {
    tx: Option<mpsc::Sender<WatchError>>,
}

impl ErrorReporter {
    pub(crate) fn new(tx: mpsc::Sender<WatchError>) -> Self {
        Self { tx: Some(tx) }
    }

    /// A reporter that only logs (for tests and one-off checks).
    pub fn log_only() -> Self {
        Self { tx: None }
    }

    pub fn report(&self, err: WatchError) {
        warn!(error = %err, "watch error");
        if let Some(tx) = &self.tx {
            if let Err(e) = tx.try_send(err) {
                debug!(error = %e, "error channel full or closed, dropping event");
            }
        }
    }
}

pub(crate) fn channels(
    capacity: usize,
) -> (
    mpsc::Sender<Vec<DeploymentGroup>>,
    ErrorReporter,
    WatchEvents,
) {
    let capacity = capacity.max(1);
    let (results_tx, results) = mpsc::channel(capacity);
    let (errors_tx, errors) = mpsc::channel(capacity);
    (
        results_tx,
        ErrorReporter::new(errors_tx),
        WatchEvents { results, errors },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reporter_delivers_errors() {
        let (_results, reporter, mut events) = channels(4);
        reporter.report(WatchError::Connection("refused".to_string()));

        let err = events.errors.recv().await.unwrap();
        assert!(matches!(err, WatchError::Connection(_)));
    }

    #[tokio::test]
    async fn reporter_drops_when_full() {
        let (_results, reporter, mut events) = channels(1);
        reporter.report(WatchError::Connection("first".to_string()));
        reporter.report(WatchError::Connection("second".to_string()));

        let err = events.errors.recv().await.unwrap();
        assert_eq!(err.to_string(), "control plane connection failed: first");
        assert!(events.errors.try_recv().is_err());
    }
}
