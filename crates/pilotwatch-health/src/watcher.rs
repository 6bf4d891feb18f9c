//! Watcher: background poll loop driving discovery, status fetch,
//! reconciliation and persistence.
//!
//! The loop is self-rescheduling: the next cycle starts a fixed delay after
//! the previous one finished, so cycles never overlap and a slow cycle
//! pushes the next one back instead of piling up.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use pilotwatch_state::DeploymentGroup;

use crate::checker::StatusClient;
use crate::discovery::{discover, DiscoverySource, MachineDirectory};
use crate::events::{channels, ErrorReporter, WatchEvents};
use crate::fetch::StatusFetcher;
use crate::persist::{GroupLocks, GroupWriter, PersistenceSink};
use crate::reconcile::resolve_deployment_groups;

/// Default delay between the end of one cycle and the start of the next.
pub const DEFAULT_FREQUENCY: Duration = Duration::from_millis(1000);

/// Watcher settings.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Delay before the first cycle and between consecutive cycles.
    pub frequency: Duration,
    /// Capacity of the result and error channels.
    pub event_capacity: usize,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            frequency: DEFAULT_FREQUENCY,
            event_capacity: 16,
        }
    }
}

/// External systems the watcher talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub discovery: Arc<dyn DiscoverySource>,
    pub machines: Arc<dyn MachineDirectory>,
    pub status: Arc<dyn StatusClient>,
    pub sink: Arc<dyn PersistenceSink>,
}

/// Running poll loop.
struct PollSlot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// One full discovery → fetch → reconcile → persist pass.
#[derive(Clone)]
struct Pipeline {
    discovery: Arc<dyn DiscoverySource>,
    fetcher: StatusFetcher,
    writer: GroupWriter,
    reporter: ErrorReporter,
    results: mpsc::Sender<Vec<DeploymentGroup>>,
}

/// Periodically reconciles the deployment-group topology.
pub struct Watcher {
    pipeline: Pipeline,
    frequency: Duration,
    poll: Mutex<Option<PollSlot>>,
}

impl Watcher {
    /// Create a watcher and the event channels its supervisor reads from.
    pub fn new(config: WatcherConfig, collaborators: Collaborators) -> (Self, WatchEvents) {
        let (results, reporter, events) = channels(config.event_capacity);
        let pipeline = Pipeline {
            discovery: collaborators.discovery,
            fetcher: StatusFetcher::new(
                collaborators.machines,
                collaborators.status,
                reporter.clone(),
            ),
            writer: GroupWriter::new(collaborators.sink, GroupLocks::new(), reporter.clone()),
            reporter,
            results,
        };

        let watcher = Self {
            pipeline,
            frequency: config.frequency,
            poll: Mutex::new(None),
        };
        (watcher, events)
    }

    /// Schedule the poll loop. Returns `false` if one is already scheduled.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> bool {
        let mut poll = self.poll.lock().unwrap_or_else(|e| e.into_inner());
        if poll.as_ref().is_some_and(|slot| !slot.handle.is_finished()) {
            debug!("watcher already polling");
            return false;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_poll_loop(
            self.pipeline.clone(),
            self.frequency,
            shutdown_rx,
        ));
        *poll = Some(PollSlot {
            handle,
            shutdown_tx,
        });

        info!(frequency_ms = self.frequency.as_millis() as u64, "watcher started");
        true
    }

    /// Stop the poll loop, letting an in-flight cycle finish first.
    pub async fn stop(&self) {
        let slot = self.poll.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(slot) = slot {
            let _ = slot.shutdown_tx.send(true);
            let _ = slot.handle.await;
            info!("watcher stopped");
        }
    }

    /// Whether a poll loop is scheduled.
    pub fn is_running(&self) -> bool {
        self.poll
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|slot| !slot.handle.is_finished())
    }

    /// Run a single cycle now, outside the poll loop.
    ///
    /// Returns `None` when discovery failed outright.
    pub async fn check(&self) -> Option<Vec<DeploymentGroup>> {
        self.pipeline.check().await
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        let slot = self.poll.get_mut().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(slot) = slot {
            slot.handle.abort();
        }
    }
}

impl Pipeline {
    async fn check(&self) -> Option<Vec<DeploymentGroup>> {
        let groups = match discover(self.discovery.as_ref(), &self.reporter).await {
            Ok(groups) => groups,
            Err(e) => {
                self.reporter.report(e);
                return None;
            }
        };

        let groups = self.fetcher.fetch_groups(groups).await;
        let groups = resolve_deployment_groups(groups);
        self.writer.save_groups(&groups).await;

        debug!(
            groups = groups.len(),
            services = groups.iter().map(|g| g.services.len()).sum::<usize>(),
            instances = groups.iter().map(|g| g.instance_count()).sum::<usize>(),
            "watch cycle complete"
        );

        if let Err(e) = self.results.try_send(groups.clone()) {
            debug!(error = %e, "result channel full or closed, dropping cycle result");
        }
        Some(groups)
    }
}

async fn run_poll_loop(
    pipeline: Pipeline,
    frequency: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(frequency) => {
                pipeline.check().await;
            }
            _ = shutdown.changed() => {
                debug!("poll loop shutting down");
                break;
            }
        }
    }
}
