//! pilotwatch-health: deployment-group health watcher.
//!
//! Periodically discovers the deployment-group topology from the control
//! plane, asks every instance's sidecar for its status, reconciles the
//! answers into health, job membership, connections and branches, and
//! persists the result.
//!
//! # Architecture
//!
//! ```text
//! Watcher (self-rescheduling poll loop)
//!   └── cycle
//!       ├── discover()            DiscoverySource: groups → services → instances
//!       ├── StatusFetcher         MachineDirectory + StatusClient, first IP to answer wins
//!       ├── reconcile             pure: health/jobs/watches, then connections/branches
//!       └── GroupWriter           PersistenceSink, instances before services, locked per group
//! ```
//!
//! # Failure model
//!
//! A failure anywhere below the cycle only removes (or leaves unannotated)
//! the affected group, service or instance. Every failure is logged and
//! sent on the error channel of [`WatchEvents`]; the poll loop always
//! reschedules itself.

pub mod checker;
pub mod discovery;
pub mod error;
pub mod events;
pub mod fetch;
pub mod persist;
pub mod reconcile;
pub mod watcher;

pub use checker::{HttpStatusClient, StatusClient};
pub use discovery::{DiscoverySource, Machine, MachineDirectory};
pub use error::{WatchError, WatchResult};
pub use events::{ErrorReporter, WatchEvents};
pub use persist::{GroupLocks, PersistenceSink};
pub use watcher::{Collaborators, Watcher, WatcherConfig};
