//! pilotwatch-state: topology types and embedded state store for pilotwatch.
//!
//! The types in [`types`] describe the deployment-group tree the watcher
//! rebuilds every cycle (groups → services → instances) together with the
//! fields derived by reconciliation (health, jobs, watches, branches,
//! connections).
//!
//! # Architecture
//!
//! The [`StateStore`] is backed by [redb](https://docs.rs/redb). Reconciled
//! instance and service records are JSON-serialized into redb's `&[u8]`
//! value columns, keyed by their control-plane id. The store is `Clone` +
//! `Send` + `Sync` (backed by `Arc<Database>`) and can be shared across
//! async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
