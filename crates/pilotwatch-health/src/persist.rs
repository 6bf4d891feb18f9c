//! Persistence of reconciled deployment groups.
//!
//! Within a service, every instance record is written before the service
//! record, so a stored service never refers to instance state that is not
//! yet durable. Writes for one deployment group are serialized through a
//! per-group async mutex; different groups write concurrently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

use pilotwatch_state::{DeploymentGroup, InstanceRecord, Service, ServiceRecord, StateStore};

use crate::error::{WatchError, WatchResult};
use crate::events::ErrorReporter;

/// Destination of reconciled records.
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    async fn update_instance(&self, record: InstanceRecord) -> WatchResult<()>;

    async fn update_service(&self, record: ServiceRecord) -> WatchResult<()>;
}

#[async_trait]
impl PersistenceSink for StateStore {
    async fn update_instance(&self, record: InstanceRecord) -> WatchResult<()> {
        self.put_instance(&record).map_err(|e| WatchError::Persist {
            kind: "instance",
            id: record.id.clone(),
            reason: e.to_string(),
        })
    }

    async fn update_service(&self, record: ServiceRecord) -> WatchResult<()> {
        self.put_service(&record).map_err(|e| WatchError::Persist {
            kind: "service",
            id: record.id.clone(),
            reason: e.to_string(),
        })
    }
}

/// Async mutexes keyed by deployment group id.
#[derive(Default, Clone)]
pub struct GroupLocks {
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl GroupLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive write access to `group_id`.
    pub async fn lock(&self, group_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(group_id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Number of group ids that have been locked at least once.
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Writes reconciled groups to a [`PersistenceSink`].
#[derive(Clone)]
pub struct GroupWriter {
    sink: Arc<dyn PersistenceSink>,
    locks: GroupLocks,
    reporter: ErrorReporter,
}

impl GroupWriter {
    pub fn new(sink: Arc<dyn PersistenceSink>, locks: GroupLocks, reporter: ErrorReporter) -> Self {
        Self {
            sink,
            locks,
            reporter,
        }
    }

    /// Save every group concurrently, one writer per group id at a time.
    pub async fn save_groups(&self, groups: &[DeploymentGroup]) {
        join_all(groups.iter().map(|group| self.save_group(group))).await;
    }

    pub async fn save_group(&self, group: &DeploymentGroup) {
        let _guard = self.locks.lock(&group.id).await;
        join_all(group.services.iter().map(|service| self.save_service(service))).await;
        debug!(group = %group.id, services = group.services.len(), "deployment group saved");
    }

    /// Save a service's instances, then the service itself.
    ///
    /// A service without an id is not saved at all. The service record is
    /// skipped if any instance write failed.
    async fn save_service(&self, service: &Service) {
        if service.id.is_empty() {
            return;
        }

        let results = join_all(
            service
                .instances
                .iter()
                .filter(|instance| !instance.id.is_empty())
                .map(|instance| self.sink.update_instance(instance.record())),
        )
        .await;

        let mut failed = false;
        for err in results.into_iter().filter_map(Result::err) {
            self.reporter.report(err);
            failed = true;
        }
        if failed {
            return;
        }

        if let Err(e) = self.sink.update_service(service.record()).await {
            self.reporter.report(e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use pilotwatch_state::{Health, Instance};

    #[derive(Debug, Clone, PartialEq)]
    enum Write {
        Instance(String),
        Service(String),
    }

    #[derive(Default)]
    struct RecordingSink {
        writes: Mutex<Vec<Write>>,
        fail_instance: Option<&'static str>,
    }

    impl RecordingSink {
        fn writes(&self) -> Vec<Write> {
            self.writes.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PersistenceSink for RecordingSink {
        async fn update_instance(&self, record: InstanceRecord) -> WatchResult<()> {
            // Instance writes are slower than service writes.
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.fail_instance == Some(record.id.as_str()) {
                return Err(WatchError::Persist {
                    kind: "instance",
                    id: record.id,
                    reason: "disk full".to_string(),
                });
            }
            self.writes.lock().unwrap().push(Write::Instance(record.id));
            Ok(())
        }

        async fn update_service(&self, record: ServiceRecord) -> WatchResult<()> {
            self.writes.lock().unwrap().push(Write::Service(record.id));
            Ok(())
        }
    }

    fn group() -> DeploymentGroup {
        let mut web = Service::new("svc-web", "web", "web");
        web.instances = vec![
            Instance::new("i-1", "web-1", "m-1"),
            Instance::new("i-2", "web-2", "m-2"),
            Instance::new("", "web-3", "m-3"),
        ];
        let mut group = DeploymentGroup::new("dg-1", "shop");
        group.services = vec![web];
        group
    }

    #[tokio::test(start_paused = true)]
    async fn instances_saved_before_service_and_empty_ids_skipped() {
        let sink = Arc::new(RecordingSink::default());
        let writer = GroupWriter::new(sink.clone(), GroupLocks::new(), ErrorReporter::log_only());

        writer.save_group(&group()).await;

        let writes = sink.writes();
        assert_eq!(writes.len(), 3);
        assert_eq!(writes[2], Write::Service("svc-web".to_string()));
        assert!(writes[..2].contains(&Write::Instance("i-1".to_string())));
        assert!(writes[..2].contains(&Write::Instance("i-2".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_instance_write_skips_service() {
        let sink = Arc::new(RecordingSink {
            fail_instance: Some("i-2"),
            ..Default::default()
        });
        let writer = GroupWriter::new(sink.clone(), GroupLocks::new(), ErrorReporter::log_only());

        writer.save_group(&group()).await;

        assert_eq!(sink.writes(), vec![Write::Instance("i-1".to_string())]);
    }

    #[tokio::test(start_paused = true)]
    async fn same_group_writes_do_not_overlap() {
        let sink = Arc::new(RecordingSink::default());
        let writer = GroupWriter::new(sink.clone(), GroupLocks::new(), ErrorReporter::log_only());

        let g = group();
        tokio::join!(writer.save_group(&g), writer.save_group(&g));

        // Each save finishes its service write before the next one starts.
        let writes = sink.writes();
        assert_eq!(writes.len(), 6);
        assert_eq!(writes[2], Write::Service("svc-web".to_string()));
        assert_eq!(writes[5], Write::Service("svc-web".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn service_without_id_writes_nothing() {
        let sink = Arc::new(RecordingSink::default());
        let writer = GroupWriter::new(sink.clone(), GroupLocks::new(), ErrorReporter::log_only());

        let mut g = group();
        g.services[0].id = String::new();
        writer.save_group(&g).await;

        assert!(sink.writes().is_empty());
    }

    #[tokio::test]
    async fn group_locks_are_per_key() {
        let locks = GroupLocks::new();
        let a = locks.lock("dg-1").await;
        // A different key is not blocked.
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock("dg-2")).await;
        assert!(b.is_ok());
        // The same key is.
        let again = tokio::time::timeout(Duration::from_millis(50), locks.lock("dg-1")).await;
        assert!(again.is_err());
        drop(a);
        let _c = locks.lock("dg-1").await;
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn state_store_is_a_sink() {
        let store = StateStore::open_in_memory().unwrap();
        let writer = GroupWriter::new(
            Arc::new(store.clone()),
            GroupLocks::new(),
            ErrorReporter::log_only(),
        );

        let mut g = group();
        g.services[0].instances[0].healthy = Health::reported("healthy");
        writer.save_group(&g).await;

        let inst = store.get_instance("i-1").unwrap().unwrap();
        assert_eq!(inst.healthy, Health::reported("HEALTHY"));
        assert!(store.get_service("svc-web").unwrap().is_some());
        assert_eq!(store.list_instances().unwrap().len(), 2);
    }
}
