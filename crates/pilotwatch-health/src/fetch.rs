//! Status fan-out over a discovered topology.
//!
//! Walks every group, service and instance in parallel, resolves each
//! instance's machine to its addresses and races a status request against
//! every address. The first successful response is attached to the
//! instance; an instance whose status cannot be fetched stays in the tree
//! without one.

use std::sync::Arc;

use futures::future::{join_all, select_ok};
use tracing::debug;

use pilotwatch_state::{DeploymentGroup, Instance, RawStatus, Service};

use crate::checker::StatusClient;
use crate::discovery::MachineDirectory;
use crate::error::WatchError;
use crate::events::ErrorReporter;

/// Attaches sidecar statuses to a topology.
#[derive(Clone)]
pub struct StatusFetcher {
    machines: Arc<dyn MachineDirectory>,
    client: Arc<dyn StatusClient>,
    reporter: ErrorReporter,
}

impl StatusFetcher {
    pub fn new(
        machines: Arc<dyn MachineDirectory>,
        client: Arc<dyn StatusClient>,
        reporter: ErrorReporter,
    ) -> Self {
        Self {
            machines,
            client,
            reporter,
        }
    }

    /// Fetch statuses for every instance of every group.
    pub async fn fetch_groups(&self, groups: Vec<DeploymentGroup>) -> Vec<DeploymentGroup> {
        join_all(groups.into_iter().map(|group| self.fetch_group(group))).await
    }

    pub async fn fetch_group(&self, group: DeploymentGroup) -> DeploymentGroup {
        let services = join_all(
            group
                .services
                .into_iter()
                .map(|service| self.fetch_service(service)),
        )
        .await;

        DeploymentGroup { services, ..group }
    }

    pub async fn fetch_service(&self, service: Service) -> Service {
        let instances = join_all(
            service
                .instances
                .into_iter()
                .map(|instance| self.fetch_instance(instance)),
        )
        .await;

        Service {
            instances,
            ..service
        }
    }

    pub async fn fetch_instance(&self, instance: Instance) -> Instance {
        let status = self.instance_status(&instance.machine_id).await;
        Instance { status, ..instance }
    }

    async fn instance_status(&self, machine_id: &str) -> Option<RawStatus> {
        let machine = match self.machines.machine(machine_id).await {
            Ok(machine) => machine,
            Err(e) => {
                self.reporter.report(WatchError::MachineLookup {
                    machine_id: machine_id.to_string(),
                    reason: e.to_string(),
                });
                return None;
            }
        };

        if machine.ips.is_empty() {
            debug!(%machine_id, "machine has no addresses, skipping");
            return None;
        }

        // Requests still in flight after the first success are dropped.
        match select_ok(machine.ips.iter().map(|ip| self.client.fetch(ip))).await {
            Ok((status, _)) => Some(status.without_sidecar_job()),
            Err(e) => {
                self.reporter.report(e);
                None
            }
        }
    }
}
