//! Control-plane collaborators and the discovery pass.
//!
//! The control plane exposes a hierarchy: deployment groups own services,
//! services own instances. [`discover`] expands that hierarchy into a tree of
//! [`DeploymentGroup`]s, fanning out in parallel at each level. A failure
//! below the root only removes the affected group or service.

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::debug;

use pilotwatch_state::{DeploymentGroup, Instance, Service};

use crate::error::{WatchError, WatchResult};
use crate::events::ErrorReporter;

/// Source of the deployment-group hierarchy.
///
/// Implementations return identity fields only. Derived fields on the
/// returned values are ignored.
#[async_trait]
pub trait DiscoverySource: Send + Sync {
    /// All deployment groups, without their services.
    async fn deployment_groups(&self) -> WatchResult<Vec<DeploymentGroup>>;

    /// Services of one deployment group, without their instances.
    async fn services(&self, group_id: &str) -> WatchResult<Vec<Service>>;

    /// Instances of one service.
    async fn instances(&self, service_id: &str) -> WatchResult<Vec<Instance>>;
}

/// A machine as known to the control plane.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    #[serde(default)]
    pub ips: Vec<String>,
}

/// Resolves machine ids to network addresses.
#[async_trait]
pub trait MachineDirectory: Send + Sync {
    async fn machine(&self, machine_id: &str) -> WatchResult<Machine>;
}

/// Expand the control-plane hierarchy into a deployment-group tree.
///
/// Fails only when the group listing itself fails.
pub async fn discover(
    source: &dyn DiscoverySource,
    reporter: &ErrorReporter,
) -> WatchResult<Vec<DeploymentGroup>> {
    let groups = source.deployment_groups().await?;
    debug!(groups = groups.len(), "deployment groups listed");

    let expanded = join_all(
        groups
            .into_iter()
            .map(|group| expand_group(source, reporter, group)),
    )
    .await;

    Ok(expanded.into_iter().flatten().collect())
}

async fn expand_group(
    source: &dyn DiscoverySource,
    reporter: &ErrorReporter,
    group: DeploymentGroup,
) -> Option<DeploymentGroup> {
    let services = match source.services(&group.id).await {
        Ok(services) => services,
        Err(e) => {
            reporter.report(WatchError::discovery(
                format!("deployment group {}", group.id),
                e,
            ));
            return None;
        }
    };

    let services = join_all(
        services
            .into_iter()
            .map(|service| expand_service(source, reporter, service)),
    )
    .await;

    Some(DeploymentGroup {
        services: services.into_iter().flatten().collect(),
        ..group
    })
}

async fn expand_service(
    source: &dyn DiscoverySource,
    reporter: &ErrorReporter,
    service: Service,
) -> Option<Service> {
    match source.instances(&service.id).await {
        Ok(instances) => Some(Service {
            instances,
            ..service
        }),
        Err(e) => {
            reporter.report(WatchError::discovery(format!("service {}", service.id), e));
            None
        }
    }
}
