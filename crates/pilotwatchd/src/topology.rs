//! File-backed topology.
//!
//! A TOML file describing deployment groups, their services and instances,
//! plus a `[machines]` table mapping machine ids to addresses. The file is
//! re-read on every call, so edits show up on the next cycle.
//!
//! ```toml
//! [machines]
//! m-web-1 = ["10.0.0.4"]
//!
//! [[deployment_groups]]
//! id = "dg-1"
//! name = "shop"
//!
//! [[deployment_groups.services]]
//! id = "svc-web"
//! name = "web"
//!
//! [[deployment_groups.services.instances]]
//! id = "i-web-1"
//! machine_id = "m-web-1"
//! ```

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;

use pilotwatch_health::reconcile::param_case;
use pilotwatch_health::{DiscoverySource, Machine, MachineDirectory, WatchError, WatchResult};
use pilotwatch_state::{DeploymentGroup, Instance, Service};

#[derive(Debug, Default, Deserialize)]
struct TopologyFile {
    #[serde(default)]
    deployment_groups: Vec<GroupEntry>,
    #[serde(default)]
    machines: HashMap<String, Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct GroupEntry {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    services: Vec<ServiceEntry>,
}

#[derive(Debug, Deserialize)]
struct ServiceEntry {
    id: String,
    name: String,
    slug: Option<String>,
    #[serde(default)]
    instances: Vec<InstanceEntry>,
}

#[derive(Debug, Deserialize)]
struct InstanceEntry {
    id: String,
    #[serde(default)]
    name: String,
    machine_id: String,
}

/// [`DiscoverySource`] and [`MachineDirectory`] over a topology file.
#[derive(Debug, Clone)]
pub struct FileTopology {
    path: PathBuf,
}

impl FileTopology {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn load(&self) -> WatchResult<TopologyFile> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| WatchError::Connection(format!("read {}: {e}", self.path.display())))?;
        toml::from_str(&content).map_err(|e| WatchError::Discovery {
            scope: self.path.display().to_string(),
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl DiscoverySource for FileTopology {
    async fn deployment_groups(&self) -> WatchResult<Vec<DeploymentGroup>> {
        let file = self.load().await?;
        Ok(file
            .deployment_groups
            .into_iter()
            .map(|g| DeploymentGroup::new(g.id, g.name))
            .collect())
    }

    async fn services(&self, group_id: &str) -> WatchResult<Vec<Service>> {
        let file = self.load().await?;
        let group = file
            .deployment_groups
            .into_iter()
            .find(|g| g.id == group_id)
            .ok_or_else(|| WatchError::Discovery {
                scope: format!("deployment group {group_id}"),
                reason: "no longer in topology".to_string(),
            })?;

        Ok(group
            .services
            .into_iter()
            .map(|s| {
                let slug = s.slug.unwrap_or_else(|| param_case(&s.name));
                Service::new(s.id, s.name, slug)
            })
            .collect())
    }

    async fn instances(&self, service_id: &str) -> WatchResult<Vec<Instance>> {
        let file = self.load().await?;
        let service = file
            .deployment_groups
            .into_iter()
            .flat_map(|g| g.services)
            .find(|s| s.id == service_id)
            .ok_or_else(|| WatchError::Discovery {
                scope: format!("service {service_id}"),
                reason: "no longer in topology".to_string(),
            })?;

        Ok(service
            .instances
            .into_iter()
            .map(|i| Instance::new(i.id, i.name, i.machine_id))
            .collect())
    }
}

#[async_trait]
impl MachineDirectory for FileTopology {
    async fn machine(&self, machine_id: &str) -> WatchResult<Machine> {
        let mut file = self.load().await?;
        let ips = file
            .machines
            .remove(machine_id)
            .ok_or_else(|| WatchError::MachineLookup {
                machine_id: machine_id.to_string(),
                reason: "unknown machine".to_string(),
            })?;
        Ok(Machine { ips })
    }
}
