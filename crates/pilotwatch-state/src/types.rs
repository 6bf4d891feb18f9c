//! Topology types for pilotwatch.
//!
//! A [`DeploymentGroup`] tree is rebuilt from the control plane every cycle.
//! Discovery fills in identity fields only; the status fetcher attaches a
//! transient [`RawStatus`] to each instance; reconciliation derives the
//! remaining fields. The `*Record` types are what gets persisted.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

/// Identifier of a deployment group, service or instance in the control plane.
pub type ResourceId = String;

/// Job name every sidecar reports about itself.
pub const SIDECAR_JOB: &str = "containerpilot";

// ── Topology ──────────────────────────────────────────────────────

/// A set of services deployed together.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DeploymentGroup {
    pub id: ResourceId,
    pub name: String,
    pub services: Vec<Service>,
}

/// A named, scalable unit made of one or more instances.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Service {
    pub id: ResourceId,
    pub name: String,
    pub slug: String,
    pub instances: Vec<Instance>,
    /// Instance groupings by job variant. Derived.
    #[serde(default)]
    pub branches: Vec<Branch>,
    /// Ids of sibling services this one watches. Derived.
    #[serde(default)]
    pub connections: Vec<ResourceId>,
}

/// One running unit of a service.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Instance {
    pub id: ResourceId,
    pub name: String,
    /// Key for the machine directory lookup.
    pub machine_id: String,
    /// Sidecar snapshot for the current cycle, if one was fetched.
    #[serde(skip)]
    pub status: Option<RawStatus>,
    #[serde(default)]
    pub healthy: Health,
    #[serde(default)]
    pub jobs: Vec<String>,
    #[serde(default)]
    pub watches: Vec<String>,
}

/// A subset of a service's instances running a distinguishable job variant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Branch {
    /// Content hash of `name`, `slug` and `instances`.
    pub id: String,
    pub name: String,
    pub slug: String,
    pub instances: Vec<ResourceId>,
}

impl DeploymentGroup {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            services: Vec::new(),
        }
    }

    /// Total number of instances across all services.
    pub fn instance_count(&self) -> usize {
        self.services.iter().map(|s| s.instances.len()).sum()
    }
}

impl Service {
    pub fn new(id: impl Into<String>, name: impl Into<String>, slug: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            slug: slug.into(),
            ..Default::default()
        }
    }

    /// Every job name reported by any instance of this service.
    pub fn jobs(&self) -> impl Iterator<Item = &str> {
        self.instances
            .iter()
            .flat_map(|i| i.jobs.iter().map(String::as_str))
    }
}

impl Instance {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        machine_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            machine_id: machine_id.into(),
            ..Default::default()
        }
    }

    /// Persisted view of this instance.
    pub fn record(&self) -> InstanceRecord {
        InstanceRecord {
            id: self.id.clone(),
            healthy: self.healthy.clone(),
            watches: self.watches.clone(),
            jobs: self.jobs.clone(),
        }
    }
}

// ── Health ────────────────────────────────────────────────────────

/// Health of an instance as seen through its sidecar.
///
/// Serialized as a plain upper-case string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum Health {
    /// No sidecar status could be fetched.
    #[default]
    Unavailable,
    /// A status was fetched but no job matched the service.
    Unknown,
    /// Upper-cased status reported by the sidecar (e.g. `HEALTHY`).
    Reported(String),
}

impl Health {
    pub fn reported(status: &str) -> Self {
        Self::from(status.to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        match self {
            Health::Unavailable => "UNAVAILABLE",
            Health::Unknown => "UNKNOWN",
            Health::Reported(s) => s,
        }
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for Health {
    fn from(s: String) -> Self {
        match s.as_str() {
            "UNAVAILABLE" => Health::Unavailable,
            "UNKNOWN" => Health::Unknown,
            _ => Health::Reported(s),
        }
    }
}

impl From<Health> for String {
    fn from(h: Health) -> Self {
        match h {
            Health::Reported(s) => s,
            other => other.as_str().to_string(),
        }
    }
}

// ── Sidecar status ────────────────────────────────────────────────

/// Health document served by an instance's sidecar on `/status`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawStatus {
    #[serde(rename = "Services", default, deserialize_with = "one_or_many")]
    pub services: Vec<JobStatus>,
    #[serde(rename = "Watches", default, deserialize_with = "null_as_empty")]
    pub watches: Vec<String>,
}

/// Status of one job supervised by the sidecar.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Status", default)]
    pub status: String,
}

impl RawStatus {
    /// Drop the sidecar's report about itself.
    pub fn without_sidecar_job(mut self) -> Self {
        self.services.retain(|job| job.name != SIDECAR_JOB);
        self
    }

    /// Names of all reported jobs, in report order.
    pub fn job_names(&self) -> Vec<String> {
        self.services.iter().map(|job| job.name.clone()).collect()
    }
}

impl JobStatus {
    pub fn new(name: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: status.into(),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

fn one_or_many<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(match Option::<OneOrMany<T>>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::Many(items)) => items,
        Some(OneOrMany::One(item)) => vec![item],
    })
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

// ── Persisted records ─────────────────────────────────────────────

/// Reconciled instance state written to the persistence sink.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceRecord {
    pub id: ResourceId,
    pub healthy: Health,
    pub watches: Vec<String>,
    pub jobs: Vec<String>,
}

/// Reconciled service state written after all of its instances.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceRecord {
    pub id: ResourceId,
    pub connections: Vec<ResourceId>,
    pub branches: Vec<Branch>,
}

impl Service {
    /// Persisted view of this service.
    pub fn record(&self) -> ServiceRecord {
        ServiceRecord {
            id: self.id.clone(),
            connections: self.connections.clone(),
            branches: self.branches.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_serializes_as_plain_string() {
        assert_eq!(
            serde_json::to_string(&Health::Unavailable).unwrap(),
            "\"UNAVAILABLE\""
        );
        assert_eq!(
            serde_json::to_string(&Health::reported("running")).unwrap(),
            "\"RUNNING\""
        );

        let h: Health = serde_json::from_str("\"UNKNOWN\"").unwrap();
        assert_eq!(h, Health::Unknown);
        let h: Health = serde_json::from_str("\"HEALTHY\"").unwrap();
        assert_eq!(h, Health::Reported("HEALTHY".to_string()));
    }

    #[test]
    fn raw_status_decodes_sidecar_document() {
        let body = r#"{
            "Services": [
                {"Name": "containerpilot", "Address": "10.0.0.4", "Port": 9090, "Status": "healthy"},
                {"Name": "web", "Address": "10.0.0.4", "Port": 80, "Status": "healthy"}
            ],
            "Watches": ["db"]
        }"#;
        let status: RawStatus = serde_json::from_str(body).unwrap();
        assert_eq!(status.services.len(), 2);
        assert_eq!(status.watches, vec!["db"]);

        let status = status.without_sidecar_job();
        assert_eq!(status.job_names(), vec!["web"]);
    }

    #[test]
    fn raw_status_tolerates_missing_and_single_entries() {
        let status: RawStatus = serde_json::from_str("{}").unwrap();
        assert!(status.services.is_empty());
        assert!(status.watches.is_empty());

        let status: RawStatus =
            serde_json::from_str(r#"{"Services": null, "Watches": null}"#).unwrap();
        assert!(status.services.is_empty());
        assert!(status.watches.is_empty());

        let status: RawStatus =
            serde_json::from_str(r#"{"Services": {"Name": "web", "Status": "unhealthy"}}"#)
                .unwrap();
        assert_eq!(status.services, vec![JobStatus::new("web", "unhealthy")]);
    }

    #[test]
    fn instance_status_is_not_serialized() {
        let mut inst = Instance::new("i-1", "web-1", "m-1");
        inst.status = Some(RawStatus::default());
        let json = serde_json::to_value(&inst).unwrap();
        assert!(json.get("status").is_none());
        assert_eq!(json["healthy"], "UNAVAILABLE");
    }
}
