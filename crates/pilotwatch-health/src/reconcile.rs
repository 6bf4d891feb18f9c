//! Reconciliation of sidecar statuses into a derived topology.
//!
//! Everything here is a pure function of the discovered tree and the
//! statuses attached to its instances. Two passes run per deployment group:
//!
//! 1. per instance: health, jobs and watches from its [`RawStatus`];
//! 2. per service: connections to sibling services and branches, which
//!    need every instance of the group resolved first.
//!
//! Sidecar job names do not always equal the service name, so two naming
//! policies apply:
//!
//! - [`matches_service_name`]: a job whose name contains the service name,
//!   ignoring case, stands in for the service when no job matches exactly.
//!   Service names that are substrings of unrelated job names will match
//!   too.
//! - [`is_deviant_job`]: a job named `<service>-<suffix>` marks the
//!   instance as running a variant of the service (a branch).

use serde_json::json;
use sha2::{Digest, Sha512};

use pilotwatch_state::{Branch, DeploymentGroup, Health, Instance, ResourceId, Service};

/// Resolve both passes for every deployment group.
pub fn resolve_deployment_groups(groups: Vec<DeploymentGroup>) -> Vec<DeploymentGroup> {
    groups.into_iter().map(resolve_deployment_group).collect()
}

pub fn resolve_deployment_group(group: DeploymentGroup) -> DeploymentGroup {
    let services: Vec<Service> = group
        .services
        .into_iter()
        .map(|service| {
            let instances = service
                .instances
                .iter()
                .map(|instance| resolve_instance(&service.name, instance))
                .collect();
            Service {
                instances,
                ..service
            }
        })
        .collect();

    let resolved = services
        .iter()
        .map(|service| Service {
            branches: resolve_service_branches(service),
            connections: resolve_service_connections(&services, service),
            ..service.clone()
        })
        .collect();

    DeploymentGroup {
        services: resolved,
        ..group
    }
}

/// Derive health, jobs and watches; the raw status is consumed.
pub fn resolve_instance(service_name: &str, instance: &Instance) -> Instance {
    let (jobs, watches) = match &instance.status {
        Some(status) => (status.job_names(), status.watches.clone()),
        None => (Vec::new(), Vec::new()),
    };

    Instance {
        healthy: resolve_instance_health(service_name, instance),
        jobs,
        watches,
        status: None,
        ..instance.clone()
    }
}

/// Health of an instance of the service named `service_name`.
pub fn resolve_instance_health(service_name: &str, instance: &Instance) -> Health {
    let Some(status) = &instance.status else {
        return Health::Unavailable;
    };

    if let Some(job) = status.services.iter().find(|job| job.name == service_name) {
        return Health::reported(&job.status);
    }

    status
        .services
        .iter()
        .find(|job| matches_service_name(service_name, &job.name))
        .map(|job| Health::reported(&job.status))
        .unwrap_or(Health::Unknown)
}

/// Whether `job_name` contains `service_name`, ignoring case.
pub fn matches_service_name(service_name: &str, job_name: &str) -> bool {
    job_name
        .to_lowercase()
        .contains(&service_name.to_lowercase())
}

/// Whether `job_name` is a `<service_name>-<suffix>` variant.
pub fn is_deviant_job(service_name: &str, job_name: &str) -> bool {
    job_name
        .strip_prefix(service_name)
        .is_some_and(|rest| rest.starts_with('-'))
}

/// Ids of sibling services providing a job this service's instances watch.
///
/// Watched jobs are taken in first-seen order; for each, the first other
/// service reporting that job wins. Never contains `service.id`.
pub fn resolve_service_connections(services: &[Service], service: &Service) -> Vec<ResourceId> {
    let mut watched: Vec<&str> = Vec::new();
    for job in service.instances.iter().flat_map(|i| i.watches.iter()) {
        if !watched.contains(&job.as_str()) {
            watched.push(job);
        }
    }

    let mut connections: Vec<ResourceId> = Vec::new();
    for job in watched {
        let provider = services
            .iter()
            .filter(|other| other.id != service.id)
            .find(|other| other.jobs().any(|j| j == job));

        if let Some(provider) = provider {
            if !connections.contains(&provider.id) {
                connections.push(provider.id.clone());
            }
        }
    }
    connections
}

/// Group a service's instances by the job variant they run.
///
/// Services with at most one instance, or without any deviant job, have no
/// branches. Otherwise an instance reporting a deviant job belongs to the
/// branch named after its first one; an instance reporting only the plain
/// service job belongs to the default branch, which is always last.
/// Instances reporting neither are left out.
pub fn resolve_service_branches(service: &Service) -> Vec<Branch> {
    if service.instances.len() <= 1 {
        return Vec::new();
    }
    if !service.jobs().any(|job| is_deviant_job(&service.name, job)) {
        return Vec::new();
    }

    let mut deviants: Vec<(&str, Vec<ResourceId>)> = Vec::new();
    let mut default_members = Vec::new();

    for instance in &service.instances {
        let deviant = instance
            .jobs
            .iter()
            .find(|job| is_deviant_job(&service.name, job));

        match deviant {
            Some(job) => match deviants.iter_mut().find(|(name, _)| *name == job.as_str()) {
                Some((_, members)) => members.push(instance.id.clone()),
                None => deviants.push((job.as_str(), vec![instance.id.clone()])),
            },
            None if instance.jobs.iter().any(|job| *job == service.name) => {
                default_members.push(instance.id.clone());
            }
            None => {}
        }
    }

    let mut branches: Vec<Branch> = deviants
        .into_iter()
        .map(|(name, members)| branch(name, &param_case(name), members))
        .collect();
    branches.push(branch(&service.name, &service.slug, default_members));
    branches
}

fn branch(name: &str, slug: &str, instances: Vec<ResourceId>) -> Branch {
    Branch {
        id: branch_id(name, slug, &instances),
        name: name.to_string(),
        slug: slug.to_string(),
        instances,
    }
}

/// Hex SHA-512 of the branch definition.
///
/// The JSON encoding has a fixed key order, so equal definitions always
/// hash to the same id.
pub fn branch_id(name: &str, slug: &str, instances: &[ResourceId]) -> String {
    let definition = json!({
        "name": name,
        "slug": slug,
        "instances": instances,
    });
    hex::encode(Sha512::digest(definition.to_string().as_bytes()))
}

/// Lower-case, dash-separated form of `input` (`canaryV2_eu` → `canary-v2-eu`).
///
/// Word boundaries fall on separators, on lower-to-upper transitions, and
/// before the last capital of an acronym (`XMLHttp` → `xml-http`).
pub fn param_case(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut prev: Option<char> = None;
    let mut separate = false;

    while let Some(c) = chars.next() {
        if !c.is_alphanumeric() {
            separate = true;
            prev = None;
            continue;
        }
        let camel_boundary =
            prev.is_some_and(|p| (p.is_lowercase() || p.is_numeric()) && c.is_uppercase());
        let acronym_boundary = prev.is_some_and(|p| p.is_uppercase())
            && c.is_uppercase()
            && chars.peek().is_some_and(|n| n.is_lowercase());
        if (separate || camel_boundary || acronym_boundary) && !out.is_empty() {
            out.push('-');
        }
        separate = false;
        out.extend(c.to_lowercase());
        prev = Some(c);
    }
    out
}
