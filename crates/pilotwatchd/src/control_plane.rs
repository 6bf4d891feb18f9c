//! Control-plane client: discovery and machine lookups over JSON/HTTP.
//!
//! Endpoints, relative to `{url}/{account}`:
//!
//! ```text
//! GET deployment-groups                   [{id, name}]
//! GET deployment-groups/{id}/services     [{id, name, slug?}]
//! GET services/{id}/instances             [{id, name, machineId}]
//! GET machines/{id}                       {ips: [...]}
//! ```
//!
//! The account and key id travel as `x-account` and `x-key-id` headers.
//! Path segments are percent-encoded.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};

use pilotwatch_health::checker::http_get_json;
use pilotwatch_health::reconcile::param_case;
use pilotwatch_health::{DiscoverySource, Machine, MachineDirectory, WatchError, WatchResult};
use pilotwatch_state::{DeploymentGroup, Instance, Service};

use crate::config::ControlPlaneConfig;

#[derive(Debug, Deserialize)]
struct GroupDto {
    id: String,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct ServiceDto {
    id: String,
    name: String,
    slug: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InstanceDto {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(rename = "machineId", alias = "machine_id")]
    machine_id: String,
}

/// Validated control-plane location and credentials.
#[derive(Debug, Clone)]
struct Endpoint {
    base: String,
    account: String,
    key_id: String,
}

impl Endpoint {
    fn from_config(config: &ControlPlaneConfig) -> WatchResult<Self> {
        let url = config
            .url
            .as_deref()
            .filter(|url| !url.is_empty())
            .ok_or_else(|| WatchError::Connection("control plane url is not set".to_string()))?;
        if !url.starts_with("http://") {
            return Err(WatchError::Connection(format!(
                "unsupported control plane url {url}: only plain http is supported"
            )));
        }
        let account = config
            .account
            .as_deref()
            .filter(|account| !account.is_empty())
            .ok_or_else(|| WatchError::Connection("control plane account is not set".to_string()))?;

        Ok(Self {
            base: url.trim_end_matches('/').to_string(),
            account: account.to_string(),
            key_id: config.key_id.clone().unwrap_or_default(),
        })
    }

    fn uri(&self, segments: &[&str]) -> String {
        let mut uri = format!("{}/{}", self.base, urlencoding::encode(&self.account));
        for segment in segments {
            uri.push('/');
            uri.push_str(&urlencoding::encode(segment));
        }
        uri
    }
}

/// [`DiscoverySource`] and [`MachineDirectory`] backed by the control plane.
///
/// A client built from an unusable configuration still exists: every
/// request fails with the configuration's `Connection` error, so each watch
/// cycle reports it and the poll loop keeps going.
#[derive(Debug, Clone)]
pub struct ControlPlaneClient {
    endpoint: Result<Endpoint, WatchError>,
    timeout: Duration,
}

impl ControlPlaneClient {
    pub fn new(config: &ControlPlaneConfig, timeout: Duration) -> Self {
        let endpoint = Endpoint::from_config(config);
        match &endpoint {
            Ok(endpoint) => {
                debug!(url = %endpoint.base, account = %endpoint.account, "control plane client configured");
            }
            Err(e) => warn!(error = %e, "control plane client not configured"),
        }
        Self { endpoint, timeout }
    }

    async fn get<T: DeserializeOwned>(&self, segments: &[&str]) -> WatchResult<T> {
        let endpoint = self.endpoint.as_ref().map_err(Clone::clone)?;
        http_get_json(
            &endpoint.uri(segments),
            &[
                ("x-account", endpoint.account.as_str()),
                ("x-key-id", endpoint.key_id.as_str()),
            ],
            self.timeout,
        )
        .await
    }
}

#[async_trait]
impl DiscoverySource for ControlPlaneClient {
    async fn deployment_groups(&self) -> WatchResult<Vec<DeploymentGroup>> {
        let groups: Vec<GroupDto> = self.get(&["deployment-groups"]).await.map_err(|e| match e {
            WatchError::Fetch { .. } | WatchError::Timeout { .. } => {
                WatchError::Connection(e.to_string())
            }
            other => other,
        })?;
        Ok(groups
            .into_iter()
            .map(|g| DeploymentGroup::new(g.id, g.name))
            .collect())
    }

    async fn services(&self, group_id: &str) -> WatchResult<Vec<Service>> {
        let services: Vec<ServiceDto> = self
            .get(&["deployment-groups", group_id, "services"])
            .await?;
        Ok(services
            .into_iter()
            .map(|s| {
                let slug = s.slug.unwrap_or_else(|| param_case(&s.name));
                Service::new(s.id, s.name, slug)
            })
            .collect())
    }

    async fn instances(&self, service_id: &str) -> WatchResult<Vec<Instance>> {
        let instances: Vec<InstanceDto> = self
            .get(&["services", service_id, "instances"])
            .await?;
        Ok(instances
            .into_iter()
            .map(|i| Instance::new(i.id, i.name, i.machine_id))
            .collect())
    }
}

#[async_trait]
impl MachineDirectory for ControlPlaneClient {
    async fn machine(&self, machine_id: &str) -> WatchResult<Machine> {
        self.get(&["machines", machine_id]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use axum::extract::Path;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;

    use pilotwatch_health::{Collaborators, HttpStatusClient, Watcher, WatcherConfig};
    use pilotwatch_state::StateStore;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://127.0.0.1:{port}/")
    }

    fn control_plane() -> Router {
        Router::new()
            .route(
                "/ops/deployment-groups",
                get(|headers: HeaderMap| async move {
                    if headers.get("x-key-id").map(|v| v.as_bytes()) != Some(b"key-1".as_slice()) {
                        return Err(StatusCode::UNAUTHORIZED);
                    }
                    Ok(Json(json!([{"id": "dg-1", "name": "shop"}])))
                }),
            )
            .route(
                "/ops/deployment-groups/{id}/services",
                get(|Path(id): Path<String>| async move {
                    match id.as_str() {
                        "dg-1" => Ok(Json(json!([{"id": "svc-web", "name": "Web"}]))),
                        _ => Err(StatusCode::NOT_FOUND),
                    }
                }),
            )
            .route(
                "/ops/services/{id}/instances",
                get(|| async {
                    Json(json!([{"id": "i-1", "name": "web-1", "machineId": "m-1"}]))
                }),
            )
            .route(
                "/ops/machines/{id}",
                // Echo the decoded id back as the only address.
                get(|Path(id): Path<String>| async move { Json(json!({"ips": [id]})) }),
            )
    }

    fn config(url: &str) -> ControlPlaneConfig {
        ControlPlaneConfig {
            url: Some(url.to_string()),
            account: Some("ops".to_string()),
            key_id: Some("key-1".to_string()),
        }
    }

    #[tokio::test]
    async fn discovers_through_rest_api() {
        let url = serve(control_plane()).await;
        let client = ControlPlaneClient::new(&config(&url), Duration::from_secs(2));

        let groups = client.deployment_groups().await.unwrap();
        assert_eq!(groups, vec![DeploymentGroup::new("dg-1", "shop")]);

        let services = client.services("dg-1").await.unwrap();
        assert_eq!(services, vec![Service::new("svc-web", "Web", "web")]);
        assert!(matches!(
            client.services("dg-9").await,
            Err(WatchError::HttpStatus { status: 404, .. })
        ));

        let instances = client.instances("svc-web").await.unwrap();
        assert_eq!(instances, vec![Instance::new("i-1", "web-1", "m-1")]);

        let machine = client.machine("m-1").await.unwrap();
        assert_eq!(machine.ips, vec!["m-1"]);
    }

    #[tokio::test]
    async fn ids_are_percent_encoded() {
        let url = serve(control_plane()).await;
        let client = ControlPlaneClient::new(&config(&url), Duration::from_secs(2));

        let machine = client.machine("rack 1/m?2#a").await.unwrap();
        assert_eq!(machine.ips, vec!["rack 1/m?2#a"]);

        // A slash in a group id stays inside its segment.
        assert!(matches!(
            client.services("dg-1/services").await,
            Err(WatchError::HttpStatus { status: 404, .. })
        ));
    }

    #[test]
    fn uri_encodes_each_segment() {
        let endpoint = Endpoint::from_config(&config("http://cloudapi.local/")).unwrap();
        assert_eq!(
            endpoint.uri(&["machines", "a b/c"]),
            "http://cloudapi.local/ops/machines/a%20b%2Fc"
        );
    }

    #[tokio::test]
    async fn credentials_are_sent() {
        let url = serve(control_plane()).await;
        let mut cfg = config(&url);
        cfg.key_id = Some("wrong".to_string());
        let client = ControlPlaneClient::new(&cfg, Duration::from_secs(2));

        assert!(matches!(
            client.deployment_groups().await,
            Err(WatchError::HttpStatus { status: 401, .. })
        ));
    }

    #[tokio::test]
    async fn unreachable_control_plane_is_a_connection_error() {
        let client =
            ControlPlaneClient::new(&config("http://127.0.0.1:1"), Duration::from_millis(500));
        assert!(matches!(
            client.deployment_groups().await,
            Err(WatchError::Connection(_))
        ));
    }

    #[test]
    fn endpoint_requires_url_and_account() {
        let err = Endpoint::from_config(&ControlPlaneConfig::default()).unwrap_err();
        assert!(matches!(err, WatchError::Connection(_)));

        let mut cfg = config("https://cloudapi.example.com");
        assert!(Endpoint::from_config(&cfg).is_err());

        cfg.url = Some("http://cloudapi.local".to_string());
        cfg.account = None;
        assert!(Endpoint::from_config(&cfg).is_err());
    }

    #[tokio::test]
    async fn unconfigured_client_fails_every_request() {
        let client = ControlPlaneClient::new(&ControlPlaneConfig::default(), Duration::from_secs(1));

        assert!(matches!(
            client.deployment_groups().await,
            Err(WatchError::Connection(_))
        ));
        assert!(matches!(
            client.machine("m-1").await,
            Err(WatchError::Connection(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn unconfigured_client_keeps_watcher_polling() {
        let client = Arc::new(ControlPlaneClient::new(
            &ControlPlaneConfig::default(),
            Duration::from_secs(1),
        ));
        let (watcher, mut events) = Watcher::new(
            WatcherConfig {
                frequency: Duration::from_secs(1),
                event_capacity: 8,
            },
            Collaborators {
                discovery: client.clone(),
                machines: client,
                status: Arc::new(HttpStatusClient::default()),
                sink: Arc::new(StateStore::open_in_memory().unwrap()),
            },
        );

        assert!(watcher.start());
        tokio::time::sleep(Duration::from_millis(2500)).await;

        for _ in 0..2 {
            assert!(matches!(
                events.errors.recv().await,
                Some(WatchError::Connection(_))
            ));
        }
        assert!(events.results.try_recv().is_err());
        assert!(watcher.is_running());

        watcher.stop().await;
    }

    #[test]
    fn instance_dto_accepts_both_spellings() {
        let a: InstanceDto =
            serde_json::from_value(json!({"id": "i", "machineId": "m"})).unwrap();
        let b: InstanceDto =
            serde_json::from_value(json!({"id": "i", "machine_id": "m"})).unwrap();
        assert_eq!(a.machine_id, b.machine_id);
    }
}
