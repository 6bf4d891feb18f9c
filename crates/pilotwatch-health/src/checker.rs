//! Sidecar status probes.
//!
//! Every instance runs a sidecar that serves a JSON health document on
//! `http://<ip>:9090/status`. [`HttpStatusClient`] fetches and decodes that
//! document; [`http_get_json`] is the plain-HTTP GET it is built on, also
//! used by control-plane adapters.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use serde::de::DeserializeOwned;
use tracing::debug;

use pilotwatch_state::RawStatus;

use crate::error::{WatchError, WatchResult};

/// Default port of the sidecar status endpoint.
pub const DEFAULT_STATUS_PORT: u16 = 9090;

/// Default timeout for one status request.
pub const DEFAULT_STATUS_TIMEOUT: Duration = Duration::from_secs(2);

/// Fetches the raw sidecar status served at one address.
#[async_trait]
pub trait StatusClient: Send + Sync {
    async fn fetch(&self, ip: &str) -> WatchResult<RawStatus>;
}

/// [`StatusClient`] speaking HTTP/1.1 to the sidecar.
#[derive(Debug, Clone)]
pub struct HttpStatusClient {
    port: u16,
    timeout: Duration,
}

impl HttpStatusClient {
    pub fn new(port: u16, timeout: Duration) -> Self {
        Self { port, timeout }
    }

    /// Status URI for an instance address.
    pub fn status_uri(&self, ip: &str) -> String {
        if ip.contains(':') && !ip.starts_with('[') {
            format!("http://[{ip}]:{}/status", self.port)
        } else {
            format!("http://{ip}:{}/status", self.port)
        }
    }
}

impl Default for HttpStatusClient {
    fn default() -> Self {
        Self::new(DEFAULT_STATUS_PORT, DEFAULT_STATUS_TIMEOUT)
    }
}

#[async_trait]
impl StatusClient for HttpStatusClient {
    async fn fetch(&self, ip: &str) -> WatchResult<RawStatus> {
        http_get_json(&self.status_uri(ip), &[], self.timeout).await
    }
}

/// GET `uri` and decode the body as JSON, whatever its content type.
///
/// Fails on connection errors, non-2xx responses, undecodable bodies, or
/// when the whole exchange exceeds `timeout`.
pub async fn http_get_json<T: DeserializeOwned>(
    uri: &str,
    headers: &[(&str, &str)],
    timeout: Duration,
) -> WatchResult<T> {
    let fetch_err = |reason: String| WatchError::Fetch {
        uri: uri.to_string(),
        reason,
    };

    let parsed: http::Uri = uri.parse().map_err(|e: http::uri::InvalidUri| fetch_err(e.to_string()))?;
    if parsed.scheme_str() != Some("http") {
        return Err(fetch_err("only plain http is supported".to_string()));
    }
    let host = parsed
        .host()
        .ok_or_else(|| fetch_err("missing host".to_string()))?;
    let address = format!("{host}:{}", parsed.port_u16().unwrap_or(80));
    let path = parsed
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/");

    let result = tokio::time::timeout(timeout, async {
        let stream = tokio::net::TcpStream::connect(&address)
            .await
            .map_err(|e| fetch_err(e.to_string()))?;

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| fetch_err(e.to_string()))?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let mut req = http::Request::builder()
            .method("GET")
            .uri(path)
            .header("host", &address)
            .header("accept", "application/json")
            .header("user-agent", "pilotwatch/0.1");
        for (name, value) in headers {
            req = req.header(*name, *value);
        }
        let req = req
            .body(Empty::<Bytes>::new())
            .map_err(|e| fetch_err(e.to_string()))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| fetch_err(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(WatchError::HttpStatus {
                uri: uri.to_string(),
                status: resp.status().as_u16(),
            });
        }

        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| fetch_err(e.to_string()))?
            .to_bytes();
        serde_json::from_slice(&body).map_err(|e| WatchError::Decode {
            uri: uri.to_string(),
            reason: e.to_string(),
        })
    })
    .await;

    match result {
        Ok(outcome) => {
            if let Err(e) = &outcome {
                debug!(error = %e, %uri, "request failed");
            }
            outcome
        }
        Err(_) => {
            debug!(%uri, "request timed out");
            Err(WatchError::Timeout {
                uri: uri.to_string(),
            })
        }
    }
}
