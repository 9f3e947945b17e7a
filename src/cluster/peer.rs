use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use super::capacity::CapacityReport;
use super::protocol::{
    AcceptJobRequest, AcceptJobResponse, ConfirmFilesRequest, ConfirmFilesResponse,
    JobCompleteRequest, JobCompleteResponse, ACCEPT_JOB_PATH, CAPACITY_PATH, CONFIRM_FILES_PATH,
    JOB_COMPLETE_PATH,
};
use crate::error::{PipelineError, PipelineResult};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Capacity queries must not stall a dashboard refresh
pub const CAPACITY_TIMEOUT: Duration = Duration::from_secs(5);

/// A peer node as configured by `name:host:port`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerSpec {
    pub name: String,
    pub host: String,
    pub port: u16,
}

impl PeerSpec {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url(), path)
    }
}

impl fmt::Display for PeerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.name, self.host, self.port)
    }
}

impl FromStr for PeerSpec {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |why: &str| PipelineError::InvalidInput(format!("peer '{s}': {why}"));

        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() < 3 {
            return Err(invalid("expected name:host:port"));
        }
        // Hosts may be bracketed IPv6 literals containing ':'
        let name = parts[0].trim();
        let port = parts[parts.len() - 1].trim();
        let host = parts[1..parts.len() - 1].join(":");

        // The name becomes a record suffix on the sending node
        if name.is_empty() || name.contains(['.', '/', '\\']) {
            return Err(invalid("bad node name"));
        }
        if host.trim().is_empty() {
            return Err(invalid("empty host"));
        }
        let port = port.parse::<u16>().map_err(|_| invalid("bad port"))?;

        Ok(Self {
            name: name.to_string(),
            host: host.trim().to_string(),
            port,
        })
    }
}

/// HTTP client for the peer endpoints of other nodes
#[derive(Clone)]
pub struct PeerClient {
    client: reqwest::Client,
    capacity_timeout: Duration,
}

impl PeerClient {
    pub fn new() -> Self {
        Self::with_timeouts(DEFAULT_REQUEST_TIMEOUT, CAPACITY_TIMEOUT)
    }

    pub fn with_timeouts(request_timeout: Duration, capacity_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            capacity_timeout,
        }
    }

    /// Ask a peer what it can take. Any failure means the peer is offline.
    pub async fn capacity(&self, peer: &PeerSpec) -> Option<CapacityReport> {
        let response = self
            .client
            .get(peer.url(CAPACITY_PATH))
            .timeout(self.capacity_timeout)
            .send()
            .await;

        let response = match response {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                debug!("Peer {} capacity returned {}", peer.name, r.status());
                return None;
            }
            Err(e) => {
                debug!("Peer {} unreachable: {}", peer.name, e);
                return None;
            }
        };

        match response.json::<CapacityReport>().await {
            Ok(report) => Some(report),
            Err(e) => {
                debug!("Peer {} sent an unreadable capacity report: {}", peer.name, e);
                None
            }
        }
    }

    pub async fn confirm_files(
        &self,
        peer: &PeerSpec,
        files: Vec<String>,
    ) -> PipelineResult<ConfirmFilesResponse> {
        self.post(peer, CONFIRM_FILES_PATH, &ConfirmFilesRequest { files })
            .await
    }

    pub async fn accept_job(
        &self,
        peer: &PeerSpec,
        request: &AcceptJobRequest,
    ) -> PipelineResult<AcceptJobResponse> {
        self.post(peer, ACCEPT_JOB_PATH, request).await
    }

    pub async fn job_complete(
        &self,
        peer: &PeerSpec,
        request: &JobCompleteRequest,
    ) -> PipelineResult<JobCompleteResponse> {
        self.post(peer, JOB_COMPLETE_PATH, request).await
    }

    async fn post<B, R>(&self, peer: &PeerSpec, path: &str, body: &B) -> PipelineResult<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let unreachable = |reason: String| PipelineError::PeerUnreachable {
            peer: peer.name.clone(),
            reason,
        };

        let response = self
            .client
            .post(peer.url(path))
            .json(body)
            .send()
            .await
            .map_err(|e| unreachable(format!("{path} request failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<R>()
                .await
                .map_err(|e| unreachable(format!("invalid {path} response: {e}")));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| unreachable(format!("failed reading {path} error body: {e}")))?;
        let message = serde_json::from_slice::<serde_json::Value>(&body)
            .ok()
            .and_then(|value| value.get("error").and_then(|v| v.as_str()).map(str::to_string))
            .unwrap_or_else(|| String::from_utf8_lossy(&body).to_string());

        match status {
            StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
                Err(unreachable(format!("{status}: {message}")))
            }
            _ => Err(PipelineError::PeerRejected {
                peer: peer.name.clone(),
                status: status.as_u16(),
                message,
            }),
        }
    }
}

impl Default for PeerClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::json;

    async fn spawn_server(app: Router) -> PeerSpec {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        PeerSpec {
            name: "peer".to_string(),
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }

    #[test]
    fn test_parse_peer_spec() {
        let peer: PeerSpec = "plex:192.168.1.50:5000".parse().unwrap();
        assert_eq!(peer.name, "plex");
        assert_eq!(peer.host, "192.168.1.50");
        assert_eq!(peer.port, 5000);
        assert_eq!(peer.base_url(), "http://192.168.1.50:5000");
        assert_eq!(peer.to_string(), "plex:192.168.1.50:5000");
    }

    #[test]
    fn test_parse_peer_spec_rejects_malformed() {
        for bad in ["plex", "plex:host", ":host:5000", "plex:host:notaport", "plex:host:99999", "a.b:host:1", "p::5000"] {
            assert!(
                matches!(bad.parse::<PeerSpec>(), Err(PipelineError::InvalidInput(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn test_capacity_of_unreachable_peer_is_none() {
        let client = PeerClient::with_timeouts(Duration::from_secs(1), Duration::from_millis(500));
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let peer = PeerSpec {
            name: "gone".to_string(),
            host: "127.0.0.1".to_string(),
            port,
        };
        assert!(client.capacity(&peer).await.is_none());
    }

    #[tokio::test]
    async fn test_capacity_with_garbage_body_is_none() {
        let peer = spawn_server(Router::new().route(
            CAPACITY_PATH,
            get(|| async { Json(json!({ "unexpected": true })) }),
        ))
        .await;
        assert!(PeerClient::new().capacity(&peer).await.is_none());
    }

    #[tokio::test]
    async fn test_post_maps_error_status_to_rejected() {
        let peer = spawn_server(Router::new().route(
            ACCEPT_JOB_PATH,
            post(|| async {
                (
                    StatusCode::NOT_FOUND,
                    Json(json!({ "error": "ISO file not found", "expected_path": "/x.iso" })),
                )
            }),
        ))
        .await;

        let request = AcceptJobRequest {
            metadata: serde_json::from_value(json!({ "title": "T", "timestamp": "1" })).unwrap(),
            origin: "a".to_string(),
        };
        match PeerClient::new().accept_job(&peer, &request).await {
            Err(PipelineError::PeerRejected { status, message, .. }) => {
                assert_eq!(status, 404);
                assert_eq!(message, "ISO file not found");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
