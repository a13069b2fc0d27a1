//! HTTP sink — reqwest client for the hosted telemetry endpoints
//!
//! - `POST {base}/{resource}`: zstd-compressed JSON array of entries.
//!   `200`/`201`/`204` accept the batch; a `{"accepted": [ids]}` body narrows
//!   acceptance to the listed ids. `409` means every entry is already stored.
//! - Probe: the same endpoint with an empty array, so it exercises the
//!   anonymous insert path rather than the authenticated read path.
//! - `GET {base}/{resource}?limit=n`: bearer token required.

use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;

use super::{Credentials, InsertOutcome, SinkError, TelemetrySink};
use crate::types::{SinkResource, TelemetryEntry};

#[derive(Debug, serde::Deserialize)]
struct AcceptedBody {
    accepted: Vec<String>,
}

/// HTTP client for the telemetry sink
#[derive(Clone)]
pub struct HttpSink {
    http: reqwest::Client,
    base_url: String,
    /// Anonymous (publishable) key sent with inserts and probes
    api_key: Option<String>,
    timeout: Duration,
}

impl HttpSink {
    pub fn new(base_url: &str, api_key: Option<&str>, timeout: Duration) -> Result<Self, SinkError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SinkError::Unreachable(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.map(str::to_string),
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, resource: SinkResource) -> String {
        format!("{}/{}", self.base_url, resource.as_str())
    }

    fn map_transport(&self, e: &reqwest::Error) -> SinkError {
        if e.is_timeout() {
            SinkError::Timeout(self.timeout)
        } else {
            SinkError::Unreachable(e.to_string())
        }
    }

    async fn post_batch(
        &self,
        resource: SinkResource,
        entries: &[TelemetryEntry],
    ) -> Result<reqwest::Response, SinkError> {
        let json = serde_json::to_vec(entries).map_err(|e| SinkError::Serialization(e.to_string()))?;
        let compressed = zstd::encode_all(json.as_slice(), 3)
            .map_err(|e| SinkError::Serialization(format!("compression failed: {e}")))?;

        let mut req = self
            .http
            .post(self.endpoint(resource))
            .header("Content-Type", "application/json")
            .header("Content-Encoding", "zstd")
            .body(compressed);
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {key}"));
        }

        req.send().await.map_err(|e| self.map_transport(&e))
    }
}

/// Map a non-success status onto the sink error taxonomy
fn status_error(status: StatusCode) -> SinkError {
    match status {
        StatusCode::PAYLOAD_TOO_LARGE | StatusCode::INSUFFICIENT_STORAGE => {
            SinkError::PayloadTooLarge(status.to_string())
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            SinkError::PermissionDenied(status.to_string())
        }
        other => SinkError::Status(other.as_u16()),
    }
}

#[async_trait]
impl TelemetrySink for HttpSink {
    async fn insert(
        &self,
        resource: SinkResource,
        entries: &[TelemetryEntry],
    ) -> Result<InsertOutcome, SinkError> {
        let resp = self.post_batch(resource, entries).await?;

        match resp.status() {
            StatusCode::OK | StatusCode::CREATED => {
                let body = resp.bytes().await.map_err(|e| self.map_transport(&e))?;
                match serde_json::from_slice::<AcceptedBody>(&body) {
                    Ok(parsed) => Ok(InsertOutcome {
                        accepted: parsed.accepted,
                    }),
                    Err(_) => Ok(InsertOutcome::all(entries)),
                }
            }
            // Duplicate: already on the sink, safe to drop locally
            StatusCode::NO_CONTENT | StatusCode::CONFLICT => Ok(InsertOutcome::all(entries)),
            status => Err(status_error(status)),
        }
    }

    async fn probe(&self, resource: SinkResource) -> Result<(), SinkError> {
        let resp = self.post_batch(resource, &[]).await?;
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(status_error(status))
        }
    }

    async fn read_recent(
        &self,
        resource: SinkResource,
        limit: usize,
        credentials: Option<&Credentials>,
    ) -> Result<Vec<TelemetryEntry>, SinkError> {
        let Some(credentials) = credentials else {
            return Err(SinkError::PermissionDenied(
                "reads require a signed-in user".to_string(),
            ));
        };

        let resp = self
            .http
            .get(self.endpoint(resource))
            .query(&[("limit", limit)])
            .header("Authorization", format!("Bearer {}", credentials.bearer_token))
            .send()
            .await
            .map_err(|e| self.map_transport(&e))?;

        match resp.status() {
            StatusCode::OK => {
                let body = resp.bytes().await.map_err(|e| self.map_transport(&e))?;
                serde_json::from_slice(&body).map_err(|e| SinkError::Serialization(e.to_string()))
            }
            status => Err(status_error(status)),
        }
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            status_error(StatusCode::PAYLOAD_TOO_LARGE),
            SinkError::PayloadTooLarge(_)
        ));
        assert!(matches!(
            status_error(StatusCode::INSUFFICIENT_STORAGE),
            SinkError::PayloadTooLarge(_)
        ));
        assert!(matches!(
            status_error(StatusCode::FORBIDDEN),
            SinkError::PermissionDenied(_)
        ));
        assert_eq!(status_error(StatusCode::BAD_GATEWAY), SinkError::Status(502));
    }

    #[test]
    fn test_endpoint_trims_trailing_slash() {
        let sink = HttpSink::new("https://sink.example/v1/", None, Duration::from_secs(5)).unwrap();
        assert_eq!(sink.base_url(), "https://sink.example/v1");
        assert_eq!(
            sink.endpoint(SinkResource::CrashReports),
            "https://sink.example/v1/crash_reports"
        );
    }

    #[tokio::test]
    async fn test_read_without_credentials_is_refused_locally() {
        let sink = HttpSink::new("http://127.0.0.1:9", None, Duration::from_millis(200)).unwrap();
        let err = sink
            .read_recent(SinkResource::PerformanceMetrics, 5, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SinkError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn test_unreachable_host_is_transient() {
        // Port 9 (discard) is closed on test hosts
        let sink = HttpSink::new("http://127.0.0.1:9", None, Duration::from_millis(500)).unwrap();
        let err = sink.probe(SinkResource::CrashReports).await.unwrap_err();
        assert_eq!(err.class(), super::super::ErrorClass::TransientNetwork);
    }
}
