//! HTTP resumable-session sink.
//!
//! Protocol:
//! - `POST {endpoint}/upload?uploadType=resumable&part=snippet,status` with
//!   the metadata as JSON; the session URI comes back in `Location`
//! - `PUT {session}` with `Content-Range: bytes a-b/total` per chunk
//! - `308` means more data is expected; its `Range: bytes=0-N` header says
//!   the sink holds `N + 1` bytes
//! - `200`/`201` ends the upload with `{"id": ...}`
//!
//! Error bodies follow `{"error": {"errors": [{"reason": ...}], "message": ...}}`.
//! HTTP 429, or any error whose reason matches a configured quota signature,
//! becomes [`SinkError::QuotaExceeded`].

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{CONTENT_RANGE, CONTENT_TYPE, LOCATION, RANGE};
use reqwest::{Client, Response};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument};
use url::Url;

use super::{ChunkAck, SinkError, UploadSession, UploadSink};
use crate::enrich::EnrichedMetadata;
use crate::http_client::{HttpTimeouts, build_http_client};

/// Connection and metadata settings for [`HttpResumableSink`].
#[derive(Clone, PartialEq, Eq)]
pub struct SinkSettings {
    /// API root, e.g. `https://sink.example/api`.
    pub endpoint: String,
    /// Bearer token.
    pub token: String,
    /// Visibility of created objects.
    pub privacy_status: String,
    /// Platform category id sent with every upload.
    pub category_id: String,
    /// Error reasons that mean quota exhaustion.
    pub quota_signatures: Vec<String>,
}

impl fmt::Debug for SinkSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinkSettings")
            .field("endpoint", &self.endpoint)
            .field("token", &"<redacted>")
            .field("privacy_status", &self.privacy_status)
            .field("category_id", &self.category_id)
            .field("quota_signatures", &self.quota_signatures)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct CreatedObject {
    id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    error: Option<ErrorBody>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    errors: Vec<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    reason: Option<String>,
}

/// Upload sink speaking the session-URI resumable protocol.
#[derive(Debug, Clone)]
pub struct HttpResumableSink {
    client: Client,
    endpoint: Url,
    settings: SinkSettings,
}

impl HttpResumableSink {
    /// Creates a sink for `settings.endpoint`.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Protocol`] for an invalid endpoint URL or a client
    /// build failure.
    pub fn new(settings: SinkSettings, timeouts: HttpTimeouts) -> Result<Self, SinkError> {
        let endpoint = Url::parse(settings.endpoint.trim_end_matches('/'))
            .map_err(|e| SinkError::protocol(format!("invalid sink endpoint: {e}")))?;
        let client = build_http_client("sink", timeouts)
            .map_err(|e| SinkError::protocol(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint,
            settings,
        })
    }

    fn initiate_url(&self) -> String {
        format!(
            "{}/upload?uploadType=resumable&part=snippet,status",
            self.endpoint.as_str().trim_end_matches('/')
        )
    }

    async fn error_from(&self, response: Response) -> SinkError {
        let status = response.status().as_u16();
        let body = response.bytes().await.unwrap_or_default();
        classify_error_body(status, &body, &self.settings.quota_signatures)
    }
}

/// Turns an error response into a [`SinkError`], detecting quota signals.
fn classify_error_body(status: u16, body: &[u8], quota_signatures: &[String]) -> SinkError {
    let envelope: ErrorEnvelope = serde_json::from_slice(body).unwrap_or_default();
    let error = envelope.error.unwrap_or_default();

    let mut reasons: Vec<String> = error.errors.into_iter().filter_map(|e| e.reason).collect();
    reasons.extend(error.status);

    let matched = reasons
        .iter()
        .find(|reason| quota_signatures.iter().any(|sig| sig == *reason))
        .cloned()
        .or_else(|| {
            let message = error.message.as_deref().unwrap_or_default();
            quota_signatures
                .iter()
                .find(|sig| message.contains(sig.as_str()))
                .cloned()
        });

    if let Some(reason) = matched {
        return SinkError::QuotaExceeded { reason };
    }
    if status == 429 {
        return SinkError::QuotaExceeded {
            reason: reasons
                .into_iter()
                .next()
                .unwrap_or_else(|| "HTTP 429 Too Many Requests".to_string()),
        };
    }
    SinkError::HttpStatus {
        status,
        reason: reasons.into_iter().next().or(error.message),
    }
}

/// Parses `bytes=0-N` into the committed byte count `N + 1`.
fn committed_from_range(value: &str) -> Option<u64> {
    let (_, end) = value.trim().strip_prefix("bytes=")?.split_once('-')?;
    end.trim().parse::<u64>().ok().map(|n| n + 1)
}

#[async_trait]
impl UploadSink for HttpResumableSink {
    fn name(&self) -> &str {
        "http-resumable"
    }

    #[instrument(skip_all, fields(sink = "http-resumable", total_size))]
    async fn initiate_session(
        &self,
        metadata: &EnrichedMetadata,
        total_size: u64,
    ) -> Result<UploadSession, SinkError> {
        let url = self.initiate_url();
        let body = json!({
            "snippet": {
                "title": metadata.title,
                "description": metadata.description,
                "categoryId": self.settings.category_id,
                "tags": metadata.tags,
            },
            "status": {
                "privacyStatus": self.settings.privacy_status,
            },
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.settings.token)
            .header("X-Upload-Content-Length", total_size.to_string())
            .header("X-Upload-Content-Type", "application/octet-stream")
            .json(&body)
            .send()
            .await
            .map_err(|e| SinkError::network(&url, e))?;

        if !response.status().is_success() {
            return Err(self.error_from(response).await);
        }

        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| SinkError::protocol("session response has no Location header"))?;
        let uri = self
            .endpoint
            .join(location)
            .map_err(|e| SinkError::protocol(format!("invalid session Location: {e}")))?;

        debug!(session = %uri, "resumable session created");
        Ok(UploadSession {
            uri: uri.to_string(),
        })
    }

    #[instrument(skip_all, fields(offset, len = chunk.len(), total_size))]
    async fn send_chunk(
        &self,
        session: &UploadSession,
        offset: u64,
        chunk: Bytes,
        total_size: u64,
    ) -> Result<ChunkAck, SinkError> {
        let content_range = if chunk.is_empty() {
            format!("bytes */{total_size}")
        } else {
            format!(
                "bytes {offset}-{}/{total_size}",
                offset + chunk.len() as u64 - 1
            )
        };

        let response = self
            .client
            .put(&session.uri)
            .bearer_auth(&self.settings.token)
            .header(CONTENT_RANGE, content_range)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(chunk)
            .send()
            .await
            .map_err(|e| SinkError::network(&session.uri, e))?;

        match response.status().as_u16() {
            308 => {
                let committed = response
                    .headers()
                    .get(RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(committed_from_range)
                    .unwrap_or(0);
                debug!(committed, "chunk acknowledged");
                Ok(ChunkAck::Progress { committed })
            }
            200 | 201 => {
                let created: CreatedObject = response
                    .json()
                    .await
                    .map_err(|e| SinkError::protocol(format!("unreadable completion body: {e}")))?;
                let remote_id = created
                    .id
                    .filter(|id| !id.is_empty())
                    .ok_or_else(|| SinkError::protocol("completion body has no id"))?;
                Ok(ChunkAck::Complete { remote_id })
            }
            _ => Err(self.error_from(response).await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signatures() -> Vec<String> {
        vec!["quotaExceeded".to_string(), "uploadLimitExceeded".to_string()]
    }

    #[test]
    fn test_committed_from_range() {
        assert_eq!(committed_from_range("bytes=0-1023"), Some(1024));
        assert_eq!(committed_from_range(" bytes=0-0 "), Some(1));
        assert_eq!(committed_from_range("bytes=0-"), None);
        assert_eq!(committed_from_range("items=0-5"), None);
    }

    #[test]
    fn test_quota_reason_in_403_body() {
        let body = br#"{"error":{"code":403,"message":"quota","errors":[{"reason":"quotaExceeded"}]}}"#;
        match classify_error_body(403, body, &signatures()) {
            SinkError::QuotaExceeded { reason } => assert_eq!(reason, "quotaExceeded"),
            other => panic!("expected quota, got {other:?}"),
        }
    }

    #[test]
    fn test_quota_signature_in_message() {
        let body = br#"{"error":{"message":"The user has exceeded uploadLimitExceeded today"}}"#;
        assert!(matches!(
            classify_error_body(400, body, &signatures()),
            SinkError::QuotaExceeded { .. }
        ));
    }

    #[test]
    fn test_429_without_body_is_quota() {
        assert!(matches!(
            classify_error_body(429, b"", &signatures()),
            SinkError::QuotaExceeded { .. }
        ));
    }

    #[test]
    fn test_other_403_is_plain_status() {
        let body = br#"{"error":{"errors":[{"reason":"forbidden"}]}}"#;
        match classify_error_body(403, body, &signatures()) {
            SinkError::HttpStatus { status, reason } => {
                assert_eq!(status, 403);
                assert_eq!(reason.as_deref(), Some("forbidden"));
            }
            other => panic!("expected status, got {other:?}"),
        }
    }

    #[test]
    fn test_settings_debug_redacts_token() {
        let settings = SinkSettings {
            endpoint: "https://sink.example".to_string(),
            token: "secret-token".to_string(),
            privacy_status: "private".to_string(),
            category_id: "27".to_string(),
            quota_signatures: signatures(),
        };
        assert!(!format!("{settings:?}").contains("secret-token"));
    }
}
