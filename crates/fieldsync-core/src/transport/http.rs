//! HTTP transport to the sync authority

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use super::{BatchResult, OutboundOperation, Transport, TransportError};
use crate::error::{Error, Result};
use crate::models::DeviceId;

const BATCH_PATH: &str = "/v1/sync/batch";
/// Longest remote error message carried into a `TransportError`
const MAX_ERROR_CHARS: usize = 180;

#[derive(Clone)]
pub struct HttpTransport {
    endpoint: String,
    auth_token: Option<String>,
    client: reqwest::Client,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpTransport")
            .field("endpoint", &self.endpoint)
            .field(
                "auth_token",
                &self.auth_token.as_ref().map(|_| "[REDACTED]"),
            )
            .finish_non_exhaustive()
    }
}

impl HttpTransport {
    /// Build a transport for `base_url` (scheme required, trailing `/` ignored)
    pub fn new(base_url: impl Into<String>, auth_token: Option<String>) -> Result<Self> {
        let base = normalize_base_url(base_url.into())?;
        let client = reqwest::Client::builder()
            .build()
            .map_err(|error| Error::Config(format!("failed to build HTTP client: {error}")))?;
        Ok(Self {
            endpoint: format!("{base}{BATCH_PATH}"),
            auth_token: auth_token
                .map(|token| token.trim().to_string())
                .filter(|token| !token.is_empty()),
            client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SyncBatchRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    device_id: Option<&'a DeviceId>,
    operations: &'a [OutboundOperation],
}

impl<'a> SyncBatchRequest<'a> {
    /// Batches only carry this device's operations
    fn new(operations: &'a [OutboundOperation]) -> Self {
        Self {
            device_id: operations.first().map(|outbound| &outbound.operation.device_id),
            operations,
        }
    }
}

impl Transport for HttpTransport {
    async fn send(
        &self,
        batch: &[OutboundOperation],
    ) -> std::result::Result<BatchResult, TransportError> {
        let body = SyncBatchRequest::new(batch);

        let mut request = self
            .client
            .post(&self.endpoint)
            .header("Accept", "application/json")
            .json(&body);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|error| TransportError::Unreachable(error.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Http {
                status: status.as_u16(),
                message: parse_api_error(status, &body),
            });
        }

        response
            .json::<BatchResult>()
            .await
            .map_err(|error| TransportError::InvalidResponse(error.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return excerpt(&message);
        }
    }

    let trimmed = excerpt(body);
    if trimmed.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string()
    } else {
        trimmed
    }
}

fn excerpt(text: &str) -> String {
    text.trim().chars().take(MAX_ERROR_CHARS).collect()
}

fn normalize_base_url(raw: String) -> Result<String> {
    let base = raw.trim();
    if base.is_empty() {
        return Err(Error::Config("remote URL must not be empty".to_string()));
    }
    if base.starts_with("http://") || base.starts_with("https://") {
        Ok(base.trim_end_matches('/').to_string())
    } else {
        Err(Error::Config(
            "remote URL must include http:// or https://".to_string(),
        ))
    }
}
