//! HTTP work-unit adapter.
//!
//! Posts `{unit, tenant_id, attempt, input}` as JSON to a configured URL and
//! maps the response onto the unit contract:
//!
//! - 2xx with `{output, usage?}`: success
//! - 2xx or 4xx with `{failure_kind, message}`: failure as reported
//! - other 4xx: permanent failure
//! - 429, 5xx, network errors and timeouts: transient failure

use std::time::Duration;

use pipewright_core::unit::{UnitFailure, UnitOutput, UnitRequest, WorkUnit};
use serde::Deserialize;
use serde_json::json;

const USER_AGENT: &str = "pipewright-unit/0.1";

/// Failure body a unit endpoint may return.
#[derive(Debug, Deserialize)]
struct FailureBody {
    failure_kind: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    retryable: bool,
}

/// A work unit served by a remote HTTP endpoint.
#[derive(Debug, Clone)]
pub struct HttpWorkUnit {
    name: String,
    url: String,
    client: reqwest::Client,
}

impl HttpWorkUnit {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_default();
        Self::with_client(name, url, client)
    }

    /// Share one connection pool between many units.
    pub fn with_client(name: impl Into<String>, url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            client,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl WorkUnit for HttpWorkUnit {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, request: &UnitRequest) -> Result<UnitOutput, UnitFailure> {
        let body = json!({
            "unit": request.unit,
            "tenant_id": request.tenant_id,
            "attempt": request.attempt,
            "input": request.input,
        });

        let mut call = self.client.post(&self.url).json(&body);
        if request.timeout > Duration::ZERO {
            call = call.timeout(request.timeout);
        }

        let response = call.send().await.map_err(|e| {
            if e.is_timeout() {
                UnitFailure::transient("timeout", format!("request to '{}' timed out", self.url))
            } else {
                UnitFailure::transient("network", format!("request to '{}' failed: {e}", self.url))
            }
        })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| UnitFailure::transient("network", format!("failed to read response body: {e}")))?;

        tracing::debug!(
            unit = %self.name,
            url = %self.url,
            status = status.as_u16(),
            body_len = text.len(),
            "unit endpoint responded"
        );

        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(UnitFailure::transient(
                format!("http_{}", status.as_u16()),
                truncate(&text),
            ));
        }

        if let Ok(failure) = serde_json::from_str::<FailureBody>(&text) {
            return Err(UnitFailure {
                failure_kind: failure.failure_kind,
                message: failure.message,
                retryable: failure.retryable && status.is_success(),
            });
        }

        if !status.is_success() {
            return Err(UnitFailure::permanent(
                format!("http_{}", status.as_u16()),
                truncate(&text),
            ));
        }

        serde_json::from_str::<UnitOutput>(&text).map_err(|e| {
            UnitFailure::permanent("invalid_response", format!("expected {{output}} from '{}': {e}", self.url))
        })
    }
}

fn truncate(text: &str) -> String {
    const MAX: usize = 512;
    if text.len() <= MAX {
        return text.to_string();
    }
    let mut end = MAX;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}
