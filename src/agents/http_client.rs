//! HTTP agent service client
//!
//! Reference adapter for the agent service boundary: forwards invocation
//! requests to an external reasoning service over HTTP and classifies the
//! outcome. Rate limiting, request timeouts, and server errors are
//! transient; malformed responses and client errors are permanent.

use crate::agents::{Agent, AgentFailure, AgentRequest, AgentResponse};
use async_trait::async_trait;
use std::time::Instant;

/// HTTP adapter for the agent service boundary
///
/// One instance serves every step kind: the kind selects the endpoint path
/// (`{base_url}/v1/agents/{kind}/invoke`). The `reqwest::Client` is shared
/// for connection pooling.
pub struct HttpAgent {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAgent {
    /// Create a client for the agent service at `base_url`
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self { client, base_url }
    }
}

#[async_trait]
impl Agent for HttpAgent {
    async fn invoke(&self, request: AgentRequest) -> Result<AgentResponse, AgentFailure> {
        let url = format!(
            "{}/v1/agents/{}/invoke",
            self.base_url,
            request.kind.as_str()
        );

        tracing::debug!(
            step_id = %request.step_id,
            kind = %request.kind.as_str(),
            url = %url,
            "Invoking agent service"
        );

        let started = Instant::now();
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                // Connect errors and client-side timeouts are worth retrying.
                AgentFailure::Transient(format!("agent service request failed: {e}"))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unable to read error body".to_string());

            tracing::warn!(
                step_id = %request.step_id,
                status_code = status.as_u16(),
                error_body = %body,
                "Agent service returned error status"
            );

            let message = format!("agent service returned {status}: {body}");
            return if status.as_u16() == 408
                || status.as_u16() == 429
                || status.is_server_error()
            {
                Err(AgentFailure::Transient(message))
            } else {
                Err(AgentFailure::Permanent(message))
            };
        }

        let mut parsed: AgentResponse = response.json().await.map_err(|e| {
            AgentFailure::Permanent(format!("malformed agent service response: {e}"))
        })?;

        // Fall back to observed latency when the service does not report one.
        if parsed.latency_ms == 0 {
            parsed.latency_ms = started.elapsed().as_millis() as u64;
        }

        tracing::debug!(
            step_id = %request.step_id,
            cost_units = parsed.cost_units,
            latency_ms = parsed.latency_ms,
            "Agent invocation completed"
        );

        Ok(parsed)
    }
}
