//! HTTPS client for the remote collector API (spec §4.4, §6).

use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use crate::event::Event;
use crate::supervisor::ConnectivitySupervisor;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Health snapshot shape forwarded to the remote, defined in `health.rs`;
/// forwarder only needs it to be `Serialize`.
pub trait HealthPayload: Serialize + Send + Sync {}
impl<T: Serialize + Send + Sync> HealthPayload for T {}

/// Thin HTTPS client. Every call reports its outcome to the connectivity
/// supervisor and never retries internally — retry is the queue/drainer's
/// responsibility (spec §4.4).
pub struct Forwarder {
    client: Client,
    base_url: String,
    api_key: String,
    agent_id: String,
    agent_version: String,
    supervisor: Arc<ConnectivitySupervisor>,
}

impl Forwarder {
    pub fn new(config: &AgentConfig, supervisor: Arc<ConnectivitySupervisor>) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(format!("SiemAgent/{}", config.agent_version))
            .build()
            .map_err(|e| AgentError::internal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            agent_id: config.agent_id.clone(),
            agent_version: config.agent_version.clone(),
            supervisor,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_key)
            .header("X-Agent-Id", &self.agent_id)
            .header("X-Agent-Version", &self.agent_version)
    }

    async fn observe(&self, result: reqwest::Result<reqwest::Response>) -> Result<reqwest::Response> {
        match result {
            Ok(resp) if resp.status().is_success() => {
                self.supervisor.report_success().await;
                Ok(resp)
            }
            Ok(resp) => {
                self.supervisor.report_failure().await;
                let status = resp.status();
                let message = resp.text().await.unwrap_or_default();
                if is_permanent_failure(status) {
                    Err(AgentError::RemoteRejected {
                        message,
                        endpoint: None,
                        status_code: status.as_u16(),
                    })
                } else {
                    Err(AgentError::Transport {
                        message,
                        endpoint: None,
                        status_code: Some(status.as_u16()),
                        retry_after: Some(30),
                    })
                }
            }
            Err(err) => {
                self.supervisor.report_failure().await;
                Err(err.into())
            }
        }
    }

    /// `POST /api/siem/events`.
    pub async fn forward_one(&self, event: &Event) -> Result<()> {
        let resp = self
            .request(reqwest::Method::POST, "/api/siem/events")
            .json(event)
            .send()
            .await;
        self.observe(resp).await?;
        Ok(())
    }

    /// `POST /api/siem/events/batch`.
    pub async fn forward_batch(&self, events: &[Event]) -> Result<()> {
        let resp = self
            .request(reqwest::Method::POST, "/api/siem/events/batch")
            .json(events)
            .send()
            .await;
        self.observe(resp).await?;
        Ok(())
    }

    /// `POST /api/siem/agents/{agentId}/health`.
    pub async fn send_health<T: HealthPayload>(&self, snapshot: &T) -> Result<()> {
        let path = format!("/api/siem/agents/{}/health", self.agent_id);
        let resp = self.request(reqwest::Method::POST, &path).json(snapshot).send().await;
        self.observe(resp).await?;
        Ok(())
    }

    /// `GET /api/siem/agents/{agentId}/configuration`.
    pub async fn fetch_config(&self) -> Result<Option<AgentConfig>> {
        let path = format!("/api/siem/agents/{}/configuration", self.agent_id);
        let resp = self.request(reqwest::Method::GET, &path).send().await;
        let resp = self.observe(resp).await?;
        let config = resp
            .json::<AgentConfig>()
            .await
            .map_err(|e| AgentError::Serialization {
                message: e.to_string(),
                event_id: None,
            })?;
        Ok(Some(config))
    }

    /// `GET /health` — liveness probe, drives the connectivity supervisor.
    pub async fn probe(&self) -> Result<()> {
        let resp = self
            .client
            .get(format!("{}/health", self.base_url))
            .send()
            .await;
        self.observe(resp).await?;
        Ok(())
    }
}

fn is_permanent_failure(status: StatusCode) -> bool {
    matches!(status.as_u16(), 401 | 403) || (status.is_client_error() && status.as_u16() != 408 && status.as_u16() != 429)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permanent_failure_classification_matches_spec() {
        assert!(is_permanent_failure(StatusCode::UNAUTHORIZED));
        assert!(is_permanent_failure(StatusCode::FORBIDDEN));
        assert!(is_permanent_failure(StatusCode::NOT_FOUND));
        assert!(!is_permanent_failure(StatusCode::REQUEST_TIMEOUT));
        assert!(!is_permanent_failure(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_permanent_failure(StatusCode::INTERNAL_SERVER_ERROR));
    }
}
