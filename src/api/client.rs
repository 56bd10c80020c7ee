use super::{ControlPlane, DesiredState, HeartbeatRequest};
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

/// Typed HTTP client for the control plane.
///
/// Every request carries the agent-identity header and the two edge
/// gatekeeper service-token headers. The underlying client enforces a 30 s
/// total timeout per request.
pub struct ControlPlaneClient {
    base_url: String,
    agent_id: String,
    access_client_id: String,
    access_client_secret: String,
    http: Client,
}

impl ControlPlaneClient {
    pub fn new(
        base_url: impl Into<String>,
        agent_id: impl Into<String>,
        access_client_id: impl Into<String>,
        access_client_secret: impl Into<String>,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            agent_id: agent_id.into(),
            access_client_id: access_client_id.into(),
            access_client_secret: access_client_secret.into(),
            http,
        })
    }

    fn with_access_headers(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let mut req = req;
        if !self.agent_id.is_empty() {
            req = req.header("X-Agent-Id", &self.agent_id);
        }
        if !self.access_client_id.is_empty() {
            req = req.header("CF-Access-Client-Id", &self.access_client_id);
        }
        if !self.access_client_secret.is_empty() {
            req = req.header("CF-Access-Client-Secret", &self.access_client_secret);
        }
        req
    }
}

#[async_trait]
impl ControlPlane for ControlPlaneClient {
    async fn get_desired_state(&self, stack_id: &str) -> Result<DesiredState> {
        let url = format!("{}/api/stacks/{}/desired-state", self.base_url, stack_id);
        let resp = self
            .with_access_headers(self.http.get(&url))
            .send()
            .await
            .map_err(|e| Error::ControlPlane(format!("failed to fetch desired state: {}", e)))?;

        if resp.status() != reqwest::StatusCode::OK {
            return Err(Error::ControlPlane(format!(
                "desired-state returned status {}",
                resp.status()
            )));
        }

        resp.json::<DesiredState>()
            .await
            .map_err(|e| Error::ControlPlane(format!("invalid desired-state body: {}", e)))
    }

    async fn send_heartbeat(&self, req: &HeartbeatRequest) -> Result<()> {
        let url = format!("{}/api/agents/heartbeat", self.base_url);
        let resp = self
            .with_access_headers(self.http.post(&url))
            .json(req)
            .send()
            .await
            .map_err(|e| Error::ControlPlane(format!("failed to send heartbeat: {}", e)))?;

        if resp.status() != reqwest::StatusCode::OK {
            return Err(Error::ControlPlane(format!(
                "heartbeat returned status {}",
                resp.status()
            )));
        }
        Ok(())
    }
}
