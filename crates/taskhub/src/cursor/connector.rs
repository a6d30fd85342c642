use async_trait::async_trait;

use crate::error::{ServiceError, ServiceResult};
use taskhub_models::CursorCommand;

/// What the connector agent said when handed a command.
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    /// The agent executed synchronously and returned a result body.
    Completed(String),
    /// The agent accepted the command; the result arrives later through
    /// the result-submission endpoint.
    Accepted,
}

/// Reachability and dispatch seam toward the external Cursor connector
/// agent. Swapped for a mock in tests.
#[async_trait]
pub trait CursorConnector: Send + Sync {
    /// Liveness probe. Ok means the agent's health endpoint answered
    /// within the probe timeout.
    async fn probe(&self) -> Result<(), String>;

    /// Hand one command to the agent.
    async fn dispatch(&self, command: &CursorCommand) -> Result<DispatchOutcome, String>;
}

/// HTTP push implementation: commands are POSTed to the agent's base URL,
/// liveness is a GET on its health endpoint.
pub struct HttpConnector {
    base_url: String,
    client: reqwest::Client,
    request_timeout: std::time::Duration,
}

impl HttpConnector {
    pub fn new(base_url: &str, request_timeout_secs: u64) -> ServiceResult<Self> {
        let trimmed = base_url.trim_end_matches('/');
        if !trimmed.starts_with("http://") && !trimmed.starts_with("https://") {
            return Err(ServiceError::Configuration(format!(
                "connector url must be http(s), got '{}'",
                base_url
            )));
        }
        Ok(Self {
            base_url: trimmed.to_string(),
            client: reqwest::Client::new(),
            request_timeout: std::time::Duration::from_secs(request_timeout_secs),
        })
    }
}

#[async_trait]
impl CursorConnector for HttpConnector {
    async fn probe(&self) -> Result<(), String> {
        let resp = self
            .client
            .get(format!("{}/health", self.base_url))
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(format!("health probe returned HTTP {}", resp.status()))
        }
    }

    async fn dispatch(&self, command: &CursorCommand) -> Result<DispatchOutcome, String> {
        let resp = self
            .client
            .post(format!("{}/commands", self.base_url))
            .json(command)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let status = resp.status();
        if status == reqwest::StatusCode::ACCEPTED {
            return Ok(DispatchOutcome::Accepted);
        }
        if status.is_success() {
            let body: serde_json::Value = resp.json().await.unwrap_or_default();
            let response = body
                .get("response")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            return Ok(DispatchOutcome::Completed(response));
        }
        Err(format!("connector returned HTTP {}", status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_http_urls() {
        assert!(matches!(
            HttpConnector::new("ftp://agent", 5),
            Err(ServiceError::Configuration(_))
        ));
        assert!(HttpConnector::new("http://localhost:9000/", 5).is_ok());
    }
}
