//! HTTP client for a remote `/queue/status` endpoint.

use std::time::Duration;

use async_trait::async_trait;
use episodic_core::MonitorConfig;
use episodic_scheduler::{SchedulerError, StatusSnapshot, StatusSource};

/// Fetches [`StatusSnapshot`]s from a running server, so the gatekeeping
/// protocol works across processes.
pub struct HttpStatusSource {
    status_url: String,
    http: reqwest::Client,
}

impl HttpStatusSource {
    pub fn new(status_url: &str, request_timeout: Duration) -> Result<Self, SchedulerError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| SchedulerError::Status(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            status_url: status_url.to_string(),
            http,
        })
    }

    pub fn from_config(config: &MonitorConfig) -> Result<Self, SchedulerError> {
        Self::new(&config.status_url, config.request_timeout())
    }

    pub fn status_url(&self) -> &str {
        &self.status_url
    }
}

#[async_trait]
impl StatusSource for HttpStatusSource {
    async fn fetch_status(&self) -> Result<StatusSnapshot, SchedulerError> {
        let resp = self
            .http
            .get(&self.status_url)
            .send()
            .await
            .map_err(|e| SchedulerError::Status(format!("{}: {}", self.status_url, e)))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(SchedulerError::Status(format!(
                "{} returned {}: {}",
                self.status_url, status, body
            )));
        }

        resp.json()
            .await
            .map_err(|e| SchedulerError::Status(format!("unexpected status payload: {}", e)))
    }
}
