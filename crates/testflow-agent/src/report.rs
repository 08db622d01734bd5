//! HTTP clients for the remote report surface.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error};

use testflow_core::{AgentError, DiscoveryResult, ExecutionResponse, ExecutionResults, TaskRun};

use crate::collaborators::{IngestReporter, TaskStatusReporter};

/// One coarse timeout for every remote call the agent makes.
const HTTP_TIMEOUT: Duration = Duration::from_secs(45);

/// Client for the remote report/ingest API.
pub struct ReportClient {
    inner: reqwest::Client,
    base_url: String,
}

impl ReportClient {
    /// Create a new report client against the given base URL.
    pub fn new(base_url: &str) -> Result<Self, AgentError> {
        let inner = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| AgentError::internal(format!("failed to build http client: {e}")))?;
        Ok(Self {
            inner,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post_json<T: serde::Serialize>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<reqwest::Response, AgentError> {
        let url = self.url(path);
        debug!(url = %url, "POST request");

        let response = self
            .inner
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| AgentError::internal(format!("request to {url} failed: {e}")))?;

        if !response.status().is_success() {
            error!(url = %url, status = %response.status(), "non-2xx response");
            return Err(AgentError::internal(format!(
                "request to {url} returned status {}",
                response.status()
            )));
        }
        Ok(response)
    }

    /// POST aggregated execution stats and read back the authoritative
    /// task status.
    pub async fn send_stats(
        &self,
        results: &ExecutionResults,
    ) -> Result<ExecutionResponse, AgentError> {
        let response = self.post_json("/report", results).await?;
        response
            .json::<ExecutionResponse>()
            .await
            .map_err(|e| AgentError::internal(format!("invalid report response: {e}")))
    }
}

#[async_trait]
impl TaskStatusReporter for ReportClient {
    async fn update_status(&self, task_run: &TaskRun) -> Result<(), AgentError> {
        debug!(task_id = %task_run.task_id, status = ?task_run.status, "updating task status");
        self.post_json("/task", task_run).await?;
        Ok(())
    }
}

#[async_trait]
impl IngestReporter for ReportClient {
    async fn report_discovery(&self, result: &DiscoveryResult) -> Result<(), AgentError> {
        debug!(task_id = %result.task_id, tests = result.tests.len(), "reporting discovery result");
        self.post_json("/test-list", result).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client = ReportClient::new("http://localhost:8000/").unwrap();
        assert_eq!(client.url("/task"), "http://localhost:8000/task");
    }
}
