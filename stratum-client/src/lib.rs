//! Stratum Runner Client
//!
//! A type-safe HTTP/WebSocket client for the runner API, used by the
//! scheduler to dispatch steps and follow them until they exit.
//!
//! # Example
//!
//! ```no_run
//! use stratum_client::RunnerClient;
//! use stratum_core::dto::task::TaskStepQuery;
//!
//! # async fn example() -> stratum_client::Result<()> {
//! let client = RunnerClient::new("http://localhost:19030");
//!
//! let status = client
//!     .wait_task(&TaskStepQuery {
//!         env_id: "env-1".to_string(),
//!         task_id: "task-1".to_string(),
//!         step: 0,
//!     })
//!     .await?;
//!
//! println!("exit code: {}", status.exit_code);
//! # Ok(())
//! # }
//! ```

pub mod error;
mod stream;
mod task;

// Re-export commonly used types
pub use error::{ClientError, Result};

use reqwest::{Client, Url};
use serde::de::DeserializeOwned;
use stratum_core::dto::task::TaskStepQuery;

/// HTTP client for one runner
///
/// Methods are grouped into:
/// - Step lifecycle (run, abort, pause, unpause)
/// - Streams (status, log follow, wait)
#[derive(Debug, Clone)]
pub struct RunnerClient {
    /// Base URL of the runner (e.g., "http://localhost:19030")
    base_url: String,
    /// HTTP client instance
    client: Client,
}

impl RunnerClient {
    /// Create a new runner client
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, Client::new())
    }

    /// Create a new runner client with a custom HTTP client
    ///
    /// This allows you to configure timeouts, proxies, TLS settings, etc.
    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Get the base URL of the runner
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// WebSocket URL of a streaming endpoint for one step
    fn ws_url(&self, path: &str, query: &TaskStepQuery) -> Result<Url> {
        let mut url = Url::parse(&format!("{}{}", self.base_url, path))
            .map_err(|e| ClientError::InvalidRequest(format!("invalid runner url: {}", e)))?;

        let scheme = match url.scheme() {
            "https" => "wss",
            _ => "ws",
        };
        url.set_scheme(scheme)
            .map_err(|_| ClientError::InvalidRequest(format!("cannot stream from {}", url)))?;

        url.query_pairs_mut()
            .append_pair("envId", &query.env_id)
            .append_pair("taskId", &query.task_id)
            .append_pair("step", &query.step.to_string());
        Ok(url)
    }

    // =============================================================================
    // Response Handlers
    // =============================================================================

    /// Handle an API response and deserialize JSON
    async fn handle_response<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ClientError::api_error(status.as_u16(), error_text));
        }

        response
            .json()
            .await
            .map_err(|e| ClientError::ParseError(format!("Failed to parse JSON response: {}", e)))
    }

    /// Handle an API response whose body is ignored
    async fn handle_empty_response(&self, response: reqwest::Response) -> Result<()> {
        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ClientError::api_error(status.as_u16(), error_text));
        }

        Ok(())
    }
}
