//! API client library.
//!
//! Provides a Rust client for the HTTP API, used by `minesploit-cli`.

pub mod types;

use anyhow::{Context, Result};
use reqwest::Client as HttpClient;

use types::StatsSnapshot;

/// Default API base URL.
///
/// Port 7783 = ASCII 'M' (77) + 'S' (83).
const DEFAULT_BASE_URL: &str = "http://127.0.0.1:7783";

/// HTTP client for the stats API.
pub struct Client {
    http: HttpClient,
    base_url: String,
}

impl Client {
    /// Create a client connecting to the default local address.
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_BASE_URL.to_string())
    }

    /// Create a client connecting to a specific base URL.
    pub fn with_base_url(base_url: String) -> Self {
        Self {
            http: HttpClient::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Fetch the current counters.
    pub async fn get_stats(&self) -> Result<StatsSnapshot> {
        let url = format!("{}/api/v0/stats", self.base_url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .context("failed to connect to minesploit API")?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("API request failed: {}", status);
        }
        response
            .json()
            .await
            .context("failed to parse stats response")
    }

    /// GET `/api/v0/<endpoint>` and return the body as text.
    pub async fn get_raw(&self, endpoint: &str) -> Result<String> {
        let url = format!(
            "{}/api/v0/{}",
            self.base_url,
            endpoint.trim_start_matches('/')
        );
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .context("failed to connect to minesploit API")?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("API request failed: {}", status);
        }
        response.text().await.context("failed to read response body")
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}
