//! REST client for the pipeline server.
//!
//! Two endpoints matter to a run client:
//!
//! - channel authentication (token merged into join params)
//! - run log pagination
//!
//! # Modules
//!
//! - [`types`] - request/response data types

pub mod types;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Map, Value};

use crate::constants;
use crate::session::ChannelAuthenticator;

pub use types::{ChannelAuthRequest, ChannelAuthToken, LogPage, LogQuery, PageMeta};

/// API client for the pipeline server.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    server_url: String,
    token: Option<String>,
}

impl ApiClient {
    /// Creates a new API client.
    ///
    /// # Arguments
    ///
    /// * `server_url` - Base URL of the server
    /// * `token` - Bearer token, if the server requires one
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(server_url: &str, token: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(constants::HTTP_REQUEST_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self::with_client(client, server_url, token))
    }

    /// Creates an API client with a pre-configured HTTP client.
    pub fn with_client(client: Client, server_url: &str, token: Option<String>) -> Self {
        Self {
            client,
            server_url: server_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    /// Returns the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Requests a channel token for `channel_name` on `socket_id`.
    pub async fn authenticate_channel(&self, socket_id: &str, channel_name: &str) -> Result<ChannelAuthToken> {
        let url = format!("{}{}", self.server_url, constants::CHANNEL_AUTH_PATH);
        let body = ChannelAuthRequest {
            socket_id,
            channel_name,
        };

        let response = self
            .authorize(self.client.post(&url))
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Channel auth request for {channel_name} failed"))?;

        if !response.status().is_success() {
            anyhow::bail!("Channel auth for {} failed: {}", channel_name, response.status());
        }

        let token: ChannelAuthToken = response.json().await.context("Invalid channel auth response")?;
        log::debug!("Authenticated channel {}", channel_name);
        Ok(token)
    }

    /// Fetches one page of a run's logs.
    ///
    /// # Arguments
    ///
    /// * `organization_id`, `pipeline_id`, `run_id` - the run
    /// * `query` - cursor, block filter and page size
    pub async fn run_logs(
        &self,
        organization_id: u64,
        pipeline_id: u64,
        run_id: &str,
        query: &LogQuery,
    ) -> Result<LogPage> {
        let url = format!(
            "{}/api/organizations/{}/pipelines/{}/runs/{}/logs",
            self.server_url, organization_id, pipeline_id, run_id
        );

        let response = self
            .authorize(self.client.get(&url))
            .query(query)
            .send()
            .await
            .with_context(|| format!("Failed to fetch logs of run {run_id}"))?;

        if !response.status().is_success() {
            anyhow::bail!("Failed to fetch logs of run {}: {}", run_id, response.status());
        }

        let page: LogPage = response.json().await.context("Invalid log page")?;
        log::debug!(
            "Fetched {} log entries for run {} (after: {:?})",
            page.data.len(),
            run_id,
            page.meta.after
        );
        Ok(page)
    }
}

#[async_trait]
impl ChannelAuthenticator for ApiClient {
    async fn authenticate(&self, socket_id: &str, channel_name: &str) -> Result<Map<String, Value>> {
        self.authenticate_channel(socket_id, channel_name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trailing_slash_trimmed() {
        let client = ApiClient::new("http://localhost:3000/", None).unwrap();
        assert_eq!(client.server_url(), "http://localhost:3000");
    }
}
