//! Outbound `response_url` callbacks.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Default Slack visibility for callback messages.
pub const DEFAULT_RESPONSE_TYPE: &str = "ephemeral";

/// Body posted to a Slack `response_url`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackMessage {
    pub text: String,
    pub response_type: String,
}

/// Posts messages back to the original requester.
#[async_trait]
pub trait Callback: Send + Sync {
    async fn post(&self, url: &str, message: &CallbackMessage) -> Result<()>;
}

/// [`Callback`] backed by a shared reqwest client.
#[derive(Clone)]
pub struct ReqwestCallback {
    client: Client,
    timeout: Duration,
}

impl ReqwestCallback {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(100)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client, timeout })
    }
}

#[async_trait]
impl Callback for ReqwestCallback {
    async fn post(&self, url: &str, message: &CallbackMessage) -> Result<()> {
        let response = self
            .client
            .post(url)
            .timeout(self.timeout)
            .json(message)
            .send()
            .await
            .context("Callback request failed")?;

        let status = response.status();
        response
            .error_for_status()
            .context("Callback rejected")?;

        info!(status = status.as_u16(), "callback_posted");
        Ok(())
    }
}
