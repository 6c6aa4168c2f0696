//! Remote source for interpreter binaries

use async_trait::async_trait;
use std::time::Duration;
use tracing::info;

use crate::error::{EvalError, EvalResult};

/// Placeholder substituted with the requested version in a release URL
pub const VERSION_PLACEHOLDER: &str = "{version}";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Whole request, body included; the cache lock is held meanwhile
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);

/// Fetch the raw bytes of one artifact version
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, version: &str) -> EvalResult<Vec<u8>>;
}

/// Downloads release binaries over HTTP(S)
#[derive(Clone)]
pub struct ReleaseFetcher {
    client: reqwest::Client,
    url_template: String,
}

impl ReleaseFetcher {
    pub fn new(url_template: impl Into<String>) -> EvalResult<Self> {
        Self::with_timeouts(url_template, CONNECT_TIMEOUT, DOWNLOAD_TIMEOUT)
    }

    pub fn with_timeouts(
        url_template: impl Into<String>,
        connect: Duration,
        total: Duration,
    ) -> EvalResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("playground/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(connect)
            .timeout(total)
            .build()
            .map_err(|e| EvalError::FetchFailed(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url_template: url_template.into(),
        })
    }

    pub fn url_for(&self, version: &str) -> String {
        self.url_template.replace(VERSION_PLACEHOLDER, version)
    }
}

#[async_trait]
impl Fetcher for ReleaseFetcher {
    async fn fetch(&self, version: &str) -> EvalResult<Vec<u8>> {
        let url = self.url_for(version);
        info!("Downloading {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| EvalError::FetchFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(EvalError::FetchFailed(format!(
                "bad status: {}",
                response.status()
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| EvalError::FetchFailed(e.to_string()))?;
        Ok(body.to_vec())
    }
}
