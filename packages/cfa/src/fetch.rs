use anyhow::{Context, Result};
use async_trait::async_trait;
use cfa_notify::{AchievementFetcher, AchievementSnapshot, TransportError};
use reqwest::StatusCode;
use std::time::Duration;
use tracing::debug;

/// Fetches achievements for handles from the achievements API.
pub struct HttpAchievementFetcher {
    client: reqwest::Client,
    url_base: String,
}

impl HttpAchievementFetcher {
    pub fn new(url_base: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("cfa/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            url_base: url_base.into(),
        })
    }

    fn url(&self, handle: &str) -> String {
        format!("{}{}", self.url_base, handle)
    }
}

#[async_trait]
impl AchievementFetcher for HttpAchievementFetcher {
    async fn fetch_achievements(
        &self,
        handle: &str,
    ) -> std::result::Result<AchievementSnapshot, TransportError> {
        debug!(handle, "Fetching achievements");
        let resp = self
            .client
            .get(self.url(handle))
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status();
        if status != StatusCode::OK {
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let snapshot: AchievementSnapshot = resp.json().await.map_err(transport_error)?;
        debug!(
            handle,
            count = snapshot.achievements.len(),
            "Fetched achievements"
        );
        Ok(snapshot)
    }
}

fn transport_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_decode() {
        TransportError::Decode(err.to_string())
    } else {
        TransportError::Network(err.to_string())
    }
}
