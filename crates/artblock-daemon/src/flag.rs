use std::time::Duration;

use artblock_proto::config::{Config, FLAG_ENDPOINT};
use serde::Serialize;
use tracing::{debug, warn};

/// Body of a block report.  `device_id` is the anonymous per-install id, the
/// only identifying datum that ever leaves the machine.
#[derive(Debug, Serialize)]
struct FlagBody<'a> {
    artist: &'a str,
    device_id: &'a str,
}

/// Reports blocked artists to the backend so community counts grow.  Best
/// effort: failures are logged, never propagated.
pub struct FlagClient {
    client: reqwest::Client,
    flag_url: String,
}

impl FlagClient {
    pub fn new(config: &Config) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.api.timeout_secs))
            .user_agent(concat!("artblock/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("failed to build reqwest client for flag reports");

        Self {
            client,
            flag_url: format!(
                "{}{}",
                config.api.base_url.trim_end_matches('/'),
                FLAG_ENDPOINT
            ),
        }
    }

    /// Report one block.  The artist keeps its original spelling; the backend
    /// does its own normalization.
    pub async fn flag(&self, artist: &str, device_id: &str) -> bool {
        match self.post(artist, device_id).await {
            Ok(true) => {
                debug!("flag: reported '{artist}'");
                true
            }
            Ok(false) => {
                warn!("flag: backend rejected report for '{artist}'");
                false
            }
            Err(e) => {
                warn!("flag: report for '{artist}' failed: {e:#}");
                false
            }
        }
    }

    async fn post(&self, artist: &str, device_id: &str) -> anyhow::Result<bool> {
        let response = self
            .client
            .post(&self.flag_url)
            .json(&FlagBody { artist, device_id })
            .send()
            .await?;
        Ok(response.status().is_success())
    }
}
