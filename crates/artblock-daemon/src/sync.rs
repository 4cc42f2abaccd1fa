use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::Context;
use artblock_proto::config::{Config, LIST_ENDPOINT};
use serde::Deserialize;
use tracing::{info, warn};

use crate::store::BlacklistStore;

/// Response body of the community list endpoint.
#[derive(Debug, Deserialize)]
struct ListPayload {
    artists: Vec<String>,
}

/// What a sync attempt reports back to whoever triggered it.
#[derive(Debug, Clone, Copy)]
pub struct SyncOutcome {
    pub success: bool,
    /// Number of names the backend returned.
    pub count: Option<u64>,
}

/// Fetches the community blacklist from the backend and swaps it into the
/// store.  A failed fetch leaves the store untouched, including `lastSync`.
pub struct SyncClient {
    client: reqwest::Client,
    list_url: String,
}

impl SyncClient {
    pub fn new(config: &Config) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.api.timeout_secs))
            .user_agent(concat!("artblock/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("failed to build reqwest client for sync");

        Self {
            client,
            list_url: format!(
                "{}{}",
                config.api.base_url.trim_end_matches('/'),
                LIST_ENDPOINT
            ),
        }
    }

    pub async fn sync(&self, store: &BlacklistStore) -> SyncOutcome {
        let artists = match self.fetch_list().await {
            Ok(artists) => artists,
            Err(e) => {
                warn!("sync: community fetch failed: {e:#}");
                return SyncOutcome {
                    success: false,
                    count: None,
                };
            }
        };

        let count = artists.len() as u64;
        let names: BTreeSet<String> = artists.into_iter().map(|a| a.to_lowercase()).collect();
        let synced_at = chrono::Utc::now().timestamp_millis();

        match store.replace_community(names, synced_at).await {
            Ok(()) => {
                info!("sync: community list updated ({count} artists)");
                SyncOutcome {
                    success: true,
                    count: Some(count),
                }
            }
            Err(e) => {
                warn!("sync: failed to persist community list: {e:#}");
                SyncOutcome {
                    success: false,
                    count: None,
                }
            }
        }
    }

    async fn fetch_list(&self) -> anyhow::Result<Vec<String>> {
        let response = self
            .client
            .get(&self.list_url)
            .header("Accept", "application/json")
            .send()
            .await
            .context("request failed")?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("backend returned {status}");
        }

        let payload: ListPayload = response.json().await.context("invalid list payload")?;
        Ok(payload.artists)
    }
}
