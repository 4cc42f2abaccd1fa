use std::sync::Arc;

use artblock_proto::protocol::ListSource;
use tracing::{info, warn};

use crate::flag::FlagClient;
use crate::store::BlacklistStore;

/// Result of a membership check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Verdict {
    pub blocked: bool,
    pub source: Option<ListSource>,
}

impl Verdict {
    fn clear() -> Self {
        Self {
            blocked: false,
            source: None,
        }
    }

    fn blocked_by(source: ListSource) -> Self {
        Self {
            blocked: true,
            source: Some(source),
        }
    }
}

/// Blocking decisions: case-insensitive membership checks and the block
/// operation itself.
pub struct Engine {
    store: Arc<BlacklistStore>,
    flag: Arc<FlagClient>,
}

impl Engine {
    pub fn new(store: Arc<BlacklistStore>, flag: Arc<FlagClient>) -> Self {
        Self { store, flag }
    }

    /// Check one artist name against both lists.  The local list wins when a
    /// name is on both; a disabled list never matches.
    pub async fn check(&self, artist: &str) -> Verdict {
        let needle = artist.to_lowercase();
        let snapshot = self.store.check_snapshot(&needle).await;

        if snapshot.local_enabled && snapshot.in_local {
            Verdict::blocked_by(ListSource::Local)
        } else if snapshot.community_enabled && snapshot.in_community {
            Verdict::blocked_by(ListSource::Community)
        } else {
            Verdict::clear()
        }
    }

    /// Block an artist: store the lowercased name locally, then report the
    /// original spelling to the backend from a detached task.  Returns whether
    /// the local list actually changed.  The report fires even for an artist
    /// that was already listed.
    pub async fn block(&self, artist: &str) -> bool {
        let needle = artist.to_lowercase();
        let inserted = match self.store.insert_local(&needle).await {
            Ok(inserted) => inserted,
            Err(e) => {
                warn!("engine: failed to persist block of '{artist}': {e:#}");
                false
            }
        };
        if inserted {
            info!("engine: blocked '{artist}'");
        }

        let flag = Arc::clone(&self.flag);
        let device_id = self.store.device_id().await;
        let artist = artist.to_string();
        tokio::spawn(async move {
            flag.flag(&artist, &device_id).await;
        });

        inserted
    }
}
