use std::collections::BTreeSet;
use std::path::PathBuf;

use artblock_proto::protocol::StateSummary;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::warn;

/// On-disk document.  Keys match the storage area of the browser extension
/// this daemon grew out of, so an exported store stays readable by both.
/// The enable flags are optional because older stores may omit them; an
/// absent flag means enabled.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct PersistedState {
    local_blacklist: Vec<String>,
    community_blacklist: Vec<String>,
    community_enabled: Option<bool>,
    local_enabled: Option<bool>,
    device_id: Option<String>,
    last_sync: Option<i64>,
}

#[derive(Debug)]
struct StoreState {
    local: BTreeSet<String>,
    community: BTreeSet<String>,
    community_enabled: bool,
    local_enabled: bool,
    device_id: String,
    last_sync: Option<i64>,
}

/// One consistent view of the keys a membership check needs.
#[derive(Debug, Clone, Copy)]
pub struct CheckSnapshot {
    pub in_local: bool,
    pub in_community: bool,
    pub local_enabled: bool,
    pub community_enabled: bool,
}

/// Everything the settings surface shows.
#[derive(Debug, Clone)]
pub struct SettingsSnapshot {
    pub community_enabled: bool,
    pub local_enabled: bool,
    pub last_sync: Option<i64>,
    pub local: Vec<String>,
    pub community: Vec<String>,
}

/// The persistent blacklist store.  Every mutation is written to the state
/// file before the mutating call returns, so a daemon restart never loses an
/// acknowledged change.
pub struct BlacklistStore {
    state: RwLock<StoreState>,
    state_file: PathBuf,
}

impl BlacklistStore {
    /// Open the store, filling in whatever a first run is missing: the enable
    /// flags default to on and a device identifier is generated once.  Values
    /// already on disk are never overwritten.
    pub async fn open(state_file: PathBuf) -> anyhow::Result<Self> {
        let persisted = Self::load_persistent(&state_file);

        let missing_defaults = persisted.community_enabled.is_none()
            || persisted.local_enabled.is_none()
            || persisted.device_id.as_deref().map_or(true, str::is_empty);

        let state = StoreState {
            local: normalize_set(persisted.local_blacklist),
            community: normalize_set(persisted.community_blacklist),
            community_enabled: persisted.community_enabled.unwrap_or(true),
            local_enabled: persisted.local_enabled.unwrap_or(true),
            device_id: match persisted.device_id {
                Some(id) if !id.is_empty() => id,
                _ => generate_device_id(),
            },
            last_sync: persisted.last_sync,
        };

        let store = Self {
            state: RwLock::new(state),
            state_file,
        };
        if missing_defaults {
            store.save().await?;
        }
        Ok(store)
    }

    pub async fn check_snapshot(&self, name_lower: &str) -> CheckSnapshot {
        let state = self.state.read().await;
        CheckSnapshot {
            in_local: state.local.contains(name_lower),
            in_community: state.community.contains(name_lower),
            local_enabled: state.local_enabled,
            community_enabled: state.community_enabled,
        }
    }

    /// Add a name to the local blacklist.  Returns `false` without touching
    /// the file when the name is already present.  `name_lower` must be
    /// lowercased by the caller.
    pub async fn insert_local(&self, name_lower: &str) -> anyhow::Result<bool> {
        {
            let mut state = self.state.write().await;
            if !state.local.insert(name_lower.to_string()) {
                return Ok(false);
            }
        }
        self.save().await?;
        Ok(true)
    }

    /// Replace the whole community list and stamp the sync time, as one
    /// persisted change.  A failed fetch must not call this.
    pub async fn replace_community(
        &self,
        names: BTreeSet<String>,
        synced_at: i64,
    ) -> anyhow::Result<()> {
        {
            let mut state = self.state.write().await;
            state.community = names;
            state.last_sync = Some(synced_at);
        }
        self.save().await
    }

    pub async fn set_flags(
        &self,
        community_enabled: bool,
        local_enabled: bool,
    ) -> anyhow::Result<()> {
        {
            let mut state = self.state.write().await;
            state.community_enabled = community_enabled;
            state.local_enabled = local_enabled;
        }
        self.save().await
    }

    pub async fn settings(&self) -> SettingsSnapshot {
        let state = self.state.read().await;
        SettingsSnapshot {
            community_enabled: state.community_enabled,
            local_enabled: state.local_enabled,
            last_sync: state.last_sync,
            local: state.local.iter().cloned().collect(),
            community: state.community.iter().cloned().collect(),
        }
    }

    pub async fn summary(&self) -> StateSummary {
        let state = self.state.read().await;
        StateSummary {
            local_count: state.local.len(),
            community_count: state.community.len(),
            community_enabled: state.community_enabled,
            local_enabled: state.local_enabled,
            last_sync: state.last_sync,
        }
    }

    pub async fn device_id(&self) -> String {
        self.state.read().await.device_id.clone()
    }

    async fn save(&self) -> anyhow::Result<()> {
        let persisted = {
            let state = self.state.read().await;
            PersistedState {
                local_blacklist: state.local.iter().cloned().collect(),
                community_blacklist: state.community.iter().cloned().collect(),
                community_enabled: Some(state.community_enabled),
                local_enabled: Some(state.local_enabled),
                device_id: Some(state.device_id.clone()),
                last_sync: state.last_sync,
            }
        };

        if let Some(parent) = self.state_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_string_pretty(&persisted)?;
        tokio::fs::write(&self.state_file, json).await?;
        Ok(())
    }

    fn load_persistent(state_file: &PathBuf) -> PersistedState {
        match std::fs::read_to_string(state_file) {
            Ok(content) => match serde_json::from_str::<PersistedState>(&content) {
                Ok(persisted) => persisted,
                Err(e) => {
                    warn!("store: ignoring malformed state file {state_file:?}: {e}");
                    PersistedState::default()
                }
            },
            Err(_) => PersistedState::default(),
        }
    }
}

/// Names are stored lowercase; normalize again on load in case the file was
/// edited by hand.
fn normalize_set(names: Vec<String>) -> BTreeSet<String> {
    names.into_iter().map(|n| n.to_lowercase()).collect()
}

/// Random identifier in UUID v4 layout (version nibble 4, variant nibble
/// 8..b).  Not persisted here; `open` stores it once.
fn generate_device_id() -> String {
    use rand::Rng;

    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut rng = rand::thread_rng();
    "xxxxxxxx-xxxx-4xxx-yxxx-xxxxxxxxxxxx"
        .chars()
        .map(|c| match c {
            'x' => HEX[rng.gen_range(0..16usize)] as char,
            'y' => HEX[rng.gen_range(8..12usize)] as char,
            other => other,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_state_file() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blacklist.json");
        (dir, path)
    }

    #[tokio::test]
    async fn test_first_open_fills_defaults() {
        let (_dir, path) = temp_state_file();
        let store = BlacklistStore::open(path.clone()).await.unwrap();

        let settings = store.settings().await;
        assert!(settings.community_enabled);
        assert!(settings.local_enabled);
        assert!(settings.local.is_empty());
        assert!(settings.last_sync.is_none());

        // Defaults are persisted immediately.
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("\"communityEnabled\": true"));
        assert!(content.contains("\"deviceId\""));
    }

    #[tokio::test]
    async fn test_device_id_layout_and_stability() {
        let (_dir, path) = temp_state_file();
        let store = BlacklistStore::open(path.clone()).await.unwrap();
        let id = store.device_id().await;

        assert_eq!(id.len(), 36);
        let chars: Vec<char> = id.chars().collect();
        for pos in [8, 13, 18, 23] {
            assert_eq!(chars[pos], '-');
        }
        assert_eq!(chars[14], '4');
        assert!(matches!(chars[19], '8' | '9' | 'a' | 'b'));

        // Repeated reads and a reopen never mint a new id.
        assert_eq!(store.device_id().await, id);
        drop(store);
        let reopened = BlacklistStore::open(path).await.unwrap();
        assert_eq!(reopened.device_id().await, id);
    }

    #[tokio::test]
    async fn test_reopen_preserves_disabled_flag() {
        let (_dir, path) = temp_state_file();
        let store = BlacklistStore::open(path.clone()).await.unwrap();
        store.set_flags(false, true).await.unwrap();
        drop(store);

        let reopened = BlacklistStore::open(path).await.unwrap();
        let settings = reopened.settings().await;
        assert!(!settings.community_enabled);
        assert!(settings.local_enabled);
    }

    #[tokio::test]
    async fn test_insert_local_is_idempotent() {
        let (_dir, path) = temp_state_file();
        let store = BlacklistStore::open(path.clone()).await.unwrap();

        assert!(store.insert_local("drake").await.unwrap());
        assert!(!store.insert_local("drake").await.unwrap());

        let settings = store.settings().await;
        assert_eq!(settings.local, vec!["drake".to_string()]);

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.matches("drake").count(), 1);
    }

    #[tokio::test]
    async fn test_replace_community_swaps_list_and_stamps_sync() {
        let (_dir, path) = temp_state_file();
        let store = BlacklistStore::open(path).await.unwrap();

        let first: BTreeSet<String> = ["old artist".to_string()].into_iter().collect();
        store.replace_community(first, 1_000).await.unwrap();

        let second: BTreeSet<String> = ["new one".to_string(), "new two".to_string()]
            .into_iter()
            .collect();
        store.replace_community(second, 2_000).await.unwrap();

        let settings = store.settings().await;
        assert_eq!(settings.community.len(), 2);
        assert!(!settings.community.contains(&"old artist".to_string()));
        assert_eq!(settings.last_sync, Some(2_000));
    }

    #[tokio::test]
    async fn test_malformed_state_file_falls_back_to_defaults() {
        let (_dir, path) = temp_state_file();
        std::fs::write(&path, "{ not json").unwrap();

        let store = BlacklistStore::open(path).await.unwrap();
        let summary = store.summary().await;
        assert_eq!(summary.local_count, 0);
        assert!(summary.community_enabled);
        assert_eq!(store.device_id().await.len(), 36);
    }

    #[tokio::test]
    async fn test_load_normalizes_hand_edited_names() {
        let (_dir, path) = temp_state_file();
        std::fs::write(
            &path,
            r#"{"localBlacklist": ["Drake", "DRAKE", "weeknd"], "deviceId": "abc"}"#,
        )
        .unwrap();

        let store = BlacklistStore::open(path).await.unwrap();
        let snapshot = store.check_snapshot("drake").await;
        assert!(snapshot.in_local);
        assert_eq!(store.summary().await.local_count, 2);
    }
}
