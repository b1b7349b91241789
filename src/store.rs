use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::RwLock;

use crate::log;
use crate::models::GameMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateMode {
    Full,
    PpOnly,
    Disabled,
}

/// One chat user's link to an external player account, plus their opt-ins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkedProfile {
    pub discord_id: u64,
    pub osu_id: u64,
    pub mode: GameMode,
    pub update_mode: UpdateMode,
    pub home_guild: Option<u64>,
    #[serde(default)]
    pub notify_leaderboard: bool,
    #[serde(default)]
    pub notify_mapping: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreData {
    profiles: HashMap<u64, LinkedProfile>,
    /// Highest score id already considered for notification, per chat user.
    watermarks: HashMap<u64, u64>,
}

/// JSON-file-backed store of linked profiles and notification watermarks.
pub struct ProfileStore {
    path: PathBuf,
    data: RwLock<StoreData>,
}

impl ProfileStore {
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let data = if Path::new(&path).exists() {
            let content = fs::read_to_string(&path).await?;
            serde_json::from_str(&content).unwrap_or_else(|e| {
                log::warn(format!("Unreadable profile store, starting empty: {}", e));
                StoreData::default()
            })
        } else {
            StoreData::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub async fn link(&self, profile: LinkedProfile) -> Result<()> {
        let mut data = self.data.write().await;
        data.profiles.insert(profile.discord_id, profile);
        self.save(&data).await
    }

    pub async fn unlink(&self, discord_id: u64) -> Result<bool> {
        let mut data = self.data.write().await;
        let removed = data.profiles.remove(&discord_id).is_some();
        data.watermarks.remove(&discord_id);
        if removed {
            self.save(&data).await?;
        }
        Ok(removed)
    }

    pub async fn get(&self, discord_id: u64) -> Option<LinkedProfile> {
        self.data.read().await.profiles.get(&discord_id).cloned()
    }

    pub async fn all(&self) -> Vec<LinkedProfile> {
        self.data.read().await.profiles.values().cloned().collect()
    }

    pub async fn watermark(&self, discord_id: u64) -> Option<u64> {
        self.data.read().await.watermarks.get(&discord_id).copied()
    }

    /// Raise the watermark for a user; never lowers an existing one.
    pub async fn set_watermark(&self, discord_id: u64, score_id: u64) -> Result<()> {
        let mut data = self.data.write().await;
        let entry = data.watermarks.entry(discord_id).or_insert(0);
        if score_id <= *entry {
            return Ok(());
        }
        *entry = score_id;
        self.save(&data).await
    }

    /// external-player-id -> chat-user-ids, for routing stream events.
    pub async fn reverse_index(&self) -> HashMap<u64, Vec<u64>> {
        let data = self.data.read().await;
        let mut index: HashMap<u64, Vec<u64>> = HashMap::new();
        for profile in data.profiles.values() {
            index
                .entry(profile.osu_id)
                .or_default()
                .push(profile.discord_id);
        }
        index
    }

    async fn save(&self, data: &StoreData) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        fs::write(&self.path, serde_json::to_string_pretty(data)?).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(discord_id: u64, osu_id: u64) -> LinkedProfile {
        LinkedProfile {
            discord_id,
            osu_id,
            mode: GameMode::Osu,
            update_mode: UpdateMode::Full,
            home_guild: Some(1),
            notify_leaderboard: true,
            notify_mapping: false,
        }
    }

    #[tokio::test]
    async fn test_link_unlink_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profiles.json");

        let store = ProfileStore::load(&path).await.unwrap();
        store.link(profile(10, 200)).await.unwrap();
        store.set_watermark(10, 555).await.unwrap();

        // Reload from disk to prove persistence.
        let reloaded = ProfileStore::load(&path).await.unwrap();
        assert_eq!(reloaded.get(10).await.unwrap().osu_id, 200);
        assert_eq!(reloaded.watermark(10).await, Some(555));

        assert!(reloaded.unlink(10).await.unwrap());
        assert!(reloaded.get(10).await.is_none());
        assert_eq!(reloaded.watermark(10).await, None);
        assert!(!reloaded.unlink(10).await.unwrap());
    }

    #[tokio::test]
    async fn test_watermark_never_lowers() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProfileStore::load(dir.path().join("p.json")).await.unwrap();
        store.link(profile(1, 2)).await.unwrap();

        store.set_watermark(1, 100).await.unwrap();
        store.set_watermark(1, 50).await.unwrap();
        assert_eq!(store.watermark(1).await, Some(100));
    }

    #[tokio::test]
    async fn test_reverse_index_groups_subscribers() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProfileStore::load(dir.path().join("p.json")).await.unwrap();
        store.link(profile(1, 777)).await.unwrap();
        store.link(profile(2, 777)).await.unwrap();
        store.link(profile(3, 888)).await.unwrap();

        let index = store.reverse_index().await;
        let mut subs = index.get(&777).cloned().unwrap();
        subs.sort();
        assert_eq!(subs, vec![1, 2]);
        assert_eq!(index.get(&888).cloned().unwrap(), vec![3]);
    }
}
