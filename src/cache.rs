use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::fs;

use crate::log;
use crate::models::{Beatmap, Beatmapset, RankStatus};

/// Entries written before this date predate the current cache schema and are
/// unconditionally stale.
fn schema_epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

/// How long a cached map stays valid, keyed by its lifecycle status. Ranked
/// and approved maps never change, so they never expire.
pub fn is_cache_valid(status: RankStatus, time_cached: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    if time_cached < schema_epoch() {
        return false;
    }

    let age = now - time_cached;
    match status {
        RankStatus::Loved => age <= Duration::days(30),
        RankStatus::Pending | RankStatus::Graveyard | RankStatus::Wip | RankStatus::Qualified => {
            age <= Duration::days(7)
        }
        RankStatus::Ranked | RankStatus::Approved => true,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedEntry<T> {
    time_cached: DateTime<Utc>,
    data: T,
}

/// File-backed beatmap/beatmapset cache, one JSON blob per object. Stale
/// entries are deleted wholesale and refetched, never patched in place.
pub struct MapCache {
    dir: PathBuf,
}

impl MapCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn beatmap_path(&self, id: u64) -> PathBuf {
        self.dir.join("beatmaps").join(format!("{}.json", id))
    }

    fn beatmapset_path(&self, id: u64) -> PathBuf {
        self.dir.join("beatmapsets").join(format!("{}.json", id))
    }

    pub async fn load_beatmap(&self, id: u64) -> Option<Beatmap> {
        let path = self.beatmap_path(id);
        let entry: CachedEntry<Beatmap> = self.read_entry(&path).await?;
        if is_cache_valid(entry.data.status, entry.time_cached, Utc::now()) {
            Some(entry.data)
        } else {
            self.evict(&path).await;
            None
        }
    }

    pub async fn load_beatmapset(&self, id: u64) -> Option<Beatmapset> {
        let path = self.beatmapset_path(id);
        let entry: CachedEntry<Beatmapset> = self.read_entry(&path).await?;
        if is_cache_valid(entry.data.status, entry.time_cached, Utc::now()) {
            Some(entry.data)
        } else {
            self.evict(&path).await;
            None
        }
    }

    pub async fn store_beatmap(&self, beatmap: &Beatmap) -> Result<()> {
        self.write_entry(&self.beatmap_path(beatmap.id), beatmap)
            .await
    }

    /// Persist a mapset and every member difficulty in one pass.
    pub async fn store_beatmapset(&self, set: &Beatmapset) -> Result<()> {
        self.write_entry(&self.beatmapset_path(set.id), set).await?;
        for beatmap in &set.beatmaps {
            self.store_beatmap(beatmap).await?;
        }
        Ok(())
    }

    async fn read_entry<T: DeserializeOwned>(&self, path: &Path) -> Option<CachedEntry<T>> {
        let content = fs::read_to_string(path).await.ok()?;
        match serde_json::from_str(&content) {
            Ok(entry) => Some(entry),
            Err(e) => {
                log::warn(format!("Unreadable cache entry {}: {}", path.display(), e));
                self.evict(path).await;
                None
            }
        }
    }

    async fn write_entry<T: Serialize>(&self, path: &Path, data: &T) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let entry = CachedEntry {
            time_cached: Utc::now(),
            data,
        };
        fs::write(path, serde_json::to_string(&entry)?).await?;
        Ok(())
    }

    async fn evict(&self, path: &Path) {
        if let Err(e) = fs::remove_file(path).await {
            log::warn(format!("Failed to evict cache entry {}: {}", path.display(), e));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::GameMode;

    fn beatmap(id: u64, status: RankStatus) -> Beatmap {
        Beatmap {
            id,
            beatmapset_id: 1,
            mode: GameMode::Osu,
            version: "Insane".to_string(),
            difficulty_rating: 5.1,
            status,
            total_length: 120,
            bpm: 200.0,
            max_combo: Some(1200),
        }
    }

    #[test]
    fn test_loved_valid_for_30_days() {
        let now = Utc::now();
        assert!(is_cache_valid(RankStatus::Loved, now - Duration::days(29), now));
        assert!(!is_cache_valid(RankStatus::Loved, now - Duration::days(31), now));
    }

    #[test]
    fn test_unstable_statuses_valid_for_7_days() {
        let now = Utc::now();
        for status in [
            RankStatus::Pending,
            RankStatus::Graveyard,
            RankStatus::Wip,
            RankStatus::Qualified,
        ] {
            assert!(is_cache_valid(status, now - Duration::days(6), now));
            assert!(!is_cache_valid(status, now - Duration::days(8), now));
        }
    }

    #[test]
    fn test_ranked_never_expires() {
        let now = Utc::now();
        assert!(is_cache_valid(RankStatus::Ranked, now - Duration::days(700), now));
        assert!(is_cache_valid(RankStatus::Approved, now - Duration::days(700), now));
    }

    #[test]
    fn test_pre_epoch_entries_always_invalid() {
        let now = Utc::now();
        let ancient = Utc.with_ymd_and_hms(2023, 12, 31, 23, 59, 59).unwrap();
        assert!(!is_cache_valid(RankStatus::Ranked, ancient, now));
    }

    #[tokio::test]
    async fn test_store_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MapCache::new(dir.path());

        let map = beatmap(42, RankStatus::Ranked);
        cache.store_beatmap(&map).await.unwrap();

        let loaded = cache.load_beatmap(42).await.unwrap();
        assert_eq!(loaded.id, 42);
        assert_eq!(loaded.version, "Insane");
        assert!(cache.load_beatmap(43).await.is_none());
    }

    #[tokio::test]
    async fn test_stale_entry_is_deleted_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MapCache::new(dir.path());

        let map = beatmap(7, RankStatus::Graveyard);
        let path = cache.beatmap_path(7);
        fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        let entry = CachedEntry {
            time_cached: Utc::now() - Duration::days(8),
            data: map,
        };
        fs::write(&path, serde_json::to_string(&entry).unwrap())
            .await
            .unwrap();

        assert!(cache.load_beatmap(7).await.is_none());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_store_beatmapset_caches_difficulties() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MapCache::new(dir.path());

        let set = Beatmapset {
            id: 99,
            artist: "artist".to_string(),
            title: "title".to_string(),
            creator: "creator".to_string(),
            status: RankStatus::Ranked,
            beatmaps: vec![beatmap(101, RankStatus::Ranked), beatmap(102, RankStatus::Ranked)],
        };
        cache.store_beatmapset(&set).await.unwrap();

        assert!(cache.load_beatmapset(99).await.is_some());
        assert!(cache.load_beatmap(101).await.is_some());
        assert!(cache.load_beatmap(102).await.is_some());
    }
}
