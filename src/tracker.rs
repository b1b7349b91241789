use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::log;
use crate::models::{RecentEvent, Score, User};

/// Point-in-time capture of a player's public stats. Two generations are
/// retained per user; a tick rotates new into old.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSnapshot {
    pub username: String,
    pub pp: f64,
    pub global_rank: Option<u64>,
    pub country_rank: Option<u64>,
    pub accuracy: f64,
    pub ranked_score: u64,
    pub is_online: bool,
    pub events: Vec<RecentEvent>,
    pub fetched_at: DateTime<Utc>,
}

impl UserSnapshot {
    pub fn from_user(user: &User, events: Vec<RecentEvent>) -> Self {
        Self {
            username: user.username.clone(),
            pp: user.statistics.pp,
            global_rank: user.statistics.global_rank,
            country_rank: user.statistics.country_rank,
            accuracy: user.statistics.hit_accuracy,
            ranked_score: user.statistics.ranked_score,
            is_online: user.is_online,
            events,
            fetched_at: Utc::now(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TrackingEntry {
    pub tick_count: u64,
    pub pending_wipe: bool,
    pub old: Option<UserSnapshot>,
    pub new: Option<UserSnapshot>,
    pub best: Vec<Score>,
}

impl TrackingEntry {
    pub fn rotate(&mut self, fresh: UserSnapshot) {
        self.old = self.new.take();
        self.new = Some(fresh);
    }

    /// An actively-playing user refreshes every tick; an idle one only every
    /// `skip` ticks, to spare the shared request budget.
    pub fn should_poll(&self, skip: u64) -> bool {
        let playing = self.new.as_ref().map(|s| s.is_online).unwrap_or(true);
        playing || skip == 0 || self.tick_count % skip == 0
    }
}

/// Process-lifetime guard against double-notifying a score reachable via
/// both the polling path and the stream path. Bounded FIFO; anything old
/// enough to be evicted is also past the recency cutoff for notification.
#[derive(Debug, Serialize, Deserialize)]
pub struct NotifiedScoreSet {
    set: HashSet<u64>,
    order: VecDeque<u64>,
    cap: usize,
}

impl Default for NotifiedScoreSet {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl NotifiedScoreSet {
    pub fn new(cap: usize) -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::new(),
            cap,
        }
    }

    pub fn contains(&self, score_id: u64) -> bool {
        self.set.contains(&score_id)
    }

    /// Claim a score id for notification. Returns true exactly once per id.
    pub fn notify_once(&mut self, score_id: u64) -> bool {
        if !self.set.insert(score_id) {
            return false;
        }
        self.order.push_back(score_id);
        while self.order.len() > self.cap {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
        true
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Tracker {
    pub entries: HashMap<u64, TrackingEntry>,
    pub notified: NotifiedScoreSet,
}

impl Tracker {
    pub fn entry(&mut self, discord_id: u64) -> &mut TrackingEntry {
        self.entries.entry(discord_id).or_default()
    }

    pub fn purge(&mut self, discord_id: u64) {
        self.entries.remove(&discord_id);
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(path, serde_json::to_string(self)?).await?;
        Ok(())
    }

    pub async fn load(path: &PathBuf) -> Self {
        match fs::read_to_string(path).await {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                log::warn(format!("Unreadable snapshot cache, starting fresh: {}", e));
                Tracker::default()
            }),
            Err(_) => Tracker::default(),
        }
    }
}
