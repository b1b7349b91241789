use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GameMode {
    Osu,
    Taiko,
    Fruits,
    Mania,
}

impl GameMode {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "osu" | "0" => Some(GameMode::Osu),
            "taiko" | "1" => Some(GameMode::Taiko),
            "fruits" | "catch" | "2" => Some(GameMode::Fruits),
            "mania" | "3" => Some(GameMode::Mania),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            GameMode::Osu => "osu",
            GameMode::Taiko => "taiko",
            GameMode::Fruits => "fruits",
            GameMode::Mania => "mania",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RankStatus {
    Graveyard,
    Wip,
    Pending,
    Ranked,
    Approved,
    Qualified,
    Loved,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UserStatistics {
    pub pp: f64,
    pub global_rank: Option<u64>,
    pub country_rank: Option<u64>,
    pub hit_accuracy: f64,
    pub ranked_score: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct User {
    pub id: u64,
    pub username: String,
    #[serde(default)]
    pub is_online: bool,
    pub statistics: UserStatistics,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Beatmap {
    pub id: u64,
    pub beatmapset_id: u64,
    pub mode: GameMode,
    pub version: String,
    pub difficulty_rating: f64,
    pub status: RankStatus,
    pub total_length: u32,
    pub bpm: f64,
    #[serde(default)]
    pub max_combo: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Beatmapset {
    pub id: u64,
    pub artist: String,
    pub title: String,
    pub creator: String,
    pub status: RankStatus,
    #[serde(default)]
    pub beatmaps: Vec<Beatmap>,
}

impl Beatmapset {
    /// Highest-difficulty member beatmap, the one a set-only link resolves to.
    pub fn top_difficulty(&self) -> Option<&Beatmap> {
        self.beatmaps.iter().max_by(|a, b| {
            a.difficulty_rating
                .partial_cmp(&b.difficulty_rating)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Score {
    pub id: u64,
    pub user_id: u64,
    pub beatmap_id: u64,
    pub mode: GameMode,
    #[serde(default)]
    pub pp: Option<f64>,
    pub accuracy: f64,
    pub max_combo: u32,
    pub score: u64,
    pub rank: String,
    #[serde(default)]
    pub mods: Vec<String>,
    pub ended_at: DateTime<Utc>,
    #[serde(default)]
    pub beatmap: Option<Beatmap>,
    #[serde(default)]
    pub beatmapset: Option<Beatmapset>,
}

impl Score {
    pub fn pp_value(&self) -> f64 {
        self.pp.unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EventBeatmap {
    pub title: String,
    pub url: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EventBeatmapset {
    pub title: String,
    pub url: String,
}

/// One entry of a user's public recent-activity feed.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RecentEvent {
    pub id: u64,
    pub created_at: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub beatmap: Option<EventBeatmap>,
    #[serde(default)]
    pub beatmapset: Option<EventBeatmapset>,
    #[serde(default, rename = "scoreRank")]
    pub score_rank: Option<String>,
    #[serde(default)]
    pub rank: Option<u32>,
    #[serde(default)]
    pub mode: Option<GameMode>,
    #[serde(default)]
    pub approval: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Upload,
    Update,
    Revive,
    Qualify,
    Rank,
    RankLost,
}

impl EventType {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "beatmapsetUpload" => Some(EventType::Upload),
            "beatmapsetUpdate" => Some(EventType::Update),
            "beatmapsetRevive" => Some(EventType::Revive),
            "beatmapsetApprove" => Some(EventType::Qualify),
            "rank" => Some(EventType::Rank),
            "rankLost" => Some(EventType::RankLost),
            _ => None,
        }
    }

    pub fn get_title(&self) -> &str {
        match self {
            EventType::Upload => "New beatmap submitted",
            EventType::Update => "Beatmap updated",
            EventType::Revive => "Beatmap revived from the graveyard",
            EventType::Qualify => "Beatmap qualified",
            EventType::Rank => "New leaderboard score",
            EventType::RankLost => "Lost first place",
        }
    }

    /// Whether this event concerns a beatmapset's lifecycle rather than a play.
    pub fn is_mapset_event(&self) -> bool {
        matches!(
            self,
            EventType::Upload | EventType::Update | EventType::Revive | EventType::Qualify
        )
    }
}
