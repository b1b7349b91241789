use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct GuildChannel {
    pub guild_id: u64,
    pub channel_id: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DiscordConfig {
    pub token: String,
    #[serde(default)]
    pub channels: Vec<GuildChannel>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OsuConfig {
    pub client_id: u64,
    pub client_secret: String,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default = "default_score_rank_url")]
    pub score_rank_url: String,
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StreamConfig {
    pub url: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TrackingConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    #[serde(default = "default_pp_threshold")]
    pub pp_threshold: f64,
    #[serde(default = "default_not_playing_skip")]
    pub not_playing_skip: u64,
    #[serde(default = "default_max_scores")]
    pub max_scores: u32,
    #[serde(default = "default_event_repeat_window")]
    pub event_repeat_window_secs: i64,
    #[serde(default = "default_pp_retry_delay")]
    pub pp_retry_delay: u64,
    #[serde(default)]
    pub notify_empty_pp: bool,
    #[serde(default = "default_true")]
    pub enable_cache: bool,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,
    #[serde(default = "default_profiles_path")]
    pub profiles_path: String,
    #[serde(default = "default_notify_workers")]
    pub notify_workers: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub discord: DiscordConfig,
    pub osu: OsuConfig,
    pub stream: StreamConfig,
    pub tracking: TrackingConfig,
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let config_str = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&config_str)?;
        Ok(config)
    }

    /// Notification channel for a guild, if one is configured.
    pub fn channel_for_guild(&self, guild_id: u64) -> Option<u64> {
        self.discord
            .channels
            .iter()
            .find(|c| c.guild_id == guild_id)
            .map(|c| c.channel_id)
    }
}

fn default_api_url() -> String {
    "https://osu.ppy.sh/api/v2".to_string()
}

fn default_token_url() -> String {
    "https://osu.ppy.sh/oauth/token".to_string()
}

fn default_score_rank_url() -> String {
    "https://score.respektive.pw".to_string()
}

fn default_requests_per_minute() -> u32 {
    60
}

fn default_poll_interval() -> u64 {
    30
}

fn default_pp_threshold() -> f64 {
    0.13
}

fn default_not_playing_skip() -> u64 {
    10
}

fn default_max_scores() -> u32 {
    100
}

fn default_event_repeat_window() -> i64 {
    6 * 3600
}

fn default_pp_retry_delay() -> u64 {
    5
}

fn default_cache_dir() -> String {
    "cache".to_string()
}

fn default_profiles_path() -> String {
    "profiles.json".to_string()
}

fn default_notify_workers() -> usize {
    4
}

fn default_true() -> bool {
    true
}
