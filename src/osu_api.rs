use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Result, anyhow};
use chrono::Duration as ChronoDuration;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;
use tokio::time::{Duration, sleep};

use crate::config::OsuConfig;
use crate::log;
use crate::models::{GameMode, RecentEvent, Score};

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

const API_VERSION: &str = "20220705";
const PARSE_RETRIES: u32 = 3;
const TOKEN_RETRY_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BeatmapUserScore {
    pub position: u32,
    pub score: Score,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScoreRank {
    pub rank: u64,
}

/// OAuth'd client for the external service. One instance is shared by the
/// polling loop, stream verification, and ad hoc queries so that the request
/// budget is enforced in a single place: callers wait for a limiter slot,
/// they never see a rate-limit error.
pub struct OsuClient {
    cfg: OsuConfig,
    http: reqwest::Client,
    token: RwLock<Option<String>>,
    limiter: DirectRateLimiter,
    refresh_started: AtomicBool,
}

impl OsuClient {
    pub fn new(cfg: OsuConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        let quota = Quota::per_minute(
            NonZeroU32::new(cfg.requests_per_minute)
                .ok_or_else(|| anyhow!("requests_per_minute must be non-zero"))?,
        );

        Ok(Self {
            cfg,
            http,
            token: RwLock::new(None),
            limiter: RateLimiter::direct(quota),
            refresh_started: AtomicBool::new(false),
        })
    }

    /// Start the background token-refresh task, once. Refreshes shortly
    /// before expiry; a failed exchange retries at a fixed delay, forever.
    pub fn ensure_token_task(self: &Arc<Self>) {
        if self.refresh_started.swap(true, Ordering::SeqCst) {
            return;
        }

        let client = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match client.exchange_token().await {
                    Ok(expires_in) => {
                        log::success("Obtained API access token");
                        let refresh_in = expires_in.saturating_sub(30).max(10);
                        sleep(Duration::from_secs(refresh_in)).await;
                    }
                    Err(e) => {
                        log::error(format!(
                            "Token refresh failed: {}. Retrying in {:?}...",
                            e, TOKEN_RETRY_DELAY
                        ));
                        sleep(TOKEN_RETRY_DELAY).await;
                    }
                }
            }
        });
    }

    async fn exchange_token(&self) -> Result<u64> {
        let resp: TokenResponse = self
            .http
            .post(&self.cfg.token_url)
            .json(&serde_json::json!({
                "grant_type": "client_credentials",
                "client_id": self.cfg.client_id,
                "client_secret": self.cfg.client_secret,
                "scope": "public",
            }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        *self.token.write().await = Some(resp.access_token);
        Ok(resp.expires_in)
    }

    /// GET with bearer auth behind the shared limiter. Returns `Ok(None)`
    /// immediately when no token is held, and after `PARSE_RETRIES` failed
    /// parses; network errors propagate to the caller's per-tick handling.
    async fn get<T: DeserializeOwned>(&self, url: &str) -> Result<Option<T>> {
        let Some(token) = self.token.read().await.clone() else {
            return Ok(None);
        };

        for attempt in 1..=PARSE_RETRIES {
            self.limiter.until_ready().await;

            let resp = self
                .http
                .get(url)
                .bearer_auth(&token)
                .header("x-api-version", API_VERSION)
                .send()
                .await?;

            if resp.status() == reqwest::StatusCode::NOT_FOUND {
                return Ok(None);
            }
            let resp = resp.error_for_status()?;

            match resp.json::<T>().await {
                Ok(value) => return Ok(Some(value)),
                Err(e) => log::warn(format!(
                    "Unexpected payload from {} (attempt {}/{}): {}",
                    url, attempt, PARSE_RETRIES, e
                )),
            }
        }

        Ok(None)
    }

    pub async fn get_user(&self, osu_id: u64, mode: GameMode) -> Result<Option<crate::models::User>> {
        let url = format!(
            "{}/users/{}/{}?key=id",
            self.cfg.api_url,
            osu_id,
            mode.as_str()
        );
        self.get(&url).await
    }

    pub async fn get_user_best(
        &self,
        osu_id: u64,
        mode: GameMode,
        limit: u32,
    ) -> Result<Vec<Score>> {
        let url = format!(
            "{}/users/{}/scores/best?mode={}&limit={}",
            self.cfg.api_url,
            osu_id,
            mode.as_str(),
            limit
        );
        Ok(self.get(&url).await?.unwrap_or_default())
    }

    pub async fn get_user_recent_activity(&self, osu_id: u64) -> Result<Vec<RecentEvent>> {
        let url = format!("{}/users/{}/recent_activity?limit=50", self.cfg.api_url, osu_id);
        Ok(self.get(&url).await?.unwrap_or_default())
    }

    pub async fn get_user_beatmap_score(
        &self,
        beatmap_id: u64,
        osu_id: u64,
        mode: GameMode,
    ) -> Result<Option<BeatmapUserScore>> {
        let url = format!(
            "{}/beatmaps/{}/scores/users/{}?mode={}",
            self.cfg.api_url,
            beatmap_id,
            osu_id,
            mode.as_str()
        );
        self.get(&url).await
    }

    pub async fn get_beatmapset(&self, set_id: u64) -> Result<Option<crate::models::Beatmapset>> {
        let url = format!("{}/beatmapsets/{}", self.cfg.api_url, set_id);
        self.get(&url).await
    }

    pub async fn lookup_beatmap(&self, beatmap_id: u64) -> Result<Option<crate::models::Beatmap>> {
        let url = format!("{}/beatmaps/{}", self.cfg.api_url, beatmap_id);
        self.get(&url).await
    }

    /// Ranked-score leaderboard position, from the secondary public endpoint.
    /// Unauthenticated, but still pays into the shared request budget.
    pub async fn get_score_rank(&self, osu_id: u64, mode: GameMode) -> Result<Option<ScoreRank>> {
        self.limiter.until_ready().await;
        let url = format!(
            "{}/u/{}?mode={}",
            self.cfg.score_rank_url,
            osu_id,
            mode.as_str()
        );
        let ranks: Vec<ScoreRank> = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(ranks.into_iter().next())
    }
}

/// A profile/beatmap link, either generation of URL format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeatmapLink {
    Map { id: u64, mode: Option<GameMode> },
    Set { id: u64, mode: Option<GameMode> },
}

/// Parse the two generations of beatmap links:
/// legacy `/b/<id>` and `/s/<id>` (optional `?m=<mode>`), and current
/// `/beatmapsets/<set>#<mode>/<id>` and `/beatmaps/<id>`.
pub fn parse_beatmap_url(url: &str) -> Result<BeatmapLink> {
    let (rest, fragment) = match url.split_once('#') {
        Some((a, b)) => (a, Some(b)),
        None => (url, None),
    };
    let (path, query) = match rest.split_once('?') {
        Some((a, b)) => (a, Some(b)),
        None => (rest, None),
    };

    let mode_from_query = query.and_then(|q| {
        q.split('&')
            .find_map(|pair| pair.strip_prefix("m="))
            .and_then(GameMode::from_str)
    });

    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let last_two = match segments.len() {
        0 | 1 => return Err(anyhow!("Unparseable beatmap URL: {}", url)),
        n => (segments[n - 2], segments[n - 1]),
    };

    match last_two {
        ("b", id) => Ok(BeatmapLink::Map {
            id: id.parse()?,
            mode: mode_from_query,
        }),
        ("s", id) => Ok(BeatmapLink::Set {
            id: id.parse()?,
            mode: mode_from_query,
        }),
        ("beatmaps", id) => Ok(BeatmapLink::Map {
            id: id.parse()?,
            mode: None,
        }),
        ("beatmapsets", id) => {
            let set_id: u64 = id.parse()?;
            match fragment {
                Some(frag) => {
                    let (mode_str, map_id) = frag
                        .split_once('/')
                        .ok_or_else(|| anyhow!("Unparseable beatmap URL: {}", url))?;
                    Ok(BeatmapLink::Map {
                        id: map_id.parse()?,
                        mode: GameMode::from_str(mode_str),
                    })
                }
                None => Ok(BeatmapLink::Set {
                    id: set_id,
                    mode: mode_from_query,
                }),
            }
        }
        _ => Err(anyhow!("Unparseable beatmap URL: {}", url)),
    }
}

/// Best-effort join between a scoreboard-rank activity event and the score
/// that produced it. The two feeds share no key, so require beatmap-id and
/// rank-label equality plus sub-minute time proximity.
pub fn rank_from_events<'a>(event: &RecentEvent, scores: &'a [Score]) -> Option<&'a Score> {
    let beatmap = event.beatmap.as_ref()?;
    let link = parse_beatmap_url(&beatmap.url).ok()?;
    let BeatmapLink::Map { id: beatmap_id, .. } = link else {
        return None;
    };
    let label = event.score_rank.as_deref()?;

    scores.iter().find(|s| {
        s.beatmap_id == beatmap_id
            && s.rank == label
            && (s.ended_at - event.created_at).abs() < ChronoDuration::seconds(60)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::models::EventBeatmap;

    #[test]
    fn test_parse_legacy_beatmap_link() {
        let link = parse_beatmap_url("https://osu.ppy.sh/b/129891?m=2").unwrap();
        assert_eq!(
            link,
            BeatmapLink::Map {
                id: 129891,
                mode: Some(GameMode::Fruits)
            }
        );
    }

    #[test]
    fn test_parse_legacy_set_link() {
        let link = parse_beatmap_url("https://osu.ppy.sh/s/39804").unwrap();
        assert_eq!(
            link,
            BeatmapLink::Set {
                id: 39804,
                mode: None
            }
        );
    }

    #[test]
    fn test_parse_current_set_with_difficulty() {
        let link = parse_beatmap_url("https://osu.ppy.sh/beatmapsets/163112#osu/332532").unwrap();
        assert_eq!(
            link,
            BeatmapLink::Map {
                id: 332532,
                mode: Some(GameMode::Osu)
            }
        );
    }

    #[test]
    fn test_parse_current_set_only() {
        let link = parse_beatmap_url("https://osu.ppy.sh/beatmapsets/163112").unwrap();
        assert_eq!(
            link,
            BeatmapLink::Set {
                id: 163112,
                mode: None
            }
        );
    }

    #[test]
    fn test_parse_current_beatmap_link() {
        let link = parse_beatmap_url("https://osu.ppy.sh/beatmaps/332532").unwrap();
        assert_eq!(
            link,
            BeatmapLink::Map {
                id: 332532,
                mode: None
            }
        );
    }

    #[test]
    fn test_parse_relative_event_link() {
        let link = parse_beatmap_url("/b/118068?m=0").unwrap();
        assert_eq!(
            link,
            BeatmapLink::Map {
                id: 118068,
                mode: Some(GameMode::Osu)
            }
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_beatmap_url("https://osu.ppy.sh/users/124493").is_err());
        assert!(parse_beatmap_url("not a url").is_err());
        assert!(parse_beatmap_url("https://osu.ppy.sh/b/notanumber").is_err());
    }

    fn rank_event(url: &str, label: &str, created_at: chrono::DateTime<Utc>) -> RecentEvent {
        RecentEvent {
            id: 1,
            created_at,
            event_type: "rank".to_string(),
            beatmap: Some(EventBeatmap {
                title: "map".to_string(),
                url: url.to_string(),
            }),
            beatmapset: None,
            score_rank: Some(label.to_string()),
            rank: Some(12),
            mode: Some(GameMode::Osu),
            approval: None,
        }
    }

    fn score_on(beatmap_id: u64, rank: &str, ended_at: chrono::DateTime<Utc>) -> Score {
        Score {
            id: 9,
            user_id: 1,
            beatmap_id,
            mode: GameMode::Osu,
            pp: Some(200.0),
            accuracy: 0.99,
            max_combo: 700,
            score: 2_000_000,
            rank: rank.to_string(),
            mods: vec![],
            ended_at,
            beatmap: None,
            beatmapset: None,
        }
    }

    #[test]
    fn test_rank_from_events_matches_within_window() {
        let now = Utc::now();
        let event = rank_event("/b/555?m=0", "S", now);
        let scores = vec![score_on(555, "S", now + ChronoDuration::seconds(30))];
        assert_eq!(rank_from_events(&event, &scores).unwrap().id, 9);
    }

    #[test]
    fn test_rank_from_events_rejects_far_apart_times() {
        let now = Utc::now();
        let event = rank_event("/b/555?m=0", "S", now);
        let scores = vec![score_on(555, "S", now + ChronoDuration::seconds(90))];
        assert!(rank_from_events(&event, &scores).is_none());
    }

    #[test]
    fn test_rank_from_events_requires_matching_label() {
        let now = Utc::now();
        let event = rank_event("/b/555?m=0", "SS", now);
        let scores = vec![score_on(555, "S", now)];
        assert!(rank_from_events(&event, &scores).is_none());
    }
}
