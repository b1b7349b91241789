use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use serenity::prelude::Context;
use tokio::sync::{RwLock, mpsc};
use tokio::time::{Duration, sleep};

use crate::cache::MapCache;
use crate::config::Config;
use crate::discord::DiscordMessenger;
use crate::log;
use crate::models::{EventType, RecentEvent, Score};
use crate::notify::{self, EventDecision, MapEventTracker};
use crate::osu_api::{BeatmapLink, OsuClient, parse_beatmap_url, rank_from_events};
use crate::queue::NotifyJob;
use crate::scores::{self, NewScore};
use crate::store::{LinkedProfile, ProfileStore, UpdateMode};
use crate::tracker::{Tracker, UserSnapshot};

/// Attempts to see a fresh pp gain reflected in the top-100 listing.
const PP_FETCH_ATTEMPTS: u32 = 3;
/// Upstream indexing lag before the first mapset fetch of a lifecycle event.
const MAPSET_INDEX_WAIT: Duration = Duration::from_secs(45);
const MAPSET_FETCH_ATTEMPTS: u32 = 6;
const MAPSET_FETCH_INTERVAL: Duration = Duration::from_secs(60);
/// Leaderboard-entry events are only notified for positions this good.
const LEADERBOARD_CUTOFF: u32 = 50;

/// What a tick does with a user's tracking state after the guild lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WipeStep {
  /// Lookup failed: leave everything, including any pending flag, untouched.
  Skip,
  /// Reachable: carry on with the normal update.
  Continue,
  /// First pass of confirmed absence: flag it, nothing else.
  Mark,
  /// Second consecutive pass of confirmed absence: drop all state.
  Purge,
}

/// `reachable` is `None` when the guild enumeration itself failed.
fn wipe_step(reachable: Option<bool>, pending_wipe: bool) -> WipeStep {
  match (reachable, pending_wipe) {
    (None, _) => WipeStep::Skip,
    (Some(true), _) => WipeStep::Continue,
    (Some(false), false) => WipeStep::Mark,
    (Some(false), true) => WipeStep::Purge,
  }
}

/// The one service object shared by the polling tick, the notification
/// workers, and the stream ingestion task.
pub struct TrackingService {
  pub config: Arc<Config>,
  pub client: Arc<OsuClient>,
  pub cache: MapCache,
  pub store: Arc<ProfileStore>,
  pub tracker: Arc<RwLock<Tracker>>,
  pub messenger: DiscordMessenger,
  pub map_events: RwLock<MapEventTracker>,
  pub notify_tx: mpsc::Sender<NotifyJob>,
}

impl TrackingService {
  pub fn snapshot_path(&self) -> PathBuf {
    PathBuf::from(&self.config.tracking.cache_dir).join("snapshots.json")
  }

  pub async fn start_polling(self: Arc<Self>, ctx: Arc<Context>) -> Result<()> {
    self.client.ensure_token_task();
    log::info(format!(
      "Tracking loop started (interval {}s)",
      self.config.tracking.poll_interval
    ));

    loop {
      sleep(Duration::from_secs(self.config.tracking.poll_interval)).await;
      self.tick(&ctx).await;
    }
  }

  /// One full pass over every linked profile, strictly sequential.
  pub async fn tick(&self, ctx: &Context) {
    let profiles = self.store.all().await;

    for profile in profiles {
      if profile.update_mode == UpdateMode::Disabled {
        continue;
      }
      self.update_user(ctx, &profile).await.unwrap_or_else(|e| {
        log::error(format!(
          "Update failed for user {} (osu {}): {}",
          profile.discord_id, profile.osu_id, e
        ))
      });
    }

    if self.config.tracking.enable_cache {
      let tracker = self.tracker.read().await;
      if let Err(e) = tracker.save(&self.snapshot_path()).await {
        log::error(format!("Failed to persist snapshot cache: {}", e));
      }
    }
  }

  async fn update_user(&self, ctx: &Context, profile: &LinkedProfile) -> Result<()> {
    // Wiping takes two consecutive passes of confirmed absence. A failed
    // guild lookup is indeterminate and must not advance toward a wipe.
    let reachable = match notify::shared_guilds(ctx, profile.discord_id).await {
      Ok(guilds) => Some(!guilds.is_empty()),
      Err(e) => {
        log::warn(format!(
          "Guild lookup failed for user {}, retrying next tick: {}",
          profile.discord_id, e
        ));
        None
      }
    };

    let pending = {
      let tracker = self.tracker.read().await;
      tracker
        .entries
        .get(&profile.discord_id)
        .map(|entry| entry.pending_wipe)
        .unwrap_or(false)
    };

    match wipe_step(reachable, pending) {
      WipeStep::Skip => return Ok(()),
      WipeStep::Mark => {
        self.tracker.write().await.entry(profile.discord_id).pending_wipe = true;
        return Ok(());
      }
      WipeStep::Purge => {
        log::info(format!(
          "User {} confirmed absent from every guild, purging tracking state",
          profile.discord_id
        ));
        self.tracker.write().await.purge(profile.discord_id);
        self.store.unlink(profile.discord_id).await?;
        return Ok(());
      }
      WipeStep::Continue => {}
    }

    let (first_sight, should_poll) = {
      let mut tracker = self.tracker.write().await;
      let first = !tracker.entries.contains_key(&profile.discord_id);
      let entry = tracker.entry(profile.discord_id);
      entry.pending_wipe = false;
      let poll = first || entry.should_poll(self.config.tracking.not_playing_skip);
      entry.tick_count += 1;
      (first, poll)
    };

    if !should_poll {
      return Ok(());
    }

    if first_sight {
      let mut best = self
        .client
        .get_user_best(profile.osu_id, profile.mode, self.config.tracking.max_scores)
        .await?;
      scores::sort_scores(&mut best, scores::SortBy::Pp);
      if self.store.watermark(profile.discord_id).await.is_none() {
        if let Some(max_id) = best.iter().map(|s| s.id).max() {
          self.store.set_watermark(profile.discord_id, max_id).await?;
        }
      }
      self.tracker.write().await.entry(profile.discord_id).best = best;
    }

    let Some(user) = self.client.get_user(profile.osu_id, profile.mode).await? else {
      return Ok(());
    };

    // The activity feed costs a request; skip it unless some notification
    // actually consumes it.
    let wants_events = profile.notify_leaderboard || profile.notify_mapping;
    let events = if wants_events {
      self.client.get_user_recent_activity(profile.osu_id).await?
    } else {
      Vec::new()
    };

    let snapshot = UserSnapshot::from_user(&user, events);

    let (pp_delta, added_events) = {
      let mut tracker = self.tracker.write().await;
      let entry = tracker.entry(profile.discord_id);
      entry.rotate(snapshot);
      match (&entry.old, &entry.new) {
        (Some(old), Some(new)) => (new.pp - old.pp, Self::added_events(old, new)),
        _ => return Ok(()),
      }
    };

    if pp_delta.abs() >= self.config.tracking.pp_threshold {
      self
        .notify_tx
        .send(NotifyJob::Pp {
          profile: profile.clone(),
        })
        .await?;
    }

    if !added_events.is_empty() && profile.update_mode == UpdateMode::Full {
      self
        .notify_tx
        .send(NotifyJob::RecentEvents {
          profile: profile.clone(),
          added: added_events,
        })
        .await?;
    }

    Ok(())
  }

  /// Entries of the new feed (newest-first) absent from the old one.
  fn added_events(old: &UserSnapshot, new: &UserSnapshot) -> Vec<RecentEvent> {
    new
      .events
      .iter()
      .filter(|e| !old.events.iter().any(|o| o.id == e.id))
      .cloned()
      .collect()
  }

  /// A pp gain may precede the top-100 listing catching up, so re-fetch a
  /// few times before concluding there is no attributable score.
  pub async fn run_pp_job(&self, ctx: &Context, profile: &LinkedProfile) -> Result<()> {
    let channels = notify::notify_channels(ctx, &self.config, profile.discord_id).await;
    if channels.is_empty() {
      return Ok(());
    }

    let watermark = self.store.watermark(profile.discord_id).await.unwrap_or(0);
    let mut best = Vec::new();
    let mut candidates: Vec<NewScore> = Vec::new();

    for attempt in 1..=PP_FETCH_ATTEMPTS {
      best = self
        .client
        .get_user_best(profile.osu_id, profile.mode, self.config.tracking.max_scores)
        .await?;
      // Delta annotation assumes a pp-descending listing.
      scores::sort_scores(&mut best, scores::SortBy::Pp);

      let fresh = scores::get_new_scores(&best, watermark, Utc::now());
      candidates = {
        let tracker = self.tracker.read().await;
        fresh
          .into_iter()
          .filter(|n| !tracker.notified.contains(n.score.id))
          .collect()
      };

      if !candidates.is_empty() {
        break;
      }
      if attempt < PP_FETCH_ATTEMPTS {
        sleep(Duration::from_secs(self.config.tracking.pp_retry_delay)).await;
      }
    }

    let (username, delta) = {
      let tracker = self.tracker.read().await;
      let Some(entry) = tracker.entries.get(&profile.discord_id) else {
        return Ok(());
      };
      match (&entry.old, &entry.new) {
        (Some(old), Some(new)) => (new.username.clone(), notify::delta_line(old, new)),
        (_, Some(new)) => (new.username.clone(), String::new()),
        _ => return Ok(()),
      }
    };

    if candidates.is_empty() {
      if self.config.tracking.notify_empty_pp {
        let embed = notify::delta_only_embed(&username, &delta);
        self.dispatch(ctx, &channels, embed).await;
      }
      return Ok(());
    }

    // Claim every id before anything is sent, closing the race against the
    // stream-ingestion path.
    let claimed: Vec<NewScore> = {
      let mut tracker = self.tracker.write().await;
      let claimed = candidates
        .into_iter()
        .filter(|n| tracker.notified.notify_once(n.score.id))
        .collect::<Vec<_>>();
      tracker.entry(profile.discord_id).best = best.clone();
      claimed
    };
    if claimed.is_empty() {
      return Ok(());
    }

    if let Some(max_id) = claimed.iter().map(|n| n.score.id).max() {
      self.store.set_watermark(profile.discord_id, max_id).await?;
    }

    let embed = if claimed.len() == 1 {
      let position = scores::score_position(claimed[0].score.id, &best);
      notify::score_embed(&username, &claimed[0], position, &delta)
    } else {
      notify::score_list_embed(&username, &claimed, &delta)
    };
    self.dispatch(ctx, &channels, embed).await;

    Ok(())
  }

  pub async fn run_events_job(
    &self,
    ctx: &Context,
    profile: &LinkedProfile,
    added: &[RecentEvent],
  ) -> Result<()> {
    for event in added {
      let Some(kind) = EventType::from_str(&event.event_type) else {
        continue;
      };

      if kind.is_mapset_event() && profile.notify_mapping {
        self
          .handle_mapset_event(ctx, profile, event, kind)
          .await
          .unwrap_or_else(|e| log::error(format!("Mapset event failed: {}", e)));
      } else if kind == EventType::Rank && profile.notify_leaderboard {
        self
          .handle_rank_event(ctx, profile, event)
          .await
          .unwrap_or_else(|e| log::error(format!("Leaderboard event failed: {}", e)));
      }
    }
    Ok(())
  }

  async fn handle_mapset_event(
    &self,
    ctx: &Context,
    profile: &LinkedProfile,
    event: &RecentEvent,
    kind: EventType,
  ) -> Result<()> {
    let Some(event_set) = &event.beatmapset else {
      return Ok(());
    };
    let set_id = match parse_beatmap_url(&event_set.url)? {
      BeatmapLink::Set { id, .. } => id,
      BeatmapLink::Map { id, .. } => {
        let Some(map) = self.client.lookup_beatmap(id).await? else {
          return Ok(());
        };
        map.beatmapset_id
      }
    };

    // Give the upstream indexer time to see the change, then poll for it.
    sleep(MAPSET_INDEX_WAIT).await;
    let mut set = None;
    for attempt in 1..=MAPSET_FETCH_ATTEMPTS {
      if let Some(fetched) = self.client.get_beatmapset(set_id).await? {
        set = Some(fetched);
        break;
      }
      if attempt < MAPSET_FETCH_ATTEMPTS {
        sleep(MAPSET_FETCH_INTERVAL).await;
      }
    }

    if let Some(set) = &set {
      if let Err(e) = self.cache.store_beatmapset(set).await {
        log::warn(format!("Failed to cache mapset {}: {}", set_id, e));
      }
    }

    let key = MapEventTracker::key(set_id, kind);
    let window = ChronoDuration::seconds(self.config.tracking.event_repeat_window_secs);
    let decision = self.map_events.write().await.begin(&key, Utc::now(), window);

    let count = match &decision {
      EventDecision::New => 1,
      EventDecision::Repeat { previous, count } => {
        // Replace, don't duplicate: drop the earlier announcements first.
        for (channel_id, message_id) in previous {
          self
            .messenger
            .delete_message(ctx, *channel_id, *message_id)
            .await
            .unwrap_or_else(|e| log::warn(format!("Failed to delete stale event message: {}", e)));
        }
        *count
      }
    };

    let channels = notify::notify_channels(ctx, &self.config, profile.discord_id).await;
    let embed = notify::mapset_event_embed(kind, set.as_ref(), &event_set.title, &event_set.url, count);

    let mut handles = Vec::new();
    for channel_id in channels {
      match self.messenger.send_embed(ctx, channel_id, embed.clone()).await {
        Ok(message_id) => handles.push((channel_id, message_id.get())),
        Err(e) => log::error(format!("Failed to announce mapset event: {}", e)),
      }
    }
    self.map_events.write().await.record_sent(&key, handles);

    Ok(())
  }

  async fn handle_rank_event(
    &self,
    ctx: &Context,
    profile: &LinkedProfile,
    event: &RecentEvent,
  ) -> Result<()> {
    if event.rank.map(|r| r > LEADERBOARD_CUTOFF).unwrap_or(true) {
      return Ok(());
    }
    let Some(event_map) = &event.beatmap else {
      return Ok(());
    };

    let beatmap_id = match parse_beatmap_url(&event_map.url)? {
      BeatmapLink::Map { id, .. } => id,
      BeatmapLink::Set { id, .. } => {
        let set = match self.cache.load_beatmapset(id).await {
          Some(set) => set,
          None => {
            let Some(fetched) = self.client.get_beatmapset(id).await? else {
              return Ok(());
            };
            self.cache.store_beatmapset(&fetched).await?;
            fetched
          }
        };
        match set.top_difficulty() {
          Some(map) => map.id,
          None => return Ok(()),
        }
      }
    };

    let (score, position) = match self
      .client
      .get_user_beatmap_score(beatmap_id, profile.osu_id, profile.mode)
      .await?
    {
      Some(bus) => (bus.score, bus.position),
      None => {
        // Lookup missed; fall back to the heuristic feed-to-score join
        // against the cached best list.
        let tracker = self.tracker.read().await;
        let Some(entry) = tracker.entries.get(&profile.discord_id) else {
          return Ok(());
        };
        match rank_from_events(event, &entry.best) {
          Some(score) => (score.clone(), event.rank.unwrap_or(0)),
          None => return Ok(()),
        }
      }
    };

    {
      let mut tracker = self.tracker.write().await;
      let already_known = tracker
        .entries
        .get(&profile.discord_id)
        .map(|e| e.best.iter().any(|s| s.id == score.id))
        .unwrap_or(false);
      if already_known || !tracker.notified.notify_once(score.id) {
        return Ok(());
      }
    }

    let username = {
      let tracker = self.tracker.read().await;
      tracker
        .entries
        .get(&profile.discord_id)
        .and_then(|e| e.new.as_ref())
        .map(|s| s.username.clone())
        .unwrap_or_else(|| format!("osu user {}", profile.osu_id))
    };

    let channels = notify::notify_channels(ctx, &self.config, profile.discord_id).await;
    let embed = notify::leaderboard_embed(&username, &score, position);
    self.dispatch(ctx, &channels, embed).await;

    Ok(())
  }

  /// The stream can surface plays that don't actually make the personal-best
  /// cut; re-fetch and confirm before announcing.
  pub async fn run_stream_verify(
    &self,
    ctx: &Context,
    profile: &LinkedProfile,
    score: &Score,
  ) -> Result<()> {
    let mut best = self
      .client
      .get_user_best(profile.osu_id, profile.mode, self.config.tracking.max_scores)
      .await?;
    if best.is_empty() {
      return Ok(());
    }
    scores::sort_scores(&mut best, scores::SortBy::Pp);

    if !scores::qualifies_for_top100(score, &best) {
      return Ok(());
    }

    {
      let mut tracker = self.tracker.write().await;
      if !tracker.notified.notify_once(score.id) {
        return Ok(());
      }
      tracker.entry(profile.discord_id).best = best.clone();
    }
    self.store.set_watermark(profile.discord_id, score.id).await?;

    let (username, delta) = {
      let tracker = self.tracker.read().await;
      match tracker.entries.get(&profile.discord_id) {
        Some(entry) => match (&entry.old, &entry.new) {
          (Some(old), Some(new)) => (new.username.clone(), notify::delta_line(old, new)),
          (_, Some(new)) => (new.username.clone(), String::new()),
          _ => (format!("osu user {}", profile.osu_id), String::new()),
        },
        None => (format!("osu user {}", profile.osu_id), String::new()),
      }
    };

    let channels = notify::notify_channels(ctx, &self.config, profile.discord_id).await;
    let new_score = NewScore {
      score: score.clone(),
      pp_delta: None,
    };
    let position = scores::score_position(score.id, &best);
    let embed = notify::score_embed(&username, &new_score, position, &delta);
    self.dispatch(ctx, &channels, embed).await;

    Ok(())
  }

  async fn dispatch(
    &self,
    ctx: &Context,
    channels: &[u64],
    embed: serenity::builder::CreateEmbed,
  ) {
    for channel_id in channels {
      self
        .messenger
        .send_embed(ctx, *channel_id, embed.clone())
        .await
        .map(|_| ())
        .unwrap_or_else(|e| log::error(format!("Failed to send notification: {}", e)));
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::models::{EventBeatmapset, GameMode};
  use chrono::Utc;

  fn snapshot(pp: f64, events: Vec<RecentEvent>) -> UserSnapshot {
    UserSnapshot {
      username: "cookiezi".to_string(),
      pp,
      global_rank: Some(1),
      country_rank: Some(1),
      accuracy: 99.2,
      ranked_score: 1,
      is_online: true,
      events,
      fetched_at: Utc::now(),
    }
  }

  fn event(id: u64) -> RecentEvent {
    RecentEvent {
      id,
      created_at: Utc::now(),
      event_type: "beatmapsetUpdate".to_string(),
      beatmap: None,
      beatmapset: Some(EventBeatmapset {
        title: "t".to_string(),
        url: "/s/1".to_string(),
      }),
      score_rank: None,
      rank: None,
      mode: Some(GameMode::Osu),
      approval: None,
    }
  }

  #[test]
  fn test_added_events_only_new_ids() {
    let old = snapshot(100.0, vec![event(3), event(2), event(1)]);
    let new = snapshot(100.0, vec![event(5), event(4), event(3), event(2)]);
    let added = TrackingService::added_events(&old, &new);
    let ids: Vec<u64> = added.iter().map(|e| e.id).collect();
    assert_eq!(ids, vec![5, 4]);
  }

  #[test]
  fn test_added_events_empty_when_unchanged() {
    let old = snapshot(100.0, vec![event(2), event(1)]);
    let new = snapshot(100.0, vec![event(2), event(1)]);
    assert!(TrackingService::added_events(&old, &new).is_empty());
  }

  #[test]
  fn test_failed_guild_lookup_never_advances_wipe() {
    // An outage looks like an empty guild list only if errors are conflated
    // with absence; here they must leave the flag exactly where it was.
    assert_eq!(wipe_step(None, false), WipeStep::Skip);
    assert_eq!(wipe_step(None, true), WipeStep::Skip);
  }

  #[test]
  fn test_wipe_requires_two_confirmed_absent_passes() {
    assert_eq!(wipe_step(Some(false), false), WipeStep::Mark);
    assert_eq!(wipe_step(Some(false), true), WipeStep::Purge);
  }

  #[test]
  fn test_reachable_user_resumes_normal_updates() {
    assert_eq!(wipe_step(Some(true), false), WipeStep::Continue);
    assert_eq!(wipe_step(Some(true), true), WipeStep::Continue);
  }

  #[test]
  fn test_pp_threshold_boundary_is_inclusive() {
    // Pinned decision: a delta of exactly the threshold fires.
    let threshold = 0.13f64;
    let old = snapshot(4000.0, vec![]);
    let new = snapshot(4000.13, vec![]);
    let delta = new.pp - old.pp;
    assert!(delta.abs() >= threshold);

    let below = snapshot(4000.12, vec![]);
    assert!((below.pp - old.pp).abs() < threshold);
  }
}
