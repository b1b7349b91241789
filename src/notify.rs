use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serenity::builder::{CreateEmbed, CreateEmbedFooter};
use serenity::http::{HttpError, StatusCode};
use serenity::model::colour::Colour;
use serenity::model::id::{GuildId, UserId};
use serenity::prelude::*;

use crate::config::Config;
use crate::log;
use crate::models::{Beatmapset, EventType, Score};
use crate::scores::{pp_if_fc_estimate, NewScore};
use crate::tracker::UserSnapshot;

/// At most this many entries in a compact multi-score listing.
const SCORE_LIST_CAP: usize = 5;

fn trunc_text(text: &str, max_len: usize) -> String {
    let char_count = text.chars().count();

    (char_count > max_len)
        .then(|| format!("{}…", text.chars().take(max_len - 1).collect::<String>()))
        .unwrap_or_else(|| text.to_string())
}

fn format_time(time: DateTime<Utc>) -> String {
    time.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

fn score_title(score: &Score) -> String {
    let map = match (&score.beatmapset, &score.beatmap) {
        (Some(set), Some(map)) => format!("{} - {} [{}]", set.artist, set.title, map.version),
        (Some(set), None) => format!("{} - {}", set.artist, set.title),
        _ => format!("beatmap {}", score.beatmap_id),
    };
    let mods = if score.mods.is_empty() {
        String::new()
    } else {
        format!(" +{}", score.mods.join(""))
    };
    format!("{}{}", trunc_text(&map, 80), mods)
}

/// The rating/rank/accuracy delta line appended to every pp notification.
pub fn delta_line(old: &UserSnapshot, new: &UserSnapshot) -> String {
    let pp_delta = new.pp - old.pp;
    let rank_part = match (old.global_rank, new.global_rank) {
        (Some(o), Some(n)) if o != n => {
            let moved = o as i64 - n as i64;
            format!(" | rank #{} ({:+})", n, moved)
        }
        (_, Some(n)) => format!(" | rank #{}", n),
        _ => String::new(),
    };
    let acc_delta = new.accuracy - old.accuracy;
    let acc_part = if acc_delta.abs() >= 0.01 {
        format!(" | acc {:.2}% ({:+.2}%)", new.accuracy, acc_delta)
    } else {
        format!(" | acc {:.2}%", new.accuracy)
    };
    format!("{:+.2}pp ({:.2}pp){}{}", pp_delta, new.pp, rank_part, acc_part)
}

/// Detailed embed for a single new personal best.
pub fn score_embed(
    username: &str,
    new_score: &NewScore,
    position: Option<usize>,
    delta: &str,
) -> CreateEmbed {
    let score = &new_score.score;
    let mut embed = CreateEmbed::new()
        .title(format!("New top score by {}", username))
        .color(Colour::from_rgb(255, 102, 170))
        .description(score_title(score))
        .field("pp", format!("{:.2}", score.pp_value()), true)
        .field("Accuracy", format!("{:.2}%", score.accuracy * 100.0), true)
        .field("Combo", format!("{}x", score.max_combo), true)
        .field("Grade", score.rank.clone(), true)
        .footer(CreateEmbedFooter::new(format_time(score.ended_at)));

    if let Some(pos) = position {
        embed = embed.field("Personal best", format!("#{}", pos), true);
    }
    if let Some(delta_pp) = new_score.pp_delta {
        embed = embed.field("Over next best", format!("{:+.2}pp", delta_pp), true);
    }
    if let Some(fc_pp) = pp_if_fc_estimate(score) {
        embed = embed.field("If FC", format!("~{:.0}pp", fc_pp), true);
    }

    embed.field("Stats", delta.to_string(), false)
}

/// Compact ranked list for several new scores at once, capped at five.
pub fn score_list_embed(username: &str, new_scores: &[NewScore], delta: &str) -> CreateEmbed {
    let lines: Vec<String> = new_scores
        .iter()
        .take(SCORE_LIST_CAP)
        .map(|n| {
            format!(
                "**{:.2}pp** {} ({:.2}%)",
                n.score.pp_value(),
                score_title(&n.score),
                n.score.accuracy * 100.0
            )
        })
        .collect();

    CreateEmbed::new()
        .title(format!("{} new top scores by {}", new_scores.len(), username))
        .color(Colour::from_rgb(255, 102, 170))
        .description(lines.join("\n"))
        .field("Stats", delta.to_string(), false)
}

/// Rating movement with no attributable score.
pub fn delta_only_embed(username: &str, delta: &str) -> CreateEmbed {
    CreateEmbed::new()
        .title(format!("{} gained pp", username))
        .color(Colour::from_rgb(120, 120, 255))
        .description(delta.to_string())
}

pub fn mapset_event_embed(
    event_type: EventType,
    set: Option<&Beatmapset>,
    fallback_title: &str,
    url: &str,
    count: u32,
) -> CreateEmbed {
    let title = if count > 1 {
        format!("{} (x{})", event_type.get_title(), count)
    } else {
        event_type.get_title().to_string()
    };

    let mut embed = CreateEmbed::new()
        .title(title)
        .color(event_color(event_type))
        .footer(CreateEmbedFooter::new(format_time(Utc::now())));

    match set {
        Some(set) => {
            embed = embed.description(format!(
                "**[{} - {}]({})** by {}",
                trunc_text(&set.artist, 40),
                trunc_text(&set.title, 60),
                url,
                set.creator
            ));
            let diffs: Vec<String> = set
                .beatmaps
                .iter()
                .map(|b| format!("[{}] {:.2}★", trunc_text(&b.version, 30), b.difficulty_rating))
                .collect();
            if !diffs.is_empty() {
                embed = embed.field("Difficulties", diffs.join("\n"), false);
            }
        }
        None => {
            embed = embed.description(format!("**[{}]({})**", trunc_text(fallback_title, 80), url));
        }
    }

    embed
}

pub fn leaderboard_embed(
    username: &str,
    score: &Score,
    position: u32,
) -> CreateEmbed {
    CreateEmbed::new()
        .title(format!("{} entered a leaderboard", username))
        .color(Colour::from_rgb(234, 179, 8))
        .description(format!("#{} on {}", position, score_title(score)))
        .field("pp", format!("{:.2}", score.pp_value()), true)
        .field("Accuracy", format!("{:.2}%", score.accuracy * 100.0), true)
        .field("Grade", score.rank.clone(), true)
        .footer(CreateEmbedFooter::new(format_time(score.ended_at)))
}

fn event_color(event_type: EventType) -> Colour {
    match event_type {
        EventType::Upload => Colour::from_rgb(34, 197, 94),
        EventType::Update => Colour::from_rgb(59, 130, 246),
        EventType::Revive => Colour::from_rgb(168, 85, 247),
        EventType::Qualify => Colour::from_rgb(239, 68, 68),
        EventType::Rank => Colour::from_rgb(234, 179, 8),
        EventType::RankLost => Colour::from_rgb(249, 115, 22),
    }
}

/// Guilds the member shares with the bot. An empty `Ok` means the user is
/// confirmed absent from every guild; any transport failure surfaces as an
/// `Err` so callers never mistake an outage for a departed user.
pub async fn shared_guilds(ctx: &Context, discord_id: u64) -> Result<Vec<u64>> {
    let guilds = ctx.http.get_guilds(None, None).await?;

    let mut shared = Vec::new();
    for guild in guilds {
        match ctx
            .http
            .get_member(GuildId::new(guild.id.get()), UserId::new(discord_id))
            .await
        {
            Ok(_) => shared.push(guild.id.get()),
            Err(e) if is_unknown_member(&e) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(shared)
}

/// Only a definitive 404 counts as "not a member"; anything else is
/// indeterminate.
fn is_unknown_member(err: &serenity::Error) -> bool {
    matches!(
        err,
        serenity::Error::Http(HttpError::UnsuccessfulRequest(resp))
            if resp.status_code == StatusCode::NOT_FOUND
    )
}

/// Channels a user's notifications fan out to: every shared guild with a
/// configured notification channel. A failed lookup yields no channels;
/// the notification is retried or dropped by the caller, never misrouted.
pub async fn notify_channels(ctx: &Context, config: &Config, discord_id: u64) -> Vec<u64> {
    match shared_guilds(ctx, discord_id).await {
        Ok(guilds) => guilds
            .into_iter()
            .filter_map(|guild_id| config.channel_for_guild(guild_id))
            .collect(),
        Err(e) => {
            log::error(format!("Failed to resolve guilds for {}: {}", discord_id, e));
            Vec::new()
        }
    }
}

#[derive(Debug, Clone)]
pub struct MapEventRecord {
    pub created: DateTime<Utc>,
    pub count: u32,
    pub sent: Vec<(u64, u64)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventDecision {
    /// First occurrence (or the previous one fell outside the window).
    New,
    /// Same (mapset, event-type) inside the window: the previously sent
    /// messages must be replaced, not duplicated.
    Repeat { previous: Vec<(u64, u64)>, count: u32 },
}

/// Dedup state for beatmapset lifecycle notifications, keyed by
/// (mapset id, event type).
#[derive(Debug, Default)]
pub struct MapEventTracker {
    records: HashMap<String, MapEventRecord>,
}

impl MapEventTracker {
    pub fn key(mapset_id: u64, event_type: EventType) -> String {
        format!("{}:{:?}", mapset_id, event_type)
    }

    pub fn begin(&mut self, key: &str, now: DateTime<Utc>, window: Duration) -> EventDecision {
        match self.records.get_mut(key) {
            Some(record) if now - record.created <= window => {
                record.count += 1;
                record.created = now;
                EventDecision::Repeat {
                    previous: std::mem::take(&mut record.sent),
                    count: record.count,
                }
            }
            _ => {
                self.records.insert(
                    key.to_string(),
                    MapEventRecord {
                        created: now,
                        count: 1,
                        sent: Vec::new(),
                    },
                );
                EventDecision::New
            }
        }
    }

    pub fn record_sent(&mut self, key: &str, handles: Vec<(u64, u64)>) {
        if let Some(record) = self.records.get_mut(key) {
            record.sent = handles;
        }
    }

    pub fn count(&self, key: &str) -> u32 {
        self.records.get(key).map(|r| r.count).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeat_within_window_replaces_previous() {
        let mut tracker = MapEventTracker::default();
        let key = MapEventTracker::key(7, EventType::Revive);
        let now = Utc::now();
        let window = Duration::hours(6);

        assert_eq!(tracker.begin(&key, now, window), EventDecision::New);
        tracker.record_sent(&key, vec![(100, 200)]);

        let decision = tracker.begin(&key, now + Duration::hours(1), window);
        assert_eq!(
            decision,
            EventDecision::Repeat {
                previous: vec![(100, 200)],
                count: 2
            }
        );
        assert_eq!(tracker.count(&key), 2);
    }

    #[test]
    fn test_occurrence_outside_window_starts_fresh() {
        let mut tracker = MapEventTracker::default();
        let key = MapEventTracker::key(7, EventType::Revive);
        let now = Utc::now();
        let window = Duration::hours(6);

        tracker.begin(&key, now, window);
        tracker.record_sent(&key, vec![(100, 200)]);

        let decision = tracker.begin(&key, now + Duration::hours(7), window);
        assert_eq!(decision, EventDecision::New);
        assert_eq!(tracker.count(&key), 1);
    }

    #[test]
    fn test_distinct_event_types_do_not_collide() {
        let mut tracker = MapEventTracker::default();
        let now = Utc::now();
        let window = Duration::hours(6);

        tracker.begin(&MapEventTracker::key(7, EventType::Revive), now, window);
        let decision = tracker.begin(&MapEventTracker::key(7, EventType::Qualify), now, window);
        assert_eq!(decision, EventDecision::New);
    }

    #[test]
    fn test_delta_line_formats_movement() {
        let old = UserSnapshot {
            username: "peppy".to_string(),
            pp: 4000.0,
            global_rank: Some(12000),
            country_rank: Some(300),
            accuracy: 98.50,
            ranked_score: 1,
            is_online: false,
            events: vec![],
            fetched_at: Utc::now(),
        };
        let mut new = old.clone();
        new.pp = 4010.5;
        new.global_rank = Some(11900);

        let line = delta_line(&old, &new);
        assert!(line.contains("+10.50pp"));
        assert!(line.contains("#11900"));
        assert!(line.contains("+100"));
    }

}
