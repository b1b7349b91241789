use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serenity::async_trait;
use serenity::model::channel::Message;
use serenity::model::gateway::Ready;
use serenity::prelude::*;
use tokio::sync::RwLock;

use crate::cache::MapCache;
use crate::config::Config;
use crate::discord::DiscordMessenger;
use crate::log;
use crate::notify::MapEventTracker;
use crate::osu_api::OsuClient;
use crate::polling::TrackingService;
use crate::queue;
use crate::store::{LinkedProfile, ProfileStore, UpdateMode};
use crate::stream::ScoreStream;
use crate::tracker::Tracker;
use crate::models::GameMode;

pub struct BotHandler {
  pub config: Arc<Config>,
  pub client: Arc<OsuClient>,
  pub store: Arc<ProfileStore>,
  pub tracker: Arc<RwLock<Tracker>>,
  pub started: AtomicBool,
}

#[async_trait]
impl EventHandler for BotHandler {
  async fn ready(&self, ctx: Context, ready: Ready) {
    log::success(format!("{} is connected and ready!", ready.user.name));

    // `ready` fires again on gateway reconnects; the engine must only be
    // started once.
    if self.started.swap(true, Ordering::SeqCst) {
      return;
    }

    let (notify_tx, notify_rx) = queue::channel();
    let service = Arc::new(TrackingService {
      config: Arc::clone(&self.config),
      client: Arc::clone(&self.client),
      cache: MapCache::new(self.config.tracking.cache_dir.clone()),
      store: Arc::clone(&self.store),
      tracker: Arc::clone(&self.tracker),
      messenger: DiscordMessenger::new(),
      map_events: RwLock::new(MapEventTracker::default()),
      notify_tx,
    });

    if self.config.tracking.enable_cache {
      let loaded = Tracker::load(&service.snapshot_path()).await;
      *self.tracker.write().await = loaded;
    }

    let ctx = Arc::new(ctx);
    queue::spawn_workers(
      Arc::clone(&service),
      Arc::clone(&ctx),
      notify_rx,
      self.config.tracking.notify_workers,
    );

    if self.config.stream.enabled {
      let stream = ScoreStream::new(Arc::clone(&service));
      let stream_ctx = Arc::clone(&ctx);
      tokio::spawn(async move {
        stream.run(stream_ctx).await;
      });
    }

    tokio::spawn(async move {
      if let Err(e) = service.start_polling(ctx).await {
        log::error(format!("Tracking loop error: {}", e));
      }
    });
  }

  /// Thin glue standing in for the external command framework: the engine
  /// itself only exposes link/unlink.
  async fn message(&self, ctx: Context, msg: Message) {
    if msg.author.bot {
      return;
    }

    if let Some(args) = msg.content.strip_prefix("!link ") {
      let mut parts = args.split_whitespace();
      let Some(osu_id) = parts.next().and_then(parse_osu_user) else {
        reply(&ctx, &msg, "Usage: !link <osu user id or profile url> [mode]").await;
        return;
      };
      let mode = parts
        .next()
        .and_then(GameMode::from_str)
        .unwrap_or(GameMode::Osu);

      let profile = LinkedProfile {
        discord_id: msg.author.id.get(),
        osu_id,
        mode,
        update_mode: UpdateMode::Full,
        home_guild: msg.guild_id.map(|g| g.get()),
        notify_leaderboard: false,
        notify_mapping: false,
      };

      match self.store.link(profile).await {
        Ok(()) => reply(&ctx, &msg, &format!("Linked to osu user {} ({})", osu_id, mode.as_str())).await,
        Err(e) => log::error(format!("Failed to link profile: {}", e)),
      }
    } else if msg.content == "!rank" {
      // Ad hoc query; funnels through the same shared rate limiter as the
      // polling and stream paths.
      let Some(profile) = self.store.get(msg.author.id.get()).await else {
        reply(&ctx, &msg, "No linked profile. Use !link first.").await;
        return;
      };

      let user = self.client.get_user(profile.osu_id, profile.mode).await;
      let score_rank = self.client.get_score_rank(profile.osu_id, profile.mode).await;
      match user {
        Ok(Some(user)) => {
          let mut line = format!(
            "**{}**: {:.2}pp, global #{}",
            user.username,
            user.statistics.pp,
            user
              .statistics
              .global_rank
              .map(|r| r.to_string())
              .unwrap_or_else(|| "?".to_string())
          );
          if let Ok(Some(rank)) = score_rank {
            line.push_str(&format!(", ranked-score #{}", rank.rank));
          }
          reply(&ctx, &msg, &line).await;
        }
        Ok(None) => reply(&ctx, &msg, "Stats are unavailable right now, try again shortly.").await,
        Err(e) => log::error(format!("Rank query failed: {}", e)),
      }
    } else if msg.content == "!unlink" {
      let discord_id = msg.author.id.get();
      match self.store.unlink(discord_id).await {
        Ok(true) => {
          self.tracker.write().await.purge(discord_id);
          reply(&ctx, &msg, "Unlinked.").await;
        }
        Ok(false) => reply(&ctx, &msg, "No linked profile.").await,
        Err(e) => log::error(format!("Failed to unlink profile: {}", e)),
      }
    }
  }
}

fn parse_osu_user(arg: &str) -> Option<u64> {
  if let Ok(id) = arg.parse::<u64>() {
    return Some(id);
  }
  // Profile url: https://osu.ppy.sh/users/124493[/osu]
  let after = arg.split_once("/users/")?.1;
  after
    .split(['/', '#', '?'])
    .next()?
    .parse::<u64>()
    .ok()
}

async fn reply(ctx: &Context, msg: &Message, text: &str) {
  if let Err(e) = msg.reply(&ctx.http, text).await {
    log::error(format!("Failed to reply: {}", e));
  }
}
