use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use serenity::prelude::Context;
use tokio::time::{Duration, sleep};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::log;
use crate::models::Score;
use crate::polling::TrackingService;
use crate::queue::NotifyJob;

const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(64);

/// Watermark to gate a stream score against. A user with no persisted
/// watermark gets one primed just below the triggering score, so that score
/// still qualifies while everything at or before it stays gated; the second
/// element says whether the primed value needs persisting.
fn primed_watermark(existing: Option<u64>, score_id: u64) -> (u64, bool) {
    match existing {
        Some(watermark) => (watermark, false),
        None => (score_id.saturating_sub(1), true),
    }
}

/// Persistent subscription to the companion real-time score feed. Short-cuts
/// notification latency; every hit still goes through the same verification
/// and dedup state as the polling path.
pub struct ScoreStream {
    service: Arc<TrackingService>,
}

impl ScoreStream {
    pub fn new(service: Arc<TrackingService>) -> Self {
        Self { service }
    }

    pub async fn run(self, ctx: Arc<Context>) {
        let mut resume: Option<u64> = None;
        let mut delay = INITIAL_RECONNECT_DELAY;

        loop {
            match self.session(&ctx, &mut resume).await {
                Ok(delivered) => {
                    log::warn(format!(
                        "Score stream disconnected after {} event(s)",
                        delivered
                    ));
                    if delivered > 0 {
                        delay = INITIAL_RECONNECT_DELAY;
                    }
                }
                Err(e) => {
                    log::error(format!("Score stream error: {}", e));
                }
            }

            log::info(format!("Reconnecting to score stream in {:?}...", delay));
            sleep(delay).await;
            delay = (delay * 2).min(MAX_RECONNECT_DELAY);
        }
    }

    /// One websocket session: send the resume token, then drain score events
    /// until the server drops us. Returns how many events were delivered.
    async fn session(&self, ctx: &Context, resume: &mut Option<u64>) -> Result<u64> {
        let url = self.service.config.stream.url.as_str();
        let (ws, _) = connect_async(url).await?;
        let (mut write, mut read) = ws.split();

        let token = match resume {
            Some(id) => id.to_string(),
            None => "connect".to_string(),
        };
        write.send(Message::Text(token)).await?;
        log::success(format!("Connected to score stream at {}", url));

        // Built once per session; a profile linked mid-session is picked up
        // on the next reconnect (and by the polling path meanwhile).
        let index = self.service.store.reverse_index().await;

        let mut delivered = 0u64;
        while let Some(frame) = read.next().await {
            let frame = frame?;
            let text = match frame {
                Message::Text(text) => text,
                Message::Close(_) => break,
                _ => continue,
            };

            for line in text.lines().filter(|l| !l.trim().is_empty()) {
                match serde_json::from_str::<Score>(line) {
                    Ok(score) => {
                        delivered += 1;
                        *resume = Some(score.id);
                        self.handle_score(ctx, &index, score).await;
                    }
                    Err(e) => {
                        log::warn(format!("Malformed stream payload, skipping: {}", e));
                    }
                }
            }
        }

        Ok(delivered)
    }

    async fn handle_score(&self, _ctx: &Context, index: &HashMap<u64, Vec<u64>>, score: Score) {
        let Some(subscribers) = index.get(&score.user_id) else {
            return;
        };

        for discord_id in subscribers {
            let Some(profile) = self.service.store.get(*discord_id).await else {
                continue;
            };
            if profile.mode != score.mode {
                continue;
            }

            // Materialize a tracking row so the verification job and the
            // next poll tick share one entry.
            self.service.tracker.write().await.entry(*discord_id);

            let (watermark, prime) =
                primed_watermark(self.service.store.watermark(*discord_id).await, score.id);
            if prime {
                // First sighting of a never-polled user: persist the primed
                // value so a replayed feed can't re-pass the gate later.
                if let Err(e) = self.service.store.set_watermark(*discord_id, watermark).await {
                    log::error(format!(
                        "Failed to prime watermark for user {}: {}",
                        discord_id, e
                    ));
                }
            }
            if score.id <= watermark {
                continue;
            }

            let job = NotifyJob::StreamScore {
                profile,
                score: score.clone(),
            };
            if let Err(e) = self.service.notify_tx.send(job).await {
                log::error(format!("Failed to enqueue stream verification: {}", e));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primed_watermark_keeps_existing_value() {
        assert_eq!(primed_watermark(Some(500), 700), (500, false));
        // Persisted watermarks gate regardless of the incoming id.
        assert_eq!(primed_watermark(Some(900), 700), (900, false));
    }

    #[test]
    fn test_primed_watermark_initializes_below_first_sighting() {
        let (watermark, prime) = primed_watermark(None, 700);
        assert!(prime);
        assert_eq!(watermark, 699);
        // The triggering score itself still passes the gate.
        assert!(700 > watermark);
    }

    #[test]
    fn test_primed_watermark_handles_id_zero() {
        assert_eq!(primed_watermark(None, 0), (0, true));
    }
}
