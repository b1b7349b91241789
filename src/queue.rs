use std::sync::Arc;

use serenity::prelude::Context;
use tokio::sync::{Mutex, mpsc};

use crate::log;
use crate::models::{RecentEvent, Score};
use crate::polling::TrackingService;
use crate::store::LinkedProfile;

/// Bounded queue depth; a full queue makes the enqueuing tick wait, which is
/// the intended backpressure on notification bursts.
pub const QUEUE_CAPACITY: usize = 64;

/// A notification side effect, detached from the tick that produced it so
/// that a slow one (mapset jobs sleep for minutes) never delays polling.
#[derive(Debug)]
pub enum NotifyJob {
  Pp {
    profile: LinkedProfile,
  },
  RecentEvents {
    profile: LinkedProfile,
    added: Vec<RecentEvent>,
  },
  StreamScore {
    profile: LinkedProfile,
    score: Score,
  },
}

pub fn channel() -> (mpsc::Sender<NotifyJob>, mpsc::Receiver<NotifyJob>) {
  mpsc::channel(QUEUE_CAPACITY)
}

/// Fixed-size pool of workers draining the notification queue.
pub fn spawn_workers(
  service: Arc<TrackingService>,
  ctx: Arc<Context>,
  rx: mpsc::Receiver<NotifyJob>,
  workers: usize,
) {
  let rx = Arc::new(Mutex::new(rx));

  for worker_id in 0..workers.max(1) {
    let service = Arc::clone(&service);
    let ctx = Arc::clone(&ctx);
    let rx = Arc::clone(&rx);

    tokio::spawn(async move {
      log::info(format!("Notification worker {} started", worker_id));

      loop {
        let job = { rx.lock().await.recv().await };
        let Some(job) = job else {
          break;
        };

        let result = match &job {
          NotifyJob::Pp { profile } => service.run_pp_job(&ctx, profile).await,
          NotifyJob::RecentEvents { profile, added } => {
            service.run_events_job(&ctx, profile, added).await
          }
          NotifyJob::StreamScore { profile, score } => {
            service.run_stream_verify(&ctx, profile, score).await
          }
        };

        if let Err(e) = result {
          log::error(format!("Notification job failed on worker {}: {}", worker_id, e));
        }
      }

      log::info(format!("Notification worker {} stopped", worker_id));
    });
  }
}
