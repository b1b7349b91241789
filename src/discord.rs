use anyhow::Result;
use serenity::builder::{CreateEmbed, CreateMessage};
use serenity::model::id::{ChannelId, MessageId};
use serenity::prelude::*;
use tokio::time::{Duration, timeout};

use crate::log;

const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Thin wrapper over the chat platform: send and delete, which together
/// cover message replacement. Every call is bounded by a timeout so a
/// wedged gateway never stalls a notification worker indefinitely.
pub struct DiscordMessenger;

impl DiscordMessenger {
  pub fn new() -> Self {
    Self
  }

  pub async fn send_embed(
    &self,
    ctx: &Context,
    channel_id: u64,
    embed: CreateEmbed,
  ) -> Result<MessageId> {
    let send_future =
      ChannelId::new(channel_id).send_message(&ctx.http, CreateMessage::new().embed(embed));

    match timeout(SEND_TIMEOUT, send_future).await {
      Ok(Ok(message)) => {
        log::success(format!("Sent embed message to channel {}", channel_id));
        Ok(message.id)
      }
      Ok(Err(e)) => {
        log::error(format!(
          "Failed to send message to channel {}: {}",
          channel_id, e
        ));
        Err(e.into())
      }
      Err(_) => {
        log::error(format!(
          "Timeout ({:?}) while sending message to channel {}",
          SEND_TIMEOUT, channel_id
        ));
        Err(anyhow::anyhow!("Message send timeout"))
      }
    }
  }

  pub async fn delete_message(&self, ctx: &Context, channel_id: u64, message_id: u64) -> Result<()> {
    let delete_future =
      ChannelId::new(channel_id).delete_message(&ctx.http, MessageId::new(message_id));

    match timeout(SEND_TIMEOUT, delete_future).await {
      Ok(result) => result.map_err(Into::into),
      Err(_) => Err(anyhow::anyhow!("Message delete timeout")),
    }
  }
}
