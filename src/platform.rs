//! Messaging-platform collaborator. The core only ever talks through
//! [`PlatformClient`] and [`ReviewSink`](crate::debloat::ReviewSink);
//! [`TelegramClient`] is the real implementation.

use crate::debloat::ReviewSink;
use anyhow::Result;
use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{MessageId, ParseMode};
use teloxide::{ApiError, RequestError};

/// Reference to a message the platform just produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentRef {
    pub chat_id: i64,
    pub message_id: i64,
}

#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// Forward the original message into the backup channel, returning the
    /// backup message id.
    async fn forward_to_backup(&self, from_chat: i64, message_id: i64) -> Result<i64>;

    /// Publish a plain text message.
    async fn send_text(&self, dest: i64, text: &str, reply_to: Option<i64>) -> Result<SentRef>;

    /// Re-publish a media message under a new caption.
    async fn copy_with_caption(
        &self,
        dest: i64,
        from_chat: i64,
        message_id: i64,
        caption: &str,
        reply_to: Option<i64>,
    ) -> Result<SentRef>;

    async fn edit_text(&self, chat_id: i64, message_id: i64, text: &str) -> Result<()>;

    async fn edit_caption(&self, chat_id: i64, message_id: i64, caption: &str) -> Result<()>;

    async fn leave_channel(&self, chat_id: i64) -> Result<()>;
}

#[derive(Clone)]
pub struct TelegramClient {
    bot: Bot,
    backup_channel: i64,
    review_channel: i64,
}

impl TelegramClient {
    pub fn new(bot: Bot, backup_channel: i64, review_channel: i64) -> Self {
        Self {
            bot,
            backup_channel,
            review_channel,
        }
    }
}

#[async_trait]
impl ReviewSink for TelegramClient {
    async fn forward_to_review(&self, chat_id: i64, message_id: i64) -> Result<()> {
        self.bot
            .forward_message(
                ChatId(self.review_channel),
                ChatId(chat_id),
                MessageId(message_id as i32),
            )
            .await?;
        Ok(())
    }

    async fn send_review_note(&self, text: &str) -> Result<()> {
        self.bot
            .send_message(ChatId(self.review_channel), text)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl PlatformClient for TelegramClient {
    async fn forward_to_backup(&self, from_chat: i64, message_id: i64) -> Result<i64> {
        let forwarded = self
            .bot
            .forward_message(
                ChatId(self.backup_channel),
                ChatId(from_chat),
                MessageId(message_id as i32),
            )
            .await?;
        Ok(forwarded.id.0 as i64)
    }

    async fn send_text(&self, dest: i64, text: &str, reply_to: Option<i64>) -> Result<SentRef> {
        let mut request = self
            .bot
            .send_message(ChatId(dest), text)
            .parse_mode(ParseMode::Html)
            .disable_web_page_preview(true);
        if let Some(reply_to) = reply_to {
            request = request.reply_to_message_id(MessageId(reply_to as i32));
        }
        let sent = request.await?;
        Ok(SentRef {
            chat_id: sent.chat.id.0,
            message_id: sent.id.0 as i64,
        })
    }

    async fn copy_with_caption(
        &self,
        dest: i64,
        from_chat: i64,
        message_id: i64,
        caption: &str,
        reply_to: Option<i64>,
    ) -> Result<SentRef> {
        let mut request = self
            .bot
            .copy_message(ChatId(dest), ChatId(from_chat), MessageId(message_id as i32))
            .caption(caption)
            .parse_mode(ParseMode::Html);
        if let Some(reply_to) = reply_to {
            request = request.reply_to_message_id(MessageId(reply_to as i32));
        }
        let copied = request.await?;
        Ok(SentRef {
            chat_id: dest,
            message_id: copied.0 as i64,
        })
    }

    async fn edit_text(&self, chat_id: i64, message_id: i64, text: &str) -> Result<()> {
        let result = self
            .bot
            .edit_message_text(ChatId(chat_id), MessageId(message_id as i32), text)
            .parse_mode(ParseMode::Html)
            .disable_web_page_preview(true)
            .await;
        match result {
            Ok(_) => Ok(()),
            // Re-editing to identical content is a no-op, not a failure.
            Err(RequestError::Api(ApiError::MessageNotModified)) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn edit_caption(&self, chat_id: i64, message_id: i64, caption: &str) -> Result<()> {
        let result = self
            .bot
            .edit_message_caption(ChatId(chat_id), MessageId(message_id as i32))
            .caption(caption)
            .parse_mode(ParseMode::Html)
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(RequestError::Api(ApiError::MessageNotModified)) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn leave_channel(&self, chat_id: i64) -> Result<()> {
        self.bot.leave_chat(ChatId(chat_id)).await?;
        Ok(())
    }
}
