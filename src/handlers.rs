//! Inbound event orchestration: ties the debloat pipeline, router, cache and
//! formatting together, guards every (chat, message) with a keyed lock held
//! until the Post record is written, and serves the operator commands.

use crate::cache::RefCache;
use crate::db::{self, Pool};
use crate::debloat::{self, InboundText, Rejection, ReviewSink, Verdict};
use crate::format::{format_post, FooterLinks};
use crate::model::Post;
use crate::platform::PlatformClient;
use crate::route::Router;
use crate::translate::TranslateService;
use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tracing::{info, instrument, warn};

/// Per-(chat, message) mutual exclusion. Entries are pruned once nobody holds
/// or waits on them.
#[derive(Default)]
pub struct MessageLocks {
    inner: Mutex<HashMap<(i64, i64), Arc<tokio::sync::Mutex<()>>>>,
}

impl MessageLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, chat_id: i64, message_id: i64) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().expect("lock table poisoned");
            map.retain(|_, lock| Arc::strong_count(lock) > 1);
            map.entry((chat_id, message_id))
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

/// Everything a handler needs, constructed once at startup and shared.
pub struct AppContext {
    pub pool: Pool,
    pub cache: RefCache,
    pub translator: Arc<dyn TranslateService>,
    pub router: Router,
    pub platform: Arc<dyn PlatformClient>,
    pub review: Arc<dyn ReviewSink>,
    pub links: FooterLinks,
    pub edit_debounce: Duration,
    pub edit_max_age: ChronoDuration,
    pub locks: MessageLocks,
}

/// An inbound post event, already reduced to the boundary contract the core
/// consumes.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub chat_id: i64,
    pub message_id: i64,
    /// Raw text or caption, platform markup included.
    pub text: String,
    pub is_caption: bool,
    pub is_edited: bool,
    pub media_group_id: Option<String>,
    pub reply_to_message_id: Option<i64>,
    pub chat_username: Option<String>,
    pub date: DateTime<Utc>,
}

/// What happened to an event, for logging and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Published { destination: i64, message_id: i64 },
    Edited { destination: i64, message_id: i64 },
    /// Archived but not republished (source has `is_spread` off).
    BackupOnly,
    Rejected(Rejection),
    Duplicate,
    AlreadyPublished,
    /// Unknown source, missing destination, or stale edit.
    Skipped,
}

/// Public link to the original message.
pub fn message_link(ev: &InboundEvent) -> String {
    match &ev.chat_username {
        Some(username) => format!("https://t.me/{}/{}", username, ev.message_id),
        None => {
            let id = ev.chat_id.to_string();
            let internal = id.strip_prefix("-100").unwrap_or(&id);
            format!("https://t.me/c/{}/{}", internal, ev.message_id)
        }
    }
}

fn inbound_text(ev: &InboundEvent) -> InboundText {
    InboundText {
        chat_id: ev.chat_id,
        message_id: ev.message_id,
        text: ev.text.clone(),
        is_caption: ev.is_caption,
        chat_username: ev.chat_username.clone(),
        link: message_link(ev),
    }
}

#[instrument(skip_all, fields(chat_id = ev.chat_id, message_id = ev.message_id, edited = ev.is_edited))]
pub async fn handle_event(ctx: &AppContext, ev: &InboundEvent) -> Result<Outcome> {
    if ev.is_edited {
        handle_edit(ctx, ev).await
    } else {
        handle_new(ctx, ev).await
    }
}

async fn handle_new(ctx: &AppContext, ev: &InboundEvent) -> Result<Outcome> {
    // Check-and-register before taking the lock: concurrent duplicate
    // deliveries must not both proceed into the pipeline.
    if ctx.cache.is_duplicate_message(ev.chat_id, ev.message_id) {
        info!("duplicate delivery suppressed");
        return Ok(Outcome::Duplicate);
    }
    let _guard = ctx.locks.acquire(ev.chat_id, ev.message_id).await;
    publish_new(ctx, ev).await
}

/// Create path. Caller must hold the per-message lock.
async fn publish_new(ctx: &AppContext, ev: &InboundEvent) -> Result<Outcome> {
    // Reprocessing the same event after a crash must not double-publish.
    if db::get_post(&ctx.pool, ev.chat_id, ev.message_id)
        .await?
        .is_some()
    {
        info!("post already recorded, skipping publish");
        return Ok(Outcome::AlreadyPublished);
    }

    let Some(source) = ctx.cache.get_source(ev.chat_id).await? else {
        warn!("event from unknown source");
        return Ok(Outcome::Skipped);
    };

    let text = match debloat::debloat_text(
        &inbound_text(ev),
        &ctx.cache,
        ctx.translator.as_ref(),
        ctx.review.as_ref(),
    )
    .await?
    {
        Verdict::Clean(text) => text,
        Verdict::Rejected(rejection) => {
            info!(?rejection, "message rejected");
            return Ok(Outcome::Rejected(rejection));
        }
    };

    let backup_id = ctx.platform.forward_to_backup(ev.chat_id, ev.message_id).await?;

    if ev.is_caption && !source.is_spread {
        info!("media from non-spreading source, archived only");
        return Ok(Outcome::BackupOnly);
    }

    let Some(destination) = ctx
        .router
        .get_destination(&text, ev.chat_id, &ctx.cache)
        .await?
    else {
        return Ok(Outcome::Skipped);
    };

    let reply_id = resolve_reply(ctx, ev).await?;
    let footer = ctx.cache.get_footer(destination).await?;
    let formatted = format_post(
        &text,
        &message_link(ev),
        &source,
        backup_id,
        footer.as_deref(),
        &ctx.links,
    );

    let sent = if ev.is_caption {
        ctx.platform
            .copy_with_caption(destination, ev.chat_id, ev.message_id, &formatted, reply_id)
            .await?
    } else {
        ctx.platform.send_text(destination, &formatted, reply_id).await?
    };

    db::set_post(
        &ctx.pool,
        &Post {
            destination: sent.chat_id,
            message_id: sent.message_id,
            source_channel_id: ev.chat_id,
            source_message_id: ev.message_id,
            backup_id,
            reply_id,
            message_text: Some(formatted),
            file_id: None,
        },
    )
    .await?;

    info!(destination = sent.chat_id, message_id = sent.message_id, "published");
    Ok(Outcome::Published {
        destination: sent.chat_id,
        message_id: sent.message_id,
    })
}

async fn handle_edit(ctx: &AppContext, ev: &InboundEvent) -> Result<Outcome> {
    if ev.date < Utc::now() - ctx.edit_max_age {
        info!("edit is older than the edit window, ignoring");
        return Ok(Outcome::Skipped);
    }

    // Let edit bursts settle before reprocessing.
    tokio::time::sleep(ctx.edit_debounce).await;

    let _guard = ctx.locks.acquire(ev.chat_id, ev.message_id).await;

    let Some(post) = db::get_post(&ctx.pool, ev.chat_id, ev.message_id).await? else {
        // Never published (rejected at the time, or missed): treat as create.
        info!("edit for unpublished message, treating as new");
        return publish_new(ctx, ev).await;
    };

    let Some(source) = ctx.cache.get_source(ev.chat_id).await? else {
        warn!("edit from unknown source");
        return Ok(Outcome::Skipped);
    };

    let text = match debloat::debloat_text(
        &inbound_text(ev),
        &ctx.cache,
        ctx.translator.as_ref(),
        ctx.review.as_ref(),
    )
    .await?
    {
        Verdict::Clean(text) => text,
        Verdict::Rejected(rejection) => {
            info!(?rejection, "edited message rejected");
            return Ok(Outcome::Rejected(rejection));
        }
    };

    // The already-published counterpart keeps its destination and backup.
    let footer = ctx.cache.get_footer(post.destination).await?;
    let formatted = format_post(
        &text,
        &message_link(ev),
        &source,
        post.backup_id,
        footer.as_deref(),
        &ctx.links,
    );

    if ev.is_caption {
        ctx.platform
            .edit_caption(post.destination, post.message_id, &formatted)
            .await?;
    } else {
        ctx.platform
            .edit_text(post.destination, post.message_id, &formatted)
            .await?;
    }

    info!(destination = post.destination, message_id = post.message_id, "edited");
    Ok(Outcome::Edited {
        destination: post.destination,
        message_id: post.message_id,
    })
}

/// Resolve a reply to an already-syndicated message into the published
/// counterpart's message id.
async fn resolve_reply(ctx: &AppContext, ev: &InboundEvent) -> Result<Option<i64>> {
    let Some(reply_to) = ev.reply_to_message_id else {
        return Ok(None);
    };
    Ok(db::get_post(&ctx.pool, ev.chat_id, reply_to)
        .await?
        .map(|post| post.message_id))
}

/// Operator command surface. Returns the reply text, or `None` for input
/// that is not a known command.
pub async fn handle_command(ctx: &AppContext, text: &str) -> Result<Option<String>> {
    let mut parts = text.split_whitespace();
    let command = parts.next().unwrap_or("");
    let command = command.split('@').next().unwrap_or(command);

    match command {
        "/refresh" => {
            let reply = match ctx.cache.refresh_all().await {
                Ok(stats) => format!(
                    "Refreshed: {} sources, {} destinations, {} regions.",
                    stats.sources, stats.destinations, stats.regions
                ),
                Err(err) => format!("Refresh failed: {err:#}"),
            };
            Ok(Some(reply))
        }
        "/join" => match parts.next() {
            Some(target) => Ok(Some(join_source(ctx, target).await)),
            None => Ok(Some("Usage: /join <channel>".into())),
        },
        "/leave" => match parts.next() {
            Some(target) => Ok(Some(leave_source(ctx, target).await)),
            None => Ok(Some("Usage: /leave <channel>".into())),
        },
        _ => Ok(None),
    }
}

async fn join_source(ctx: &AppContext, target: &str) -> String {
    let channel_id = match db::resolve_source_id(&ctx.pool, target).await {
        Ok(Some(id)) => id,
        Ok(None) => return format!("Unknown channel: {target}"),
        Err(err) => return format!("Join failed: {err:#}"),
    };
    if let Err(err) = db::set_source_active(&ctx.pool, channel_id, true).await {
        return format!("Join failed: {err:#}");
    }
    match ctx.cache.refresh_sources().await {
        Ok(()) => {
            let stats = ctx.cache.stats();
            format!("Joined {channel_id}. Sources cached: {}.", stats.sources)
        }
        Err(err) => format!("Joined {channel_id}, but source refresh failed: {err:#}"),
    }
}

async fn leave_source(ctx: &AppContext, target: &str) -> String {
    let channel_id = match db::resolve_source_id(&ctx.pool, target).await {
        Ok(Some(id)) => id,
        Ok(None) => return format!("Unknown channel: {target}"),
        Err(err) => return format!("Leave failed: {err:#}"),
    };
    if let Err(err) = ctx.platform.leave_channel(channel_id).await {
        warn!(%err, channel_id, "could not leave chat, deactivating anyway");
    }
    if let Err(err) = db::set_source_active(&ctx.pool, channel_id, false).await {
        return format!("Leave failed: {err:#}");
    }
    match ctx.cache.refresh_sources().await {
        Ok(()) => {
            let stats = ctx.cache.stats();
            format!("Left {channel_id}. Sources cached: {}.", stats.sources)
        }
        Err(err) => format!("Left {channel_id}, but source refresh failed: {err:#}"),
    }
}
