use anyhow::Result;
use clap::Parser;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use teloxide::prelude::*;
use tg_relaybot::cache::RefCache;
use tg_relaybot::config;
use tg_relaybot::db;
use tg_relaybot::format::FooterLinks;
use tg_relaybot::handlers::{self, AppContext, InboundEvent, MessageLocks};
use tg_relaybot::platform::TelegramClient;
use tg_relaybot::route::{OpenRouterClassifier, Router};
use tg_relaybot::translate::Translator;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/relaybot.db", cfg.app.data_dir));

    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let cache = RefCache::new(pool.clone());
    cache.warm().await?;

    let watched: HashSet<i64> = match cfg.telegram.api_id {
        Some(api_id) => db::get_source_ids_by_api_id(&pool, api_id).await?,
        None => db::get_active_source_ids(&pool).await?,
    }
    .into_iter()
    .collect();
    info!(count = watched.len(), "loaded watch set");

    let bot = Bot::new(cfg.telegram.bot_token.clone());
    let platform = Arc::new(TelegramClient::new(
        bot.clone(),
        cfg.channels.backup,
        cfg.channels.review,
    ));

    let ctx = Arc::new(AppContext {
        pool,
        cache,
        translator: Arc::new(Translator::new(
            cfg.translation.deepl_key.clone(),
            cfg.translation.target_lang.clone(),
        )),
        router: Router::new(Box::new(OpenRouterClassifier::new(
            cfg.routing.openrouter_key.clone(),
            cfg.routing.model.clone(),
        ))),
        platform: platform.clone(),
        review: platform,
        links: FooterLinks {
            backup_base: cfg.links.backup_base.clone(),
            detail_base: cfg.links.detail_base.clone(),
        },
        edit_debounce: Duration::from_secs(cfg.app.edit_debounce_seconds),
        edit_max_age: chrono::Duration::days(cfg.app.edit_max_age_days),
        locks: MessageLocks::new(),
    });

    info!("starting syndication bot");
    let handler = dptree::entry()
        .branch(Update::filter_channel_post().endpoint(on_channel_post))
        .branch(Update::filter_edited_channel_post().endpoint(on_edited_channel_post))
        .branch(Update::filter_message().endpoint(on_message));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![ctx, Arc::new(watched)])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    Ok(())
}

fn to_event(msg: &Message, edited: bool) -> Option<InboundEvent> {
    let (text, is_caption) = match (msg.text(), msg.caption()) {
        (Some(text), _) => (text.to_string(), false),
        (None, Some(caption)) => (caption.to_string(), true),
        (None, None) => return None,
    };
    Some(InboundEvent {
        chat_id: msg.chat.id.0,
        message_id: msg.id.0 as i64,
        text,
        is_caption,
        is_edited: edited,
        media_group_id: msg.media_group_id().map(str::to_owned),
        reply_to_message_id: msg.reply_to_message().map(|m| m.id.0 as i64),
        chat_username: msg.chat.username().map(str::to_owned),
        date: msg.date,
    })
}

async fn process_post(
    msg: &Message,
    edited: bool,
    ctx: &AppContext,
    watched: &HashSet<i64>,
) {
    if !watched.contains(&msg.chat.id.0) {
        return;
    }
    // Messages without text or caption never enter the pipeline.
    let Some(ev) = to_event(msg, edited) else {
        return;
    };
    if let Err(err) = handlers::handle_event(ctx, &ev).await {
        error!(?err, chat_id = ev.chat_id, message_id = ev.message_id, "failed to handle post");
    }
}

async fn on_channel_post(
    msg: Message,
    ctx: Arc<AppContext>,
    watched: Arc<HashSet<i64>>,
) -> ResponseResult<()> {
    process_post(&msg, false, &ctx, &watched).await;
    Ok(())
}

async fn on_edited_channel_post(
    msg: Message,
    ctx: Arc<AppContext>,
    watched: Arc<HashSet<i64>>,
) -> ResponseResult<()> {
    process_post(&msg, true, &ctx, &watched).await;
    Ok(())
}

async fn on_message(bot: Bot, msg: Message, ctx: Arc<AppContext>) -> ResponseResult<()> {
    if let Some(text) = msg.text() {
        match handlers::handle_command(&ctx, text).await {
            Ok(Some(reply)) => {
                let _ = bot.send_message(msg.chat.id, reply).await;
            }
            Ok(None) => {}
            Err(err) => error!(?err, "command handling failed"),
        }
    }
    respond(())
}
