use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tg_relaybot::cache::RefCache;
use tg_relaybot::db;
use tg_relaybot::debloat::{Rejection, ReviewSink};
use tg_relaybot::format::FooterLinks;
use tg_relaybot::handlers::{
    handle_command, handle_event, AppContext, InboundEvent, MessageLocks, Outcome,
};
use tg_relaybot::model::Post;
use tg_relaybot::platform::{PlatformClient, SentRef};
use tg_relaybot::route::{Classification, Classify, Router};
use tg_relaybot::translate::TranslateService;
use tokio::sync::Mutex;

async fn setup_pool() -> sqlx::SqlitePool {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

async fn seed(pool: &sqlx::SqlitePool) {
    sqlx::query(
        "INSERT INTO destinations (channel_id, name, group_id, footer) VALUES \
         (-2001, 'Ukraine', NULL, '\n\n👉 Folge @NYX_News für mehr!'), \
         (-2002, 'Asien', NULL, NULL)",
    )
    .execute(pool)
    .await
    .unwrap();
    sqlx::query(
        "INSERT INTO accounts (api_id, api_hash, name, phone_number, description) \
         VALUES (7, 'hash-7', 'Michael', '+4915000000', NULL)",
    )
    .execute(pool)
    .await
    .unwrap();
    sqlx::query(
        "INSERT INTO sources (channel_id, channel_name, bias, destination, display_name, \
         username, api_id, detail_id, is_spread, is_active) VALUES \
         (-1001, 'frontline', '🟡', -2001, 'Frontline News', 'frontline', 7, 42, 1, 1), \
         (-1003, 'archive_only', NULL, -2001, NULL, NULL, 7, NULL, 0, 1)",
    )
    .execute(pool)
    .await
    .unwrap();
    sqlx::query("INSERT INTO bloats (channel_id, pattern) VALUES (-1001, 'Breaking:')")
        .execute(pool)
        .await
        .unwrap();
}

#[derive(Default)]
struct RecordingPlatform {
    backups: Arc<Mutex<Vec<(i64, i64)>>>,
    review_forwards: Arc<Mutex<Vec<(i64, i64)>>>,
    review_notes: Arc<Mutex<Vec<String>>>,
    sent: Arc<Mutex<Vec<(i64, String, Option<i64>)>>>,
    copied: Arc<Mutex<Vec<(i64, i64, i64, String)>>>,
    edits: Arc<Mutex<Vec<(i64, i64, String)>>>,
    left: Arc<Mutex<Vec<i64>>>,
    next_id: Arc<Mutex<i64>>,
}

impl RecordingPlatform {
    async fn next_message_id(&self) -> i64 {
        let mut guard = self.next_id.lock().await;
        *guard += 1;
        100 + *guard
    }
}

#[async_trait]
impl ReviewSink for RecordingPlatform {
    async fn forward_to_review(&self, chat_id: i64, message_id: i64) -> Result<()> {
        self.review_forwards.lock().await.push((chat_id, message_id));
        Ok(())
    }

    async fn send_review_note(&self, text: &str) -> Result<()> {
        self.review_notes.lock().await.push(text.to_string());
        Ok(())
    }
}

#[async_trait]
impl PlatformClient for RecordingPlatform {
    async fn forward_to_backup(&self, from_chat: i64, message_id: i64) -> Result<i64> {
        self.backups.lock().await.push((from_chat, message_id));
        Ok(9000 + message_id)
    }

    async fn send_text(&self, dest: i64, text: &str, reply_to: Option<i64>) -> Result<SentRef> {
        let message_id = self.next_message_id().await;
        self.sent.lock().await.push((dest, text.to_string(), reply_to));
        Ok(SentRef {
            chat_id: dest,
            message_id,
        })
    }

    async fn copy_with_caption(
        &self,
        dest: i64,
        from_chat: i64,
        message_id: i64,
        caption: &str,
        _reply_to: Option<i64>,
    ) -> Result<SentRef> {
        let new_id = self.next_message_id().await;
        self.copied
            .lock()
            .await
            .push((dest, from_chat, message_id, caption.to_string()));
        Ok(SentRef {
            chat_id: dest,
            message_id: new_id,
        })
    }

    async fn edit_text(&self, chat_id: i64, message_id: i64, text: &str) -> Result<()> {
        self.edits.lock().await.push((chat_id, message_id, text.to_string()));
        Ok(())
    }

    async fn edit_caption(&self, chat_id: i64, message_id: i64, caption: &str) -> Result<()> {
        self.edits
            .lock()
            .await
            .push((chat_id, message_id, caption.to_string()));
        Ok(())
    }

    async fn leave_channel(&self, chat_id: i64) -> Result<()> {
        self.left.lock().await.push(chat_id);
        Ok(())
    }
}

struct EchoTranslator;

#[async_trait]
impl TranslateService for EchoTranslator {
    async fn translate(&self, text: &str, _is_caption: bool) -> Result<String> {
        Ok(text.to_string())
    }
}

struct StubClassifier(Result<Classification>);

#[async_trait]
impl Classify for StubClassifier {
    async fn classify(&self, _text: &str, _regions: &[String]) -> Result<Classification> {
        match &self.0 {
            Ok(c) => Ok(c.clone()),
            Err(err) => Err(anyhow!("{err}")),
        }
    }
}

async fn build_ctx(classifier: StubClassifier) -> (Arc<RecordingPlatform>, AppContext) {
    let pool = setup_pool().await;
    seed(&pool).await;
    let cache = RefCache::new(pool.clone());
    let platform = Arc::new(RecordingPlatform::default());
    let ctx = AppContext {
        pool,
        cache,
        translator: Arc::new(EchoTranslator),
        router: Router::new(Box::new(classifier)),
        platform: platform.clone(),
        review: platform.clone(),
        links: FooterLinks {
            backup_base: "https://t.me/nn_backup".into(),
            detail_base: "https://t.me/nn_sources".into(),
        },
        edit_debounce: Duration::from_millis(0),
        edit_max_age: chrono::Duration::days(7),
        locks: MessageLocks::new(),
    };
    (platform, ctx)
}

fn routing_down() -> StubClassifier {
    StubClassifier(Err(anyhow!("classifier offline")))
}

fn text_event(chat_id: i64, message_id: i64, text: &str) -> InboundEvent {
    InboundEvent {
        chat_id,
        message_id,
        text: text.to_string(),
        is_caption: false,
        is_edited: false,
        media_group_id: None,
        reply_to_message_id: None,
        chat_username: Some("frontline".into()),
        date: Utc::now(),
    }
}

fn caption_event(chat_id: i64, message_id: i64, text: &str) -> InboundEvent {
    InboundEvent {
        is_caption: true,
        chat_username: None,
        ..text_event(chat_id, message_id, text)
    }
}

#[tokio::test]
async fn accepted_post_is_published_and_recorded() {
    let (platform, ctx) = build_ctx(routing_down()).await;
    let ev = text_event(-1001, 7, "Breaking: the city holds after a long night of fighting");

    let outcome = handle_event(&ctx, &ev).await.unwrap();
    match outcome {
        Outcome::Published { destination, .. } => assert_eq!(destination, -2001),
        other => panic!("unexpected outcome {:?}", other),
    }

    // Backed up once, published once, pattern span removed, footer appended.
    assert_eq!(*platform.backups.lock().await, vec![(-1001, 7)]);
    let sent = platform.sent.lock().await;
    assert_eq!(sent.len(), 1);
    let (dest, text, reply_to) = &sent[0];
    assert_eq!(*dest, -2001);
    assert!(!text.contains("Breaking:"));
    assert!(text.contains("city holds"));
    assert!(text.contains("Quelle: <a href='https://t.me/frontline/7'>Frontline News 🟡</a>"));
    assert!(text.contains("https://t.me/nn_backup/9007"));
    assert!(text.contains("https://t.me/nn_sources/42"));
    assert!(text.ends_with("👉 Folge @NYX_News für mehr!"));
    assert!(reply_to.is_none());

    let post = db::get_post(&ctx.pool, -1001, 7).await.unwrap().unwrap();
    assert_eq!(post.destination, -2001);
    assert_eq!(post.backup_id, 9007);
}

#[tokio::test]
async fn confident_classification_overrides_default_destination() {
    let classifier = StubClassifier(Ok(Classification {
        region: "asien".into(),
        confidence: 0.9,
    }));
    let (platform, ctx) = build_ctx(classifier).await;
    let ev = text_event(-1001, 8, "Breaking: the city holds after a long night of fighting");

    let outcome = handle_event(&ctx, &ev).await.unwrap();
    assert!(matches!(
        outcome,
        Outcome::Published {
            destination: -2002,
            ..
        }
    ));
    let sent = platform.sent.lock().await;
    assert_eq!(sent[0].0, -2002);
    // The Asien destination has no footer configured.
    assert!(!sent[0].1.contains("Folge @NYX_News"));
}

#[tokio::test]
async fn duplicate_delivery_is_suppressed() {
    let (platform, ctx) = build_ctx(routing_down()).await;
    let ev = text_event(-1001, 9, "Breaking: the city holds after a long night of fighting");

    let first = handle_event(&ctx, &ev).await.unwrap();
    assert!(matches!(first, Outcome::Published { .. }));

    let second = handle_event(&ctx, &ev).await.unwrap();
    assert_eq!(second, Outcome::Duplicate);
    assert_eq!(platform.sent.lock().await.len(), 1);
    assert_eq!(platform.backups.lock().await.len(), 1);
}

#[tokio::test]
async fn unmatched_pattern_is_quarantined_once_and_not_published() {
    let (platform, ctx) = build_ctx(routing_down()).await;
    let ev = text_event(-1001, 10, "Unrelated chatter that matches nothing configured");

    let outcome = handle_event(&ctx, &ev).await.unwrap();
    assert_eq!(outcome, Outcome::Rejected(Rejection::NoPatternMatch));

    assert_eq!(platform.review_forwards.lock().await.len(), 1);
    assert_eq!(platform.review_notes.lock().await.len(), 1);
    assert!(platform.sent.lock().await.is_empty());
    assert!(platform.backups.lock().await.is_empty());
    assert!(db::get_post(&ctx.pool, -1001, 10).await.unwrap().is_none());
}

#[tokio::test]
async fn reply_is_mapped_to_published_counterpart() {
    let (platform, ctx) = build_ctx(routing_down()).await;

    let first = text_event(-1001, 11, "Breaking: the city holds after a long night of fighting");
    let outcome = handle_event(&ctx, &first).await.unwrap();
    let Outcome::Published { message_id, .. } = outcome else {
        panic!("first publish failed: {:?}", outcome);
    };

    let mut second = text_event(-1001, 12, "Breaking: follow-up on the overnight situation now");
    second.reply_to_message_id = Some(11);
    handle_event(&ctx, &second).await.unwrap();

    {
        let sent = platform.sent.lock().await;
        assert_eq!(sent[1].2, Some(message_id));
    }

    // A reply to something never syndicated resolves to no reply target.
    let mut third = text_event(-1001, 13, "Breaking: another follow-up on that same situation");
    third.reply_to_message_id = Some(999);
    handle_event(&ctx, &third).await.unwrap();
    assert_eq!(platform.sent.lock().await[2].2, None);
}

#[tokio::test]
async fn edit_updates_published_message_in_place() {
    let (platform, ctx) = build_ctx(routing_down()).await;

    let ev = text_event(-1001, 14, "Breaking: the city holds after a long night of fighting");
    let Outcome::Published { destination, message_id } = handle_event(&ctx, &ev).await.unwrap()
    else {
        panic!("publish failed");
    };

    let mut edit = text_event(-1001, 14, "Breaking: the city holds, with calm restored by morning");
    edit.is_edited = true;
    let outcome = handle_event(&ctx, &edit).await.unwrap();
    assert_eq!(
        outcome,
        Outcome::Edited {
            destination,
            message_id
        }
    );

    let edits = platform.edits.lock().await;
    assert_eq!(edits.len(), 1);
    assert_eq!(edits[0].0, destination);
    assert_eq!(edits[0].1, message_id);
    assert!(edits[0].2.contains("calm restored"));
    // Edits reuse the stored backup reference.
    assert!(edits[0].2.contains("https://t.me/nn_backup/9014"));

    // Still exactly one post row.
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM posts")
        .fetch_one(&ctx.pool)
        .await
        .unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn edit_without_post_record_becomes_create() {
    let (platform, ctx) = build_ctx(routing_down()).await;

    let mut edit = text_event(-1001, 15, "Breaking: a story the bot never saw being created");
    edit.is_edited = true;
    let outcome = handle_event(&ctx, &edit).await.unwrap();
    assert!(matches!(outcome, Outcome::Published { .. }));
    assert_eq!(platform.sent.lock().await.len(), 1);
    assert!(db::get_post(&ctx.pool, -1001, 15).await.unwrap().is_some());
}

#[tokio::test]
async fn media_from_non_spreading_source_is_archived_only() {
    let (platform, ctx) = build_ctx(routing_down()).await;
    let ev = caption_event(-1003, 16, "caption long enough to pass the bar");

    let outcome = handle_event(&ctx, &ev).await.unwrap();
    assert_eq!(outcome, Outcome::BackupOnly);
    assert_eq!(platform.backups.lock().await.len(), 1);
    assert!(platform.copied.lock().await.is_empty());
    assert!(platform.sent.lock().await.is_empty());
    assert!(db::get_post(&ctx.pool, -1003, 16).await.unwrap().is_none());
}

#[tokio::test]
async fn caption_publishes_via_copy() {
    let (platform, ctx) = build_ctx(routing_down()).await;
    let ev = caption_event(-1001, 17, "Breaking: photos from the scene arriving all morning");

    let outcome = handle_event(&ctx, &ev).await.unwrap();
    assert!(matches!(outcome, Outcome::Published { .. }));

    let copied = platform.copied.lock().await;
    assert_eq!(copied.len(), 1);
    let (dest, from_chat, message_id, caption) = &copied[0];
    assert_eq!((*dest, *from_chat, *message_id), (-2001, -1001, 17));
    assert!(caption.contains("Quelle:"));
    assert!(platform.sent.lock().await.is_empty());
}

#[tokio::test]
async fn existing_post_record_short_circuits_republish() {
    let (platform, ctx) = build_ctx(routing_down()).await;

    db::set_post(
        &ctx.pool,
        &Post {
            destination: -2001,
            message_id: 555,
            source_channel_id: -1001,
            source_message_id: 18,
            backup_id: 1,
            reply_id: None,
            message_text: None,
            file_id: None,
        },
    )
    .await
    .unwrap();

    let ev = text_event(-1001, 18, "Breaking: the city holds after a long night of fighting");
    let outcome = handle_event(&ctx, &ev).await.unwrap();
    assert_eq!(outcome, Outcome::AlreadyPublished);
    assert!(platform.sent.lock().await.is_empty());
    assert!(platform.backups.lock().await.is_empty());
}

#[tokio::test]
async fn operator_commands_report_summaries() {
    let (platform, ctx) = build_ctx(routing_down()).await;

    let reply = handle_command(&ctx, "/refresh").await.unwrap().unwrap();
    assert_eq!(reply, "Refreshed: 2 sources, 2 destinations, 2 regions.");

    let reply = handle_command(&ctx, "/join -1003").await.unwrap().unwrap();
    assert!(reply.starts_with("Joined -1003"));

    let reply = handle_command(&ctx, "/leave -1003").await.unwrap().unwrap();
    assert!(reply.starts_with("Left -1003"));
    assert_eq!(*platform.left.lock().await, vec![-1003]);
    let active = db::get_active_source_ids(&ctx.pool).await.unwrap();
    assert_eq!(active, vec![-1001]);

    let reply = handle_command(&ctx, "/join nosuch").await.unwrap().unwrap();
    assert!(reply.contains("Unknown channel"));

    assert!(handle_command(&ctx, "/bogus").await.unwrap().is_none());
    assert!(handle_command(&ctx, "plain text").await.unwrap().is_none());
}
