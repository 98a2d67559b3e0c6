use crate::model::{Account, Destination, Post, Source, SourceDisplay};
use anyhow::{Context, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the
/// parent directory exists. Leaves in-memory URLs untouched.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);

    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match path_part.strip_prefix("~/") {
        Some(rest) => match std::env::var("HOME") {
            Ok(home) => format!("{}/{}", home.trim_end_matches('/'), rest),
            Err(_) => path_part.to_string(),
        },
        None => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn source_from_row(row: &SqliteRow) -> Source {
    Source {
        channel_id: row.get("channel_id"),
        channel_name: row.get("channel_name"),
        bias: row.try_get("bias").ok().flatten(),
        destination: row.try_get("destination").ok().flatten(),
        display_name: row.try_get("display_name").ok().flatten(),
        invite: row.try_get("invite").ok().flatten(),
        username: row.try_get("username").ok().flatten(),
        api_id: row.try_get("api_id").ok().flatten(),
        description: row.try_get("description").ok().flatten(),
        rating: row.try_get("rating").ok().flatten(),
        detail_id: row.try_get("detail_id").ok().flatten(),
        is_spread: row.get::<i64, _>("is_spread") != 0,
        is_active: row.get::<i64, _>("is_active") != 0,
    }
}

fn post_from_row(row: &SqliteRow) -> Post {
    Post {
        destination: row.get("destination"),
        message_id: row.get("message_id"),
        source_channel_id: row.get("source_channel_id"),
        source_message_id: row.get("source_message_id"),
        backup_id: row.get("backup_id"),
        reply_id: row.try_get("reply_id").ok().flatten(),
        message_text: row.try_get("message_text").ok().flatten(),
        file_id: row.try_get("file_id").ok().flatten(),
    }
}

#[instrument(skip_all)]
pub async fn get_accounts(pool: &Pool) -> Result<Vec<Account>> {
    let rows = sqlx::query("SELECT api_id, api_hash, name, phone_number, description FROM accounts")
        .fetch_all(pool)
        .await?;
    Ok(rows
        .iter()
        .map(|row| Account {
            api_id: row.get("api_id"),
            api_hash: row.get("api_hash"),
            name: row.get("name"),
            phone_number: row.get("phone_number"),
            description: row.try_get("description").ok().flatten(),
        })
        .collect())
}

/// Channel ids watched by the given account. Inactive sources are excluded
/// from the watch set.
#[instrument(skip_all)]
pub async fn get_source_ids_by_api_id(pool: &Pool, api_id: i64) -> Result<Vec<i64>> {
    let ids = sqlx::query_scalar::<_, i64>(
        "SELECT channel_id FROM sources WHERE api_id = ? AND is_active = 1",
    )
    .bind(api_id)
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

#[instrument(skip_all)]
pub async fn get_active_source_ids(pool: &Pool) -> Result<Vec<i64>> {
    let ids = sqlx::query_scalar::<_, i64>("SELECT channel_id FROM sources WHERE is_active = 1")
        .fetch_all(pool)
        .await?;
    Ok(ids)
}

#[instrument(skip_all)]
pub async fn get_source(pool: &Pool, channel_id: i64) -> Result<Option<SourceDisplay>> {
    let row = sqlx::query("SELECT * FROM sources WHERE channel_id = ?")
        .bind(channel_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|row| source_from_row(&row).into()))
}

#[instrument(skip_all)]
pub async fn get_sources(pool: &Pool) -> Result<HashMap<i64, SourceDisplay>> {
    let rows = sqlx::query("SELECT * FROM sources").fetch_all(pool).await?;
    Ok(rows
        .iter()
        .map(|row| {
            let source = source_from_row(row);
            (source.channel_id, source.into())
        })
        .collect())
}

#[instrument(skip_all)]
pub async fn get_patterns(pool: &Pool, channel_id: i64) -> Result<Vec<String>> {
    let patterns = sqlx::query_scalar::<_, String>("SELECT pattern FROM bloats WHERE channel_id = ?")
        .bind(channel_id)
        .fetch_all(pool)
        .await?;
    Ok(patterns)
}

#[instrument(skip_all)]
pub async fn get_footer(pool: &Pool, channel_id: i64) -> Result<Option<String>> {
    let footer: Option<Option<String>> =
        sqlx::query_scalar("SELECT footer FROM destinations WHERE channel_id = ?")
            .bind(channel_id)
            .fetch_optional(pool)
            .await?;
    Ok(footer.flatten())
}

#[instrument(skip_all)]
pub async fn get_destinations(pool: &Pool) -> Result<Vec<Destination>> {
    let rows = sqlx::query("SELECT channel_id, name, group_id, footer FROM destinations")
        .fetch_all(pool)
        .await?;
    Ok(rows
        .iter()
        .map(|row| Destination {
            channel_id: row.get("channel_id"),
            name: row.get("name"),
            group_id: row.try_get("group_id").ok().flatten(),
            footer: row.try_get("footer").ok().flatten(),
        })
        .collect())
}

#[instrument(skip_all)]
pub async fn get_post(
    pool: &Pool,
    source_channel_id: i64,
    source_message_id: i64,
) -> Result<Option<Post>> {
    let row =
        sqlx::query("SELECT * FROM posts WHERE source_channel_id = ? AND source_message_id = ?")
            .bind(source_channel_id)
            .bind(source_message_id)
            .fetch_optional(pool)
            .await?;
    Ok(row.map(|row| post_from_row(&row)))
}

/// Insert a published-post record. The primary key on
/// (source_channel_id, source_message_id) rejects duplicates.
#[instrument(skip_all)]
pub async fn set_post(pool: &Pool, post: &Post) -> Result<()> {
    sqlx::query(
        "INSERT INTO posts (destination, message_id, source_channel_id, source_message_id, \
         backup_id, reply_id, message_text, file_id) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(post.destination)
    .bind(post.message_id)
    .bind(post.source_channel_id)
    .bind(post.source_message_id)
    .bind(post.backup_id)
    .bind(post.reply_id)
    .bind(post.message_text.as_deref())
    .bind(post.file_id.as_deref())
    .execute(pool)
    .await
    .context("failed to persist post record")?;
    Ok(())
}

/// Resolve a source channel by numeric id or by channel name.
#[instrument(skip_all)]
pub async fn resolve_source_id(pool: &Pool, target: &str) -> Result<Option<i64>> {
    if let Ok(id) = target.parse::<i64>() {
        let exists = sqlx::query_scalar::<_, i64>(
            "SELECT channel_id FROM sources WHERE channel_id = ?",
        )
        .bind(id)
        .fetch_optional(pool)
        .await?;
        return Ok(exists);
    }
    let id = sqlx::query_scalar::<_, i64>(
        "SELECT channel_id FROM sources WHERE channel_name = ? OR username = ?",
    )
    .bind(target)
    .bind(target.trim_start_matches('@'))
    .fetch_optional(pool)
    .await?;
    Ok(id)
}

/// Toggle a source's membership in the watch set. Returns false when the
/// channel is unknown.
#[instrument(skip_all)]
pub async fn set_source_active(pool: &Pool, channel_id: i64, active: bool) -> Result<bool> {
    let result = sqlx::query("UPDATE sources SET is_active = ? WHERE channel_id = ?")
        .bind(active as i64)
        .bind(channel_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

#[cfg(test)]
pub(crate) async fn setup_test_pool() -> Pool {
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}
