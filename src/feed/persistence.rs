use crate::error::AppError;
use crate::feed::now_unix_ms;
use crate::feed::types::{MindmapUpdate, Stats, Trade};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::time::Duration;

pub const TRADES_KEY: &str = "kol_trades:recent";
pub const STATS_KEY: &str = "kol_trades:stats";
pub const TRENDING_KEY: &str = "kol_trades:trending";
pub const AUTH_TOKEN_KEY: &str = "authToken";
const MINDMAP_KEY_PREFIX: &str = "kol_trades:mindmap:";

pub const TRADES_TTL: Duration = Duration::from_secs(30);
pub const STATS_TTL: Duration = Duration::from_secs(60);
pub const TRENDING_TTL: Duration = Duration::from_secs(120);
pub const MINDMAP_TTL: Duration = Duration::from_secs(300);

fn mindmap_key(token_mint: &str) -> String {
    format!("{MINDMAP_KEY_PREFIX}{token_mint}")
}

fn expiry_from(now_ms: i64, ttl: Option<Duration>) -> Option<i64> {
    ttl.map(|ttl| {
        let ttl_ms = ttl.as_millis().min(i64::MAX as u128) as i64;
        now_ms.saturating_add(ttl_ms)
    })
}

fn decode_value<T: DeserializeOwned>(raw: String) -> Result<T, AppError> {
    let mut bytes = raw.into_bytes();
    Ok(simd_json::serde::from_slice::<T>(&mut bytes)?)
}

/// Writes one entry. `ttl = None` stores it without expiry.
pub async fn put_entry_at(
    pool: &SqlitePool,
    key: &str,
    value_json: &str,
    ttl: Option<Duration>,
    now_ms: i64,
) -> Result<(), AppError> {
    sqlx::query(
        "INSERT INTO cache_entries (key, value_json, expires_at_ms, updated_at_ms) VALUES (?, ?, ?, ?) \
         ON CONFLICT(key) DO UPDATE SET value_json=excluded.value_json, expires_at_ms=excluded.expires_at_ms, updated_at_ms=excluded.updated_at_ms",
    )
    .bind(key)
    .bind(value_json)
    .bind(expiry_from(now_ms, ttl))
    .bind(now_ms)
    .execute(pool)
    .await?;

    Ok(())
}

/// Reads one entry if it exists and has not expired at `now_ms`.
pub async fn get_entry_at(
    pool: &SqlitePool,
    key: &str,
    now_ms: i64,
) -> Result<Option<String>, AppError> {
    let row = sqlx::query(
        "SELECT value_json FROM cache_entries \
         WHERE key = ? AND (expires_at_ms IS NULL OR expires_at_ms > ?)",
    )
    .bind(key)
    .bind(now_ms)
    .fetch_optional(pool)
    .await?;

    match row {
        Some(row) => Ok(Some(row.try_get("value_json")?)),
        None => Ok(None),
    }
}

pub async fn remove_entry(pool: &SqlitePool, key: &str) -> Result<bool, AppError> {
    let result = sqlx::query("DELETE FROM cache_entries WHERE key = ?")
        .bind(key)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn purge_expired_at(pool: &SqlitePool, now_ms: i64) -> Result<u64, AppError> {
    let result = sqlx::query(
        "DELETE FROM cache_entries WHERE expires_at_ms IS NOT NULL AND expires_at_ms <= ?",
    )
    .bind(now_ms)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn purge_expired(pool: &SqlitePool) -> Result<u64, AppError> {
    purge_expired_at(pool, now_unix_ms()).await
}

async fn store_json<T: Serialize>(
    pool: &SqlitePool,
    key: &str,
    value: &T,
    ttl: Duration,
) -> Result<(), AppError> {
    let value_json = serde_json::to_string(value)?;
    put_entry_at(pool, key, &value_json, Some(ttl), now_unix_ms()).await
}

async fn load_json<T: DeserializeOwned>(pool: &SqlitePool, key: &str) -> Result<Option<T>, AppError> {
    match get_entry_at(pool, key, now_unix_ms()).await? {
        Some(raw) => decode_value(raw).map(Some),
        None => Ok(None),
    }
}

pub async fn store_trades(pool: &SqlitePool, trades: &[Trade]) -> Result<(), AppError> {
    store_json(pool, TRADES_KEY, &trades, TRADES_TTL).await
}

pub async fn load_trades(pool: &SqlitePool) -> Result<Option<Vec<Trade>>, AppError> {
    load_json(pool, TRADES_KEY).await
}

pub async fn store_stats(pool: &SqlitePool, stats: &Stats) -> Result<(), AppError> {
    store_json(pool, STATS_KEY, stats, STATS_TTL).await
}

pub async fn load_stats(pool: &SqlitePool) -> Result<Option<Stats>, AppError> {
    load_json(pool, STATS_KEY).await
}

pub async fn store_trending(pool: &SqlitePool, tokens: &[String]) -> Result<(), AppError> {
    store_json(pool, TRENDING_KEY, &tokens, TRENDING_TTL).await
}

pub async fn load_trending(pool: &SqlitePool) -> Result<Option<Vec<String>>, AppError> {
    load_json(pool, TRENDING_KEY).await
}

pub async fn store_mindmap(pool: &SqlitePool, mindmap: &MindmapUpdate) -> Result<(), AppError> {
    store_json(pool, &mindmap_key(&mindmap.token_mint), mindmap, MINDMAP_TTL).await
}

pub async fn load_mindmap(
    pool: &SqlitePool,
    token_mint: &str,
) -> Result<Option<MindmapUpdate>, AppError> {
    load_json(pool, &mindmap_key(token_mint)).await
}

pub async fn store_auth_token(pool: &SqlitePool, token: &str) -> Result<(), AppError> {
    let value_json = serde_json::to_string(token)?;
    put_entry_at(pool, AUTH_TOKEN_KEY, &value_json, None, now_unix_ms()).await
}

pub async fn load_auth_token(pool: &SqlitePool) -> Result<Option<String>, AppError> {
    let token: Option<String> = load_json(pool, AUTH_TOKEN_KEY).await?;
    Ok(token
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty()))
}
