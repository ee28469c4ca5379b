use crate::feed::types::{ConnectionQuality, FeedStatusSnapshot, SyncState};
use crate::{error::AppError, state::AppState};
use serde::Serialize;
use sqlx::SqlitePool;
use std::time::Instant;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_ms: u128,
    pub db: &'static str,
    pub feed: SyncState,
    pub connection_quality: ConnectionQuality,
}

pub async fn build_health_response(
    started_at: Instant,
    pool: Option<&SqlitePool>,
    feed_status: &FeedStatusSnapshot,
) -> HealthResponse {
    let db_status = match pool {
        Some(pool) => match sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(pool)
            .await
        {
            Ok(_) => "ok",
            Err(_) => "error",
        },
        None => "disabled",
    };

    HealthResponse {
        status: "ok",
        uptime_ms: started_at.elapsed().as_millis(),
        db: db_status,
        feed: feed_status.state,
        connection_quality: feed_status.connection.connection_quality,
    }
}

pub async fn health(state: &AppState) -> Result<HealthResponse, AppError> {
    let feed_status = state.feed_status.read().await.clone();
    Ok(build_health_response(state.started_at, state.db_pool.as_ref(), &feed_status).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn health_reports_ok_status_and_db_health() {
        let pool = SqlitePool::connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite should initialize");

        let response =
            build_health_response(Instant::now(), Some(&pool), &FeedStatusSnapshot::stopped(None))
                .await;

        assert_eq!(response.status, "ok");
        assert_eq!(response.db, "ok");
        assert_eq!(response.feed, SyncState::Stopped);
        assert!(response.uptime_ms <= 1_000);
    }

    #[tokio::test]
    async fn health_without_mirror_reports_disabled_db() {
        let state = AppState::new(None);

        let response = health(&state).await.expect("health should succeed");

        assert_eq!(response.db, "disabled");
        assert_eq!(response.connection_quality, ConnectionQuality::Critical);
    }
}
