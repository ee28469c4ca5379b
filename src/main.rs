use kol_feed_sync::commands::feed_sync::{feed_sync_status, shutdown_feed_sync, start_feed_sync};
use kol_feed_sync::db::initialize_pool;
use kol_feed_sync::error::AppError;
use kol_feed_sync::feed::types::StartFeedSyncArgs;
use kol_feed_sync::state::AppState;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), AppError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let db_pool = match initialize_pool().await {
        Ok(pool) => Some(pool),
        Err(error) => {
            warn!(%error, "local cache mirror unavailable, continuing without it");
            None
        }
    };
    let state = AppState::new(db_pool);

    let session = start_feed_sync(&state, Some(StartFeedSyncArgs::from_env())).await?;
    info!(api_url = %session.api_url, kols = session.active_kol_wallets.len(), "kol feed sync running");

    let mut status_log = tokio::time::interval(STATUS_LOG_INTERVAL);
    status_log.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(error) = signal {
                    warn!(%error, "failed to listen for ctrl-c");
                }
                break;
            }
            _ = status_log.tick() => {
                let status = feed_sync_status(&state).await?;
                info!(
                    state = ?status.state,
                    phase = ?status.loading_phase,
                    quality = ?status.connection.connection_quality,
                    trades = status.cached_trades,
                    mindmaps = status.cached_mindmaps,
                    reason = status.reason.as_deref().unwrap_or(""),
                    "feed status"
                );
            }
        }
    }

    shutdown_feed_sync(&state).await;
    Ok(())
}
