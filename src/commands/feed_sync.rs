use crate::error::AppError;
use crate::feed::persistence;
use crate::feed::pipeline::FeedSync;
use crate::feed::types::{
    FeedSnapshot, FeedStatusSnapshot, FeedSyncSession, FeedSyncStopResult, KolSubscriptionArgs,
    MindmapUpdate, StartFeedSyncArgs, TokenMindmapArgs,
};
use crate::state::AppState;
use std::sync::Arc;
use tracing::{info, warn};

/// Starts the shared feed, or joins it as one more consumer when already running.
pub async fn start_feed_sync(
    state: &AppState,
    args: Option<StartFeedSyncArgs>,
) -> Result<FeedSyncSession, AppError> {
    let config = args.unwrap_or_default().normalize()?;

    let mut feed_slot = state.feed.lock().await;
    if let Some(feed) = feed_slot.as_ref() {
        let consumers = feed.acquire();
        return Ok(FeedSyncSession::from_config(feed.config(), false, consumers));
    }

    if let (Some(pool), Some(token)) = (state.db_pool.as_ref(), config.auth_token.as_deref()) {
        if let Err(error) = persistence::store_auth_token(pool, token).await {
            warn!(%error, "failed to remember auth token");
        }
    }

    let feed = FeedSync::launch(
        config,
        state.db_pool.clone(),
        Arc::clone(&state.feed_status),
    )
    .await?;
    let consumers = feed.acquire();
    let session = FeedSyncSession::from_config(feed.config(), true, consumers);
    *feed_slot = Some(feed);

    Ok(session)
}

/// Drops one consumer; the feed shuts down when the last one leaves.
pub async fn stop_feed_sync(state: &AppState) -> Result<FeedSyncStopResult, AppError> {
    let existing_feed = {
        let mut feed_slot = state.feed.lock().await;
        let Some(feed) = feed_slot.as_ref() else {
            return Ok(FeedSyncStopResult {
                stopped: false,
                consumers: 0,
            });
        };
        let remaining = feed.release();
        if remaining > 0 {
            return Ok(FeedSyncStopResult {
                stopped: false,
                consumers: remaining,
            });
        }
        feed_slot.take()
    };

    let stopped = match existing_feed {
        Some(feed) => feed.stop().await,
        None => false,
    };
    write_stopped_status(state, "feed stopped by command").await;

    Ok(FeedSyncStopResult {
        stopped,
        consumers: 0,
    })
}

/// Stops the feed regardless of how many consumers hold it.
pub async fn shutdown_feed_sync(state: &AppState) -> bool {
    let existing_feed = state.feed.lock().await.take();
    let Some(feed) = existing_feed else {
        return false;
    };
    let stopped = feed.stop().await;
    write_stopped_status(state, "feed shut down").await;
    info!("feed sync shut down");
    stopped
}

async fn write_stopped_status(state: &AppState, reason: &str) {
    let mut writable = state.feed_status.write().await;
    *writable = FeedStatusSnapshot::stopped(Some(reason.to_string()));
}

pub async fn feed_sync_status(state: &AppState) -> Result<FeedStatusSnapshot, AppError> {
    let snapshot = state.feed_status.read().await.clone();
    Ok(snapshot)
}

pub async fn feed_snapshot(state: &AppState) -> Result<FeedSnapshot, AppError> {
    let feed_slot = state.feed.lock().await;
    Ok(feed_slot
        .as_ref()
        .map(|feed| feed.snapshot())
        .unwrap_or_default())
}

async fn running_feed(state: &AppState) -> Result<Arc<FeedSync>, AppError> {
    state
        .feed
        .lock()
        .await
        .as_ref()
        .map(Arc::clone)
        .ok_or_else(|| AppError::InvalidArgument("feed sync is not running".to_string()))
}

fn normalize_wallet(args: KolSubscriptionArgs) -> Result<String, AppError> {
    let wallet = args.kol_wallet.trim().to_string();
    if wallet.is_empty() {
        return Err(AppError::InvalidArgument(
            "kolWallet must not be empty".to_string(),
        ));
    }
    Ok(wallet)
}

pub async fn subscribe_kol(state: &AppState, args: KolSubscriptionArgs) -> Result<bool, AppError> {
    let wallet = normalize_wallet(args)?;
    let feed = running_feed(state).await?;
    Ok(feed.subscribe_kol(&wallet))
}

pub async fn unsubscribe_kol(
    state: &AppState,
    args: KolSubscriptionArgs,
) -> Result<bool, AppError> {
    let wallet = normalize_wallet(args)?;
    let feed = running_feed(state).await?;
    Ok(feed.unsubscribe_kol(&wallet))
}

/// One token's mindmap, back-filled from the single-token endpoint when not cached.
pub async fn token_mindmap(
    state: &AppState,
    args: TokenMindmapArgs,
) -> Result<MindmapUpdate, AppError> {
    let token_mint = args.token_mint.trim().to_string();
    if token_mint.is_empty() {
        return Err(AppError::InvalidArgument(
            "tokenMint must not be empty".to_string(),
        ));
    }
    let feed = running_feed(state).await?;
    feed.token_mindmap(&token_mint).await
}
