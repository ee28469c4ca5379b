pub mod api;
pub mod batching;
pub mod cache;
pub mod codec;
pub mod connection;
#[cfg(test)]
pub(crate) mod fixtures;
pub mod loader;
pub mod payload;
pub mod persistence;
pub mod pipeline;
pub mod polling;
pub mod subscriptions;
pub mod types;

use std::time::{SystemTime, UNIX_EPOCH};

pub const SUBSCRIBE_KOL_TRADES_EVENT: &str = "subscribe_kol_trades";
pub const SUBSCRIBE_ALL_TOKEN_ACTIVITY_EVENT: &str = "subscribe_all_token_activity";
pub const SUBSCRIBE_MINDMAP_EVENT: &str = "subscribe_mindmap";
pub const SUBSCRIBE_KOL_MINDMAP_EVENT: &str = "subscribe_kol_mindmap";
pub const UNSUBSCRIBE_KOL_MINDMAP_EVENT: &str = "unsubscribe_kol_mindmap";
pub const PING_EVENT: &str = "ping";
pub const HEARTBEAT_EVENT: &str = "heartbeat";

pub const PONG_EVENT: &str = "pong";
pub const KOL_TRADE_UPDATE_EVENT: &str = "kol_trade_update";
pub const KOL_TRADE_DETECTED_EVENT: &str = "kol_trade_detected";
pub const MINDMAP_UPDATE_EVENT: &str = "mindmap_update";
pub const INITIAL_MINDMAP_DATA_EVENT: &str = "initial_mindmap_data";
pub const STATS_UPDATE_EVENT: &str = "stats_update";
pub const TRENDING_TOKENS_UPDATE_EVENT: &str = "trending_tokens_update";
pub const SUBSCRIPTION_UPDATED_EVENT: &str = "subscription_updated";
pub const FEATURED_KOLS_UPDATED_EVENT: &str = "featured_kols_updated";

pub(crate) fn now_unix_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis().min(i64::MAX as u128) as i64,
        Err(_) => 0,
    }
}
