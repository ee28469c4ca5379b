use crate::error::AppError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

pub const DEFAULT_API_URL: &str = "http://localhost:5000/api";
pub const DEFAULT_MAX_TRADES: usize = 50;
pub const MIN_MAX_TRADES: usize = 25;
pub const MAX_MAX_TRADES: usize = 100;
pub const DEFAULT_MAX_MINDMAP_ENTRIES: usize = 20;
pub const MIN_MAX_MINDMAP_ENTRIES: usize = 1;
pub const MAX_MAX_MINDMAP_ENTRIES: usize = 200;
pub const DEFAULT_BATCH_INTERVAL_MS: u64 = 100;
pub const MIN_BATCH_INTERVAL_MS: u64 = 10;
pub const MAX_BATCH_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_MAX_BATCH_SIZE: usize = 50;
pub const DEFAULT_HIGH_PRIORITY_THRESHOLD: usize = 5;
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 5_000;
pub const MIN_HEARTBEAT_INTERVAL_MS: u64 = 1_000;
pub const MAX_HEARTBEAT_INTERVAL_MS: u64 = 60_000;
pub const DEFAULT_POLL_BASE_MS: u64 = 10_000;
pub const MIN_POLL_BASE_MS: u64 = 1_000;
pub const DEFAULT_POLL_CEILING_MS: u64 = 60_000;
pub const DEFAULT_HEALTH_CHECK_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_CLEANUP_INTERVAL_MS: u64 = 300_000;
pub const DEFAULT_OPTIMIZE_INTERVAL_MS: u64 = 600_000;
pub const DEFAULT_STALE_SUBSCRIPTION_MS: u64 = 3_600_000;
pub const DEFAULT_SUBSCRIBE_DEBOUNCE_MS: u64 = 1_000;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 15_000;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 8_000;
pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_MAX_RECONNECT_DELAY_MS: u64 = 5_000;
pub const DEFAULT_TRENDING_LIMIT: usize = 20;
pub const DEFAULT_MINDMAP_PRELOAD: usize = 5;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TradeType {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TradeData {
    pub token_in: String,
    pub token_out: String,
    pub amount_in: f64,
    pub amount_out: f64,
    pub trade_type: TradeType,
    pub mint: Option<String>,
    pub dex_program: String,
    pub fee: Option<f64>,
    pub name: Option<String>,
    pub symbol: Option<String>,
    pub image: Option<String>,
    pub metadata_uri: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Trade {
    pub id: String,
    pub kol_wallet: String,
    pub signature: String,
    /// Unix milliseconds.
    pub timestamp: i64,
    pub trade_data: TradeData,
    pub affected_users: Vec<String>,
    pub processed: bool,
    pub prediction: Option<serde_json::Value>,
}

impl Trade {
    /// The traded token: explicit mint, else the non-SOL side of the swap.
    pub fn token_mint(&self) -> &str {
        if let Some(mint) = self.trade_data.mint.as_deref() {
            return mint;
        }
        match self.trade_data.trade_type {
            TradeType::Buy => &self.trade_data.token_out,
            TradeType::Sell => &self.trade_data.token_in,
        }
    }

    /// Volume on the SOL side of the swap.
    pub fn sol_volume(&self) -> f64 {
        match self.trade_data.trade_type {
            TradeType::Buy => self.trade_data.amount_in,
            TradeType::Sell => self.trade_data.amount_out,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KolConnection {
    pub trade_count: u64,
    pub total_volume: f64,
    pub last_trade_time: i64,
    pub influence_score: f64,
    pub trade_types: Vec<TradeType>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkMetrics {
    pub centrality: f64,
    pub clustering: f64,
    pub total_trades: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MindmapUpdate {
    pub token_mint: String,
    pub kol_connections: HashMap<String, KolConnection>,
    pub related_tokens: Vec<String>,
    pub network_metrics: NetworkMetrics,
    pub last_update: i64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub total_trades: u64,
    #[serde(rename = "uniqueKOLs")]
    pub unique_kols: u64,
    pub unique_tokens: u64,
    pub total_volume: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    Excellent,
    Good,
    Poor,
    Critical,
}

impl ConnectionQuality {
    pub fn from_latency_ms(latency_ms: u64) -> Self {
        if latency_ms < 100 {
            Self::Excellent
        } else if latency_ms < 300 {
            Self::Good
        } else if latency_ms < 1_000 {
            Self::Poor
        } else {
            Self::Critical
        }
    }

    pub fn degrade(self) -> Self {
        match self {
            Self::Excellent => Self::Good,
            Self::Good => Self::Poor,
            Self::Poor | Self::Critical => Self::Critical,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionHealth {
    pub is_connected: bool,
    pub is_connecting: bool,
    pub connection_quality: ConnectionQuality,
    pub latency_ms: Option<u64>,
    pub missed_heartbeats: u32,
    pub last_heartbeat_ts: Option<i64>,
    pub is_polling_mode: bool,
}

impl Default for ConnectionHealth {
    fn default() -> Self {
        Self::disconnected()
    }
}

impl ConnectionHealth {
    pub fn disconnected() -> Self {
        Self {
            is_connected: false,
            is_connecting: false,
            connection_quality: ConnectionQuality::Critical,
            latency_ms: None,
            missed_heartbeats: 0,
            last_heartbeat_ts: None,
            is_polling_mode: false,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.is_connected && self.connection_quality != ConnectionQuality::Critical
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateType {
    Trade,
    Price,
    Balance,
    Token,
    Portfolio,
    Mindmap,
    Stats,
}

impl UpdateType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Trade => "TRADE",
            Self::Price => "PRICE",
            Self::Balance => "BALANCE",
            Self::Token => "TOKEN",
            Self::Portfolio => "PORTFOLIO",
            Self::Mindmap => "MINDMAP",
            Self::Stats => "STATS",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UpdatePriority {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UpdateSource {
    WebSocket,
    Polling,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PriceUpdate {
    pub mint: String,
    pub price: f64,
    pub previous_price: Option<f64>,
    pub change_24h: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BalanceUpdate {
    pub wallet: String,
    pub mint: Option<String>,
    pub balance: f64,
    pub previous_balance: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TokenUpdate {
    pub category: String,
    pub tokens: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioUpdate {
    pub wallet: String,
    pub total_value: f64,
    pub pnl: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdatePayload {
    Trade(Trade),
    Price(PriceUpdate),
    Balance(BalanceUpdate),
    Token(TokenUpdate),
    Portfolio(PortfolioUpdate),
    Mindmap(MindmapUpdate),
    Stats(Stats),
}

impl UpdatePayload {
    pub fn update_type(&self) -> UpdateType {
        match self {
            Self::Trade(_) => UpdateType::Trade,
            Self::Price(_) => UpdateType::Price,
            Self::Balance(_) => UpdateType::Balance,
            Self::Token(_) => UpdateType::Token,
            Self::Portfolio(_) => UpdateType::Portfolio,
            Self::Mindmap(_) => UpdateType::Mindmap,
            Self::Stats(_) => UpdateType::Stats,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueuedUpdate {
    pub payload: UpdatePayload,
    pub priority: UpdatePriority,
    pub source: UpdateSource,
    pub timestamp: i64,
}

impl QueuedUpdate {
    pub fn update_type(&self) -> UpdateType {
        self.payload.update_type()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateBatch {
    pub id: u64,
    pub timestamp: i64,
    pub updates: Vec<QueuedUpdate>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LoadingPhase {
    Idle,
    Essential,
    Enhanced,
    Background,
    Complete,
}

impl LoadingPhase {
    fn rank(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Essential => 1,
            Self::Enhanced => 2,
            Self::Background => 3,
            Self::Complete => 4,
        }
    }

    /// Phases only move forward; `complete` is terminal.
    pub fn can_advance_to(self, next: Self) -> bool {
        next.rank() > self.rank()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Warning,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncNotice {
    pub level: NoticeLevel,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedSnapshot {
    pub trades: Vec<Trade>,
    pub mindmaps: Vec<MindmapUpdate>,
    pub stats: Option<Stats>,
    pub trending_tokens: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Stopped,
    Loading,
    Live,
    Degraded,
    Polling,
}

impl SyncState {
    pub fn derive(running: bool, phase: LoadingPhase, health: &ConnectionHealth) -> Self {
        if !running {
            Self::Stopped
        } else if health.is_polling_mode {
            Self::Polling
        } else if health.is_healthy() {
            Self::Live
        } else if phase != LoadingPhase::Complete {
            Self::Loading
        } else {
            Self::Degraded
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedStatusSnapshot {
    pub state: SyncState,
    pub running: bool,
    pub loading_phase: LoadingPhase,
    pub connection: ConnectionHealth,
    pub cached_trades: usize,
    pub cached_mindmaps: usize,
    pub subscribed_kols: usize,
    pub subscribed_tokens: usize,
    pub consumers: usize,
    pub reason: Option<String>,
}

impl FeedStatusSnapshot {
    pub fn stopped(reason: Option<String>) -> Self {
        Self {
            state: SyncState::Stopped,
            running: false,
            loading_phase: LoadingPhase::Idle,
            connection: ConnectionHealth::disconnected(),
            cached_trades: 0,
            cached_mindmaps: 0,
            subscribed_kols: 0,
            subscribed_tokens: 0,
            consumers: 0,
            reason,
        }
    }
}

/// `{success, message?, data}` wrapper used by every REST endpoint.
#[derive(Debug, Deserialize)]
pub struct ApiEnvelope<T> {
    pub success: bool,
    pub message: Option<String>,
    pub data: Option<T>,
}

impl<T> ApiEnvelope<T> {
    pub fn into_data(self) -> Result<T, AppError> {
        if !self.success {
            return Err(AppError::Api {
                message: self
                    .message
                    .unwrap_or_else(|| "request reported failure".to_string()),
            });
        }
        self.data.ok_or_else(|| AppError::Api {
            message: "successful response carried no data".to_string(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StartFeedSyncArgs {
    pub api_url: Option<String>,
    pub ws_url: Option<String>,
    pub auth_token: Option<String>,
    pub max_trades: Option<usize>,
    pub max_mindmap_entries: Option<usize>,
    pub batch_interval_ms: Option<u64>,
    pub max_batch_size: Option<usize>,
    pub high_priority_threshold: Option<usize>,
    pub heartbeat_interval_ms: Option<u64>,
    pub poll_base_ms: Option<u64>,
    pub active_kol_wallets: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct FeedSyncConfig {
    pub api_url: String,
    pub ws_url: Option<String>,
    pub auth_token: Option<String>,
    pub max_trades: usize,
    pub max_mindmap_entries: usize,
    pub batch_interval: Duration,
    pub max_batch_size: usize,
    pub high_priority_threshold: usize,
    pub heartbeat_interval: Duration,
    pub poll_base: Duration,
    pub poll_ceiling: Duration,
    pub health_check_interval: Duration,
    pub cleanup_interval: Duration,
    pub optimize_interval: Duration,
    pub stale_subscription: Duration,
    pub subscribe_debounce: Duration,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub reconnect_attempts: u32,
    pub max_reconnect_delay: Duration,
    pub trending_limit: usize,
    pub mindmap_preload: usize,
    pub active_kol_wallets: Vec<String>,
}

impl Default for FeedSyncConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            ws_url: None,
            auth_token: None,
            max_trades: DEFAULT_MAX_TRADES,
            max_mindmap_entries: DEFAULT_MAX_MINDMAP_ENTRIES,
            batch_interval: Duration::from_millis(DEFAULT_BATCH_INTERVAL_MS),
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            high_priority_threshold: DEFAULT_HIGH_PRIORITY_THRESHOLD,
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            poll_base: Duration::from_millis(DEFAULT_POLL_BASE_MS),
            poll_ceiling: Duration::from_millis(DEFAULT_POLL_CEILING_MS),
            health_check_interval: Duration::from_millis(DEFAULT_HEALTH_CHECK_INTERVAL_MS),
            cleanup_interval: Duration::from_millis(DEFAULT_CLEANUP_INTERVAL_MS),
            optimize_interval: Duration::from_millis(DEFAULT_OPTIMIZE_INTERVAL_MS),
            stale_subscription: Duration::from_millis(DEFAULT_STALE_SUBSCRIPTION_MS),
            subscribe_debounce: Duration::from_millis(DEFAULT_SUBSCRIBE_DEBOUNCE_MS),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            reconnect_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            max_reconnect_delay: Duration::from_millis(DEFAULT_MAX_RECONNECT_DELAY_MS),
            trending_limit: DEFAULT_TRENDING_LIMIT,
            mindmap_preload: DEFAULT_MINDMAP_PRELOAD,
            active_kol_wallets: Vec::new(),
        }
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

impl StartFeedSyncArgs {
    pub fn from_env() -> Self {
        Self {
            api_url: env_value("KOL_API_URL"),
            ws_url: env_value("KOL_WS_URL"),
            auth_token: env_value("KOL_AUTH_TOKEN"),
            max_trades: env_value("KOL_MAX_TRADES").and_then(|value| value.parse().ok()),
            poll_base_ms: env_value("KOL_POLL_BASE_MS").and_then(|value| value.parse().ok()),
            active_kol_wallets: env_value("KOL_ACTIVE_KOLS").map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|wallet| !wallet.is_empty())
                    .map(str::to_string)
                    .collect()
            }),
            ..Self::default()
        }
    }

    pub fn normalize(self) -> Result<FeedSyncConfig, AppError> {
        let defaults = FeedSyncConfig::default();

        let api_url = self
            .api_url
            .unwrap_or(defaults.api_url)
            .trim()
            .trim_end_matches('/')
            .to_string();
        if !(api_url.starts_with("http://") || api_url.starts_with("https://")) {
            return Err(AppError::InvalidArgument(
                "apiUrl must be an absolute http(s) URL".to_string(),
            ));
        }

        let ws_url = self
            .ws_url
            .map(|value| value.trim().trim_end_matches('/').to_string())
            .filter(|value| !value.is_empty());
        if let Some(value) = ws_url.as_deref() {
            let scheme_ok = ["ws://", "wss://", "http://", "https://"]
                .iter()
                .any(|scheme| value.starts_with(scheme));
            if !scheme_ok {
                return Err(AppError::InvalidArgument(
                    "wsUrl must use ws, wss, http or https".to_string(),
                ));
            }
        }

        let auth_token = self
            .auth_token
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        let max_trades = self.max_trades.unwrap_or(defaults.max_trades);
        if !(MIN_MAX_TRADES..=MAX_MAX_TRADES).contains(&max_trades) {
            return Err(AppError::InvalidArgument(format!(
                "maxTrades must be between {MIN_MAX_TRADES} and {MAX_MAX_TRADES}"
            )));
        }

        let max_mindmap_entries = self
            .max_mindmap_entries
            .unwrap_or(defaults.max_mindmap_entries);
        if !(MIN_MAX_MINDMAP_ENTRIES..=MAX_MAX_MINDMAP_ENTRIES).contains(&max_mindmap_entries) {
            return Err(AppError::InvalidArgument(format!(
                "maxMindmapEntries must be between {MIN_MAX_MINDMAP_ENTRIES} and {MAX_MAX_MINDMAP_ENTRIES}"
            )));
        }

        let batch_interval_ms = self.batch_interval_ms.unwrap_or(DEFAULT_BATCH_INTERVAL_MS);
        if !(MIN_BATCH_INTERVAL_MS..=MAX_BATCH_INTERVAL_MS).contains(&batch_interval_ms) {
            return Err(AppError::InvalidArgument(format!(
                "batchIntervalMs must be between {MIN_BATCH_INTERVAL_MS} and {MAX_BATCH_INTERVAL_MS}"
            )));
        }

        let max_batch_size = self.max_batch_size.unwrap_or(defaults.max_batch_size);
        if max_batch_size == 0 {
            return Err(AppError::InvalidArgument(
                "maxBatchSize must be positive".to_string(),
            ));
        }

        let high_priority_threshold = self
            .high_priority_threshold
            .unwrap_or(defaults.high_priority_threshold);
        if high_priority_threshold == 0 {
            return Err(AppError::InvalidArgument(
                "highPriorityThreshold must be positive".to_string(),
            ));
        }

        let heartbeat_interval_ms = self
            .heartbeat_interval_ms
            .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_MS);
        if !(MIN_HEARTBEAT_INTERVAL_MS..=MAX_HEARTBEAT_INTERVAL_MS).contains(&heartbeat_interval_ms)
        {
            return Err(AppError::InvalidArgument(format!(
                "heartbeatIntervalMs must be between {MIN_HEARTBEAT_INTERVAL_MS} and {MAX_HEARTBEAT_INTERVAL_MS}"
            )));
        }

        let poll_base_ms = self.poll_base_ms.unwrap_or(DEFAULT_POLL_BASE_MS);
        if !(MIN_POLL_BASE_MS..=DEFAULT_POLL_CEILING_MS).contains(&poll_base_ms) {
            return Err(AppError::InvalidArgument(format!(
                "pollBaseMs must be between {MIN_POLL_BASE_MS} and {DEFAULT_POLL_CEILING_MS}"
            )));
        }

        let mut active_kol_wallets = self.active_kol_wallets.unwrap_or_default();
        active_kol_wallets.retain(|wallet| !wallet.trim().is_empty());
        active_kol_wallets.sort_unstable();
        active_kol_wallets.dedup();

        Ok(FeedSyncConfig {
            api_url,
            ws_url,
            auth_token,
            max_trades,
            max_mindmap_entries,
            batch_interval: Duration::from_millis(batch_interval_ms),
            max_batch_size,
            high_priority_threshold,
            heartbeat_interval: Duration::from_millis(heartbeat_interval_ms),
            poll_base: Duration::from_millis(poll_base_ms),
            active_kol_wallets,
            ..defaults
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedSyncSession {
    pub api_url: String,
    pub started: bool,
    pub consumers: usize,
    pub active_kol_wallets: Vec<String>,
}

impl FeedSyncSession {
    pub fn from_config(config: &FeedSyncConfig, started: bool, consumers: usize) -> Self {
        Self {
            api_url: config.api_url.clone(),
            started,
            consumers,
            active_kol_wallets: config.active_kol_wallets.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedSyncStopResult {
    pub stopped: bool,
    pub consumers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KolSubscriptionArgs {
    pub kol_wallet: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenMindmapArgs {
    pub token_mint: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_start_args_defaults() {
        let config = StartFeedSyncArgs::default()
            .normalize()
            .expect("defaults should be valid");

        assert_eq!(config.api_url, DEFAULT_API_URL);
        assert_eq!(config.max_trades, DEFAULT_MAX_TRADES);
        assert_eq!(config.max_mindmap_entries, DEFAULT_MAX_MINDMAP_ENTRIES);
        assert_eq!(
            config.batch_interval,
            Duration::from_millis(DEFAULT_BATCH_INTERVAL_MS)
        );
        assert_eq!(config.high_priority_threshold, 5);
        assert_eq!(config.poll_ceiling, Duration::from_secs(60));
        assert!(config.auth_token.is_none());
    }

    #[test]
    fn validates_max_trades_range() {
        let result = StartFeedSyncArgs {
            max_trades: Some(10),
            ..StartFeedSyncArgs::default()
        }
        .normalize();

        assert!(result.is_err());
    }

    #[test]
    fn rejects_relative_api_url() {
        let result = StartFeedSyncArgs {
            api_url: Some("/api".to_string()),
            ..StartFeedSyncArgs::default()
        }
        .normalize();

        assert!(result.is_err());
    }

    #[test]
    fn dedups_active_wallets_and_trims_url() {
        let config = StartFeedSyncArgs {
            api_url: Some("https://kol.example.com/api/".to_string()),
            active_kol_wallets: Some(vec![
                "W2".to_string(),
                "W1".to_string(),
                "W2".to_string(),
                " ".to_string(),
            ]),
            ..StartFeedSyncArgs::default()
        }
        .normalize()
        .expect("args should be valid");

        assert_eq!(config.api_url, "https://kol.example.com/api");
        assert_eq!(config.active_kol_wallets, vec!["W1", "W2"]);
    }

    #[test]
    fn classifies_latency_thresholds() {
        assert_eq!(ConnectionQuality::from_latency_ms(40), ConnectionQuality::Excellent);
        assert_eq!(ConnectionQuality::from_latency_ms(150), ConnectionQuality::Good);
        assert_eq!(ConnectionQuality::from_latency_ms(700), ConnectionQuality::Poor);
        assert_eq!(ConnectionQuality::from_latency_ms(1_000), ConnectionQuality::Critical);
        assert_eq!(ConnectionQuality::Good.degrade(), ConnectionQuality::Poor);
        assert_eq!(ConnectionQuality::Critical.degrade(), ConnectionQuality::Critical);
    }

    #[test]
    fn loading_phase_only_moves_forward() {
        assert!(LoadingPhase::Idle.can_advance_to(LoadingPhase::Essential));
        assert!(LoadingPhase::Essential.can_advance_to(LoadingPhase::Complete));
        assert!(!LoadingPhase::Complete.can_advance_to(LoadingPhase::Idle));
        assert!(!LoadingPhase::Enhanced.can_advance_to(LoadingPhase::Essential));
    }

    #[test]
    fn sync_state_prefers_polling_then_health() {
        let mut health = ConnectionHealth::disconnected();
        assert_eq!(
            SyncState::derive(false, LoadingPhase::Complete, &health),
            SyncState::Stopped
        );
        assert_eq!(
            SyncState::derive(true, LoadingPhase::Essential, &health),
            SyncState::Loading
        );
        assert_eq!(
            SyncState::derive(true, LoadingPhase::Complete, &health),
            SyncState::Degraded
        );

        health.is_connected = true;
        health.connection_quality = ConnectionQuality::Good;
        assert_eq!(
            SyncState::derive(true, LoadingPhase::Complete, &health),
            SyncState::Live
        );

        health.is_polling_mode = true;
        assert_eq!(
            SyncState::derive(true, LoadingPhase::Complete, &health),
            SyncState::Polling
        );
    }

    #[test]
    fn envelope_requires_success_flag() {
        let failed: ApiEnvelope<Stats> = ApiEnvelope {
            success: false,
            message: Some("rate limited".to_string()),
            data: Some(Stats::default()),
        };
        assert!(matches!(failed.into_data(), Err(AppError::Api { .. })));

        let ok: ApiEnvelope<Stats> = ApiEnvelope {
            success: true,
            message: None,
            data: Some(Stats {
                total_trades: 3,
                ..Stats::default()
            }),
        };
        assert_eq!(ok.into_data().expect("data present").total_trades, 3);
    }

    #[test]
    fn derives_token_mint_from_trade_side() {
        let mut trade = Trade {
            id: "t1".to_string(),
            kol_wallet: "W1".to_string(),
            signature: "sig".to_string(),
            timestamp: 1,
            trade_data: TradeData {
                token_in: "SOL".to_string(),
                token_out: "M1".to_string(),
                amount_in: 2.0,
                amount_out: 1_000.0,
                trade_type: TradeType::Buy,
                mint: None,
                dex_program: "pump".to_string(),
                fee: None,
                name: None,
                symbol: None,
                image: None,
                metadata_uri: None,
            },
            affected_users: Vec::new(),
            processed: false,
            prediction: None,
        };
        assert_eq!(trade.token_mint(), "M1");
        assert_eq!(trade.sol_volume(), 2.0);

        trade.trade_data.trade_type = TradeType::Sell;
        trade.trade_data.token_in = "M2".to_string();
        assert_eq!(trade.token_mint(), "M2");

        trade.trade_data.mint = Some("M3".to_string());
        assert_eq!(trade.token_mint(), "M3");
    }
}
