//! Initial population of the event cache: `idle -> essential -> enhanced -> background ->
//! complete`, cache-first, with a demo dataset when nothing can be fetched.

use crate::error::AppError;
use crate::feed::api::FeedApi;
use crate::feed::cache::BoundedEventCache;
use crate::feed::connection::ConnectionManager;
use crate::feed::persistence;
use crate::feed::types::{
    FeedSyncConfig, LoadingPhase, MindmapUpdate, NoticeLevel, Stats, SyncNotice, Trade, TradeData,
    TradeType,
};
use crate::feed::now_unix_ms;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

const DEMO_WALLET_A: &str = "DemoKo1Wa11etA111111111111111111111111111111";
const DEMO_WALLET_B: &str = "DemoKo1Wa11etB222222222222222222222222222222";
const WRAPPED_SOL_MINT: &str = "So11111111111111111111111111111111111111112";
const MOCK_DATA_NOTICE: &str =
    "Live KOL data is unavailable; showing demo data until the connection recovers.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    /// Every essential entry came from the local mirror.
    Cache,
    Network,
    Mock,
    /// Another caller already ran (or is running) the load.
    AlreadyLoaded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadReport {
    pub source: LoadSource,
    pub rest_calls: usize,
    pub mindmaps_loaded: usize,
}

impl LoadReport {
    fn already_loaded() -> Self {
        Self {
            source: LoadSource::AlreadyLoaded,
            rest_calls: 0,
            mindmaps_loaded: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub trade_limit: usize,
    pub trending_limit: usize,
    pub mindmap_preload: usize,
}

impl LoaderConfig {
    pub fn from_feed(config: &FeedSyncConfig) -> Self {
        Self {
            trade_limit: config.max_trades,
            trending_limit: config.trending_limit,
            mindmap_preload: config.mindmap_preload,
        }
    }
}

#[derive(Debug)]
struct LoaderState {
    has_initialized: bool,
    is_initializing: bool,
    history: Vec<LoadingPhase>,
}

enum Entry {
    Run,
    Wait,
    Done,
}

/// Essential data after merging the mirror with whatever the network returned.
struct Essentials {
    trades: Option<Vec<Trade>>,
    stats: Option<Stats>,
    trending: Option<Vec<String>>,
}

pub struct PhasedLoader {
    api: Arc<dyn FeedApi>,
    cache: Arc<Mutex<BoundedEventCache>>,
    connection: Arc<ConnectionManager>,
    pool: Option<SqlitePool>,
    notices: broadcast::Sender<SyncNotice>,
    config: LoaderConfig,
    state: Mutex<LoaderState>,
    phase: watch::Sender<LoadingPhase>,
    mindmaps_ready: AtomicBool,
    enhanced_in_flight: AtomicBool,
}

impl PhasedLoader {
    pub fn new(
        api: Arc<dyn FeedApi>,
        cache: Arc<Mutex<BoundedEventCache>>,
        connection: Arc<ConnectionManager>,
        pool: Option<SqlitePool>,
        notices: broadcast::Sender<SyncNotice>,
        config: LoaderConfig,
    ) -> Self {
        let (phase, _) = watch::channel(LoadingPhase::Idle);
        Self {
            api,
            cache,
            connection,
            pool,
            notices,
            config,
            state: Mutex::new(LoaderState {
                has_initialized: false,
                is_initializing: false,
                history: Vec::new(),
            }),
            phase,
            mindmaps_ready: AtomicBool::new(false),
            enhanced_in_flight: AtomicBool::new(false),
        }
    }

    pub fn phase(&self) -> LoadingPhase {
        *self.phase.borrow()
    }

    pub fn phase_receiver(&self) -> watch::Receiver<LoadingPhase> {
        self.phase.subscribe()
    }

    /// Every phase entered so far, in order.
    pub fn phase_history(&self) -> Vec<LoadingPhase> {
        self.state.lock().history.clone()
    }

    pub fn has_initialized(&self) -> bool {
        self.state.lock().has_initialized
    }

    /// Whether the enhanced phase still owes a mindmap preload.
    pub fn needs_enhanced_retry(&self) -> bool {
        !self.mindmaps_ready.load(Ordering::Acquire)
    }

    fn advance(&self, next: LoadingPhase) {
        let mut state = self.state.lock();
        let current = *self.phase.borrow();
        if !current.can_advance_to(next) {
            debug!(?current, ?next, "ignoring backwards loading phase transition");
            return;
        }
        state.history.push(next);
        self.phase.send_replace(next);
        debug!(phase = ?next, "loading phase advanced");
    }

    /// Runs the load once. Concurrent callers wait for the first run to finish.
    pub async fn run(&self) -> LoadReport {
        let entry = {
            let mut state = self.state.lock();
            if state.has_initialized {
                Entry::Done
            } else if state.is_initializing {
                Entry::Wait
            } else {
                state.is_initializing = true;
                Entry::Run
            }
        };

        match entry {
            Entry::Done => LoadReport::already_loaded(),
            Entry::Wait => {
                let mut phase = self.phase.subscribe();
                let _ = phase
                    .wait_for(|phase| *phase == LoadingPhase::Complete)
                    .await;
                LoadReport::already_loaded()
            }
            Entry::Run => {
                let report = self.execute().await;
                let mut state = self.state.lock();
                state.is_initializing = false;
                state.has_initialized = true;
                report
            }
        }
    }

    async fn execute(&self) -> LoadReport {
        self.advance(LoadingPhase::Essential);

        let (cached_trades, cached_stats, cached_trending) = self.read_mirror().await;
        if let (Some(trades), Some(stats), Some(trending)) =
            (&cached_trades, &cached_stats, &cached_trending)
        {
            {
                let mut cache = self.cache.lock();
                cache.replace_trades(trades.clone());
                cache.set_stats(*stats);
                cache.set_trending_tokens(trending.clone());
            }
            info!(trades = trades.len(), "essential data served from local mirror");
            self.advance(LoadingPhase::Complete);
            return LoadReport {
                source: LoadSource::Cache,
                rest_calls: 0,
                mindmaps_loaded: 0,
            };
        }

        let had_cached =
            cached_trades.is_some() || cached_stats.is_some() || cached_trending.is_some();
        let trades_call = cached_trades
            .is_none()
            .then(|| self.api.recent_trades(self.config.trade_limit));
        let stats_call = cached_stats.is_none().then(|| self.api.stats());
        let trending_call = cached_trending
            .is_none()
            .then(|| self.api.trending_tokens(self.config.trending_limit));
        let rest_calls = [
            trades_call.is_some(),
            stats_call.is_some(),
            trending_call.is_some(),
        ]
        .into_iter()
        .filter(|issued| *issued)
        .count();

        let (trades, stats, trending) =
            tokio::join!(settle(trades_call), settle(stats_call), settle(trending_call));

        let all_failed = !had_cached
            && [trades.is_ok(), stats.is_ok(), trending.is_ok()]
                .into_iter()
                .all(|ok| !ok);
        if all_failed {
            warn!("all essential requests failed; loading demo dataset");
            self.apply_mock_dataset();
            let _ = self.notices.send(SyncNotice {
                level: NoticeLevel::Warning,
                message: MOCK_DATA_NOTICE.to_string(),
            });
            self.advance(LoadingPhase::Background);
            self.connection.connect(None);
            self.advance(LoadingPhase::Complete);
            return LoadReport {
                source: LoadSource::Mock,
                rest_calls,
                mindmaps_loaded: 0,
            };
        }

        let essentials = Essentials {
            trades: self.merge("recent_trades", cached_trades, trades).await,
            stats: self.merge("stats", cached_stats, stats).await,
            trending: self.merge("trending_tokens", cached_trending, trending).await,
        };
        let trending = essentials.trending.clone().unwrap_or_default();
        self.apply_essentials(essentials);

        self.advance(LoadingPhase::Enhanced);
        let mindmaps_loaded = match self.preload_mindmaps(&trending).await {
            Ok(loaded) => loaded,
            Err(error) => {
                warn!(%error, "mindmap preload failed; will retry on next trending update");
                0
            }
        };

        self.advance(LoadingPhase::Background);
        self.connection.connect(None);
        self.advance(LoadingPhase::Complete);

        info!(rest_calls, mindmaps_loaded, "initial feed load complete");
        LoadReport {
            source: LoadSource::Network,
            rest_calls,
            mindmaps_loaded,
        }
    }

    async fn read_mirror(&self) -> (Option<Vec<Trade>>, Option<Stats>, Option<Vec<String>>) {
        let Some(pool) = self.pool.as_ref() else {
            return (None, None, None);
        };
        let (trades, stats, trending) = tokio::join!(
            persistence::load_trades(pool),
            persistence::load_stats(pool),
            persistence::load_trending(pool),
        );
        (
            mirror_hit("trades", trades),
            mirror_hit("stats", stats),
            mirror_hit("trending", trending),
        )
    }

    /// Prefers the mirror; otherwise keeps the fetched value and mirrors it.
    async fn merge<T>(
        &self,
        label: &'static str,
        cached: Option<T>,
        fetched: Result<T, AppError>,
    ) -> Option<T>
    where
        T: MirrorValue,
    {
        if cached.is_some() {
            return cached;
        }
        match fetched {
            Ok(value) => {
                if let Some(pool) = self.pool.as_ref() {
                    if let Err(error) = value.store(pool).await {
                        warn!(endpoint = label, %error, "failed to mirror essential data");
                    }
                }
                Some(value)
            }
            Err(error) => {
                warn!(endpoint = label, %error, "essential request failed");
                None
            }
        }
    }

    fn apply_essentials(&self, essentials: Essentials) {
        let mut cache = self.cache.lock();
        if let Some(trades) = essentials.trades {
            cache.replace_trades(trades);
        }
        if let Some(stats) = essentials.stats {
            cache.set_stats(stats);
        }
        if let Some(trending) = essentials.trending {
            cache.set_trending_tokens(trending);
        }
    }

    fn apply_mock_dataset(&self) {
        let (trades, stats, trending) = mock_dataset();
        let mut cache = self.cache.lock();
        cache.replace_trades(trades);
        cache.set_stats(stats);
        cache.set_trending_tokens(trending);
    }

    /// Bulk-loads mindmaps for the top trending mints, mirror first.
    async fn preload_mindmaps(&self, trending: &[String]) -> Result<usize, AppError> {
        let wanted: Vec<String> = trending
            .iter()
            .take(self.config.mindmap_preload)
            .cloned()
            .collect();
        if wanted.is_empty() {
            return Ok(0);
        }

        let mut loaded = Vec::new();
        let mut missing = Vec::new();
        for mint in wanted {
            let cached = match self.pool.as_ref() {
                Some(pool) => mirror_hit("mindmap", persistence::load_mindmap(pool, &mint).await),
                None => None,
            };
            match cached {
                Some(mindmap) => loaded.push(mindmap),
                None => missing.push(mint),
            }
        }

        if !missing.is_empty() {
            let fetched = self.api.bulk_mindmaps(missing).await?;
            if let Some(pool) = self.pool.as_ref() {
                for mindmap in &fetched {
                    if let Err(error) = persistence::store_mindmap(pool, mindmap).await {
                        warn!(mint = %mindmap.token_mint, %error, "failed to mirror mindmap");
                    }
                }
            }
            loaded.extend(fetched);
        }

        let count = loaded.len();
        self.store_mindmaps(loaded);
        self.mindmaps_ready.store(true, Ordering::Release);
        Ok(count)
    }

    fn store_mindmaps(&self, mindmaps: Vec<MindmapUpdate>) {
        let mut cache = self.cache.lock();
        for mindmap in mindmaps {
            cache.upsert_mindmap(mindmap);
        }
    }

    /// Re-runs the mindmap preload after an earlier failure. Returns whether it ran and
    /// succeeded.
    pub async fn retry_enhanced(&self, trending: &[String]) -> bool {
        if !self.needs_enhanced_retry() || trending.is_empty() {
            return false;
        }
        if self
            .enhanced_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let result = self.preload_mindmaps(trending).await;
        self.enhanced_in_flight.store(false, Ordering::Release);
        match result {
            Ok(loaded) => {
                info!(loaded, "mindmap preload recovered");
                true
            }
            Err(error) => {
                debug!(%error, "mindmap preload retry failed");
                false
            }
        }
    }
}

async fn settle<T>(call: Option<BoxFuture<'_, Result<T, AppError>>>) -> Result<T, AppError> {
    match call {
        Some(call) => call.await,
        None => Err(AppError::InvalidArgument("request skipped".to_string())),
    }
}

fn mirror_hit<T>(label: &'static str, result: Result<Option<T>, AppError>) -> Option<T> {
    match result {
        Ok(value) => value,
        Err(error) => {
            warn!(entry = label, %error, "local mirror read failed");
            None
        }
    }
}

/// Values the essential phase writes back to the local mirror.
trait MirrorValue {
    fn store<'a>(&'a self, pool: &'a SqlitePool) -> BoxFuture<'a, Result<(), AppError>>;
}

impl MirrorValue for Vec<Trade> {
    fn store<'a>(&'a self, pool: &'a SqlitePool) -> BoxFuture<'a, Result<(), AppError>> {
        Box::pin(persistence::store_trades(pool, self))
    }
}

impl MirrorValue for Stats {
    fn store<'a>(&'a self, pool: &'a SqlitePool) -> BoxFuture<'a, Result<(), AppError>> {
        Box::pin(persistence::store_stats(pool, self))
    }
}

impl MirrorValue for Vec<String> {
    fn store<'a>(&'a self, pool: &'a SqlitePool) -> BoxFuture<'a, Result<(), AppError>> {
        Box::pin(persistence::store_trending(pool, self))
    }
}

fn mock_trade(
    id: &str,
    wallet: &str,
    mint: &str,
    symbol: &str,
    trade_type: TradeType,
    at: i64,
) -> Trade {
    let (token_in, token_out) = match trade_type {
        TradeType::Buy => (WRAPPED_SOL_MINT, mint),
        TradeType::Sell => (mint, WRAPPED_SOL_MINT),
    };
    Trade {
        id: id.to_string(),
        kol_wallet: wallet.to_string(),
        signature: format!("demo-signature-{id}"),
        timestamp: at,
        trade_data: TradeData {
            token_in: token_in.to_string(),
            token_out: token_out.to_string(),
            amount_in: 1.5,
            amount_out: 125_000.0,
            trade_type,
            mint: Some(mint.to_string()),
            dex_program: "demo".to_string(),
            fee: None,
            name: Some(format!("{symbol} Demo")),
            symbol: Some(symbol.to_string()),
            image: None,
            metadata_uri: None,
        },
        affected_users: Vec::new(),
        processed: true,
        prediction: None,
    }
}

/// Small fixed dataset that keeps the feed demonstrable without a backend.
pub fn mock_dataset() -> (Vec<Trade>, Stats, Vec<String>) {
    let now = now_unix_ms();
    let trades = vec![
        mock_trade("demo-1", DEMO_WALLET_A, "DemoMint1", "DEMO1", TradeType::Buy, now),
        mock_trade("demo-2", DEMO_WALLET_B, "DemoMint2", "DEMO2", TradeType::Sell, now - 60_000),
        mock_trade("demo-3", DEMO_WALLET_A, "DemoMint2", "DEMO2", TradeType::Buy, now - 120_000),
    ];
    let stats = Stats {
        total_trades: trades.len() as u64,
        unique_kols: 2,
        unique_tokens: 2,
        total_volume: trades.iter().map(Trade::sol_volume).sum(),
    };
    (trades, stats, vec!["DemoMint1".to_string(), "DemoMint2".to_string()])
}
