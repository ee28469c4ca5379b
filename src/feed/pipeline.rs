use crate::error::AppError;
use crate::feed::api::{FeedApi, HttpFeedApi};
use crate::feed::batching::{
    trade_priority, BatchConfig, Delivery, RealTimeUpdateService, SubscriberId, SubscriberOptions,
    UpdateCallback,
};
use crate::feed::cache::BoundedEventCache;
use crate::feed::codec::{derive_socket_endpoint, SocketEvent};
use crate::feed::connection::{
    ConnectionConfig, ConnectionManager, SocketTransport, TungsteniteTransport,
};
use crate::feed::loader::{LoaderConfig, PhasedLoader};
use crate::feed::payload::{normalize_event, InboundEvent};
use crate::feed::persistence;
use crate::feed::polling::{
    HealthAction, HealthSupervisor, PollingConfig, PollingFallback, TRENDING_CATEGORY,
};
use crate::feed::subscriptions::SubscriptionTracker;
use crate::feed::types::{
    ConnectionHealth, FeedSnapshot, FeedStatusSnapshot, FeedSyncConfig, LoadingPhase,
    MindmapUpdate, NoticeLevel, QueuedUpdate, SyncNotice, SyncState, TokenUpdate,
    UpdatePayload, UpdatePriority, UpdateSource, UpdateType,
};
use parking_lot::Mutex;
use reqwest::Client;
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const STATUS_ERROR_THROTTLE_MS: u64 = 500;
const MIRROR_REFRESH_INTERVAL: Duration = Duration::from_secs(15);
const NOTICE_CAPACITY: usize = 32;

const POLLING_ENTERED_NOTICE: &str = "Realtime feed degraded; refreshing over HTTP.";
const POLLING_EXITED_NOTICE: &str = "Realtime feed restored.";

#[derive(Debug, Default)]
struct StatusPublishThrottle {
    last_state: Option<SyncState>,
    last_reason: Option<String>,
    last_emit: Option<Instant>,
}

impl StatusPublishThrottle {
    /// Repeated degraded/polling states with the same reason are dropped within the window.
    fn allow(&mut self, state: SyncState, reason: &Option<String>, now: Instant) -> bool {
        let should_throttle = matches!(state, SyncState::Degraded | SyncState::Polling);
        if should_throttle
            && self.last_state == Some(state)
            && self.last_reason == *reason
            && self
                .last_emit
                .map(|instant| {
                    now.duration_since(instant) < Duration::from_millis(STATUS_ERROR_THROTTLE_MS)
                })
                .unwrap_or(false)
        {
            return false;
        }

        self.last_state = Some(state);
        self.last_reason = reason.clone();
        self.last_emit = Some(now);
        true
    }
}

struct FeedRuntime {
    cancel_token: CancellationToken,
    join_handles: Vec<JoinHandle<()>>,
    cache_subscriber: SubscriberId,
}

/// Folds one batched delivery into the cache. Returns whether mirrored data changed.
///
/// Updates are applied in arrival order so the latest stats and mindmaps win. An aggregated
/// trade group arrives newest first and is replayed oldest first.
pub fn apply_delivery(cache: &mut BoundedEventCache, delivery: &Delivery) -> bool {
    let newest_first = delivery.aggregated && delivery.update_type == UpdateType::Trade;
    let ordered: Vec<&QueuedUpdate> = if newest_first {
        delivery.updates.iter().rev().collect()
    } else {
        delivery.updates.iter().collect()
    };

    let mut mirrored = false;
    for update in ordered {
        match &update.payload {
            UpdatePayload::Trade(trade) => {
                mirrored |= cache.push_trade(trade.clone());
            }
            UpdatePayload::Mindmap(mindmap) => {
                if let Some(evicted) = cache.upsert_mindmap(mindmap.clone()) {
                    debug!(mint = %evicted, "mindmap evicted from cache");
                }
            }
            UpdatePayload::Stats(stats) => {
                cache.set_stats(*stats);
                mirrored = true;
            }
            UpdatePayload::Token(TokenUpdate { category, tokens })
                if category == TRENDING_CATEGORY =>
            {
                cache.set_trending_tokens(tokens.clone());
                mirrored = true;
            }
            _ => {}
        }
    }
    mirrored
}

fn health_reason(health: &ConnectionHealth) -> String {
    if health.is_polling_mode {
        "polling REST endpoints".to_string()
    } else if health.is_connected {
        match health.latency_ms {
            Some(latency_ms) => format!(
                "socket connected ({:?}, {latency_ms} ms)",
                health.connection_quality
            ),
            None => format!("socket connected ({:?})", health.connection_quality),
        }
    } else if health.is_connecting {
        "connecting to feed socket".to_string()
    } else {
        "feed socket disconnected".to_string()
    }
}

/// One running KOL feed: cache, socket, batching, polling fallback and initial loader.
pub struct FeedSync {
    config: FeedSyncConfig,
    api: Arc<dyn FeedApi>,
    cache: Arc<Mutex<BoundedEventCache>>,
    connection: Arc<ConnectionManager>,
    tracker: Arc<SubscriptionTracker>,
    updates: Arc<RealTimeUpdateService>,
    polling: Arc<PollingFallback>,
    loader: Arc<PhasedLoader>,
    pool: Option<SqlitePool>,
    notices: broadcast::Sender<SyncNotice>,
    status_store: Arc<RwLock<FeedStatusSnapshot>>,
    status_throttle: Mutex<StatusPublishThrottle>,
    active_kols: Mutex<HashSet<String>>,
    consumers: AtomicUsize,
    mirror_dirty: Arc<AtomicBool>,
    socket_events: Mutex<Option<mpsc::UnboundedReceiver<SocketEvent>>>,
    runtime: Mutex<Option<FeedRuntime>>,
    running: AtomicBool,
}

impl FeedSync {
    /// Wires every component without starting any task.
    pub fn create(
        config: FeedSyncConfig,
        api: Arc<dyn FeedApi>,
        transport: Arc<dyn SocketTransport>,
        pool: Option<SqlitePool>,
        status_store: Arc<RwLock<FeedStatusSnapshot>>,
    ) -> Result<Arc<Self>, AppError> {
        let endpoint = derive_socket_endpoint(&config.api_url, config.ws_url.as_deref())?;
        let (connection, socket_events) =
            ConnectionManager::new(ConnectionConfig::from_feed(&config, endpoint.url()), transport);
        let tracker = Arc::new(SubscriptionTracker::new(
            Arc::clone(&connection),
            config.subscribe_debounce,
            config.stale_subscription,
        ));
        let updates = RealTimeUpdateService::new(BatchConfig {
            batch_interval: config.batch_interval,
            max_batch_size: config.max_batch_size,
            high_priority_threshold: config.high_priority_threshold,
        });
        let polling = PollingFallback::new(
            Arc::clone(&api),
            Arc::clone(&updates),
            Arc::clone(&connection),
            PollingConfig::from_feed(&config),
        );
        let cache = Arc::new(Mutex::new(BoundedEventCache::new(
            config.max_trades,
            config.max_mindmap_entries,
        )));
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        let loader = Arc::new(PhasedLoader::new(
            Arc::clone(&api),
            Arc::clone(&cache),
            Arc::clone(&connection),
            pool.clone(),
            notices.clone(),
            LoaderConfig::from_feed(&config),
        ));
        let active_kols = config.active_kol_wallets.iter().cloned().collect();

        Ok(Arc::new(Self {
            config,
            api,
            cache,
            connection,
            tracker,
            updates,
            polling,
            loader,
            pool,
            notices,
            status_store,
            status_throttle: Mutex::new(StatusPublishThrottle::default()),
            active_kols: Mutex::new(active_kols),
            consumers: AtomicUsize::new(0),
            mirror_dirty: Arc::new(AtomicBool::new(false)),
            socket_events: Mutex::new(Some(socket_events)),
            runtime: Mutex::new(None),
            running: AtomicBool::new(false),
        }))
    }

    /// Production wiring: HTTP API, tungstenite socket, auth token from args or the mirror.
    pub async fn launch(
        mut config: FeedSyncConfig,
        pool: Option<SqlitePool>,
        status_store: Arc<RwLock<FeedStatusSnapshot>>,
    ) -> Result<Arc<Self>, AppError> {
        if config.auth_token.is_none() {
            if let Some(pool) = pool.as_ref() {
                match persistence::load_auth_token(pool).await {
                    Ok(token) => config.auth_token = token,
                    Err(error) => warn!(%error, "failed to read stored auth token"),
                }
            }
        }

        let api = HttpFeedApi::new(
            Client::new(),
            config.api_url.clone(),
            config.auth_token.clone(),
            config.request_timeout,
        );
        let feed = Self::create(
            config,
            Arc::new(api),
            Arc::new(TungsteniteTransport),
            pool,
            status_store,
        )?;
        feed.start();
        Ok(feed)
    }

    pub fn config(&self) -> &FeedSyncConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Starts timers, the event pump and the initial load. Returns false if already started.
    pub fn start(self: &Arc<Self>) -> bool {
        let Some(socket_events) = self.socket_events.lock().take() else {
            return false;
        };
        self.running.store(true, Ordering::Release);
        self.updates.start();

        let cache_subscriber = self.subscribe_cache_applier();

        for wallet in &self.config.active_kol_wallets {
            self.tracker.set_kol_active(wallet, true);
            self.tracker.subscribe_to_kol(wallet);
        }

        let cancel_token = CancellationToken::new();
        let join_handles = vec![
            self.spawn_task(&cancel_token, |feed, token| {
                feed.run_event_pump(socket_events, token)
            }),
            self.spawn_task(&cancel_token, |feed, token| feed.run_initial_load(token)),
            self.spawn_task(&cancel_token, |feed, token| feed.run_health_loop(token)),
            self.spawn_task(&cancel_token, |feed, token| feed.run_status_watch(token)),
            self.spawn_task(&cancel_token, |feed, token| feed.run_maintenance(token)),
        ];

        *self.runtime.lock() = Some(FeedRuntime {
            cancel_token,
            join_handles,
            cache_subscriber,
        });
        info!(api_url = %self.config.api_url, "feed sync started");
        true
    }

    /// The cache takes every queued update; aggregation is only for UI subscribers.
    fn subscribe_cache_applier(&self) -> SubscriberId {
        let cache = Arc::clone(&self.cache);
        let mirror_dirty = Arc::clone(&self.mirror_dirty);
        let apply: UpdateCallback = Arc::new(move |delivery: &Delivery| {
            if apply_delivery(&mut cache.lock(), delivery) {
                mirror_dirty.store(true, Ordering::Release);
            }
        });
        self.updates
            .subscribe(SubscriberOptions::wildcard().raw(), apply)
    }

    fn spawn_task<F, Fut>(self: &Arc<Self>, cancel_token: &CancellationToken, task: F) -> JoinHandle<()>
    where
        F: FnOnce(Arc<Self>, CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(task(Arc::clone(self), cancel_token.clone()))
    }

    /// Cancels every task, tears down the socket and polling, and flushes the mirror.
    pub async fn stop(&self) -> bool {
        if !self.running.swap(false, Ordering::AcqRel) {
            return false;
        }
        let runtime = self.runtime.lock().take();
        if let Some(runtime) = runtime {
            runtime.cancel_token.cancel();
            self.updates.unsubscribe(runtime.cache_subscriber);
            for join_handle in runtime.join_handles {
                let _ = join_handle.await;
            }
        }

        self.polling.stop();
        self.connection.disconnect();
        self.updates.destroy();
        self.persist_mirror().await;

        self.publish_status(Some("feed stopped".to_string())).await;
        info!("feed sync stopped");
        true
    }

    pub fn acquire(&self) -> usize {
        self.consumers.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drops one consumer. Returns how many remain.
    pub fn release(&self) -> usize {
        let previous = self
            .consumers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                Some(count.saturating_sub(1))
            })
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    pub fn consumers(&self) -> usize {
        self.consumers.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> FeedSnapshot {
        self.cache.lock().snapshot()
    }

    pub fn loading_phase(&self) -> LoadingPhase {
        self.loader.phase()
    }

    pub fn connection_health(&self) -> ConnectionHealth {
        self.connection.health()
    }

    pub fn notices(&self) -> broadcast::Receiver<SyncNotice> {
        self.notices.subscribe()
    }

    /// Registers a UI consumer of batched updates.
    pub fn subscribe_updates(
        &self,
        options: SubscriberOptions,
        callback: UpdateCallback,
    ) -> SubscriberId {
        self.updates.subscribe(options, callback)
    }

    pub fn unsubscribe_updates(&self, id: SubscriberId) -> bool {
        self.updates.unsubscribe(id)
    }

    /// Marks a KOL as actively copied and streams its mindmap.
    pub fn subscribe_kol(&self, wallet: &str) -> bool {
        self.active_kols.lock().insert(wallet.to_string());
        self.tracker.set_kol_active(wallet, true);
        self.tracker.subscribe_to_kol(wallet)
    }

    pub fn unsubscribe_kol(&self, wallet: &str) -> bool {
        self.active_kols.lock().remove(wallet);
        self.tracker.set_kol_active(wallet, false);
        self.tracker.unsubscribe_from_kol(wallet)
    }

    pub fn enrich_trade_metadata(
        &self,
        trade_id: &str,
        name: Option<String>,
        symbol: Option<String>,
        image: Option<String>,
    ) -> bool {
        self.cache
            .lock()
            .enrich_trade_metadata(trade_id, name, symbol, image)
    }

    /// Mindmap for one token: cache, then mirror, then the single-token endpoint.
    /// A fetched graph is cached, mirrored and its live updates subscribed.
    pub async fn token_mindmap(&self, token_mint: &str) -> Result<MindmapUpdate, AppError> {
        let cached = self.cache.lock().mindmap(token_mint).cloned();
        if let Some(cached) = cached {
            return Ok(cached);
        }

        let mirrored = match self.pool.as_ref() {
            Some(pool) => match persistence::load_mindmap(pool, token_mint).await {
                Ok(mirrored) => mirrored,
                Err(error) => {
                    warn!(%error, mint = token_mint, "failed to read mirrored mindmap");
                    None
                }
            },
            None => None,
        };
        let mindmap = match mirrored {
            Some(mindmap) => mindmap,
            None => {
                let fetched = self.api.mindmap(token_mint.to_string()).await?;
                if let Some(pool) = self.pool.as_ref() {
                    if let Err(error) = persistence::store_mindmap(pool, &fetched).await {
                        warn!(%error, mint = token_mint, "failed to mirror mindmap");
                    }
                }
                fetched
            }
        };

        let evicted = self.cache.lock().upsert_mindmap(mindmap.clone());
        if let Some(evicted) = evicted {
            debug!(mint = %evicted, "mindmap evicted from cache");
        }
        self.tracker.subscribe_token(token_mint);
        Ok(mindmap)
    }

    pub fn status_snapshot(&self, reason: Option<String>) -> FeedStatusSnapshot {
        let running = self.is_running();
        let loading_phase = self.loader.phase();
        let connection = self.connection.health();
        let (cached_trades, cached_mindmaps) = {
            let cache = self.cache.lock();
            (cache.trade_count(), cache.mindmap_count())
        };

        FeedStatusSnapshot {
            state: SyncState::derive(running, loading_phase, &connection),
            running,
            loading_phase,
            connection,
            cached_trades,
            cached_mindmaps,
            subscribed_kols: self.tracker.subscribed_kol_count(),
            subscribed_tokens: self.tracker.subscribed_token_count(),
            consumers: self.consumers(),
            reason,
        }
    }

    async fn publish_status(&self, reason: Option<String>) {
        let snapshot = self.status_snapshot(reason);
        let mut writable = self.status_store.write().await;
        *writable = snapshot;
    }

    async fn publish_status_throttled(&self, reason: Option<String>) {
        let snapshot = self.status_snapshot(reason);
        let allowed =
            self.status_throttle
                .lock()
                .allow(snapshot.state, &snapshot.reason, Instant::now());
        if !allowed {
            return;
        }
        let mut writable = self.status_store.write().await;
        *writable = snapshot;
    }

    fn notify(&self, level: NoticeLevel, message: &str) {
        let _ = self.notices.send(SyncNotice {
            level,
            message: message.to_string(),
        });
    }

    async fn run_event_pump(
        self: Arc<Self>,
        mut socket_events: mpsc::UnboundedReceiver<SocketEvent>,
        cancel_token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => break,
                event = socket_events.recv() => match event {
                    Some(event) => self.handle_socket_event(event),
                    None => break,
                },
            }
        }
    }

    fn handle_socket_event(&self, event: SocketEvent) {
        let inbound = match normalize_event(&event.name, event.data) {
            Ok(inbound) => inbound,
            Err(error) => {
                warn!(event = %event.name, %error, "dropping malformed feed event");
                return;
            }
        };

        match inbound {
            InboundEvent::Trade(trade) => {
                self.tracker.subscribe_token(trade.token_mint());
                let priority = trade_priority(&trade, &self.active_kols.lock());
                self.updates
                    .add_update(UpdatePayload::Trade(trade), priority, UpdateSource::WebSocket);
            }
            InboundEvent::Mindmap(mindmap) => {
                self.updates.add_update(
                    UpdatePayload::Mindmap(mindmap),
                    UpdatePriority::Medium,
                    UpdateSource::WebSocket,
                );
            }
            InboundEvent::InitialMindmaps(mindmaps) => {
                for mindmap in mindmaps {
                    self.updates.add_update(
                        UpdatePayload::Mindmap(mindmap),
                        UpdatePriority::Low,
                        UpdateSource::WebSocket,
                    );
                }
            }
            InboundEvent::Stats(stats) => {
                self.updates.add_update(
                    UpdatePayload::Stats(stats),
                    UpdatePriority::Medium,
                    UpdateSource::WebSocket,
                );
            }
            InboundEvent::TrendingTokens(tokens) => {
                if self.loader.needs_enhanced_retry() && !tokens.is_empty() {
                    let loader = Arc::clone(&self.loader);
                    let trending = tokens.clone();
                    tokio::spawn(async move {
                        loader.retry_enhanced(&trending).await;
                    });
                }
                self.updates.add_update(
                    UpdatePayload::Token(TokenUpdate {
                        category: TRENDING_CATEGORY.to_string(),
                        tokens,
                    }),
                    UpdatePriority::Medium,
                    UpdateSource::WebSocket,
                );
            }
            InboundEvent::SubscriptionUpdated {
                kol_wallet,
                is_active,
            } => {
                if is_active {
                    self.active_kols.lock().insert(kol_wallet.clone());
                } else {
                    self.active_kols.lock().remove(&kol_wallet);
                }
                self.tracker.set_kol_active(&kol_wallet, is_active);
                if is_active {
                    self.tracker.subscribe_to_kol(&kol_wallet);
                }
            }
            InboundEvent::FeaturedKols(wallets) => {
                debug!(count = wallets.len(), "featured KOLs updated");
                self.tracker.set_featured_kols(wallets);
            }
            InboundEvent::Pong { .. } => {}
            InboundEvent::Unknown(name) => debug!(event = %name, "ignoring unhandled feed event"),
        }
    }

    async fn run_initial_load(self: Arc<Self>, cancel_token: CancellationToken) {
        self.publish_status(Some("loading initial feed data".to_string()))
            .await;
        let report = tokio::select! {
            _ = cancel_token.cancelled() => return,
            report = self.loader.run() => report,
        };
        self.connection.connect(None);
        self.publish_status(Some(format!("initial load finished ({:?})", report.source)))
            .await;
    }

    async fn run_health_loop(self: Arc<Self>, cancel_token: CancellationToken) {
        let mut phase = self.loader.phase_receiver();
        tokio::select! {
            _ = cancel_token.cancelled() => return,
            _ = phase.wait_for(|phase| *phase == LoadingPhase::Complete) => {}
        }

        let period = self.config.health_check_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut supervisor =
            HealthSupervisor::new(Arc::clone(&self.connection), Arc::clone(&self.polling));

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => break,
                _ = ticker.tick() => {
                    let reason = match supervisor.tick() {
                        HealthAction::EnterPolling => {
                            self.notify(NoticeLevel::Warning, POLLING_ENTERED_NOTICE);
                            Some("socket unhealthy, polling started".to_string())
                        }
                        HealthAction::ExitPolling => {
                            self.notify(NoticeLevel::Info, POLLING_EXITED_NOTICE);
                            Some("socket recovered, polling stopped".to_string())
                        }
                        HealthAction::Reprobe => Some("probing feed socket".to_string()),
                        HealthAction::Idle => Some(health_reason(&self.connection.health())),
                    };
                    self.publish_status_throttled(reason).await;
                }
            }
        }
    }

    async fn run_status_watch(self: Arc<Self>, cancel_token: CancellationToken) {
        let mut health = self.connection.health_receiver();
        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => break,
                changed = health.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let reason = health_reason(&health.borrow_and_update());
                    self.publish_status_throttled(Some(reason)).await;
                }
            }
        }
    }

    /// Cache cleanup, subscription optimization and mirror refresh on their own periods.
    async fn run_maintenance(self: Arc<Self>, cancel_token: CancellationToken) {
        let start = Instant::now();
        let mut cleanup = tokio::time::interval_at(
            start + self.config.cleanup_interval,
            self.config.cleanup_interval,
        );
        let mut optimize = tokio::time::interval_at(
            start + self.config.optimize_interval,
            self.config.optimize_interval,
        );
        let mut mirror =
            tokio::time::interval_at(start + MIRROR_REFRESH_INTERVAL, MIRROR_REFRESH_INTERVAL);
        for ticker in [&mut cleanup, &mut optimize, &mut mirror] {
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        }

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => break,
                _ = cleanup.tick() => self.run_cleanup().await,
                _ = optimize.tick() => {
                    let recent = self.cache.lock().recent_mints();
                    let report = self.tracker.optimize(&recent);
                    debug!(?report, "subscriptions optimized");
                }
                _ = mirror.tick() => {
                    if self.mirror_dirty.swap(false, Ordering::AcqRel) {
                        self.persist_mirror().await;
                    }
                }
            }
        }
    }

    async fn run_cleanup(&self) {
        let report = self.cache.lock().cleanup();
        debug!(?report, "cache cleanup finished");
        if let Some(pool) = self.pool.as_ref() {
            match persistence::purge_expired(pool).await {
                Ok(purged) if purged > 0 => debug!(purged, "expired mirror entries purged"),
                Ok(_) => {}
                Err(error) => warn!(%error, "failed to purge mirror entries"),
            }
        }
    }

    /// Writes the current trades, stats and trending list to the local mirror.
    pub async fn persist_mirror(&self) {
        let Some(pool) = self.pool.as_ref() else {
            return;
        };
        let snapshot = self.cache.lock().snapshot();

        if !snapshot.trades.is_empty() {
            if let Err(error) = persistence::store_trades(pool, &snapshot.trades).await {
                warn!(%error, "failed to mirror trades");
            }
        }
        if let Some(stats) = snapshot.stats.as_ref() {
            if let Err(error) = persistence::store_stats(pool, stats).await {
                warn!(%error, "failed to mirror stats");
            }
        }
        if !snapshot.trending_tokens.is_empty() {
            if let Err(error) = persistence::store_trending(pool, &snapshot.trending_tokens).await
            {
                warn!(%error, "failed to mirror trending tokens");
            }
        }
    }
}
