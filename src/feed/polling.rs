use crate::feed::api::FeedApi;
use crate::feed::batching::RealTimeUpdateService;
use crate::feed::connection::ConnectionManager;
use crate::feed::types::{
    ConnectionHealth, FeedSyncConfig, TokenUpdate, UpdatePayload, UpdatePriority, UpdateSource,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const TRENDING_CATEGORY: &str = "trending";

const SUCCESS_DECAY: f64 = 0.8;
const FAILURE_BACKOFF: f64 = 1.5;
const FAILURES_BEFORE_BACKOFF: u32 = 5;
/// Health checks spent polling with no live session before the socket is probed again.
const REPROBE_AFTER_CHECKS: u32 = 6;

/// Adapts the polling period after one cycle.
pub fn next_poll_interval(
    current: Duration,
    base: Duration,
    ceiling: Duration,
    succeeded: bool,
    consecutive_failures: u32,
) -> Duration {
    if succeeded {
        return current.mul_f64(SUCCESS_DECAY).max(base);
    }
    if consecutive_failures >= FAILURES_BEFORE_BACKOFF {
        return current.mul_f64(FAILURE_BACKOFF).min(ceiling);
    }
    current
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthAction {
    Idle,
    EnterPolling,
    ExitPolling,
    /// Leave polling mode, then open a fresh socket session.
    Reprobe,
}

pub fn decide_health_action(
    health: &ConnectionHealth,
    polling: bool,
    session_active: bool,
    idle_polling_checks: u32,
) -> HealthAction {
    match (health.is_healthy(), polling) {
        (true, true) => HealthAction::ExitPolling,
        (true, false) => HealthAction::Idle,
        (false, false) => HealthAction::EnterPolling,
        (false, true) if !session_active && idle_polling_checks >= REPROBE_AFTER_CHECKS => {
            HealthAction::Reprobe
        }
        (false, true) => HealthAction::Idle,
    }
}

#[derive(Debug, Clone)]
pub struct PollingConfig {
    pub base: Duration,
    pub ceiling: Duration,
    pub request_timeout: Duration,
    pub trade_limit: usize,
    pub trending_limit: usize,
}

impl PollingConfig {
    pub fn from_feed(config: &FeedSyncConfig) -> Self {
        Self {
            base: config.poll_base,
            ceiling: config.poll_ceiling,
            request_timeout: config.request_timeout,
            trade_limit: config.max_trades,
            trending_limit: config.trending_limit,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleOutcome {
    pub trades: bool,
    pub stats: bool,
    pub trending: bool,
}

impl CycleOutcome {
    pub fn any(self) -> bool {
        self.trades || self.stats || self.trending
    }
}

struct PollLoop {
    cancel_token: CancellationToken,
    join_handle: JoinHandle<()>,
}

/// REST polling that feeds the same update path as the socket while it is unhealthy.
pub struct PollingFallback {
    api: Arc<dyn FeedApi>,
    updates: Arc<RealTimeUpdateService>,
    connection: Arc<ConnectionManager>,
    config: PollingConfig,
    active: Arc<AtomicBool>,
    poll_loop: Mutex<Option<PollLoop>>,
}

impl PollingFallback {
    pub fn new(
        api: Arc<dyn FeedApi>,
        updates: Arc<RealTimeUpdateService>,
        connection: Arc<ConnectionManager>,
        config: PollingConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            api,
            updates,
            connection,
            config,
            active: Arc::new(AtomicBool::new(false)),
            poll_loop: Mutex::new(None),
        })
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Shared view of the polling-mode flag.
    pub fn mode_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.active)
    }

    /// Enters polling mode. Returns false if a loop is already running.
    pub fn start(self: &Arc<Self>) -> bool {
        if self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.connection.set_polling_mode(true);
        info!(base = ?self.config.base, "entering polling mode");

        let cancel_token = CancellationToken::new();
        let loop_cancel = cancel_token.clone();
        let fallback = Arc::clone(self);
        let join_handle = tokio::spawn(async move {
            fallback.run(loop_cancel).await;
        });

        let previous = self.poll_loop.lock().replace(PollLoop {
            cancel_token,
            join_handle,
        });
        if let Some(previous) = previous {
            previous.cancel_token.cancel();
        }
        true
    }

    /// Leaves polling mode. Results of an in-flight cycle are discarded.
    pub fn stop(&self) -> bool {
        if !self.active.swap(false, Ordering::AcqRel) {
            return false;
        }
        if let Some(poll_loop) = self.poll_loop.lock().take() {
            poll_loop.cancel_token.cancel();
            drop(poll_loop.join_handle);
        }
        self.connection.set_polling_mode(false);
        info!("leaving polling mode");
        true
    }

    async fn run(&self, cancel_token: CancellationToken) {
        let mut interval = self.config.base;
        let mut consecutive_failures = 0_u32;

        loop {
            let outcome = self.run_cycle(&cancel_token).await;
            if cancel_token.is_cancelled() {
                break;
            }

            if outcome.any() {
                consecutive_failures = 0;
            } else {
                consecutive_failures = consecutive_failures.saturating_add(1);
            }
            interval = next_poll_interval(
                interval,
                self.config.base,
                self.config.ceiling,
                outcome.any(),
                consecutive_failures,
            );
            debug!(?interval, consecutive_failures, ?outcome, "poll cycle finished");

            tokio::select! {
                _ = cancel_token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// Polls the three feed endpoints in parallel and queues whatever succeeded.
    pub async fn run_cycle(&self, cancel_token: &CancellationToken) -> CycleOutcome {
        let timeout = self.config.request_timeout;
        let (trades, stats, trending) = tokio::join!(
            tokio::time::timeout(timeout, self.api.recent_trades(self.config.trade_limit)),
            tokio::time::timeout(timeout, self.api.stats()),
            tokio::time::timeout(timeout, self.api.trending_tokens(self.config.trending_limit)),
        );

        if cancel_token.is_cancelled() {
            return CycleOutcome::default();
        }

        let mut outcome = CycleOutcome::default();
        match trades {
            Ok(Ok(trades)) => {
                outcome.trades = true;
                // Oldest first so the cache ends up newest-first.
                for trade in trades.into_iter().rev() {
                    self.updates.add_update(
                        UpdatePayload::Trade(trade),
                        UpdatePriority::Low,
                        UpdateSource::Polling,
                    );
                }
            }
            Ok(Err(error)) => warn!(%error, "polling recent trades failed"),
            Err(_) => warn!(timeout = ?timeout, "polling recent trades timed out"),
        }
        match stats {
            Ok(Ok(stats)) => {
                outcome.stats = true;
                self.updates.add_update(
                    UpdatePayload::Stats(stats),
                    UpdatePriority::Low,
                    UpdateSource::Polling,
                );
            }
            Ok(Err(error)) => warn!(%error, "polling stats failed"),
            Err(_) => warn!(timeout = ?timeout, "polling stats timed out"),
        }
        match trending {
            Ok(Ok(tokens)) => {
                outcome.trending = true;
                self.updates.add_update(
                    UpdatePayload::Token(TokenUpdate {
                        category: TRENDING_CATEGORY.to_string(),
                        tokens,
                    }),
                    UpdatePriority::Low,
                    UpdateSource::Polling,
                );
            }
            Ok(Err(error)) => warn!(%error, "polling trending tokens failed"),
            Err(_) => warn!(timeout = ?timeout, "polling trending tokens timed out"),
        }
        outcome
    }
}

impl Drop for PollingFallback {
    fn drop(&mut self) {
        if let Some(poll_loop) = self.poll_loop.get_mut().take() {
            poll_loop.cancel_token.cancel();
        }
    }
}

/// Periodic health check deciding between socket and polling.
pub struct HealthSupervisor {
    connection: Arc<ConnectionManager>,
    polling: Arc<PollingFallback>,
    idle_polling_checks: u32,
}

impl HealthSupervisor {
    pub fn new(connection: Arc<ConnectionManager>, polling: Arc<PollingFallback>) -> Self {
        Self {
            connection,
            polling,
            idle_polling_checks: 0,
        }
    }

    pub fn tick(&mut self) -> HealthAction {
        let health = self.connection.health();
        let polling = self.polling.is_active();
        let session_active = self.connection.has_session();
        if polling && !session_active {
            self.idle_polling_checks = self.idle_polling_checks.saturating_add(1);
        } else {
            self.idle_polling_checks = 0;
        }

        let action = decide_health_action(&health, polling, session_active, self.idle_polling_checks);
        match action {
            HealthAction::Idle => {}
            HealthAction::EnterPolling => {
                self.polling.start();
            }
            HealthAction::ExitPolling => {
                self.polling.stop();
            }
            HealthAction::Reprobe => {
                self.polling.stop();
                self.idle_polling_checks = 0;
                self.connection.connect(None);
            }
        }
        action
    }
}
