use crate::feed::now_unix_ms;
use crate::feed::types::{
    BalanceUpdate, PriceUpdate, QueuedUpdate, Trade, UpdateBatch, UpdatePayload, UpdatePriority,
    UpdateSource, UpdateType,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

const TRADE_AGGREGATE_LIMIT: usize = 10;
const PRICE_HIGH_CHANGE_PCT: f64 = 5.0;
const PRICE_MEDIUM_TICK_PCT: f64 = 1.0;
const BALANCE_HIGH_CHANGE_PCT: f64 = 10.0;
const BALANCE_MEDIUM_CHANGE_PCT: f64 = 1.0;

pub type UpdateCallback = Arc<dyn Fn(&Delivery) + Send + Sync>;
pub type UpdateFilter = Arc<dyn Fn(&QueuedUpdate) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

/// What a subscriber receives for one update type in one flush cycle.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub batch_id: u64,
    pub update_type: UpdateType,
    pub updates: Vec<QueuedUpdate>,
    pub aggregated: bool,
}

#[derive(Clone, Default)]
pub struct SubscriberOptions {
    /// `None` subscribes to every type.
    pub types: Option<HashSet<UpdateType>>,
    pub throttle: Duration,
    /// Consulted per update for unaggregated deliveries.
    pub filter: Option<UpdateFilter>,
    /// Receive every queued update of a group in arrival order instead of the aggregate.
    pub raw: bool,
}

impl SubscriberOptions {
    pub fn wildcard() -> Self {
        Self::default()
    }

    pub fn for_types(types: impl IntoIterator<Item = UpdateType>) -> Self {
        Self {
            types: Some(types.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn with_throttle(mut self, throttle: Duration) -> Self {
        self.throttle = throttle;
        self
    }

    pub fn with_filter(mut self, filter: UpdateFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn raw(mut self) -> Self {
        self.raw = true;
        self
    }
}

struct SubscriberSlot {
    id: SubscriberId,
    options: SubscriberOptions,
    callback: UpdateCallback,
    last_delivered: Option<Instant>,
}

impl SubscriberSlot {
    fn wants(&self, update_type: UpdateType) -> bool {
        match &self.options.types {
            Some(types) => types.contains(&update_type),
            None => true,
        }
    }
}

#[derive(Default)]
struct BatchState {
    queue: VecDeque<QueuedUpdate>,
    high_queued: usize,
    subscribers: Vec<SubscriberSlot>,
    next_subscriber_id: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct BatchConfig {
    pub batch_interval: Duration,
    pub max_batch_size: usize,
    pub high_priority_threshold: usize,
}

struct FlushTimer {
    cancel_token: CancellationToken,
    join_handle: JoinHandle<()>,
}

/// Micro-batching fan-out between inbound feed events and cache/UI consumers.
pub struct RealTimeUpdateService {
    config: BatchConfig,
    state: Mutex<BatchState>,
    timer: Mutex<Option<FlushTimer>>,
    next_batch_id: AtomicU64,
    destroyed: AtomicBool,
}

impl RealTimeUpdateService {
    pub fn new(config: BatchConfig) -> Arc<Self> {
        Arc::new(Self {
            config: BatchConfig {
                max_batch_size: config.max_batch_size.max(1),
                high_priority_threshold: config.high_priority_threshold.max(1),
                ..config
            },
            state: Mutex::new(BatchState::default()),
            timer: Mutex::new(None),
            next_batch_id: AtomicU64::new(1),
            destroyed: AtomicBool::new(false),
        })
    }

    /// Starts the periodic flush timer. Calling it again while running is a no-op.
    pub fn start(self: &Arc<Self>) {
        if self.destroyed.load(Ordering::Acquire) {
            return;
        }
        let mut slot = self.timer.lock();
        if slot.is_some() {
            return;
        }

        let cancel_token = CancellationToken::new();
        let task_cancel = cancel_token.clone();
        let service: Weak<Self> = Arc::downgrade(self);
        let period = self.config.batch_interval;
        let join_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(service) = service.upgrade() else {
                            break;
                        };
                        let max_batch_size = service.config.max_batch_size;
                        service.flush_cycle(max_batch_size);
                    }
                }
            }
        });

        *slot = Some(FlushTimer {
            cancel_token,
            join_handle,
        });
    }

    pub fn subscribe(&self, options: SubscriberOptions, callback: UpdateCallback) -> SubscriberId {
        let mut state = self.state.lock();
        state.next_subscriber_id += 1;
        let id = SubscriberId(state.next_subscriber_id);
        state.subscribers.push(SubscriberSlot {
            id,
            options,
            callback,
            last_delivered: None,
        });
        id
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut state = self.state.lock();
        let before = state.subscribers.len();
        state.subscribers.retain(|slot| slot.id != id);
        state.subscribers.len() != before
    }

    /// Queues an update. Returns false once the service has been destroyed.
    pub fn add_update(
        &self,
        payload: UpdatePayload,
        priority: UpdatePriority,
        source: UpdateSource,
    ) -> bool {
        if self.destroyed.load(Ordering::Acquire) {
            return false;
        }

        let promote = {
            let mut state = self.state.lock();
            state.queue.push_back(QueuedUpdate {
                payload,
                priority,
                source,
                timestamp: now_unix_ms(),
            });
            if priority == UpdatePriority::High {
                state.high_queued += 1;
            }
            state.high_queued >= self.config.high_priority_threshold
        };

        if promote {
            trace!("high-priority threshold reached, flushing early");
            self.flush_cycle(self.config.max_batch_size);
        }
        true
    }

    /// Drains the whole queue immediately.
    pub fn flush(&self) -> usize {
        let mut delivered = 0;
        loop {
            let processed = self.flush_cycle(self.config.max_batch_size);
            if processed == 0 {
                break;
            }
            delivered += processed;
        }
        delivered
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    /// Stops the timer and drops queued updates and subscribers. Safe to call repeatedly.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(timer) = self.timer.lock().take() {
            timer.cancel_token.cancel();
            timer.join_handle.abort();
        }
        let mut state = self.state.lock();
        state.queue.clear();
        state.high_queued = 0;
        state.subscribers.clear();
        debug!("update service destroyed");
    }

    fn flush_cycle(&self, limit: usize) -> usize {
        let batch_id = self.next_batch_id.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();

        let (processed, deliveries) = {
            let mut state = self.state.lock();
            if state.queue.is_empty() {
                return 0;
            }

            let take = limit.min(state.queue.len());
            let updates: Vec<QueuedUpdate> = state.queue.drain(..take).collect();
            let drained_high = updates
                .iter()
                .filter(|update| update.priority == UpdatePriority::High)
                .count();
            state.high_queued = state.high_queued.saturating_sub(drained_high);

            let batch = UpdateBatch {
                id: batch_id,
                timestamp: now_unix_ms(),
                updates,
            };
            let processed = batch.updates.len();
            let deliveries = plan_deliveries(&mut state.subscribers, batch, now);
            (processed, deliveries)
        };

        for (callback, delivery) in deliveries {
            callback(&delivery);
        }
        processed
    }
}

impl Drop for RealTimeUpdateService {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.get_mut().take() {
            timer.cancel_token.cancel();
        }
    }
}

fn group_by_type(updates: Vec<QueuedUpdate>) -> Vec<(UpdateType, Vec<QueuedUpdate>)> {
    let mut groups: Vec<(UpdateType, Vec<QueuedUpdate>)> = Vec::new();
    for update in updates {
        let update_type = update.update_type();
        match groups.iter_mut().find(|(kind, _)| *kind == update_type) {
            Some((_, group)) => group.push(update),
            None => groups.push((update_type, vec![update])),
        }
    }
    groups
}

fn plan_deliveries(
    subscribers: &mut [SubscriberSlot],
    batch: UpdateBatch,
    now: Instant,
) -> Vec<(UpdateCallback, Delivery)> {
    let batch_id = batch.id;
    let mut deliveries = Vec::new();

    for (update_type, group) in group_by_type(batch.updates) {
        let collapsed = if group.len() > 1 {
            Some(aggregate_updates(update_type, group.clone()))
        } else {
            None
        };

        for slot in subscribers.iter_mut() {
            if !slot.wants(update_type) {
                continue;
            }
            let throttled = slot
                .last_delivered
                .map(|last| now.duration_since(last) < slot.options.throttle)
                .unwrap_or(false);
            if throttled {
                continue;
            }

            let (updates, aggregated) = match (&collapsed, slot.options.raw) {
                (Some(collapsed), false) => (collapsed.clone(), true),
                _ => {
                    let updates: Vec<QueuedUpdate> = match slot.options.filter.as_ref() {
                        Some(filter) => group.iter().filter(|update| filter(update)).cloned().collect(),
                        None => group.clone(),
                    };
                    if updates.is_empty() {
                        continue;
                    }
                    (updates, false)
                }
            };

            slot.last_delivered = Some(now);
            deliveries.push((
                Arc::clone(&slot.callback),
                Delivery {
                    batch_id,
                    update_type,
                    updates,
                    aggregated,
                },
            ));
        }
    }

    deliveries
}

fn dedupe_latest_by<F>(group: Vec<QueuedUpdate>, key: F) -> Vec<QueuedUpdate>
where
    F: Fn(&QueuedUpdate) -> Option<String>,
{
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut kept: Vec<QueuedUpdate> = Vec::with_capacity(group.len());
    for update in group {
        match key(&update) {
            Some(value) => match positions.get(&value) {
                Some(&index) => kept[index] = update,
                None => {
                    positions.insert(value, kept.len());
                    kept.push(update);
                }
            },
            None => kept.push(update),
        }
    }
    kept
}

/// Collapses a same-type group; queue order breaks ties for "latest".
pub fn aggregate_updates(update_type: UpdateType, group: Vec<QueuedUpdate>) -> Vec<QueuedUpdate> {
    match update_type {
        UpdateType::Trade => group
            .into_iter()
            .rev()
            .take(TRADE_AGGREGATE_LIMIT)
            .collect(),
        UpdateType::Price => dedupe_latest_by(group, |update| match &update.payload {
            UpdatePayload::Price(price) => Some(price.mint.clone()),
            _ => None,
        }),
        UpdateType::Token => dedupe_latest_by(group, |update| match &update.payload {
            UpdatePayload::Token(token) => Some(token.category.clone()),
            _ => None,
        }),
        UpdateType::Balance | UpdateType::Portfolio => group.into_iter().last().into_iter().collect(),
        UpdateType::Mindmap | UpdateType::Stats => group,
    }
}

pub fn trade_priority(trade: &Trade, active_kol_wallets: &HashSet<String>) -> UpdatePriority {
    if active_kol_wallets.contains(&trade.kol_wallet) {
        UpdatePriority::High
    } else {
        UpdatePriority::Medium
    }
}

fn percent_change(current: f64, previous: f64) -> Option<f64> {
    if previous == 0.0 {
        return if current == 0.0 { Some(0.0) } else { None };
    }
    Some(((current - previous) / previous).abs() * 100.0)
}

pub fn price_priority(update: &PriceUpdate) -> UpdatePriority {
    if update
        .change_24h
        .map(|change| change.abs() > PRICE_HIGH_CHANGE_PCT)
        .unwrap_or(false)
    {
        return UpdatePriority::High;
    }
    let tick_change = update
        .previous_price
        .and_then(|previous| percent_change(update.price, previous));
    match tick_change {
        Some(change) if change > PRICE_MEDIUM_TICK_PCT => UpdatePriority::Medium,
        _ => UpdatePriority::Low,
    }
}

pub fn balance_priority(update: &BalanceUpdate) -> UpdatePriority {
    let Some(previous) = update.previous_balance else {
        return UpdatePriority::Low;
    };
    match percent_change(update.balance, previous) {
        // From zero to anything is always significant.
        None => UpdatePriority::High,
        Some(change) if change > BALANCE_HIGH_CHANGE_PCT => UpdatePriority::High,
        Some(change) if change > BALANCE_MEDIUM_CHANGE_PCT => UpdatePriority::Medium,
        Some(_) => UpdatePriority::Low,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::fixtures::sample_wallet_trade;
    use crate::feed::types::{PortfolioUpdate, Stats, TokenUpdate};

    fn service(threshold: usize) -> Arc<RealTimeUpdateService> {
        RealTimeUpdateService::new(BatchConfig {
            batch_interval: Duration::from_millis(100),
            max_batch_size: 50,
            high_priority_threshold: threshold,
        })
    }

    fn recorder(service: &RealTimeUpdateService, options: SubscriberOptions) -> Arc<Mutex<Vec<Delivery>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        service.subscribe(
            options,
            Arc::new(move |delivery: &Delivery| sink.lock().push(delivery.clone())),
        );
        seen
    }

    fn price(mint: &str, value: f64) -> UpdatePayload {
        UpdatePayload::Price(PriceUpdate {
            mint: mint.to_string(),
            price: value,
            previous_price: None,
            change_24h: None,
        })
    }

    #[test]
    fn raw_subscribers_see_every_trade_in_arrival_order() {
        let service = service(50);
        let aggregated = recorder(&service, SubscriberOptions::for_types([UpdateType::Trade]));
        let raw = recorder(&service, SubscriberOptions::wildcard().raw());

        for index in 0..15 {
            service.add_update(
                UpdatePayload::Trade(sample_wallet_trade(&format!("t{index}"), "W1", "M1")),
                UpdatePriority::Medium,
                UpdateSource::WebSocket,
            );
        }
        service.flush();

        let aggregated = aggregated.lock();
        assert_eq!(aggregated.len(), 1);
        assert!(aggregated[0].aggregated);
        assert_eq!(aggregated[0].updates.len(), 10);

        let raw = raw.lock();
        assert_eq!(raw.len(), 1);
        assert!(!raw[0].aggregated);
        let ids: Vec<String> = raw[0]
            .updates
            .iter()
            .filter_map(|update| match &update.payload {
                UpdatePayload::Trade(trade) => Some(trade.id.clone()),
                _ => None,
            })
            .collect();
        let expected: Vec<String> = (0..15).map(|index| format!("t{index}")).collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn aggregates_prices_by_mint_latest_wins() {
        let service = service(5);
        let seen = recorder(&service, SubscriberOptions::for_types([UpdateType::Price]));

        for (mint, value) in [("A", 1.0), ("B", 2.0), ("A", 3.0)] {
            service.add_update(price(mint, value), UpdatePriority::Low, UpdateSource::WebSocket);
        }
        service.flush();

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].aggregated);
        let prices: Vec<(String, f64)> = seen[0]
            .updates
            .iter()
            .filter_map(|update| match &update.payload {
                UpdatePayload::Price(price) => Some((price.mint.clone(), price.price)),
                _ => None,
            })
            .collect();
        assert_eq!(prices.len(), 2);
        assert!(prices.contains(&("A".to_string(), 3.0)));
        assert!(prices.contains(&("B".to_string(), 2.0)));
    }

    #[test]
    fn five_high_priority_updates_flush_before_timer() {
        let service = service(5);
        let seen = recorder(&service, SubscriberOptions::wildcard());

        for index in 0..4 {
            service.add_update(
                price(&format!("M{index}"), 1.0),
                UpdatePriority::High,
                UpdateSource::WebSocket,
            );
        }
        assert!(seen.lock().is_empty());
        assert_eq!(service.pending_len(), 4);

        service.add_update(price("M4", 1.0), UpdatePriority::High, UpdateSource::WebSocket);
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(service.pending_len(), 0);
    }

    #[test]
    fn low_priority_updates_do_not_count_toward_promotion() {
        let service = service(2);
        let seen = recorder(&service, SubscriberOptions::wildcard());
        for _ in 0..6 {
            service.add_update(price("A", 1.0), UpdatePriority::Low, UpdateSource::Polling);
        }
        service.add_update(price("B", 1.0), UpdatePriority::High, UpdateSource::Polling);
        assert!(seen.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn timer_flushes_at_most_max_batch_size() {
        let service = RealTimeUpdateService::new(BatchConfig {
            batch_interval: Duration::from_millis(100),
            max_batch_size: 3,
            high_priority_threshold: 5,
        });
        let seen = recorder(&service, SubscriberOptions::wildcard());
        for index in 0..5 {
            service.add_update(
                UpdatePayload::Stats(Stats {
                    total_trades: index,
                    ..Stats::default()
                }),
                UpdatePriority::Low,
                UpdateSource::WebSocket,
            );
        }
        service.start();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(service.pending_len(), 2);
        assert_eq!(seen.lock()[0].updates.len(), 3);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(service.pending_len(), 0);
        service.destroy();
    }

    #[test]
    fn trade_aggregate_keeps_last_ten_most_recent_first() {
        let group: Vec<QueuedUpdate> = (0..15)
            .map(|index| QueuedUpdate {
                payload: UpdatePayload::Trade(sample_wallet_trade(&format!("t{index}"), "W1", "M1")),
                priority: UpdatePriority::Medium,
                source: UpdateSource::WebSocket,
                timestamp: index,
            })
            .collect();
        let aggregated = aggregate_updates(UpdateType::Trade, group);
        assert_eq!(aggregated.len(), 10);
        assert_eq!(aggregated[0].timestamp, 14);
        assert_eq!(aggregated[9].timestamp, 5);
    }

    #[test]
    fn token_and_portfolio_aggregation() {
        let token = |category: &str, mint: &str| QueuedUpdate {
            payload: UpdatePayload::Token(TokenUpdate {
                category: category.to_string(),
                tokens: vec![mint.to_string()],
            }),
            priority: UpdatePriority::Low,
            source: UpdateSource::WebSocket,
            timestamp: 0,
        };
        let tokens = aggregate_updates(
            UpdateType::Token,
            vec![token("trending", "A"), token("new", "B"), token("trending", "C")],
        );
        assert_eq!(tokens.len(), 2);
        assert!(matches!(
            &tokens[0].payload,
            UpdatePayload::Token(update) if update.tokens == vec!["C".to_string()]
        ));

        let portfolio = |value: f64| QueuedUpdate {
            payload: UpdatePayload::Portfolio(PortfolioUpdate {
                wallet: "U1".to_string(),
                total_value: value,
                pnl: 0.0,
            }),
            priority: UpdatePriority::Low,
            source: UpdateSource::Polling,
            timestamp: 0,
        };
        let latest = aggregate_updates(UpdateType::Portfolio, vec![portfolio(1.0), portfolio(2.0)]);
        assert_eq!(latest.len(), 1);
        assert!(matches!(
            &latest[0].payload,
            UpdatePayload::Portfolio(update) if update.total_value == 2.0
        ));
    }

    #[test]
    fn filter_applies_only_to_unaggregated_deliveries() {
        let service = service(5);
        let only_a: UpdateFilter = Arc::new(|update: &QueuedUpdate| {
            matches!(&update.payload, UpdatePayload::Price(price) if price.mint == "A")
        });
        let seen = recorder(
            &service,
            SubscriberOptions::for_types([UpdateType::Price]).with_filter(only_a),
        );

        service.add_update(price("B", 1.0), UpdatePriority::Low, UpdateSource::WebSocket);
        service.flush();
        assert!(seen.lock().is_empty());

        service.add_update(price("B", 1.0), UpdatePriority::Low, UpdateSource::WebSocket);
        service.add_update(price("C", 1.0), UpdatePriority::Low, UpdateSource::WebSocket);
        service.flush();
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_subscriber_skips_close_deliveries() {
        let service = service(5);
        let seen = recorder(
            &service,
            SubscriberOptions::wildcard().with_throttle(Duration::from_millis(500)),
        );

        service.add_update(price("A", 1.0), UpdatePriority::Low, UpdateSource::WebSocket);
        service.flush();
        tokio::time::advance(Duration::from_millis(100)).await;
        service.add_update(price("A", 2.0), UpdatePriority::Low, UpdateSource::WebSocket);
        service.flush();
        assert_eq!(seen.lock().len(), 1);

        tokio::time::advance(Duration::from_millis(500)).await;
        service.add_update(price("A", 3.0), UpdatePriority::Low, UpdateSource::WebSocket);
        service.flush();
        assert_eq!(seen.lock().len(), 2);
    }

    #[test]
    fn destroy_is_idempotent_and_rejects_new_updates() {
        let service = service(5);
        let _seen = recorder(&service, SubscriberOptions::wildcard());
        service.add_update(price("A", 1.0), UpdatePriority::Low, UpdateSource::WebSocket);
        service.destroy();
        service.destroy();
        assert_eq!(service.pending_len(), 0);
        assert_eq!(service.subscriber_count(), 0);
        assert!(!service.add_update(price("A", 1.0), UpdatePriority::Low, UpdateSource::WebSocket));
    }

    #[test]
    fn classifies_price_and_balance_priority() {
        let mut update = PriceUpdate {
            mint: "A".to_string(),
            price: 1.0,
            previous_price: Some(1.0),
            change_24h: Some(-7.5),
        };
        assert_eq!(price_priority(&update), UpdatePriority::High);
        update.change_24h = Some(1.0);
        update.price = 1.02;
        assert_eq!(price_priority(&update), UpdatePriority::Medium);
        update.price = 1.005;
        assert_eq!(price_priority(&update), UpdatePriority::Low);

        let balance = |previous: Option<f64>, current: f64| BalanceUpdate {
            wallet: "U1".to_string(),
            mint: None,
            balance: current,
            previous_balance: previous,
        };
        assert_eq!(balance_priority(&balance(Some(100.0), 85.0)), UpdatePriority::High);
        assert_eq!(balance_priority(&balance(Some(100.0), 95.0)), UpdatePriority::Medium);
        assert_eq!(balance_priority(&balance(Some(100.0), 100.5)), UpdatePriority::Low);
        assert_eq!(balance_priority(&balance(Some(0.0), 3.0)), UpdatePriority::High);
    }

    #[test]
    fn trades_from_active_wallets_are_high_priority() {
        let active: HashSet<String> = ["W1".to_string()].into_iter().collect();
        assert_eq!(
            trade_priority(&sample_wallet_trade("t1", "W1", "M1"), &active),
            UpdatePriority::High
        );
        assert_eq!(
            trade_priority(&sample_wallet_trade("t2", "W2", "M1"), &active),
            UpdatePriority::Medium
        );
    }
}
