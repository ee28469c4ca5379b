use crate::feed::connection::{Channel, ConnectionManager};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

fn kol_key(wallet: &str) -> String {
    format!("kol_{wallet}")
}

fn token_key(mint: &str) -> String {
    format!("token_{mint}")
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OptimizeReport {
    pub expired_kols: usize,
    pub expired_tokens: usize,
    pub resubscribed_kols: usize,
}

#[derive(Debug, Default)]
struct TrackerState {
    subscribed_tokens: HashSet<String>,
    subscribed_kols: HashSet<String>,
    /// Key -> end of its debounce window.
    pending: HashMap<String, Instant>,
    timestamps: HashMap<String, Instant>,
    featured_kols: HashSet<String>,
    active_kols: HashSet<String>,
}

impl TrackerState {
    fn prune_pending(&mut self, now: Instant) {
        self.pending.retain(|_, until| *until > now);
    }

    fn relevant_kols(&self) -> HashSet<String> {
        self.featured_kols
            .union(&self.active_kols)
            .cloned()
            .collect()
    }
}

/// De-duplicates mindmap subscribe traffic and keeps the relevant working set covered.
pub struct SubscriptionTracker {
    connection: Arc<ConnectionManager>,
    debounce: Duration,
    stale_after: Duration,
    state: Mutex<TrackerState>,
}

impl SubscriptionTracker {
    pub fn new(connection: Arc<ConnectionManager>, debounce: Duration, stale_after: Duration) -> Self {
        Self {
            connection,
            debounce,
            stale_after,
            state: Mutex::new(TrackerState::default()),
        }
    }

    /// Returns whether a subscribe request was issued.
    pub fn subscribe_to_kol(&self, wallet: &str) -> bool {
        let mut state = self.state.lock();
        self.subscribe_kol_locked(&mut state, wallet, Instant::now())
    }

    fn subscribe_kol_locked(&self, state: &mut TrackerState, wallet: &str, now: Instant) -> bool {
        let key = kol_key(wallet);
        state.prune_pending(now);
        if state.subscribed_kols.contains(wallet) || state.pending.contains_key(&key) {
            return false;
        }

        state.pending.insert(key.clone(), now + self.debounce);
        self.connection.subscribe([Channel::kol_mindmap(wallet)]);
        state.subscribed_kols.insert(wallet.to_string());
        state.timestamps.insert(key, now);
        debug!(kol = wallet, "subscribed to KOL mindmap");
        true
    }

    pub fn unsubscribe_from_kol(&self, wallet: &str) -> bool {
        let mut state = self.state.lock();
        Self::unsubscribe_kol_locked(&self.connection, &mut state, wallet)
    }

    fn unsubscribe_kol_locked(
        connection: &ConnectionManager,
        state: &mut TrackerState,
        wallet: &str,
    ) -> bool {
        if !state.subscribed_kols.remove(wallet) {
            return false;
        }
        connection.unsubscribe([Channel::kol_mindmap(wallet)]);
        state.timestamps.remove(&kol_key(wallet));
        debug!(kol = wallet, "unsubscribed from KOL mindmap");
        true
    }

    pub fn subscribe_token(&self, mint: &str) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock();
        let key = token_key(mint);
        state.prune_pending(now);
        if state.subscribed_tokens.contains(mint) {
            // Keep hot tokens from going stale.
            state.timestamps.insert(key, now);
            return false;
        }
        if state.pending.contains_key(&key) {
            return false;
        }

        state.pending.insert(key.clone(), now + self.debounce);
        self.connection.subscribe([Channel::mindmap(mint)]);
        state.subscribed_tokens.insert(mint.to_string());
        state.timestamps.insert(key, now);
        true
    }

    pub fn unsubscribe_token(&self, mint: &str) -> bool {
        let mut state = self.state.lock();
        Self::unsubscribe_token_locked(&self.connection, &mut state, mint)
    }

    fn unsubscribe_token_locked(
        connection: &ConnectionManager,
        state: &mut TrackerState,
        mint: &str,
    ) -> bool {
        if !state.subscribed_tokens.remove(mint) {
            return false;
        }
        connection.unsubscribe([Channel::mindmap(mint)]);
        state.timestamps.remove(&token_key(mint));
        debug!(mint, "unsubscribed from token mindmap");
        true
    }

    pub fn set_featured_kols(&self, wallets: impl IntoIterator<Item = String>) {
        self.state.lock().featured_kols = wallets.into_iter().collect();
    }

    /// Mirrors the user's own copy-trading subscription state for one KOL.
    pub fn set_kol_active(&self, wallet: &str, active: bool) {
        let mut state = self.state.lock();
        if active {
            state.active_kols.insert(wallet.to_string());
        } else {
            state.active_kols.remove(wallet);
        }
    }

    pub fn is_kol_subscribed(&self, wallet: &str) -> bool {
        self.state.lock().subscribed_kols.contains(wallet)
    }

    pub fn is_token_subscribed(&self, mint: &str) -> bool {
        self.state.lock().subscribed_tokens.contains(mint)
    }

    pub fn subscribed_kol_count(&self) -> usize {
        self.state.lock().subscribed_kols.len()
    }

    pub fn subscribed_token_count(&self) -> usize {
        self.state.lock().subscribed_tokens.len()
    }

    /// Expires stale subscriptions outside the relevant set and re-asserts relevant KOLs.
    pub fn optimize(&self, recent_tokens: &HashSet<String>) -> OptimizeReport {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.prune_pending(now);
        let relevant_kols = state.relevant_kols();
        let stale_after = self.stale_after;
        let is_stale = |timestamps: &HashMap<String, Instant>, key: &str| {
            timestamps
                .get(key)
                .map(|since| now.saturating_duration_since(*since) > stale_after)
                .unwrap_or(true)
        };

        let stale_kols: Vec<String> = state
            .subscribed_kols
            .iter()
            .filter(|wallet| !relevant_kols.contains(*wallet))
            .filter(|wallet| is_stale(&state.timestamps, &kol_key(wallet)))
            .cloned()
            .collect();
        for wallet in &stale_kols {
            Self::unsubscribe_kol_locked(&self.connection, &mut state, wallet);
        }

        let stale_tokens: Vec<String> = state
            .subscribed_tokens
            .iter()
            .filter(|mint| !recent_tokens.contains(*mint))
            .filter(|mint| is_stale(&state.timestamps, &token_key(mint)))
            .cloned()
            .collect();
        for mint in &stale_tokens {
            Self::unsubscribe_token_locked(&self.connection, &mut state, mint);
        }

        let mut resubscribed_kols = 0;
        for wallet in relevant_kols {
            if self.subscribe_kol_locked(&mut state, &wallet, now) {
                resubscribed_kols += 1;
            }
        }

        OptimizeReport {
            expired_kols: stale_kols.len(),
            expired_tokens: stale_tokens.len(),
            resubscribed_kols,
        }
    }
}
