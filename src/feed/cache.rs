use crate::feed::types::{FeedSnapshot, MindmapUpdate, Stats, Trade};
use std::collections::{HashMap, HashSet, VecDeque};

#[derive(Debug, Clone)]
struct MindmapSlot {
    update: MindmapUpdate,
    touched: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub trades_dropped: usize,
    pub mindmaps_evicted: usize,
}

/// Recent window of trades and mindmap graphs with hard size ceilings.
///
/// Trades are kept newest-first. Mindmap eviction is relevance-aware: entries whose mint
/// does not appear in the trade window go first, least recently written first.
#[derive(Debug)]
pub struct BoundedEventCache {
    max_trades: usize,
    max_mindmap_entries: usize,
    trades: VecDeque<Trade>,
    mindmaps: HashMap<String, MindmapSlot>,
    stats: Option<Stats>,
    trending_tokens: Vec<String>,
    touch_seq: u64,
}

impl BoundedEventCache {
    pub fn new(max_trades: usize, max_mindmap_entries: usize) -> Self {
        Self {
            max_trades: max_trades.max(1),
            max_mindmap_entries: max_mindmap_entries.max(1),
            trades: VecDeque::with_capacity(max_trades.max(1) + 1),
            mindmaps: HashMap::new(),
            stats: None,
            trending_tokens: Vec::new(),
            touch_seq: 0,
        }
    }

    pub fn max_trades(&self) -> usize {
        self.max_trades
    }

    /// Prepends a trade; duplicates by id are ignored. Returns whether it was stored.
    pub fn push_trade(&mut self, trade: Trade) -> bool {
        if self.trades.iter().any(|existing| existing.id == trade.id) {
            return false;
        }
        self.trades.push_front(trade);
        self.trades.truncate(self.max_trades);
        true
    }

    /// Replaces the window with a newest-first list (initial load).
    pub fn replace_trades(&mut self, trades: Vec<Trade>) {
        self.trades.clear();
        let mut seen = HashSet::new();
        for trade in trades {
            if self.trades.len() >= self.max_trades {
                break;
            }
            if seen.insert(trade.id.clone()) {
                self.trades.push_back(trade);
            }
        }
    }

    /// Back-fills the metadata enrichment fields of a cached trade.
    pub fn enrich_trade_metadata(
        &mut self,
        trade_id: &str,
        name: Option<String>,
        symbol: Option<String>,
        image: Option<String>,
    ) -> bool {
        let Some(trade) = self.trades.iter_mut().find(|trade| trade.id == trade_id) else {
            return false;
        };
        if name.is_some() {
            trade.trade_data.name = name;
        }
        if symbol.is_some() {
            trade.trade_data.symbol = symbol;
        }
        if image.is_some() {
            trade.trade_data.image = image;
        }
        true
    }

    pub fn trades(&self) -> impl Iterator<Item = &Trade> {
        self.trades.iter()
    }

    pub fn trade_count(&self) -> usize {
        self.trades.len()
    }

    pub fn recent_mints(&self) -> HashSet<String> {
        self.trades
            .iter()
            .take(self.max_trades)
            .map(|trade| trade.token_mint().to_string())
            .collect()
    }

    /// Stores a mindmap wholesale under its mint. Returns the evicted mint, if any; that may
    /// be the incoming mint itself when every other entry is backed by recent trades.
    pub fn upsert_mindmap(&mut self, update: MindmapUpdate) -> Option<String> {
        self.touch_seq = self.touch_seq.wrapping_add(1);
        let touched = self.touch_seq;
        self.mindmaps.insert(
            update.token_mint.clone(),
            MindmapSlot { update, touched },
        );
        if self.mindmaps.len() > self.max_mindmap_entries {
            return self.evict_one_mindmap();
        }
        None
    }

    fn evict_one_mindmap(&mut self) -> Option<String> {
        let recent = self.recent_mints();
        let victim = self
            .mindmaps
            .iter()
            .filter(|(mint, _)| !recent.contains(mint.as_str()))
            .min_by_key(|(_, slot)| slot.touched)
            .or_else(|| self.mindmaps.iter().min_by_key(|(_, slot)| slot.touched))
            .map(|(mint, _)| mint.clone())?;
        self.mindmaps.remove(&victim);
        Some(victim)
    }

    pub fn mindmap(&self, token_mint: &str) -> Option<&MindmapUpdate> {
        self.mindmaps.get(token_mint).map(|slot| &slot.update)
    }

    pub fn contains_mindmap(&self, token_mint: &str) -> bool {
        self.mindmaps.contains_key(token_mint)
    }

    pub fn mindmap_count(&self) -> usize {
        self.mindmaps.len()
    }

    pub fn set_stats(&mut self, stats: Stats) {
        self.stats = Some(stats);
    }

    pub fn stats(&self) -> Option<Stats> {
        self.stats
    }

    pub fn set_trending_tokens(&mut self, tokens: Vec<String>) {
        self.trending_tokens = tokens;
    }

    pub fn trending_tokens(&self) -> &[String] {
        &self.trending_tokens
    }

    /// Re-applies both ceilings regardless of write activity.
    pub fn cleanup(&mut self) -> CleanupReport {
        let trades_dropped = self.trades.len().saturating_sub(self.max_trades);
        self.trades.truncate(self.max_trades);

        let mut mindmaps_evicted = 0;
        while self.mindmaps.len() > self.max_mindmap_entries {
            if self.evict_one_mindmap().is_none() {
                break;
            }
            mindmaps_evicted += 1;
        }

        CleanupReport {
            trades_dropped,
            mindmaps_evicted,
        }
    }

    pub fn snapshot(&self) -> FeedSnapshot {
        let mut slots: Vec<&MindmapSlot> = self.mindmaps.values().collect();
        slots.sort_unstable_by(|a, b| b.touched.cmp(&a.touched));

        FeedSnapshot {
            trades: self.trades.iter().cloned().collect(),
            mindmaps: slots.into_iter().map(|slot| slot.update.clone()).collect(),
            stats: self.stats,
            trending_tokens: self.trending_tokens.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::fixtures::{sample_mindmap, sample_trade};

    #[test]
    fn trade_window_never_exceeds_cap() {
        let mut cache = BoundedEventCache::new(25, 20);
        for index in 0..200 {
            cache.push_trade(sample_trade(&format!("t{index}"), "M1", index));
            assert!(cache.trade_count() <= 25);
        }
        cache.cleanup();
        assert_eq!(cache.trade_count(), 25);

        let newest = cache.trades().next().expect("window is non-empty");
        assert_eq!(newest.id, "t199");
    }

    #[test]
    fn ignores_duplicate_trade_ids() {
        let mut cache = BoundedEventCache::new(25, 20);
        assert!(cache.push_trade(sample_trade("t1", "M1", 1)));
        assert!(!cache.push_trade(sample_trade("t1", "M1", 2)));
        assert_eq!(cache.trade_count(), 1);
    }

    #[test]
    fn eviction_prefers_mints_absent_from_recent_trades() {
        let mut cache = BoundedEventCache::new(25, 3);
        cache.push_trade(sample_trade("t1", "HOT1", 1));
        cache.push_trade(sample_trade("t2", "HOT2", 2));

        // Oldest writes are the hot mints, so plain LRU would evict them first.
        cache.upsert_mindmap(sample_mindmap("HOT1"));
        cache.upsert_mindmap(sample_mindmap("HOT2"));
        cache.upsert_mindmap(sample_mindmap("COLD1"));

        let evicted = cache.upsert_mindmap(sample_mindmap("COLD2"));
        assert_eq!(evicted.as_deref(), Some("COLD1"));
        assert!(cache.contains_mindmap("HOT1"));
        assert!(cache.contains_mindmap("HOT2"));
        assert_eq!(cache.mindmap_count(), 3);
    }

    #[test]
    fn incoming_cold_mint_yields_to_hot_entries() {
        let mut cache = BoundedEventCache::new(25, 2);
        cache.push_trade(sample_trade("t1", "HOT1", 1));
        cache.push_trade(sample_trade("t2", "HOT2", 2));
        cache.upsert_mindmap(sample_mindmap("HOT1"));
        cache.upsert_mindmap(sample_mindmap("HOT2"));

        let evicted = cache.upsert_mindmap(sample_mindmap("COLD"));
        assert_eq!(evicted.as_deref(), Some("COLD"));
        assert!(cache.contains_mindmap("HOT1"));
        assert!(cache.contains_mindmap("HOT2"));
    }

    #[test]
    fn falls_back_to_lru_when_everything_is_recent() {
        let mut cache = BoundedEventCache::new(25, 2);
        for (index, mint) in ["A", "B", "C"].iter().enumerate() {
            cache.push_trade(sample_trade(&format!("t{index}"), mint, index as i64));
        }
        cache.upsert_mindmap(sample_mindmap("A"));
        cache.upsert_mindmap(sample_mindmap("B"));
        let evicted = cache.upsert_mindmap(sample_mindmap("C"));
        assert_eq!(evicted.as_deref(), Some("A"));
    }

    #[test]
    fn mindmap_updates_replace_wholesale() {
        let mut cache = BoundedEventCache::new(25, 5);
        let mut first = sample_mindmap("M1");
        first.related_tokens = vec!["X".to_string()];
        cache.upsert_mindmap(first);

        let second = sample_mindmap("M1");
        cache.upsert_mindmap(second);
        let stored = cache.mindmap("M1").expect("entry exists");
        assert!(stored.related_tokens.is_empty());
        assert_eq!(cache.mindmap_count(), 1);
    }

    #[test]
    fn enrichment_touches_only_metadata_fields() {
        let mut cache = BoundedEventCache::new(25, 5);
        cache.push_trade(sample_trade("t1", "M1", 1));
        assert!(cache.enrich_trade_metadata(
            "t1",
            Some("Token".to_string()),
            Some("TKN".to_string()),
            None
        ));
        assert!(!cache.enrich_trade_metadata("missing", None, None, None));

        let trade = cache.trades().next().expect("trade exists");
        assert_eq!(trade.trade_data.symbol.as_deref(), Some("TKN"));
        assert_eq!(trade.trade_data.amount_in, 1.0);
        assert!(trade.trade_data.image.is_none());
    }

    #[test]
    fn replace_trades_keeps_newest_first_and_caps() {
        let mut cache = BoundedEventCache::new(25, 5);
        let trades: Vec<Trade> = (0..40)
            .map(|index| sample_trade(&format!("t{index}"), "M1", 100 - index))
            .collect();
        cache.replace_trades(trades);
        assert_eq!(cache.trade_count(), 25);
        assert_eq!(cache.trades().next().map(|trade| trade.id.as_str()), Some("t0"));
    }

    #[test]
    fn snapshot_orders_mindmaps_by_recency() {
        let mut cache = BoundedEventCache::new(25, 5);
        cache.upsert_mindmap(sample_mindmap("M1"));
        cache.upsert_mindmap(sample_mindmap("M2"));
        cache.set_stats(Stats {
            total_trades: 1,
            ..Stats::default()
        });

        let snapshot = cache.snapshot();
        assert_eq!(snapshot.mindmaps[0].token_mint, "M2");
        assert_eq!(snapshot.stats.map(|stats| stats.total_trades), Some(1));
    }
}
