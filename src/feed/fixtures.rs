use crate::error::AppError;
use crate::feed::api::FeedApi;
use crate::feed::types::{MindmapUpdate, NetworkMetrics, Stats, Trade, TradeData, TradeType};
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

pub fn sample_trade(id: &str, mint: &str, timestamp: i64) -> Trade {
    Trade {
        id: id.to_string(),
        kol_wallet: "W1".to_string(),
        signature: format!("sig-{id}"),
        timestamp,
        trade_data: TradeData {
            token_in: "SOL".to_string(),
            token_out: mint.to_string(),
            amount_in: 1.0,
            amount_out: 100.0,
            trade_type: TradeType::Buy,
            mint: Some(mint.to_string()),
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
    }
}

pub fn sample_wallet_trade(id: &str, wallet: &str, mint: &str) -> Trade {
    Trade {
        kol_wallet: wallet.to_string(),
        ..sample_trade(id, mint, 1)
    }
}

pub fn sample_mindmap(mint: &str) -> MindmapUpdate {
    MindmapUpdate {
        token_mint: mint.to_string(),
        kol_connections: HashMap::new(),
        related_tokens: Vec::new(),
        network_metrics: NetworkMetrics::default(),
        last_update: 0,
    }
}

/// Scripted REST backend. `None` results fail with an API error.
#[derive(Default)]
pub struct FakeFeedApi {
    pub trades: Mutex<Option<Vec<Trade>>>,
    pub stats: Mutex<Option<Stats>>,
    pub trending: Mutex<Option<Vec<String>>>,
    pub mindmaps: Mutex<Option<Vec<MindmapUpdate>>>,
    pub delay: Mutex<Option<Duration>>,
    calls: Mutex<Vec<&'static str>>,
}

impl FakeFeedApi {
    pub fn healthy(trades: Vec<Trade>, stats: Stats, trending: Vec<String>) -> Self {
        Self {
            trades: Mutex::new(Some(trades)),
            stats: Mutex::new(Some(stats)),
            trending: Mutex::new(Some(trending)),
            mindmaps: Mutex::new(Some(Vec::new())),
            ..Self::default()
        }
    }

    pub fn call_count(&self, endpoint: &str) -> usize {
        self.calls.lock().iter().filter(|call| **call == endpoint).count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().len()
    }

    async fn respond<T: Clone>(
        &self,
        endpoint: &'static str,
        slot: &Mutex<Option<T>>,
    ) -> Result<T, AppError> {
        self.calls.lock().push(endpoint);
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let result = slot.lock().clone();
        result.ok_or_else(|| AppError::Api {
            message: format!("{endpoint} unavailable"),
        })
    }
}

impl FeedApi for FakeFeedApi {
    fn recent_trades(&self, _limit: usize) -> BoxFuture<'_, Result<Vec<Trade>, AppError>> {
        Box::pin(self.respond("recent_trades", &self.trades))
    }

    fn stats(&self) -> BoxFuture<'_, Result<Stats, AppError>> {
        Box::pin(self.respond("stats", &self.stats))
    }

    fn trending_tokens(&self, _limit: usize) -> BoxFuture<'_, Result<Vec<String>, AppError>> {
        Box::pin(self.respond("trending_tokens", &self.trending))
    }

    fn bulk_mindmaps(
        &self,
        _token_mints: Vec<String>,
    ) -> BoxFuture<'_, Result<Vec<MindmapUpdate>, AppError>> {
        Box::pin(self.respond("bulk_mindmaps", &self.mindmaps))
    }

    fn mindmap(&self, token_mint: String) -> BoxFuture<'_, Result<MindmapUpdate, AppError>> {
        Box::pin(async move {
            self.calls.lock().push("mindmap");
            Ok(sample_mindmap(&token_mint))
        })
    }
}
