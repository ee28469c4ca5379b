use crate::error::AppError;
use crate::feed::payload::{
    parse_mindmap_collection, parse_mindmap_value, parse_trade_value, parse_trending_value,
};
use crate::feed::types::{ApiEnvelope, MindmapUpdate, Stats, Trade};
use futures_util::future::BoxFuture;
use reqwest::Client;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY_MS: u64 = 250;
const RETRY_MAX_DELAY_MS: u64 = 2_000;

/// REST surface the sync layer consumes. Implemented over HTTP in production and by
/// in-memory fakes in tests.
pub trait FeedApi: Send + Sync {
    fn recent_trades(&self, limit: usize) -> BoxFuture<'_, Result<Vec<Trade>, AppError>>;
    fn stats(&self) -> BoxFuture<'_, Result<Stats, AppError>>;
    fn trending_tokens(&self, limit: usize) -> BoxFuture<'_, Result<Vec<String>, AppError>>;
    fn bulk_mindmaps(
        &self,
        token_mints: Vec<String>,
    ) -> BoxFuture<'_, Result<Vec<MindmapUpdate>, AppError>>;
    fn mindmap(&self, token_mint: String) -> BoxFuture<'_, Result<MindmapUpdate, AppError>>;
}

fn recent_trades_endpoint(base_url: &str, limit: usize) -> String {
    format!("{base_url}/kol-trades/recent?limit={limit}")
}

fn stats_endpoint(base_url: &str) -> String {
    format!("{base_url}/kol-trades/stats")
}

fn trending_tokens_endpoint(base_url: &str, limit: usize) -> String {
    format!("{base_url}/kol-trades/trending-tokens?limit={limit}")
}

fn bulk_mindmap_endpoint(base_url: &str) -> String {
    format!("{base_url}/kol-trades/mindmap/bulk")
}

fn mindmap_endpoint(base_url: &str, token_mint: &str) -> String {
    format!("{base_url}/kol-trades/mindmap/{token_mint}")
}

fn retry_delay(attempt: u32) -> Duration {
    let exponent = attempt.min(4);
    let delay_ms = RETRY_BASE_DELAY_MS.saturating_mul(1_u64 << exponent);
    Duration::from_millis(delay_ms.min(RETRY_MAX_DELAY_MS))
}

/// Runs `operation` until it succeeds, fails permanently, or `max_attempts` is spent.
pub async fn with_retry<T, F, Fut>(
    label: &'static str,
    max_attempts: u32,
    mut operation: F,
) -> Result<T, AppError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0_u32;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_transient() && attempt + 1 < max_attempts => {
                attempt += 1;
                let delay = retry_delay(attempt);
                debug!(endpoint = label, attempt, ?delay, %error, "retrying request");
                tokio::time::sleep(delay).await;
            }
            Err(error) => return Err(error),
        }
    }
}

/// Pulls a list out of `data`, accepting either a bare array or `{key: [...]}`.
fn take_list(data: Value, keys: &[&str]) -> Value {
    match data {
        Value::Object(mut map) => keys
            .iter()
            .find_map(|key| map.remove(*key))
            .unwrap_or(Value::Array(Vec::new())),
        other => other,
    }
}

fn parse_trade_list(data: Value) -> Result<Vec<Trade>, AppError> {
    let Value::Array(items) = take_list(data, &["trades"]) else {
        return Err(AppError::InvalidPayload(
            "recent trades payload is not a list".to_string(),
        ));
    };
    let mut trades = Vec::with_capacity(items.len());
    for item in items {
        match parse_trade_value(item) {
            Ok(trade) => trades.push(trade),
            Err(error) => warn!(%error, "dropping malformed trade from REST payload"),
        }
    }
    Ok(trades)
}

#[derive(Clone)]
pub struct HttpFeedApi {
    client: Client,
    base_url: String,
    auth_token: Option<String>,
    request_timeout: Duration,
    max_attempts: u32,
}

impl HttpFeedApi {
    pub fn new(
        client: Client,
        base_url: impl Into<String>,
        auth_token: Option<String>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            auth_token,
            request_timeout,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    async fn send_once(
        &self,
        label: &'static str,
        request: reqwest::RequestBuilder,
    ) -> Result<Value, AppError> {
        let request = match self.auth_token.as_deref() {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        let exchange = async {
            let response = request.send().await?.error_for_status()?;
            let envelope = response.json::<ApiEnvelope<Value>>().await?;
            envelope.into_data()
        };
        tokio::time::timeout(self.request_timeout, exchange)
            .await
            .map_err(|_| AppError::Timeout(label))?
    }

    async fn get_data(&self, label: &'static str, endpoint: String) -> Result<Value, AppError> {
        let api = self;
        let endpoint = endpoint.as_str();
        with_retry(label, self.max_attempts, move || {
            api.send_once(label, api.client.get(endpoint))
        })
        .await
    }

    async fn post_data(
        &self,
        label: &'static str,
        endpoint: String,
        body: Value,
    ) -> Result<Value, AppError> {
        let api = self;
        let endpoint = endpoint.as_str();
        let body = &body;
        with_retry(label, self.max_attempts, move || {
            api.send_once(label, api.client.post(endpoint).json(body))
        })
        .await
    }
}

impl FeedApi for HttpFeedApi {
    fn recent_trades(&self, limit: usize) -> BoxFuture<'_, Result<Vec<Trade>, AppError>> {
        Box::pin(async move {
            let data = self
                .get_data("recent_trades", recent_trades_endpoint(&self.base_url, limit))
                .await?;
            parse_trade_list(data)
        })
    }

    fn stats(&self) -> BoxFuture<'_, Result<Stats, AppError>> {
        Box::pin(async move {
            let data = self.get_data("stats", stats_endpoint(&self.base_url)).await?;
            let data = match data {
                Value::Object(mut map) if map.contains_key("stats") => {
                    map.remove("stats").unwrap_or(Value::Null)
                }
                other => other,
            };
            serde_json::from_value(data)
                .map_err(|error| AppError::InvalidPayload(format!("malformed stats: {error}")))
        })
    }

    fn trending_tokens(&self, limit: usize) -> BoxFuture<'_, Result<Vec<String>, AppError>> {
        Box::pin(async move {
            let data = self
                .get_data(
                    "trending_tokens",
                    trending_tokens_endpoint(&self.base_url, limit),
                )
                .await?;
            parse_trending_value(take_list(data, &["trendingTokens", "tokens"]))
        })
    }

    fn bulk_mindmaps(
        &self,
        token_mints: Vec<String>,
    ) -> BoxFuture<'_, Result<Vec<MindmapUpdate>, AppError>> {
        Box::pin(async move {
            let body = serde_json::json!({ "tokenMints": token_mints });
            let data = self
                .post_data("bulk_mindmaps", bulk_mindmap_endpoint(&self.base_url), body)
                .await?;
            parse_mindmap_collection(data)
        })
    }

    fn mindmap(&self, token_mint: String) -> BoxFuture<'_, Result<MindmapUpdate, AppError>> {
        Box::pin(async move {
            let data = self
                .get_data("mindmap", mindmap_endpoint(&self.base_url, &token_mint))
                .await?;
            parse_mindmap_value(data)
        })
    }
}
