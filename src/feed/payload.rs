//! Inbound socket/REST payload normalization.
//!
//! The server wraps the same entities in several shapes (`{trade}`, `{event:{trade}}`, bare).
//! Everything past this module only sees normalized [`Trade`] / [`MindmapUpdate`] values.

use crate::error::AppError;
use crate::feed::types::{
    KolConnection, MindmapUpdate, NetworkMetrics, Stats, Trade, TradeData, TradeType,
};
use crate::feed::{
    now_unix_ms, FEATURED_KOLS_UPDATED_EVENT, INITIAL_MINDMAP_DATA_EVENT,
    KOL_TRADE_DETECTED_EVENT, KOL_TRADE_UPDATE_EVENT, MINDMAP_UPDATE_EVENT, PONG_EVENT,
    STATS_UPDATE_EVENT, SUBSCRIPTION_UPDATED_EVENT, TRENDING_TOKENS_UPDATE_EVENT,
};
use chrono::DateTime;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Pong { id: String, timestamp: Option<i64> },
    Trade(Trade),
    Mindmap(MindmapUpdate),
    InitialMindmaps(Vec<MindmapUpdate>),
    Stats(Stats),
    TrendingTokens(Vec<String>),
    SubscriptionUpdated { kol_wallet: String, is_active: bool },
    FeaturedKols(Vec<String>),
    Unknown(String),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TimestampWire {
    Millis(i64),
    Float(f64),
    Text(String),
}

impl TimestampWire {
    fn into_unix_ms(self) -> Result<i64, AppError> {
        match self {
            Self::Millis(value) => Ok(value),
            Self::Float(value) if value.is_finite() => Ok(value as i64),
            Self::Float(_) => Err(AppError::InvalidPayload(
                "timestamp must be finite".to_string(),
            )),
            Self::Text(text) => {
                if let Ok(value) = text.parse::<i64>() {
                    return Ok(value);
                }
                DateTime::parse_from_rfc3339(&text)
                    .map(|parsed| parsed.timestamp_millis())
                    .map_err(|error| {
                        AppError::InvalidPayload(format!("invalid timestamp '{text}': {error}"))
                    })
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AmountWire {
    Number(f64),
    Text(String),
}

impl AmountWire {
    fn into_f64(self) -> Result<f64, AppError> {
        let value = match self {
            Self::Number(value) => value,
            Self::Text(text) => text.trim().parse::<f64>().map_err(|error| {
                AppError::InvalidPayload(format!("invalid amount '{text}': {error}"))
            })?,
        };
        if !value.is_finite() || value < 0.0 {
            return Err(AppError::InvalidPayload(
                "amounts must be finite and non-negative".to_string(),
            ));
        }
        Ok(value)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TradeDataWire {
    token_in: String,
    token_out: String,
    amount_in: AmountWire,
    amount_out: AmountWire,
    trade_type: String,
    mint: Option<String>,
    #[serde(default)]
    dex_program: Option<String>,
    fee: Option<AmountWire>,
    name: Option<String>,
    symbol: Option<String>,
    image: Option<String>,
    metadata_uri: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TradeWire {
    id: Option<String>,
    kol_wallet: String,
    #[serde(default)]
    signature: Option<String>,
    timestamp: Option<TimestampWire>,
    trade_data: TradeDataWire,
    #[serde(default)]
    affected_users: Vec<String>,
    #[serde(default)]
    processed: bool,
    prediction: Option<Value>,
}

fn parse_trade_type(raw: &str) -> Result<TradeType, AppError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "buy" => Ok(TradeType::Buy),
        "sell" => Ok(TradeType::Sell),
        other => Err(AppError::InvalidPayload(format!(
            "unknown trade type '{other}'"
        ))),
    }
}

fn fallback_trade_id(kol_wallet: &str, timestamp: i64) -> String {
    let suffix: u32 = rand::random();
    format!("{kol_wallet}-{timestamp}-{suffix:08x}")
}

impl TryFrom<TradeWire> for Trade {
    type Error = AppError;

    fn try_from(value: TradeWire) -> Result<Self, Self::Error> {
        if value.kol_wallet.trim().is_empty() {
            return Err(AppError::InvalidPayload(
                "trade is missing kolWallet".to_string(),
            ));
        }
        let timestamp = match value.timestamp {
            Some(raw) => raw.into_unix_ms()?,
            None => now_unix_ms(),
        };
        let id = value
            .id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| fallback_trade_id(&value.kol_wallet, timestamp));
        let wire = value.trade_data;
        let fee = match wire.fee {
            Some(fee) => Some(fee.into_f64()?),
            None => None,
        };

        Ok(Self {
            id,
            kol_wallet: value.kol_wallet,
            signature: value.signature.unwrap_or_default(),
            timestamp,
            trade_data: TradeData {
                token_in: wire.token_in,
                token_out: wire.token_out,
                amount_in: wire.amount_in.into_f64()?,
                amount_out: wire.amount_out.into_f64()?,
                trade_type: parse_trade_type(&wire.trade_type)?,
                mint: wire.mint.filter(|mint| !mint.is_empty()),
                dex_program: wire.dex_program.unwrap_or_default(),
                fee,
                name: wire.name,
                symbol: wire.symbol,
                image: wire.image,
                metadata_uri: wire.metadata_uri,
            },
            affected_users: value.affected_users,
            processed: value.processed,
            prediction: value.prediction,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KolConnectionWire {
    #[serde(default)]
    trade_count: u64,
    #[serde(default)]
    total_volume: f64,
    last_trade_time: Option<TimestampWire>,
    #[serde(default)]
    influence_score: f64,
    #[serde(default)]
    trade_types: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MindmapWire {
    token_mint: String,
    #[serde(default)]
    kol_connections: HashMap<String, KolConnectionWire>,
    #[serde(default)]
    related_tokens: Vec<String>,
    #[serde(default)]
    network_metrics: NetworkMetrics,
    last_update: Option<TimestampWire>,
}

impl TryFrom<MindmapWire> for MindmapUpdate {
    type Error = AppError;

    fn try_from(value: MindmapWire) -> Result<Self, Self::Error> {
        if value.token_mint.trim().is_empty() {
            return Err(AppError::InvalidPayload(
                "mindmap update is missing tokenMint".to_string(),
            ));
        }
        let mut kol_connections = HashMap::with_capacity(value.kol_connections.len());
        for (wallet, wire) in value.kol_connections {
            let last_trade_time = match wire.last_trade_time {
                Some(raw) => raw.into_unix_ms()?,
                None => 0,
            };
            let trade_types = wire
                .trade_types
                .iter()
                .filter_map(|raw| parse_trade_type(raw).ok())
                .collect();
            kol_connections.insert(
                wallet,
                KolConnection {
                    trade_count: wire.trade_count,
                    total_volume: wire.total_volume,
                    last_trade_time,
                    influence_score: wire.influence_score,
                    trade_types,
                },
            );
        }
        let last_update = match value.last_update {
            Some(raw) => raw.into_unix_ms()?,
            None => now_unix_ms(),
        };

        Ok(Self {
            token_mint: value.token_mint,
            kol_connections,
            related_tokens: value.related_tokens,
            network_metrics: value.network_metrics,
            last_update,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TrendingEntryWire {
    Mint(String),
    Object {
        #[serde(alias = "tokenMint", alias = "mint")]
        token_mint: String,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FeaturedKolWire {
    Wallet(String),
    Object {
        #[serde(alias = "walletAddress", alias = "kolWallet")]
        wallet_address: String,
    },
}

fn trade_value(data: &Value) -> Option<&Value> {
    if let Some(trade) = data.get("trade") {
        return Some(trade);
    }
    if let Some(trade) = data.get("event").and_then(|event| event.get("trade")) {
        return Some(trade);
    }
    data.get("kolWallet").map(|_| data)
}

pub fn parse_trade_value(value: Value) -> Result<Trade, AppError> {
    let wire: TradeWire = serde_json::from_value(value)
        .map_err(|error| AppError::InvalidPayload(format!("malformed trade: {error}")))?;
    wire.try_into()
}

pub fn parse_mindmap_value(value: Value) -> Result<MindmapUpdate, AppError> {
    let wire: MindmapWire = serde_json::from_value(value)
        .map_err(|error| AppError::InvalidPayload(format!("malformed mindmap: {error}")))?;
    wire.try_into()
}

pub fn parse_trending_value(value: Value) -> Result<Vec<String>, AppError> {
    let entries: Vec<TrendingEntryWire> = serde_json::from_value(value)
        .map_err(|error| AppError::InvalidPayload(format!("malformed trending list: {error}")))?;
    Ok(entries
        .into_iter()
        .map(|entry| match entry {
            TrendingEntryWire::Mint(mint) => mint,
            TrendingEntryWire::Object { token_mint } => token_mint,
        })
        .filter(|mint| !mint.is_empty())
        .collect())
}

/// Either a list of updates or a `{mint: update}` object.
pub fn parse_mindmap_collection(value: Value) -> Result<Vec<MindmapUpdate>, AppError> {
    match value {
        Value::Array(items) => items.into_iter().map(parse_mindmap_value).collect(),
        Value::Object(map) if map.contains_key("tokenMint") => {
            parse_mindmap_value(Value::Object(map)).map(|update| vec![update])
        }
        Value::Object(map) => map
            .into_iter()
            .map(|(mint, mut entry)| {
                if let Value::Object(fields) = &mut entry {
                    fields
                        .entry("tokenMint")
                        .or_insert_with(|| Value::String(mint.clone()));
                }
                parse_mindmap_value(entry)
            })
            .collect(),
        _ => Err(AppError::InvalidPayload(
            "mindmap collection must be an array or object".to_string(),
        )),
    }
}

fn required_str<'a>(data: &'a Value, key: &str) -> Result<&'a str, AppError> {
    data.get(key)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| AppError::InvalidPayload(format!("payload is missing '{key}'")))
}

/// Maps one named socket event onto the normalized inbound model.
pub fn normalize_event(name: &str, data: Value) -> Result<InboundEvent, AppError> {
    match name {
        PONG_EVENT => {
            let id = required_str(&data, "id")?.to_string();
            let timestamp = data.get("timestamp").and_then(Value::as_i64);
            Ok(InboundEvent::Pong { id, timestamp })
        }
        KOL_TRADE_UPDATE_EVENT | KOL_TRADE_DETECTED_EVENT => {
            let trade = trade_value(&data)
                .cloned()
                .ok_or_else(|| AppError::InvalidPayload("event carries no trade".to_string()))?;
            parse_trade_value(trade).map(InboundEvent::Trade)
        }
        MINDMAP_UPDATE_EVENT => {
            required_str(&data, "tokenMint")?;
            let nested = data
                .get("data")
                .filter(|inner| inner.get("tokenMint").is_some())
                .cloned();
            parse_mindmap_value(nested.unwrap_or(data)).map(InboundEvent::Mindmap)
        }
        INITIAL_MINDMAP_DATA_EVENT => {
            parse_mindmap_collection(data).map(InboundEvent::InitialMindmaps)
        }
        STATS_UPDATE_EVENT => {
            let nested = data.get("stats").cloned();
            let stats: Stats = serde_json::from_value(nested.unwrap_or(data))
                .map_err(|error| AppError::InvalidPayload(format!("malformed stats: {error}")))?;
            Ok(InboundEvent::Stats(stats))
        }
        TRENDING_TOKENS_UPDATE_EVENT => {
            let list = match data {
                Value::Object(mut map) => map
                    .remove("tokens")
                    .or_else(|| map.remove("trendingTokens"))
                    .unwrap_or(Value::Null),
                other => other,
            };
            parse_trending_value(list).map(InboundEvent::TrendingTokens)
        }
        SUBSCRIPTION_UPDATED_EVENT => {
            let kol_wallet = required_str(&data, "kolWallet")?.to_string();
            let is_active = data
                .get("isActive")
                .and_then(Value::as_bool)
                .ok_or_else(|| AppError::InvalidPayload("payload is missing 'isActive'".to_string()))?;
            Ok(InboundEvent::SubscriptionUpdated {
                kol_wallet,
                is_active,
            })
        }
        FEATURED_KOLS_UPDATED_EVENT => {
            let list = data
                .get("featuredKOLs")
                .cloned()
                .ok_or_else(|| AppError::InvalidPayload("payload is missing 'featuredKOLs'".to_string()))?;
            let entries: Vec<FeaturedKolWire> = serde_json::from_value(list).map_err(|error| {
                AppError::InvalidPayload(format!("malformed featured KOL list: {error}"))
            })?;
            Ok(InboundEvent::FeaturedKols(
                entries
                    .into_iter()
                    .map(|entry| match entry {
                        FeaturedKolWire::Wallet(wallet) => wallet,
                        FeaturedKolWire::Object { wallet_address } => wallet_address,
                    })
                    .filter(|wallet| !wallet.is_empty())
                    .collect(),
            ))
        }
        other => Ok(InboundEvent::Unknown(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn trade_json() -> Value {
        json!({
            "id": "t1",
            "kolWallet": "W1",
            "signature": "sig1",
            "timestamp": "2024-05-01T12:00:00Z",
            "tradeData": {
                "tokenIn": "So11111111111111111111111111111111111111112",
                "tokenOut": "M1",
                "amountIn": 1.5,
                "amountOut": "2500",
                "tradeType": "buy",
                "dexProgram": "pumpfun"
            },
            "affectedUsers": ["u1"],
            "processed": true
        })
    }

    #[test]
    fn unwraps_nested_trade_shapes() {
        let wrapped = normalize_event(KOL_TRADE_UPDATE_EVENT, json!({ "trade": trade_json() }))
            .expect("wrapped trade should parse");
        let nested =
            normalize_event(KOL_TRADE_DETECTED_EVENT, json!({ "event": { "trade": trade_json() } }))
                .expect("nested trade should parse");
        let bare = normalize_event(KOL_TRADE_UPDATE_EVENT, trade_json()).expect("bare trade");

        for event in [wrapped, nested, bare] {
            let InboundEvent::Trade(trade) = event else {
                panic!("expected trade event");
            };
            assert_eq!(trade.id, "t1");
            assert_eq!(trade.timestamp, 1_714_564_800_000);
            assert_eq!(trade.trade_data.amount_out, 2_500.0);
            assert_eq!(trade.token_mint(), "M1");
        }
    }

    #[test]
    fn generates_fallback_trade_id() {
        let mut raw = trade_json();
        raw.as_object_mut().expect("object").remove("id");
        raw["timestamp"] = json!(1_000);

        let trade = parse_trade_value(raw).expect("trade should parse");
        assert!(trade.id.starts_with("W1-1000-"));
    }

    #[test]
    fn drops_trade_event_without_trade() {
        let result = normalize_event(KOL_TRADE_UPDATE_EVENT, json!({ "something": 1 }));
        assert!(matches!(result, Err(AppError::InvalidPayload(_))));
    }

    #[test]
    fn rejects_negative_amounts() {
        let mut raw = trade_json();
        raw["tradeData"]["amountIn"] = json!(-1.0);
        assert!(parse_trade_value(raw).is_err());
    }

    #[test]
    fn requires_token_mint_for_mindmap_updates() {
        let result = normalize_event(MINDMAP_UPDATE_EVENT, json!({ "data": {} }));
        assert!(result.is_err());

        let event = normalize_event(
            MINDMAP_UPDATE_EVENT,
            json!({
                "tokenMint": "M1",
                "kolConnections": {
                    "W1": { "tradeCount": 2, "totalVolume": 3.5, "lastTradeTime": 10, "influenceScore": 0.4, "tradeTypes": ["buy", "sell"] }
                },
                "relatedTokens": ["M2"],
                "networkMetrics": { "centrality": 0.5, "clustering": 0.1, "totalTrades": 2 },
                "lastUpdate": 20
            }),
        )
        .expect("mindmap should parse");
        let InboundEvent::Mindmap(update) = event else {
            panic!("expected mindmap event");
        };
        assert_eq!(update.kol_connections["W1"].trade_types.len(), 2);
        assert_eq!(update.network_metrics.total_trades, 2);
        assert_eq!(update.last_update, 20);
    }

    #[test]
    fn parses_initial_mindmap_object_keyed_by_mint() {
        let event = normalize_event(
            INITIAL_MINDMAP_DATA_EVENT,
            json!({ "M1": { "relatedTokens": [] }, "M2": { "relatedTokens": ["M1"] } }),
        )
        .expect("initial data should parse");
        let InboundEvent::InitialMindmaps(mut updates) = event else {
            panic!("expected initial mindmaps");
        };
        updates.sort_by(|a, b| a.token_mint.cmp(&b.token_mint));
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[1].token_mint, "M2");
    }

    #[test]
    fn parses_stats_trending_and_featured_lists() {
        let stats = normalize_event(
            STATS_UPDATE_EVENT,
            json!({ "totalTrades": 9, "uniqueKOLs": 3, "uniqueTokens": 4, "totalVolume": 12.5 }),
        )
        .expect("stats should parse");
        assert_eq!(
            stats,
            InboundEvent::Stats(Stats {
                total_trades: 9,
                unique_kols: 3,
                unique_tokens: 4,
                total_volume: 12.5
            })
        );

        let trending = normalize_event(
            TRENDING_TOKENS_UPDATE_EVENT,
            json!({ "tokens": ["M1", { "tokenMint": "M2" }] }),
        )
        .expect("trending should parse");
        assert_eq!(
            trending,
            InboundEvent::TrendingTokens(vec!["M1".to_string(), "M2".to_string()])
        );

        let featured = normalize_event(
            FEATURED_KOLS_UPDATED_EVENT,
            json!({ "featuredKOLs": ["W1", { "walletAddress": "W2" }] }),
        )
        .expect("featured list should parse");
        assert_eq!(
            featured,
            InboundEvent::FeaturedKols(vec!["W1".to_string(), "W2".to_string()])
        );
    }

    #[test]
    fn subscription_update_requires_flag() {
        assert!(normalize_event(SUBSCRIPTION_UPDATED_EVENT, json!({ "kolWallet": "W1" })).is_err());
        assert_eq!(
            normalize_event(
                SUBSCRIPTION_UPDATED_EVENT,
                json!({ "kolWallet": "W1", "isActive": false })
            )
            .expect("subscription update"),
            InboundEvent::SubscriptionUpdated {
                kol_wallet: "W1".to_string(),
                is_active: false
            }
        );
    }

    #[test]
    fn unknown_events_pass_through_by_name() {
        assert_eq!(
            normalize_event("something_new", Value::Null).expect("unknown event"),
            InboundEvent::Unknown("something_new".to_string())
        );
    }
}
