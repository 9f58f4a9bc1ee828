// =============================================================================
// Shared types used across the candle collector
// =============================================================================

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A single trade print from the exchange trade stream.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TradeEvent {
    /// Trade time in milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub price: f64,
    pub quantity: f64,
    /// True when the buyer was the resting (maker) side, i.e. the trade was
    /// initiated by a seller hitting the bid.
    pub is_sell_pressure: bool,
    pub trade_id: u64,
}

impl TradeEvent {
    /// Integer second this trade falls into.
    pub fn second(&self) -> i64 {
        self.timestamp.div_euclid(1000)
    }
}

/// Which side had more individual trades within a bucket.
///
/// `1` buyers dominated, `-1` sellers dominated, `0` tie.
pub fn power_position(buyer_count: u64, seller_count: u64) -> i8 {
    match buyer_count.cmp(&seller_count) {
        std::cmp::Ordering::Greater => 1,
        std::cmp::Ordering::Less => -1,
        std::cmp::Ordering::Equal => 0,
    }
}

/// A finished one-minute candle enriched with trade-side statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandleRecord {
    /// Bucket open time in milliseconds since the Unix epoch.
    pub timestamp: i64,
    #[serde(rename = "open_price")]
    pub open: f64,
    #[serde(rename = "high_price")]
    pub high: f64,
    #[serde(rename = "low_price")]
    pub low: f64,
    #[serde(rename = "close_price")]
    pub close: f64,
    pub volume: f64,
    #[serde(rename = "num_buyers")]
    pub buyer_count: u64,
    #[serde(rename = "num_sellers")]
    pub seller_count: u64,
    #[serde(rename = "buyers_volume")]
    pub buyer_volume: f64,
    #[serde(rename = "sellers_volume")]
    pub seller_volume: f64,
    pub power_position: i8,
    pub max_buyers_per_second: u32,
    pub max_sellers_per_second: u32,
}

impl CandleRecord {
    /// Bucket open time rendered as an RFC 3339 UTC string.
    pub fn datetime(&self) -> String {
        chrono::DateTime::<chrono::Utc>::from_timestamp_millis(self.timestamp)
            .map(|dt| dt.to_rfc3339())
            .unwrap_or_default()
    }
}

/// Where finished candles are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Csv,
    Json,
    Sqlite,
}

impl Default for OutputFormat {
    fn default() -> Self {
        Self::Csv
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Csv => write!(f, "csv"),
            Self::Json => write!(f, "json"),
            Self::Sqlite => write!(f, "sqlite"),
        }
    }
}

impl FromStr for OutputFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "csv" => Ok(Self::Csv),
            "json" | "jsonl" => Ok(Self::Json),
            "sqlite" | "db" => Ok(Self::Sqlite),
            other => anyhow::bail!("unknown output format: {other}"),
        }
    }
}
