// =============================================================================
// Candle Sinks — Durable storage for finished candles
// =============================================================================
//
// Three interchangeable backends selected by `OutputFormat`:
//   - csv:    one timestamped file per process run, header + one row per candle
//   - json:   one JSON object per line, one file per calendar day
//   - sqlite: `candles` table keyed on `timestamp` with upsert semantics
//
// Sinks are synchronous and are always called from the blocking pool.
// =============================================================================

pub mod csv_sink;
pub mod jsonl_sink;
pub mod sqlite_sink;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::types::{CandleRecord, OutputFormat};

pub use csv_sink::CsvSink;
pub use jsonl_sink::JsonlSink;
pub use sqlite_sink::SqliteSink;

/// Prefix shared by every candle file the sinks create.
pub const DATA_FILE_PREFIX: &str = "binance_data";
/// SQLite database file name.
pub const SQLITE_FILE_NAME: &str = "binance_data.db";

/// Column order used by the CSV sink.
pub const CSV_HEADER: [&str; 14] = [
    "timestamp",
    "datetime",
    "open",
    "high",
    "low",
    "close",
    "volume",
    "num_buyers",
    "num_sellers",
    "buyers_volume",
    "sellers_volume",
    "power_position",
    "max_buyers_per_second",
    "max_sellers_per_second",
];

/// A destination for finished candles.
pub trait CandleSink: Send + Sync {
    fn format(&self) -> OutputFormat;

    /// Write one candle durably.  Errors are reported, never retried here.
    fn persist(&self, candle: &CandleRecord) -> Result<()>;
}

/// Open the sink for `format` inside `data_dir`, creating the directory if
/// needed.
pub fn open_sink(format: OutputFormat, data_dir: &Path) -> Result<Arc<dyn CandleSink>> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;

    let sink: Arc<dyn CandleSink> = match format {
        OutputFormat::Csv => Arc::new(CsvSink::create(data_dir)?),
        OutputFormat::Json => Arc::new(JsonlSink::new(data_dir)),
        OutputFormat::Sqlite => Arc::new(SqliteSink::open(data_dir)?),
    };
    Ok(sink)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_sink_creates_missing_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let nested = dir.path().join("a").join("b");

        let sink = open_sink(OutputFormat::Json, &nested).unwrap();
        assert_eq!(sink.format(), OutputFormat::Json);
        assert!(nested.is_dir());

        let sink = open_sink(OutputFormat::Sqlite, &nested).unwrap();
        assert_eq!(sink.format(), OutputFormat::Sqlite);
        assert!(nested.join(SQLITE_FILE_NAME).exists());
    }
}

#[cfg(test)]
pub(crate) fn sample_candle(timestamp: i64) -> CandleRecord {
    CandleRecord {
        timestamp,
        open: 2040.0,
        high: 2050.5,
        low: 2039.1,
        close: 2045.17,
        volume: 812.331,
        buyer_count: 120,
        seller_count: 95,
        buyer_volume: 410.25,
        seller_volume: 402.081,
        power_position: 1,
        max_buyers_per_second: 9,
        max_sellers_per_second: 7,
    }
}
