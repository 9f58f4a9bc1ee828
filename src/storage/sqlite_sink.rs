// =============================================================================
// SQLite Sink — `candles` table keyed on bucket open time
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use tracing::info;

use super::{CandleSink, SQLITE_FILE_NAME};
use crate::types::{CandleRecord, OutputFormat};

const CREATE_TABLE: &str = "
CREATE TABLE IF NOT EXISTS candles (
    timestamp INTEGER PRIMARY KEY,
    open_price REAL,
    high_price REAL,
    low_price REAL,
    close_price REAL,
    volume REAL,
    num_buyers INTEGER,
    num_sellers INTEGER,
    buyers_volume REAL,
    sellers_volume REAL,
    power_position INTEGER,
    max_buyers_per_second INTEGER,
    max_sellers_per_second INTEGER,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
)";

const UPSERT: &str = "
INSERT OR REPLACE INTO candles
    (timestamp, open_price, high_price, low_price, close_price, volume,
     num_buyers, num_sellers, buyers_volume, sellers_volume, power_position,
     max_buyers_per_second, max_sellers_per_second)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)";

/// Upserts candles into `binance_data.db`, keyed on `timestamp`.
pub struct SqliteSink {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl SqliteSink {
    pub fn open(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(SQLITE_FILE_NAME);
        let conn = Connection::open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        conn.execute(CREATE_TABLE, [])
            .context("failed to create candles table")?;

        info!(path = %path.display(), "SQLite sink ready");
        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    #[cfg(test)]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CandleSink for SqliteSink {
    fn format(&self) -> OutputFormat {
        OutputFormat::Sqlite
    }

    fn persist(&self, candle: &CandleRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            UPSERT,
            params![
                candle.timestamp,
                candle.open,
                candle.high,
                candle.low,
                candle.close,
                candle.volume,
                candle.buyer_count as i64,
                candle.seller_count as i64,
                candle.buyer_volume,
                candle.seller_volume,
                candle.power_position,
                candle.max_buyers_per_second,
                candle.max_sellers_per_second,
            ],
        )
        .with_context(|| {
            format!(
                "failed to upsert candle {} into {}",
                candle.timestamp,
                self.path.display()
            )
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sample_candle;

    #[test]
    fn upsert_keeps_one_row_per_timestamp() {
        let dir = tempfile::TempDir::new().unwrap();
        let sink = SqliteSink::open(dir.path()).unwrap();

        let mut candle = sample_candle(1_700_000_040_000);
        sink.persist(&candle).unwrap();
        candle.buyer_count = 121;
        candle.close = 2046.0;
        sink.persist(&candle).unwrap();
        sink.persist(&sample_candle(1_700_000_100_000)).unwrap();

        let conn = Connection::open(sink.path()).unwrap();
        let total: i64 = conn
            .query_row("SELECT COUNT(*) FROM candles", [], |row| row.get(0))
            .unwrap();
        assert_eq!(total, 2);

        let (buyers, close): (i64, f64) = conn
            .query_row(
                "SELECT num_buyers, close_price FROM candles WHERE timestamp = ?1",
                params![1_700_000_040_000i64],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(buyers, 121);
        assert_eq!(close, 2046.0);
    }

    #[test]
    fn reopen_preserves_existing_rows() {
        let dir = tempfile::TempDir::new().unwrap();
        SqliteSink::open(dir.path())
            .unwrap()
            .persist(&sample_candle(0))
            .unwrap();
        let sink = SqliteSink::open(dir.path()).unwrap();
        sink.persist(&sample_candle(60_000)).unwrap();

        let conn = sink.conn.lock();
        let total: i64 = conn
            .query_row("SELECT COUNT(*) FROM candles", [], |row| row.get(0))
            .unwrap();
        assert_eq!(total, 2);
    }
}
