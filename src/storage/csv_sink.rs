// =============================================================================
// CSV Sink — one header row, one row per candle
// =============================================================================
//
// Each collector run writes to its own file named after the start time.
// Reopening an existing file appends without repeating the header.
// =============================================================================

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;
use parking_lot::Mutex;
use tracing::info;

use super::{CandleSink, CSV_HEADER, DATA_FILE_PREFIX};
use crate::types::{CandleRecord, OutputFormat};

/// Appends candles to `binance_data_<start time>.csv`.
pub struct CsvSink {
    path: PathBuf,
    writer: Mutex<csv::Writer<File>>,
}

impl CsvSink {
    /// Create a fresh file named after the current local time and write the
    /// header row.
    pub fn create(data_dir: &Path) -> Result<Self> {
        let name = format!(
            "{DATA_FILE_PREFIX}_{}.csv",
            Local::now().format("%Y%m%d_%H%M%S")
        );
        Self::create_at(data_dir.join(name))
    }

    pub fn create_at(path: PathBuf) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        let is_new = file.metadata().map(|m| m.len() == 0).unwrap_or(true);

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        if is_new {
            writer
                .write_record(CSV_HEADER)
                .context("failed to write CSV header")?;
            writer.flush().context("failed to flush CSV header")?;
        }

        info!(path = %path.display(), "CSV sink ready");
        Ok(Self {
            path,
            writer: Mutex::new(writer),
        })
    }

    #[cfg(test)]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CandleSink for CsvSink {
    fn format(&self) -> OutputFormat {
        OutputFormat::Csv
    }

    fn persist(&self, candle: &CandleRecord) -> Result<()> {
        let row = [
            candle.timestamp.to_string(),
            candle.datetime(),
            candle.open.to_string(),
            candle.high.to_string(),
            candle.low.to_string(),
            candle.close.to_string(),
            candle.volume.to_string(),
            candle.buyer_count.to_string(),
            candle.seller_count.to_string(),
            candle.buyer_volume.to_string(),
            candle.seller_volume.to_string(),
            candle.power_position.to_string(),
            candle.max_buyers_per_second.to_string(),
            candle.max_sellers_per_second.to_string(),
        ];

        let mut writer = self.writer.lock();
        writer
            .write_record(&row)
            .with_context(|| format!("failed to append to {}", self.path.display()))?;
        writer.flush().context("failed to flush CSV row")?;
        Ok(())
    }
}
