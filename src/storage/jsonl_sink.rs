// =============================================================================
// JSON-lines Sink — daily files of one candle object per line
// =============================================================================

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use parking_lot::Mutex;

use super::{CandleSink, DATA_FILE_PREFIX};
use crate::types::{CandleRecord, OutputFormat};

/// Appends one JSON object per candle to `binance_data_<YYYYMMDD>.jsonl`,
/// rolling to a new file when the local date changes.
pub struct JsonlSink {
    data_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlSink {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    /// File that receives candles written on `date`.
    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.data_dir
            .join(format!("{DATA_FILE_PREFIX}_{}.jsonl", date.format("%Y%m%d")))
    }

    fn encode(candle: &CandleRecord) -> Result<String> {
        let mut value = serde_json::to_value(candle).context("failed to serialise candle")?;
        if let Some(obj) = value.as_object_mut() {
            obj.insert("datetime".to_string(), candle.datetime().into());
        }
        serde_json::to_string(&value).context("failed to encode candle line")
    }
}

impl CandleSink for JsonlSink {
    fn format(&self) -> OutputFormat {
        OutputFormat::Json
    }

    fn persist(&self, candle: &CandleRecord) -> Result<()> {
        let line = Self::encode(candle)?;
        let path = self.path_for(Local::now().date_naive());

        let _guard = self.write_lock.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        writeln!(file, "{line}").with_context(|| format!("failed to append to {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sample_candle;

    #[test]
    fn one_object_per_line_with_datetime() {
        let dir = tempfile::TempDir::new().unwrap();
        let sink = JsonlSink::new(dir.path());
        sink.persist(&sample_candle(1_700_000_040_000)).unwrap();
        sink.persist(&sample_candle(1_700_000_100_000)).unwrap();

        let path = sink.path_for(Local::now().date_naive());
        let content = std::fs::read_to_string(path).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["timestamp"], 1_700_000_040_000i64);
        assert_eq!(lines[0]["datetime"], "2023-11-14T22:14:00+00:00");
        assert_eq!(lines[0]["num_buyers"], 120);
        assert_eq!(lines[0]["power_position"], 1);
        assert_eq!(lines[1]["open_price"], 2040.0);
    }

    #[test]
    fn file_name_follows_date() {
        let sink = JsonlSink::new(Path::new("/tmp/collector"));
        let date = NaiveDate::from_ymd_opt(2025, 8, 3).unwrap();
        assert_eq!(
            sink.path_for(date),
            PathBuf::from("/tmp/collector/binance_data_20250803.jsonl")
        );
    }
}
