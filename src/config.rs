// =============================================================================
// Collector Configuration — JSON file + environment overrides
// =============================================================================
//
// Settings resolve in three layers: built-in defaults, an optional JSON file,
// then environment variables (a `.env` file is loaded first by `main`).  All
// fields carry `#[serde(default)]` so a partial JSON file is always valid.
//
// The aggregation core itself takes no settings from here: bucket duration and
// retention are fixed constants in `market_data::candle_aggregator`.
// =============================================================================

use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use crate::types::OutputFormat;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbol() -> String {
    "ETHUSDT".to_string()
}

fn default_base_url() -> String {
    "wss://stream.binance.com:9443".to_string()
}

fn default_reconnect_interval_secs() -> u64 {
    5
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_ping_interval_secs() -> u64 {
    20
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_log_level() -> String {
    "INFO".to_string()
}

fn default_buffer_size() -> usize {
    100_000
}

fn default_status_interval_secs() -> u64 {
    60
}

// =============================================================================
// CollectorConfig
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectorConfig {
    // --- Market ---------------------------------------------------------------

    /// Trading pair to collect, e.g. `ETHUSDT`.
    #[serde(default = "default_symbol")]
    pub symbol: String,

    /// WebSocket base URL without the `/stream` path.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    // --- Connection -----------------------------------------------------------

    /// Base reconnect delay; doubles per consecutive failure up to 300 s.
    #[serde(default = "default_reconnect_interval_secs")]
    pub reconnect_interval_secs: u64,

    /// Consecutive failed connections tolerated before giving up.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Keep-alive ping interval.
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,

    // --- Storage --------------------------------------------------------------

    #[serde(default)]
    pub output_format: OutputFormat,

    /// Directory for candle files and `app.log`.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    // --- Operations -----------------------------------------------------------

    /// DEBUG, INFO, WARNING or ERROR.  `RUST_LOG` takes precedence.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Ledger size above which the status loop warns.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    #[serde(default = "default_status_interval_secs")]
    pub status_interval_secs: u64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            symbol: default_symbol(),
            base_url: default_base_url(),
            reconnect_interval_secs: default_reconnect_interval_secs(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            ping_interval_secs: default_ping_interval_secs(),
            output_format: OutputFormat::default(),
            data_dir: default_data_dir(),
            log_level: default_log_level(),
            buffer_size: default_buffer_size(),
            status_interval_secs: default_status_interval_secs(),
        }
    }
}

/// Parse `raw` for `key`.  Failures are recorded as `KEY=value` in `ignored`
/// and yield `None`.
fn parse_env<T: FromStr>(key: &str, raw: &str, ignored: &mut Vec<String>) -> Option<T> {
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            ignored.push(format!("{key}={raw}"));
            None
        }
    }
}

impl CollectorConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))
    }

    /// Resolve the effective configuration: optional file, then process
    /// environment.
    ///
    /// Runs before logging is installed, so ignored overrides are handed back
    /// for the caller to report.
    pub fn resolve(path: Option<&Path>) -> Result<(Self, Vec<String>)> {
        let mut config = match path {
            Some(p) => Self::load(p)?,
            None => Self::default(),
        };
        let ignored = config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok((config, ignored))
    }

    /// Override fields from environment variables looked up through `lookup`.
    /// Returns the overrides that failed to parse and were left at their
    /// previous value.
    pub fn apply_env<F>(&mut self, lookup: F) -> Vec<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut ignored = Vec::new();
        if let Some(v) = lookup("BINANCE_SYMBOL") {
            self.symbol = v.trim().to_uppercase();
        }
        if let Some(v) = lookup("BINANCE_WS_URL") {
            self.base_url = v.trim().to_string();
        }
        if let Some(v) = lookup("RECONNECT_INTERVAL")
            .and_then(|v| parse_env("RECONNECT_INTERVAL", &v, &mut ignored))
        {
            self.reconnect_interval_secs = v;
        }
        if let Some(v) = lookup("MAX_RECONNECT_ATTEMPTS")
            .and_then(|v| parse_env("MAX_RECONNECT_ATTEMPTS", &v, &mut ignored))
        {
            self.max_reconnect_attempts = v;
        }
        if let Some(v) = lookup("PING_INTERVAL")
            .and_then(|v| parse_env("PING_INTERVAL", &v, &mut ignored))
        {
            self.ping_interval_secs = v;
        }
        if let Some(v) = lookup("OUTPUT_FORMAT")
            .and_then(|v| parse_env("OUTPUT_FORMAT", &v, &mut ignored))
        {
            self.output_format = v;
        }
        if let Some(v) = lookup("DATA_DIR") {
            self.data_dir = PathBuf::from(v.trim());
        }
        if let Some(v) = lookup("LOG_LEVEL") {
            self.log_level = v.trim().to_string();
        }
        if let Some(v) = lookup("BUFFER_SIZE")
            .and_then(|v| parse_env("BUFFER_SIZE", &v, &mut ignored))
        {
            self.buffer_size = v;
        }
        if let Some(v) = lookup("STATUS_INTERVAL")
            .and_then(|v| parse_env("STATUS_INTERVAL", &v, &mut ignored))
        {
            self.status_interval_secs = v;
        }
        ignored
    }

    pub fn validate(&self) -> Result<()> {
        if self.symbol.trim().is_empty() {
            anyhow::bail!("symbol must not be empty");
        }
        if !self.base_url.starts_with("ws://") && !self.base_url.starts_with("wss://") {
            anyhow::bail!("base_url must be a ws:// or wss:// URL, got {}", self.base_url);
        }
        if self.reconnect_interval_secs == 0 {
            anyhow::bail!("reconnect_interval_secs must be positive");
        }
        if self.ping_interval_secs == 0 {
            anyhow::bail!("ping_interval_secs must be positive");
        }
        if self.status_interval_secs == 0 {
            anyhow::bail!("status_interval_secs must be positive");
        }
        Ok(())
    }

    /// `tracing` filter directive equivalent to `log_level`.
    pub fn log_directive(&self) -> &'static str {
        match self.log_level.trim().to_uppercase().as_str() {
            "TRACE" => "trace",
            "DEBUG" => "debug",
            "WARN" | "WARNING" => "warn",
            "ERROR" | "CRITICAL" => "error",
            _ => "info",
        }
    }
}
