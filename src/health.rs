// =============================================================================
// Health Check — Inspects the data directory of a running collector
// =============================================================================
//
// Invoked as `candle-collector health [DATA_DIR]`.  Looks only at the data
// directory (candle files, `app.log`, free space on its filesystem), so it
// works against a collector running in another process.  Exit status is 0
// when every check passes and 1 otherwise.
// =============================================================================

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;

use crate::logging::LOG_FILE_NAME;
use crate::storage::DATA_FILE_PREFIX;

/// Outcome of one named check.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub name: &'static str,
    pub healthy: bool,
    pub message: String,
}

impl HealthCheck {
    fn pass(name: &'static str, message: impl Into<String>) -> Self {
        Self {
            name,
            healthy: true,
            message: message.into(),
        }
    }

    fn fail(name: &'static str, message: impl Into<String>) -> Self {
        Self {
            name,
            healthy: false,
            message: message.into(),
        }
    }
}

/// Totals across every candle file in the data directory.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DataStats {
    pub files: usize,
    pub total_records: u64,
    /// Newest candle open time seen in any file.
    pub latest_timestamp: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub checks: Vec<HealthCheck>,
    pub stats: DataStats,
}

impl HealthReport {
    /// Human-readable summary for the terminal.
    pub fn render(&self) -> String {
        let mut out = String::from("Candle Collector Health Check\n");
        out.push_str(&"=".repeat(50));
        out.push('\n');
        for check in &self.checks {
            let status = if check.healthy { "HEALTHY" } else { "UNHEALTHY" };
            out.push_str(&format!("{:<15}: {status} - {}\n", check.name, check.message));
        }
        out.push_str("\nData Statistics:\n");
        match self.stats.latest_timestamp.and_then(DateTime::<Utc>::from_timestamp_millis) {
            Some(latest) => out.push_str(&format!(
                "   Files: {}, total records: {}, latest: {}\n",
                self.stats.files,
                self.stats.total_records,
                latest.to_rfc3339()
            )),
            None => out.push_str("   No valid data found\n"),
        }
        out.push_str(&"=".repeat(50));
        out.push('\n');
        let overall = if self.healthy { "SYSTEM HEALTHY" } else { "ISSUES DETECTED" };
        out.push_str(&format!("Overall Status: {overall}\n"));
        out
    }
}

// ---------------------------------------------------------------------------
// Data files
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DataFileKind {
    Csv,
    Jsonl,
    Sqlite,
}

#[derive(Debug, Clone)]
struct DataFile {
    path: PathBuf,
    kind: DataFileKind,
    modified: SystemTime,
}

/// Every `binance_data*` file in `data_dir`, newest first.
fn list_data_files(data_dir: &Path) -> Vec<DataFile> {
    let mut files: Vec<DataFile> = Vec::new();
    let Ok(entries) = fs::read_dir(data_dir) else {
        return files;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.starts_with(DATA_FILE_PREFIX) {
            continue;
        }
        let kind = match path.extension().and_then(|e| e.to_str()) {
            Some("csv") => DataFileKind::Csv,
            Some("jsonl") => DataFileKind::Jsonl,
            Some("db") => DataFileKind::Sqlite,
            _ => continue,
        };
        let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
            continue;
        };
        files.push(DataFile {
            path,
            kind,
            modified,
        });
    }
    files.sort_by(|a, b| b.modified.cmp(&a.modified));
    files
}

/// Record count and newest timestamp in one file.
fn scan_file(file: &DataFile) -> Result<(u64, Option<i64>)> {
    match file.kind {
        DataFileKind::Csv => {
            let mut reader = csv::Reader::from_path(&file.path)
                .with_context(|| format!("failed to open {}", file.path.display()))?;
            let mut count = 0u64;
            let mut latest: Option<i64> = None;
            for record in reader.records() {
                let record = record.context("malformed CSV row")?;
                count += 1;
                if let Some(ts) = record.get(0).and_then(|v| v.parse::<i64>().ok()) {
                    latest = Some(latest.map_or(ts, |l| l.max(ts)));
                }
            }
            Ok((count, latest))
        }
        DataFileKind::Jsonl => {
            let content = fs::read_to_string(&file.path)
                .with_context(|| format!("failed to read {}", file.path.display()))?;
            let mut count = 0u64;
            let mut latest: Option<i64> = None;
            for line in content.lines().filter(|l| !l.trim().is_empty()) {
                let value: serde_json::Value =
                    serde_json::from_str(line).context("malformed JSON line")?;
                count += 1;
                if let Some(ts) = value["timestamp"].as_i64() {
                    latest = Some(latest.map_or(ts, |l| l.max(ts)));
                }
            }
            Ok((count, latest))
        }
        DataFileKind::Sqlite => {
            let conn = Connection::open_with_flags(&file.path, OpenFlags::SQLITE_OPEN_READ_ONLY)
                .with_context(|| format!("failed to open {}", file.path.display()))?;
            let (count, latest): (i64, Option<i64>) = conn
                .query_row("SELECT COUNT(*), MAX(timestamp) FROM candles", [], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })
                .context("failed to query candles table")?;
            Ok((count.max(0) as u64, latest))
        }
    }
}

fn age_of(modified: SystemTime, now: DateTime<Utc>) -> Duration {
    let modified: DateTime<Utc> = modified.into();
    now.signed_duration_since(modified)
}

fn describe(age: Duration) -> String {
    let secs = age.num_seconds().max(0);
    format!("{}m{:02}s", secs / 60, secs % 60)
}

const BYTES_PER_GB: u64 = 1024 * 1024 * 1024;

/// Bytes available to unprivileged writers on the filesystem holding `path`.
#[cfg(unix)]
#[allow(clippy::unnecessary_cast)]
fn available_bytes(path: &Path) -> Result<Option<u64>> {
    use std::os::unix::ffi::OsStrExt;

    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .with_context(|| format!("path contains a NUL byte: {}", path.display()))?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("statvfs failed for {}", path.display()));
    }
    Ok(Some((stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64)))
}

#[cfg(not(unix))]
fn available_bytes(_path: &Path) -> Result<Option<u64>> {
    Ok(None)
}

// ---------------------------------------------------------------------------
// Checks
// ---------------------------------------------------------------------------

/// At least `min_free_gb` whole gigabytes must be free where `data_dir` lives.
pub fn check_disk_space(data_dir: &Path, min_free_gb: u64) -> HealthCheck {
    const NAME: &str = "Disk Space";

    match available_bytes(data_dir) {
        Ok(Some(bytes)) => disk_space_verdict(bytes, min_free_gb),
        Ok(None) => HealthCheck::pass(NAME, "Free space check not supported on this platform"),
        Err(e) => HealthCheck::fail(NAME, format!("Error checking disk space: {e:#}")),
    }
}

fn disk_space_verdict(available_bytes: u64, min_free_gb: u64) -> HealthCheck {
    const NAME: &str = "Disk Space";

    let available_gb = available_bytes / BYTES_PER_GB;
    if available_gb < min_free_gb {
        HealthCheck::fail(NAME, format!("Only {available_gb}GB free space remaining"))
    } else {
        HealthCheck::pass(NAME, format!("{available_gb}GB free space available"))
    }
}

/// The newest candle file must have been written, and must contain a candle,
/// within `max_age` of `now`.
pub fn check_data_freshness(data_dir: &Path, max_age: Duration, now: DateTime<Utc>) -> HealthCheck {
    const NAME: &str = "Data Freshness";

    let files = list_data_files(data_dir);
    let Some(latest) = files.first() else {
        return HealthCheck::fail(NAME, "No data files found");
    };

    let file_age = age_of(latest.modified, now);
    if file_age > max_age {
        return HealthCheck::fail(NAME, format!("Latest file is {} old", describe(file_age)));
    }

    match scan_file(latest) {
        Ok((_, Some(ts))) => {
            let Some(last) = DateTime::<Utc>::from_timestamp_millis(ts) else {
                return HealthCheck::fail(NAME, format!("Invalid timestamp {ts}"));
            };
            let data_age = now.signed_duration_since(last);
            if data_age > max_age {
                HealthCheck::fail(NAME, format!("Last data entry is {} old", describe(data_age)))
            } else {
                HealthCheck::pass(NAME, format!("Data is fresh (last entry {} ago)", describe(data_age)))
            }
        }
        Ok((_, None)) => HealthCheck::fail(NAME, "No data in file"),
        Err(e) => HealthCheck::fail(NAME, format!("Error reading data file: {e:#}")),
    }
}

/// Scan `app.log` for ERROR / WARN lines stamped within `window` of `now`.
pub fn check_recent_errors(data_dir: &Path, window: Duration, now: DateTime<Utc>) -> HealthCheck {
    const NAME: &str = "Recent Errors";

    let path = data_dir.join(LOG_FILE_NAME);
    let content = match fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) => return HealthCheck::fail(NAME, format!("Cannot read {}: {e}", path.display())),
    };

    let since = now - window;
    let (mut errors, mut warnings) = (0usize, 0usize);
    for line in content.lines() {
        let Some(stamp) = line.split_whitespace().next() else {
            continue;
        };
        let Ok(at) = DateTime::parse_from_rfc3339(stamp) else {
            continue;
        };
        if at.with_timezone(&Utc) < since {
            continue;
        }
        if line.contains(" ERROR ") {
            errors += 1;
        } else if line.contains(" WARN ") {
            warnings += 1;
        }
    }

    let hours = window.num_hours().max(1);
    if errors > 0 {
        HealthCheck::fail(NAME, format!("{errors} errors found in last {hours}h"))
    } else if warnings > 0 {
        HealthCheck::pass(NAME, format!("{warnings} warnings found in last {hours}h"))
    } else {
        HealthCheck::pass(NAME, format!("No errors in last {hours}h"))
    }
}

/// Count records across every candle file.  Unreadable files are skipped.
pub fn data_stats(data_dir: &Path) -> DataStats {
    let mut stats = DataStats::default();
    for file in list_data_files(data_dir) {
        let Ok((count, latest)) = scan_file(&file) else {
            continue;
        };
        stats.files += 1;
        stats.total_records += count;
        if let Some(ts) = latest {
            stats.latest_timestamp = Some(stats.latest_timestamp.map_or(ts, |l| l.max(ts)));
        }
    }
    stats
}

/// Free space below this many gigabytes marks the host unhealthy.
pub const MIN_FREE_GB: u64 = 1;

pub fn run_health_check(data_dir: &Path, max_age: Duration) -> HealthReport {
    let now = Utc::now();
    let checks = vec![
        check_data_freshness(data_dir, max_age, now),
        check_disk_space(data_dir, MIN_FREE_GB),
        check_recent_errors(data_dir, Duration::hours(1), now),
    ];
    HealthReport {
        healthy: checks.iter().all(|c| c.healthy),
        checks,
        stats: data_stats(data_dir),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
