// =============================================================================
// Collector — Routes stream events into the aggregator and out to the sink
// =============================================================================
//
// The collector is shared between the stream task and the status task via
// `Arc<Collector>`.  The aggregator sits behind a single mutex whose guard is
// held for exactly one `record_trade` or one `on_bucket_close` call, so every
// candle close reads and evicts the ledger as one step.
//
// Finished candles are pushed onto an unbounded channel and written by
// `run_sink_writer` on the blocking pool; ingestion never waits on disk.
// =============================================================================

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::market_data::{CandleAggregator, StreamEvent};
use crate::storage::CandleSink;
use crate::types::CandleRecord;

// =============================================================================
// Stats
// =============================================================================

/// Lock-free counters describing collector activity.
#[derive(Debug, Default)]
pub struct CollectorStats {
    trades_recorded: AtomicU64,
    messages_rejected: AtomicU64,
    candles_emitted: AtomicU64,
    candles_persisted: AtomicU64,
    persist_failures: AtomicU64,
    connections: AtomicU64,
    last_candle_ts: AtomicI64,
}

/// Point-in-time copy of [`CollectorStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub trades_recorded: u64,
    pub messages_rejected: u64,
    pub candles_emitted: u64,
    pub candles_persisted: u64,
    pub persist_failures: u64,
    pub connections: u64,
    /// Open time of the most recent candle, 0 before the first one.
    pub last_candle_ts: i64,
}

impl CollectorStats {
    pub fn record_rejected(&self) {
        self.messages_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connect(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_persisted(&self) {
        self.candles_persisted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_persist_failure(&self) {
        self.persist_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            trades_recorded: self.trades_recorded.load(Ordering::Relaxed),
            messages_rejected: self.messages_rejected.load(Ordering::Relaxed),
            candles_emitted: self.candles_emitted.load(Ordering::Relaxed),
            candles_persisted: self.candles_persisted.load(Ordering::Relaxed),
            persist_failures: self.persist_failures.load(Ordering::Relaxed),
            connections: self.connections.load(Ordering::Relaxed),
            last_candle_ts: self.last_candle_ts.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Collector
// =============================================================================

pub struct Collector {
    symbol: String,
    aggregator: Mutex<CandleAggregator>,
    stats: Arc<CollectorStats>,
    candles_tx: mpsc::UnboundedSender<CandleRecord>,
}

impl Collector {
    /// Create a collector for `symbol` plus the receiving end of its candle
    /// channel (hand it to [`run_sink_writer`]).
    pub fn new(
        symbol: impl Into<String>,
        aggregator: CandleAggregator,
    ) -> (Self, mpsc::UnboundedReceiver<CandleRecord>) {
        let (candles_tx, candles_rx) = mpsc::unbounded_channel();
        let collector = Self {
            symbol: symbol.into(),
            aggregator: Mutex::new(aggregator),
            stats: Arc::new(CollectorStats::default()),
            candles_tx,
        };
        (collector, candles_rx)
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn stats(&self) -> &CollectorStats {
        &self.stats
    }

    /// Shared handle to the stats, usable after the collector is dropped.
    pub fn stats_handle(&self) -> Arc<CollectorStats> {
        self.stats.clone()
    }

    /// Number of trades currently buffered in the ledger.
    pub fn buffered_trades(&self) -> usize {
        self.aggregator.lock().ledger().len()
    }

    /// Dispatch one decoded stream event.
    pub fn handle_event(&self, event: StreamEvent) {
        match event {
            StreamEvent::Trade(trade) => {
                self.aggregator.lock().record_trade(trade);
                self.stats.trades_recorded.fetch_add(1, Ordering::Relaxed);
            }
            StreamEvent::Kline(summary) => {
                let candle = self.aggregator.lock().on_bucket_close(&summary);
                if let Some(candle) = candle {
                    self.emit(candle);
                }
            }
        }
    }

    fn emit(&self, candle: CandleRecord) {
        self.stats.candles_emitted.fetch_add(1, Ordering::Relaxed);
        self.stats
            .last_candle_ts
            .store(candle.timestamp, Ordering::Relaxed);

        info!(
            symbol = %self.symbol,
            datetime = %candle.datetime(),
            open = candle.open,
            high = candle.high,
            low = candle.low,
            close = candle.close,
            buyers = candle.buyer_count,
            sellers = candle.seller_count,
            buy_volume = %format!("{:.4}", candle.buyer_volume),
            sell_volume = %format!("{:.4}", candle.seller_volume),
            power = candle.power_position,
            "candle closed"
        );

        if self.candles_tx.send(candle).is_err() {
            self.stats.record_persist_failure();
            error!("sink writer is gone, candle dropped");
        }
    }
}

// =============================================================================
// Background tasks
// =============================================================================

/// Drain the candle channel into `sink` until the collector is dropped.
///
/// Each write runs on the blocking pool.  A failed write is logged and counted;
/// the candle is not retried.
pub async fn run_sink_writer(
    mut candles_rx: mpsc::UnboundedReceiver<CandleRecord>,
    sink: Arc<dyn CandleSink>,
    stats: Arc<CollectorStats>,
) {
    while let Some(candle) = candles_rx.recv().await {
        let timestamp = candle.timestamp;
        let writer = sink.clone();
        let result = tokio::task::spawn_blocking(move || writer.persist(&candle)).await;

        match result {
            Ok(Ok(())) => stats.record_persisted(),
            Ok(Err(e)) => {
                stats.record_persist_failure();
                error!(timestamp, format = %sink.format(), error = %e, "failed to persist candle");
            }
            Err(e) => {
                stats.record_persist_failure();
                error!(timestamp, error = %e, "sink task panicked");
            }
        }
    }
    info!("sink writer stopped");
}

/// Periodically log collector stats and warn when the ledger grows past
/// `buffer_size`.
pub async fn run_status_loop(
    collector: Arc<Collector>,
    interval: Duration,
    buffer_size: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => return,
        }

        let buffered = collector.buffered_trades();
        let stats = collector.stats().snapshot();
        info!(
            symbol = %collector.symbol(),
            buffered,
            trades = stats.trades_recorded,
            rejected = stats.messages_rejected,
            candles = stats.candles_emitted,
            persisted = stats.candles_persisted,
            failures = stats.persist_failures,
            "collector status"
        );
        if buffered > buffer_size {
            warn!(buffered, limit = buffer_size, "trade ledger above configured buffer size");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::BucketSummary;
    use crate::types::{OutputFormat, TradeEvent};

    struct MemorySink {
        written: Mutex<Vec<CandleRecord>>,
        fail: bool,
    }

    impl CandleSink for MemorySink {
        fn format(&self) -> OutputFormat {
            OutputFormat::Json
        }

        fn persist(&self, candle: &CandleRecord) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("disk full");
            }
            self.written.lock().push(candle.clone());
            Ok(())
        }
    }

    fn trade(timestamp: i64, is_sell_pressure: bool) -> StreamEvent {
        StreamEvent::Trade(TradeEvent {
            timestamp,
            price: 100.0,
            quantity: 1.0,
            is_sell_pressure,
            trade_id: timestamp as u64,
        })
    }

    fn kline(open_time: i64, is_closed: bool) -> StreamEvent {
        StreamEvent::Kline(BucketSummary {
            open_time,
            close_time: open_time + 59_999,
            is_closed,
            open: 100.0,
            high: 101.0,
            low: 99.0,
            close: 100.5,
            volume: 3.0,
        })
    }

    #[test]
    fn closed_kline_emits_candle_on_channel() {
        let (collector, mut rx) = Collector::new("ETHUSDT", CandleAggregator::default());
        collector.handle_event(trade(1_000, false));
        collector.handle_event(trade(2_000, true));
        collector.handle_event(trade(3_000, false));
        collector.handle_event(kline(0, false));
        assert!(rx.try_recv().is_err());

        collector.handle_event(kline(0, true));
        let candle = rx.try_recv().expect("candle emitted");
        assert_eq!(candle.buyer_count, 2);
        assert_eq!(candle.seller_count, 1);

        let stats = collector.stats().snapshot();
        assert_eq!(stats.trades_recorded, 3);
        assert_eq!(stats.candles_emitted, 1);
        assert_eq!(stats.last_candle_ts, 0);
    }

    #[tokio::test]
    async fn sink_writer_drains_queue_then_stops() {
        let (collector, rx) = Collector::new("ETHUSDT", CandleAggregator::default());
        let sink = Arc::new(MemorySink {
            written: Mutex::new(Vec::new()),
            fail: false,
        });

        collector.handle_event(kline(0, true));
        collector.handle_event(kline(60_000, true));
        let stats = collector.stats_handle();
        drop(collector);

        run_sink_writer(rx, sink.clone(), stats.clone()).await;

        let written = sink.written.lock();
        assert_eq!(written.len(), 2);
        assert_eq!(written[1].timestamp, 60_000);
        assert_eq!(stats.snapshot().candles_persisted, 2);
    }

    #[tokio::test]
    async fn failed_persist_does_not_stop_the_writer() {
        let (collector, rx) = Collector::new("ETHUSDT", CandleAggregator::default());
        let collector = Arc::new(collector);
        let sink = Arc::new(MemorySink {
            written: Mutex::new(Vec::new()),
            fail: true,
        });

        let writer = tokio::spawn(run_sink_writer(rx, sink, collector.stats_handle()));
        collector.handle_event(kline(0, true));
        collector.handle_event(kline(60_000, true));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stats = collector.stats().snapshot();
        assert_eq!(stats.persist_failures, 2);
        assert_eq!(stats.candles_persisted, 0);
        assert!(!writer.is_finished());
        writer.abort();
    }
}
