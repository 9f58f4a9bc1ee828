// =============================================================================
// Candle Aggregator — Turns closed kline buckets into enriched candles
// =============================================================================
//
// On every closed bucket the aggregator reads the matching trades from its
// ledger, derives buyer/seller statistics, and then trims the ledger to the
// retention horizon.  Read and eviction happen inside one `&mut self` call so
// a caller holding the aggregator's lock sees them as one step.
//
// A bucket with no matching trades still produces a candle; its trade-side
// fields are all zero.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::trade_ledger::TradeLedger;
use crate::types::{power_position, CandleRecord, TradeEvent};

/// Duration of one kline bucket.
pub const BUCKET_DURATION_MS: i64 = 60_000;
/// Retention horizon expressed in buckets.
pub const RETENTION_BUCKETS: i64 = 2;

/// Upstream kline summary for one bucket (official OHLCV).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketSummary {
    pub open_time: i64,
    pub close_time: i64,
    pub is_closed: bool,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Per-side counts and volumes over one bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct SideTotals {
    buyer_count: u64,
    seller_count: u64,
    buyer_volume: f64,
    seller_volume: f64,
}

impl SideTotals {
    fn add(mut self, trade: &TradeEvent) -> Self {
        if trade.is_sell_pressure {
            self.seller_count += 1;
            self.seller_volume += trade.quantity;
        } else {
            self.buyer_count += 1;
            self.buyer_volume += trade.quantity;
        }
        self
    }
}

/// Owns the trade ledger and derives one candle per closed bucket.
#[derive(Debug)]
pub struct CandleAggregator {
    ledger: TradeLedger,
    retention_ms: i64,
}

impl Default for CandleAggregator {
    fn default() -> Self {
        Self::new(BUCKET_DURATION_MS)
    }
}

impl CandleAggregator {
    /// Aggregator for buckets of `bucket_ms`, retaining two buckets of trades.
    pub fn new(bucket_ms: i64) -> Self {
        Self {
            ledger: TradeLedger::new(),
            retention_ms: bucket_ms.saturating_mul(RETENTION_BUCKETS),
        }
    }

    pub fn retention_ms(&self) -> i64 {
        self.retention_ms
    }

    pub fn ledger(&self) -> &TradeLedger {
        &self.ledger
    }

    /// Feed one trade into the ledger.
    pub fn record_trade(&mut self, trade: TradeEvent) {
        self.ledger.record(trade);
    }

    /// Build the candle for a closed bucket and trim the ledger.
    ///
    /// In-progress buckets return `None` and leave the ledger untouched.
    pub fn on_bucket_close(&mut self, summary: &BucketSummary) -> Option<CandleRecord> {
        if !summary.is_closed {
            return None;
        }

        let totals = self
            .ledger
            .trades_in_range(summary.open_time, summary.close_time)
            .fold(SideTotals::default(), SideTotals::add);

        if totals.buyer_count + totals.seller_count == 0 {
            warn!(open_time = summary.open_time, "no trades found for candle");
        }

        let (max_buyers, max_sellers) = self.ledger.max_tallies_in_range(
            summary.open_time.div_euclid(1000),
            summary.close_time.div_euclid(1000),
        );

        let candle = CandleRecord {
            timestamp: summary.open_time,
            open: summary.open,
            high: summary.high,
            low: summary.low,
            close: summary.close,
            volume: summary.volume,
            buyer_count: totals.buyer_count,
            seller_count: totals.seller_count,
            buyer_volume: totals.buyer_volume,
            seller_volume: totals.seller_volume,
            power_position: power_position(totals.buyer_count, totals.seller_count),
            max_buyers_per_second: max_buyers,
            max_sellers_per_second: max_sellers,
        };

        let cutoff_ms = summary.close_time.saturating_sub(self.retention_ms);
        self.ledger.evict_before(cutoff_ms);
        debug!(
            cutoff_ms,
            buffered = self.ledger.len(),
            tallies = self.ledger.tally_len(),
            "ledger trimmed after candle close"
        );

        Some(candle)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn trade(timestamp: i64, is_sell_pressure: bool, quantity: f64) -> TradeEvent {
        TradeEvent {
            timestamp,
            price: 3000.0,
            quantity,
            is_sell_pressure,
            trade_id: timestamp as u64,
        }
    }

    fn bucket(open_time: i64, close_time: i64, is_closed: bool) -> BucketSummary {
        BucketSummary {
            open_time,
            close_time,
            is_closed,
            open: 3000.0,
            high: 3010.5,
            low: 2995.25,
            close: 3005.0,
            volume: 42.125,
        }
    }

    #[test]
    fn three_trade_bucket_scenario() {
        let mut agg = CandleAggregator::default();
        agg.record_trade(trade(1_000, false, 1.0));
        agg.record_trade(trade(1_500, true, 2.0));
        agg.record_trade(trade(2_999, false, 0.5));

        let candle = agg.on_bucket_close(&bucket(0, 3_000, true)).expect("closed bucket");
        assert_eq!(candle.timestamp, 0);
        assert_eq!(candle.buyer_count, 2);
        assert_eq!(candle.seller_count, 1);
        assert_eq!(candle.power_position, 1);
        assert_eq!(candle.max_buyers_per_second, 1);
        assert_eq!(candle.max_sellers_per_second, 1);
        assert!((candle.buyer_volume - 1.5).abs() < 1e-12);
        assert!((candle.seller_volume - 2.0).abs() < 1e-12);
    }

    #[test]
    fn ohlcv_is_copied_verbatim() {
        let mut agg = CandleAggregator::default();
        let summary = bucket(60_000, 119_999, true);
        let candle = agg.on_bucket_close(&summary).unwrap();
        assert_eq!(candle.open, summary.open);
        assert_eq!(candle.high, summary.high);
        assert_eq!(candle.low, summary.low);
        assert_eq!(candle.close, summary.close);
        assert_eq!(candle.volume, summary.volume);
    }

    #[test]
    fn empty_bucket_still_emits_zeroed_candle() {
        let mut agg = CandleAggregator::default();
        agg.record_trade(trade(500_000, false, 1.0));

        let candle = agg.on_bucket_close(&bucket(0, 59_999, true)).unwrap();
        assert_eq!(candle.buyer_count, 0);
        assert_eq!(candle.seller_count, 0);
        assert_eq!(candle.buyer_volume, 0.0);
        assert_eq!(candle.seller_volume, 0.0);
        assert_eq!(candle.power_position, 0);
        assert_eq!(candle.max_buyers_per_second, 0);
        assert_eq!(candle.max_sellers_per_second, 0);
    }

    #[test]
    fn seller_dominated_bucket_is_negative() {
        let mut agg = CandleAggregator::default();
        agg.record_trade(trade(10_000, true, 1.0));
        agg.record_trade(trade(10_100, true, 1.0));
        agg.record_trade(trade(20_000, false, 1.0));
        let candle = agg.on_bucket_close(&bucket(0, 59_999, true)).unwrap();
        assert_eq!(candle.power_position, -1);
        assert_eq!(candle.max_sellers_per_second, 2);
        assert_eq!(candle.max_buyers_per_second, 1);
    }

    #[test]
    fn open_bucket_is_ignored_without_side_effects() {
        let mut agg = CandleAggregator::default();
        agg.record_trade(trade(1_000, false, 1.0));

        // Close time far enough ahead that a real close would evict the trade.
        assert!(agg.on_bucket_close(&bucket(600_000, 659_999, false)).is_none());
        assert_eq!(agg.ledger().len(), 1);
        assert_eq!(agg.ledger().tally_len(), 1);
    }

    #[test]
    fn trades_survive_one_bucket_then_get_evicted() {
        let mut agg = CandleAggregator::default();
        assert_eq!(agg.retention_ms(), 120_000);

        agg.record_trade(trade(0, false, 1.0));
        agg.record_trade(trade(59_999, true, 1.0));
        agg.on_bucket_close(&bucket(0, 59_999, true)).unwrap();
        assert_eq!(agg.ledger().len(), 2);

        agg.record_trade(trade(60_000, false, 1.0));
        agg.on_bucket_close(&bucket(60_000, 119_999, true)).unwrap();
        // Cutoff is -1: bucket 1 trades are still visible.
        assert_eq!(agg.ledger().trades_in_range(0, 59_999).count(), 2);

        agg.on_bucket_close(&bucket(120_000, 179_999, true)).unwrap();
        // Cutoff is 59_999: every bucket 1 trade is gone, bucket 2 remains.
        assert_eq!(agg.ledger().trades_in_range(0, 59_999).count(), 0);
        assert_eq!(agg.ledger().len(), 1);
        assert_eq!(agg.ledger().max_tallies_in_range(0, 58), (0, 0));
    }

    #[test]
    fn eviction_boundary_is_inclusive_of_cutoff() {
        let mut agg = CandleAggregator::default();
        agg.record_trade(trade(60_000, false, 1.0));
        agg.record_trade(trade(60_001, false, 1.0));

        // close - retention == 60_000, which must evict the trade at 60_000.
        agg.on_bucket_close(&bucket(120_000, 180_000, true)).unwrap();
        let left: Vec<i64> = agg.ledger().trades_in_range(0, i64::MAX).map(|t| t.timestamp).collect();
        assert_eq!(left, vec![60_001]);
    }

    #[test]
    fn extreme_close_time_saturates_cutoff() {
        let mut agg = CandleAggregator::default();
        agg.record_trade(trade(1_000, false, 1.0));

        let candle = agg
            .on_bucket_close(&bucket(i64::MIN, i64::MIN, true))
            .expect("closed bucket");
        assert_eq!(candle.buyer_count + candle.seller_count, 0);
        // Cutoff clamps to i64::MIN instead of wrapping, so nothing is evicted.
        assert_eq!(agg.ledger().len(), 1);
        assert_eq!(agg.ledger().tally_len(), 1);
    }
}
