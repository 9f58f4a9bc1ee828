// =============================================================================
// Trade Ledger — Time-bounded buffer of trade prints with per-second tallies
// =============================================================================
//
// The ledger keeps every trade seen within the retention horizon and a count
// of buyer- vs seller-initiated prints for every second that had at least one
// trade.  It is not internally synchronised: the owner serialises access.
//
// Tally reads never create entries.  A second with no recorded trade is simply
// absent from the map and reads as zero on both sides.
// =============================================================================

use std::collections::{BTreeMap, VecDeque};

use crate::types::TradeEvent;

/// Buyer/seller initiated trade counts for one second.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SecondTally {
    pub buyer_initiated: u32,
    pub seller_initiated: u32,
}

/// Append-only trade buffer plus per-second tallies.
#[derive(Debug, Default)]
pub struct TradeLedger {
    trades: VecDeque<TradeEvent>,
    tallies: BTreeMap<i64, SecondTally>,
}

impl TradeLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a trade and bump the tally for its second.
    ///
    /// Ordering and `trade_id` uniqueness are not checked.
    pub fn record(&mut self, event: TradeEvent) {
        let tally = self.tallies.entry(event.second()).or_default();
        if event.is_sell_pressure {
            tally.seller_initiated += 1;
        } else {
            tally.buyer_initiated += 1;
        }
        self.trades.push_back(event);
    }

    /// All buffered trades with `open_ms <= timestamp <= close_ms`.
    pub fn trades_in_range(
        &self,
        open_ms: i64,
        close_ms: i64,
    ) -> impl Iterator<Item = &TradeEvent> + '_ {
        self.trades
            .iter()
            .filter(move |t| t.timestamp >= open_ms && t.timestamp <= close_ms)
    }

    /// Highest buyer and seller tallies over `[open_sec, close_sec]`.
    ///
    /// The two maxima are taken independently and may come from different
    /// seconds.  Returns `(0, 0)` for an empty or inverted range.
    pub fn max_tallies_in_range(&self, open_sec: i64, close_sec: i64) -> (u32, u32) {
        if open_sec > close_sec {
            return (0, 0);
        }
        self.tallies
            .range(open_sec..=close_sec)
            .fold((0, 0), |(buyers, sellers), (_, tally)| {
                (
                    buyers.max(tally.buyer_initiated),
                    sellers.max(tally.seller_initiated),
                )
            })
    }

    /// Tally for a single second; absent seconds read as zero.
    #[cfg(test)]
    pub fn tally_at(&self, second: i64) -> SecondTally {
        self.tallies.get(&second).copied().unwrap_or_default()
    }

    /// Drop trades with `timestamp <= cutoff_ms` and tallies for seconds
    /// before `floor(cutoff_ms / 1000)`.
    pub fn evict_before(&mut self, cutoff_ms: i64) {
        self.trades.retain(|t| t.timestamp > cutoff_ms);

        let cutoff_sec = cutoff_ms.div_euclid(1000);
        self.tallies = self.tallies.split_off(&cutoff_sec);
    }

    pub fn len(&self) -> usize {
        self.trades.len()
    }

    /// Number of seconds currently holding a tally.
    pub fn tally_len(&self) -> usize {
        self.tallies.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn trade(timestamp: i64, is_sell_pressure: bool, trade_id: u64) -> TradeEvent {
        TradeEvent {
            timestamp,
            price: 2000.0,
            quantity: 0.5,
            is_sell_pressure,
            trade_id,
        }
    }

    #[test]
    fn range_is_inclusive_on_both_ends() {
        let mut ledger = TradeLedger::new();
        ledger.record(trade(999, false, 1));
        ledger.record(trade(1_000, false, 2));
        ledger.record(trade(1_500, true, 3));
        ledger.record(trade(2_000, true, 4));
        ledger.record(trade(2_001, false, 5));

        let ids: Vec<u64> = ledger.trades_in_range(1_000, 2_000).map(|t| t.trade_id).collect();
        assert_eq!(ids, vec![2, 3, 4]);
    }

    #[test]
    fn empty_range_yields_nothing() {
        let mut ledger = TradeLedger::new();
        ledger.record(trade(10_000, false, 1));
        assert_eq!(ledger.trades_in_range(0, 9_999).count(), 0);
        assert_eq!(TradeLedger::new().trades_in_range(0, 60_000).count(), 0);
    }

    #[test]
    fn out_of_order_trades_are_still_found() {
        let mut ledger = TradeLedger::new();
        ledger.record(trade(5_000, false, 1));
        ledger.record(trade(1_000, true, 2));
        let ids: Vec<u64> = ledger.trades_in_range(0, 2_000).map(|t| t.trade_id).collect();
        assert_eq!(ids, vec![2]);
    }

    #[test]
    fn tally_counts_exact_per_side() {
        let mut ledger = TradeLedger::new();
        for i in 0..7 {
            ledger.record(trade(4_000 + i * 100, false, i as u64));
        }
        for i in 0..3 {
            ledger.record(trade(4_050 + i * 100, true, 100 + i as u64));
        }

        assert_eq!(ledger.max_tallies_in_range(4, 4), (7, 3));
        assert_eq!(
            ledger.tally_at(4),
            SecondTally {
                buyer_initiated: 7,
                seller_initiated: 3
            }
        );
    }

    #[test]
    fn maxima_are_taken_independently() {
        let mut ledger = TradeLedger::new();
        // Second 1: 3 buyers, 0 sellers.  Second 2: 1 buyer, 4 sellers.
        for i in 0..3 {
            ledger.record(trade(1_000 + i, false, i as u64));
        }
        ledger.record(trade(2_000, false, 10));
        for i in 0..4 {
            ledger.record(trade(2_100 + i, true, 20 + i as u64));
        }

        assert_eq!(ledger.max_tallies_in_range(0, 5), (3, 4));
        assert_eq!(ledger.max_tallies_in_range(2, 2), (1, 4));
        assert_eq!(ledger.max_tallies_in_range(3, 2), (0, 0));
    }

    #[test]
    fn tally_reads_do_not_create_entries() {
        let mut ledger = TradeLedger::new();
        ledger.record(trade(1_000, false, 1));
        assert_eq!(ledger.tally_len(), 1);

        assert_eq!(ledger.max_tallies_in_range(0, 10_000), (1, 0));
        assert_eq!(ledger.tally_at(42), SecondTally::default());
        assert_eq!(ledger.tally_len(), 1);
    }

    #[test]
    fn eviction_uses_one_cutoff_for_trades_and_tallies() {
        let mut ledger = TradeLedger::new();
        ledger.record(trade(1_000, false, 1));
        ledger.record(trade(2_500, true, 2));
        ledger.record(trade(3_000, false, 3));
        ledger.record(trade(3_001, true, 4));

        ledger.evict_before(3_000);

        let ids: Vec<u64> = ledger.trades_in_range(i64::MIN, i64::MAX).map(|t| t.trade_id).collect();
        assert_eq!(ids, vec![4]);
        assert!(ledger.trades_in_range(0, 3_000).all(|t| t.timestamp > 3_000));

        // Seconds < 3 are gone; second 3 survives.
        assert_eq!(ledger.max_tallies_in_range(0, 2), (0, 0));
        assert_eq!(ledger.tally_at(3), SecondTally { buyer_initiated: 1, seller_initiated: 1 });
        assert_eq!(ledger.tally_len(), 1);
    }

    #[test]
    fn negative_cutoff_keeps_everything() {
        let mut ledger = TradeLedger::new();
        ledger.record(trade(0, false, 1));
        ledger.record(trade(59_999, true, 2));
        ledger.evict_before(-1);
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.tally_len(), 2);
    }
}
