pub mod candle_aggregator;
pub mod stream;
pub mod trade_ledger;

pub use candle_aggregator::{BucketSummary, CandleAggregator};
pub use stream::StreamEvent;
