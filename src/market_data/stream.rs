// =============================================================================
// Combined Market Stream — kline_1m + trade over one Binance WebSocket
// =============================================================================
//
// One connection carries both the `@kline_1m` and `@trade` streams for the
// collected symbol.  Messages are decoded here and handed to the collector in
// arrival order.  Reconnection with exponential backoff lives in
// `run_with_reconnect`; the collector itself never sees connection state.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use super::BucketSummary;
use crate::collector::Collector;
use crate::config::CollectorConfig;
use crate::types::TradeEvent;

/// Upper bound on the delay between reconnect attempts.
const MAX_RECONNECT_DELAY_SECS: u64 = 300;

/// A decoded message from the combined stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Trade(TradeEvent),
    Kline(BucketSummary),
}

/// How a single connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamExit {
    Shutdown,
    Ended,
}

/// Build the combined-stream URL for `symbol`.
pub fn build_stream_url(base_url: &str, symbol: &str) -> String {
    let lower = symbol.to_lowercase();
    format!(
        "{}/stream?streams={lower}@kline_1m/{lower}@trade",
        base_url.trim_end_matches('/')
    )
}

/// Delay before reconnect attempt number `attempt` (1-based).
pub fn reconnect_delay(interval_secs: u64, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(31);
    let secs = interval_secs
        .saturating_mul(1u64 << exp)
        .min(MAX_RECONNECT_DELAY_SECS);
    Duration::from_secs(secs)
}

/// Decode one combined-stream message.
///
/// Expected envelope:
/// ```json
/// { "stream": "ethusdt@trade", "data": { ... } }
/// ```
/// Messages without a `stream` key (subscription acks) and streams we did not
/// subscribe to yield `Ok(None)`.
pub fn parse_stream_message(text: &str) -> Result<Option<StreamEvent>> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse stream JSON")?;

    let Some(stream) = root.get("stream").and_then(|v| v.as_str()) else {
        return Ok(None);
    };
    let data = root.get("data").context("missing field data")?;

    if stream.ends_with("@trade") {
        parse_trade(data).map(|t| Some(StreamEvent::Trade(t)))
    } else if stream.ends_with("@kline_1m") {
        parse_kline(data).map(|k| Some(StreamEvent::Kline(k)))
    } else {
        Ok(None)
    }
}

/// Parse a Binance trade payload.
///
/// Expected shape:
/// ```json
/// { "e": "trade", "t": 12345, "p": "2000.10", "q": "0.5", "T": 1700000000123, "m": true }
/// ```
fn parse_trade(data: &serde_json::Value) -> Result<TradeEvent> {
    let timestamp = data["T"].as_i64().context("missing field T")?;
    let trade_id = data["t"].as_u64().context("missing field t")?;
    let price = parse_string_f64(&data["p"], "p")?;
    let quantity = parse_string_f64(&data["q"], "q")?;
    let is_sell_pressure = data["m"].as_bool().context("missing field m")?;

    if quantity <= 0.0 {
        anyhow::bail!("trade {trade_id} has non-positive quantity {quantity}");
    }

    Ok(TradeEvent {
        timestamp,
        price,
        quantity,
        is_sell_pressure,
        trade_id,
    })
}

/// Parse the `k` object of a Binance kline payload.
fn parse_kline(data: &serde_json::Value) -> Result<BucketSummary> {
    let k = data.get("k").context("missing field k")?;
    let open_time = k["t"].as_i64().context("missing field k.t")?;
    let close_time = k["T"].as_i64().context("missing field k.T")?;

    if close_time < open_time {
        anyhow::bail!("kline closes at {close_time} before it opens at {open_time}");
    }

    Ok(BucketSummary {
        open_time,
        close_time,
        is_closed: k["x"].as_bool().context("missing field k.x")?,
        open: parse_string_f64(&k["o"], "k.o")?,
        high: parse_string_f64(&k["h"], "k.h")?,
        low: parse_string_f64(&k["l"], "k.l")?,
        close: parse_string_f64(&k["c"], "k.c")?,
        volume: parse_string_f64(&k["v"], "k.v")?,
    })
}

/// Helper: Binance sends decimals as JSON strings.
fn parse_string_f64(val: &serde_json::Value, name: &str) -> Result<f64> {
    let parsed = match val {
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("failed to parse {name} as f64: {s}"))?,
        serde_json::Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("field {name} is not a valid f64"))?,
        serde_json::Value::Null => anyhow::bail!("missing field {name}"),
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    };
    if !parsed.is_finite() {
        anyhow::bail!("field {name} is not finite");
    }
    Ok(parsed)
}

// ---------------------------------------------------------------------------
// WebSocket loop
// ---------------------------------------------------------------------------

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Pump one established connection until it ends, errors, or shutdown is
/// requested.
async fn pump_stream(
    ws_stream: WsStream,
    ping_interval: Duration,
    collector: &Arc<Collector>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<StreamExit> {
    let (mut write, mut read) = ws_stream.split();

    let mut ping = tokio::time::interval(ping_interval);
    ping.tick().await;

    loop {
        tokio::select! {
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => match parse_stream_message(&text) {
                    Ok(Some(event)) => collector.handle_event(event),
                    Ok(None) => debug!("ignoring non-data message"),
                    Err(e) => {
                        collector.stats().record_rejected();
                        warn!(error = %e, "failed to parse stream message");
                    }
                },
                Some(Ok(Message::Close(frame))) => {
                    warn!(frame = ?frame, "market WebSocket closed by server");
                    return Ok(StreamExit::Ended);
                }
                // Pong replies to server pings are handled by tungstenite.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!(error = %e, "market WebSocket read error");
                    return Err(e.into());
                }
                None => {
                    warn!("market WebSocket stream ended");
                    return Ok(StreamExit::Ended);
                }
            },
            _ = ping.tick() => {
                write
                    .send(Message::Ping(Vec::new()))
                    .await
                    .context("failed to send ping")?;
            }
            _ = shutdown.changed() => {
                info!("closing market WebSocket");
                if let Err(e) = write.send(Message::Close(None)).await {
                    debug!(error = %e, "close frame not delivered");
                }
                return Ok(StreamExit::Shutdown);
            }
        }
    }
}

/// Keep the market stream alive, reconnecting with exponential backoff.
///
/// Returns `Ok` on shutdown and an error once `max_reconnect_attempts`
/// consecutive failures have been exhausted.  A successful connect resets the
/// failure count.
pub async fn run_with_reconnect(
    config: &CollectorConfig,
    collector: Arc<Collector>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let url = build_stream_url(&config.base_url, &config.symbol);
    let ping_interval = Duration::from_secs(config.ping_interval_secs.max(1));
    let mut attempts: u32 = 0;

    loop {
        if *shutdown.borrow() {
            return Ok(());
        }

        info!(url = %url, "connecting to market WebSocket");
        match connect_async(&url).await {
            Ok((ws_stream, _response)) => {
                info!(symbol = %config.symbol, "market WebSocket connected");
                attempts = 0;
                collector.stats().record_connect();
                match pump_stream(ws_stream, ping_interval, &collector, &mut shutdown).await {
                    Ok(StreamExit::Shutdown) => return Ok(()),
                    Ok(StreamExit::Ended) => {}
                    Err(e) => error!(error = %e, "market stream error"),
                }
            }
            Err(e) => error!(error = %e, "failed to connect to market WebSocket"),
        }

        attempts += 1;
        if attempts > config.max_reconnect_attempts {
            anyhow::bail!(
                "max reconnection attempts ({}) reached",
                config.max_reconnect_attempts
            );
        }

        let delay = reconnect_delay(config.reconnect_interval_secs, attempts);
        info!(
            delay_secs = delay.as_secs(),
            attempt = attempts,
            max = config.max_reconnect_attempts,
            "reconnecting market WebSocket"
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => return Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
