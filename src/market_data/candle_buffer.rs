use std::collections::{HashMap, VecDeque};
use std::io::BufRead;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// A single OHLCV bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Bar open time in epoch milliseconds.
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub volume: f64,
}

impl Candle {
    pub fn timestamp(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.open_time)
            .single()
            .unwrap_or_else(Utc::now)
    }

    /// Basic sanity check applied to replayed bars.
    pub fn is_well_formed(&self) -> bool {
        let finite = [self.open, self.high, self.low, self.close, self.volume]
            .iter()
            .all(|v| v.is_finite());
        finite && self.high >= self.low && self.close > 0.0 && self.volume >= 0.0
    }
}

// ---------------------------------------------------------------------------
// CandleBuffer -- thread-safe ring buffer per symbol
// ---------------------------------------------------------------------------

/// Thread-safe ring buffer that keeps the most recent bars per symbol. The
/// regime detector reads a window from here on every bar.
pub struct CandleBuffer {
    buffers: RwLock<HashMap<String, VecDeque<Candle>>>,
    max_candles: usize,
}

impl CandleBuffer {
    pub fn new(max_candles: usize) -> Self {
        Self {
            buffers: RwLock::new(HashMap::new()),
            max_candles: max_candles.max(1),
        }
    }

    /// Append a bar. A bar with the same `open_time` as the last one replaces
    /// it (in-progress update); out-of-order bars are dropped.
    pub fn push(&self, symbol: &str, candle: Candle) -> bool {
        let mut map = self.buffers.write();
        let ring = map
            .entry(symbol.to_string())
            .or_insert_with(|| VecDeque::with_capacity(self.max_candles + 1));

        if let Some(last) = ring.back() {
            if candle.open_time < last.open_time {
                warn!(
                    symbol,
                    open_time = candle.open_time,
                    last_open_time = last.open_time,
                    "out-of-order bar dropped"
                );
                return false;
            }
            if candle.open_time == last.open_time {
                ring.pop_back();
            }
        }
        ring.push_back(candle);
        while ring.len() > self.max_candles {
            ring.pop_front();
        }
        true
    }

    /// Most recent `count` bars, oldest first.
    pub fn recent(&self, symbol: &str, count: usize) -> Vec<Candle> {
        let map = self.buffers.read();
        match map.get(symbol) {
            Some(ring) => {
                let start = ring.len().saturating_sub(count);
                ring.iter().skip(start).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    pub fn last_close(&self, symbol: &str) -> Option<f64> {
        self.buffers
            .read()
            .get(symbol)
            .and_then(|ring| ring.back())
            .map(|c| c.close)
    }

    pub fn count(&self, symbol: &str) -> usize {
        self.buffers.read().get(symbol).map(|r| r.len()).unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// JSON-lines replay source
// ---------------------------------------------------------------------------

/// Parse one JSON-lines record into a bar.
pub fn parse_candle_line(line: &str) -> Result<Candle> {
    let candle: Candle = serde_json::from_str(line).context("malformed bar record")?;
    if !candle.is_well_formed() {
        anyhow::bail!("bar at {} is not well formed", candle.open_time);
    }
    Ok(candle)
}

/// Load every well-formed bar from a JSON-lines file. Blank lines are skipped;
/// malformed lines are logged and skipped.
pub fn load_jsonl(path: impl AsRef<Path>) -> Result<Vec<Candle>> {
    let path = path.as_ref();
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open bar file {}", path.display()))?;

    let mut candles = Vec::new();
    for (idx, line) in std::io::BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("failed to read line {}", idx + 1))?;
        if line.trim().is_empty() {
            continue;
        }
        match parse_candle_line(&line) {
            Ok(c) => candles.push(c),
            Err(e) => warn!(line = idx + 1, error = %e, "skipping bar"),
        }
    }
    debug!(path = %path.display(), count = candles.len(), "bars loaded");
    Ok(candles)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(open_time: i64, close: f64) -> Candle {
        Candle {
            open_time,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 10.0,
        }
    }

    #[test]
    fn ring_buffer_trimming() {
        let buf = CandleBuffer::new(3);
        for i in 0..5 {
            buf.push("BTCUSDT", bar(i, 100.0 + i as f64));
        }
        assert_eq!(buf.count("BTCUSDT"), 3);
        let recent = buf.recent("BTCUSDT", 10);
        assert_eq!(recent.first().map(|c| c.open_time), Some(2));
        assert_eq!(buf.last_close("BTCUSDT"), Some(104.0));
    }

    #[test]
    fn same_open_time_replaces_last() {
        let buf = CandleBuffer::new(10);
        buf.push("ETHUSDT", bar(1, 100.0));
        buf.push("ETHUSDT", bar(1, 101.0));
        assert_eq!(buf.count("ETHUSDT"), 1);
        assert_eq!(buf.last_close("ETHUSDT"), Some(101.0));
    }

    #[test]
    fn out_of_order_bar_dropped() {
        let buf = CandleBuffer::new(10);
        assert!(buf.push("ETHUSDT", bar(5, 100.0)));
        assert!(!buf.push("ETHUSDT", bar(4, 99.0)));
        assert_eq!(buf.count("ETHUSDT"), 1);
    }

    #[test]
    fn unknown_symbol_is_empty() {
        let buf = CandleBuffer::new(10);
        assert!(buf.recent("NOPE", 5).is_empty());
        assert!(buf.last_close("NOPE").is_none());
    }

    #[test]
    fn parse_line_ok_and_rejects_bad_bar() {
        let ok = r#"{"open_time":1700000000000,"open":1.0,"high":2.0,"low":0.5,"close":1.5,"volume":3.0}"#;
        let candle = parse_candle_line(ok).unwrap();
        assert!((candle.close - 1.5).abs() < 1e-12);

        let inverted = r#"{"open_time":1,"open":1.0,"high":0.5,"low":2.0,"close":1.5}"#;
        assert!(parse_candle_line(inverted).is_err());
        assert!(parse_candle_line("not json").is_err());
    }
}
