use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::types::{now_ms, Interval, Symbol};

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// A single OHLCV candle, from a push message or a direct pull.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: Symbol,
    pub interval: Interval,
    pub open_time: i64,
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub quote_volume: f64,
    #[serde(default)]
    pub trade_count: u64,
    /// Whether the exchange has finalised this bucket.
    #[serde(default)]
    pub confirmed: bool,
}

impl Candle {
    pub fn key(&self) -> CandleKey {
        CandleKey {
            symbol: self.symbol.clone(),
            interval: self.interval.clone(),
        }
    }
}

/// Composite key that identifies a unique candle series.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct CandleKey {
    pub symbol: Symbol,
    pub interval: Interval,
}

impl CandleKey {
    pub fn new(symbol: impl Into<Symbol>, interval: impl Into<Interval>) -> Self {
        Self {
            symbol: symbol.into(),
            interval: interval.into(),
        }
    }
}

impl std::fmt::Display for CandleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.interval)
    }
}

/// Outcome of a single [`CandleBuffer::append`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandleWrite {
    /// New open time added to the window.
    Inserted,
    /// Existing open time overwritten in place.
    Updated,
    /// Historical candle older than a full window.
    Dropped,
}

struct Window {
    candles: VecDeque<Candle>,
    /// Wall-clock ms of the last accepted write.
    updated_at: i64,
}

// ---------------------------------------------------------------------------
// CandleBuffer -- thread-safe bounded window per (symbol, interval)
// ---------------------------------------------------------------------------

/// Thread-safe store of the most recent candles per `(symbol, interval)`.
///
/// Each window is ordered ascending by `open_time` with no duplicate open
/// times and never holds more than `capacity` candles.
pub struct CandleBuffer {
    windows: RwLock<HashMap<CandleKey, Window>>,
    capacity: usize,
}

impl CandleBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            windows: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Insert or overwrite `candle` in its window.
    ///
    /// * Same `open_time` as a retained candle: overwritten in place (an
    ///   unfinished candle being extended).
    /// * Newer than everything retained: appended, evicting the oldest entry
    ///   when the window overflows.
    /// * Older than the oldest retained: accepted only while the window is
    ///   below capacity, otherwise dropped.
    /// * Inside a gap: inserted at its sorted position, evicting the oldest on
    ///   overflow.
    pub fn append(&self, candle: Candle) -> CandleWrite {
        let key = candle.key();
        let mut map = self.windows.write();
        let window = map.entry(key).or_insert_with(|| Window {
            candles: VecDeque::with_capacity(self.capacity + 1),
            updated_at: 0,
        });
        let ring = &mut window.candles;

        let outcome = match ring.binary_search_by_key(&candle.open_time, |c| c.open_time) {
            Ok(idx) => {
                ring[idx] = candle;
                CandleWrite::Updated
            }
            Err(idx) if idx == 0 && !ring.is_empty() && ring.len() >= self.capacity => {
                CandleWrite::Dropped
            }
            Err(idx) => {
                ring.insert(idx, candle);
                while ring.len() > self.capacity {
                    ring.pop_front();
                }
                CandleWrite::Inserted
            }
        };

        if outcome != CandleWrite::Dropped {
            window.updated_at = now_ms();
        }
        outcome
    }

    /// Return the most recent `limit` candles (oldest-first), or `None` when
    /// nothing has been cached for the key.
    pub fn get(&self, key: &CandleKey, limit: usize) -> Option<Vec<Candle>> {
        let map = self.windows.read();
        let ring = &map.get(key)?.candles;
        let start = ring.len().saturating_sub(limit);
        Some(ring.iter().skip(start).cloned().collect())
    }

    /// Wall-clock ms of the last accepted write into the window.
    pub fn updated_at(&self, key: &CandleKey) -> Option<i64> {
        self.windows.read().get(key).map(|w| w.updated_at)
    }

    /// Drop a whole window.
    pub fn remove(&self, key: &CandleKey) -> bool {
        self.windows.write().remove(key).is_some()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_candle(open_time: i64, close: f64) -> Candle {
        Candle {
            symbol: "BTC-USDT".into(),
            interval: "1m".into(),
            open_time,
            close_time: open_time + 59_999,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 100.0,
            quote_volume: 200.0,
            trade_count: 50,
            confirmed: true,
        }
    }

    fn key() -> CandleKey {
        CandleKey::new("BTC-USDT", "1m")
    }

    fn open_times(buf: &CandleBuffer) -> Vec<i64> {
        buf.get(&key(), usize::MAX)
            .unwrap_or_default()
            .iter()
            .map(|c| c.open_time)
            .collect()
    }

    #[test]
    fn window_keeps_most_recent_capacity() {
        let capacity = 5;
        let k = 3;
        let buf = CandleBuffer::new(capacity);

        for i in 0..(capacity + k) as i64 {
            assert_eq!(buf.append(sample_candle(i * 60_000, 100.0 + i as f64)), CandleWrite::Inserted);
        }

        assert_eq!(open_times(&buf).len(), capacity);
        // The k newest plus the newest (capacity - k) of the prior ones.
        let expected: Vec<i64> = (k as i64..(capacity + k) as i64).map(|i| i * 60_000).collect();
        assert_eq!(open_times(&buf), expected);
    }

    #[test]
    fn same_open_time_overwrites_in_place() {
        let buf = CandleBuffer::new(10);
        buf.append(sample_candle(0, 50.0));
        buf.append(sample_candle(60_000, 51.0));

        let mut extended = sample_candle(60_000, 55.0);
        extended.confirmed = false;
        assert_eq!(buf.append(extended), CandleWrite::Updated);

        let window = buf.get(&key(), usize::MAX).unwrap();
        assert_eq!(window.len(), 2);
        let latest = window.last().unwrap();
        assert_eq!(latest.close, 55.0);
        assert!(!latest.confirmed);
    }

    #[test]
    fn historical_candle_accepted_below_capacity() {
        let buf = CandleBuffer::new(3);
        buf.append(sample_candle(120_000, 3.0));
        assert_eq!(buf.append(sample_candle(0, 1.0)), CandleWrite::Inserted);
        assert_eq!(open_times(&buf), vec![0, 120_000]);
    }

    #[test]
    fn historical_candle_dropped_when_full() {
        let buf = CandleBuffer::new(2);
        buf.append(sample_candle(60_000, 2.0));
        buf.append(sample_candle(120_000, 3.0));
        assert_eq!(buf.append(sample_candle(0, 1.0)), CandleWrite::Dropped);
        assert_eq!(open_times(&buf), vec![60_000, 120_000]);
    }

    #[test]
    fn gap_fill_keeps_order() {
        let buf = CandleBuffer::new(3);
        buf.append(sample_candle(0, 1.0));
        buf.append(sample_candle(120_000, 3.0));
        buf.append(sample_candle(180_000, 4.0));
        // Full window, gap candle goes in and the oldest is evicted.
        assert_eq!(buf.append(sample_candle(60_000, 2.0)), CandleWrite::Inserted);
        assert_eq!(open_times(&buf), vec![60_000, 120_000, 180_000]);
    }

    #[test]
    fn get_respects_limit_and_absence() {
        let buf = CandleBuffer::new(10);
        assert!(buf.get(&key(), 5).is_none());
        for i in 0..4 {
            buf.append(sample_candle(i * 60_000, i as f64));
        }
        let last_two: Vec<f64> = buf.get(&key(), 2).unwrap().iter().map(|c| c.close).collect();
        assert_eq!(last_two, vec![2.0, 3.0]);
        assert!(buf.updated_at(&key()).unwrap() > 0);
        assert!(buf.remove(&key()));
        assert!(buf.get(&key(), 2).is_none());
    }
}
