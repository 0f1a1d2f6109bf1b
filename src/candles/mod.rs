use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

use crate::models::Candle;

/// The running 1-minute bar being built from live ticks
#[derive(Debug, Clone)]
struct LiveBar {
    start: DateTime<Utc>,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

#[derive(Debug, Default)]
struct SeriesState {
    /// Completed 1-minute bars, oldest first
    bars: VecDeque<Candle>,
    live: Option<LiveBar>,
}

/// Thread-safe per-symbol store of 1-minute bars.
///
/// Everything is fetched and stored at 1-minute resolution; any larger
/// timeframe is produced by [`resample_candles`] in-process so one broker
/// history call serves every configured timeframe.
#[derive(Clone)]
pub struct CandleStore {
    data: Arc<RwLock<HashMap<String, SeriesState>>>,
    max_bars: usize,
}

impl CandleStore {
    /// # Arguments
    /// * `max_bars` - rolling cap of 1-minute bars kept per symbol
    pub fn new(max_bars: usize) -> Self {
        Self {
            data: Arc::new(RwLock::new(HashMap::new())),
            max_bars,
        }
    }

    /// Merge broker history into the store: deduplicated by minute,
    /// sorted, capped to the rolling window.
    pub fn ingest(&self, symbol: &str, incoming: Vec<Candle>) {
        if incoming.is_empty() {
            return;
        }
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        let series = data.entry(symbol.to_string()).or_default();

        let mut merged: Vec<Candle> = series.bars.drain(..).collect();
        merged.extend(incoming.into_iter().map(|c| Candle {
            timestamp: truncate_to_minute(c.timestamp),
            ..c
        }));
        merged.sort_by_key(|c| c.timestamp);
        // Last write wins on duplicate minutes
        merged.reverse();
        merged.dedup_by_key(|c| c.timestamp);
        merged.reverse();

        let skip = merged.len().saturating_sub(self.max_bars);
        series.bars = merged.into_iter().skip(skip).collect();
    }

    /// Incorporate a live tick into the current 1-minute bar.
    ///
    /// Returns true when the minute rolled over and a completed bar was
    /// appended, which is the signal to re-evaluate anything derived.
    pub fn push_tick(&self, symbol: &str, ltp: f64, ts: DateTime<Utc>) -> bool {
        let bar_start = truncate_to_minute(ts);
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        let series = data.entry(symbol.to_string()).or_default();

        let mut completed = false;
        match &mut series.live {
            None => {
                series.live = Some(LiveBar {
                    start: bar_start,
                    open: ltp,
                    high: ltp,
                    low: ltp,
                    close: ltp,
                    volume: 1.0,
                });
            }
            Some(live) if bar_start > live.start => {
                let finished = Candle {
                    timestamp: live.start,
                    open: live.open,
                    high: live.high,
                    low: live.low,
                    close: live.close,
                    volume: live.volume,
                };
                push_capped(&mut series.bars, finished, self.max_bars);
                completed = true;
                series.live = Some(LiveBar {
                    start: bar_start,
                    open: ltp,
                    high: ltp,
                    low: ltp,
                    close: ltp,
                    volume: 1.0,
                });
            }
            Some(live) => {
                live.high = live.high.max(ltp);
                live.low = live.low.min(ltp);
                live.close = ltp;
                live.volume += 1.0;
            }
        }
        completed
    }

    /// All completed 1-minute bars for a symbol (copy, oldest first)
    pub fn candles(&self, symbol: &str) -> Vec<Candle> {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        data.get(symbol)
            .map(|s| s.bars.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Resampled view of a symbol's series at `minutes` width
    pub fn resample(&self, symbol: &str, minutes: u32) -> Vec<Candle> {
        let bars = self.candles(symbol);
        resample_candles(&bars, minutes)
    }

    /// Timestamp of the newest completed 1-minute bar
    pub fn last_bar_time(&self, symbol: &str) -> Option<DateTime<Utc>> {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        data.get(symbol).and_then(|s| s.bars.back().map(|c| c.timestamp))
    }

    pub fn bar_count(&self, symbol: &str) -> usize {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        data.get(symbol).map(|s| s.bars.len()).unwrap_or(0)
    }

    pub fn clear(&self, symbol: &str) {
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        data.remove(symbol);
    }
}

fn push_capped(bars: &mut VecDeque<Candle>, candle: Candle, max: usize) {
    bars.push_back(candle);
    while bars.len() > max {
        bars.pop_front();
    }
}

fn truncate_to_minute(ts: DateTime<Utc>) -> DateTime<Utc> {
    let secs = ts.timestamp() - ts.timestamp().rem_euclid(60);
    Utc.timestamp_opt(secs, 0).single().unwrap_or(ts)
}

/// Resample 1-minute bars into `minutes`-wide OHLCV buckets.
///
/// Buckets have fixed epoch-aligned boundaries: open = first, high = max,
/// low = min, close = last, volume = sum. A trailing bucket whose final
/// 1-minute slot has not arrived yet is dropped so downstream indicators
/// never see a half-built bar.
pub fn resample_candles(bars: &[Candle], minutes: u32) -> Vec<Candle> {
    if minutes <= 1 {
        return bars.to_vec();
    }
    let width = minutes as i64 * 60;
    let mut out: Vec<Candle> = Vec::new();

    for bar in bars {
        let secs = bar.timestamp.timestamp();
        let bucket_secs = secs - secs.rem_euclid(width);
        let bucket_start = match Utc.timestamp_opt(bucket_secs, 0).single() {
            Some(t) => t,
            None => continue,
        };

        match out.last_mut() {
            Some(current) if current.timestamp == bucket_start => {
                current.high = current.high.max(bar.high);
                current.low = current.low.min(bar.low);
                current.close = bar.close;
                current.volume += bar.volume;
            }
            _ => out.push(Candle {
                timestamp: bucket_start,
                open: bar.open,
                high: bar.high,
                low: bar.low,
                close: bar.close,
                volume: bar.volume,
            }),
        }
    }

    // Drop the trailing bucket if its last 1-minute slot is still open
    if let (Some(last_bucket), Some(last_bar)) = (out.last(), bars.last()) {
        let bucket_end = last_bucket.timestamp + Duration::seconds(width);
        if last_bar.timestamp + Duration::seconds(60) < bucket_end {
            out.pop();
        }
    }

    out
}
