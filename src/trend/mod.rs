use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::broker::ResilientBrokerClient;
use crate::candles::CandleStore;
use crate::error::BrokerError;
use crate::indicators::calculate_ema;
use crate::models::{Candle, OptionSide, TrendDirection};

/// Timeframes checked for agreement, in minutes
pub const TIMEFRAMES: [u32; 3] = [1, 5, 15];
const EMA_FAST: usize = 9;
const EMA_SLOW: usize = 21;
/// Minimum bars a timeframe needs before its direction counts
pub const MIN_SAMPLES: usize = EMA_SLOW;

const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);
/// The shared 1-minute base series is refreshed at most this often
const BASE_TTL: Duration = Duration::from_secs(55);
const BASE_FETCH_DAYS: i64 = 10;

/// Per-(symbol, timeframe) analysis outcome.
///
/// Replaced wholesale on every recompute; never mutated in place, so a
/// reader can never observe a half-written result.
#[derive(Debug, Clone)]
pub struct TimeframeResult {
    pub direction: TrendDirection,
    pub samples: usize,
    pub derived_from_base: bool,
    pub computed_at: Instant,
    pub error: Option<String>,
}

impl TimeframeResult {
    /// Invalid results are excluded from both sides of the agreement ratio
    pub fn is_valid(&self) -> bool {
        self.error.is_none()
    }
}

/// Multi-timeframe trend confirmation over one shared 1-minute base.
///
/// Every larger timeframe is resampled from the base series, so all
/// timeframes are always perfectly aligned and one broker history call
/// serves them all.
pub struct TimeframeFilter {
    broker: Option<Arc<ResilientBrokerClient>>,
    store: CandleStore,
    cache: Mutex<HashMap<(String, u32), TimeframeResult>>,
    base_refreshed: Mutex<HashMap<String, Instant>>,
    cache_ttl: Duration,
    required_agreement: usize,
}

impl TimeframeFilter {
    pub fn new(
        broker: Option<Arc<ResilientBrokerClient>>,
        store: CandleStore,
        cache_ttl_secs: u64,
        required_agreement: usize,
    ) -> Self {
        Self {
            broker,
            store,
            cache: Mutex::new(HashMap::new()),
            base_refreshed: Mutex::new(HashMap::new()),
            cache_ttl: if cache_ttl_secs == 0 {
                DEFAULT_CACHE_TTL
            } else {
                Duration::from_secs(cache_ttl_secs)
            },
            required_agreement,
        }
    }

    /// Trend direction for one symbol and timeframe, cached with TTL
    pub async fn direction(&self, symbol: &str, timeframe: u32) -> TimeframeResult {
        if let Some(cached) = self.cached(symbol, timeframe) {
            return cached;
        }

        if let Err(e) = self.ensure_base(symbol).await {
            // A failed refresh still allows analysis over whatever base
            // data we already hold; only an empty series is invalid.
            tracing::warn!(symbol, "base series refresh failed: {e}");
        }

        let bars = self.store.resample(symbol, timeframe);
        let result = compute_direction(&bars, timeframe != 1);

        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.insert((symbol.to_string(), timeframe), result.clone());
        result
    }

    /// Multi-timeframe agreement gate for a proposed entry.
    ///
    /// Allows entry only when enough valid timeframes agree with the
    /// proposed direction; timeframes with insufficient data count as
    /// invalid, not as disagreement.
    pub async fn confirm_entry(&self, symbol: &str, side: OptionSide) -> (bool, String) {
        let target = match side {
            OptionSide::Call => TrendDirection::Bullish,
            OptionSide::Put => TrendDirection::Bearish,
        };

        let mut results = Vec::with_capacity(TIMEFRAMES.len());
        for tf in TIMEFRAMES {
            results.push((tf, self.direction(symbol, tf).await));
        }

        let (allowed, summary) = agreement_decision(&results, target, self.required_agreement);
        tracing::info!("[MTF] {}", summary);
        (allowed, summary)
    }

    /// Drop every cached result (e.g. after a settings reload)
    pub fn invalidate(&self) {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    fn cached(&self, symbol: &str, timeframe: u32) -> Option<TimeframeResult> {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache
            .get(&(symbol.to_string(), timeframe))
            .filter(|r| r.computed_at.elapsed() < self.cache_ttl)
            .cloned()
    }

    /// Refresh the 1-minute base series from the broker when stale
    async fn ensure_base(&self, symbol: &str) -> Result<(), BrokerError> {
        let Some(broker) = &self.broker else {
            return Ok(());
        };

        let fresh = {
            let refreshed = self.base_refreshed.lock().unwrap_or_else(|e| e.into_inner());
            refreshed
                .get(symbol)
                .map(|at| at.elapsed() < BASE_TTL)
                .unwrap_or(false)
        };
        if fresh {
            return Ok(());
        }

        let candles = broker
            .get_history(symbol, 1, BASE_FETCH_DAYS, Utc::now())
            .await?;
        if !candles.is_empty() {
            self.store.ingest(symbol, candles);
        }

        let mut refreshed = self.base_refreshed.lock().unwrap_or_else(|e| e.into_inner());
        refreshed.insert(symbol.to_string(), Instant::now());
        Ok(())
    }
}

/// EMA-crossover direction over one resampled series
fn compute_direction(bars: &[Candle], derived_from_base: bool) -> TimeframeResult {
    let samples = bars.len();
    if samples < MIN_SAMPLES {
        return TimeframeResult {
            direction: TrendDirection::Neutral,
            samples,
            derived_from_base,
            computed_at: Instant::now(),
            error: Some(format!("insufficient samples: {} < {}", samples, MIN_SAMPLES)),
        };
    }

    let closes: Vec<f64> = bars.iter().map(|c| c.close).collect();
    let (fast, slow) = match (
        calculate_ema(&closes, EMA_FAST),
        calculate_ema(&closes, EMA_SLOW),
    ) {
        (Some(fast), Some(slow)) => (fast, slow),
        _ => {
            return TimeframeResult {
                direction: TrendDirection::Neutral,
                samples,
                derived_from_base,
                computed_at: Instant::now(),
                error: Some("ema computation failed".to_string()),
            }
        }
    };

    let close = closes[closes.len() - 1];
    let direction = if slow < fast && fast < close {
        TrendDirection::Bullish
    } else if slow > fast && fast > close {
        TrendDirection::Bearish
    } else {
        TrendDirection::Neutral
    };

    TimeframeResult {
        direction,
        samples,
        derived_from_base,
        computed_at: Instant::now(),
        error: None,
    }
}

/// Agreement rule over per-timeframe results. Pure so the decision
/// matrix is testable without market data.
fn agreement_decision(
    results: &[(u32, TimeframeResult)],
    target: TrendDirection,
    required: usize,
) -> (bool, String) {
    let valid: Vec<&(u32, TimeframeResult)> =
        results.iter().filter(|(_, r)| r.is_valid()).collect();
    let matches = valid
        .iter()
        .filter(|(_, r)| r.direction == target)
        .count();

    // The threshold is only meaningful if enough timeframes produced
    // valid results to reach it.
    let allowed = matches >= required && valid.len() >= required;

    let marks: Vec<String> = results
        .iter()
        .map(|(tf, r)| {
            let mark = if !r.is_valid() {
                "-"
            } else if r.direction == target {
                "ok"
            } else {
                "x"
            };
            format!("{}m:{}", tf, mark)
        })
        .collect();
    let summary = format!(
        "MTF {} -> {} ({}/{} of {} valid)",
        marks.join(" "),
        if allowed { "ALLOWED" } else { "BLOCKED" },
        matches,
        required,
        valid.len(),
    );

    (allowed, summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn result(direction: TrendDirection, valid: bool) -> TimeframeResult {
        TimeframeResult {
            direction,
            samples: if valid { 50 } else { 3 },
            derived_from_base: true,
            computed_at: Instant::now(),
            error: if valid {
                None
            } else {
                Some("insufficient samples".to_string())
            },
        }
    }

    fn bars(closes: &[f64]) -> Vec<Candle> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Candle {
                timestamp: chrono::Utc.timestamp_opt(i as i64 * 60, 0).unwrap(),
                open: close,
                high: close + 0.5,
                low: close - 0.5,
                close,
                volume: 1.0,
            })
            .collect()
    }

    #[test]
    fn test_two_of_three_agreement_allows() {
        let results = vec![
            (1, result(TrendDirection::Bullish, true)),
            (5, result(TrendDirection::Bullish, true)),
            (15, result(TrendDirection::Neutral, true)),
        ];
        let (allowed, summary) = agreement_decision(&results, TrendDirection::Bullish, 2);
        assert!(allowed, "{}", summary);
    }

    #[test]
    fn test_split_decision_blocks() {
        let results = vec![
            (1, result(TrendDirection::Bullish, true)),
            (5, result(TrendDirection::Bearish, true)),
            (15, result(TrendDirection::Neutral, true)),
        ];
        let (allowed, _) = agreement_decision(&results, TrendDirection::Bullish, 2);
        assert!(!allowed);
    }

    #[test]
    fn test_invalid_timeframes_excluded_from_both_sides() {
        // Two agree but one is invalid: still allowed, the invalid
        // timeframe is not treated as disagreement.
        let results = vec![
            (1, result(TrendDirection::Bullish, true)),
            (5, result(TrendDirection::Bullish, true)),
            (15, result(TrendDirection::Neutral, false)),
        ];
        let (allowed, _) = agreement_decision(&results, TrendDirection::Bullish, 2);
        assert!(allowed);

        // Only one valid result: the 2-of-N threshold is unreachable,
        // so entry is blocked even though nothing disagreed.
        let results = vec![
            (1, result(TrendDirection::Bullish, true)),
            (5, result(TrendDirection::Bullish, false)),
            (15, result(TrendDirection::Neutral, false)),
        ];
        let (allowed, _) = agreement_decision(&results, TrendDirection::Bullish, 2);
        assert!(!allowed);
    }

    #[test]
    fn test_compute_direction_bullish() {
        let closes: Vec<f64> = (0..40).map(|i| 100.0 + i as f64).collect();
        let result = compute_direction(&bars(&closes), false);
        assert!(result.is_valid());
        assert_eq!(result.direction, TrendDirection::Bullish);
    }

    #[test]
    fn test_compute_direction_bearish() {
        let closes: Vec<f64> = (0..40).map(|i| 200.0 - 2.0 * i as f64).collect();
        let result = compute_direction(&bars(&closes), false);
        assert_eq!(result.direction, TrendDirection::Bearish);
    }

    #[test]
    fn test_insufficient_samples_is_invalid_not_bearish() {
        let result = compute_direction(&bars(&[100.0, 101.0, 102.0]), true);
        assert!(!result.is_valid());
        assert_eq!(result.direction, TrendDirection::Neutral);
    }

    #[tokio::test]
    async fn test_direction_uses_store_and_caches() {
        let store = CandleStore::new(500);
        let closes: Vec<f64> = (0..120).map(|i| 100.0 + i as f64 * 0.5).collect();
        store.ingest("NIFTY", bars(&closes));

        let filter = TimeframeFilter::new(None, store.clone(), 60, 2);

        let first = filter.direction("NIFTY", 1).await;
        assert_eq!(first.direction, TrendDirection::Bullish);

        // Replace the series with a crash; the cached result must win
        // within the TTL because entries are replaced wholesale on
        // expiry, never recomputed per read.
        store.clear("NIFTY");
        let falling: Vec<f64> = (0..120).map(|i| 300.0 - 2.0 * i as f64).collect();
        store.ingest("NIFTY", bars(&falling));

        let second = filter.direction("NIFTY", 1).await;
        assert_eq!(second.direction, TrendDirection::Bullish);

        filter.invalidate();
        let third = filter.direction("NIFTY", 1).await;
        assert_eq!(third.direction, TrendDirection::Bearish);
    }

    #[tokio::test]
    async fn test_confirm_entry_end_to_end() {
        let store = CandleStore::new(2000);
        // A steady uptrend agrees on every derived timeframe
        let closes: Vec<f64> = (0..600).map(|i| 100.0 + i as f64 * 0.2).collect();
        store.ingest("NIFTY", bars(&closes));

        let filter = TimeframeFilter::new(None, store, 60, 2);

        let (allowed, summary) = filter.confirm_entry("NIFTY", OptionSide::Call).await;
        assert!(allowed, "{}", summary);

        let (allowed, _) = filter.confirm_entry("NIFTY", OptionSide::Put).await;
        assert!(!allowed);
    }
}
