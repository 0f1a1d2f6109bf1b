/// Average True Range (ATR) indicator
///
/// Measures market volatility by calculating the average of true ranges
/// over a period. True Range is the greatest of:
/// - Current High - Current Low
/// - Abs(Current High - Previous Close)
/// - Abs(Current Low - Previous Close)
///
/// Uses Wilder's smoothing for the moving average.
use crate::models::Candle;

fn true_ranges(candles: &[Candle]) -> Vec<f64> {
    let mut out = Vec::with_capacity(candles.len().saturating_sub(1));
    for i in 1..candles.len() {
        let high = candles[i].high;
        let low = candles[i].low;
        let prev_close = candles[i - 1].close;

        let tr = (high - low)
            .max((high - prev_close).abs())
            .max((low - prev_close).abs());
        out.push(tr);
    }
    out
}

/// Calculate the current ATR value, or None if insufficient data
pub fn calculate_atr(candles: &[Candle], period: usize) -> Option<f64> {
    let series = calculate_atr_series(candles, period);
    series.last().copied()
}

/// Calculate the full ATR series.
///
/// The first value covers candles[1..=period]; each subsequent value
/// corresponds to one further candle.
pub fn calculate_atr_series(candles: &[Candle], period: usize) -> Vec<f64> {
    if period == 0 || candles.len() < period + 1 {
        return Vec::new();
    }

    let trs = true_ranges(candles);
    if trs.len() < period {
        return Vec::new();
    }

    let mut series = Vec::with_capacity(trs.len() - period + 1);

    // First ATR is the simple average of the first `period` true ranges
    let first_atr: f64 = trs.iter().take(period).sum::<f64>() / period as f64;
    series.push(first_atr);

    let mut atr = first_atr;
    for tr in &trs[period..] {
        atr = (atr * (period as f64 - 1.0) + tr) / period as f64;
        series.push(atr);
    }

    series
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn create_test_candles(prices: &[(f64, f64, f64, f64)]) -> Vec<Candle> {
        prices
            .iter()
            .enumerate()
            .map(|(i, &(open, high, low, close))| Candle {
                timestamp: Utc::now() + chrono::Duration::minutes(i as i64),
                open,
                high,
                low,
                close,
                volume: 1000.0,
            })
            .collect()
    }

    #[test]
    fn test_calculate_atr_low_volatility() {
        let candles = create_test_candles(&vec![(100.0, 101.0, 99.0, 100.0); 15]);
        let atr = calculate_atr(&candles, 14);

        assert!(atr.is_some());
        // ATR should be around the 2.0 high-low range
        assert!(atr.unwrap() > 1.5 && atr.unwrap() < 2.5);
    }

    #[test]
    fn test_calculate_atr_high_volatility() {
        let candles = create_test_candles(&vec![(100.0, 110.0, 90.0, 105.0); 15]);
        let atr = calculate_atr(&candles, 14);

        assert!(atr.is_some());
        assert!(atr.unwrap() > 10.0);
    }

    #[test]
    fn test_insufficient_data() {
        let candles = create_test_candles(&[(100.0, 101.0, 99.0, 100.0); 2]);
        assert!(calculate_atr(&candles, 14).is_none());
        assert!(calculate_atr_series(&candles, 14).is_empty());
    }

    #[test]
    fn test_atr_series_length() {
        let candles = create_test_candles(&vec![(100.0, 105.0, 95.0, 100.0); 20]);
        let series = calculate_atr_series(&candles, 14);
        // 19 true ranges, one seed + 5 smoothed values
        assert_eq!(series.len(), 6);
    }
}
