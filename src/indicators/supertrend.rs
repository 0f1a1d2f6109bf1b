/// Supertrend indicator
///
/// ATR bands around the bar midpoint produce a trailing line that flips
/// side when price closes through it. The line is used as the
/// index-level safety stop: it only ever tightens in the direction of
/// the active trend.
use crate::models::Candle;

use super::atr::calculate_atr_series;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SupertrendPoint {
    /// The trailing line value (lower band in an uptrend, upper in a downtrend)
    pub value: f64,
    pub bullish: bool,
}

/// Calculate the Supertrend series.
///
/// Points align with candles starting at index `period`; empty with
/// insufficient data.
pub fn calculate_supertrend(candles: &[Candle], period: usize, multiplier: f64) -> Vec<SupertrendPoint> {
    let atr = calculate_atr_series(candles, period);
    if atr.is_empty() {
        return Vec::new();
    }

    // ATR series starts at candle index `period`
    let offset = period;
    let mut points: Vec<SupertrendPoint> = Vec::with_capacity(atr.len());

    let mut upper_final = 0.0;
    let mut lower_final = 0.0;

    for (i, &atr_val) in atr.iter().enumerate() {
        let idx = offset + i;
        let bar = &candles[idx];
        let hl2 = (bar.high + bar.low) / 2.0;
        let upper_basic = hl2 + multiplier * atr_val;
        let lower_basic = hl2 - multiplier * atr_val;

        if i == 0 {
            upper_final = upper_basic;
            lower_final = lower_basic;
            points.push(SupertrendPoint {
                value: lower_final,
                bullish: true,
            });
            continue;
        }

        let prev_close = candles[idx - 1].close;

        // Bands only tighten unless price closed through them
        upper_final = if upper_basic < upper_final || prev_close > upper_final {
            upper_basic
        } else {
            upper_final
        };
        lower_final = if lower_basic > lower_final || prev_close < lower_final {
            lower_basic
        } else {
            lower_final
        };

        let prev = points[i - 1];
        let bullish = if prev.bullish {
            bar.close >= lower_final
        } else {
            bar.close > upper_final
        };

        points.push(SupertrendPoint {
            value: if bullish { lower_final } else { upper_final },
            bullish,
        });
    }

    points
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn candles_from_closes(closes: &[f64]) -> Vec<Candle> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Candle {
                timestamp: Utc::now() + chrono::Duration::minutes(i as i64),
                open: close,
                high: close + 1.0,
                low: close - 1.0,
                close,
                volume: 100.0,
            })
            .collect()
    }

    #[test]
    fn test_insufficient_data_is_empty() {
        let candles = candles_from_closes(&[100.0, 101.0]);
        assert!(calculate_supertrend(&candles, 10, 3.0).is_empty());
    }

    #[test]
    fn test_uptrend_line_below_price() {
        let closes: Vec<f64> = (0..40).map(|i| 100.0 + i as f64).collect();
        let candles = candles_from_closes(&closes);
        let st = calculate_supertrend(&candles, 10, 3.0);

        assert!(!st.is_empty());
        let last = st.last().unwrap();
        assert!(last.bullish);
        assert!(last.value < candles.last().unwrap().close);
    }

    #[test]
    fn test_downtrend_line_above_price() {
        let closes: Vec<f64> = (0..40).map(|i| 200.0 - 2.0 * i as f64).collect();
        let candles = candles_from_closes(&closes);
        let st = calculate_supertrend(&candles, 10, 3.0);

        let last = st.last().unwrap();
        assert!(!last.bullish);
        assert!(last.value > candles.last().unwrap().close);
    }

    #[test]
    fn test_line_ratchets_in_uptrend() {
        let closes: Vec<f64> = (0..40).map(|i| 100.0 + i as f64).collect();
        let candles = candles_from_closes(&closes);
        let st = calculate_supertrend(&candles, 10, 3.0);

        // While the trend stays bullish the line never moves down
        for w in st.windows(2) {
            if w[0].bullish && w[1].bullish {
                assert!(w[1].value >= w[0].value - 1e-9);
            }
        }
    }
}
