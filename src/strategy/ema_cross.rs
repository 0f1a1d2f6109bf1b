use super::{OptionSignal, Strategy};
use crate::indicators::{calculate_ema_series, calculate_supertrend};
use crate::models::Candle;
use crate::Result;

/// EMA crossover strategy filtered by the Supertrend direction.
///
/// A fast/slow EMA cross on the index gives the directional trigger; the
/// Supertrend line must agree before a signal fires, which keeps the
/// strategy out of chop where crossovers whipsaw.
#[derive(Debug, Clone)]
pub struct EmaCrossStrategy {
    fast_period: usize,
    slow_period: usize,
    supertrend_period: usize,
    supertrend_multiplier: f64,
}

impl EmaCrossStrategy {
    pub fn new(fast_period: usize, slow_period: usize) -> Self {
        Self {
            fast_period,
            slow_period,
            supertrend_period: 10,
            supertrend_multiplier: 3.0,
        }
    }
}

impl Default for EmaCrossStrategy {
    fn default() -> Self {
        Self::new(9, 21)
    }
}

impl Strategy for EmaCrossStrategy {
    fn evaluate(&self, candles: &[Candle]) -> Result<OptionSignal> {
        if candles.len() < self.min_candles_required() {
            return Err(format!(
                "Insufficient data: {} candles, need {}",
                candles.len(),
                self.min_candles_required()
            )
            .into());
        }

        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let fast = calculate_ema_series(&closes, self.fast_period)
            .ok_or("fast EMA computation failed")?;
        let slow = calculate_ema_series(&closes, self.slow_period)
            .ok_or("slow EMA computation failed")?;

        // Align the two series at the tail
        let n = fast.len().min(slow.len());
        if n < 2 {
            return Ok(OptionSignal::Hold);
        }
        let (f_prev, f_last) = (fast[fast.len() - 2], fast[fast.len() - 1]);
        let (s_prev, s_last) = (slow[slow.len() - 2], slow[slow.len() - 1]);

        let crossed_up = f_prev <= s_prev && f_last > s_last;
        let crossed_down = f_prev >= s_prev && f_last < s_last;

        let supertrend = calculate_supertrend(
            candles,
            self.supertrend_period,
            self.supertrend_multiplier,
        );
        let st_bullish = supertrend.last().map(|p| p.bullish);

        let signal = match (crossed_up, crossed_down, st_bullish) {
            (true, _, Some(true)) => OptionSignal::BuyCall,
            (_, true, Some(false)) => OptionSignal::BuyPut,
            _ => OptionSignal::Hold,
        };

        Ok(signal)
    }

    fn name(&self) -> &str {
        "EmaCrossStrategy"
    }

    fn min_candles_required(&self) -> usize {
        self.slow_period.max(self.supertrend_period + 1) + 2
    }
}
