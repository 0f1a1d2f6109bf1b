// Trading strategy module
pub mod ema_cross;

pub use ema_cross::EmaCrossStrategy;

use crate::models::Candle;
use crate::Result;

/// Directional signal over the underlying index.
///
/// The engine maps a signal to an action given the current position: an
/// opposite-direction signal while positioned is an exit trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionSignal {
    BuyCall,
    BuyPut,
    Hold,
}

impl std::fmt::Display for OptionSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OptionSignal::BuyCall => write!(f, "BUY_CALL"),
            OptionSignal::BuyPut => write!(f, "BUY_PUT"),
            OptionSignal::Hold => write!(f, "HOLD"),
        }
    }
}

/// Base trait for all trading strategies
pub trait Strategy: Send + Sync {
    /// Generate a signal from index candles at the configured interval
    fn evaluate(&self, candles: &[Candle]) -> Result<OptionSignal>;

    /// Get strategy name
    fn name(&self) -> &str;

    /// Minimum candles required for this strategy
    fn min_candles_required(&self) -> usize;
}
