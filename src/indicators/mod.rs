// Technical indicators module
// Implements EMA/SMA, ATR and Supertrend for trend analysis

pub mod atr;
pub mod moving_average;
pub mod supertrend;

pub use atr::{calculate_atr, calculate_atr_series};
pub use moving_average::{calculate_ema, calculate_ema_series, calculate_sma};
pub use supertrend::{calculate_supertrend, SupertrendPoint};
