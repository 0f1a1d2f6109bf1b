use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A normalized market-data tick from the streaming feed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub ltp: f64,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

/// OHLCV candlestick data
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Which leg of the option chain a position is on
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum OptionSide {
    Call,
    Put,
}

impl OptionSide {
    /// Contract suffix used in exchange symbols
    pub fn suffix(&self) -> &'static str {
        match self {
            OptionSide::Call => "CE",
            OptionSide::Put => "PE",
        }
    }

    pub fn opposite(&self) -> OptionSide {
        match self {
            OptionSide::Call => OptionSide::Put,
            OptionSide::Put => OptionSide::Call,
        }
    }
}

impl std::fmt::Display for OptionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OptionSide::Call => write!(f, "CALL"),
            OptionSide::Put => write!(f, "PUT"),
        }
    }
}

/// Trend direction reported per timeframe
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TrendDirection {
    Bullish,
    Bearish,
    Neutral,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderStatus {
    Pending,
    Confirmed,
    Cancelled,
}

/// One placed order chunk.
///
/// Orders only ever move Pending -> Confirmed or Pending -> Cancelled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub broker_id: String,
    pub symbol: String,
    pub qty: u32,
    pub price: f64,
    pub status: OrderStatus,
}

impl Order {
    pub fn new(broker_id: String, symbol: String, qty: u32, price: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            broker_id,
            symbol,
            qty,
            price,
            status: OrderStatus::Pending,
        }
    }
}

/// Why a position was closed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    IndexStop,
    Signal(String),
    MarketClose,
    Manual,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::StopLoss => write!(f, "Option price below stop loss"),
            ExitReason::TakeProfit => write!(f, "Target profit hit"),
            ExitReason::IndexStop => write!(f, "Index crossed safety stop"),
            ExitReason::Signal(s) => write!(f, "Signal: {}", s),
            ExitReason::MarketClose => write!(f, "Auto-exit before market close"),
            ExitReason::Manual => write!(f, "Manual exit"),
        }
    }
}

/// Append-only record of a completed trade for the ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub id: Uuid,
    pub symbol: String,
    pub side: OptionSide,
    pub qty: u32,
    pub entry_price: f64,
    pub exit_price: f64,
    pub gross_pnl: f64,
    pub transaction_cost: f64,
    pub net_pnl: f64,
    pub percentage_change: f64,
    pub started_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub exit_reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_option_side_suffix() {
        assert_eq!(OptionSide::Call.suffix(), "CE");
        assert_eq!(OptionSide::Put.suffix(), "PE");
        assert_eq!(OptionSide::Call.opposite(), OptionSide::Put);
    }

    #[test]
    fn test_order_starts_pending() {
        let order = Order::new("24080100001".to_string(), "NIFTY25AUG24500CE".to_string(), 75, 105.5);
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.qty, 75);
    }

    #[test]
    fn test_exit_reason_display() {
        assert_eq!(
            ExitReason::StopLoss.to_string(),
            "Option price below stop loss"
        );
        assert_eq!(
            ExitReason::Signal("BUY_PUT".to_string()).to_string(),
            "Signal: BUY_PUT"
        );
    }
}
