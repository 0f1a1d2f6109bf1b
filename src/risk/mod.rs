// Session risk limits module
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

use crate::options::exchange_offset;

/// Hard session limits that block new entries when breached
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLimits {
    /// Most negative acceptable daily P&L (e.g. -5000.0)
    pub max_daily_loss: f64,
    pub max_trades_per_day: u32,
    pub max_consecutive_losses: u32,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_daily_loss: -5000.0,
            max_trades_per_day: 10,
            max_consecutive_losses: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RiskTrip {
    DailyLoss,
    DailyTradeLimit,
    ConsecutiveLosses,
}

impl std::fmt::Display for RiskTrip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskTrip::DailyLoss => write!(f, "daily loss limit hit"),
            RiskTrip::DailyTradeLimit => write!(f, "max trades per day reached"),
            RiskTrip::ConsecutiveLosses => write!(f, "too many consecutive losses"),
        }
    }
}

/// Rolling per-day trading tallies. Day boundaries follow the exchange
/// calendar, not UTC.
#[derive(Debug, Clone)]
pub struct RiskState {
    pub daily_pnl: f64,
    pub daily_trades: u32,
    pub consecutive_losses: u32,
    last_reset_day: i32,
}

impl RiskState {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            daily_pnl: 0.0,
            daily_trades: 0,
            consecutive_losses: 0,
            last_reset_day: exchange_day(now),
        }
    }

    /// Record one closed trade
    pub fn record_trade(&mut self, net_pnl: f64, now: DateTime<Utc>) {
        self.roll_day(now);
        self.daily_pnl += net_pnl;
        self.daily_trades += 1;
        if net_pnl < 0.0 {
            self.consecutive_losses += 1;
        } else {
            self.consecutive_losses = 0;
        }
    }

    fn roll_day(&mut self, now: DateTime<Utc>) {
        let today = exchange_day(now);
        if today != self.last_reset_day {
            self.daily_pnl = 0.0;
            self.daily_trades = 0;
            self.last_reset_day = today;
        }
    }
}

fn exchange_day(now: DateTime<Utc>) -> i32 {
    now.with_timezone(&exchange_offset()).ordinal() as i32
}

impl RiskLimits {
    /// Check whether a new entry is allowed right now
    pub fn check(&self, state: &mut RiskState, now: DateTime<Utc>) -> Result<(), RiskTrip> {
        state.roll_day(now);

        if state.daily_pnl <= self.max_daily_loss {
            return Err(RiskTrip::DailyLoss);
        }
        if state.daily_trades >= self.max_trades_per_day {
            return Err(RiskTrip::DailyTradeLimit);
        }
        if state.consecutive_losses >= self.max_consecutive_losses {
            return Err(RiskTrip::ConsecutiveLosses);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_daily_loss_blocks_entry() {
        let limits = RiskLimits::default();
        let now = Utc::now();
        let mut state = RiskState::new(now);

        state.record_trade(-6000.0, now);
        assert_eq!(limits.check(&mut state, now), Err(RiskTrip::DailyLoss));
    }

    #[test]
    fn test_trade_count_blocks_entry() {
        let limits = RiskLimits {
            max_trades_per_day: 2,
            ..Default::default()
        };
        let now = Utc::now();
        let mut state = RiskState::new(now);

        state.record_trade(100.0, now);
        state.record_trade(100.0, now);
        assert_eq!(limits.check(&mut state, now), Err(RiskTrip::DailyTradeLimit));
    }

    #[test]
    fn test_consecutive_losses_block_and_reset_on_win() {
        let limits = RiskLimits {
            max_consecutive_losses: 2,
            ..Default::default()
        };
        let now = Utc::now();
        let mut state = RiskState::new(now);

        state.record_trade(-10.0, now);
        state.record_trade(-10.0, now);
        assert_eq!(
            limits.check(&mut state, now),
            Err(RiskTrip::ConsecutiveLosses)
        );

        state.record_trade(50.0, now);
        assert_eq!(state.consecutive_losses, 0);
    }

    #[test]
    fn test_tallies_reset_across_days() {
        let limits = RiskLimits::default();
        let day1 = Utc::now();
        let day2 = day1 + Duration::days(1);
        let mut state = RiskState::new(day1);

        state.record_trade(-6000.0, day1);
        assert!(limits.check(&mut state, day1).is_err());

        // Next exchange day starts clean
        assert!(limits.check(&mut state, day2).is_ok());
        assert_eq!(state.daily_pnl, 0.0);
        assert_eq!(state.daily_trades, 0);
    }

    #[test]
    fn test_healthy_state_allows_entry() {
        let limits = RiskLimits::default();
        let now = Utc::now();
        let mut state = RiskState::new(now);
        assert!(limits.check(&mut state, now).is_ok());
    }
}
