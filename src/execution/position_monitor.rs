use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

use crate::broker::{ResilientBrokerClient, ORDER_STATUS_EXECUTED};
use crate::error::BrokerError;
use crate::models::{ExitReason, OptionSide, OrderStatus};
use crate::options::{apply_percentage, is_near_market_close};
use crate::settings::RiskSettings;
use crate::state::{PositionSnapshot, SharedTradeState};

/// Minimum spacing between order-status polling rounds
const STATUS_POLL_INTERVAL_SECS: i64 = 3;
/// Fixed base of the price-drift cancellation threshold, percent.
/// The configured `lower_percentage` is added on top.
const DRIFT_CANCEL_BASE_PCT: f64 = 3.0;
/// Minutes before market close when positions are force-flattened
pub const MARKET_CLOSE_BUFFER_MINUTES: i64 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmOutcome {
    NoPosition,
    AlreadyConfirmed,
    /// Polled too recently; nothing was checked
    Throttled,
    AllConfirmed,
    StillPending,
    /// Pending orders cancelled; at least one confirmed chunk keeps the
    /// trade alive at reduced size
    CancelledKeptConfirmed,
    /// Nothing confirmed before the deadline; position reset to flat
    CancelledFlat,
}

/// Watches an entered trade: polls pending orders toward confirmation
/// and re-prices the trailing stop-loss/take-profit as profit grows.
pub struct PositionMonitor {
    broker: Arc<ResilientBrokerClient>,
    state: SharedTradeState,
}

impl PositionMonitor {
    pub fn new(broker: Arc<ResilientBrokerClient>, state: SharedTradeState) -> Self {
        Self { broker, state }
    }

    /// Poll every pending order's status; confirm executed chunks and
    /// cancel the rest once the deadline passes or price drifts too far
    /// from entry.
    pub async fn confirm_trade(
        &self,
        cancel_after_minutes: i64,
        lower_percentage: f64,
        now: DateTime<Utc>,
    ) -> Result<ConfirmOutcome, BrokerError> {
        let (pending, buy_price, current_price, started_at) = {
            let mut state = self.state.lock();
            if state.current_position.is_none() {
                return Ok(ConfirmOutcome::NoPosition);
            }
            if state.current_trade_confirmed {
                return Ok(ConfirmOutcome::AlreadyConfirmed);
            }

            // Polled, not pushed: rate-limit the status checks
            if let Some(last) = state.last_status_check {
                if (now - last).num_seconds() < STATUS_POLL_INTERVAL_SECS {
                    return Ok(ConfirmOutcome::Throttled);
                }
            }
            state.last_status_check = Some(now);

            if state.pending_orders.is_empty() {
                state.current_trade_confirmed = true;
                return Ok(ConfirmOutcome::AllConfirmed);
            }

            (
                state.pending_orders.clone(),
                state.entry_price.unwrap_or(0.0),
                state.current_price,
                state.trade_started_at.unwrap_or(now),
            )
        };

        let mut executed = Vec::new();
        let mut still_pending = Vec::new();
        for mut order in pending {
            match self.broker.order_status(&order.broker_id).await {
                Ok(Some(status)) if status == ORDER_STATUS_EXECUTED => {
                    order.status = OrderStatus::Confirmed;
                    executed.push(order);
                }
                Ok(_) => still_pending.push(order),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    tracing::error!("[CONFIRM] status poll failed for {}: {e}", order.id);
                    still_pending.push(order);
                }
            }
        }

        {
            let mut state = self.state.lock();
            if !executed.is_empty() {
                tracing::info!("[CONFIRM] {} order(s) executed", executed.len());
                state.confirmed_orders.extend(executed);
            }
            state.pending_orders = still_pending.clone();

            if still_pending.is_empty() {
                state.current_trade_confirmed = true;
                state.trade_started_at = Some(now);
                tracing::info!("[CONFIRM] all orders confirmed");
                return Ok(ConfirmOutcome::AllConfirmed);
            }
        }

        // Cancel if the confirmation deadline passed or price drifted
        // beyond the threshold above entry.
        let change_pct = if buy_price > 0.0 {
            current_price
                .map(|p| (p - buy_price) / buy_price * 100.0)
                .unwrap_or(0.0)
        } else {
            0.0
        };
        let deadline = started_at + Duration::minutes(cancel_after_minutes);
        if now <= deadline && change_pct <= DRIFT_CANCEL_BASE_PCT + lower_percentage {
            return Ok(ConfirmOutcome::StillPending);
        }

        tracing::warn!(
            "[CONFIRM] unconfirmed past deadline or drift ({change_pct:.2}%), cancelling pending orders"
        );
        self.cancel_pending_orders().await?;

        let mut state = self.state.lock();
        if !state.confirmed_orders.is_empty() {
            // Keep the trade at the reduced, confirmed size
            state.positions_hold = state.confirmed_orders.iter().map(|o| o.qty).sum();
            state.current_trade_confirmed = true;
            tracing::info!(
                "[CONFIRM] trade kept with {} confirmed share(s)",
                state.positions_hold
            );
            Ok(ConfirmOutcome::CancelledKeptConfirmed)
        } else {
            state.reset_trade_attributes(None);
            tracing::info!("[CONFIRM] nothing confirmed, position reset to flat");
            Ok(ConfirmOutcome::CancelledFlat)
        }
    }

    /// Cancel every still-pending order at the broker. Orders whose
    /// cancel fails stay pending for the next round.
    async fn cancel_pending_orders(&self) -> Result<(), BrokerError> {
        let pending = self.state.lock().pending_orders.clone();
        let mut remaining = Vec::new();
        for order in pending {
            match self.broker.cancel_order(&order.broker_id).await {
                Ok(_) => {
                    tracing::info!("[CANCEL] cancelled order {}", order.broker_id);
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    tracing::error!("[CANCEL] failed for {}: {e}", order.broker_id);
                    remaining.push(order);
                }
            }
        }
        self.state.lock().pending_orders = remaining;
        Ok(())
    }

    /// Re-price the trailing stop-loss/take-profit on a price update.
    ///
    /// Both legs only ever move in the trade's favor; the stop-loss
    /// percentage is never decreased. Also maintains the index-level
    /// safety stop from the Supertrend line on the underlying.
    pub fn update_trailing(&self, risk: &RiskSettings) {
        let mut state = self.state.lock();
        let Some(side) = state.current_position else {
            return;
        };
        if !state.current_trade_confirmed {
            return;
        }
        let (Some(buy_price), Some(current_price)) = (state.entry_price, state.current_price)
        else {
            return;
        };
        if buy_price <= 0.0 {
            return;
        }

        let change_pct = (current_price - buy_price) / buy_price * 100.0;
        state.percentage_change = Some((change_pct * 100.0).round() / 100.0);

        // Index-level safety stop follows the Supertrend line, but only
        // in the position's favor: up for a call, down for a put.
        if let Some(st) = state
            .indicators
            .get("supertrend")
            .and_then(|series| series.last())
            .copied()
        {
            let improved = match side {
                OptionSide::Call => state.index_stop_loss.map_or(true, |cur| st > cur),
                OptionSide::Put => state.index_stop_loss.map_or(true, |cur| st < cur),
            };
            if improved {
                let prev = state.index_stop_loss;
                state.index_stop_loss = Some(st);
                tracing::info!(
                    "[{side}] index stop updated {:?} -> {st:.2}",
                    prev
                );
            }
        }

        let highest = state.highest_price.unwrap_or(buy_price);
        if current_price <= highest {
            return;
        }
        state.highest_price = Some(current_price);

        let crossed_tp = state.tp_point.map_or(false, |tp| current_price >= tp);
        if !crossed_tp || !risk.trailing_enabled {
            return;
        }

        if change_pct >= state.original_tp_percentage && change_pct <= risk.max_profit {
            // First ratchet jumps to the lock-in level; later ones step
            if state.stoploss_percentage == state.original_stoploss_percentage {
                state.stoploss_percentage = risk.trailing_first_lock;
            } else {
                state.stoploss_percentage += risk.loss_step;
            }
            state.tp_percentage += risk.profit_step;
        } else if change_pct > risk.max_profit && risk.trail_after_max_profit {
            state.stoploss_percentage += (risk.profit_step * 0.66 * 100.0).round() / 100.0;
            if state.stoploss_percentage < risk.max_profit {
                state.stoploss_percentage = state.stoploss_percentage.max(risk.max_profit - 5.0);
            }
            state.tp_percentage += risk.profit_step;
        } else {
            return;
        }

        state.stop_loss = Some(apply_percentage(buy_price, state.stoploss_percentage));
        state.tp_point = Some(apply_percentage(buy_price, state.tp_percentage));
        tracing::info!(
            "[TRAIL] sl {:.2} ({:.1}%), tp {:.2} ({:.1}%)",
            state.stop_loss.unwrap_or(0.0),
            state.stoploss_percentage,
            state.tp_point.unwrap_or(0.0),
            state.tp_percentage,
        );
    }
}

/// Price-level exit checks over an atomic snapshot.
///
/// Signal-driven exits are decided by the engine; this covers the
/// stop-loss, the static take-profit, the index safety stop and the
/// market-close flatten.
pub fn check_exit_triggers(
    snapshot: &PositionSnapshot,
    trailing_enabled: bool,
    now: DateTime<Utc>,
) -> Option<ExitReason> {
    let side = snapshot.current_position?;
    if !snapshot.current_trade_confirmed {
        return None;
    }

    if is_near_market_close(now, MARKET_CLOSE_BUFFER_MINUTES) {
        return Some(ExitReason::MarketClose);
    }

    let current = snapshot.current_price?;
    if let Some(stop) = snapshot.stop_loss {
        if current <= stop {
            return Some(ExitReason::StopLoss);
        }
    }

    // With trailing on, the take-profit ratchets away instead of
    // closing the trade; the ratcheted stop realizes the profit.
    if !trailing_enabled {
        if let Some(tp) = snapshot.tp_point {
            if current >= tp {
                return Some(ExitReason::TakeProfit);
            }
        }
    }

    if let Some(index_stop) = snapshot.index_stop_loss {
        let crossed = match side {
            OptionSide::Call => snapshot.derivative_price <= index_stop,
            OptionSide::Put => snapshot.derivative_price >= index_stop,
        };
        if snapshot.derivative_price > 0.0 && crossed {
            return Some(ExitReason::IndexStop);
        }
    }

    None
}
