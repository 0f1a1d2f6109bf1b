use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::broker::ResilientBrokerClient;
use crate::error::BrokerError;
use crate::events::{EngineEvent, EventBus};
use crate::ledger::TradeLedger;
use crate::models::{ClosedTrade, ExitReason, OptionSide, Order};
use crate::options::{calculate_shares_to_buy, option_symbol, round_to_tick};
use crate::state::SharedTradeState;

/// How many cheaper strikes to try when the balance cannot cover one lot
const MAX_LOOKBACK_ADJUSTMENTS: u32 = 10;

/// Drives order entry and exit against the broker.
///
/// Both paths are serialized by the `order_pending` single-flight guard;
/// a failed entry never leaves a ghost pending flag, and a failed exit
/// leaves the position open so a later attempt can retry.
pub struct OrderExecutor {
    broker: Arc<ResilientBrokerClient>,
    state: SharedTradeState,
    ledger: Arc<dyn TradeLedger>,
    events: EventBus,
}

impl OrderExecutor {
    pub fn new(
        broker: Arc<ResilientBrokerClient>,
        state: SharedTradeState,
        ledger: Arc<dyn TradeLedger>,
        events: EventBus,
    ) -> Self {
        Self {
            broker,
            state,
            ledger,
            events,
        }
    }

    /// Attempt to enter a CALL or PUT position.
    ///
    /// Returns Ok(false) when the entry was refused or nothing could be
    /// placed; Err only on fatal broker failure.
    pub async fn buy_option(
        &self,
        side: OptionSide,
        now: DateTime<Utc>,
    ) -> Result<bool, BrokerError> {
        // Invariant: entry is refused outright while any position is active
        {
            let state = self.state.lock();
            if let Some(current) = state.current_position {
                tracing::info!("[BUY] position already open ({current}), refusing entry");
                return Ok(false);
            }
        }

        let Some(_guard) = self.state.begin_order() else {
            tracing::warn!("[BUY] duplicate order attempt blocked by single-flight guard");
            return Ok(false);
        };

        let (resolved_symbol, cached_close, balance, lot_size, derivative, derivative_price) = {
            let state = self.state.lock();
            let symbol = match side {
                OptionSide::Call => state.call_option.clone(),
                OptionSide::Put => state.put_option.clone(),
            };
            let close = match side {
                OptionSide::Call => state.call_close,
                OptionSide::Put => state.put_close,
            };
            (
                symbol,
                close,
                state.account_balance,
                state.lot_size,
                state.derivative.clone(),
                state.derivative_price,
            )
        };

        let mut symbol = match resolved_symbol {
            Some(s) => s,
            None => option_symbol(&derivative, derivative_price, 0, 0, side, now),
        };

        // Cached tick price when fresh, live quote otherwise
        let mut price = match cached_close {
            Some(p) if p > 0.0 => p,
            _ => match self.broker.get_ltp(&symbol).await? {
                Some(p) => p,
                None => {
                    tracing::warn!("[BUY] no live price for {symbol}, aborting entry");
                    return Ok(false);
                }
            },
        };

        let mut shares = calculate_shares_to_buy(balance, price, lot_size);

        // Not even one lot affordable: relax the strike selection toward
        // cheaper contracts, bounded.
        if shares < lot_size {
            match self
                .adjust_lookback(side, balance, lot_size, &derivative, now)
                .await?
            {
                Some((adjusted_symbol, adjusted_price, adjusted_shares)) => {
                    symbol = adjusted_symbol;
                    price = adjusted_price;
                    shares = adjusted_shares;
                }
                None => {
                    tracing::warn!("[BUY] insufficient balance even after adjusting strikes");
                    self.events.publish(EngineEvent::EntryBlocked {
                        reason: "insufficient balance for one lot".to_string(),
                    });
                    return Ok(false);
                }
            }
        }

        let limit_price = round_to_tick(price);
        let orders = self.place_orders(&symbol, shares, limit_price).await?;
        if orders.is_empty() {
            tracing::error!("[BUY] no orders placed for {symbol}");
            return Ok(false);
        }

        let placed_qty: u32 = orders.iter().map(|o| o.qty).sum();
        {
            let mut state = self.state.lock();
            match side {
                OptionSide::Call => state.call_option = Some(symbol.clone()),
                OptionSide::Put => state.put_option = Some(symbol.clone()),
            }
            state.record_entry(side, symbol.clone(), limit_price, placed_qty, orders, now);
        }

        tracing::info!(
            "[BUY] entered {side} {symbol}: {placed_qty} @ {limit_price:.2}"
        );
        Ok(true)
    }

    /// Walk the lookback offset toward cheaper strikes until one lot
    /// becomes affordable, re-pricing each candidate.
    async fn adjust_lookback(
        &self,
        side: OptionSide,
        balance: f64,
        lot_size: u32,
        derivative: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<(String, f64, u32)>, BrokerError> {
        for _ in 0..MAX_LOOKBACK_ADJUSTMENTS {
            let (lookback, derivative_price) = {
                let mut state = self.state.lock();
                let lookback = match side {
                    OptionSide::Call => {
                        state.call_lookback += 1;
                        state.call_lookback
                    }
                    OptionSide::Put => {
                        state.put_lookback += 1;
                        state.put_lookback
                    }
                };
                (lookback, state.derivative_price)
            };

            let candidate = option_symbol(derivative, derivative_price, lookback, 0, side, now);
            let price = match self.broker.get_ltp(&candidate).await? {
                Some(p) if p > 0.0 => p,
                _ => {
                    tracing::warn!("[ADJUST] no price for candidate {candidate}");
                    continue;
                }
            };

            let shares = calculate_shares_to_buy(balance, price, lot_size);
            tracing::debug!(
                "[ADJUST] lookback {lookback}: {candidate} @ {price:.2} -> {shares} shares"
            );
            if shares >= lot_size {
                return Ok(Some((candidate, price, shares)));
            }
        }
        Ok(None)
    }

    /// Place the order split into broker-enforced chunks, the remainder
    /// as a final smaller order. Each placed chunk becomes one Pending
    /// Order; chunks that fail to place are skipped.
    async fn place_orders(
        &self,
        symbol: &str,
        shares: u32,
        price: f64,
    ) -> Result<Vec<Order>, BrokerError> {
        let max_qty = self.state.lock().max_order_qty;
        let mut orders = Vec::new();

        for qty in chunk_shares(shares, max_qty) {
            match self.broker.place_limit_buy(symbol, qty, price).await {
                Ok(Some(broker_id)) => {
                    tracing::debug!("[BUY] placed chunk {qty} as order {broker_id}");
                    orders.push(Order::new(broker_id, symbol.to_string(), qty, price));
                }
                Ok(None) => {
                    tracing::warn!("[BUY] broker returned no order id for chunk of {qty}");
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    tracing::error!("[BUY] failed to place chunk of {qty}: {e}");
                }
            }
        }
        Ok(orders)
    }

    /// Gracefully exit the current position: sell every confirmed
    /// order, cancel every still-pending one, record the closed trade,
    /// refresh the balance and reset state to flat.
    pub async fn exit_position(
        &self,
        reason: ExitReason,
        now: DateTime<Utc>,
    ) -> Result<Option<ClosedTrade>, BrokerError> {
        let (side, symbol, sell_price, entry_price, started_at, confirmed, pending) = {
            let state = self.state.lock();
            let Some(side) = state.current_position else {
                tracing::warn!("[EXIT] not in a position, nothing to exit");
                return Ok(None);
            };
            let Some(sell_price) = state.current_price else {
                tracing::warn!("[EXIT] current price unavailable, cannot exit");
                return Ok(None);
            };
            (
                side,
                state.trading_symbol.clone().unwrap_or_default(),
                sell_price,
                state.entry_price.unwrap_or(sell_price),
                state.trade_started_at.unwrap_or(now),
                state.confirmed_orders.clone(),
                state.pending_orders.clone(),
            )
        };

        let Some(_guard) = self.state.begin_order() else {
            tracing::warn!("[EXIT] order already pending, exit deferred");
            return Ok(None);
        };

        let mut sold_qty: u32 = 0;
        let mut gross_pnl = 0.0;
        let mut sell_failures = 0u32;

        for order in &confirmed {
            match self.broker.sell_at_market(&order.symbol, order.qty).await {
                Ok(Some(_)) => {
                    sold_qty += order.qty;
                    gross_pnl += (sell_price - order.price) * order.qty as f64;
                    tracing::info!(
                        "[EXIT] sold {} of {} at {:.2}",
                        order.qty,
                        order.symbol,
                        sell_price
                    );
                }
                Ok(None) => sell_failures += 1,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    sell_failures += 1;
                    tracing::error!("[EXIT] failed to sell order {}: {e}", order.id);
                }
            }
        }

        if !confirmed.is_empty() && sold_qty == 0 {
            // Nothing got out; keep the position open so a later exit
            // attempt can retry.
            tracing::error!("[EXIT] all sell legs failed, position stays open");
            return Ok(None);
        }

        for order in &pending {
            if let Err(e) = self.broker.cancel_order(&order.broker_id).await {
                if e.is_fatal() {
                    return Err(e);
                }
                tracing::error!("[EXIT] failed to cancel order {}: {e}", order.id);
            }
        }

        let cost = transaction_cost(sold_qty, entry_price, sell_price);
        let net_pnl = gross_pnl - cost;
        let percentage_change = if entry_price > 0.0 {
            (sell_price - entry_price) / entry_price * 100.0
        } else {
            0.0
        };

        let trade = ClosedTrade {
            id: Uuid::new_v4(),
            symbol: symbol.clone(),
            side,
            qty: sold_qty,
            entry_price,
            exit_price: sell_price,
            gross_pnl,
            transaction_cost: cost,
            net_pnl,
            percentage_change,
            started_at,
            closed_at: now,
            exit_reason: reason.to_string(),
        };

        if sold_qty > 0 {
            self.ledger.append(&trade).await;
            self.events.publish(EngineEvent::TradeClosed(trade.clone()));
        }
        if sell_failures > 0 {
            tracing::warn!("[EXIT] {sell_failures} sell leg(s) failed and were skipped");
        }

        // Refresh balance from the broker; a transient failure here must
        // not undo the completed exit.
        match self.broker.get_balance(0.0).await {
            Ok(balance) => self.state.lock().account_balance = balance,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => tracing::error!("[EXIT] balance refresh failed: {e}"),
        }

        self.state.lock().reset_trade_attributes(Some(side));
        tracing::info!(
            "[EXIT] closed {side} {symbol}: net {net_pnl:.2} ({})",
            trade.exit_reason
        );
        Ok(Some(trade))
    }
}

/// Total cost of a complete buy-sell option round trip: brokerage both
/// legs, STT on the sell leg, exchange and SEBI charges on both,
/// stamp duty on the buy leg, GST on the taxable components.
pub fn transaction_cost(quantity: u32, buy_price: f64, sell_price: f64) -> f64 {
    if quantity == 0 || buy_price <= 0.0 || sell_price <= 0.0 {
        return 0.0;
    }

    const BROKERAGE_PER_ORDER: f64 = 20.0;
    const STT_RATE: f64 = 0.0125 / 100.0; // sell side only
    const EXCHANGE_RATE: f64 = 0.0495 / 100.0;
    const SEBI_RATE: f64 = 0.0001 / 100.0;
    const STAMP_DUTY_RATE: f64 = 0.003 / 100.0; // buy side only
    const GST_RATE: f64 = 18.0 / 100.0;

    let qty = quantity as f64;
    let buy_turnover = qty * buy_price;
    let sell_turnover = qty * sell_price;

    let buy_exchange = buy_turnover * EXCHANGE_RATE;
    let buy_sebi = buy_turnover * SEBI_RATE;
    let buy_stamp = buy_turnover * STAMP_DUTY_RATE;
    let buy_gst = (BROKERAGE_PER_ORDER + buy_exchange + buy_sebi) * GST_RATE;
    let buy_total = BROKERAGE_PER_ORDER + buy_exchange + buy_sebi + buy_stamp + buy_gst;

    let sell_stt = sell_turnover * STT_RATE;
    let sell_exchange = sell_turnover * EXCHANGE_RATE;
    let sell_sebi = sell_turnover * SEBI_RATE;
    let sell_gst = (BROKERAGE_PER_ORDER + sell_exchange + sell_sebi) * GST_RATE;
    let sell_total = BROKERAGE_PER_ORDER + sell_stt + sell_exchange + sell_sebi + sell_gst;

    let total = buy_total + sell_total;
    (total * 100.0).round() / 100.0
}

/// Split a share count into broker-sized chunks, remainder last
pub fn chunk_shares(shares: u32, max_qty: u32) -> Vec<u32> {
    let max_qty = max_qty.max(1);
    let mut chunks = vec![max_qty; (shares / max_qty) as usize];
    if shares % max_qty > 0 {
        chunks.push(shares % max_qty);
    }
    chunks
}
