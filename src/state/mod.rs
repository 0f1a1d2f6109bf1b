use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::models::{ExitReason, OptionSide, Order};
use crate::options::apply_percentage;
use crate::settings::Settings;

/// Central container for all mutable trading state.
///
/// Owned collectively by the engine: the feed task writes prices on
/// every tick, the worker cycle reads and writes position state, and
/// status consumers read snapshots. One mutex guards every field; no
/// other lock may be acquired while holding it.
#[derive(Debug)]
pub struct TradeState {
    // Session / identity
    pub token: Option<String>,
    pub derivative: String,
    pub all_symbols: Vec<String>,

    // Market snapshot (hot path, written on every tick)
    pub derivative_price: f64,
    pub call_close: Option<f64>,
    pub put_close: Option<f64>,
    pub last_tick_at: Option<DateTime<Utc>>,
    /// Derived indicator outputs keyed by indicator name
    pub indicators: HashMap<String, Vec<f64>>,

    // Instruments
    pub call_option: Option<String>,
    pub put_option: Option<String>,
    pub trading_symbol: Option<String>,

    // Position
    pub current_position: Option<OptionSide>,
    pub previous_position: Option<OptionSide>,
    pub entry_price: Option<f64>,
    pub current_price: Option<f64>,
    pub highest_price: Option<f64>,
    pub positions_hold: u32,

    // Order bookkeeping
    pub pending_orders: Vec<Order>,
    pub confirmed_orders: Vec<Order>,

    // Risk levels. Percentages are signed relative to entry and ratchet
    // while trailing; the originals are restored on each reset.
    pub tp_percentage: f64,
    pub stoploss_percentage: f64,
    pub original_tp_percentage: f64,
    pub original_stoploss_percentage: f64,
    pub stop_loss: Option<f64>,
    pub tp_point: Option<f64>,
    pub index_stop_loss: Option<f64>,
    pub percentage_change: Option<f64>,

    // Lifecycle flags
    pub order_pending: bool,
    pub current_trade_confirmed: bool,
    pub trade_started_at: Option<DateTime<Utc>>,
    pub last_status_check: Option<DateTime<Utc>>,
    pub reason_to_exit: Option<ExitReason>,

    // Session parameters mirrored from settings (live-reloadable)
    pub account_balance: f64,
    pub lot_size: u32,
    pub max_order_qty: u32,
    pub call_lookback: i32,
    pub put_lookback: i32,
    pub original_call_lookback: i32,
    pub original_put_lookback: i32,
}

/// Atomic view of everything an entry/exit decision needs, taken in a
/// single lock acquisition to avoid torn reads.
#[derive(Debug, Clone)]
pub struct PositionSnapshot {
    pub current_position: Option<OptionSide>,
    pub entry_price: Option<f64>,
    pub current_price: Option<f64>,
    pub highest_price: Option<f64>,
    pub stop_loss: Option<f64>,
    pub tp_point: Option<f64>,
    pub index_stop_loss: Option<f64>,
    pub derivative_price: f64,
    pub current_trade_confirmed: bool,
    pub order_pending: bool,
    pub trade_started_at: Option<DateTime<Utc>>,
}

impl TradeState {
    fn new(settings: &Settings) -> Self {
        Self {
            token: None,
            derivative: settings.derivative.clone(),
            all_symbols: Vec::new(),
            derivative_price: 0.0,
            call_close: None,
            put_close: None,
            last_tick_at: None,
            indicators: HashMap::new(),
            call_option: None,
            put_option: None,
            trading_symbol: None,
            current_position: None,
            previous_position: None,
            entry_price: None,
            current_price: None,
            highest_price: None,
            positions_hold: 0,
            pending_orders: Vec::new(),
            confirmed_orders: Vec::new(),
            tp_percentage: settings.risk.tp_percentage,
            stoploss_percentage: settings.risk.stoploss_percentage,
            original_tp_percentage: settings.risk.tp_percentage,
            original_stoploss_percentage: settings.risk.stoploss_percentage,
            stop_loss: None,
            tp_point: None,
            index_stop_loss: None,
            percentage_change: None,
            order_pending: false,
            current_trade_confirmed: false,
            trade_started_at: None,
            last_status_check: None,
            reason_to_exit: None,
            account_balance: 0.0,
            lot_size: settings.lot_size,
            max_order_qty: settings.max_order_qty,
            call_lookback: settings.call_lookback,
            put_lookback: settings.put_lookback,
            original_call_lookback: settings.call_lookback,
            original_put_lookback: settings.put_lookback,
        }
    }

    /// Record entry metadata after orders are placed
    pub fn record_entry(
        &mut self,
        side: OptionSide,
        symbol: String,
        price: f64,
        shares: u32,
        orders: Vec<Order>,
        now: DateTime<Utc>,
    ) {
        self.pending_orders = orders;
        self.confirmed_orders.clear();
        self.current_position = Some(side);
        self.trading_symbol = Some(symbol);
        self.entry_price = Some(price);
        self.current_price = Some(price);
        self.highest_price = Some(price);
        self.positions_hold = shares;
        self.trade_started_at = Some(now);
        self.current_trade_confirmed = false;
        self.percentage_change = Some(0.0);
        self.tp_point = Some(apply_percentage(price, self.tp_percentage));
        self.stop_loss = Some(apply_percentage(price, self.stoploss_percentage));
    }

    /// Reset every per-trade field, remembering the just-closed side.
    /// Risk percentages and lookbacks return to their configured values.
    pub fn reset_trade_attributes(&mut self, previous: Option<OptionSide>) {
        self.previous_position = previous;
        self.current_position = None;
        self.trading_symbol = None;
        self.entry_price = None;
        self.current_price = None;
        self.highest_price = None;
        self.positions_hold = 0;
        self.pending_orders.clear();
        self.confirmed_orders.clear();
        self.stop_loss = None;
        self.tp_point = None;
        self.index_stop_loss = None;
        self.percentage_change = None;
        self.current_trade_confirmed = false;
        self.trade_started_at = None;
        self.last_status_check = None;
        self.reason_to_exit = None;
        self.tp_percentage = self.original_tp_percentage;
        self.stoploss_percentage = self.original_stoploss_percentage;
        self.call_lookback = self.original_call_lookback;
        self.put_lookback = self.original_put_lookback;
    }

    pub fn position_snapshot(&self) -> PositionSnapshot {
        PositionSnapshot {
            current_position: self.current_position,
            entry_price: self.entry_price,
            current_price: self.current_price,
            highest_price: self.highest_price,
            stop_loss: self.stop_loss,
            tp_point: self.tp_point,
            index_stop_loss: self.index_stop_loss,
            derivative_price: self.derivative_price,
            current_trade_confirmed: self.current_trade_confirmed,
            order_pending: self.order_pending,
            trade_started_at: self.trade_started_at,
        }
    }
}

/// Handle to the shared trade state. Cheap to clone; all clones guard
/// the same record.
#[derive(Clone)]
pub struct SharedTradeState {
    inner: Arc<Mutex<TradeState>>,
}

impl SharedTradeState {
    pub fn new(settings: &Settings) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TradeState::new(settings))),
        }
    }

    /// Acquire the state lock. Poisoning is not propagated: the state
    /// stays usable after a panicked holder.
    pub fn lock(&self) -> MutexGuard<'_, TradeState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Batch price update for the hot tick path: one lock acquisition
    pub fn update_tick_prices(
        &self,
        derivative_price: Option<f64>,
        call_close: Option<f64>,
        put_close: Option<f64>,
        at: DateTime<Utc>,
    ) {
        let mut state = self.lock();
        if let Some(p) = derivative_price {
            state.derivative_price = p;
        }
        if call_close.is_some() {
            state.call_close = call_close;
        }
        if put_close.is_some() {
            state.put_close = put_close;
        }
        if let Some(side) = state.current_position {
            state.current_price = match side {
                OptionSide::Call => state.call_close,
                OptionSide::Put => state.put_close,
            }
            .or(state.current_price);
        }
        state.last_tick_at = Some(at);
    }

    /// Claim the single-flight order guard.
    ///
    /// Returns None while another entry/exit is in flight. The flag is
    /// cleared when the guard drops, so no failure path can leak it.
    pub fn begin_order(&self) -> Option<OrderGuard> {
        let mut state = self.lock();
        if state.order_pending {
            return None;
        }
        state.order_pending = true;
        Some(OrderGuard {
            state: self.clone(),
        })
    }

    /// Apply a fresh settings snapshot without touching the connection.
    /// Per-trade risk percentages are only replaced while flat so an
    /// open trade's ratchet is never disturbed.
    pub fn apply_settings(&self, settings: &Settings) {
        let mut state = self.lock();
        state.lot_size = settings.lot_size;
        state.max_order_qty = settings.max_order_qty;
        state.original_call_lookback = settings.call_lookback;
        state.original_put_lookback = settings.put_lookback;
        state.original_tp_percentage = settings.risk.tp_percentage;
        state.original_stoploss_percentage = settings.risk.stoploss_percentage;
        if state.current_position.is_none() {
            state.call_lookback = settings.call_lookback;
            state.put_lookback = settings.put_lookback;
            state.tp_percentage = settings.risk.tp_percentage;
            state.stoploss_percentage = settings.risk.stoploss_percentage;
        }
    }
}

/// RAII guard for the `order_pending` single-flight flag
pub struct OrderGuard {
    state: SharedTradeState,
}

impl Drop for OrderGuard {
    fn drop(&mut self) {
        self.state.lock().order_pending = false;
    }
}
