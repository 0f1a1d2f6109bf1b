use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::broker::ResilientBrokerClient;
use crate::candles::CandleStore;
use crate::error::BrokerError;
use crate::events::{EngineEvent, EventBus};
use crate::execution::position_monitor::MARKET_CLOSE_BUFFER_MINUTES;
use crate::execution::{check_exit_triggers, OrderExecutor, PositionMonitor};
use crate::feed::ConnectionSupervisor;
use crate::indicators::calculate_supertrend;
use crate::ledger::TradeLedger;
use crate::models::{ExitReason, OptionSide, Tick};
use crate::options::{
    in_sideways_window, is_market_open, is_near_market_close, option_symbol, wire_symbol,
};
use crate::risk::{RiskLimits, RiskState};
use crate::settings::Settings;
use crate::state::SharedTradeState;
use crate::strategy::{OptionSignal, Strategy};
use crate::trend::TimeframeFilter;

/// 1-minute bars kept per symbol (a few trading days)
const STORE_MAX_BARS: usize = 3000;
const HISTORY_FETCH_DAYS: i64 = 10;
const SUPERTREND_PERIOD: usize = 10;
const SUPERTREND_MULTIPLIER: f64 = 3.0;

/// The live trading engine.
///
/// Tick handling is split in two: a fast in-lock state update on the
/// feed path (stage 1), then a single in-flight worker cycle for the
/// slow work (stage 2): trend evaluation, order decisions, broker I/O.
/// Newer ticks simply coalesce into the next cycle; no backlog
/// accumulates.
pub struct TradingEngine {
    settings: RwLock<Settings>,
    state: SharedTradeState,
    broker: Arc<ResilientBrokerClient>,
    store: CandleStore,
    trend_filter: TimeframeFilter,
    strategy: Arc<dyn Strategy>,
    executor: OrderExecutor,
    monitor: PositionMonitor,
    risk_limits: RwLock<RiskLimits>,
    risk_state: Mutex<RiskState>,
    supervisor: Arc<ConnectionSupervisor>,
    events: EventBus,
    cycle_in_flight: AtomicBool,
    history_in_flight: AtomicBool,
    should_stop: AtomicBool,
    last_signal: Mutex<OptionSignal>,
}

impl TradingEngine {
    pub fn new(
        settings: Settings,
        broker: Arc<ResilientBrokerClient>,
        supervisor: Arc<ConnectionSupervisor>,
        strategy: Arc<dyn Strategy>,
        ledger: Arc<dyn TradeLedger>,
        events: EventBus,
    ) -> Arc<Self> {
        let state = SharedTradeState::new(&settings);
        let store = CandleStore::new(STORE_MAX_BARS);
        let trend_filter = TimeframeFilter::new(
            Some(broker.clone()),
            store.clone(),
            settings.mtf_cache_ttl_secs,
            settings.mtf_required_agreement,
        );
        let executor = OrderExecutor::new(broker.clone(), state.clone(), ledger, events.clone());
        let monitor = PositionMonitor::new(broker.clone(), state.clone());
        let risk_limits = RiskLimits {
            max_daily_loss: settings.risk.max_daily_loss,
            max_trades_per_day: settings.risk.max_trades_per_day,
            max_consecutive_losses: settings.risk.max_consecutive_losses,
        };

        Arc::new(Self {
            settings: RwLock::new(settings),
            state,
            broker,
            store,
            trend_filter,
            strategy,
            executor,
            monitor,
            risk_limits: RwLock::new(risk_limits),
            risk_state: Mutex::new(RiskState::new(Utc::now())),
            supervisor,
            events,
            cycle_in_flight: AtomicBool::new(false),
            history_in_flight: AtomicBool::new(false),
            should_stop: AtomicBool::new(false),
            last_signal: Mutex::new(OptionSignal::Hold),
        })
    }

    pub fn state(&self) -> &SharedTradeState {
        &self.state
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    fn settings_snapshot(&self) -> Settings {
        self.settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Bootstrap the session: install the token, pull the balance,
    /// resolve the ATM option symbols and bring up the market-data
    /// stream.
    pub async fn start(&self) -> Result<(), BrokerError> {
        let settings = self.settings_snapshot();
        let now = Utc::now();

        match std::fs::read_to_string(&settings.broker.token_file) {
            Ok(raw) => {
                let token = raw.trim().to_string();
                if token.is_empty() {
                    warn!("token file {} is empty", settings.broker.token_file);
                } else {
                    self.broker.set_token(Some(token.clone()));
                    self.state.lock().token = Some(token);
                }
            }
            Err(e) => warn!(
                "could not read token file {}: {e}",
                settings.broker.token_file
            ),
        }

        match self.broker.get_balance(settings.capital_reserve).await {
            Ok(balance) => {
                info!("account balance: {balance:.2}");
                self.state.lock().account_balance = balance;
            }
            Err(e) if e.is_fatal() => {
                self.handle_token_expired();
                return Err(e);
            }
            Err(e) => warn!("initial balance fetch failed: {e}"),
        }

        match self.broker.get_ltp(&settings.derivative).await {
            Ok(Some(spot)) => {
                info!("initial {} price: {spot:.2}", settings.derivative);
                let mut state = self.state.lock();
                state.derivative_price = spot;
                state.call_option = Some(option_symbol(
                    &settings.derivative,
                    spot,
                    settings.call_lookback,
                    settings.expiry_offset,
                    OptionSide::Call,
                    now,
                ));
                state.put_option = Some(option_symbol(
                    &settings.derivative,
                    spot,
                    settings.put_lookback,
                    settings.expiry_offset,
                    OptionSide::Put,
                    now,
                ));
            }
            Ok(None) => warn!("no initial price for {}", settings.derivative),
            Err(e) if e.is_fatal() => {
                self.handle_token_expired();
                return Err(e);
            }
            Err(e) => warn!("initial price fetch failed: {e}"),
        }

        let symbols = self.subscription_symbols();
        info!("subscribing {} symbols", symbols.len());
        self.supervisor.set_symbols(symbols);
        self.supervisor.clone().connect();
        Ok(())
    }

    fn subscription_symbols(&self) -> Vec<String> {
        let mut state = self.state.lock();
        let mut symbols = vec![state.derivative.clone()];
        symbols.extend(state.call_option.clone());
        symbols.extend(state.put_option.clone());
        state.all_symbols = symbols.clone();
        symbols
    }

    /// Consume the tick stream until stopped
    pub async fn run(self: Arc<Self>, mut tick_rx: mpsc::Receiver<Tick>) {
        info!("trading engine running");
        loop {
            if self.should_stop.load(Ordering::SeqCst) {
                break;
            }
            tokio::select! {
                maybe_tick = tick_rx.recv() => {
                    match maybe_tick {
                        Some(tick) => Self::on_tick(&self, tick),
                        None => break,
                    }
                }
                _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => {}
            }
        }
        info!("trading engine stopped");
    }

    /// Cooperative stop: the in-flight cycle finishes, no new cycles
    /// start, then the connection is torn down.
    pub fn stop(&self) {
        info!("engine stop requested");
        self.should_stop.store(true, Ordering::SeqCst);
        self.supervisor.disconnect();
    }

    /// Live settings reload: trading parameters apply immediately, the
    /// connection is left untouched.
    pub fn refresh_settings(&self, fresh: Settings) {
        info!("applying refreshed settings");
        self.state.apply_settings(&fresh);
        *self.risk_limits.write().unwrap_or_else(|e| e.into_inner()) = RiskLimits {
            max_daily_loss: fresh.risk.max_daily_loss,
            max_trades_per_day: fresh.risk.max_trades_per_day,
            max_consecutive_losses: fresh.risk.max_consecutive_losses,
        };
        *self.settings.write().unwrap_or_else(|e| e.into_inner()) = fresh;
        self.trend_filter.invalidate();
    }

    /// Stage 1: fast in-lock market-state update on the feed path
    fn on_tick(this: &Arc<Self>, tick: Tick) {
        let (derivative, derivative_wire, call_wire, put_wire, has_position) = {
            let state = this.state.lock();
            (
                state.derivative.clone(),
                wire_symbol(&state.derivative),
                state.call_option.as_deref().map(wire_symbol),
                state.put_option.as_deref().map(wire_symbol),
                state.current_position.is_some(),
            )
        };

        if tick.symbol == derivative_wire {
            this.store.push_tick(&derivative, tick.ltp, tick.timestamp);
            this.state
                .update_tick_prices(Some(tick.ltp), None, None, tick.timestamp);
        } else {
            // For options, value the position at the ask while holding
            // (exit side) and the bid while flat (entry side).
            let close = if has_position {
                tick.ask.or(Some(tick.ltp))
            } else {
                tick.bid.or(Some(tick.ltp))
            };
            if Some(tick.symbol.as_str()) == call_wire.as_deref() {
                this.state
                    .update_tick_prices(None, close, None, tick.timestamp);
            } else if Some(tick.symbol.as_str()) == put_wire.as_deref() {
                this.state
                    .update_tick_prices(None, None, close, tick.timestamp);
            } else {
                debug!("tick for untracked symbol {}", tick.symbol);
                return;
            }
        }

        Self::spawn_cycle(this);
    }

    /// Stage 2 handoff: at most one slow-processing cycle runs at a
    /// time; ticks arriving meanwhile are picked up by the next cycle.
    fn spawn_cycle(this: &Arc<Self>) {
        if this.should_stop.load(Ordering::SeqCst) {
            return;
        }
        if this.cycle_in_flight.swap(true, Ordering::SeqCst) {
            return;
        }

        let this = this.clone();
        tokio::spawn(async move {
            let outcome = Self::process_cycle(&this, Utc::now()).await;
            this.cycle_in_flight.store(false, Ordering::SeqCst);
            if let Err(e) = outcome {
                if e.is_fatal() {
                    this.handle_token_expired();
                } else {
                    error!("cycle failed: {e}");
                }
            }
        });
    }

    /// One slow-processing cycle: confirmation/trailing upkeep, history
    /// refresh, then the exit/entry decision.
    pub async fn process_cycle(this: &Arc<Self>, now: DateTime<Utc>) -> Result<(), BrokerError> {
        if this.should_stop.load(Ordering::SeqCst) {
            return Ok(());
        }
        let settings = this.settings_snapshot();

        let (has_position, confirmed) = {
            let state = this.state.lock();
            (
                state.current_position.is_some(),
                state.current_trade_confirmed,
            )
        };

        if has_position && !confirmed {
            this.monitor
                .confirm_trade(settings.cancel_after_minutes, settings.lower_percentage, now)
                .await?;
        } else if has_position {
            this.monitor.update_trailing(&settings.risk);
        }

        Self::refresh_history_if_stale(this, now);

        this.decide_exit(&settings, now).await?;
        this.decide_entry(&settings, now).await?;
        Ok(())
    }

    async fn decide_exit(
        &self,
        settings: &Settings,
        now: DateTime<Utc>,
    ) -> Result<(), BrokerError> {
        let snapshot = self.state.lock().position_snapshot();
        let Some(side) = snapshot.current_position else {
            return Ok(());
        };
        if !snapshot.current_trade_confirmed {
            return Ok(());
        }

        let signal = *self.last_signal.lock().unwrap_or_else(|e| e.into_inner());
        let opposite_signal = matches!(
            (side, signal),
            (OptionSide::Call, OptionSignal::BuyPut) | (OptionSide::Put, OptionSignal::BuyCall)
        );

        let reason = if opposite_signal {
            Some(ExitReason::Signal(signal.to_string()))
        } else {
            check_exit_triggers(&snapshot, settings.risk.trailing_enabled, now)
        };

        if let Some(reason) = reason {
            info!("[{side}] exit trigger: {reason}");
            self.state.lock().reason_to_exit = Some(reason.clone());
            if let Some(trade) = self.executor.exit_position(reason, now).await? {
                self.risk_state
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .record_trade(trade.net_pnl, now);
            }
        }
        Ok(())
    }

    async fn decide_entry(
        &self,
        settings: &Settings,
        now: DateTime<Utc>,
    ) -> Result<(), BrokerError> {
        let snapshot = self.state.lock().position_snapshot();
        if snapshot.current_position.is_some() || snapshot.order_pending {
            return Ok(());
        }

        let signal = *self.last_signal.lock().unwrap_or_else(|e| e.into_inner());
        let side = match signal {
            OptionSignal::BuyCall => OptionSide::Call,
            OptionSignal::BuyPut => OptionSide::Put,
            OptionSignal::Hold => return Ok(()),
        };

        // A finished trade blocks same-direction re-entry until an
        // opposite signal clears the flag.
        {
            let mut state = self.state.lock();
            if let Some(previous) = state.previous_position {
                if previous != side {
                    info!("opposite signal clears previous {previous} trade flag");
                    state.previous_position = None;
                }
                return Ok(());
            }
        }

        if !is_market_open(now) {
            debug!("market closed, skipping entry");
            return Ok(());
        }
        if in_sideways_window(now) && !settings.sideway_zone_trade {
            debug!("sideways window, skipping entry");
            return Ok(());
        }
        if is_near_market_close(now, MARKET_CLOSE_BUFFER_MINUTES) {
            debug!("too close to market close, skipping entry");
            return Ok(());
        }

        {
            let limits = self
                .risk_limits
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
            let mut risk_state = self.risk_state.lock().unwrap_or_else(|e| e.into_inner());
            if let Err(trip) = limits.check(&mut risk_state, now) {
                warn!("entry blocked: {trip}");
                self.events.publish(EngineEvent::EntryBlocked {
                    reason: trip.to_string(),
                });
                return Ok(());
            }
        }

        if settings.use_mtf_filter {
            let (allowed, summary) = self
                .trend_filter
                .confirm_entry(&settings.derivative, side)
                .await;
            self.events.publish(EngineEvent::SignalDecision {
                side,
                allowed,
                summary: summary.clone(),
            });
            if !allowed {
                info!("entry blocked by timeframe confirmation: {summary}");
                return Ok(());
            }
        }

        if self.executor.buy_option(side, now).await? {
            // Make sure the (possibly adjusted) traded symbol is on the
            // next subscription set.
            self.supervisor.set_symbols(self.subscription_symbols());
        }
        Ok(())
    }

    /// Kick off a background history refresh when the stored base
    /// series has fallen behind the configured interval.
    fn refresh_history_if_stale(this: &Arc<Self>, now: DateTime<Utc>) {
        let settings = this.settings_snapshot();
        let last = this.store.last_bar_time(&settings.derivative);
        let stale = last
            .map(|t| now - t >= chrono::Duration::minutes(settings.interval_minutes as i64))
            .unwrap_or(true);
        if !stale {
            return;
        }
        if this.history_in_flight.swap(true, Ordering::SeqCst) {
            return;
        }

        let this = this.clone();
        tokio::spawn(async move {
            let outcome = this.fetch_history_and_detect(now).await;
            this.history_in_flight.store(false, Ordering::SeqCst);
            if let Err(e) = outcome {
                if e.is_fatal() {
                    this.handle_token_expired();
                } else {
                    error!("history refresh failed: {e}");
                }
            }
        });
    }

    /// Fetch 1-minute history for the index and both ATM options,
    /// recompute indicators and the strategy signal.
    async fn fetch_history_and_detect(&self, now: DateTime<Utc>) -> Result<(), BrokerError> {
        let settings = self.settings_snapshot();
        let (call_option, put_option) = {
            let state = self.state.lock();
            (state.call_option.clone(), state.put_option.clone())
        };

        let mut symbols = vec![settings.derivative.clone()];
        symbols.extend(call_option);
        symbols.extend(put_option);

        for symbol in symbols {
            if self.should_stop.load(Ordering::SeqCst) {
                return Ok(());
            }
            match self
                .broker
                .get_history(&symbol, 1, HISTORY_FETCH_DAYS, now)
                .await
            {
                Ok(candles) if !candles.is_empty() => {
                    debug!("{symbol}: {} 1-minute bars", candles.len());
                    self.store.ingest(&symbol, candles);
                }
                Ok(_) => debug!("{symbol}: no history returned"),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => error!("history fetch failed for {symbol}: {e}"),
            }
        }

        self.recompute_signals(&settings);
        Ok(())
    }

    /// Derive indicators and the directional signal from the index
    /// series at the configured interval.
    fn recompute_signals(&self, settings: &Settings) {
        let candles = self
            .store
            .resample(&settings.derivative, settings.interval_minutes);
        if candles.is_empty() {
            return;
        }

        let supertrend = calculate_supertrend(&candles, SUPERTREND_PERIOD, SUPERTREND_MULTIPLIER);
        if !supertrend.is_empty() {
            let values: Vec<f64> = supertrend.iter().map(|p| p.value).collect();
            self.state
                .lock()
                .indicators
                .insert("supertrend".to_string(), values);
        }

        match self.strategy.evaluate(&candles) {
            Ok(signal) => {
                let mut last = self.last_signal.lock().unwrap_or_else(|e| e.into_inner());
                if *last != signal {
                    info!("signal: {} -> {}", *last, signal);
                }
                *last = signal;
            }
            Err(e) => {
                // Data-quality problems mean "cannot confirm", never a
                // default direction.
                debug!("strategy evaluation failed: {e}");
                *self.last_signal.lock().unwrap_or_else(|e| e.into_inner()) = OptionSignal::Hold;
            }
        }
    }

    /// Fatal auth failure: stop trading and ask for re-authentication.
    /// No further broker calls are made until a new token is supplied.
    fn handle_token_expired(&self) {
        error!("access token expired; trading halted until re-authentication");
        self.events.publish(EngineEvent::ReauthRequired);
        self.should_stop.store(true, Ordering::SeqCst);
        self.supervisor.disconnect();
    }

    /// Install a new access token and allow trading to resume
    pub fn set_token(&self, token: String) {
        self.broker.set_token(Some(token.clone()));
        self.state.lock().token = Some(token);
        self.should_stop.store(false, Ordering::SeqCst);
    }
}
