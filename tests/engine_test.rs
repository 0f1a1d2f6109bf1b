use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};

use optionbot::broker::{ResilientBrokerClient, RestBrokerClient};
use optionbot::events::EventBus;
use optionbot::execution::{check_exit_triggers, ConfirmOutcome, OrderExecutor, PositionMonitor};
use optionbot::ledger::MemoryLedger;
use optionbot::models::{ExitReason, OptionSide};
use optionbot::options::exchange_offset;
use optionbot::settings::{BrokerSettings, RiskSettings, Settings};
use optionbot::state::SharedTradeState;

fn settings_for(server: &mockito::Server) -> Settings {
    Settings::with_broker(BrokerSettings {
        client_id: "TEST-100".to_string(),
        secret_key: "secret".to_string(),
        redirect_uri: "http://127.0.0.1/redirect".to_string(),
        token_file: "token.txt".to_string(),
        api_base: server.url(),
        ws_url: "ws://127.0.0.1:1/feed".to_string(),
    })
}

struct Harness {
    state: SharedTradeState,
    executor: OrderExecutor,
    monitor: PositionMonitor,
    ledger: MemoryLedger,
}

fn build_harness(server: &mockito::Server) -> Harness {
    let settings = settings_for(server);
    let state = SharedTradeState::new(&settings);
    let rest = RestBrokerClient::new(server.url(), settings.broker.client_id.clone());
    rest.set_token(Some("tok".to_string()));
    let broker =
        Arc::new(ResilientBrokerClient::new(rest).with_base_delay(Duration::from_millis(5)));
    let ledger = MemoryLedger::new();
    let events = EventBus::new();

    let executor = OrderExecutor::new(
        broker.clone(),
        state.clone(),
        Arc::new(ledger.clone()),
        events,
    );
    let monitor = PositionMonitor::new(broker, state.clone());

    Harness {
        state,
        executor,
        monitor,
        ledger,
    }
}

/// A session instant well inside market hours
fn mid_session() -> chrono::DateTime<Utc> {
    exchange_offset()
        .with_ymd_and_hms(2025, 8, 6, 11, 0, 0)
        .unwrap()
        .with_timezone(&Utc)
}

fn seed_market(state: &SharedTradeState, option_price: f64) {
    let mut s = state.lock();
    s.account_balance = 100_000.0;
    s.derivative_price = 24_500.0;
    s.call_option = Some("NIFTY25AUG24500CE".to_string());
    s.put_option = Some("NIFTY25AUG24500PE".to_string());
    s.call_close = Some(option_price);
}

fn feed_option_price(state: &SharedTradeState, price: f64) {
    state.update_tick_prices(None, Some(price), None, Utc::now());
}

/// Full lifecycle: entry at 100 with TP +15% / SL -7%, price rises to
/// 130 so the trailing ratchet locks the stop above entry, price falls
/// to the new stop, exit fires with a positive net P&L after costs.
#[tokio::test]
async fn test_entry_trailing_exit_round_trip() {
    let mut server = mockito::Server::new_async().await;

    let place = server
        .mock("POST", "/orders")
        .with_body(r#"{"s":"ok","id":"B-1001"}"#)
        .expect(2) // one buy chunk, one sell leg
        .create_async()
        .await;
    let status = server
        .mock("GET", "/orders")
        .match_query(mockito::Matcher::Any)
        .with_body(r#"{"s":"ok","orderBook":[{"id":"B-1001","status":2}]}"#)
        .create_async()
        .await;
    let funds = server
        .mock("GET", "/funds")
        .with_body(r#"{"s":"ok","fund_limit":[{"id":10,"equityAmount":102745.0}]}"#)
        .create_async()
        .await;

    let harness = build_harness(&server);
    let risk = RiskSettings::default();
    let now = mid_session();
    seed_market(&harness.state, 100.0);

    // ── Entry ─────────────────────────────────────────────────────────
    let entered = harness
        .executor
        .buy_option(OptionSide::Call, now)
        .await
        .unwrap();
    assert!(entered);
    {
        let s = harness.state.lock();
        assert_eq!(s.current_position, Some(OptionSide::Call));
        assert_eq!(s.entry_price, Some(100.0));
        // 100k / (100 * 75-lot) = 13 lots = 975 shares in one chunk
        assert_eq!(s.positions_hold, 975);
        assert_eq!(s.pending_orders.len(), 1);
        assert_eq!(s.stop_loss, Some(93.0));
        assert_eq!(s.tp_point, Some(115.0));
        assert!(!s.order_pending, "single-flight guard must clear");
    }

    // Entry refused while positioned
    let again = harness
        .executor
        .buy_option(OptionSide::Put, now)
        .await
        .unwrap();
    assert!(!again);

    // ── Confirmation ──────────────────────────────────────────────────
    let outcome = harness.monitor.confirm_trade(10, 0.01, now).await.unwrap();
    assert_eq!(outcome, ConfirmOutcome::AllConfirmed);
    {
        let s = harness.state.lock();
        assert!(s.current_trade_confirmed);
        assert_eq!(s.confirmed_orders.len(), 1);
        assert!(s.pending_orders.is_empty());
    }

    // ── Trailing ratchet at +30% ──────────────────────────────────────
    feed_option_price(&harness.state, 130.0);
    harness.monitor.update_trailing(&risk);
    {
        let s = harness.state.lock();
        assert_eq!(s.stoploss_percentage, risk.trailing_first_lock);
        assert_eq!(s.tp_percentage, 15.0 + risk.profit_step);
        assert_eq!(s.stop_loss, Some(103.0));
    }

    // ── Fall to the ratcheted stop ────────────────────────────────────
    feed_option_price(&harness.state, 103.0);
    harness.monitor.update_trailing(&risk);
    let snapshot = harness.state.lock().position_snapshot();
    let reason = check_exit_triggers(&snapshot, risk.trailing_enabled, now);
    assert_eq!(reason, Some(ExitReason::StopLoss));

    let trade = harness
        .executor
        .exit_position(ExitReason::StopLoss, now)
        .await
        .unwrap()
        .expect("exit should close the trade");

    assert_eq!(trade.qty, 975);
    assert_eq!(trade.exit_price, 103.0);
    assert_eq!(trade.gross_pnl, 975.0 * 3.0);
    assert!(trade.transaction_cost > 0.0);
    assert!(
        trade.net_pnl > 0.0,
        "net P&L should stay positive after costs: {}",
        trade.net_pnl
    );

    {
        let s = harness.state.lock();
        assert_eq!(s.current_position, None);
        assert_eq!(s.previous_position, Some(OptionSide::Call));
        assert!(!s.order_pending);
        assert_eq!(s.account_balance, 102_745.0);
        // Ratchet restored for the next trade
        assert_eq!(s.stoploss_percentage, -7.0);
    }

    assert_eq!(harness.ledger.trades().len(), 1);
    assert!(harness.ledger.total_net_pnl() > 0.0);

    place.assert_async().await;
    status.assert_async().await;
    funds.assert_async().await;
}

/// Orders split into broker-enforced chunks with the remainder last
#[tokio::test]
async fn test_entry_splits_into_lot_chunks() {
    let mut server = mockito::Server::new_async().await;
    let place = server
        .mock("POST", "/orders")
        .with_body(r#"{"s":"ok","id":"B-2001"}"#)
        .expect(3)
        .create_async()
        .await;

    let harness = build_harness(&server);
    {
        let mut s = harness.state.lock();
        s.max_order_qty = 750;
        s.account_balance = 200_000.0; // 26 lots = 1950 shares at 100
    }
    seed_market(&harness.state, 100.0);
    harness.state.lock().account_balance = 200_000.0;

    let entered = harness
        .executor
        .buy_option(OptionSide::Call, mid_session())
        .await
        .unwrap();
    assert!(entered);

    let s = harness.state.lock();
    assert_eq!(s.positions_hold, 1950);
    let qtys: Vec<u32> = s.pending_orders.iter().map(|o| o.qty).collect();
    assert_eq!(qtys, vec![750, 750, 450]);
    place.assert_async().await;
}

/// Price drift beyond the threshold cancels an unconfirmed trade and
/// resets to flat when nothing filled.
#[tokio::test]
async fn test_unconfirmed_trade_cancelled_on_drift() {
    let mut server = mockito::Server::new_async().await;
    let _place = server
        .mock("POST", "/orders")
        .with_body(r#"{"s":"ok","id":"B-3001"}"#)
        .create_async()
        .await;
    // Order never executes
    let _status = server
        .mock("GET", "/orders")
        .match_query(mockito::Matcher::Any)
        .with_body(r#"{"s":"ok","orderBook":[{"id":"B-3001","status":6}]}"#)
        .create_async()
        .await;
    let cancel = server
        .mock("DELETE", "/orders")
        .with_body(r#"{"s":"ok"}"#)
        .expect(1)
        .create_async()
        .await;

    let harness = build_harness(&server);
    let now = mid_session();
    seed_market(&harness.state, 100.0);

    assert!(harness
        .executor
        .buy_option(OptionSide::Call, now)
        .await
        .unwrap());

    // Price has run 4% above entry: past the 3% + lower_percentage gate
    feed_option_price(&harness.state, 104.0);
    let outcome = harness.monitor.confirm_trade(10, 0.01, now).await.unwrap();
    assert_eq!(outcome, ConfirmOutcome::CancelledFlat);

    let s = harness.state.lock();
    assert_eq!(s.current_position, None);
    assert!(s.pending_orders.is_empty());
    assert!(!s.order_pending);
    cancel.assert_async().await;
}

/// A fatal token failure during entry surfaces immediately and leaves
/// no ghost pending flag behind.
#[tokio::test]
async fn test_fatal_entry_failure_clears_guard() {
    let mut server = mockito::Server::new_async().await;
    let _place = server
        .mock("POST", "/orders")
        .with_body(r#"{"s":"error","code":-16,"message":"Token expired"}"#)
        .expect(1)
        .create_async()
        .await;

    let harness = build_harness(&server);
    seed_market(&harness.state, 100.0);

    let result = harness
        .executor
        .buy_option(OptionSide::Call, mid_session())
        .await;
    assert!(result.is_err());

    let s = harness.state.lock();
    assert_eq!(s.current_position, None);
    assert!(!s.order_pending, "guard must clear on the fatal path");
}

/// Exit attempted while flat is rejected synchronously with no state
/// mutation.
#[tokio::test]
async fn test_exit_while_flat_is_rejected() {
    let server = mockito::Server::new_async().await;
    let harness = build_harness(&server);

    let result = harness
        .executor
        .exit_position(ExitReason::Manual, mid_session())
        .await
        .unwrap();
    assert!(result.is_none());
    assert!(!harness.state.lock().order_pending);
}
