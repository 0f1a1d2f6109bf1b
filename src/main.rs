use clap::Parser;
use std::sync::Arc;

use optionbot::broker::{ResilientBrokerClient, RestBrokerClient};
use optionbot::events::{EngineEvent, EventBus};
use optionbot::execution::TradingEngine;
use optionbot::feed::ConnectionSupervisor;
use optionbot::ledger::MemoryLedger;
use optionbot::settings::Settings;
use optionbot::strategy::EmaCrossStrategy;
use optionbot::Result;

#[derive(Parser, Debug)]
#[command(name = "optionbot", about = "Live options trading engine")]
struct Args {
    /// Config file name (without extension), merged with OPTIONBOT_* env vars
    #[arg(long, default_value = "optionbot")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let args = Args::parse();
    let settings = Settings::load_from(&args.config)?;

    tracing::info!("optionbot starting");
    tracing::info!("  derivative: {}", settings.derivative);
    tracing::info!("  interval: {}m", settings.interval_minutes);
    tracing::info!(
        "  tp/sl: {:+.1}% / {:+.1}% (trailing: {})",
        settings.risk.tp_percentage,
        settings.risk.stoploss_percentage,
        settings.risk.trailing_enabled,
    );

    let events = EventBus::new();
    let rest = RestBrokerClient::new(
        settings.broker.api_base.clone(),
        settings.broker.client_id.clone(),
    );
    let broker = Arc::new(ResilientBrokerClient::new(rest));

    let (tick_tx, tick_rx) = tokio::sync::mpsc::channel(512);
    let supervisor = ConnectionSupervisor::new(
        settings.broker.ws_url.clone(),
        vec![settings.derivative.clone()],
        settings.connection.clone(),
        tick_tx,
        events.clone(),
    );

    let ledger = Arc::new(MemoryLedger::new());
    let engine = TradingEngine::new(
        settings,
        broker,
        supervisor,
        Arc::new(EmaCrossStrategy::default()),
        ledger.clone(),
        events.clone(),
    );

    // Status consumer: everything user-visible flows through the event
    // channel, never through callbacks into the engine.
    let mut event_rx = events.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv().await {
            match event {
                EngineEvent::ConnectionChanged(state) => {
                    tracing::info!("connection: {state}");
                }
                EngineEvent::SignalDecision {
                    side,
                    allowed,
                    summary,
                } => {
                    tracing::info!("signal {side}: {summary} (allowed: {allowed})");
                }
                EngineEvent::EntryBlocked { reason } => {
                    tracing::warn!("entry blocked: {reason}");
                }
                EngineEvent::TradeClosed(trade) => {
                    tracing::info!(
                        "trade closed: {} {} net {:+.2} ({})",
                        trade.side,
                        trade.symbol,
                        trade.net_pnl,
                        trade.exit_reason,
                    );
                }
                EngineEvent::ReauthRequired => {
                    tracing::error!("re-authentication required; supply a fresh token and restart");
                }
            }
        }
    });

    engine.start().await?;

    let run_task = tokio::spawn(engine.clone().run(tick_rx));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Ctrl+C received, shutting down");
    engine.stop();
    run_task.await.ok();

    tracing::info!(
        "session net P&L: {:+.2} over {} trade(s)",
        ledger.total_net_pnl(),
        ledger.trades().len(),
    );
    Ok(())
}

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "optionbot=info".into()),
        )
        .init();
}
