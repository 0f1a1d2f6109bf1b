use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::events::{EngineEvent, EventBus};
use crate::feed::{
    parse_tick, reconnect_delay, ConnectionState, HeartbeatMonitor, Liveness, NetworkMonitor,
};
use crate::models::Tick;
use crate::options::wire_symbol;
use crate::settings::ConnectionSettings;

/// How often the outbound-connectivity probe runs
const NETWORK_CHECK_INTERVAL: Duration = Duration::from_secs(5);
const MAX_NETWORK_FAILURES: u32 = 3;
/// Probe target: a well-known public resolver
const NETWORK_PROBE_ADDR: &str = "8.8.8.8:53";
const NETWORK_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const NETWORK_PROBE_HTTP: &str = "https://clients3.google.com/generate_204";
/// Bounded wait for the network to come back before a reconnect attempt
const NETWORK_RECOVERY_MAX_WAIT: Duration = Duration::from_secs(300);
const NETWORK_RECOVERY_POLL: Duration = Duration::from_secs(10);

/// Why the streaming loop ended
#[derive(Debug)]
enum StreamEnd {
    CleanClose,
    ManualStop,
}

/// Owns the market-data stream: connect, subscribe, heartbeat and
/// network-liveness monitoring, and background reconnection.
///
/// Ticks flow out on an mpsc channel; state transitions are published as
/// `EngineEvent::ConnectionChanged`. The supervisor never calls back
/// into the engine and never panics on socket errors: every failure is
/// routed through the same reconnection path.
pub struct ConnectionSupervisor {
    ws_url: String,
    symbols: Mutex<Vec<String>>,
    settings: ConnectionSettings,
    state: Mutex<ConnectionState>,
    running: AtomicBool,
    stop_tx: watch::Sender<bool>,
    /// Bumped by set_symbols so a live stream re-sends its subscription
    symbols_version: watch::Sender<u64>,
    tick_tx: mpsc::Sender<Tick>,
    events: EventBus,
}

impl ConnectionSupervisor {
    pub fn new(
        ws_url: String,
        symbols: Vec<String>,
        settings: ConnectionSettings,
        tick_tx: mpsc::Sender<Tick>,
        events: EventBus,
    ) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        let (symbols_version, _) = watch::channel(0);
        Arc::new(Self {
            ws_url,
            symbols: Mutex::new(symbols),
            settings,
            state: Mutex::new(ConnectionState::Disconnected),
            running: AtomicBool::new(false),
            stop_tx,
            symbols_version,
            tick_tx,
            events,
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    fn set_state(&self, next: ConnectionState) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state == next {
                return;
            }
            *state = next;
        }
        debug!("connection state -> {}", next);
        self.events.publish(EngineEvent::ConnectionChanged(next));
    }

    /// Replace the subscribed symbol set. A live stream re-sends its
    /// subscription; otherwise the set applies on the next (re)connect.
    pub fn set_symbols(&self, symbols: Vec<String>) {
        *self.symbols.lock().unwrap_or_else(|e| e.into_inner()) = symbols;
        self.symbols_version.send_modify(|v| *v += 1);
    }

    /// Subscribe a symbol set, bringing the connection up first if it
    /// is not already running.
    pub fn subscribe(self: Arc<Self>, symbols: Vec<String>) {
        self.set_symbols(symbols);
        if !self.is_connected() {
            self.connect();
        }
    }

    /// Start the connection task.
    ///
    /// Idempotent: calling while already Connecting/Connected is a no-op
    /// and never creates a second underlying socket. Returns whether a
    /// new connection task was actually spawned.
    pub fn connect(self: Arc<Self>) -> bool {
        if self.running.swap(true, Ordering::SeqCst) {
            info!("already {}, skipping connect", self.state());
            return false;
        }
        let _ = self.stop_tx.send(false);

        tokio::spawn(async move {
            self.run().await;
            self.running.store(false, Ordering::SeqCst);
        });
        true
    }

    /// Manual stop: closes the socket and prevents any reconnection
    pub fn disconnect(&self) {
        info!("manual disconnect requested");
        self.set_state(ConnectionState::Closing);
        let _ = self.stop_tx.send(true);
        // With no connection task alive nothing else will finish the
        // transition, so settle immediately.
        if !self.running.load(Ordering::SeqCst) {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    fn manually_stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Connection loop: connect, stream until failure, then reconnect
    /// with linearly growing delay until the retry cap is exhausted.
    async fn run(&self) {
        let mut attempt: u32 = 0;

        loop {
            if self.manually_stopped() {
                break;
            }
            self.set_state(if attempt == 0 {
                ConnectionState::Connecting
            } else {
                ConnectionState::Reconnecting
            });

            match self.connect_and_stream().await {
                Ok(StreamEnd::ManualStop) => break,
                Ok(StreamEnd::CleanClose) => {
                    info!("stream closed by server");
                    attempt = 0;
                }
                Err(e) => {
                    warn!("stream error: {e}");
                }
            }

            if self.manually_stopped() {
                break;
            }

            attempt += 1;
            if attempt > self.settings.max_retries {
                error!(
                    "giving up after {} reconnect attempts",
                    self.settings.max_retries
                );
                self.set_state(ConnectionState::Disconnected);
                return;
            }

            self.set_state(ConnectionState::Reconnecting);
            if !self.wait_for_network_recovery().await {
                error!("network did not recover in time, giving up");
                self.set_state(ConnectionState::Disconnected);
                return;
            }

            let delay = reconnect_delay(
                Duration::from_secs(self.settings.retry_delay_secs),
                attempt,
            );
            info!("reconnecting in {:?} (attempt {attempt})", delay);
            tokio::time::sleep(delay).await;
        }

        self.set_state(ConnectionState::Disconnected);
    }

    /// One socket lifetime: connect, subscribe, then pump messages while
    /// watching heartbeat silence and outbound connectivity.
    async fn connect_and_stream(&self) -> anyhow::Result<StreamEnd> {
        let url = Url::parse(&self.ws_url)?;
        info!("connecting to {}", url);

        let (ws_stream, _) = tokio::time::timeout(
            Duration::from_secs(self.settings.connect_timeout_secs),
            connect_async(url.as_str()),
        )
        .await
        .map_err(|_| anyhow::anyhow!("websocket connect timeout"))??;

        self.set_state(ConnectionState::Connected);
        let (mut write, mut read) = ws_stream.split();

        // (Re-)subscribe the configured symbol set
        write.send(self.subscribe_frame()).await?;

        let heartbeat = HeartbeatMonitor::new(Duration::from_secs(
            self.settings.heartbeat_interval_secs,
        ));
        let mut network = NetworkMonitor::new(MAX_NETWORK_FAILURES);
        let mut last_message = Instant::now();

        let mut keepalive = interval(Duration::from_secs(self.settings.keepalive_interval_secs));
        let mut heartbeat_check = interval(Duration::from_secs(
            (self.settings.heartbeat_interval_secs / 2).max(1),
        ));
        let mut network_check = interval(NETWORK_CHECK_INTERVAL);
        let mut stop_rx = self.stop_tx.subscribe();
        let mut symbols_rx = self.symbols_version.subscribe();
        symbols_rx.mark_unchanged();

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            last_message = Instant::now();
                            if let Some(tick) = parse_tick(&text, chrono::Utc::now()) {
                                if self.tick_tx.send(tick).await.is_err() {
                                    // Engine went away; treat as manual stop
                                    return Ok(StreamEnd::ManualStop);
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            last_message = Instant::now();
                            write.send(Message::Pong(data)).await.ok();
                        }
                        Some(Ok(Message::Pong(_))) => {
                            last_message = Instant::now();
                        }
                        Some(Ok(Message::Close(frame))) => {
                            info!("close frame received: {:?}", frame);
                            return Ok(StreamEnd::CleanClose);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                        None => return Ok(StreamEnd::CleanClose),
                    }
                }
                _ = keepalive.tick() => {
                    write.send(Message::Ping(Vec::new())).await.ok();
                }
                _ = heartbeat_check.tick() => {
                    let silence = last_message.elapsed();
                    match heartbeat.assess(silence) {
                        Liveness::Healthy => {}
                        Liveness::Quiet => {
                            warn!("no messages for {:.0}s, connection may be stale", silence.as_secs_f64());
                        }
                        Liveness::Stale => {
                            return Err(anyhow::anyhow!(
                                "connection stale after {:.0}s of silence",
                                silence.as_secs_f64()
                            ));
                        }
                    }
                }
                _ = network_check.tick() => {
                    let ok = check_network().await;
                    if !ok {
                        warn!("network probe failed ({}/{})", network.failures() + 1, MAX_NETWORK_FAILURES);
                    }
                    if network.record(ok) {
                        return Err(anyhow::anyhow!("network down"));
                    }
                }
                changed = symbols_rx.changed() => {
                    if changed.is_ok() {
                        write.send(self.subscribe_frame()).await.ok();
                    }
                }
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        write.send(Message::Close(None)).await.ok();
                        return Ok(StreamEnd::ManualStop);
                    }
                }
            }
        }
    }

    /// Build the subscription frame for the current symbol set
    fn subscribe_frame(&self) -> Message {
        let symbols: Vec<String> = {
            let guard = self.symbols.lock().unwrap_or_else(|e| e.into_inner());
            guard.iter().map(|s| wire_symbol(s)).collect()
        };
        info!("subscribing {} symbols", symbols.len());
        let sub = json!({ "type": "subscribe", "symbols": symbols });
        Message::Text(sub.to_string())
    }

    /// Poll outbound connectivity until it recovers or the ceiling hits
    async fn wait_for_network_recovery(&self) -> bool {
        info!("waiting for network recovery");
        let mut waited = Duration::ZERO;
        while waited < NETWORK_RECOVERY_MAX_WAIT {
            if self.manually_stopped() {
                return false;
            }
            if check_network().await {
                info!("network restored");
                return true;
            }
            tokio::time::sleep(NETWORK_RECOVERY_POLL).await;
            waited += NETWORK_RECOVERY_POLL;
        }
        false
    }
}

/// Outbound connectivity probe: a raw TCP connect to a public resolver,
/// falling back to a lightweight HTTP request.
async fn check_network() -> bool {
    let tcp = tokio::time::timeout(
        NETWORK_PROBE_TIMEOUT,
        TcpStream::connect(NETWORK_PROBE_ADDR),
    )
    .await;
    if matches!(tcp, Ok(Ok(_))) {
        return true;
    }

    let client = reqwest::Client::builder()
        .timeout(NETWORK_PROBE_TIMEOUT)
        .build();
    match client {
        Ok(client) => client.get(NETWORK_PROBE_HTTP).send().await.is_ok(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_supervisor() -> (Arc<ConnectionSupervisor>, mpsc::Receiver<Tick>) {
        let (tick_tx, tick_rx) = mpsc::channel(64);
        let supervisor = ConnectionSupervisor::new(
            "ws://127.0.0.1:1/feed".to_string(),
            vec!["NIFTY".to_string()],
            ConnectionSettings::default(),
            tick_tx,
            EventBus::new(),
        );
        (supervisor, tick_rx)
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let (supervisor, _rx) = test_supervisor();

        assert!(supervisor.clone().connect());
        // Second call is a no-op: no second socket task
        assert!(!supervisor.clone().connect());

        supervisor.disconnect();
    }

    #[tokio::test]
    async fn test_starts_disconnected() {
        let (supervisor, _rx) = test_supervisor();
        assert_eq!(supervisor.state(), ConnectionState::Disconnected);
        assert!(!supervisor.is_connected());
    }

    #[tokio::test]
    async fn test_disconnect_moves_through_closing() {
        let (supervisor, _rx) = test_supervisor();
        let mut events = supervisor.events.subscribe();

        supervisor.disconnect();
        match events.recv().await.unwrap() {
            EngineEvent::ConnectionChanged(state) => {
                assert_eq!(state, ConnectionState::Closing)
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_set_symbols_replaces_subscription_set() {
        let (supervisor, _rx) = test_supervisor();
        supervisor.set_symbols(vec!["NIFTY".to_string(), "NIFTY25AUG24500CE".to_string()]);
        let symbols = supervisor.symbols.lock().unwrap().clone();
        assert_eq!(symbols.len(), 2);
    }
}
