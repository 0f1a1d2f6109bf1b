pub mod supervisor;

pub use supervisor::ConnectionSupervisor;

use std::time::Duration;

use serde::Deserialize;

use crate::models::Tick;

/// Market-data connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closing,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closing => "closing",
        };
        write!(f, "{}", name)
    }
}

/// Heartbeat verdict over the time since the last inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Healthy,
    /// One heartbeat interval of silence: worth a warning
    Quiet,
    /// Two intervals of silence: the connection is presumed dead
    Stale,
}

/// Tracks inbound-message silence against the heartbeat interval
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatMonitor {
    interval: Duration,
}

impl HeartbeatMonitor {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn assess(&self, silence: Duration) -> Liveness {
        if silence > self.interval * 2 {
            Liveness::Stale
        } else if silence > self.interval {
            Liveness::Quiet
        } else {
            Liveness::Healthy
        }
    }
}

/// Counts consecutive outbound-connectivity probe failures
#[derive(Debug)]
pub struct NetworkMonitor {
    consecutive_failures: u32,
    max_failures: u32,
}

impl NetworkMonitor {
    pub fn new(max_failures: u32) -> Self {
        Self {
            consecutive_failures: 0,
            max_failures,
        }
    }

    /// Record one probe outcome; true means the network is considered
    /// down and a reconnect should be triggered.
    pub fn record(&mut self, ok: bool) -> bool {
        if ok {
            self.consecutive_failures = 0;
            return false;
        }
        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.max_failures {
            self.consecutive_failures = 0;
            true
        } else {
            false
        }
    }

    pub fn failures(&self) -> u32 {
        self.consecutive_failures
    }
}

/// Reconnect delay grows linearly with the attempt count, capped at 60s
pub fn reconnect_delay(retry_delay: Duration, attempt: u32) -> Duration {
    (retry_delay * attempt.max(1)).min(Duration::from_secs(60))
}

/// Raw tick frame as the broker sends it
#[derive(Debug, Deserialize)]
struct WireTick {
    symbol: Option<String>,
    ltp: Option<f64>,
    bid_price: Option<f64>,
    ask_price: Option<f64>,
}

/// Parse a stream frame into a normalized tick.
///
/// Heartbeats and unparseable frames yield None and are silently
/// skipped upstream.
pub fn parse_tick(text: &str, now: chrono::DateTime<chrono::Utc>) -> Option<Tick> {
    let wire: WireTick = serde_json::from_str(text).ok()?;
    let symbol = wire.symbol?;
    let ltp = wire.ltp?;
    Some(Tick {
        symbol,
        ltp,
        bid: wire.bid_price,
        ask: wire.ask_price,
        timestamp: now,
    })
}
