use tokio::sync::broadcast;

use crate::feed::ConnectionState;
use crate::models::{ClosedTrade, OptionSide};

const CHANNEL_CAPACITY: usize = 256;

/// Everything the engine reports outward, as one tagged union on a
/// single broadcast channel. Display layers subscribe; the engine works
/// identically with zero receivers.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    ConnectionChanged(ConnectionState),
    SignalDecision {
        side: OptionSide,
        allowed: bool,
        summary: String,
    },
    EntryBlocked {
        reason: String,
    },
    TradeClosed(ClosedTrade),
    /// Fatal auth failure: trading has stopped until a new token arrives
    ReauthRequired,
}

/// Outbound event hub. Cloneable; all clones feed the same channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Send errors (no subscribers) are ignored.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
