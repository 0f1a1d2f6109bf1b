// Trade ledger interface
//
// Persistence of closed trades lives outside the engine; the engine
// only appends through this trait.
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::models::ClosedTrade;

#[async_trait]
pub trait TradeLedger: Send + Sync {
    /// Append one closed trade. Must not fail the exit path: ledger
    /// errors are the implementation's problem to log.
    async fn append(&self, trade: &ClosedTrade);
}

/// In-memory ledger used by tests and the status display
#[derive(Clone, Default)]
pub struct MemoryLedger {
    trades: Arc<Mutex<Vec<ClosedTrade>>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trades(&self) -> Vec<ClosedTrade> {
        self.trades
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn total_net_pnl(&self) -> f64 {
        self.trades().iter().map(|t| t.net_pnl).sum()
    }
}

#[async_trait]
impl TradeLedger for MemoryLedger {
    async fn append(&self, trade: &ClosedTrade) {
        self.trades
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(trade.clone());
    }
}
