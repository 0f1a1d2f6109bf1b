// Core modules
pub mod broker;
pub mod candles;
pub mod error;
pub mod events;
pub mod execution;
pub mod feed;
pub mod indicators;
pub mod ledger;
pub mod models;
pub mod options;
pub mod risk;
pub mod settings;
pub mod state;
pub mod strategy;
pub mod trend;

// Re-export commonly used types
pub use error::{BrokerError, FailureKind};
pub use models::*;
pub use state::SharedTradeState;

// Error handling
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;
