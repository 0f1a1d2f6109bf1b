pub mod resilient;
pub mod rest;

pub use resilient::ResilientBrokerClient;
pub use rest::{Quote, RestBrokerClient};

/// Broker order-status code meaning the order has been executed/filled
pub const ORDER_STATUS_EXECUTED: i64 = 2;
