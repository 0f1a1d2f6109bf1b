use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

/// Broker credentials and session inputs
#[derive(Debug, Deserialize, Clone)]
pub struct BrokerSettings {
    pub client_id: String,
    pub secret_key: String,
    pub redirect_uri: String,
    /// Where the current access token is stored between sessions
    pub token_file: String,
    pub api_base: String,
    pub ws_url: String,
}

/// Connection supervision tuning
#[derive(Debug, Deserialize, Clone)]
pub struct ConnectionSettings {
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub connect_timeout_secs: u64,
    pub keepalive_interval_secs: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_delay_secs: 5,
            heartbeat_interval_secs: 30,
            connect_timeout_secs: 10,
            keepalive_interval_secs: 30,
        }
    }
}

/// Risk and trailing parameters. Percentages are signed relative to
/// entry: -7.0 means 7% below entry, +15.0 means 15% above.
#[derive(Debug, Deserialize, Clone)]
pub struct RiskSettings {
    pub tp_percentage: f64,
    pub stoploss_percentage: f64,
    /// When off, the take-profit point closes the trade instead of trailing
    pub trailing_enabled: bool,
    /// First trailing ratchet locks the stop at this percentage
    pub trailing_first_lock: f64,
    pub profit_step: f64,
    pub loss_step: f64,
    pub max_profit: f64,
    pub trail_after_max_profit: bool,
    pub max_daily_loss: f64,
    pub max_trades_per_day: u32,
    pub max_consecutive_losses: u32,
}

impl Default for RiskSettings {
    fn default() -> Self {
        Self {
            tp_percentage: 15.0,
            stoploss_percentage: -7.0,
            trailing_enabled: true,
            trailing_first_lock: 3.0,
            profit_step: 2.0,
            loss_step: 2.0,
            max_profit: 30.0,
            trail_after_max_profit: false,
            max_daily_loss: -5000.0,
            max_trades_per_day: 10,
            max_consecutive_losses: 5,
        }
    }
}

/// Read-only configuration snapshot for the trading engine.
///
/// The engine tolerates live reload of this object: a fresh snapshot is
/// applied to SharedTradeState without restarting the connection.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub broker: BrokerSettings,
    #[serde(default)]
    pub connection: ConnectionSettings,
    #[serde(default)]
    pub risk: RiskSettings,

    /// Underlying index, e.g. "NIFTY"
    pub derivative: String,
    /// Candle interval in minutes used for signal evaluation
    pub interval_minutes: u32,
    pub lot_size: u32,
    /// Broker-enforced maximum quantity per order
    pub max_order_qty: u32,
    pub call_lookback: i32,
    pub put_lookback: i32,
    pub expiry_offset: u32,
    /// Fraction of the balance held back from position sizing, percent
    pub capital_reserve: f64,
    pub sideway_zone_trade: bool,

    /// Minutes before pending orders are cancelled as unconfirmed
    pub cancel_after_minutes: i64,
    /// Added to the fixed 3% base when checking entry price drift
    pub lower_percentage: f64,

    pub use_mtf_filter: bool,
    pub mtf_required_agreement: usize,
    pub mtf_cache_ttl_secs: u64,

    pub base_dir: String,
}

impl Settings {
    /// Load from optional `optionbot.toml` plus `OPTIONBOT_*` environment
    /// overrides (e.g. `OPTIONBOT_BROKER__CLIENT_ID`).
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("optionbot")
    }

    pub fn load_from(name: &str) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .set_default("derivative", "NIFTY")?
            .set_default("interval_minutes", 2)?
            .set_default("lot_size", 75)?
            .set_default("max_order_qty", 7500)?
            .set_default("call_lookback", 0)?
            .set_default("put_lookback", 0)?
            .set_default("expiry_offset", 0)?
            .set_default("capital_reserve", 0.0)?
            .set_default("sideway_zone_trade", false)?
            .set_default("cancel_after_minutes", 10)?
            .set_default("lower_percentage", 0.01)?
            .set_default("use_mtf_filter", true)?
            .set_default("mtf_required_agreement", 2)?
            .set_default("mtf_cache_ttl_secs", 60)?
            .set_default("base_dir", ".")?
            .add_source(File::with_name(name).required(false))
            .add_source(Environment::with_prefix("OPTIONBOT").separator("__"));

        builder.build()?.try_deserialize()
    }

    /// Build a settings snapshot with stock defaults around the given
    /// broker endpoints. Used by tests and paper-trading setups that
    /// have no config file.
    pub fn with_broker(broker: BrokerSettings) -> Self {
        Self {
            broker,
            connection: ConnectionSettings::default(),
            risk: RiskSettings::default(),
            derivative: "NIFTY".to_string(),
            interval_minutes: 2,
            lot_size: 75,
            max_order_qty: 7500,
            call_lookback: 0,
            put_lookback: 0,
            expiry_offset: 0,
            capital_reserve: 0.0,
            sideway_zone_trade: false,
            cancel_after_minutes: 10,
            lower_percentage: 0.01,
            use_mtf_filter: true,
            mtf_required_agreement: 2,
            mtf_cache_ttl_secs: 60,
            base_dir: ".".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_settings() -> Settings {
        Settings::with_broker(BrokerSettings {
            client_id: "TEST-100".to_string(),
            secret_key: "secret".to_string(),
            redirect_uri: "http://127.0.0.1/redirect".to_string(),
            token_file: "token.txt".to_string(),
            api_base: "http://localhost".to_string(),
            ws_url: "ws://localhost/feed".to_string(),
        })
    }

    #[test]
    fn test_risk_defaults() {
        let risk = RiskSettings::default();
        assert_eq!(risk.tp_percentage, 15.0);
        assert_eq!(risk.stoploss_percentage, -7.0);
        assert_eq!(risk.trailing_first_lock, 3.0);
        assert!(!risk.trail_after_max_profit);
    }

    #[test]
    fn test_connection_defaults() {
        let conn = ConnectionSettings::default();
        assert_eq!(conn.max_retries, 5);
        assert_eq!(conn.heartbeat_interval_secs, 30);
    }

    #[test]
    fn test_settings_clone_is_snapshot() {
        let settings = minimal_settings();
        let snapshot = settings.clone();
        assert_eq!(snapshot.lot_size, 75);
        assert_eq!(snapshot.derivative, "NIFTY");
    }
}
