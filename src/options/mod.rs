use chrono::{DateTime, Datelike, FixedOffset, NaiveTime, Utc};

use crate::models::OptionSide;

/// Exchange session runs 09:15-15:30 local time (UTC+05:30)
const EXCHANGE_UTC_OFFSET_SECS: i32 = 5 * 3600 + 30 * 60;

const MARKET_OPEN: (u32, u32) = (9, 15);
const MARKET_CLOSE: (u32, u32) = (15, 30);
const SIDEWAYS_START: (u32, u32) = (12, 0);
const SIDEWAYS_END: (u32, u32) = (14, 0);

/// Strike-price multiples per index
const STRIKE_MULTIPLES: &[(&str, u32)] = &[
    ("NIFTY", 50),
    ("FINNIFTY", 50),
    ("BANKNIFTY", 100),
    ("SENSEX", 100),
    ("MIDCPNIFTY", 25),
];

/// Wire symbols the broker expects for index history/quote calls
const INDEX_WIRE_SYMBOLS: &[(&str, &str)] = &[
    ("NIFTY", "NSE:NIFTY50-INDEX"),
    ("BANKNIFTY", "NSE:NIFTYBANK-INDEX"),
    ("FINNIFTY", "NSE:FINNIFTY-INDEX"),
    ("MIDCPNIFTY", "NSE:MIDCPNIFTY-INDEX"),
    ("SENSEX", "BSE:SENSEX-INDEX"),
];

const MONTH_CODES: &[&str] = &[
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];

pub fn exchange_offset() -> FixedOffset {
    FixedOffset::east_opt(EXCHANGE_UTC_OFFSET_SECS).expect("valid fixed offset")
}

fn exchange_time(now: DateTime<Utc>) -> NaiveTime {
    now.with_timezone(&exchange_offset()).time()
}

fn time_of(hm: (u32, u32)) -> NaiveTime {
    NaiveTime::from_hms_opt(hm.0, hm.1, 0).expect("valid time")
}

/// Whether the exchange session is currently trading
pub fn is_market_open(now: DateTime<Utc>) -> bool {
    let local = now.with_timezone(&exchange_offset());
    let weekday = local.weekday().num_days_from_monday();
    if weekday > 4 {
        return false;
    }
    let t = local.time();
    t >= time_of(MARKET_OPEN) && t <= time_of(MARKET_CLOSE)
}

/// Whether we are within `buffer_minutes` of the session close
pub fn is_near_market_close(now: DateTime<Utc>, buffer_minutes: i64) -> bool {
    if !is_market_open(now) {
        return false;
    }
    let t = exchange_time(now);
    let close = time_of(MARKET_CLOSE);
    let remaining = close.signed_duration_since(t);
    remaining.num_minutes() < buffer_minutes
}

/// The low-conviction midday window where entries are skipped by default
pub fn in_sideways_window(now: DateTime<Utc>) -> bool {
    let t = exchange_time(now);
    t >= time_of(SIDEWAYS_START) && t <= time_of(SIDEWAYS_END)
}

/// Strike step for the given index, defaulting to the NIFTY step
pub fn strike_multiple(derivative: &str) -> u32 {
    STRIKE_MULTIPLES
        .iter()
        .find(|(name, _)| *name == derivative)
        .map(|(_, m)| *m)
        .unwrap_or(50)
}

/// Round the spot price to the nearest tradable strike
pub fn atm_strike(spot: f64, multiple: u32) -> u32 {
    let m = multiple as f64;
    ((spot / m).round() * m) as u32
}

/// Strike shifted by the lookback offset toward cheaper (further OTM)
/// contracts: higher strikes for calls, lower strikes for puts.
pub fn strike_with_lookback(spot: f64, derivative: &str, lookback: i32, side: OptionSide) -> u32 {
    let multiple = strike_multiple(derivative);
    let atm = atm_strike(spot, multiple) as i64;
    let shift = lookback as i64 * multiple as i64;
    let strike = match side {
        OptionSide::Call => atm + shift,
        OptionSide::Put => atm - shift,
    };
    strike.max(multiple as i64) as u32
}

/// Build the exchange option symbol, e.g. `NIFTY25AUG24500CE`.
///
/// `expiry_offset` selects the current (0) or a later (1, 2, ...) monthly
/// expiry relative to `now`.
pub fn option_symbol(
    derivative: &str,
    spot: f64,
    lookback: i32,
    expiry_offset: u32,
    side: OptionSide,
    now: DateTime<Utc>,
) -> String {
    let strike = strike_with_lookback(spot, derivative, lookback, side);
    let local = now.with_timezone(&exchange_offset());
    let month0 = (local.month0() + expiry_offset) % 12;
    let year = local.year() + ((local.month0() + expiry_offset) / 12) as i32;
    format!(
        "{}{:02}{}{}{}",
        derivative,
        year % 100,
        MONTH_CODES[month0 as usize],
        strike,
        side.suffix()
    )
}

/// Normalize a symbol to the `EXCHANGE:SYMBOL` form used on the wire.
/// Index names get their broker-specific wire mapping; everything else
/// defaults to the NSE prefix.
pub fn wire_symbol(symbol: &str) -> String {
    if symbol.contains(':') {
        return symbol.to_string();
    }
    INDEX_WIRE_SYMBOLS
        .iter()
        .find(|(name, _)| *name == symbol)
        .map(|(_, wire)| wire.to_string())
        .unwrap_or_else(|| format!("NSE:{}", symbol))
}

/// Affordable share count: whole lots that fit within the balance
pub fn calculate_shares_to_buy(balance: f64, price: f64, lot_size: u32) -> u32 {
    if balance <= 0.0 || price <= 0.0 || lot_size == 0 {
        return 0;
    }
    let lot_cost = price * lot_size as f64;
    let lots = (balance / lot_cost).floor() as u32;
    lots * lot_size
}

/// Round a price to the exchange tick of 0.05
pub fn round_to_tick(price: f64) -> f64 {
    (price * 20.0).round() / 20.0
}

/// Price adjusted by a signed percentage and rounded to the tick.
/// `apply_percentage(100.0, -7.0)` = 93.0, `apply_percentage(100.0, 15.0)` = 115.0.
pub fn apply_percentage(price: f64, percentage: f64) -> f64 {
    round_to_tick(price * (1.0 + percentage / 100.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    /// Build a UTC instant from exchange-local wall-clock time
    fn exchange_dt(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        exchange_offset()
            .with_ymd_and_hms(y, mo, d, h, mi, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_market_open_hours() {
        // Wednesday mid-session
        assert!(is_market_open(exchange_dt(2025, 8, 6, 10, 30)));
        // Before the bell
        assert!(!is_market_open(exchange_dt(2025, 8, 6, 9, 0)));
        // After close
        assert!(!is_market_open(exchange_dt(2025, 8, 6, 15, 45)));
        // Saturday
        assert!(!is_market_open(exchange_dt(2025, 8, 9, 10, 30)));
    }

    #[test]
    fn test_near_market_close() {
        assert!(is_near_market_close(exchange_dt(2025, 8, 6, 15, 27), 5));
        assert!(!is_near_market_close(exchange_dt(2025, 8, 6, 15, 10), 5));
    }

    #[test]
    fn test_sideways_window() {
        assert!(in_sideways_window(exchange_dt(2025, 8, 6, 13, 0)));
        assert!(!in_sideways_window(exchange_dt(2025, 8, 6, 10, 0)));
        assert!(!in_sideways_window(exchange_dt(2025, 8, 6, 14, 30)));
    }

    #[test]
    fn test_atm_strike_rounding() {
        assert_eq!(atm_strike(24513.0, 50), 24500);
        assert_eq!(atm_strike(24530.0, 50), 24550);
        assert_eq!(atm_strike(51240.0, 100), 51200);
    }

    #[test]
    fn test_lookback_moves_toward_cheaper_strikes() {
        // Calls get cheaper at higher strikes
        assert_eq!(
            strike_with_lookback(24500.0, "NIFTY", 2, OptionSide::Call),
            24600
        );
        // Puts get cheaper at lower strikes
        assert_eq!(
            strike_with_lookback(24500.0, "NIFTY", 2, OptionSide::Put),
            24400
        );
    }

    #[test]
    fn test_option_symbol_format() {
        let now = exchange_dt(2025, 8, 6, 10, 0);
        let sym = option_symbol("NIFTY", 24500.0, 0, 0, OptionSide::Call, now);
        assert_eq!(sym, "NIFTY25AUG24500CE");

        let sym = option_symbol("NIFTY", 24500.0, 0, 0, OptionSide::Put, now);
        assert_eq!(sym, "NIFTY25AUG24500PE");
    }

    #[test]
    fn test_option_symbol_expiry_rollover() {
        // December + one month rolls into January of the next year
        let now = exchange_dt(2025, 12, 10, 10, 0);
        let sym = option_symbol("NIFTY", 24500.0, 0, 1, OptionSide::Call, now);
        assert_eq!(sym, "NIFTY26JAN24500CE");
    }

    #[test]
    fn test_wire_symbol_normalization() {
        assert_eq!(wire_symbol("NIFTY"), "NSE:NIFTY50-INDEX");
        assert_eq!(wire_symbol("SENSEX"), "BSE:SENSEX-INDEX");
        assert_eq!(wire_symbol("NIFTY25AUG24500CE"), "NSE:NIFTY25AUG24500CE");
        // Already normalized symbols pass through untouched
        assert_eq!(wire_symbol("NSE:NIFTY25AUG24500CE"), "NSE:NIFTY25AUG24500CE");
    }

    #[test]
    fn test_calculate_shares_to_buy() {
        // 100000 / (100 * 75) = 13.33 lots -> 13 lots = 975 shares
        assert_eq!(calculate_shares_to_buy(100_000.0, 100.0, 75), 975);
        // Not enough for a single lot
        assert_eq!(calculate_shares_to_buy(5_000.0, 100.0, 75), 0);
        // Degenerate inputs
        assert_eq!(calculate_shares_to_buy(0.0, 100.0, 75), 0);
        assert_eq!(calculate_shares_to_buy(100.0, 0.0, 75), 0);
    }

    #[test]
    fn test_round_to_tick() {
        assert_eq!(round_to_tick(105.12), 105.10);
        assert_eq!(round_to_tick(105.13), 105.15);
    }

    #[test]
    fn test_apply_percentage_signed() {
        assert_eq!(apply_percentage(100.0, -7.0), 93.0);
        assert_eq!(apply_percentage(100.0, 15.0), 115.0);
        assert_eq!(apply_percentage(100.0, 3.0), 103.0);
    }
}
