use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use governor::{Quota, RateLimiter};
use rand::Rng;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use crate::broker::rest::{Quote, RestBrokerClient};
use crate::error::{BrokerError, FailureKind};
use crate::models::Candle;

const MAX_RETRIES: u32 = 3;
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
const RATE_LIMIT_RPS: u32 = 10;

pub const SIDE_BUY: i32 = 1;
pub const SIDE_SELL: i32 = -1;
pub const LIMIT_ORDER_TYPE: i32 = 1;
pub const MARKET_ORDER_TYPE: i32 = 2;

// Type alias for the rate limiter to simplify signatures
type BrokerRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Exponential backoff with jitter: `base * 2^attempt + jitter`.
/// Pure so the growth curve is testable without sleeping.
pub fn backoff_delay(base: Duration, attempt: u32, jitter_secs: f64) -> Duration {
    let exp = base.as_secs_f64() * 2f64.powi(attempt as i32);
    Duration::from_secs_f64(exp + jitter_secs)
}

/// The sole point of contact with the broker API.
///
/// Wraps every REST call with failure classification and bounded
/// exponential backoff. The classification, not the retry count, drives
/// remediation: a fatal auth failure is surfaced on the first attempt
/// with zero retries (wasted calls would deepen rate limiting and mask
/// the real problem); transient failures always retry up to the cap;
/// benign conditions return no result without raising.
#[derive(Clone)]
pub struct ResilientBrokerClient {
    rest: RestBrokerClient,
    rate_limiter: Arc<BrokerRateLimiter>,
    base_delay: Duration,
}

impl ResilientBrokerClient {
    pub fn new(rest: RestBrokerClient) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(RATE_LIMIT_RPS).unwrap());
        Self {
            rest,
            rate_limiter: Arc::new(RateLimiter::direct(quota)),
            base_delay: DEFAULT_BASE_DELAY,
        }
    }

    /// Shrink the backoff base (tests)
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn rest(&self) -> &RestBrokerClient {
        &self.rest
    }

    pub fn set_token(&self, token: Option<String>) {
        self.rest.set_token(token);
    }

    /// Drive one broker operation through classification and retry.
    ///
    /// `Ok(Some(envelope))` on success, `Ok(None)` for benign no-ops.
    async fn call<F, Fut>(&self, context: &str, f: F) -> Result<Option<Value>, BrokerError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Value, reqwest::Error>>,
    {
        for attempt in 0..MAX_RETRIES {
            self.rate_limiter.until_ready().await;

            let outcome = f().await;
            let value = match outcome {
                Ok(value) => value,
                Err(e) if e.is_timeout() || e.is_connect() => {
                    let delay = self.retry_delay(attempt);
                    tracing::warn!(
                        context,
                        attempt,
                        "network error: {e}, retrying in {:.1}s",
                        delay.as_secs_f64()
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Err(e) => return Err(BrokerError::Transport(e)),
            };

            if value.get("s").and_then(Value::as_str) == Some("ok") {
                return Ok(Some(value));
            }

            let code = value.get("code").and_then(Value::as_i64).unwrap_or(0);
            let message = value
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();

            match FailureKind::classify(code, &message) {
                FailureKind::Fatal => {
                    tracing::error!(context, code, "fatal auth failure, not retrying");
                    return Err(BrokerError::TokenExpired { code });
                }
                FailureKind::Retryable => {
                    let delay = self.retry_delay(attempt);
                    tracing::warn!(
                        context,
                        code,
                        attempt,
                        "retryable failure: {message}, retrying in {:.1}s",
                        delay.as_secs_f64()
                    );
                    tokio::time::sleep(delay).await;
                }
                FailureKind::Benign => {
                    tracing::info!(context, "no-op response: {message}");
                    return Ok(None);
                }
                FailureKind::Other => {
                    return Err(BrokerError::Rejected { code, message });
                }
            }
        }

        tracing::error!(context, "max retries reached");
        Err(BrokerError::RetriesExhausted {
            context: context.to_string(),
            attempts: MAX_RETRIES,
        })
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        backoff_delay(self.base_delay, attempt, jitter)
    }

    // ── Typed operations ──────────────────────────────────────────────

    /// Last traded price for one symbol
    pub async fn get_ltp(&self, symbol: &str) -> Result<Option<f64>, BrokerError> {
        Ok(self.get_quote(symbol).await?.map(|q| q.ltp))
    }

    /// Full quote for one symbol
    pub async fn get_quote(&self, symbol: &str) -> Result<Option<Quote>, BrokerError> {
        let quotes = self.get_quotes(&[symbol.to_string()]).await?;
        Ok(quotes.into_values().next())
    }

    /// Batch quotes keyed by the symbol as echoed by the broker
    pub async fn get_quotes(
        &self,
        symbols: &[String],
    ) -> Result<HashMap<String, Quote>, BrokerError> {
        let value = match self.call("get_quotes", || self.rest.quotes(symbols)).await? {
            Some(v) => v,
            None => return Ok(HashMap::new()),
        };

        let mut out = HashMap::new();
        for item in value
            .get("d")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let symbol = item.get("n").and_then(Value::as_str).unwrap_or_default();
            let v = &item["v"];
            let Some(ltp) = v.get("lp").and_then(Value::as_f64) else {
                continue;
            };
            out.insert(
                symbol.trim_start_matches("NSE:").trim_start_matches("BSE:").to_string(),
                Quote {
                    ltp,
                    bid: v.get("bid_price").and_then(Value::as_f64),
                    ask: v.get("ask_price").and_then(Value::as_f64),
                },
            );
        }
        Ok(out)
    }

    /// Historical 1-minute (or coarser) candles over the last `days` days
    pub async fn get_history(
        &self,
        symbol: &str,
        resolution: u32,
        days: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<Candle>, BrokerError> {
        let range_to = now.format("%Y-%m-%d").to_string();
        let range_from = (now - ChronoDuration::days(days))
            .format("%Y-%m-%d")
            .to_string();

        let value = match self
            .call("get_history", || {
                self.rest.history(symbol, resolution, &range_from, &range_to)
            })
            .await?
        {
            Some(v) => v,
            None => return Ok(Vec::new()),
        };

        let rows = value
            .get("candles")
            .and_then(Value::as_array)
            .ok_or_else(|| BrokerError::Malformed("history response missing candles".into()))?;

        let mut candles = Vec::with_capacity(rows.len());
        for row in rows {
            let Some(fields) = row.as_array() else {
                continue;
            };
            if fields.len() < 6 {
                continue;
            }
            let ts = fields[0].as_i64().unwrap_or(0);
            let Some(timestamp) = Utc.timestamp_opt(ts, 0).single() else {
                continue;
            };
            candles.push(Candle {
                timestamp,
                open: fields[1].as_f64().unwrap_or(0.0),
                high: fields[2].as_f64().unwrap_or(0.0),
                low: fields[3].as_f64().unwrap_or(0.0),
                close: fields[4].as_f64().unwrap_or(0.0),
                volume: fields[5].as_f64().unwrap_or(0.0),
            });
        }
        Ok(candles)
    }

    /// Equity balance with the configured capital reserve held back
    pub async fn get_balance(&self, capital_reserve: f64) -> Result<f64, BrokerError> {
        let value = match self.call("get_balance", || self.rest.funds()).await? {
            Some(v) => v,
            None => return Ok(0.0),
        };

        let equity = value
            .get("fund_limit")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .find(|row| row.get("id").and_then(Value::as_i64) == Some(10))
            .and_then(|row| row.get("equityAmount"))
            .and_then(Value::as_f64)
            .unwrap_or(0.0);

        Ok(equity * (1.0 - capital_reserve / 100.0))
    }

    /// Place a LIMIT buy; returns the broker order id
    pub async fn place_limit_buy(
        &self,
        symbol: &str,
        qty: u32,
        limit_price: f64,
    ) -> Result<Option<String>, BrokerError> {
        let value = self
            .call("place_order", || {
                self.rest
                    .place_order(symbol, qty, SIDE_BUY, LIMIT_ORDER_TYPE, limit_price)
            })
            .await?;
        Ok(value
            .as_ref()
            .and_then(|v| v.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    /// Sell at market; returns the broker order id
    pub async fn sell_at_market(
        &self,
        symbol: &str,
        qty: u32,
    ) -> Result<Option<String>, BrokerError> {
        let value = self
            .call("sell_at_market", || {
                self.rest
                    .place_order(symbol, qty, SIDE_SELL, MARKET_ORDER_TYPE, 0.0)
            })
            .await?;
        Ok(value
            .as_ref()
            .and_then(|v| v.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    pub async fn cancel_order(&self, broker_id: &str) -> Result<bool, BrokerError> {
        let value = self
            .call("cancel_order", || self.rest.cancel_order(broker_id))
            .await?;
        Ok(value.is_some())
    }

    /// Current broker status code for an order, when known
    pub async fn order_status(&self, broker_id: &str) -> Result<Option<i64>, BrokerError> {
        let value = match self
            .call("order_status", || self.rest.order_status(broker_id))
            .await?
        {
            Some(v) => v,
            None => return Ok(None),
        };

        Ok(value
            .get("orderBook")
            .and_then(Value::as_array)
            .and_then(|rows| rows.first())
            .and_then(|row| row.get("status"))
            .and_then(Value::as_i64))
    }

    pub async fn exit_position(&self, symbol: &str) -> Result<bool, BrokerError> {
        let value = self
            .call("exit_position", || self.rest.exit_position(symbol))
            .await?;
        Ok(value.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn client_for(server: &mockito::Server) -> ResilientBrokerClient {
        let rest = RestBrokerClient::new(server.url(), "TEST-100".to_string());
        rest.set_token(Some("tok".to_string()));
        ResilientBrokerClient::new(rest).with_base_delay(Duration::from_millis(5))
    }

    #[test]
    fn test_backoff_delays_strictly_increase() {
        let base = Duration::from_secs(1);
        let fixed_jitter = 1.0;
        let delays: Vec<Duration> = (0..4).map(|a| backoff_delay(base, a, fixed_jitter)).collect();
        assert!(delays.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(delays[0], Duration::from_secs_f64(2.0));
        assert_eq!(delays[1], Duration::from_secs_f64(3.0));
    }

    #[tokio::test]
    async fn test_fatal_classification_performs_zero_retries() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/funds")
            .with_body(r#"{"s":"error","code":-16,"message":"Your token has expired"}"#)
            .expect(1)
            .create_async()
            .await;

        let client = client_for(&server);
        let err = client.get_balance(0.0).await.unwrap_err();

        assert!(matches!(err, BrokerError::TokenExpired { code: -16 }));
        // Exactly one attempt: the retry counter stayed at zero
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_retryable_succeeds_on_third_attempt() {
        let mut server = mockito::Server::new_async().await;
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        let mock = server
            .mock("GET", "/funds")
            .with_body_from_request(move |_| {
                let n = hits_clone.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    br#"{"s":"error","code":503,"message":"server busy"}"#.to_vec()
                } else {
                    br#"{"s":"ok","fund_limit":[{"id":10,"equityAmount":50000.0}]}"#.to_vec()
                }
            })
            .expect(3)
            .create_async()
            .await;

        let client = client_for(&server);
        let balance = client.get_balance(0.0).await.unwrap();

        assert_eq!(balance, 50000.0);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_retries_exhausted_reports_failure() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/funds")
            .with_body(r#"{"s":"error","code":500,"message":"internal error"}"#)
            .expect(3)
            .create_async()
            .await;

        let client = client_for(&server);
        let err = client.get_balance(0.0).await.unwrap_err();

        assert!(matches!(
            err,
            BrokerError::RetriesExhausted { attempts: 3, .. }
        ));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_benign_failure_returns_no_result_without_retry() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/quotes")
            .match_query(mockito::Matcher::Any)
            .with_body(r#"{"s":"error","code":0,"message":"Market is in closed state"}"#)
            .expect(1)
            .create_async()
            .await;

        let client = client_for(&server);
        let quote = client.get_quote("NIFTY25AUG24500CE").await.unwrap();

        assert!(quote.is_none());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_unclassified_error_fails_without_retry() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/funds")
            .with_body(r#"{"s":"error","code":-50,"message":"unknown condition"}"#)
            .expect(1)
            .create_async()
            .await;

        let client = client_for(&server);
        let err = client.get_balance(0.0).await.unwrap_err();

        assert!(matches!(err, BrokerError::Rejected { code: -50, .. }));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_get_history_parses_rows() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/history")
            .match_query(mockito::Matcher::Any)
            .with_body(
                r#"{"s":"ok","candles":[[60,1.0,2.0,0.5,1.5,10.0],[120,1.5,2.5,1.0,2.0,12.0]]}"#,
            )
            .create_async()
            .await;

        let client = client_for(&server);
        let candles = client
            .get_history("NIFTY", 1, 5, Utc::now())
            .await
            .unwrap();

        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].close, 1.5);
        assert_eq!(candles[1].timestamp.timestamp(), 120);
    }

    #[tokio::test]
    async fn test_balance_applies_capital_reserve() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/funds")
            .with_body(r#"{"s":"ok","fund_limit":[{"id":10,"equityAmount":100000.0}]}"#)
            .create_async()
            .await;

        let client = client_for(&server);
        let balance = client.get_balance(10.0).await.unwrap();
        assert_eq!(balance, 90000.0);
    }
}
