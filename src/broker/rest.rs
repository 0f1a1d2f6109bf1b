use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::options::wire_symbol;

const HTTP_TIMEOUT_SECS: u64 = 30;

/// Quote fields extracted from the broker's batch quote response
#[derive(Debug, Clone, Deserialize)]
pub struct Quote {
    pub ltp: f64,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
}

/// Raw REST transport to the broker.
///
/// Every method issues exactly one HTTP request and returns the broker's
/// JSON envelope `{ "s": "ok"|"error", "code": .., "message": .., ... }`
/// untouched; classification and retries live in the resilient layer.
/// Symbols are normalized to `EXCHANGE:SYMBOL` here, at the wire.
#[derive(Clone)]
pub struct RestBrokerClient {
    client: Client,
    base_url: String,
    client_id: String,
    token: Arc<RwLock<Option<String>>>,
}

impl RestBrokerClient {
    pub fn new(base_url: String, client_id: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url,
            client_id,
            token: Arc::new(RwLock::new(None)),
        }
    }

    /// Install a fresh access token (re-authentication)
    pub fn set_token(&self, token: Option<String>) {
        *self.token.write().unwrap_or_else(|e| e.into_inner()) = token;
    }

    pub fn has_token(&self) -> bool {
        self.token
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    fn auth_header(&self) -> String {
        let token = self
            .token
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .unwrap_or_default();
        format!("{}:{}", self.client_id, token)
    }

    /// Turn an HTTP response into the broker envelope. Non-2xx statuses
    /// without a JSON body become synthetic error envelopes so the
    /// classifier sees one uniform shape.
    async fn into_envelope(response: reqwest::Response) -> Result<Value, reqwest::Error> {
        let status = response.status();
        if let Ok(value) = response.json::<Value>().await {
            return Ok(value);
        }
        Ok(json!({
            "s": "error",
            "code": status.as_u16(),
            "message": format!("HTTP {}", status),
        }))
    }

    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<Value, reqwest::Error> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .header("Authorization", self.auth_header())
            .query(query)
            .send()
            .await?;
        Self::into_envelope(response).await
    }

    async fn send_json(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Value,
    ) -> Result<Value, reqwest::Error> {
        let response = self
            .client
            .request(method, format!("{}{}", self.base_url, path))
            .header("Authorization", self.auth_header())
            .json(&body)
            .send()
            .await?;
        Self::into_envelope(response).await
    }

    /// GET /quotes?symbols=EXCHANGE:SYMBOL[,..]
    pub async fn quotes(&self, symbols: &[String]) -> Result<Value, reqwest::Error> {
        let joined = symbols
            .iter()
            .map(|s| wire_symbol(s))
            .collect::<Vec<_>>()
            .join(",");
        self.get("/quotes", &[("symbols", joined)]).await
    }

    /// GET /history?symbol=..&resolution=..&range_from=..&range_to=..
    pub async fn history(
        &self,
        symbol: &str,
        resolution: u32,
        range_from: &str,
        range_to: &str,
    ) -> Result<Value, reqwest::Error> {
        self.get(
            "/history",
            &[
                ("symbol", wire_symbol(symbol)),
                ("resolution", resolution.to_string()),
                ("date_format", "1".to_string()),
                ("range_from", range_from.to_string()),
                ("range_to", range_to.to_string()),
                ("cont_flag", "1".to_string()),
            ],
        )
        .await
    }

    /// GET /funds
    pub async fn funds(&self) -> Result<Value, reqwest::Error> {
        self.get("/funds", &[]).await
    }

    /// POST /orders
    pub async fn place_order(
        &self,
        symbol: &str,
        qty: u32,
        side: i32,
        order_type: i32,
        limit_price: f64,
    ) -> Result<Value, reqwest::Error> {
        let body = json!({
            "symbol": wire_symbol(symbol),
            "qty": qty,
            "type": order_type,
            "side": side,
            "productType": "MARGIN",
            "limitPrice": limit_price,
            "stopPrice": 0,
            "validity": "DAY",
            "disclosedQty": 0,
            "offlineOrder": false,
        });
        self.send_json(reqwest::Method::POST, "/orders", body).await
    }

    /// DELETE /orders
    pub async fn cancel_order(&self, broker_id: &str) -> Result<Value, reqwest::Error> {
        self.send_json(reqwest::Method::DELETE, "/orders", json!({ "id": broker_id }))
            .await
    }

    /// GET /orders?id=..
    pub async fn order_status(&self, broker_id: &str) -> Result<Value, reqwest::Error> {
        self.get("/orders", &[("id", broker_id.to_string())]).await
    }

    /// POST /positions/exit
    pub async fn exit_position(&self, symbol: &str) -> Result<Value, reqwest::Error> {
        let body = json!({ "id": format!("{}-MARGIN", wire_symbol(symbol)) });
        self.send_json(reqwest::Method::POST, "/positions/exit", body)
            .await
    }
}
