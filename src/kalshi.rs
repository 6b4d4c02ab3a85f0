//! Kalshi exchange client: market discovery, portfolio queries, order
//! management. Authenticated endpoints sign requests with RSA-PSS and all
//! calls are paced through a shared rate limiter.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use governor::{Quota, RateLimiter as GovLimiter};
use reqwest::Client;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::pss::BlindedSigningKey;
use rsa::sha2::Sha256;
use rsa::signature::{RandomizedSigner, SignatureEncoding};
use rsa::RsaPrivateKey;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum KalshiError {
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("Kalshi API {status}: {message}")]
    Api { status: u16, message: String },
    #[error("auth error: {0}")]
    Auth(String),
}

type KalshiResult<T> = std::result::Result<T, KalshiError>;

// ── Wire types ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Yes,
    No,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Yes => write!(f, "yes"),
            Side::No => write!(f, "no"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Buy,
    Sell,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Buy => write!(f, "buy"),
            Action::Sell => write!(f, "sell"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Limit,
    Market,
}

/// A market as returned by GET /trade-api/v2/markets.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Market {
    pub ticker: String,
    #[serde(default)]
    pub event_ticker: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub yes_bid: i64,
    #[serde(default)]
    pub yes_ask: i64,
    #[serde(default)]
    pub no_bid: i64,
    #[serde(default)]
    pub no_ask: i64,
    #[serde(default)]
    pub last_price: i64,
    #[serde(default)]
    pub volume: i64,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub strike_type: Option<String>,
    /// Weather strikes are half-degree values, so floats throughout.
    #[serde(default)]
    pub floor_strike: Option<f64>,
    #[serde(default)]
    pub cap_strike: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarketsResponse {
    pub markets: Vec<Market>,
    #[serde(default)]
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct MarketWrapper {
    market: Market,
}

/// One side of the order book: [price_cents, contracts] levels.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrderBook {
    #[serde(default)]
    pub yes: Vec<(i64, i64)>,
    #[serde(default)]
    pub no: Vec<(i64, i64)>,
}

#[derive(Debug, Clone, Deserialize)]
struct OrderBookWrapper {
    orderbook: OrderBook,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BalanceResponse {
    /// Balance in cents.
    pub balance: i64,
}

/// A portfolio position. Positive = long YES, negative = short YES (NO).
#[derive(Debug, Clone, Deserialize)]
pub struct Position {
    pub ticker: String,
    #[serde(default)]
    pub position: i64,
    /// Cost basis (YES) or proceeds received (NO), in cents.
    #[serde(default)]
    pub market_exposure: i64,
    #[serde(default)]
    pub realized_pnl: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PositionsResponse {
    #[serde(default)]
    pub market_positions: Vec<Position>,
    #[serde(default)]
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderInfo {
    pub order_id: String,
    #[serde(default)]
    pub client_order_id: String,
    pub ticker: String,
    pub side: Side,
    pub action: Action,
    pub status: String,
    #[serde(default)]
    pub yes_price: i64,
    #[serde(default)]
    pub no_price: i64,
    #[serde(default)]
    pub fill_count: i64,
    #[serde(default)]
    pub initial_count: i64,
    #[serde(default)]
    pub taker_fees: i64,
    #[serde(default)]
    pub created_time: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrdersResponse {
    #[serde(default)]
    pub orders: Vec<OrderInfo>,
    #[serde(default)]
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateOrderResponse {
    pub order: OrderInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeStatus {
    #[serde(default)]
    pub exchange_active: bool,
    #[serde(default)]
    pub trading_active: bool,
}

#[derive(Debug, Serialize)]
struct CreateOrderRequest {
    ticker: String,
    action: Action,
    side: Side,
    count: i64,
    #[serde(rename = "type")]
    order_type: OrderType,
    client_order_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    yes_price: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    no_price: Option<i64>,
}

/// An order to place: side-specific limit price in cents (1-99).
#[derive(Debug, Clone)]
pub struct OrderIntent {
    pub ticker: String,
    pub action: Action,
    pub side: Side,
    pub count: i64,
    pub price_cents: i64,
}

// ── Fees ──────────────────────────────────────────────────────────────

/// Exchange fee schedule for weather markets.
///
/// Taker formula: `ceil_to_cent(coeff × C × P × (1 − P))` with P in dollars.
#[derive(Debug, Clone)]
pub struct FeeSchedule {
    pub taker_coeff: f64,
}

impl FeeSchedule {
    pub fn weather() -> Self {
        Self { taker_coeff: 0.07 }
    }

    /// Taker fee in cents, rounded up to the next cent.
    pub fn taker_fee_cents(&self, count: i64, price_cents: i64) -> i64 {
        let p = price_cents as f64 / 100.0;
        let fee_cents = self.taker_coeff * (count as f64) * p * (1.0 - p) * 100.0;
        // Epsilon guards the x.9999 float representations of exact cents.
        (fee_cents - 1e-9).ceil().max(0.0) as i64
    }
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self::weather()
    }
}

// ── Auth ──────────────────────────────────────────────────────────────

/// API credentials plus the parsed RSA signing key.
#[derive(Clone)]
pub struct KalshiAuth {
    pub api_key_id: String,
    signing_key: BlindedSigningKey<Sha256>,
}

impl std::fmt::Debug for KalshiAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KalshiAuth")
            .field("api_key_id", &self.api_key_id)
            .field("signing_key", &"<redacted>")
            .finish()
    }
}

impl KalshiAuth {
    /// Parse a PEM private key (PKCS#1 or PKCS#8; literal `\n` normalized).
    pub fn new(api_key_id: &str, pem_string: &str) -> KalshiResult<Self> {
        let pem = pem_string.replace("\\n", "\n");
        let pem = pem.trim();

        let private_key = RsaPrivateKey::from_pkcs1_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs8_pem(pem))
            .map_err(|e| KalshiError::Auth(format!("Failed to parse RSA private key: {e}")))?;

        Ok(Self {
            api_key_id: api_key_id.to_string(),
            signing_key: BlindedSigningKey::<Sha256>::new(private_key),
        })
    }

    pub fn from_key_file(api_key_id: &str, path: &str) -> KalshiResult<Self> {
        let pem = std::fs::read_to_string(path)
            .map_err(|e| KalshiError::Auth(format!("Failed to read private key {path}: {e}")))?;
        Self::new(api_key_id, &pem)
    }

    /// Sign `{timestamp_ms}{METHOD}{path_without_query}` with PSS/SHA-256.
    /// Returns `(timestamp_ms, base64_signature)`.
    pub fn sign_request(&self, method: &str, path: &str) -> (String, String) {
        let timestamp = chrono::Utc::now().timestamp_millis().to_string();
        let path_clean = path.split('?').next().unwrap_or(path);

        let message = format!("{}{}{}", timestamp, method, path_clean);
        let mut rng = rand::thread_rng();
        let signature = self.signing_key.sign_with_rng(&mut rng, message.as_bytes());
        let sig_b64 = base64::engine::general_purpose::STANDARD.encode(signature.to_bytes());

        (timestamp, sig_b64)
    }

    fn headers(&self, method: &str, path: &str) -> KalshiResult<reqwest::header::HeaderMap> {
        let (timestamp, signature) = self.sign_request(method, path);

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            "KALSHI-ACCESS-KEY",
            self.api_key_id
                .parse()
                .map_err(|_| KalshiError::Auth("invalid api key header".into()))?,
        );
        headers.insert(
            "KALSHI-ACCESS-TIMESTAMP",
            timestamp
                .parse()
                .map_err(|_| KalshiError::Auth("invalid timestamp header".into()))?,
        );
        headers.insert(
            "KALSHI-ACCESS-SIGNATURE",
            signature
                .parse()
                .map_err(|_| KalshiError::Auth("invalid signature header".into()))?,
        );
        Ok(headers)
    }
}

// ── Client ────────────────────────────────────────────────────────────

type DirectLimiter = GovLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

#[derive(Clone)]
pub struct KalshiClient {
    client: Client,
    base_url: String,
    auth: Option<KalshiAuth>,
    limiter: Arc<DirectLimiter>,
    max_retries: u32,
}

impl KalshiClient {
    pub fn new(base_url: &str, auth: Option<KalshiAuth>, timeout_secs: u64) -> KalshiResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| KalshiError::Http(format!("Failed to build HTTP client: {e}")))?;

        Ok(KalshiClient {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth,
            // ~3 requests/sec keeps authenticated calls >=350ms apart.
            limiter: Arc::new(GovLimiter::direct(Quota::per_second(
                NonZeroU32::new(3).expect("nonzero quota"),
            ))),
            max_retries: 1,
        })
    }

    #[cfg(test)]
    pub fn with_client(client: Client, base_url: String, auth: Option<KalshiAuth>) -> Self {
        KalshiClient {
            client,
            base_url,
            auth,
            limiter: Arc::new(GovLimiter::direct(Quota::per_second(
                NonZeroU32::new(100).unwrap(),
            ))),
            max_retries: 1,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn auth_headers(&self, method: &str, path: &str) -> KalshiResult<reqwest::header::HeaderMap> {
        match &self.auth {
            Some(auth) => auth.headers(method, path),
            None => Err(KalshiError::Auth(
                "no credentials loaded for authenticated endpoint".into(),
            )),
        }
    }

    /// Send with retry-at-most-once on timeouts, 429, and 5xx.
    async fn send_with_retry<T: serde::de::DeserializeOwned>(
        &self,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> KalshiResult<T> {
        let mut last_err = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                debug!("Retrying request (attempt {})", attempt + 1);
                tokio::time::sleep(Duration::from_millis(500)).await;
            }

            self.limiter.until_ready().await;

            match build().send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return resp
                            .json::<T>()
                            .await
                            .map_err(|e| KalshiError::Http(format!("parse failure: {e}")));
                    }
                    let body = resp.text().await.unwrap_or_default();
                    let body: String = body.chars().take(500).collect();
                    if status.as_u16() == 429 || status.is_server_error() {
                        warn!("Kalshi API returned {}: {}", status, body);
                        last_err = Some(KalshiError::Api {
                            status: status.as_u16(),
                            message: body,
                        });
                        continue;
                    }
                    // 4xx other than 429: not retryable
                    return Err(KalshiError::Api {
                        status: status.as_u16(),
                        message: body,
                    });
                }
                Err(e) => {
                    warn!("Kalshi request failed: {}", e);
                    last_err = Some(KalshiError::Http(e.to_string()));
                }
            }
        }
        Err(last_err.unwrap_or_else(|| KalshiError::Http("request failed after retry".into())))
    }

    // ── Market data (public) ──────────────────────────────────────────

    /// Markets matching an event or series ticker, following cursors.
    pub async fn get_markets(
        &self,
        event_ticker: Option<&str>,
        series_ticker: Option<&str>,
        status: Option<&str>,
        limit: u32,
    ) -> KalshiResult<Vec<Market>> {
        let mut all_markets = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let path = "/trade-api/v2/markets";
            let cursor_param = cursor.clone();
            let resp: MarketsResponse = self
                .send_with_retry(|| {
                    let mut req = self.client.get(self.url(path));
                    if let Some(et) = event_ticker {
                        req = req.query(&[("event_ticker", et)]);
                    }
                    if let Some(st) = series_ticker {
                        req = req.query(&[("series_ticker", st)]);
                    }
                    if let Some(s) = status {
                        req = req.query(&[("status", s)]);
                    }
                    req = req.query(&[("limit", &limit.to_string())]);
                    if let Some(ref c) = cursor_param {
                        req = req.query(&[("cursor", c.as_str())]);
                    }
                    req
                })
                .await?;

            let count = resp.markets.len();
            all_markets.extend(resp.markets);
            debug!("Fetched {} markets (total: {})", count, all_markets.len());

            match resp.cursor {
                Some(c) if !c.is_empty() => cursor = Some(c),
                _ => break,
            }
        }

        Ok(all_markets)
    }

    /// All open markets for one weather event, e.g. "KXHIGHNY-26FEB18".
    pub async fn get_event_markets(&self, event_ticker: &str) -> KalshiResult<Vec<Market>> {
        self.get_markets(Some(event_ticker), None, Some("open"), 100)
            .await
    }

    pub async fn get_market(&self, ticker: &str) -> KalshiResult<Market> {
        let path = format!("/trade-api/v2/markets/{}", ticker);
        let w: MarketWrapper = self
            .send_with_retry(|| self.client.get(self.url(&path)))
            .await?;
        Ok(w.market)
    }

    pub async fn get_orderbook(&self, ticker: &str) -> KalshiResult<OrderBook> {
        let path = format!("/trade-api/v2/markets/{}/orderbook", ticker);
        let w: OrderBookWrapper = self
            .send_with_retry(|| self.client.get(self.url(&path)))
            .await?;
        Ok(w.orderbook)
    }

    pub async fn get_event(&self, event_ticker: &str) -> KalshiResult<serde_json::Value> {
        let path = format!("/trade-api/v2/events/{}", event_ticker);
        self.send_with_retry(|| self.client.get(self.url(&path)))
            .await
    }

    pub async fn exchange_status(&self) -> KalshiResult<ExchangeStatus> {
        let path = "/trade-api/v2/exchange/status";
        self.send_with_retry(|| self.client.get(self.url(path)))
            .await
    }

    // ── Portfolio (authenticated) ─────────────────────────────────────

    pub async fn get_balance(&self) -> KalshiResult<i64> {
        let path = "/trade-api/v2/portfolio/balance";
        let headers = self.auth_headers("GET", path)?;
        let resp: BalanceResponse = self
            .send_with_retry(|| self.client.get(self.url(path)).headers(headers.clone()))
            .await?;
        Ok(resp.balance)
    }

    pub async fn get_positions(&self) -> KalshiResult<Vec<Position>> {
        let mut all_positions = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let path = "/trade-api/v2/portfolio/positions";
            let headers = self.auth_headers("GET", path)?;
            let cursor_param = cursor.clone();
            let resp: PositionsResponse = self
                .send_with_retry(|| {
                    let mut req = self
                        .client
                        .get(self.url(path))
                        .headers(headers.clone())
                        .query(&[("limit", "200")]);
                    if let Some(ref c) = cursor_param {
                        req = req.query(&[("cursor", c.as_str())]);
                    }
                    req
                })
                .await?;

            all_positions.extend(resp.market_positions);
            match resp.cursor {
                Some(c) if !c.is_empty() => cursor = Some(c),
                _ => break,
            }
        }

        Ok(all_positions)
    }

    pub async fn get_orders(&self, status: Option<&str>) -> KalshiResult<Vec<OrderInfo>> {
        let path = "/trade-api/v2/portfolio/orders";
        let headers = self.auth_headers("GET", path)?;
        let resp: OrdersResponse = self
            .send_with_retry(|| {
                let mut req = self.client.get(self.url(path)).headers(headers.clone());
                if let Some(s) = status {
                    req = req.query(&[("status", s)]);
                }
                req
            })
            .await?;
        Ok(resp.orders)
    }

    /// Place a limit order. The limit price lands on the yes or no side of
    /// the payload according to the intent's side.
    pub async fn create_order(&self, intent: &OrderIntent) -> KalshiResult<OrderInfo> {
        let path = "/trade-api/v2/portfolio/orders";
        let headers = self.auth_headers("POST", path)?;

        let (yes_price, no_price) = match intent.side {
            Side::Yes => (Some(intent.price_cents), None),
            Side::No => (None, Some(intent.price_cents)),
        };

        let body = CreateOrderRequest {
            ticker: intent.ticker.clone(),
            action: intent.action,
            side: intent.side,
            count: intent.count,
            order_type: OrderType::Limit,
            client_order_id: Uuid::new_v4().to_string(),
            yes_price,
            no_price,
        };

        debug!(
            "Placing order: {} {} {} x{} @ {}¢",
            intent.action, intent.side, intent.ticker, intent.count, intent.price_cents,
        );

        let resp: CreateOrderResponse = self
            .send_with_retry(|| {
                self.client
                    .post(self.url(path))
                    .headers(headers.clone())
                    .json(&body)
            })
            .await?;
        Ok(resp.order)
    }

    pub async fn cancel_order(&self, order_id: &str) -> KalshiResult<()> {
        let path = format!("/trade-api/v2/portfolio/orders/{}", order_id);
        let headers = self.auth_headers("DELETE", &path)?;
        let _: serde_json::Value = self
            .send_with_retry(|| self.client.delete(self.url(&path)).headers(headers.clone()))
            .await?;
        debug!("Cancelled order: {}", order_id);
        Ok(())
    }
}
