// =============================================================================
// Binance adapter: HMAC-SHA256 signed REST + market-data WebSockets
// =============================================================================
//
// Covers both halves of a pair: spot orders go to api.binance.com, perp
// orders to the USD-M futures API at fapi.binance.com. Liquidations come from
// the futures @forceOrder stream, books from the @depth20@100ms streams.
//
// SECURITY: the secret key is never logged or serialized. All signed requests
// carry X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use rust_decimal::Decimal;
use sha2::Sha256;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

use crate::market_data::book::{BookLevel, BookSnapshot};
use crate::market_data::liquidation::LiquidationEvent;
use crate::types::{now_ms, MarketKind, Side, WalletKind};
use crate::venue::rate_limit::RateLimitTracker;
use crate::venue::{
    ExecutionEvent, FundingPayment, OrderKind, VenueAdapter, VenueOrderRequest, WalletBalances,
};

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

/// Binance venue adapter with HMAC-SHA256 request signing.
#[derive(Clone)]
pub struct BinanceVenue {
    api_key: String,
    secret: String,
    spot_base: String,
    futures_base: String,
    spot_ws: String,
    futures_ws: String,
    client: reqwest::Client,
    rate_limit: Arc<RateLimitTracker>,
}

impl BinanceVenue {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        debug!("BinanceVenue initialised");

        Self {
            api_key,
            secret,
            spot_base: "https://api.binance.com".to_string(),
            futures_base: "https://fapi.binance.com".to_string(),
            spot_ws: "wss://stream.binance.com:9443".to_string(),
            futures_ws: "wss://fstream.binance.com".to_string(),
            client,
            rate_limit: Arc::new(RateLimitTracker::new()),
        }
    }

    pub fn rate_limit(&self) -> &RateLimitTracker {
        &self.rate_limit
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// HMAC-SHA256 hex signature of `query`.
    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Full query string for a signed request (appends timestamp, recvWindow
    /// and signature).
    fn signed_query(&self, params: &str) -> String {
        let ts = now_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    async fn signed_call(
        &self,
        method: reqwest::Method,
        base: &str,
        path: &str,
        params: &str,
    ) -> Result<serde_json::Value> {
        if !self.rate_limit.can_send_request(1) {
            anyhow::bail!("rate limit budget exhausted for {path}");
        }
        let qs = self.signed_query(params);
        let url = format!("{base}{path}?{qs}");

        let resp = self
            .client
            .request(method.clone(), &url)
            .send()
            .await
            .with_context(|| format!("{method} {path} request failed"))?;

        self.rate_limit.update_from_headers(resp.headers());

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {path} response"))?;

        if !status.is_success() {
            anyhow::bail!("Binance {method} {path} returned {status}: {body}");
        }
        Ok(body)
    }

    fn base_for(&self, market: MarketKind) -> (&str, &str) {
        match market {
            MarketKind::Spot => (self.spot_base.as_str(), "/api/v3/order"),
            MarketKind::Perp => (self.futures_base.as_str(), "/fapi/v1/order"),
        }
    }

    /// Parse a JSON value that may be either a string or a number into `f64`.
    fn parse_str_f64(val: &serde_json::Value) -> f64 {
        if let Some(s) = val.as_str() {
            s.parse().unwrap_or(0.0)
        } else {
            val.as_f64().unwrap_or(0.0)
        }
    }

    fn parse_str_decimal(val: &serde_json::Value) -> Decimal {
        val.as_str()
            .and_then(|s| s.parse().ok())
            .unwrap_or_default()
    }
}

// =============================================================================
// Market-data parsing
// =============================================================================

/// Parse a partial-depth message into full bid/ask level arrays.
///
/// Spot shape: `{"lastUpdateId": 123, "bids": [["p","q"],...], "asks": ...}`
/// Futures wraps the same fields in an event envelope with `"e":"depthUpdate"`.
fn parse_depth_message(text: &str) -> Result<(Vec<BookLevel>, Vec<BookLevel>, u64)> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse depth JSON")?;
    let obj = if root.get("lastUpdateId").is_some() {
        &root
    } else if let Some(data) = root.get("data") {
        data
    } else {
        &root
    };

    let seq = obj
        .get("lastUpdateId")
        .or_else(|| obj.get("u"))
        .and_then(|v| v.as_u64())
        .context("depth message missing update id")?;

    let parse_side = |key: &str, alt: &str| -> Vec<BookLevel> {
        obj.get(key)
            .or_else(|| obj.get(alt))
            .and_then(|v| v.as_array())
            .map(|levels| {
                levels
                    .iter()
                    .filter_map(|entry| {
                        let price: f64 = entry.get(0)?.as_str()?.parse().ok()?;
                        let size: f64 = entry.get(1)?.as_str()?.parse().ok()?;
                        Some(BookLevel { price, size })
                    })
                    .collect()
            })
            .unwrap_or_default()
    };

    Ok((parse_side("bids", "b"), parse_side("asks", "a"), seq))
}

/// Parse a futures `forceOrder` message into a `LiquidationEvent`.
///
/// A SELL liquidation order means longs were force-closed; our convention
/// records the side of the liquidated position.
fn parse_force_order(text: &str) -> Result<LiquidationEvent> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse forceOrder JSON")?;
    let order = root
        .get("o")
        .or_else(|| root.get("data").and_then(|d| d.get("o")))
        .context("forceOrder message missing order object")?;

    let symbol = order
        .get("s")
        .and_then(|v| v.as_str())
        .context("forceOrder missing symbol")?
        .to_string();
    let order_side = order
        .get("S")
        .and_then(|v| v.as_str())
        .context("forceOrder missing side")?;
    let qty = BinanceVenue::parse_str_f64(order.get("q").unwrap_or(&serde_json::Value::Null));
    let price = BinanceVenue::parse_str_f64(
        order
            .get("ap")
            .or_else(|| order.get("p"))
            .unwrap_or(&serde_json::Value::Null),
    );
    let at_ms = order.get("T").and_then(|v| v.as_i64()).unwrap_or_else(now_ms);

    Ok(LiquidationEvent {
        venue: "binance".to_string(),
        symbol,
        side: if order_side == "SELL" { Side::Buy } else { Side::Sell },
        notional: qty * price,
        price,
        at_ms,
    })
}

/// Run one WebSocket stream, forwarding parsed messages until disconnect.
async fn run_ws_stream<T, F>(url: String, tx: mpsc::Sender<T>, parse: F)
where
    T: Send + 'static,
    F: Fn(&str) -> Result<T> + Send + 'static,
{
    loop {
        let (ws_stream, _) = match tokio_tungstenite::connect_async(&url).await {
            Ok(conn) => conn,
            Err(e) => {
                error!(url = %url, error = %e, "WebSocket connect failed, retrying in 5s");
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                continue;
            }
        };
        info!(url = %url, "WebSocket connected");
        let (_write, mut read) = ws_stream.split();

        while let Some(message) = read.next().await {
            match message {
                Ok(tokio_tungstenite::tungstenite::Message::Text(text)) => {
                    match parse(&text) {
                        Ok(parsed) => {
                            if tx.send(parsed).await.is_err() {
                                return; // consumer gone
                            }
                        }
                        Err(e) => warn!(error = %e, "failed to parse WebSocket message"),
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error!(url = %url, error = %e, "WebSocket read error");
                    break;
                }
            }
        }
        warn!(url = %url, "WebSocket stream ended, reconnecting in 5s");
        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
    }
}

// =============================================================================
// VenueAdapter implementation
// =============================================================================

#[async_trait]
impl VenueAdapter for BinanceVenue {
    fn id(&self) -> &str {
        "binance"
    }

    async fn subscribe_book(
        &self,
        instrument: &str,
        market: MarketKind,
    ) -> Result<mpsc::Receiver<BookSnapshot>> {
        let lower = instrument.to_lowercase();
        let url = match market {
            MarketKind::Spot => format!("{}/ws/{}@depth20@100ms", self.spot_ws, lower),
            MarketKind::Perp => format!("{}/ws/{}@depth20@100ms", self.futures_ws, lower),
        };
        let (tx, rx) = mpsc::channel(64);
        let instrument = instrument.to_string();
        tokio::spawn(run_ws_stream(url, tx, move |text| {
            let (bids, asks, seq) = parse_depth_message(text)?;
            Ok(BookSnapshot {
                venue: "binance".to_string(),
                symbol: instrument.clone(),
                market,
                bids,
                asks,
                seq,
                at_ms: now_ms(),
            })
        }));
        Ok(rx)
    }

    async fn subscribe_liquidations(
        &self,
        instrument: &str,
    ) -> Result<mpsc::Receiver<LiquidationEvent>> {
        let url = format!("{}/ws/{}@forceOrder", self.futures_ws, instrument.to_lowercase());
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(run_ws_stream(url, tx, parse_force_order));
        Ok(rx)
    }

    async fn subscribe_execution(&self) -> Result<mpsc::Receiver<ExecutionEvent>> {
        // Futures user-data stream; order updates arrive as ORDER_TRADE_UPDATE.
        let listen_key: serde_json::Value = self
            .client
            .post(format!("{}/fapi/v1/listenKey", self.futures_base))
            .send()
            .await
            .context("listenKey request failed")?
            .json()
            .await
            .context("failed to parse listenKey response")?;
        let key = listen_key["listenKey"]
            .as_str()
            .context("listenKey missing in response")?
            .to_string();

        // Keepalive ping every 30 minutes, per Binance docs.
        {
            let client = self.client.clone();
            let base = self.futures_base.clone();
            tokio::spawn(async move {
                let mut interval =
                    tokio::time::interval(std::time::Duration::from_secs(30 * 60));
                interval.tick().await;
                loop {
                    interval.tick().await;
                    if let Err(e) = client
                        .put(format!("{base}/fapi/v1/listenKey"))
                        .send()
                        .await
                    {
                        warn!(error = %e, "listenKey keepalive failed");
                    }
                }
            });
        }

        let url = format!("{}/ws/{}", self.futures_ws, key);
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(run_ws_stream(url, tx, |text| {
            let root: serde_json::Value =
                serde_json::from_str(text).context("failed to parse user stream JSON")?;
            if root["e"].as_str() != Some("ORDER_TRADE_UPDATE") {
                anyhow::bail!("not an order update");
            }
            let order = &root["o"];
            let leg_order_id = order["i"]
                .as_u64()
                .map(|id| id.to_string())
                .context("order update missing id")?;
            let status = order["X"].as_str().unwrap_or("");
            let last_qty = BinanceVenue::parse_str_f64(&order["l"]);
            match status {
                "PARTIALLY_FILLED" | "FILLED" if last_qty > 0.0 => Ok(ExecutionEvent::Fill {
                    leg_order_id,
                    price: BinanceVenue::parse_str_f64(&order["L"]),
                    qty: last_qty,
                    fee: BinanceVenue::parse_str_f64(&order["n"]),
                    t_exchange: order["T"].as_i64().unwrap_or_else(now_ms),
                }),
                "REJECTED" => Ok(ExecutionEvent::Rejected {
                    leg_order_id,
                    reason: order["r"].as_str().unwrap_or("rejected").to_string(),
                }),
                "CANCELED" => Ok(ExecutionEvent::Canceled { leg_order_id }),
                "EXPIRED" => Ok(ExecutionEvent::Expired { leg_order_id }),
                other => anyhow::bail!("ignoring order status {other}"),
            }
        }));
        Ok(rx)
    }

    #[instrument(skip(self, request), fields(instrument = %request.instrument, side = %request.side))]
    async fn place_order(&self, request: VenueOrderRequest) -> Result<String> {
        if !self.rate_limit.can_place_order() {
            anyhow::bail!("order rate limit reached");
        }

        let (base, path) = self.base_for(request.market);

        let mut params = format!(
            "symbol={}&side={}&quantity={}&newClientOrderId={}",
            request.instrument, request.side, request.qty, request.client_tag
        );
        match request.kind {
            OrderKind::LimitPostOnly => {
                let price = request.price.context("post-only order requires a price")?;
                match request.market {
                    // Spot expresses post-only as LIMIT_MAKER; futures as GTX.
                    MarketKind::Spot => {
                        params.push_str(&format!("&type=LIMIT_MAKER&price={price}"))
                    }
                    MarketKind::Perp => params
                        .push_str(&format!("&type=LIMIT&timeInForce=GTX&price={price}")),
                }
            }
            OrderKind::LimitGtc => {
                let price = request.price.context("limit order requires a price")?;
                params.push_str(&format!("&type=LIMIT&timeInForce=GTC&price={price}"));
            }
            OrderKind::Ioc => {
                let price = request.price.context("IOC order requires a price")?;
                params.push_str(&format!("&type=LIMIT&timeInForce=IOC&price={price}"));
            }
            OrderKind::Market => params.push_str("&type=MARKET"),
        }

        let body = self
            .signed_call(reqwest::Method::POST, base, path, &params)
            .await?;
        self.rate_limit.record_order_sent();

        let order_id = body["orderId"]
            .as_u64()
            .context("order response missing orderId")?;
        debug!(order_id, "order placed");
        Ok(order_id.to_string())
    }

    async fn cancel_order(&self, instrument: &str, leg_order_id: &str) -> Result<()> {
        // Try futures first; fall back to spot. The instrument string is the
        // same on both halves for Binance USD-M pairs.
        let params = format!("symbol={instrument}&orderId={leg_order_id}");
        let futures = self
            .signed_call(
                reqwest::Method::DELETE,
                &self.futures_base,
                "/fapi/v1/order",
                &params,
            )
            .await;
        if futures.is_ok() {
            return Ok(());
        }
        self.signed_call(
            reqwest::Method::DELETE,
            &self.spot_base,
            "/api/v3/order",
            &params,
        )
        .await
        .map(|_| ())
    }

    async fn wallet_balances(&self) -> Result<WalletBalances> {
        let mut balances = WalletBalances::default();

        let spot = self
            .signed_call(reqwest::Method::GET, &self.spot_base, "/api/v3/account", "")
            .await?;
        if let Some(assets) = spot["balances"].as_array() {
            for asset in assets {
                let name = asset["asset"].as_str().unwrap_or("");
                let free = Self::parse_str_decimal(&asset["free"]);
                if free.is_zero() {
                    continue;
                }
                if name == "USDT" {
                    balances.spot_usdt = free;
                } else {
                    balances.spot_assets.insert(name.to_string(), free);
                }
            }
        }

        let futures = self
            .signed_call(
                reqwest::Method::GET,
                &self.futures_base,
                "/fapi/v2/balance",
                "",
            )
            .await?;
        if let Some(entries) = futures.as_array() {
            for entry in entries {
                if entry["asset"].as_str() == Some("USDT") {
                    balances.perp_margin = Self::parse_str_decimal(&entry["balance"]);
                }
            }
        }

        Ok(balances)
    }

    async fn funding_flows(
        &self,
        instrument: &str,
        since_ms: i64,
    ) -> Result<Vec<FundingPayment>> {
        let params = format!(
            "symbol={instrument}&incomeType=FUNDING_FEE&startTime={}&limit=1000",
            since_ms.max(0)
        );
        let body = self
            .signed_call(
                reqwest::Method::GET,
                &self.futures_base,
                "/fapi/v1/income",
                &params,
            )
            .await?;

        let mut flows = Vec::new();
        if let Some(entries) = body.as_array() {
            for entry in entries {
                let amount = Self::parse_str_f64(&entry["income"]);
                let at_ms = entry["time"].as_i64().unwrap_or(0);
                if at_ms > since_ms {
                    flows.push(FundingPayment {
                        instrument: instrument.to_string(),
                        amount,
                        at_ms,
                    });
                }
            }
        }
        flows.sort_by_key(|f| f.at_ms);
        Ok(flows)
    }

    async fn transfer(&self, from: WalletKind, to: WalletKind, amount: Decimal) -> Result<()> {
        let transfer_type = match (from, to) {
            (WalletKind::Spot, WalletKind::PerpMargin) => "MAIN_UMFUTURE",
            (WalletKind::PerpMargin, WalletKind::Spot) => "UMFUTURE_MAIN",
            _ => anyhow::bail!("unsupported transfer {from} -> {to}"),
        };
        let params = format!("type={transfer_type}&asset=USDT&amount={amount}");
        self.signed_call(
            reqwest::Method::POST,
            &self.spot_base,
            "/sapi/v1/asset/transfer",
            &params,
        )
        .await?;
        info!(%from, %to, %amount, "wallet transfer submitted");
        Ok(())
    }
}

impl std::fmt::Debug for BinanceVenue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceVenue")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("spot_base", &self.spot_base)
            .field("futures_base", &self.futures_base)
            .finish()
    }
}
