use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::config::BinanceEndpoints;
use common::models::{AccountMode, OrderResult, UserTradingProfile};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use sha2::Sha256;
use tracing::{debug, info, warn};

use crate::{
    error::ExchangeError,
    traits::{ClientFactory, ExchangeClient, OrderRequest},
};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Deserialize)]
pub struct OrderResponse {
    #[serde(rename = "orderId")]
    pub order_id: u64,
    pub symbol: String,
    pub status: String,
    #[serde(rename = "executedQty")]
    pub executed_qty: String,
}

#[derive(Debug, Deserialize)]
pub struct Balance {
    pub asset: String,
    pub free: String,
    pub locked: String,
}

#[derive(Debug, Deserialize)]
pub struct AccountInformation {
    pub balances: Vec<Balance>,
    #[serde(rename = "canTrade")]
    pub can_trade: bool,
}

#[derive(Debug, Deserialize)]
struct TickerPrice {
    price: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: i64,
    msg: String,
}

/// Signed REST session for one user's Binance keys.
pub struct BinanceClient {
    client: Client,
    base_url: String,
    api_key: SecretString,
    secret_key: SecretString,
    recv_window_ms: u64,
}

impl BinanceClient {
    pub fn new(
        client: Client,
        base_url: String,
        api_key: SecretString,
        secret_key: SecretString,
        recv_window_ms: u64,
    ) -> Self {
        Self {
            client,
            base_url,
            api_key,
            secret_key,
            recv_window_ms,
        }
    }

    fn sign(&self, query: &str) -> String {
        sign_query(self.secret_key.expose_secret(), query)
    }

    async fn signed_request(
        &self,
        method: Method,
        path: &str,
        params: &str,
    ) -> Result<Response, ExchangeError> {
        let timestamp = chrono::Utc::now().timestamp_millis();
        let params = if params.is_empty() {
            format!("recvWindow={}&timestamp={}", self.recv_window_ms, timestamp)
        } else {
            format!(
                "{}&recvWindow={}&timestamp={}",
                params, self.recv_window_ms, timestamp
            )
        };
        let signature = self.sign(&params);
        let url = format!("{}{}?{}&signature={}", self.base_url, path, params, signature);

        let resp = self
            .client
            .request(method, &url)
            .header("X-MBX-APIKEY", self.api_key.expose_secret())
            .send()
            .await?;

        log_used_weight(&resp);
        Ok(resp)
    }

    pub async fn get_account(&self) -> Result<AccountInformation, ExchangeError> {
        let resp = self.signed_request(Method::GET, "/api/v3/account", "").await?;
        let resp = ensure_success(resp).await?;
        Ok(resp.json::<AccountInformation>().await?)
    }

    pub async fn ticker_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let url = format!("{}/api/v3/ticker/price", self.base_url);
        let resp = self
            .client
            .get(&url)
            .query(&[("symbol", symbol.to_uppercase())])
            .send()
            .await?;
        let resp = ensure_success(resp).await?;
        let ticker = resp.json::<TickerPrice>().await?;
        ticker
            .price
            .parse::<f64>()
            .map_err(|_| ExchangeError::Rejected(format!("unparseable price '{}'", ticker.price)))
    }

    pub async fn post_order(&self, order: &OrderRequest) -> Result<OrderResponse, ExchangeError> {
        let mut params = format!(
            "symbol={}&side={}&type=MARKET&quantity={}",
            order.symbol.to_uppercase(),
            order.direction.order_side(),
            format_quantity(order.quantity),
        );
        if let Some(ref id) = order.client_order_id {
            params.push_str(&format!("&newClientOrderId={}", id));
        }

        info!(
            "Placing Order: {} {} {}",
            order.direction.order_side(),
            format_quantity(order.quantity),
            order.symbol
        );

        let resp = self
            .signed_request(Method::POST, "/api/v3/order", &params)
            .await?;
        let resp = ensure_success(resp).await?;
        Ok(resp.json::<OrderResponse>().await?)
    }
}

#[async_trait]
impl ExchangeClient for BinanceClient {
    async fn verify(&self) -> Result<(), ExchangeError> {
        let account = self.get_account().await?;
        if !account.can_trade {
            return Err(ExchangeError::Authentication(
                "account is not permitted to trade".to_string(),
            ));
        }
        let funded = account
            .balances
            .iter()
            .filter(|b| b.free.parse::<f64>().unwrap_or(0.0) > 0.0)
            .count();
        debug!("Binance account verified, {} funded assets", funded);
        Ok(())
    }

    async fn latest_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        self.ticker_price(symbol).await
    }

    async fn place_market_order(&self, order: &OrderRequest) -> Result<OrderResult, ExchangeError> {
        let resp = self.post_order(order).await?;
        Ok(OrderResult {
            order_id: resp.order_id.to_string(),
            symbol: resp.symbol,
            status: resp.status,
            executed_quantity: resp.executed_qty.parse().unwrap_or(0.0),
        })
    }
}

/// Builds Binance clients, picking the live or testnet endpoint from the
/// profile's account mode.
pub struct BinanceFactory {
    http: Client,
    endpoints: BinanceEndpoints,
}

impl BinanceFactory {
    pub fn new(endpoints: BinanceEndpoints) -> Result<Self, ExchangeError> {
        let http = Client::builder()
            .user_agent("signal_executor/0.1.0")
            .timeout(endpoints.request_timeout)
            .build()
            .map_err(|e| ExchangeError::Network(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { http, endpoints })
    }
}

impl ClientFactory for BinanceFactory {
    fn build(&self, profile: &UserTradingProfile) -> Result<Arc<dyn ExchangeClient>, ExchangeError> {
        if !profile.exchange.eq_ignore_ascii_case("binance") {
            return Err(ExchangeError::UnsupportedExchange(profile.exchange.clone()));
        }

        let base_url = match profile.account_mode {
            AccountMode::Paper => self.endpoints.testnet_url.clone(),
            AccountMode::Real => self.endpoints.live_url.clone(),
        };

        Ok(Arc::new(BinanceClient::new(
            self.http.clone(),
            base_url,
            profile.api_key.clone(),
            profile.api_secret.clone(),
            self.endpoints.recv_window_ms,
        )))
    }
}

pub fn sign_query(secret: &str, query: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(query.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Fixed-point rendering; Binance rejects exponents and float noise.
pub fn format_quantity(quantity: f64) -> String {
    let fixed = format!("{:.8}", quantity);
    let trimmed = fixed.trim_end_matches('0').trim_end_matches('.');
    if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

async fn ensure_success(resp: Response) -> Result<Response, ExchangeError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let retry_after = resp
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = resp.text().await.unwrap_or_default();
    warn!("Binance request failed ({}): {}", status, body);
    Err(classify_error(status, retry_after, &body))
}

fn log_used_weight(resp: &Response) {
    if let Some(used) = resp
        .headers()
        .get("x-mbx-used-weight-1m")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u32>().ok())
    {
        if used > 1000 {
            warn!("High API weight usage: {}", used);
        } else {
            debug!("Used weights: {}/1200", used);
        }
    }
}

pub(crate) fn classify_error(
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> ExchangeError {
    let parsed = serde_json::from_str::<ErrorBody>(body).ok();
    let (code, msg) = match parsed {
        Some(ref e) => (Some(e.code), e.msg.clone()),
        None => (None, body.to_string()),
    };
    let lower = msg.to_lowercase();

    if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 418 {
        return ExchangeError::RateLimited {
            message: format!("HTTP {}: {}", status.as_u16(), msg),
            retry_after,
        };
    }
    if status == StatusCode::UNAUTHORIZED
        || status == StatusCode::FORBIDDEN
        || matches!(code, Some(-2014) | Some(-2015) | Some(-1022) | Some(-2008))
    {
        return ExchangeError::Authentication(msg);
    }
    if lower.contains("insufficient balance") || code == Some(-2019) {
        return ExchangeError::InsufficientBalance(msg);
    }
    if code == Some(-1121) || lower.contains("invalid symbol") || lower.contains("market is closed")
    {
        return ExchangeError::SymbolNotTradable(msg);
    }
    if status.is_server_error() {
        return ExchangeError::Network(format!("HTTP {}: {}", status.as_u16(), msg));
    }
    ExchangeError::Rejected(match code {
        Some(c) => format!("code {}: {}", c, msg),
        None => format!("HTTP {}: {}", status.as_u16(), msg),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::models::Direction;
    use mockito::Matcher;

    fn client(base_url: String) -> BinanceClient {
        BinanceClient::new(
            Client::new(),
            base_url,
            SecretString::from("test-key"),
            SecretString::from("test-secret"),
            5000,
        )
    }

    fn order() -> OrderRequest {
        OrderRequest {
            symbol: "btcusdt".to_string(),
            direction: Direction::Long,
            quantity: 0.0004,
            client_order_id: Some("abc123".to_string()),
        }
    }

    #[test]
    fn signature_matches_binance_reference_vector() {
        let secret = "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j";
        let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        assert_eq!(
            sign_query(secret, query),
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn quantities_render_without_float_noise() {
        assert_eq!(format_quantity(0.00039999999999999996), "0.0004");
        assert_eq!(format_quantity(1.5), "1.5");
        assert_eq!(format_quantity(2.0), "2");
        assert_eq!(format_quantity(0.0), "0");
    }

    #[test]
    fn error_classification() {
        let err = classify_error(
            StatusCode::BAD_REQUEST,
            None,
            r#"{"code":-2010,"msg":"Account has insufficient balance for requested action."}"#,
        );
        assert!(matches!(err, ExchangeError::InsufficientBalance(_)));

        let err = classify_error(
            StatusCode::BAD_REQUEST,
            None,
            r#"{"code":-1121,"msg":"Invalid symbol."}"#,
        );
        assert!(matches!(err, ExchangeError::SymbolNotTradable(_)));

        let err = classify_error(
            StatusCode::UNAUTHORIZED,
            None,
            r#"{"code":-2015,"msg":"Invalid API-key, IP, or permissions for action."}"#,
        );
        assert!(matches!(err, ExchangeError::Authentication(_)));

        let err = classify_error(StatusCode::BAD_GATEWAY, None, "upstream down");
        assert!(err.is_retryable());

        let err = classify_error(
            StatusCode::BAD_REQUEST,
            None,
            r#"{"code":-1013,"msg":"Filter failure: LOT_SIZE"}"#,
        );
        assert_eq!(
            err,
            ExchangeError::Rejected("code -1013: Filter failure: LOT_SIZE".to_string())
        );
    }

    #[tokio::test]
    async fn places_signed_market_order() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", Matcher::Regex(r"^/api/v3/order\?symbol=BTCUSDT&side=BUY&type=MARKET&quantity=0\.0004&newClientOrderId=abc123&recvWindow=5000&timestamp=\d+&signature=[0-9a-f]{64}$".to_string()))
            .match_header("x-mbx-apikey", "test-key")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"orderId":28,"symbol":"BTCUSDT","status":"FILLED","executedQty":"0.00040000","cummulativeQuoteQty":"20.0"}"#,
            )
            .create_async()
            .await;

        let result = client(server.url()).place_market_order(&order()).await.unwrap();

        mock.assert_async().await;
        assert_eq!(result.order_id, "28");
        assert_eq!(result.status, "FILLED");
        assert_eq!(result.executed_quantity, 0.0004);
    }

    #[tokio::test]
    async fn rate_limit_carries_retry_after() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", Matcher::Regex(r"^/api/v3/order".to_string()))
            .with_status(429)
            .with_header("retry-after", "7")
            .with_body(r#"{"code":-1003,"msg":"Too many requests."}"#)
            .create_async()
            .await;

        let err = client(server.url()).place_market_order(&order()).await.unwrap_err();
        match err {
            ExchangeError::RateLimited { retry_after, .. } => {
                assert_eq!(retry_after, Some(Duration::from_secs(7)))
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn verify_rejects_accounts_that_cannot_trade() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", Matcher::Regex(r"^/api/v3/account".to_string()))
            .with_status(200)
            .with_body(r#"{"balances":[{"asset":"USDT","free":"10.0","locked":"0"}],"canTrade":false}"#)
            .create_async()
            .await;

        let err = client(server.url()).verify().await.unwrap_err();
        assert!(matches!(err, ExchangeError::Authentication(_)));
    }

    #[tokio::test]
    async fn reads_ticker_price() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v3/ticker/price")
            .match_query(Matcher::UrlEncoded("symbol".into(), "BTCUSDT".into()))
            .with_status(200)
            .with_body(r#"{"symbol":"BTCUSDT","price":"50000.10"}"#)
            .create_async()
            .await;

        let price = client(server.url()).latest_price("btcusdt").await.unwrap();
        assert_eq!(price, 50000.10);
    }

    #[test]
    fn factory_routes_paper_accounts_to_testnet() {
        let factory = BinanceFactory::new(BinanceEndpoints::default()).unwrap();
        let mut profile = UserTradingProfile {
            user_id: "u1".to_string(),
            exchange: "binance".to_string(),
            api_key: SecretString::from("k"),
            api_secret: SecretString::from("s"),
            account_mode: AccountMode::Paper,
            risk_percentage: 0.02,
            available_balance: 10.0,
            disabled: false,
        };
        assert!(factory.build(&profile).is_ok());

        profile.exchange = "kraken".to_string();
        assert!(matches!(
            factory.build(&profile),
            Err(ExchangeError::UnsupportedExchange(_))
        ));
    }
}
