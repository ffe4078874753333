//! Binance USDT-M futures REST client.
//!
//! Thin typed surface over the endpoints the engine needs. Transient
//! failures are retried by the reqwest-retry middleware with exponential
//! backoff; a rate-limit answer is waited out once and then propagated.

use crate::domain::account::AccountConfig;
use crate::domain::errors::ExchangeError;
use crate::domain::ports::ExchangeApi;
use crate::domain::types::{
    Kline, OpenOrder, OrderFill, OrderSide, PositionInfo,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{RetryTransientMiddleware, policies::ExponentialBackoff};
use serde::Deserialize;
use sha2::Sha256;
use std::time::Duration;
use tracing::{debug, info, warn};

const MAINNET_BASE_URL: &str = "https://fapi.binance.com";
const TESTNET_BASE_URL: &str = "https://testnet.binancefuture.com";

const RECV_WINDOW_MS: u64 = 5_000;
/// Upper bound on the single rate-limit wait before the error propagates.
const MAX_RATE_LIMIT_WAIT_SECS: u64 = 30;

pub struct BinanceFuturesClient {
    http: ClientWithMiddleware,
    api_key: String,
    api_secret: String,
    base_url: String,
}

impl BinanceFuturesClient {
    pub fn new(config: &AccountConfig) -> Self {
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);

        let client = Client::builder()
            .pool_max_idle_per_host(5)
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());

        let http = ClientBuilder::new(client)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        let base_url = if config.testnet {
            TESTNET_BASE_URL
        } else {
            MAINNET_BASE_URL
        };

        Self {
            http,
            api_key: config.api_key.clone(),
            api_secret: config.api_secret.clone(),
            base_url: base_url.to_string(),
        }
    }

    /// HMAC-SHA256 signature over the query string.
    fn sign(&self, query_string: &str) -> String {
        type HmacSha256 = Hmac<Sha256>;

        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(query_string.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn signed_query(&self, params: &[(&str, String)]) -> String {
        let timestamp = Utc::now().timestamp_millis();
        let mut query: String = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        if !query.is_empty() {
            query.push('&');
        }
        query.push_str(&format!(
            "recvWindow={}&timestamp={}",
            RECV_WINDOW_MS, timestamp
        ));
        let signature = self.sign(&query);
        format!("{}&signature={}", query, signature)
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &str,
    ) -> Result<String, ExchangeError> {
        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };

        let response = self
            .http
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(|e| ExchangeError::Network {
                reason: e.to_string(),
            })?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let body = response.text().await.map_err(|e| ExchangeError::Network {
            reason: e.to_string(),
        })?;

        if status.is_success() {
            return Ok(body);
        }

        Err(Self::map_error(status, retry_after, &body))
    }

    fn map_error(status: StatusCode, retry_after: Option<u64>, body: &str) -> ExchangeError {
        #[derive(Deserialize)]
        struct ApiError {
            code: i64,
            msg: String,
        }
        let parsed: Option<ApiError> = serde_json::from_str(body).ok();

        if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 418 {
            return ExchangeError::RateLimit {
                retry_after_secs: retry_after,
            };
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return ExchangeError::Auth {
                reason: parsed.map(|e| e.msg).unwrap_or_else(|| body.to_string()),
            };
        }
        match parsed {
            // -2014 bad api key format, -2015 invalid key/ip/permissions
            Some(e) if e.code == -2014 || e.code == -2015 => {
                ExchangeError::Auth { reason: e.msg }
            }
            Some(e) => ExchangeError::Api {
                code: e.code,
                message: e.msg,
            },
            None => ExchangeError::Api {
                code: i64::from(status.as_u16()),
                message: body.to_string(),
            },
        }
    }

    /// Issue a request; a rate-limit answer is waited out once (bounded)
    /// and retried, then propagated.
    async fn request(
        &self,
        method: Method,
        path: &str,
        query: String,
    ) -> Result<String, ExchangeError> {
        match self.send(method.clone(), path, &query).await {
            Err(ExchangeError::RateLimit { retry_after_secs }) => {
                let wait = retry_after_secs
                    .unwrap_or(1)
                    .min(MAX_RATE_LIMIT_WAIT_SECS);
                warn!(
                    "Rate limited on {} {}, waiting {}s before one retry",
                    method, path, wait
                );
                tokio::time::sleep(Duration::from_secs(wait)).await;
                self.send(method, path, &query).await
            }
            other => other,
        }
    }

    async fn get_public(&self, path: &str, params: &[(&str, String)]) -> Result<String, ExchangeError> {
        let query: String = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        self.request(Method::GET, path, query).await
    }

    /// Signed variant of [`Self::request`]. Re-signs before the retry so
    /// the timestamp stays inside the recv window after the wait.
    async fn request_signed(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<String, ExchangeError> {
        match self
            .send(method.clone(), path, &self.signed_query(params))
            .await
        {
            Err(ExchangeError::RateLimit { retry_after_secs }) => {
                let wait = retry_after_secs.unwrap_or(1).min(MAX_RATE_LIMIT_WAIT_SECS);
                warn!(
                    "Rate limited on {} {}, waiting {}s before one retry",
                    method, path, wait
                );
                tokio::time::sleep(Duration::from_secs(wait)).await;
                self.send(method, path, &self.signed_query(params)).await
            }
            other => other,
        }
    }

    async fn get_signed(&self, path: &str, params: &[(&str, String)]) -> Result<String, ExchangeError> {
        self.request_signed(Method::GET, path, params).await
    }

    async fn post_signed(&self, path: &str, params: &[(&str, String)]) -> Result<String, ExchangeError> {
        self.request_signed(Method::POST, path, params).await
    }

    async fn delete_signed(&self, path: &str, params: &[(&str, String)]) -> Result<String, ExchangeError> {
        self.request_signed(Method::DELETE, path, params).await
    }

    fn parse_fill(body: &str) -> Result<OrderFill, ExchangeError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct OrderResponse {
            symbol: String,
            order_id: i64,
            status: String,
            side: String,
            price: String,
            avg_price: Option<String>,
            executed_qty: String,
            update_time: Option<i64>,
        }

        let response: OrderResponse =
            serde_json::from_str(body).map_err(|e| ExchangeError::Api {
                code: 0,
                message: format!("Unparseable order response: {}", e),
            })?;

        let side = match response.side.as_str() {
            "BUY" => OrderSide::Buy,
            "SELL" => OrderSide::Sell,
            other => {
                return Err(ExchangeError::Api {
                    code: 0,
                    message: format!("Unknown order side: {}", other),
                });
            }
        };

        let timestamp = response
            .update_time
            .and_then(|ms| DateTime::<Utc>::from_timestamp_millis(ms))
            .unwrap_or_else(Utc::now);

        Ok(OrderFill {
            symbol: response.symbol,
            order_id: response.order_id,
            status: response.status,
            side,
            price: response.price.parse().unwrap_or(0.0),
            avg_price: response
                .avg_price
                .and_then(|p| p.parse::<f64>().ok())
                .filter(|p| *p > 0.0),
            executed_qty: response.executed_qty.parse().unwrap_or(0.0),
            commission: None,
            commission_asset: None,
            timestamp,
            leverage: None,
            position_side: None,
            exit_reason: None,
        })
    }

    async fn place_stop_market_order(
        &self,
        order_type: &str,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        stop_price: f64,
        close_position: bool,
    ) -> Result<i64, ExchangeError> {
        let mut params = vec![
            ("symbol", symbol.to_string()),
            ("side", side.to_string()),
            ("type", order_type.to_string()),
            ("stopPrice", format!("{:.8}", stop_price)),
        ];
        if close_position {
            params.push(("closePosition", "true".to_string()));
        } else {
            params.push(("quantity", format!("{:.8}", quantity)));
            params.push(("reduceOnly", "true".to_string()));
        }

        let body = self.post_signed("/fapi/v1/order", &params).await?;

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct StopOrderResponse {
            order_id: i64,
        }
        let response: StopOrderResponse =
            serde_json::from_str(&body).map_err(|e| ExchangeError::Api {
                code: 0,
                message: format!("Unparseable stop order response: {}", e),
            })?;

        info!(
            "{} order placed for {}: orderId={} stopPrice={:.8}",
            order_type, symbol, response.order_id, stop_price
        );
        Ok(response.order_id)
    }
}

#[async_trait]
impl ExchangeApi for BinanceFuturesClient {
    async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> Result<Vec<Kline>, ExchangeError> {
        let body = self
            .get_public(
                "/fapi/v1/klines",
                &[
                    ("symbol", symbol.to_string()),
                    ("interval", interval.to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;

        // Kline rows are positional arrays:
        // [openTime, open, high, low, close, volume, closeTime, ...]
        let rows: Vec<serde_json::Value> =
            serde_json::from_str(&body).map_err(|e| ExchangeError::Api {
                code: 0,
                message: format!("Unparseable klines response: {}", e),
            })?;

        let klines = rows
            .into_iter()
            .filter_map(|row| {
                let row = row.as_array()?;
                if row.len() < 7 {
                    return None;
                }
                Some(Kline {
                    open_time: row[0].as_i64()?,
                    open: row[1].as_str()?.parse().ok()?,
                    high: row[2].as_str()?.parse().ok()?,
                    low: row[3].as_str()?.parse().ok()?,
                    close: row[4].as_str()?.parse().ok()?,
                    volume: row[5].as_str()?.parse().ok()?,
                    close_time: row[6].as_i64()?,
                })
            })
            .collect();
        Ok(klines)
    }

    async fn get_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let body = self
            .get_public("/fapi/v1/ticker/price", &[("symbol", symbol.to_string())])
            .await?;

        #[derive(Deserialize)]
        struct PriceTicker {
            price: String,
        }
        let ticker: PriceTicker = serde_json::from_str(&body).map_err(|e| ExchangeError::Api {
            code: 0,
            message: format!("Unparseable price response: {}", e),
        })?;
        ticker.price.parse().map_err(|_| ExchangeError::Api {
            code: 0,
            message: format!("Non-numeric price: {}", ticker.price),
        })
    }

    async fn get_open_position(
        &self,
        symbol: &str,
    ) -> Result<Option<PositionInfo>, ExchangeError> {
        let body = self
            .get_signed("/fapi/v2/positionRisk", &[("symbol", symbol.to_string())])
            .await?;

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct PositionRisk {
            position_amt: String,
            entry_price: String,
            un_realized_profit: String,
            mark_price: Option<String>,
        }

        let positions: Vec<PositionRisk> =
            serde_json::from_str(&body).map_err(|e| ExchangeError::Api {
                code: 0,
                message: format!("Unparseable position response: {}", e),
            })?;

        for position in positions {
            let amt: f64 = position.position_amt.parse().unwrap_or(0.0);
            if amt.abs() > 0.0 {
                return Ok(Some(PositionInfo {
                    position_amt: amt,
                    entry_price: position.entry_price.parse().unwrap_or(0.0),
                    unrealized_pnl: position.un_realized_profit.parse().unwrap_or(0.0),
                    mark_price: position.mark_price.and_then(|p| p.parse().ok()),
                }));
            }
        }
        Ok(None)
    }

    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>, ExchangeError> {
        let body = self
            .get_signed("/fapi/v1/openOrders", &[("symbol", symbol.to_string())])
            .await?;

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct RawOpenOrder {
            order_id: i64,
            symbol: String,
            #[serde(rename = "type")]
            order_type: String,
            side: String,
            stop_price: Option<String>,
        }

        let raw: Vec<RawOpenOrder> =
            serde_json::from_str(&body).map_err(|e| ExchangeError::Api {
                code: 0,
                message: format!("Unparseable open orders response: {}", e),
            })?;

        Ok(raw
            .into_iter()
            .filter_map(|o| {
                let side = match o.side.as_str() {
                    "BUY" => OrderSide::Buy,
                    "SELL" => OrderSide::Sell,
                    _ => return None,
                };
                Some(OpenOrder {
                    order_id: o.order_id,
                    symbol: o.symbol,
                    order_type: o.order_type,
                    side,
                    stop_price: o.stop_price.and_then(|p| p.parse().ok()),
                })
            })
            .collect())
    }

    async fn get_current_leverage(&self, symbol: &str) -> Result<Option<u32>, ExchangeError> {
        let body = self
            .get_signed("/fapi/v2/positionRisk", &[("symbol", symbol.to_string())])
            .await?;

        #[derive(Deserialize)]
        struct PositionRisk {
            leverage: String,
        }
        let positions: Vec<PositionRisk> =
            serde_json::from_str(&body).map_err(|e| ExchangeError::Api {
                code: 0,
                message: format!("Unparseable position response: {}", e),
            })?;

        Ok(positions
            .first()
            .and_then(|p| p.leverage.parse::<u32>().ok()))
    }

    async fn adjust_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
        self.post_signed(
            "/fapi/v1/leverage",
            &[
                ("symbol", symbol.to_string()),
                ("leverage", leverage.to_string()),
            ],
        )
        .await?;
        info!("Leverage set to {}x for {}", leverage, symbol);
        Ok(())
    }

    async fn place_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        reduce_only: bool,
    ) -> Result<OrderFill, ExchangeError> {
        let mut params = vec![
            ("symbol", symbol.to_string()),
            ("side", side.to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", format!("{:.8}", quantity)),
            ("newOrderRespType", "RESULT".to_string()),
        ];
        if reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }

        let body = self.post_signed("/fapi/v1/order", &params).await?;
        let fill = Self::parse_fill(&body)?;
        debug!(
            "Order placed: {} {} qty={} status={} orderId={}",
            fill.side, fill.symbol, fill.executed_qty, fill.status, fill.order_id
        );
        Ok(fill)
    }

    async fn place_take_profit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        stop_price: f64,
        close_position: bool,
    ) -> Result<i64, ExchangeError> {
        self.place_stop_market_order(
            "TAKE_PROFIT_MARKET",
            symbol,
            side,
            quantity,
            stop_price,
            close_position,
        )
        .await
    }

    async fn place_stop_loss_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        stop_price: f64,
        close_position: bool,
    ) -> Result<i64, ExchangeError> {
        self.place_stop_market_order(
            "STOP_MARKET",
            symbol,
            side,
            quantity,
            stop_price,
            close_position,
        )
        .await
    }

    async fn cancel_order(&self, symbol: &str, order_id: i64) -> Result<(), ExchangeError> {
        self.delete_signed(
            "/fapi/v1/order",
            &[
                ("symbol", symbol.to_string()),
                ("orderId", order_id.to_string()),
            ],
        )
        .await?;
        Ok(())
    }

    async fn close_position(&self, symbol: &str) -> Result<Option<OrderFill>, ExchangeError> {
        let Some(position) = self.get_open_position(symbol).await? else {
            return Ok(None);
        };
        let Some(side) = position.side() else {
            return Ok(None);
        };

        info!(
            "Closing {} {} position of {} via reduce-only market order",
            symbol,
            side,
            position.size()
        );
        self.place_order(symbol, side.closing_side(), position.size(), true)
            .await
            .map(Some)
    }

    async fn futures_account_balance(&self) -> Result<f64, ExchangeError> {
        let body = self.get_signed("/fapi/v2/balance", &[]).await?;

        #[derive(Deserialize)]
        struct AssetBalance {
            asset: String,
            balance: String,
        }
        let balances: Vec<AssetBalance> =
            serde_json::from_str(&body).map_err(|e| ExchangeError::Api {
                code: 0,
                message: format!("Unparseable balance response: {}", e),
            })?;

        Ok(balances
            .iter()
            .find(|b| b.asset == "USDT")
            .and_then(|b| b.balance.parse::<f64>().ok())
            .unwrap_or(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> BinanceFuturesClient {
        BinanceFuturesClient::new(&AccountConfig::new(
            "default",
            "Test",
            "test_key",
            "test_secret",
            true,
        ))
    }

    #[test]
    fn signature_is_64_hex_chars() {
        let signature =
            client().sign("symbol=BTCUSDT&side=BUY&type=MARKET&quantity=0.001&timestamp=1234567890");
        assert_eq!(signature.len(), 64);
        assert!(signature.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn testnet_flag_selects_base_url() {
        assert_eq!(client().base_url, TESTNET_BASE_URL);

        let mainnet = BinanceFuturesClient::new(&AccountConfig::new(
            "main", "Main", "k", "s", false,
        ));
        assert_eq!(mainnet.base_url, MAINNET_BASE_URL);
    }

    #[test]
    fn auth_error_codes_map_to_auth() {
        let err = BinanceFuturesClient::map_error(
            StatusCode::BAD_REQUEST,
            None,
            r#"{"code":-2015,"msg":"Invalid API-key, IP, or permissions for action."}"#,
        );
        assert!(matches!(err, ExchangeError::Auth { .. }));
    }

    #[test]
    fn rate_limit_carries_retry_after() {
        let err = BinanceFuturesClient::map_error(
            StatusCode::TOO_MANY_REQUESTS,
            Some(12),
            r#"{"code":-1003,"msg":"Too many requests."}"#,
        );
        match err {
            ExchangeError::RateLimit { retry_after_secs } => {
                assert_eq!(retry_after_secs, Some(12))
            }
            other => panic!("expected RateLimit, got {:?}", other),
        }
    }

    #[test]
    fn api_errors_keep_the_exchange_code() {
        let err = BinanceFuturesClient::map_error(
            StatusCode::BAD_REQUEST,
            None,
            r#"{"code":-2019,"msg":"Margin is insufficient."}"#,
        );
        match err {
            ExchangeError::Api { code, .. } => assert_eq!(code, -2019),
            other => panic!("expected Api, got {:?}", other),
        }
    }

    #[test]
    fn order_response_parses_into_fill() {
        let body = r#"{
            "symbol": "BTCUSDT",
            "orderId": 123456789,
            "status": "FILLED",
            "side": "BUY",
            "price": "0",
            "avgPrice": "40000.10",
            "executedQty": "0.0025",
            "updateTime": 1700000000000
        }"#;
        let fill = BinanceFuturesClient::parse_fill(body).unwrap();
        assert_eq!(fill.order_id, 123456789);
        assert_eq!(fill.side, OrderSide::Buy);
        assert_eq!(fill.avg_price, Some(40000.10));
        assert!((fill.effective_price() - 40000.10).abs() < 1e-9);
        assert!(fill.is_tracked());
    }
}
