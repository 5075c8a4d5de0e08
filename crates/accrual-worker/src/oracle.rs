//! 积分计算服务客户端
//!
//! 每次调用只发起一次 HTTP 请求，不在内部重试，重试策略由 Worker 决定。
//! 通过 AccrualOracle trait 抽象，便于测试时注入脚本化实现。

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{AccrualError, OracleError};
use crate::models::{OracleStatus, Order, OrderStatus};

// ---------------------------------------------------------------------------
// Trait 抽象
// ---------------------------------------------------------------------------

/// 积分计算服务接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AccrualOracle: Send + Sync {
    /// 查询订单的最新积分状态
    ///
    /// 积分服务暂无该订单信息时原样返回传入的订单；
    /// 有更新时返回带新状态和积分的副本。
    async fn check_order(&self, order: &Order) -> Result<Order, OracleError>;
}

// ---------------------------------------------------------------------------
// HTTP 客户端实现
// ---------------------------------------------------------------------------

/// `GET {base}/api/orders/{number}` 的 200 响应体
#[derive(Debug, Deserialize)]
struct OracleOrderResponse {
    #[serde(alias = "number")]
    order: String,
    status: OracleStatus,
    #[serde(default, with = "rust_decimal::serde::float_option")]
    accrual: Option<Decimal>,
}

/// 基于 reqwest 的积分服务客户端
///
/// reqwest::Client 内部带连接池，clone 是廉价操作。
#[derive(Clone)]
pub struct HttpAccrualOracle {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAccrualOracle {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, AccrualError> {
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(AccrualError::InvalidConfig(format!(
                "积分服务地址必须以 http:// 或 https:// 开头: {base_url}"
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AccrualError::InvalidConfig(format!("创建 HTTP 客户端失败: {e}")))?;

        info!(base_url, timeout_ms = timeout.as_millis() as u64, "积分服务客户端已初始化");

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn order_url(&self, number: &str) -> String {
        format!("{}/api/orders/{}", self.base_url, number)
    }
}

#[async_trait]
impl AccrualOracle for HttpAccrualOracle {
    async fn check_order(&self, order: &Order) -> Result<Order, OracleError> {
        let url = self.order_url(&order.number);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| OracleError::Transient(format!("请求 {url} 失败: {e}")))?;

        let status = response.status();
        debug!(order_number = %order.number, http_status = status.as_u16(), "积分服务已响应");

        match status {
            StatusCode::NO_CONTENT => Ok(order.clone()),
            StatusCode::TOO_MANY_REQUESTS => Err(OracleError::Throttled {
                retry_after: parse_retry_after(response.headers())?,
            }),
            StatusCode::OK => {
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| OracleError::Transient(format!("读取响应体失败: {e}")))?;
                parse_order_body(order, &body)
            }
            other => Err(OracleError::Transient(format!(
                "积分服务返回非预期状态码: {other}"
            ))),
        }
    }
}

/// 解析 429 响应的 Retry-After（秒）
fn parse_retry_after(headers: &HeaderMap) -> Result<Duration, OracleError> {
    let value = headers
        .get(RETRY_AFTER)
        .ok_or_else(|| OracleError::Protocol("429 响应缺少 Retry-After".to_string()))?;

    value
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .ok_or_else(|| OracleError::Protocol(format!("无法解析 Retry-After: {value:?}")))
}

/// 解析 200 响应体，返回带新状态的订单副本
fn parse_order_body(order: &Order, body: &[u8]) -> Result<Order, OracleError> {
    let reply: OracleOrderResponse = serde_json::from_slice(body)
        .map_err(|e| OracleError::Protocol(format!("响应体不是合法的订单 JSON: {e}")))?;

    if reply.order != order.number {
        return Err(OracleError::Protocol(format!(
            "响应订单号 {} 与请求订单号 {} 不一致",
            reply.order, order.number
        )));
    }

    let accrual = reply.accrual.unwrap_or(Decimal::ZERO);
    if accrual < Decimal::ZERO {
        return Err(OracleError::Protocol(format!("积分不能为负数: {accrual}")));
    }

    // 只有 PROCESSED 的积分有效，其他状态携带的积分一律忽略
    let status = OrderStatus::from(reply.status);
    let accrual = if status == OrderStatus::Processed {
        accrual
    } else {
        Decimal::ZERO
    };
    Ok(order.with_update(status, accrual))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        Json, Router,
        extract::Path,
        http::{HeaderValue, StatusCode as HttpStatus, header},
        response::{IntoResponse, Response},
        routing::get,
    };
    use serde_json::json;
    use tokio::net::TcpListener;

    /// 按订单号返回固定响应的假积分服务
    async fn fake_oracle(Path(number): Path<String>) -> Response {
        match number.as_str() {
            "1001" => HttpStatus::NO_CONTENT.into_response(),
            "1002" => {
                let mut resp = HttpStatus::TOO_MANY_REQUESTS.into_response();
                resp.headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from_static("60"));
                resp
            }
            "1003" => Json(json!({
                "order": "1003",
                "status": "PROCESSED",
                "accrual": 500
            }))
            .into_response(),
            "1004" => Json(json!({ "number": "1004", "status": "PROCESSING" })).into_response(),
            "1005" => (HttpStatus::OK, "not json").into_response(),
            "1006" => HttpStatus::TOO_MANY_REQUESTS.into_response(),
            "1007" => HttpStatus::INTERNAL_SERVER_ERROR.into_response(),
            "1008" => Json(json!({ "order": "9999", "status": "PROCESSED", "accrual": 1 }))
                .into_response(),
            "1009" => Json(json!({ "order": "1009", "status": "REGISTERED" })).into_response(),
            "1010" => Json(json!({
                "order": "1010",
                "status": "PROCESSED",
                "accrual": 729.98
            }))
            .into_response(),
            _ => HttpStatus::NOT_FOUND.into_response(),
        }
    }

    async fn spawn_fake_oracle() -> String {
        let app = Router::new().route("/api/orders/{number}", get(fake_oracle));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    async fn client() -> HttpAccrualOracle {
        let base = spawn_fake_oracle().await;
        HttpAccrualOracle::new(&base, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_no_content_returns_order_unchanged() {
        let oracle = client().await;
        let order = Order::new(1, "1001");
        assert_eq!(oracle.check_order(&order).await.unwrap(), order);
    }

    #[tokio::test]
    async fn test_too_many_requests_carries_retry_after() {
        let oracle = client().await;
        let err = oracle.check_order(&Order::new(1, "1002")).await.unwrap_err();
        assert_eq!(
            err,
            OracleError::Throttled {
                retry_after: Duration::from_secs(60)
            }
        );
    }

    #[tokio::test]
    async fn test_processed_reply_updates_status_and_accrual() {
        let oracle = client().await;
        let order = Order::new(1, "1003");
        let updated = oracle.check_order(&order).await.unwrap();

        assert_eq!(updated.status, OrderStatus::Processed);
        assert_eq!(updated.accrual, Decimal::new(500, 0));
        assert_eq!(updated.user_id, order.user_id);
    }

    #[tokio::test]
    async fn test_fractional_accrual_is_kept() {
        let oracle = client().await;
        let updated = oracle.check_order(&Order::new(1, "1010")).await.unwrap();
        assert_eq!(updated.accrual, Decimal::new(72998, 2));
    }

    #[tokio::test]
    async fn test_number_alias_and_missing_accrual() {
        let oracle = client().await;
        let updated = oracle.check_order(&Order::new(1, "1004")).await.unwrap();
        assert_eq!(updated.status, OrderStatus::Processing);
        assert_eq!(updated.accrual, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_registered_maps_to_new() {
        let oracle = client().await;
        let order = Order::new(1, "1009");
        assert_eq!(oracle.check_order(&order).await.unwrap().status, OrderStatus::New);
    }

    #[tokio::test]
    async fn test_malformed_replies_are_protocol_errors() {
        let oracle = client().await;

        let err = oracle.check_order(&Order::new(1, "1005")).await.unwrap_err();
        assert_eq!(err.kind(), "protocol");

        // 429 没有 Retry-After
        let err = oracle.check_order(&Order::new(1, "1006")).await.unwrap_err();
        assert_eq!(err.kind(), "protocol");

        // 订单号不一致
        let err = oracle.check_order(&Order::new(1, "1008")).await.unwrap_err();
        assert_eq!(err.kind(), "protocol");
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let oracle = client().await;
        let err = oracle.check_order(&Order::new(1, "1007")).await.unwrap_err();
        assert_eq!(err.kind(), "transient");
    }

    #[tokio::test]
    async fn test_unreachable_service_is_transient() {
        // 先占用端口再释放，得到一个大概率无人监听的地址
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let oracle =
            HttpAccrualOracle::new(&format!("http://{addr}"), Duration::from_secs(1)).unwrap();
        let err = oracle.check_order(&Order::new(1, "1001")).await.unwrap_err();
        assert_eq!(err.kind(), "transient");
    }

    #[test]
    fn test_rejects_base_url_without_scheme() {
        let result = HttpAccrualOracle::new("localhost:8081", Duration::from_secs(1));
        assert!(matches!(result, Err(AccrualError::InvalidConfig(_))));
    }

    #[test]
    fn test_accrual_ignored_until_processed() {
        let order = Order::new(1, "42");

        let body = br#"{"order":"42","status":"PROCESSING","accrual":10}"#;
        let processing = parse_order_body(&order, body).unwrap();
        assert_eq!(processing.status, OrderStatus::Processing);
        assert_eq!(processing.accrual, Decimal::ZERO);

        let body = br#"{"order":"42","status":"PROCESSED","accrual":10}"#;
        let processed = parse_order_body(&processing, body).unwrap();
        assert_eq!(processed.accrual, Decimal::new(10, 0));
    }

    #[test]
    fn test_negative_accrual_is_protocol_error() {
        let order = Order::new(1, "42");
        let body = br#"{"order":"42","status":"PROCESSED","accrual":-5}"#;
        let err = parse_order_body(&order, body).unwrap_err();
        assert_eq!(err.kind(), "protocol");
    }
}
