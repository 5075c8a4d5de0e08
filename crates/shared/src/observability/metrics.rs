//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 指标通过独立的 HTTP 端口暴露，供 Prometheus 抓取。

use anyhow::Result;
use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::ObservabilityConfig;

/// Metrics 资源守卫
pub struct MetricsHandle {
    server_handle: tokio::task::JoinHandle<()>,
}

impl Drop for MetricsHandle {
    fn drop(&mut self) {
        self.server_handle.abort();
    }
}

/// 初始化 Prometheus 指标导出
///
/// 启动一个独立的 HTTP 服务器在指定端口暴露 `/metrics` 端点。
pub async fn init(config: &ObservabilityConfig) -> Result<MetricsHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    register_common_metrics(&config.service_name);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    let server_handle = start_metrics_server(addr, handle).await?;

    Ok(MetricsHandle { server_handle })
}

/// 注册积分同步管道的指标描述
fn register_common_metrics(service_name: &str) {
    metrics::describe_counter!(
        "accrual_oracle_requests_total",
        "Total number of accrual oracle requests by outcome"
    );
    metrics::describe_histogram!(
        "accrual_oracle_request_duration_seconds",
        "Accrual oracle request duration in seconds"
    );
    metrics::describe_counter!(
        "accrual_throttle_activations_total",
        "Number of cooldowns requested by the accrual oracle"
    );
    metrics::describe_counter!(
        "accrual_ledger_commits_total",
        "Total number of ledger commits by status"
    );
    metrics::describe_counter!(
        "accrual_requeues_total",
        "Orders put back into the pending queue by position"
    );
    metrics::describe_gauge!(
        "accrual_throttle_cooldown_seconds",
        "Most recent cooldown requested by the accrual oracle"
    );
    metrics::describe_gauge!("accrual_queue_depth", "Orders waiting in the pending queue");

    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

/// 启动指标 HTTP 服务器
async fn start_metrics_server(
    addr: SocketAddr,
    handle: PrometheusHandle,
) -> Result<tokio::task::JoinHandle<()>> {
    let app = Router::new()
        .route("/metrics", get(move || std::future::ready(handle.render())))
        .route("/health", get(|| async { "OK" }));

    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Metrics server error: {}", e);
        }
    });

    Ok(server_handle)
}

// ============================================================================
// 便捷的指标记录函数
// ============================================================================

/// 记录一次积分服务请求
///
/// outcome 取值：updated / unchanged / throttled / transient / protocol
#[inline]
pub fn record_oracle_request(outcome: &'static str, duration_secs: f64) {
    metrics::counter!("accrual_oracle_requests_total", "outcome" => outcome).increment(1);
    metrics::histogram!("accrual_oracle_request_duration_seconds", "outcome" => outcome)
        .record(duration_secs);
}

/// 记录积分服务要求的冷却
#[inline]
pub fn record_throttle(cooldown_secs: f64) {
    metrics::counter!("accrual_throttle_activations_total").increment(1);
    metrics::gauge!("accrual_throttle_cooldown_seconds").set(cooldown_secs);
}

/// 记录账本提交
#[inline]
pub fn record_ledger_commit(status: &'static str, orders: usize) {
    metrics::counter!("accrual_ledger_commits_total", "status" => status).increment(orders as u64);
}

/// 记录订单回队（front / back）
#[inline]
pub fn record_requeue(position: &'static str) {
    metrics::counter!("accrual_requeues_total", "position" => position).increment(1);
}

/// 更新待处理队列深度
#[inline]
pub fn set_queue_depth(depth: usize) {
    metrics::gauge!("accrual_queue_depth").set(depth as f64);
}
