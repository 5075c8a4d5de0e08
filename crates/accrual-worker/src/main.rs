//! 订单积分同步服务
//!
//! 启动积分同步流水线，直到收到 Ctrl+C 或 SIGTERM。

use std::sync::Arc;

use accrual_worker::{
    oracle::HttpAccrualOracle,
    pipeline::{AccrualPipeline, PipelineSettings},
    repository::PgOrderRepository,
};
use anyhow::{Context, Result};
use loyalty_shared::{
    config::AppConfig,
    database::Database,
    error::LoyaltyError,
    observability,
    retry::{RetryPolicy, retry_with_policy},
};
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. 加载 .env 与分层配置
    dotenvy::dotenv().ok();
    let config = AppConfig::load("accrual-worker").context("加载配置失败")?;

    // 2. 初始化日志与指标
    let _guard = observability::init(&config.observability).await?;

    info!("Starting accrual-worker...");
    info!(
        environment = %config.environment,
        oracle_url = %config.accrual.oracle_url,
        workers = config.accrual.workers,
        "Configuration loaded"
    );

    // 3. 连接数据库，瞬时故障按退避策略重试，最终失败则中止启动
    let db = retry_with_policy(
        &RetryPolicy::default(),
        "connect_database",
        LoyaltyError::is_retryable,
        || Database::connect(&config.database),
    )
    .await
    .context("数据库不可达，服务无法启动")?;
    db.health_check().await.context("数据库健康检查失败")?;
    info!("Database connection established");

    // 4. 组装流水线
    let store = Arc::new(
        PgOrderRepository::new(db.pool().clone(), config.accrual.storage_timeout())
            .with_claim_lease(config.accrual.claim_lease()),
    );
    let oracle = Arc::new(HttpAccrualOracle::new(
        &config.accrual.oracle_url,
        config.accrual.oracle_timeout(),
    )?);

    let handle = AccrualPipeline::new(store, oracle, PipelineSettings::from(&config.accrual))
        .start()
        .await
        .context("积分同步流水线启动失败")?;

    // 5. 等待关闭信号
    shutdown_signal().await;

    handle.shutdown().await;
    db.close().await;

    info!("Service shutdown complete");
    Ok(())
}

/// 优雅关闭信号处理
///
/// 监听 Ctrl+C 和 SIGTERM 信号，用于 Kubernetes 优雅关闭
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown...");
        }
    }
}
