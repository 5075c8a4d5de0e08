//! 积分同步流水线
//!
//! 组装待处理队列、限流时钟、分发器和 Worker，统一管理启动和关闭。

use std::sync::Arc;
use std::time::Duration;

use loyalty_shared::config::AccrualConfig;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::dispatcher::BacklogDispatcher;
use crate::error::{AccrualError, Result};
use crate::oracle::AccrualOracle;
use crate::queue::PendingQueue;
use crate::repository::OrderStore;
use crate::throttle::ThrottleClock;
use crate::worker::AccrualWorker;

/// 等待关闭信号
///
/// 发送端被丢弃也视为关闭。
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// 流水线运行参数
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub workers: usize,
    pub idle_backoff: Duration,
    pub requeue_terminal: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from(&AccrualConfig::default())
    }
}

impl From<&AccrualConfig> for PipelineSettings {
    fn from(config: &AccrualConfig) -> Self {
        Self {
            workers: config.workers,
            idle_backoff: config.idle_backoff(),
            requeue_terminal: config.requeue_terminal,
        }
    }
}

pub struct AccrualPipeline {
    store: Arc<dyn OrderStore>,
    oracle: Arc<dyn AccrualOracle>,
    queue: Arc<PendingQueue>,
    throttle: Arc<ThrottleClock>,
    settings: PipelineSettings,
}

impl AccrualPipeline {
    pub fn new(
        store: Arc<dyn OrderStore>,
        oracle: Arc<dyn AccrualOracle>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            store,
            oracle,
            queue: Arc::new(PendingQueue::new()),
            throttle: Arc::new(ThrottleClock::new()),
            settings,
        }
    }

    /// 恢复积压订单并启动分发器和所有 Worker
    ///
    /// 积压恢复失败时直接返回错误，不启动任何后台任务。
    pub async fn start(self) -> Result<PipelineHandle> {
        if self.settings.workers == 0 {
            return Err(AccrualError::InvalidConfig(
                "accrual.workers 必须大于 0".to_string(),
            ));
        }

        let dispatcher = BacklogDispatcher::new(
            self.store.clone(),
            self.queue.clone(),
            self.settings.idle_backoff,
        );
        if let Err(e) = dispatcher.recover_backlog().await {
            error!(error = %e, "积压订单恢复失败");
            return Err(e);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::with_capacity(self.settings.workers + 1);
        tasks.push(tokio::spawn(dispatcher.run(shutdown_rx.clone())));

        for id in 0..self.settings.workers {
            let worker = AccrualWorker::new(
                id,
                self.queue.clone(),
                self.throttle.clone(),
                self.oracle.clone(),
                self.store.clone(),
            )
            .requeue_terminal(self.settings.requeue_terminal);
            tasks.push(tokio::spawn(worker.run(shutdown_rx.clone())));
        }

        info!(
            workers = self.settings.workers,
            queued = self.queue.len(),
            "积分同步流水线已启动"
        );

        Ok(PipelineHandle {
            shutdown_tx,
            tasks,
            queue: self.queue,
        })
    }
}

/// 运行中的流水线
pub struct PipelineHandle {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    queue: Arc<PendingQueue>,
}

impl PipelineHandle {
    pub fn queue(&self) -> Arc<PendingQueue> {
        self.queue.clone()
    }

    /// 发送关闭信号并等待所有任务退出
    pub async fn shutdown(self) {
        info!("正在关闭积分同步流水线...");
        let _ = self.shutdown_tx.send(true);

        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "流水线任务异常退出");
            }
        }

        info!(remaining = self.queue.len(), "积分同步流水线已关闭");
    }
}
