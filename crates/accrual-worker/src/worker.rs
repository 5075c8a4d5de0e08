//! 积分同步 Worker
//!
//! 每轮处理一笔订单：出队 → 等待限流冷却 → 查询积分服务 → 提交或回队。
//!
//! ## 回队规则
//!
//! - 积分服务出错：订单放回队首，只放一次；服务要求冷却时推迟全局时钟
//! - 状态无变化：放回队尾
//! - 状态变化：通过账本提交，成功后以新状态放回队尾，已完结的订单默认不再回队
//! - 账本提交失败：以提交前的旧状态放回队尾，下一轮重新提交

use std::sync::Arc;

use loyalty_shared::observability::metrics;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::models::{Order, OrderStatus};
use crate::oracle::AccrualOracle;
use crate::pipeline::shutdown_requested;
use crate::queue::PendingQueue;
use crate::repository::OrderStore;
use crate::throttle::ThrottleClock;

/// 单轮处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// 积分服务出错，订单已放回队首
    Retried,
    /// 状态未变化，订单已放回队尾
    Unchanged,
    /// 新状态已提交
    Committed {
        status: OrderStatus,
        requeued: bool,
    },
    /// 账本提交失败，订单以旧状态放回队尾
    CommitFailed,
}

pub struct AccrualWorker {
    id: usize,
    queue: Arc<PendingQueue>,
    throttle: Arc<ThrottleClock>,
    oracle: Arc<dyn AccrualOracle>,
    store: Arc<dyn OrderStore>,
    requeue_terminal: bool,
}

impl AccrualWorker {
    pub fn new(
        id: usize,
        queue: Arc<PendingQueue>,
        throttle: Arc<ThrottleClock>,
        oracle: Arc<dyn AccrualOracle>,
        store: Arc<dyn OrderStore>,
    ) -> Self {
        Self {
            id,
            queue,
            throttle,
            oracle,
            store,
            requeue_terminal: false,
        }
    }

    /// 已完结的订单提交后是否继续回队
    pub fn requeue_terminal(mut self, requeue: bool) -> Self {
        self.requeue_terminal = requeue;
        self
    }

    /// 持续处理订单，直到收到关闭信号
    ///
    /// 关闭信号只在两轮之间生效：正在查询或提交的订单会先处理完。
    /// 等待冷却期间收到信号时，手上的订单放回队首后退出。
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(worker_id = self.id, "积分 Worker 已启动");

        loop {
            let order = tokio::select! {
                biased;

                _ = shutdown_requested(&mut shutdown) => break,
                order = self.queue.pop_wait() => order,
            };

            tokio::select! {
                biased;

                _ = shutdown_requested(&mut shutdown) => {
                    debug!(
                        worker_id = self.id,
                        order_number = %order.number,
                        "冷却期间收到关闭信号，订单放回队首"
                    );
                    self.queue.push_front([order]);
                    break;
                }
                waited = self.throttle.wait() => {
                    if !waited.is_zero() {
                        debug!(
                            worker_id = self.id,
                            waited_ms = waited.as_millis() as u64,
                            "限流冷却结束"
                        );
                    }
                }
            }

            self.process_order(order).await;
            metrics::set_queue_depth(self.queue.len());
        }

        info!(worker_id = self.id, "积分 Worker 已退出");
    }

    /// 执行一轮完整处理，队列为空时等待
    pub async fn run_pass(&self) -> PassOutcome {
        let order = self.queue.pop_wait().await;
        self.throttle.wait().await;
        self.process_order(order).await
    }

    /// 查询一笔订单并根据结果提交或回队
    pub async fn process_order(&self, order: Order) -> PassOutcome {
        let started = Instant::now();
        let checked = self.oracle.check_order(&order).await;
        let elapsed = started.elapsed().as_secs_f64();

        let updated = match checked {
            Ok(updated) => updated,
            Err(err) => {
                metrics::record_oracle_request(err.kind(), elapsed);
                if let Some(cooldown) = err.cooldown() {
                    self.throttle.defer_for(cooldown);
                    metrics::record_throttle(cooldown.as_secs_f64());
                    warn!(
                        worker_id = self.id,
                        order_number = %order.number,
                        cooldown_secs = cooldown.as_secs(),
                        "积分服务限流，全局暂停请求"
                    );
                } else {
                    warn!(
                        worker_id = self.id,
                        order_number = %order.number,
                        error = %err,
                        "查询积分服务失败，订单放回队首"
                    );
                }
                self.queue.push_front([order]);
                metrics::record_requeue("front");
                return PassOutcome::Retried;
            }
        };

        if updated.status == order.status {
            metrics::record_oracle_request("unchanged", elapsed);
            self.queue.push_back([order]);
            metrics::record_requeue("back");
            return PassOutcome::Unchanged;
        }
        metrics::record_oracle_request("updated", elapsed);

        match self
            .store
            .commit_order_updates(std::slice::from_ref(&updated))
            .await
        {
            Ok(applied) => {
                metrics::record_ledger_commit("ok", applied);
                info!(
                    worker_id = self.id,
                    order_number = %updated.number,
                    from = %order.status,
                    to = %updated.status,
                    accrual = %updated.accrual,
                    applied,
                    "订单状态已提交"
                );

                let status = updated.status;
                let requeued = !status.is_terminal() || self.requeue_terminal;
                if requeued {
                    self.queue.push_back([updated]);
                    metrics::record_requeue("back");
                } else {
                    debug!(order_number = %updated.number, %status, "订单已完结，移出队列");
                }
                PassOutcome::Committed { status, requeued }
            }
            Err(err) => {
                metrics::record_ledger_commit("error", 1);
                error!(
                    worker_id = self.id,
                    order_number = %order.number,
                    to = %updated.status,
                    error = %err,
                    "账本提交失败，订单保留旧状态等待重试"
                );
                self.queue.push_back([order]);
                metrics::record_requeue("back");
                PassOutcome::CommitFailed
            }
        }
    }
}
