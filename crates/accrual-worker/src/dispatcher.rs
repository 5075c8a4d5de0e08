//! 积分订单分发器
//!
//! 启动时把库中所有未完结订单放到队首，之后持续从入队表领取新订单追加到队尾。
//! 入队表为空时按配置的间隔休眠。
//!
//! 领取到的订单先入内存队列再确认。确认失败时入队记录保留，租约到期后会被再次领取，
//! 同一订单在队列中出现两次也只会入账一次。

use std::sync::Arc;
use std::time::Duration;

use loyalty_shared::observability::metrics;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::pipeline::shutdown_requested;
use crate::queue::PendingQueue;
use crate::repository::OrderStore;

pub struct BacklogDispatcher {
    store: Arc<dyn OrderStore>,
    queue: Arc<PendingQueue>,
    idle_backoff: Duration,
}

impl BacklogDispatcher {
    pub fn new(
        store: Arc<dyn OrderStore>,
        queue: Arc<PendingQueue>,
        idle_backoff: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            idle_backoff,
        }
    }

    /// 恢复积压订单，按上传时间从早到晚放到队首
    ///
    /// 启动阶段调用，失败时由调用方终止启动。
    pub async fn recover_backlog(&self) -> Result<usize> {
        let orders = self.store.list_non_terminal_orders().await?;
        let count = orders.len();
        self.queue.push_front(orders);
        metrics::set_queue_depth(self.queue.len());

        info!(recovered = count, "积压订单已恢复到待处理队列");
        Ok(count)
    }

    /// 领取一笔新订单追加到队尾，返回是否取到
    pub async fn poll_once(&self) -> Result<bool> {
        match self.store.fetch_next_pending_order().await? {
            Some(order) => {
                let number = order.number.clone();
                debug!(order_number = %number, user_id = order.user_id, "新订单已入队");
                self.queue.push_back([order]);
                metrics::set_queue_depth(self.queue.len());

                if let Err(e) = self.store.acknowledge_pending_order(&number).await {
                    warn!(
                        order_number = %number,
                        error = %e,
                        "确认领取失败，租约到期后将被再次领取"
                    );
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// 持续领取新订单，直到收到关闭信号
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            idle_backoff_ms = self.idle_backoff.as_millis() as u64,
            "订单分发器已启动"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.poll_once().await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    warn!(error = %e, "领取待处理订单失败，稍后重试");
                }
            }

            tokio::select! {
                biased;

                _ = shutdown_requested(&mut shutdown) => break,
                _ = tokio::time::sleep(self.idle_backoff) => {}
            }
        }

        info!("订单分发器已退出");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Order, OrderStatus};
    use crate::repository::MockOrderStore;
    use crate::test_utils::MemoryOrderStore;
    use chrono::{Duration as ChronoDuration, Utc};
    use rust_decimal::Decimal;

    fn order_at(number: &str, minutes_ago: i64) -> Order {
        Order {
            uploaded_at: Utc::now() - ChronoDuration::minutes(minutes_ago),
            ..Order::new(1, number)
        }
    }

    #[tokio::test]
    async fn test_recover_backlog_puts_oldest_first_ahead_of_queue() {
        let store = Arc::new(MemoryOrderStore::new());
        store.insert_order(order_at("new", 1));
        store.insert_order(order_at("old", 30));
        store.insert_order(
            order_at("done", 60).with_update(OrderStatus::Processed, Decimal::new(5, 0)),
        );

        let queue = Arc::new(PendingQueue::new());
        queue.push_back([Order::new(1, "already-queued")]);

        let dispatcher = BacklogDispatcher::new(store, queue.clone(), Duration::from_millis(10));
        assert_eq!(dispatcher.recover_backlog().await.unwrap(), 2);
        assert_eq!(queue.numbers(), vec!["old", "new", "already-queued"]);
    }

    #[tokio::test]
    async fn test_recovered_orders_are_not_fetched_again() {
        let store = Arc::new(MemoryOrderStore::new());
        store.submit_order(1, "100").await.unwrap();

        let queue = Arc::new(PendingQueue::new());
        let dispatcher =
            BacklogDispatcher::new(store.clone(), queue.clone(), Duration::from_millis(10));

        assert_eq!(dispatcher.recover_backlog().await.unwrap(), 1);
        assert!(store.intake().is_empty());
        assert!(!dispatcher.poll_once().await.unwrap());
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_recover_backlog_propagates_storage_failure() {
        let mut store = MockOrderStore::new();
        store
            .expect_list_non_terminal_orders()
            .times(1)
            .returning(|| Err(sqlx::Error::PoolClosed.into()));

        let queue = Arc::new(PendingQueue::new());
        let dispatcher =
            BacklogDispatcher::new(Arc::new(store), queue.clone(), Duration::from_millis(10));

        assert!(dispatcher.recover_backlog().await.is_err());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_poll_once_appends_to_tail() {
        let store = Arc::new(MemoryOrderStore::new());
        store.submit_order(1, "100").await.unwrap();

        let queue = Arc::new(PendingQueue::new());
        queue.push_back([Order::new(1, "head")]);
        let dispatcher =
            BacklogDispatcher::new(store.clone(), queue.clone(), Duration::from_millis(10));

        assert!(dispatcher.poll_once().await.unwrap());
        assert!(!dispatcher.poll_once().await.unwrap());
        assert_eq!(queue.numbers(), vec!["head", "100"]);
        assert!(store.intake().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_lost_in_flight_is_offered_again_after_lease() {
        let store = Arc::new(MemoryOrderStore::new().with_claim_lease(Duration::from_secs(30)));
        store.submit_order(1, "100").await.unwrap();
        store.lose_next_fetch_replies(1);

        let queue = Arc::new(PendingQueue::new());
        let dispatcher =
            BacklogDispatcher::new(store.clone(), queue.clone(), Duration::from_millis(10));

        // 领取已生效但结果没有返回
        assert!(dispatcher.poll_once().await.is_err());
        assert!(queue.is_empty());
        assert_eq!(store.intake(), vec!["100"]);

        // 租约期内不会被重复领取
        assert!(!dispatcher.poll_once().await.unwrap());

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(dispatcher.poll_once().await.unwrap());
        assert_eq!(queue.numbers(), vec!["100"]);
        assert!(store.intake().is_empty());
    }

    #[tokio::test]
    async fn test_acknowledge_failure_keeps_order_queued() {
        let mut store = MockOrderStore::new();
        store
            .expect_fetch_next_pending_order()
            .times(1)
            .returning(|| Ok(Some(Order::new(1, "100"))));
        store
            .expect_acknowledge_pending_order()
            .withf(|number| number.to_string() == "100")
            .times(1)
            .returning(|_| Err(sqlx::Error::PoolTimedOut.into()));

        let queue = Arc::new(PendingQueue::new());
        let dispatcher =
            BacklogDispatcher::new(Arc::new(store), queue.clone(), Duration::from_millis(10));

        assert!(dispatcher.poll_once().await.unwrap());
        assert_eq!(queue.numbers(), vec!["100"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_survives_fetch_errors_and_stops_on_shutdown() {
        let store = Arc::new(MemoryOrderStore::new());
        store.fail_next_fetches(2);
        store.submit_order(1, "100").await.unwrap();

        let queue = Arc::new(PendingQueue::new());
        let dispatcher = BacklogDispatcher::new(store, queue.clone(), Duration::from_secs(1));
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(dispatcher.run(rx));

        // 两次失败各休眠一个退避周期后取到订单
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(queue.numbers(), vec!["100"]);

        tx.send(true).unwrap();
        task.await.unwrap();
    }
}
