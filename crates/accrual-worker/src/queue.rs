//! 待处理订单队列
//!
//! 内存中的双端队列，保存等待向积分服务查询状态的订单副本。
//! 队首插入用于失败订单的优先重试，队尾插入用于正常入队和轮转查询。
//! 三种操作共用一把互斥锁；长度不设上限，实际规模受未完结订单数约束。

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::QueueError;
use crate::models::Order;

/// 待处理订单队列
#[derive(Default)]
pub struct PendingQueue {
    orders: Mutex<VecDeque<Order>>,
    /// 有新订单入队时唤醒等待中的 Worker
    available: Notify,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// 插入到队首，保持传入顺序，排在所有已有订单之前
    pub fn push_front<I>(&self, orders: I)
    where
        I: IntoIterator<Item = Order>,
    {
        let batch: Vec<Order> = orders.into_iter().collect();
        if batch.is_empty() {
            return;
        }
        {
            let mut queue = self.orders.lock();
            for order in batch.into_iter().rev() {
                queue.push_front(order);
            }
        }
        self.available.notify_waiters();
    }

    /// 追加到队尾
    pub fn push_back<I>(&self, orders: I)
    where
        I: IntoIterator<Item = Order>,
    {
        let pushed = {
            let mut queue = self.orders.lock();
            let before = queue.len();
            queue.extend(orders);
            queue.len() > before
        };
        if pushed {
            self.available.notify_waiters();
        }
    }

    /// 取出队首订单，队列为空时返回 `QueueError::Empty`
    pub fn pop_front(&self) -> Result<Order, QueueError> {
        self.orders.lock().pop_front().ok_or(QueueError::Empty)
    }

    /// 等待直到有订单可取
    ///
    /// 先登记唤醒再检查队列，避免检查与等待之间的入队通知丢失。
    pub async fn pop_wait(&self) -> Order {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Ok(order) = self.pop_front() {
                return order;
            }

            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.orders.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.lock().is_empty()
    }

    /// 当前队列中的订单号快照（按出队顺序）
    pub fn numbers(&self) -> Vec<String> {
        self.orders.lock().iter().map(|o| o.number.clone()).collect()
    }
}
