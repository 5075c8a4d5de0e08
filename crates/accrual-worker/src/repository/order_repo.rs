//! 订单仓储
//!
//! PostgreSQL 实现。领取入队表时使用 `FOR UPDATE SKIP LOCKED`，
//! 多个实例并发领取时互不阻塞，也不会拿到同一笔订单。
//! 领取只写入 `claimed_at` 租约，订单进入内存队列后再确认删除。

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use loyalty_shared::error::LoyaltyError;
use sqlx::PgPool;
use tracing::{debug, info, warn};

use super::traits::OrderStore;
use crate::error::{AccrualError, Result};
use crate::ledger::Ledger;
use crate::models::{Order, UserBalance};

/// 订单仓储
pub struct PgOrderRepository {
    pool: PgPool,
    /// 单次存储操作的时间预算
    op_timeout: Duration,
    /// 入队表领取租约
    claim_lease: Duration,
}

impl PgOrderRepository {
    pub fn new(pool: PgPool, op_timeout: Duration) -> Self {
        Self {
            pool,
            op_timeout,
            claim_lease: Duration::from_secs(30),
        }
    }

    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.claim_lease = lease;
        self
    }

    /// 在时间预算内执行存储操作，超时按存储失败处理
    ///
    /// 超时会丢弃未完成的 future，其中尚未提交的事务随之回滚。
    async fn within_budget<T, F>(&self, operation: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(operation, timeout_ms = self.op_timeout.as_millis() as u64, "存储操作超时");
                Err(LoyaltyError::StorageTimeout {
                    operation,
                    timeout: self.op_timeout,
                }
                .into())
            }
        }
    }

    async fn list_non_terminal(&self) -> Result<Vec<Order>> {
        let mut tx = self.pool.begin().await?;

        let orders = sqlx::query_as::<_, Order>(
            r#"
            SELECT user_id, number, status, accrual, uploaded_at
            FROM orders
            WHERE status IN ('NEW', 'PROCESSING')
            ORDER BY uploaded_at ASC, number ASC
            "#,
        )
        .fetch_all(&mut *tx)
        .await?;

        let numbers: Vec<String> = orders.iter().map(|o| o.number.clone()).collect();
        sqlx::query("DELETE FROM accrual_queue WHERE number = ANY($1)")
            .bind(&numbers)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(orders)
    }

    async fn fetch_next(&self) -> Result<Option<Order>> {
        // 领取与加租约在同一条语句中完成，租约过期的领取视为未领取
        let order = sqlx::query_as::<_, Order>(
            r#"
            WITH next AS (
                SELECT number
                FROM accrual_queue
                WHERE claimed_at IS NULL
                   OR claimed_at <= NOW() - make_interval(secs => $1)
                ORDER BY enqueued_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            ),
            claimed AS (
                UPDATE accrual_queue q
                SET claimed_at = NOW()
                FROM next
                WHERE q.number = next.number
                RETURNING q.number
            )
            SELECT o.user_id, o.number, o.status, o.accrual, o.uploaded_at
            FROM orders o
            JOIN claimed c ON o.number = c.number
            "#,
        )
        .bind(self.claim_lease.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        Ok(order)
    }

    async fn acknowledge(&self, number: &str) -> Result<()> {
        sqlx::query("DELETE FROM accrual_queue WHERE number = $1")
            .bind(number)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn submit(&self, user_id: i64, number: &str) -> Result<Order> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query_as::<_, Order>(
            r#"
            INSERT INTO orders (number, user_id, status, accrual, uploaded_at)
            VALUES ($1, $2, 'NEW', 0, NOW())
            ON CONFLICT (number) DO NOTHING
            RETURNING user_id, number, status, accrual, uploaded_at
            "#,
        )
        .bind(number)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(order) = inserted else {
            let owner: i64 = sqlx::query_scalar("SELECT user_id FROM orders WHERE number = $1")
                .bind(number)
                .fetch_one(&mut *tx)
                .await?;

            return Err(if owner == user_id {
                AccrualError::AlreadyUploaded {
                    number: number.to_string(),
                }
            } else {
                AccrualError::UploadedByOtherUser {
                    number: number.to_string(),
                }
            });
        };

        sqlx::query(
            r#"
            INSERT INTO accrual_queue (number, enqueued_at, claimed_at)
            VALUES ($1, NOW(), NULL)
            ON CONFLICT (number) DO NOTHING
            "#,
        )
        .bind(number)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        info!(user_id, order_number = number, "订单已登记");
        Ok(order)
    }

    async fn balance(&self, user_id: i64) -> Result<UserBalance> {
        sqlx::query_as::<_, UserBalance>(
            "SELECT id AS user_id, balance, withdrawn FROM users WHERE id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            LoyaltyError::NotFound {
                entity: "User".to_string(),
                id: user_id.to_string(),
            }
            .into()
        })
    }
}

#[async_trait]
impl OrderStore for PgOrderRepository {
    async fn list_non_terminal_orders(&self) -> Result<Vec<Order>> {
        let orders = self
            .within_budget("list_non_terminal_orders", self.list_non_terminal())
            .await?;
        debug!(count = orders.len(), "已加载未完结订单");
        Ok(orders)
    }

    async fn commit_order_updates(&self, orders: &[Order]) -> Result<usize> {
        self.within_budget("commit_order_updates", Ledger::commit(&self.pool, orders))
            .await
    }

    async fn fetch_next_pending_order(&self) -> Result<Option<Order>> {
        self.within_budget("fetch_next_pending_order", self.fetch_next())
            .await
    }

    async fn acknowledge_pending_order(&self, number: &str) -> Result<()> {
        self.within_budget("acknowledge_pending_order", self.acknowledge(number))
            .await
    }

    async fn submit_order(&self, user_id: i64, number: &str) -> Result<Order> {
        self.within_budget("submit_order", self.submit(user_id, number))
            .await
    }

    async fn get_balance(&self, user_id: i64) -> Result<UserBalance> {
        self.within_budget("get_balance", self.balance(user_id)).await
    }
}
