//! 积分账本
//!
//! 订单状态更新与用户余额入账必须在同一个事务中完成。
//! 状态更新只在库中状态与新状态不同、且尚未完结时生效，
//! 入账只针对更新真正生效且新状态为 PROCESSED 的行，并使用更新返回的订单归属用户。
//! PROCESSED 是终态，因此每笔订单至多入账一次。

use loyalty_shared::error::LoyaltyError;
use rust_decimal::Decimal;
use sqlx::{PgConnection, PgPool};
use tracing::{debug, info};

use crate::error::Result;
use crate::models::Order;

pub struct Ledger;

impl Ledger {
    /// 开启事务提交一批订单更新，返回实际发生状态变化的订单数
    ///
    /// 任一订单失败则整个事务回滚，订单和余额都不会部分生效。
    pub async fn commit(pool: &PgPool, orders: &[Order]) -> Result<usize> {
        let mut tx = pool.begin().await?;
        let applied = Self::apply_in_tx(&mut tx, orders).await?;
        tx.commit().await?;

        if applied > 0 {
            info!(orders = orders.len(), applied, "账本事务已提交");
        }
        Ok(applied)
    }

    /// 在调用方事务中应用订单更新
    pub async fn apply_in_tx(tx: &mut PgConnection, orders: &[Order]) -> Result<usize> {
        let mut applied = 0;

        for order in orders {
            let owner: Option<i64> = sqlx::query_scalar(
                r#"
                UPDATE orders
                SET status = $2, accrual = $3
                WHERE number = $1
                  AND status <> $2
                  AND status NOT IN ('PROCESSED', 'INVALID')
                RETURNING user_id
                "#,
            )
            .bind(&order.number)
            .bind(order.status)
            .bind(order.credited_accrual())
            .fetch_optional(&mut *tx)
            .await?;

            let Some(user_id) = owner else {
                debug!(
                    order_number = %order.number,
                    status = %order.status,
                    "订单状态未变化，跳过"
                );
                continue;
            };
            applied += 1;

            let amount = order.credited_accrual();
            if amount > Decimal::ZERO {
                Self::credit_in_tx(tx, user_id, amount).await?;
                debug!(order_number = %order.number, user_id, accrual = %amount, "积分已入账");
            }
        }

        Ok(applied)
    }

    async fn credit_in_tx(tx: &mut PgConnection, user_id: i64, amount: Decimal) -> Result<()> {
        let result = sqlx::query("UPDATE users SET balance = balance + $1 WHERE id = $2")
            .bind(amount)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(LoyaltyError::NotFound {
                entity: "User".to_string(),
                id: user_id.to_string(),
            }
            .into());
        }
        Ok(())
    }
}
