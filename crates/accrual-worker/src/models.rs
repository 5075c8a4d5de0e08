//! 积分同步领域模型
//!
//! 订单状态同时支持数据库（sqlx）和 JSON（serde）序列化。

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// 订单积分状态
///
/// 状态只会前进：进入 INVALID 或 PROCESSED 后不再变化
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "varchar", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// 已上传，尚未被积分服务受理
    #[default]
    New,
    /// 积分服务计算中
    Processing,
    /// 积分服务拒绝计算，不会产生积分
    Invalid,
    /// 计算完成，accrual 有效
    Processed,
}

impl OrderStatus {
    /// 终态订单不会再发生状态变化
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Invalid | Self::Processed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Processing => "PROCESSING",
            Self::Invalid => "INVALID",
            Self::Processed => "PROCESSED",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 积分服务返回的订单状态
///
/// 与本地状态不同，积分服务用 REGISTERED 表示"已登记但未开始计算"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OracleStatus {
    Registered,
    Processing,
    Invalid,
    Processed,
}

impl From<OracleStatus> for OrderStatus {
    fn from(status: OracleStatus) -> Self {
        match status {
            OracleStatus::Registered => Self::New,
            OracleStatus::Processing => Self::Processing,
            OracleStatus::Invalid => Self::Invalid,
            OracleStatus::Processed => Self::Processed,
        }
    }
}

/// 用户上传的订单
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct Order {
    pub user_id: i64,
    /// 订单号全局唯一，创建后不可变
    pub number: String,
    pub status: OrderStatus,
    /// 仅在 PROCESSED 后有意义
    pub accrual: Decimal,
    pub uploaded_at: DateTime<Utc>,
}

impl Order {
    /// 创建一笔刚上传的订单
    pub fn new(user_id: i64, number: impl Into<String>) -> Self {
        Self {
            user_id,
            number: number.into(),
            status: OrderStatus::New,
            accrual: Decimal::ZERO,
            uploaded_at: Utc::now(),
        }
    }

    /// 返回带有新状态和积分的副本，其余字段保持不变
    pub fn with_update(&self, status: OrderStatus, accrual: Decimal) -> Self {
        Self {
            status,
            accrual,
            ..self.clone()
        }
    }

    /// 可入账的积分：只有 PROCESSED 的积分有效，其他状态为 0
    pub fn credited_accrual(&self) -> Decimal {
        if self.status == OrderStatus::Processed {
            self.accrual
        } else {
            Decimal::ZERO
        }
    }
}

/// 用户积分余额
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct UserBalance {
    pub user_id: i64,
    /// 当前可用余额，任何时候都不小于 0
    pub balance: Decimal,
    /// 累计已提现
    pub withdrawn: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(!OrderStatus::New.is_terminal());
        assert!(!OrderStatus::Processing.is_terminal());
        assert!(OrderStatus::Invalid.is_terminal());
        assert!(OrderStatus::Processed.is_terminal());
    }

    #[test]
    fn test_oracle_status_mapping() {
        let parsed: OracleStatus = serde_json::from_str("\"REGISTERED\"").unwrap();
        assert_eq!(OrderStatus::from(parsed), OrderStatus::New);

        let parsed: OracleStatus = serde_json::from_str("\"PROCESSED\"").unwrap();
        assert_eq!(OrderStatus::from(parsed), OrderStatus::Processed);

        // 本地状态 NEW 不是积分服务的合法取值
        assert!(serde_json::from_str::<OracleStatus>("\"NEW\"").is_err());
    }

    #[test]
    fn test_order_status_serialization() {
        let json = serde_json::to_string(&OrderStatus::Processing).unwrap();
        assert_eq!(json, "\"PROCESSING\"");
        assert_eq!(OrderStatus::Processing.to_string(), "PROCESSING");
    }

    #[test]
    fn test_with_update_keeps_identity() {
        let order = Order::new(7, "12345678903");
        let updated = order.with_update(OrderStatus::Processed, Decimal::new(500, 0));

        assert_eq!(updated.number, order.number);
        assert_eq!(updated.user_id, 7);
        assert_eq!(updated.uploaded_at, order.uploaded_at);
        assert_eq!(updated.status, OrderStatus::Processed);
        assert_eq!(updated.accrual, Decimal::new(500, 0));
        // 原订单不受影响
        assert_eq!(order.status, OrderStatus::New);
    }

    #[test]
    fn test_credited_accrual_requires_processed() {
        let order = Order::new(7, "12345678903");
        let processing = order.with_update(OrderStatus::Processing, Decimal::TEN);
        assert_eq!(processing.credited_accrual(), Decimal::ZERO);

        let processed = order.with_update(OrderStatus::Processed, Decimal::TEN);
        assert_eq!(processed.credited_accrual(), Decimal::TEN);
    }
}
