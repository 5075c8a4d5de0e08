//! 积分同步服务错误类型
//!
//! 按处理方式划分：积分服务错误（OracleError）只影响订单的重试调度，
//! 存储错误（AccrualError）记录日志后保留订单，只有启动阶段的存储错误是致命的。

use std::time::Duration;

use loyalty_shared::error::LoyaltyError;
use thiserror::Error;

/// 积分服务调用错误
///
/// 所有变体都可重试，由 Worker 转换为回队 + 可选的全局冷却
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OracleError {
    /// 429 限流，携带积分服务建议的等待时间
    #[error("积分服务限流，需等待 {retry_after:?}")]
    Throttled { retry_after: Duration },

    /// 网络层失败或服务端异常
    #[error("积分服务网络故障: {0}")]
    Transient(String),

    /// 响应格式不符合约定
    #[error("积分服务响应无法解析: {0}")]
    Protocol(String),
}

impl OracleError {
    /// 积分服务要求的冷却时间
    pub fn cooldown(&self) -> Option<Duration> {
        match self {
            Self::Throttled { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    /// 用于日志和指标的分类标签
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Throttled { .. } => "throttled",
            Self::Transient(_) => "transient",
            Self::Protocol(_) => "protocol",
        }
    }
}

/// 待处理队列为空，是空闲信号而非故障
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("待处理队列为空")]
    Empty,
}

/// 积分同步服务错误
#[derive(Debug, Error)]
pub enum AccrualError {
    /// 同一用户重复上传同一订单号
    #[error("订单已上传: {number}")]
    AlreadyUploaded { number: String },

    /// 订单号已被其他用户占用
    #[error("订单已被其他用户上传: {number}")]
    UploadedByOtherUser { number: String },

    #[error("配置无效: {0}")]
    InvalidConfig(String),

    /// 透传共享库错误（数据库、超时等），统一归为存储失败
    #[error(transparent)]
    Shared(#[from] LoyaltyError),
}

impl From<sqlx::Error> for AccrualError {
    fn from(err: sqlx::Error) -> Self {
        Self::Shared(LoyaltyError::Database(err))
    }
}

impl AccrualError {
    /// 是否为存储侧失败（账本提交失败等），这类错误只记录日志，订单保留在队列中
    pub fn is_persistence_failure(&self) -> bool {
        matches!(self, Self::Shared(_))
    }
}

pub type Result<T> = std::result::Result<T, AccrualError>;
