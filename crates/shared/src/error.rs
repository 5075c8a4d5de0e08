//! 统一错误处理模块
//!
//! 定义积分系统各服务共享的错误类型，使用 thiserror 提供良好的错误信息。

use std::time::Duration;

use thiserror::Error;

/// 系统错误类型
#[derive(Debug, Error)]
pub enum LoyaltyError {
    // ==================== 数据库错误 ====================
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    /// 单次存储操作超出时间预算，连接池可能被慢查询占满
    #[error("数据库操作超时: {operation} 超过 {timeout:?}")]
    StorageTimeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("记录未找到: {entity} id={id}")]
    NotFound { entity: String, id: String },

    // ==================== 配置错误 ====================
    #[error("配置加载失败: {0}")]
    Config(#[from] config::ConfigError),

    // ==================== 通用错误 ====================
    #[error("内部错误: {0}")]
    Internal(String),
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, LoyaltyError>;

impl LoyaltyError {
    /// 是否为可重试错误
    ///
    /// 行级约束冲突等确定性失败重试也不会成功，只有连接类故障值得重试。
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Database(e) => matches!(
                e,
                sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::WorkerCrashed
            ),
            Self::StorageTimeout { .. } => true,
            _ => false,
        }
    }
}
