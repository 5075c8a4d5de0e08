//! 数据库仓储层
//!
//! 封装订单、积分入队表和用户余额的 SQL 操作。
//!
//! ## 设计原则
//!
//! - 每个存储操作都有独立的超时预算，超时视为存储失败
//! - 账本事务的幂等性由 SQL 条件保证，不依赖调用方去重
//! - 定义 trait 接口以支持 mock 测试

mod order_repo;
mod traits;

pub use order_repo::PgOrderRepository;
pub use traits::*;
