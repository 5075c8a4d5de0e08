//! 订单积分同步服务
//!
//! 持续向外部积分计算服务查询已上传订单的积分状态，
//! 状态变化时在同一事务中更新订单并为用户入账。
//! 积分服务按全局冷却限流，所有 Worker 共享同一个限流时钟。

pub mod dispatcher;
pub mod error;
pub mod ledger;
pub mod models;
pub mod oracle;
pub mod pipeline;
pub mod queue;
pub mod repository;
pub mod test_utils;
pub mod throttle;
pub mod worker;
