//! 仓储 Trait 定义
//!
//! Worker 和分发器只依赖 OrderStore 抽象，测试时可替换为内存实现或 mock

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{Order, UserBalance};

/// 订单存储接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// 列出所有未完结（NEW / PROCESSING）的订单，按上传时间升序
    ///
    /// 同时从入队表中移除这些订单，避免分发器再次取到
    async fn list_non_terminal_orders(&self) -> Result<Vec<Order>>;

    /// 在一个事务中提交订单状态变更并入账，返回实际发生状态变化的订单数
    async fn commit_order_updates(&self, orders: &[Order]) -> Result<usize>;

    /// 从入队表中领取下一笔待处理订单，没有时返回 None
    ///
    /// 领取只在入队表上加租约，不删除记录。租约期内该订单不会被再次领取，
    /// 未确认的领取在租约到期后重新可领，领取结果在途丢失时订单不会遗失。
    async fn fetch_next_pending_order(&self) -> Result<Option<Order>>;

    /// 确认订单已进入内存队列，从入队表中删除
    async fn acknowledge_pending_order(&self, number: &str) -> Result<()>;

    /// 登记新上传的订单并放入入队表
    async fn submit_order(&self, user_id: i64, number: &str) -> Result<Order>;

    /// 查询用户余额
    async fn get_balance(&self, user_id: i64) -> Result<UserBalance>;
}
