//! 测试工具模块
//!
//! 提供内存版订单存储和脚本化积分服务，用于在没有数据库和网络的情况下
//! 驱动 Worker、分发器和完整流水线。

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use loyalty_shared::error::LoyaltyError;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::time::Instant;

use crate::error::{AccrualError, OracleError, Result};
use crate::models::{Order, OrderStatus, UserBalance};
use crate::oracle::AccrualOracle;
use crate::repository::OrderStore;

// ==================== 内存订单存储 ====================

/// 入队表记录
#[derive(Debug, Clone)]
struct IntakeEntry {
    number: String,
    claimed_at: Option<Instant>,
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    orders: HashMap<String, Order>,
    users: HashMap<i64, UserBalance>,
    intake: VecDeque<IntakeEntry>,
}

/// 内存版订单存储
///
/// 账本提交在状态副本上执行，全部成功后才替换原状态，
/// 失败时副本被丢弃，效果等同事务回滚。
pub struct MemoryOrderStore {
    state: Mutex<MemoryState>,
    claim_lease: Duration,
    failing_commits: AtomicUsize,
    failing_fetches: AtomicUsize,
    lost_fetch_replies: AtomicUsize,
    fail_listing: AtomicBool,
    commit_attempts: AtomicUsize,
}

fn injected_failure() -> AccrualError {
    AccrualError::from(sqlx::Error::PoolTimedOut)
}

impl Default for MemoryOrderStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryOrderStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            claim_lease: Duration::from_secs(30),
            failing_commits: AtomicUsize::new(0),
            failing_fetches: AtomicUsize::new(0),
            lost_fetch_replies: AtomicUsize::new(0),
            fail_listing: AtomicBool::new(false),
            commit_attempts: AtomicUsize::new(0),
        }
    }

    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.claim_lease = lease;
        self
    }

    /// 创建余额为 0 的用户
    pub fn insert_user(&self, user_id: i64) {
        self.state.lock().users.insert(
            user_id,
            UserBalance {
                user_id,
                balance: Decimal::ZERO,
                withdrawn: Decimal::ZERO,
            },
        );
    }

    /// 直接写入订单，不进入入队表
    pub fn insert_order(&self, order: Order) {
        self.state.lock().orders.insert(order.number.clone(), order);
    }

    pub fn order(&self, number: &str) -> Option<Order> {
        self.state.lock().orders.get(number).cloned()
    }

    pub fn balance_of(&self, user_id: i64) -> Option<Decimal> {
        self.state.lock().users.get(&user_id).map(|u| u.balance)
    }

    /// 入队表中剩余的订单号（含已领取未确认的）
    pub fn intake(&self) -> Vec<String> {
        self.state
            .lock()
            .intake
            .iter()
            .map(|entry| entry.number.clone())
            .collect()
    }

    /// 接下来的 n 次账本提交在写入后失败（整体回滚）
    pub fn fail_next_commits(&self, n: usize) {
        self.failing_commits.store(n, Ordering::SeqCst);
    }

    /// 接下来的 n 次领取失败
    pub fn fail_next_fetches(&self, n: usize) {
        self.failing_fetches.store(n, Ordering::SeqCst);
    }

    /// 接下来的 n 次领取在加上租约后返回超时，模拟结果在途丢失
    pub fn lose_next_fetch_replies(&self, n: usize) {
        self.lost_fetch_replies.store(n, Ordering::SeqCst);
    }

    /// 启动扫描是否失败
    pub fn fail_listing(&self, fail: bool) {
        self.fail_listing.store(fail, Ordering::SeqCst);
    }

    /// 账本提交的尝试次数（含失败）
    pub fn commit_attempts(&self) -> usize {
        self.commit_attempts.load(Ordering::SeqCst)
    }

    fn take_fault(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn apply(state: &mut MemoryState, orders: &[Order]) -> Result<usize> {
        let mut applied = 0;
        for order in orders {
            let Some(stored) = state.orders.get_mut(&order.number) else {
                continue;
            };
            if stored.status == order.status || stored.status.is_terminal() {
                continue;
            }
            let amount = order.credited_accrual();
            stored.status = order.status;
            stored.accrual = amount;
            applied += 1;

            if amount > Decimal::ZERO {
                let owner = stored.user_id;
                let user = state.users.get_mut(&owner).ok_or_else(|| LoyaltyError::NotFound {
                    entity: "User".to_string(),
                    id: owner.to_string(),
                })?;
                user.balance += amount;
            }
        }
        Ok(applied)
    }
}

#[async_trait]
impl OrderStore for MemoryOrderStore {
    async fn list_non_terminal_orders(&self) -> Result<Vec<Order>> {
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(injected_failure());
        }

        let mut state = self.state.lock();
        let mut orders: Vec<Order> = state
            .orders
            .values()
            .filter(|o| !o.status.is_terminal())
            .cloned()
            .collect();
        orders.sort_by(|a, b| {
            a.uploaded_at
                .cmp(&b.uploaded_at)
                .then_with(|| a.number.cmp(&b.number))
        });
        state
            .intake
            .retain(|entry| !orders.iter().any(|o| o.number == entry.number));
        Ok(orders)
    }

    async fn commit_order_updates(&self, orders: &[Order]) -> Result<usize> {
        self.commit_attempts.fetch_add(1, Ordering::SeqCst);

        let mut state = self.state.lock();
        let mut draft = state.clone();
        let applied = Self::apply(&mut draft, orders)?;

        if Self::take_fault(&self.failing_commits) {
            return Err(injected_failure());
        }

        *state = draft;
        Ok(applied)
    }

    async fn fetch_next_pending_order(&self) -> Result<Option<Order>> {
        if Self::take_fault(&self.failing_fetches) {
            return Err(injected_failure());
        }

        let now = Instant::now();
        let mut state = self.state.lock();
        let MemoryState { orders, intake, .. } = &mut *state;

        let mut claimed = None;
        intake.retain_mut(|entry| {
            if claimed.is_some() {
                return true;
            }
            if entry
                .claimed_at
                .is_some_and(|at| at + self.claim_lease > now)
            {
                return true;
            }
            // 订单不存在的入队记录直接丢弃
            let Some(order) = orders.get(&entry.number) else {
                return false;
            };
            entry.claimed_at = Some(now);
            claimed = Some(order.clone());
            true
        });

        if claimed.is_some() && Self::take_fault(&self.lost_fetch_replies) {
            return Err(injected_failure());
        }
        Ok(claimed)
    }

    async fn acknowledge_pending_order(&self, number: &str) -> Result<()> {
        self.state
            .lock()
            .intake
            .retain(|entry| entry.number != number);
        Ok(())
    }

    async fn submit_order(&self, user_id: i64, number: &str) -> Result<Order> {
        let mut state = self.state.lock();
        if let Some(existing) = state.orders.get(number) {
            let number = number.to_string();
            return Err(if existing.user_id == user_id {
                AccrualError::AlreadyUploaded { number }
            } else {
                AccrualError::UploadedByOtherUser { number }
            });
        }

        let order = Order::new(user_id, number);
        state.orders.insert(order.number.clone(), order.clone());
        state.intake.push_back(IntakeEntry {
            number: order.number.clone(),
            claimed_at: None,
        });
        Ok(order)
    }

    async fn get_balance(&self, user_id: i64) -> Result<UserBalance> {
        self.state.lock().users.get(&user_id).cloned().ok_or_else(|| {
            LoyaltyError::NotFound {
                entity: "User".to_string(),
                id: user_id.to_string(),
            }
            .into()
        })
    }
}

// ==================== 脚本化积分服务 ====================

/// 积分服务的一次预设响应
#[derive(Debug, Clone)]
pub enum OracleReply {
    /// 204，暂无信息
    NoData,
    Status(OrderStatus, Decimal),
    Throttled(Duration),
    Transient,
    Protocol,
}

/// 按订单号依次返回预设响应的积分服务
///
/// 脚本用完后一律返回 NoData。每次调用都会记录订单号和调用时刻。
#[derive(Default)]
pub struct ScriptedOracle {
    replies: Mutex<HashMap<String, VecDeque<OracleReply>>>,
    calls: Mutex<Vec<(String, Instant)>>,
}

impl ScriptedOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script<I>(&self, number: &str, replies: I)
    where
        I: IntoIterator<Item = OracleReply>,
    {
        self.replies
            .lock()
            .entry(number.to_string())
            .or_default()
            .extend(replies);
    }

    pub fn calls(&self) -> Vec<(String, Instant)> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, number: &str) -> usize {
        self.calls.lock().iter().filter(|(n, _)| n == number).count()
    }
}

#[async_trait]
impl AccrualOracle for ScriptedOracle {
    async fn check_order(&self, order: &Order) -> std::result::Result<Order, OracleError> {
        self.calls
            .lock()
            .push((order.number.clone(), Instant::now()));

        let reply = self
            .replies
            .lock()
            .get_mut(&order.number)
            .and_then(|r| r.pop_front())
            .unwrap_or(OracleReply::NoData);

        match reply {
            OracleReply::NoData => Ok(order.clone()),
            OracleReply::Status(status, accrual) => Ok(order.with_update(status, accrual)),
            OracleReply::Throttled(retry_after) => Err(OracleError::Throttled { retry_after }),
            OracleReply::Transient => Err(OracleError::Transient("scripted failure".to_string())),
            OracleReply::Protocol => Err(OracleError::Protocol("scripted failure".to_string())),
        }
    }
}
