//! 全局限流时钟
//!
//! 保存积分服务要求的"不早于"时间点，所有 Worker 共享。
//! 时钟只用于节流，不作为正确性屏障：一个 Worker 刚写入的冷却，
//! 另一个 Worker 紧接着的读取可能看不到。

use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;

/// 限流时钟
pub struct ThrottleClock {
    not_before: RwLock<Instant>,
}

impl Default for ThrottleClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ThrottleClock {
    pub fn new() -> Self {
        Self {
            not_before: RwLock::new(Instant::now()),
        }
    }

    /// 距离冷却结束还剩多久，已结束时为 0
    pub fn remaining(&self) -> Duration {
        let not_before = *self.not_before.read();
        not_before.saturating_duration_since(Instant::now())
    }

    /// 设置冷却：now + cooldown 之前不再发起请求
    ///
    /// 时间点只会向后推移，较短的冷却不会提前结束已有的较长冷却。
    /// 返回生效后的时间点。
    pub fn defer_for(&self, cooldown: Duration) -> Instant {
        let candidate = Instant::now() + cooldown;
        let mut not_before = self.not_before.write();
        if candidate > *not_before {
            *not_before = candidate;
        }
        *not_before
    }

    /// 等待冷却结束，返回实际等待的时长
    ///
    /// 每次醒来都重新读取时钟，休眠期间被其他 Worker 推迟的冷却同样生效。
    /// 读锁在计算剩余时间后立即释放，等待期间不持有任何锁。
    pub async fn wait(&self) -> Duration {
        let started = Instant::now();
        loop {
            let remaining = self.remaining();
            if remaining.is_zero() {
                return started.elapsed();
            }
            tokio::time::sleep(remaining).await;
        }
    }
}
