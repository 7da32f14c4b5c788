//! 内存降级计数器
//!
//! 持久层不可达时使用的进程内计数存储。只在当前进程内可见，重启即丢失，
//! 降级结束后不会回写持久层。
//!
//! "读取-计算-写入"分两步完成，并发下可能竞争，这是降级模式可接受的不精确。

use dashmap::DashMap;
use lazy_static::lazy_static;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// 进程内窗口计数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryCounter {
    pub count: u64,
    pub window_start: Instant,
}

impl MemoryCounter {
    /// 在 `now` 时刻窗口是否已结束
    pub fn is_expired(&self, now: Instant, window: Duration) -> bool {
        now.duration_since(self.window_start) >= window
    }

    /// 窗口剩余时间
    pub fn remaining(&self, now: Instant, window: Duration) -> Duration {
        window.saturating_sub(now.duration_since(self.window_start))
    }
}

/// 计数存储接口
///
/// 降级层只依赖 `get/set/sweep_expired`，便于替换为测试替身。
pub trait CounterStore: Send + Sync {
    fn get(&self, key: &str) -> Option<MemoryCounter>;

    fn set(&self, key: &str, counter: MemoryCounter);

    /// 清理窗口已结束的计数，返回清理条数
    fn sweep_expired(&self, window: Duration) -> usize;
}

/// 基于 DashMap 的计数存储
#[derive(Default)]
pub struct MemoryCounterStore {
    counters: DashMap<String, MemoryCounter>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    pub fn clear(&self) {
        self.counters.clear();
    }
}

impl CounterStore for MemoryCounterStore {
    fn get(&self, key: &str) -> Option<MemoryCounter> {
        self.counters.get(key).map(|c| *c)
    }

    fn set(&self, key: &str, counter: MemoryCounter) {
        self.counters.insert(key.to_string(), counter);
    }

    fn sweep_expired(&self, window: Duration) -> usize {
        let now = Instant::now();
        let before = self.counters.len();
        self.counters
            .retain(|_, counter| !counter.is_expired(now, window));
        let removed = before.saturating_sub(self.counters.len());
        if removed > 0 {
            debug!("清理了 {} 条过期的内存计数", removed);
        }
        removed
    }
}

lazy_static! {
    /// 进程级降级计数存储
    pub static ref GLOBAL_FALLBACK_COUNTERS: Arc<MemoryCounterStore> =
        Arc::new(MemoryCounterStore::new());
}
