//! 限流器模块
//!
//! 限流链中每一层的固定窗口限流器。所有层遵循统一契约
//! `(key, limit, window) -> Result<TierVerdict>`：返回错误表示该层不可用，
//! 由决策链继续尝试下一层。

use crate::constants::{DEFAULT_FALLBACK_LIMIT_PERCENT, DEFAULT_RATE_LIMIT_WINDOW_SECS};
use crate::error::{GateError, StorageError};
use crate::memory_counter::{CounterStore, MemoryCounter};
use crate::storage::RateLimitStore;
use chrono::Utc;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

/// 单层限流判定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierVerdict {
    pub allowed: bool,
    /// 被拒绝时距离窗口重置的时间
    pub retry_after: Option<Duration>,
}

impl TierVerdict {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            retry_after: None,
        }
    }

    pub fn deny(retry_after: Duration) -> Self {
        Self {
            allowed: false,
            retry_after: Some(retry_after),
        }
    }
}

/// 窗口限流器 trait
pub trait WindowLimiter: Send + Sync {
    /// 对 `key` 记一次请求并判定
    fn check<'a>(
        &'a self,
        key: &'a str,
        limit: u64,
        window: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<TierVerdict, GateError>> + Send + 'a>>;

    /// 检查是否允许（只返回布尔值）
    fn allow<'a>(
        &'a self,
        key: &'a str,
        limit: u64,
        window: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<bool, GateError>> + Send + 'a>> {
        Box::pin(async move { Ok(self.check(key, limit, window).await?.allowed) })
    }

    /// 清理过期计数
    fn sweep(&self) -> Pin<Box<dyn Future<Output = Result<u64, GateError>> + Send + '_>>;

    /// 限流器名称
    fn name(&self) -> &str;
}

/// 持久层限流器
///
/// 每次调用都包裹超时；超时与其他存储错误一样返回错误，交给下一层处理。
pub struct DurableWindowLimiter {
    store: Arc<dyn RateLimitStore>,
    timeout: Duration,
}

impl DurableWindowLimiter {
    /// 创建持久层限流器
    ///
    /// # 参数
    /// - `store`: 持久层计数存储
    /// - `timeout`: 单次操作超时
    pub fn new(store: Arc<dyn RateLimitStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    fn timeout_error(&self) -> GateError {
        StorageError::TimeoutError(format!("持久层操作超过 {}ms", self.timeout.as_millis())).into()
    }
}

impl WindowLimiter for DurableWindowLimiter {
    fn check<'a>(
        &'a self,
        key: &'a str,
        limit: u64,
        window: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<TierVerdict, GateError>> + Send + 'a>> {
        Box::pin(async move {
            let outcome = tokio::time::timeout(self.timeout, self.store.hit(key, limit, window))
                .await
                .map_err(|_| self.timeout_error())??;

            trace!(
                "持久层判定: key={}, count={}, allowed={}",
                key,
                outcome.count,
                outcome.allowed
            );

            if outcome.allowed {
                Ok(TierVerdict::allow())
            } else {
                Ok(TierVerdict::deny(outcome.retry_after(Utc::now())))
            }
        })
    }

    fn sweep(&self) -> Pin<Box<dyn Future<Output = Result<u64, GateError>> + Send + '_>> {
        Box::pin(async move {
            let removed = tokio::time::timeout(self.timeout, self.store.cleanup_expired())
                .await
                .map_err(|_| self.timeout_error())??;
            Ok(removed)
        })
    }

    fn name(&self) -> &str {
        "durable"
    }
}

/// 内存降级限流器
///
/// 没有跨实例可见性，因此使用更严格的上限：`max(1, limit * percent / 100)`。
pub struct MemoryWindowLimiter {
    store: Arc<dyn CounterStore>,
    limit_percent: u8,
    sweep_window: Duration,
}

impl MemoryWindowLimiter {
    /// 创建内存降级限流器
    ///
    /// # 参数
    /// - `store`: 计数存储
    /// - `limit_percent`: 相对调用方上限的百分比（1-100）
    pub fn new(store: Arc<dyn CounterStore>, limit_percent: u8) -> Self {
        Self {
            store,
            limit_percent: limit_percent.clamp(1, 100),
            sweep_window: Duration::from_secs(DEFAULT_RATE_LIMIT_WINDOW_SECS),
        }
    }

    /// 设置清理时使用的窗口大小
    pub fn with_sweep_window(mut self, window: Duration) -> Self {
        self.sweep_window = window;
        self
    }

    /// 降级层实际生效的上限
    pub fn fallback_limit(&self, limit: u64) -> u64 {
        (limit.saturating_mul(self.limit_percent as u64) / 100).max(1)
    }

    fn evaluate(&self, key: &str, limit: u64, window: Duration) -> TierVerdict {
        let now = Instant::now();
        let effective = self.fallback_limit(limit);

        match self.store.get(key) {
            Some(counter) if !counter.is_expired(now, window) => {
                if counter.count >= effective {
                    return TierVerdict::deny(counter.remaining(now, window));
                }
                self.store.set(
                    key,
                    MemoryCounter {
                        count: counter.count + 1,
                        window_start: counter.window_start,
                    },
                );
                TierVerdict::allow()
            }
            _ => {
                self.store.set(
                    key,
                    MemoryCounter {
                        count: 1,
                        window_start: now,
                    },
                );
                TierVerdict::allow()
            }
        }
    }
}

impl Default for MemoryWindowLimiter {
    fn default() -> Self {
        Self::new(
            crate::memory_counter::GLOBAL_FALLBACK_COUNTERS.clone(),
            DEFAULT_FALLBACK_LIMIT_PERCENT,
        )
    }
}

impl WindowLimiter for MemoryWindowLimiter {
    fn check<'a>(
        &'a self,
        key: &'a str,
        limit: u64,
        window: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<TierVerdict, GateError>> + Send + 'a>> {
        Box::pin(async move { Ok(self.evaluate(key, limit, window)) })
    }

    fn sweep(&self) -> Pin<Box<dyn Future<Output = Result<u64, GateError>> + Send + '_>> {
        Box::pin(async move { Ok(self.store.sweep_expired(self.sweep_window) as u64) })
    }

    fn name(&self) -> &str {
        "memory"
    }
}
