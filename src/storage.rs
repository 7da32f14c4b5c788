//! 存储抽象层
//!
//! 定义持久层计数存储（限流窗口）与用量存储（套餐/累计用量）接口及内存实现。
//!
//! 持久层是跨进程共享的事实来源；对同一个键的"读取-判断-写入"必须在一次原子操作内
//! 完成，否则并发请求可能同时看到 `count < limit` 而全部放行。

use crate::error::StorageError;
use crate::quota_controller::{Feature, Plan};
use ahash::AHashMap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// 限流窗口记录（持久层）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitRecord {
    /// `user:<id>` 或 `ip:<address>`
    pub key: String,
    /// 当前窗口内已观察到的请求数
    pub count: u64,
    /// 窗口到期时间，到期后计数归零
    pub reset_time: DateTime<Utc>,
}

impl RateLimitRecord {
    /// 创建新窗口的首条记录
    pub fn first_hit(key: &str, now: DateTime<Utc>, window: Duration) -> Self {
        Self {
            key: key.to_string(),
            count: 1,
            reset_time: now + to_chrono(window),
        }
    }

    /// 记录是否已过期
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.reset_time
    }

    /// 在记录上应用一次请求
    ///
    /// 过期记录先视为 `{count: 0, reset_time: now + window}`；达到上限时不修改记录。
    pub fn apply_hit(&mut self, now: DateTime<Utc>, limit: u64, window: Duration) -> WindowOutcome {
        if self.is_expired(now) {
            self.count = 1;
            self.reset_time = now + to_chrono(window);
            return WindowOutcome::allowed(self);
        }

        if self.count >= limit {
            return WindowOutcome::denied(self);
        }

        self.count += 1;
        WindowOutcome::allowed(self)
    }
}

/// 单次窗口判定结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowOutcome {
    pub allowed: bool,
    pub count: u64,
    pub reset_time: DateTime<Utc>,
}

impl WindowOutcome {
    fn allowed(record: &RateLimitRecord) -> Self {
        Self {
            allowed: true,
            count: record.count,
            reset_time: record.reset_time,
        }
    }

    fn denied(record: &RateLimitRecord) -> Self {
        Self {
            allowed: false,
            count: record.count,
            reset_time: record.reset_time,
        }
    }

    /// 距离窗口重置的剩余时间
    pub fn retry_after(&self, now: DateTime<Utc>) -> Duration {
        (self.reset_time - now).to_std().unwrap_or(Duration::ZERO)
    }
}

pub(crate) fn to_chrono(window: Duration) -> chrono::Duration {
    chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::seconds(60))
}

/// 持久层限流计数存储接口
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// 对 `key` 记一次请求，读取、判断与写入在同一原子操作内完成
    async fn hit(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> Result<WindowOutcome, StorageError>;

    /// 读取记录（不做过期处理）
    async fn get_record(&self, key: &str) -> Result<Option<RateLimitRecord>, StorageError>;

    /// 清理过期记录，返回清理条数
    ///
    /// 仅为回收空间；过期在读取时判断，正确性不依赖清理。
    async fn cleanup_expired(&self) -> Result<u64, StorageError>;
}

/// 用户用量档案
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageProfile {
    pub user_id: String,
    pub plan: Plan,
    /// 累计用量，只增不减
    pub usage_count: u64,
    pub created_at: DateTime<Utc>,
    /// 免费层表示试用结束，付费层表示付费周期结束
    pub expiry_date: Option<DateTime<Utc>>,
}

impl UsageProfile {
    /// 新建免费层档案
    pub fn new_free(user_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.to_string(),
            plan: Plan::Free,
            usage_count: 0,
            created_at: now,
            expiry_date: None,
        }
    }
}

/// 一次用量递增后的计数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageCounters {
    /// 累计用量
    pub usage_count: u64,
    /// 该功能的用量
    pub feature_count: u64,
}

/// 用量存储接口
#[async_trait]
pub trait UsageStore: Send + Sync {
    /// 获取用户档案
    async fn get_profile(&self, user_id: &str) -> Result<Option<UsageProfile>, StorageError>;

    /// 获取用户档案，不存在时以免费层创建
    async fn ensure_profile(&self, user_id: &str) -> Result<UsageProfile, StorageError>;

    /// 降级到免费层并清除到期时间
    ///
    /// 条件写入：只有付费套餐且 `expiry_date <= now` 时才降级，判断与写入在同一原子操作内。
    /// 已是免费层或已续费时不写入，返回 `false`。
    async fn downgrade_plan(&self, user_id: &str, now: DateTime<Utc>)
        -> Result<bool, StorageError>;

    /// 原子地递增累计用量并 upsert 功能计数，要么全部生效要么都不生效
    async fn increment_usage(
        &self,
        user_id: &str,
        feature: Feature,
    ) -> Result<UsageCounters, StorageError>;

    /// 获取某功能的用量
    async fn feature_usage(&self, user_id: &str, feature: Feature) -> Result<u64, StorageError>;

    /// 设置套餐（计费系统回调）
    async fn set_plan(
        &self,
        user_id: &str,
        plan: Plan,
        expiry_date: Option<DateTime<Utc>>,
    ) -> Result<(), StorageError>;
}

#[derive(Default)]
struct UsageTables {
    profiles: AHashMap<String, UsageProfile>,
    features: AHashMap<(String, Feature), u64>,
}

/// 内存存储实现
///
/// 限流窗口使用 DashMap 的 entry 锁保证单键原子性；用量表由一把互斥锁保护，
/// 两个计数在同一临界区内提交。
pub struct MemoryStorage {
    windows: DashMap<String, RateLimitRecord>,
    usage: Mutex<UsageTables>,
    fail_next_write: AtomicBool,
}

impl MemoryStorage {
    /// 创建新的内存存储
    pub fn new() -> Self {
        Self {
            windows: DashMap::new(),
            usage: Mutex::new(UsageTables::default()),
            fail_next_write: AtomicBool::new(false),
        }
    }

    /// 写入或覆盖用户档案
    pub fn insert_profile(&self, profile: UsageProfile) {
        self.usage
            .lock()
            .profiles
            .insert(profile.user_id.clone(), profile);
    }

    /// 手动触发故障（用于测试）
    ///
    /// 下一次 `increment_usage` 会在累计用量算出之后、任何写入之前失败。
    pub fn inject_write_failure(&self) {
        warn!("注入用量写入故障");
        self.fail_next_write.store(true, Ordering::SeqCst);
    }

    /// 当前窗口记录条数
    pub fn window_count(&self) -> usize {
        self.windows.len()
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateLimitStore for MemoryStorage {
    async fn hit(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> Result<WindowOutcome, StorageError> {
        let now = Utc::now();

        // entry 持有分片写锁，读取-判断-写入对同一个键是原子的
        let outcome = match self.windows.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => occupied.get_mut().apply_hit(now, limit, window),
            Entry::Vacant(vacant) => {
                let record = RateLimitRecord::first_hit(key, now, window);
                let outcome = WindowOutcome::allowed(&record);
                vacant.insert(record);
                outcome
            }
        };

        Ok(outcome)
    }

    async fn get_record(&self, key: &str) -> Result<Option<RateLimitRecord>, StorageError> {
        Ok(self.windows.get(key).map(|r| r.clone()))
    }

    async fn cleanup_expired(&self) -> Result<u64, StorageError> {
        let now = Utc::now();
        let before = self.windows.len();
        self.windows.retain(|_, record| !record.is_expired(now));
        let removed = before.saturating_sub(self.windows.len()) as u64;
        if removed > 0 {
            debug!("清理了 {} 条过期的限流记录", removed);
        }
        Ok(removed)
    }
}

#[async_trait]
impl UsageStore for MemoryStorage {
    async fn get_profile(&self, user_id: &str) -> Result<Option<UsageProfile>, StorageError> {
        Ok(self.usage.lock().profiles.get(user_id).cloned())
    }

    async fn ensure_profile(&self, user_id: &str) -> Result<UsageProfile, StorageError> {
        let mut tables = self.usage.lock();
        let profile = tables
            .profiles
            .entry(user_id.to_string())
            .or_insert_with(|| UsageProfile::new_free(user_id, Utc::now()));
        Ok(profile.clone())
    }

    async fn downgrade_plan(&self, user_id: &str, now: DateTime<Utc>) -> Result<bool, StorageError> {
        let mut tables = self.usage.lock();
        let profile = tables
            .profiles
            .get_mut(user_id)
            .ok_or_else(|| StorageError::NotFound(format!("用户档案: {}", user_id)))?;

        // 锁内重新判断，读取之后续费的档案不能被覆盖
        let expired = matches!(profile.expiry_date, Some(expiry) if expiry <= now);
        if !profile.plan.is_paid() || !expired {
            return Ok(false);
        }

        profile.plan = Plan::Free;
        profile.expiry_date = None;
        Ok(true)
    }

    async fn increment_usage(
        &self,
        user_id: &str,
        feature: Feature,
    ) -> Result<UsageCounters, StorageError> {
        let mut tables = self.usage.lock();

        let usage_count = tables
            .profiles
            .get(user_id)
            .map(|p| p.usage_count + 1)
            .ok_or_else(|| StorageError::NotFound(format!("用户档案: {}", user_id)))?;
        let feature_key = (user_id.to_string(), feature);
        let feature_count = tables.features.get(&feature_key).copied().unwrap_or(0) + 1;

        if self.fail_next_write.swap(false, Ordering::SeqCst) {
            return Err(StorageError::QueryError("用量写入失败".to_string()));
        }

        tables.features.insert(feature_key, feature_count);
        if let Some(profile) = tables.profiles.get_mut(user_id) {
            profile.usage_count = usage_count;
        }

        Ok(UsageCounters {
            usage_count,
            feature_count,
        })
    }

    async fn feature_usage(&self, user_id: &str, feature: Feature) -> Result<u64, StorageError> {
        Ok(self
            .usage
            .lock()
            .features
            .get(&(user_id.to_string(), feature))
            .copied()
            .unwrap_or(0))
    }

    async fn set_plan(
        &self,
        user_id: &str,
        plan: Plan,
        expiry_date: Option<DateTime<Utc>>,
    ) -> Result<(), StorageError> {
        let mut tables = self.usage.lock();
        let profile = tables
            .profiles
            .get_mut(user_id)
            .ok_or_else(|| StorageError::NotFound(format!("用户档案: {}", user_id)))?;
        profile.plan = plan;
        profile.expiry_date = expiry_date;
        Ok(())
    }
}

/// 不可达存储
///
/// 所有操作都返回连接错误，模拟持久层不可用。
pub struct UnavailableStorage;

impl UnavailableStorage {
    fn unreachable<T>() -> Result<T, StorageError> {
        Err(StorageError::ConnectionError("存储不可达".to_string()))
    }
}

#[async_trait]
impl RateLimitStore for UnavailableStorage {
    async fn hit(
        &self,
        _key: &str,
        _limit: u64,
        _window: Duration,
    ) -> Result<WindowOutcome, StorageError> {
        Self::unreachable()
    }

    async fn get_record(&self, _key: &str) -> Result<Option<RateLimitRecord>, StorageError> {
        Self::unreachable()
    }

    async fn cleanup_expired(&self) -> Result<u64, StorageError> {
        Self::unreachable()
    }
}

#[async_trait]
impl UsageStore for UnavailableStorage {
    async fn get_profile(&self, _user_id: &str) -> Result<Option<UsageProfile>, StorageError> {
        Self::unreachable()
    }

    async fn ensure_profile(&self, _user_id: &str) -> Result<UsageProfile, StorageError> {
        Self::unreachable()
    }

    async fn downgrade_plan(
        &self,
        _user_id: &str,
        _now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        Self::unreachable()
    }

    async fn increment_usage(
        &self,
        _user_id: &str,
        _feature: Feature,
    ) -> Result<UsageCounters, StorageError> {
        Self::unreachable()
    }

    async fn feature_usage(&self, _user_id: &str, _feature: Feature) -> Result<u64, StorageError> {
        Self::unreachable()
    }

    async fn set_plan(
        &self,
        _user_id: &str,
        _plan: Plan,
        _expiry_date: Option<DateTime<Utc>>,
    ) -> Result<(), StorageError> {
        Self::unreachable()
    }
}
