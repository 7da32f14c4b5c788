//! PostgreSQL存储实现
//!
//! 使用sqlx实现持久层，限流窗口与用量计数都在单个事务内完成"读取-判断-写入"。
//!
//! # 数据库Schema
//!
//! ```sql
//! -- 限流窗口表（所有实例共享）
//! CREATE TABLE IF NOT EXISTS rate_limits (
//!     key TEXT PRIMARY KEY,
//!     count BIGINT NOT NULL,
//!     reset_time TIMESTAMPTZ NOT NULL
//! );
//!
//! CREATE INDEX IF NOT EXISTS idx_rate_limits_reset ON rate_limits(reset_time);
//!
//! -- 用户用量档案
//! CREATE TABLE IF NOT EXISTS usage_profiles (
//!     user_id TEXT PRIMARY KEY,
//!     plan TEXT NOT NULL DEFAULT 'free',
//!     usage_count BIGINT NOT NULL DEFAULT 0,
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
//!     expiry_date TIMESTAMPTZ
//! );
//!
//! -- 按功能统计的用量
//! CREATE TABLE IF NOT EXISTS feature_usage (
//!     user_id TEXT NOT NULL REFERENCES usage_profiles(user_id) ON DELETE CASCADE,
//!     feature TEXT NOT NULL,
//!     count BIGINT NOT NULL DEFAULT 0,
//!     last_used TIMESTAMPTZ NOT NULL DEFAULT now(),
//!     PRIMARY KEY (user_id, feature)
//! );
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, Secret};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::config::StorageConfig;
use crate::error::StorageError;
use crate::quota_controller::{Feature, Plan};
use crate::storage::{
    RateLimitRecord, RateLimitStore, UsageCounters, UsageProfile, UsageStore, WindowOutcome,
};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS rate_limits (
        key TEXT PRIMARY KEY,
        count BIGINT NOT NULL,
        reset_time TIMESTAMPTZ NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_rate_limits_reset ON rate_limits(reset_time)",
    "CREATE TABLE IF NOT EXISTS usage_profiles (
        user_id TEXT PRIMARY KEY,
        plan TEXT NOT NULL DEFAULT 'free',
        usage_count BIGINT NOT NULL DEFAULT 0,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        expiry_date TIMESTAMPTZ
    )",
    "CREATE TABLE IF NOT EXISTS feature_usage (
        user_id TEXT NOT NULL REFERENCES usage_profiles(user_id) ON DELETE CASCADE,
        feature TEXT NOT NULL,
        count BIGINT NOT NULL DEFAULT 0,
        last_used TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (user_id, feature)
    )",
];

/// PostgreSQL存储配置
#[derive(Clone)]
pub struct PostgresStorageConfig {
    /// 数据库连接URL（使用 Secret 包装以防止意外泄露）
    pub database_url: Secret<String>,
    /// 连接池最大连接数
    pub max_connections: u32,
    /// 连接池最小空闲连接数
    pub min_connections: u32,
    /// 连接超时时间（秒）
    pub connect_timeout: u64,
    /// 查询超时时间（毫秒）
    pub query_timeout_ms: u64,
}

impl std::fmt::Debug for PostgresStorageConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStorageConfig")
            .field("database_url", &"***")
            .field("max_connections", &self.max_connections)
            .field("min_connections", &self.min_connections)
            .field("connect_timeout", &self.connect_timeout)
            .field("query_timeout_ms", &self.query_timeout_ms)
            .finish()
    }
}

impl Default for PostgresStorageConfig {
    fn default() -> Self {
        Self {
            database_url: Secret::new(String::new()),
            max_connections: crate::constants::DEFAULT_MAX_CONNECTIONS,
            min_connections: 1,
            connect_timeout: crate::constants::DEFAULT_CONNECT_TIMEOUT_SECS,
            query_timeout_ms: crate::constants::DEFAULT_DURABLE_TIMEOUT_MS,
        }
    }
}

impl PostgresStorageConfig {
    /// 创建新的配置
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: Secret::new(database_url.into()),
            ..Default::default()
        }
    }

    /// 从网关存储配置创建，未配置连接串时返回 `None`
    pub fn from_storage_config(config: &StorageConfig) -> Option<Self> {
        config.database_url.as_ref().map(|url| Self {
            database_url: url.clone(),
            max_connections: config.max_connections,
            connect_timeout: config.connect_timeout_secs,
            ..Default::default()
        })
    }

    /// 设置最大连接数
    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// 设置连接超时
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout.as_secs();
        self
    }

    /// 设置查询超时
    pub fn query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout_ms = timeout.as_millis() as u64;
        self
    }
}

/// PostgreSQL存储实现
#[derive(Clone)]
pub struct PostgresStorage {
    pool: PgPool,
    query_timeout: Duration,
}

impl PostgresStorage {
    /// 创建新的PostgreSQL存储实例
    ///
    /// # 错误
    ///
    /// 无法连接到数据库时返回连接错误
    pub async fn new(config: PostgresStorageConfig) -> Result<Self, StorageError> {
        info!("正在连接PostgreSQL数据库...");

        let pool = Self::pool_options(&config)
            .connect(config.database_url.expose_secret())
            .await
            .map_err(|e| {
                error!("数据库连接失败: {}", e);
                StorageError::ConnectionError(format!("无法连接到数据库: {}", e))
            })?;

        info!("成功连接到PostgreSQL数据库");

        Ok(Self {
            pool,
            query_timeout: Duration::from_millis(config.query_timeout_ms),
        })
    }

    /// 创建延迟连接的存储实例
    ///
    /// 启动时不连接数据库；首次查询时才建立连接。数据库暂时不可达时每次调用各自失败，
    /// 限流链按次降级，恢复后自动重新使用持久层。
    ///
    /// # 错误
    ///
    /// 连接URL无法解析时返回连接错误
    pub fn connect_lazy(config: PostgresStorageConfig) -> Result<Self, StorageError> {
        let pool = Self::pool_options(&config)
            .connect_lazy(config.database_url.expose_secret())
            .map_err(|e| StorageError::ConnectionError(format!("数据库URL无效: {}", e)))?;

        info!("已创建PostgreSQL延迟连接池");

        Ok(Self {
            pool,
            query_timeout: Duration::from_millis(config.query_timeout_ms),
        })
    }

    fn pool_options(config: &PostgresStorageConfig) -> PgPoolOptions {
        PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
    }

    /// 从连接池创建存储实例
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            query_timeout: Duration::from_millis(crate::constants::DEFAULT_DURABLE_TIMEOUT_MS),
        }
    }

    /// 建表（幂等）
    pub async fn ensure_schema(&self) -> Result<(), StorageError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("数据库表结构已就绪");
        Ok(())
    }

    /// 检查数据库连接
    pub async fn ping(&self) -> Result<(), StorageError> {
        self.timed(async {
            sqlx::query("SELECT 1")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| StorageError::ConnectionError(format!("Ping失败: {}", e)))?;
            Ok::<_, StorageError>(())
        })
        .await
    }

    /// 获取连接池引用
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn begin_transaction(&self) -> Result<Transaction<'_, Postgres>, StorageError> {
        self.pool
            .begin()
            .await
            .map_err(|e| StorageError::ConnectionError(format!("无法开始事务: {}", e)))
    }

    /// 为单次操作加上查询超时
    async fn timed<T, F>(&self, fut: F) -> Result<T, StorageError>
    where
        F: Future<Output = Result<T, StorageError>>,
    {
        tokio::time::timeout(self.query_timeout, fut)
            .await
            .map_err(|_| {
                StorageError::TimeoutError(format!(
                    "查询超过 {}ms",
                    self.query_timeout.as_millis()
                ))
            })?
    }

    async fn hit_in_tx(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> Result<WindowOutcome, StorageError> {
        let now = Utc::now();
        let mut tx = self.begin_transaction().await?;

        // 占位行的 reset_time 为 now，随后按过期记录处理
        sqlx::query(
            "INSERT INTO rate_limits (key, count, reset_time) VALUES ($1, 0, $2)
             ON CONFLICT (key) DO NOTHING",
        )
        .bind(key)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let (count, reset_time) = sqlx::query_as::<_, (i64, DateTime<Utc>)>(
            "SELECT count, reset_time FROM rate_limits WHERE key = $1 FOR UPDATE",
        )
        .bind(key)
        .fetch_one(&mut *tx)
        .await?;

        let mut record = RateLimitRecord {
            key: key.to_string(),
            count: count.max(0) as u64,
            reset_time,
        };
        let outcome = record.apply_hit(now, limit, window);

        if outcome.allowed {
            sqlx::query("UPDATE rate_limits SET count = $2, reset_time = $3 WHERE key = $1")
                .bind(key)
                .bind(record.count as i64)
                .bind(record.reset_time)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(outcome)
    }

    async fn increment_in_tx(
        &self,
        user_id: &str,
        feature: Feature,
    ) -> Result<UsageCounters, StorageError> {
        let mut tx = self.begin_transaction().await?;

        let usage_count = sqlx::query_as::<_, (i64,)>(
            "UPDATE usage_profiles SET usage_count = usage_count + 1
             WHERE user_id = $1 RETURNING usage_count",
        )
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StorageError::NotFound(format!("用户档案: {}", user_id)))?
        .0;

        let feature_count = sqlx::query_as::<_, (i64,)>(
            "INSERT INTO feature_usage (user_id, feature, count, last_used)
             VALUES ($1, $2, 1, now())
             ON CONFLICT (user_id, feature)
             DO UPDATE SET count = feature_usage.count + 1, last_used = now()
             RETURNING count",
        )
        .bind(user_id)
        .bind(feature.as_str())
        .fetch_one(&mut *tx)
        .await?
        .0;

        tx.commit().await?;

        Ok(UsageCounters {
            usage_count: usage_count as u64,
            feature_count: feature_count as u64,
        })
    }
}

type ProfileRow = (String, String, i64, DateTime<Utc>, Option<DateTime<Utc>>);

fn profile_from_row(row: ProfileRow) -> Result<UsageProfile, StorageError> {
    let (user_id, plan, usage_count, created_at, expiry_date) = row;
    let plan = Plan::parse(&plan)
        .ok_or_else(|| StorageError::QueryError(format!("未知套餐: {}", plan)))?;
    Ok(UsageProfile {
        user_id,
        plan,
        usage_count: usage_count.max(0) as u64,
        created_at,
        expiry_date,
    })
}

const SELECT_PROFILE: &str = "SELECT user_id, plan, usage_count, created_at, expiry_date
     FROM usage_profiles WHERE user_id = $1";

#[async_trait]
impl RateLimitStore for PostgresStorage {
    async fn hit(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> Result<WindowOutcome, StorageError> {
        self.timed(self.hit_in_tx(key, limit, window)).await
    }

    async fn get_record(&self, key: &str) -> Result<Option<RateLimitRecord>, StorageError> {
        self.timed(async {
            let row = sqlx::query_as::<_, (i64, DateTime<Utc>)>(
                "SELECT count, reset_time FROM rate_limits WHERE key = $1",
            )
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

            Ok::<_, StorageError>(row.map(|(count, reset_time)| RateLimitRecord {
                key: key.to_string(),
                count: count.max(0) as u64,
                reset_time,
            }))
        })
        .await
    }

    async fn cleanup_expired(&self) -> Result<u64, StorageError> {
        self.timed(async {
            let result = sqlx::query("DELETE FROM rate_limits WHERE reset_time <= now()")
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::QueryError(format!("清理过期记录失败: {}", e)))?;
            debug!("清理了 {} 条过期的限流记录", result.rows_affected());
            Ok::<_, StorageError>(result.rows_affected())
        })
        .await
    }
}

#[async_trait]
impl UsageStore for PostgresStorage {
    async fn get_profile(&self, user_id: &str) -> Result<Option<UsageProfile>, StorageError> {
        self.timed(async {
            sqlx::query_as::<_, ProfileRow>(SELECT_PROFILE)
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?
                .map(profile_from_row)
                .transpose()
        })
        .await
    }

    async fn ensure_profile(&self, user_id: &str) -> Result<UsageProfile, StorageError> {
        self.timed(async {
            sqlx::query(
                "INSERT INTO usage_profiles (user_id, plan) VALUES ($1, 'free')
                 ON CONFLICT (user_id) DO NOTHING",
            )
            .bind(user_id)
            .execute(&self.pool)
            .await?;

            let row = sqlx::query_as::<_, ProfileRow>(SELECT_PROFILE)
                .bind(user_id)
                .fetch_one(&self.pool)
                .await?;
            profile_from_row(row)
        })
        .await
    }

    async fn downgrade_plan(&self, user_id: &str, now: DateTime<Utc>) -> Result<bool, StorageError> {
        self.timed(async {
            // 到期条件写在 WHERE 中，并发续费后这条语句不会命中
            let result = sqlx::query(
                "UPDATE usage_profiles SET plan = 'free', expiry_date = NULL
                 WHERE user_id = $1 AND plan <> 'free'
                   AND expiry_date IS NOT NULL AND expiry_date <= $2",
            )
            .bind(user_id)
            .bind(now)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() > 0 {
                return Ok(true);
            }

            let (exists,) = sqlx::query_as::<_, (bool,)>(
                "SELECT EXISTS (SELECT 1 FROM usage_profiles WHERE user_id = $1)",
            )
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;

            if exists {
                Ok(false)
            } else {
                Err(StorageError::NotFound(format!("用户档案: {}", user_id)))
            }
        })
        .await
    }

    async fn increment_usage(
        &self,
        user_id: &str,
        feature: Feature,
    ) -> Result<UsageCounters, StorageError> {
        self.timed(self.increment_in_tx(user_id, feature)).await
    }

    async fn feature_usage(&self, user_id: &str, feature: Feature) -> Result<u64, StorageError> {
        self.timed(async {
            let row = sqlx::query_as::<_, (i64,)>(
                "SELECT count FROM feature_usage WHERE user_id = $1 AND feature = $2",
            )
            .bind(user_id)
            .bind(feature.as_str())
            .fetch_optional(&self.pool)
            .await?;
            Ok::<_, StorageError>(row.map(|(c,)| c.max(0) as u64).unwrap_or(0))
        })
        .await
    }

    async fn set_plan(
        &self,
        user_id: &str,
        plan: Plan,
        expiry_date: Option<DateTime<Utc>>,
    ) -> Result<(), StorageError> {
        self.timed(async {
            let result = sqlx::query(
                "UPDATE usage_profiles SET plan = $2, expiry_date = $3 WHERE user_id = $1",
            )
            .bind(user_id)
            .bind(plan.as_str())
            .bind(expiry_date)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 0 {
                return Err(StorageError::NotFound(format!("用户档案: {}", user_id)));
            }
            Ok(())
        })
        .await
    }
}
