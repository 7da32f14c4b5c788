//! Governor 主控制器
//!
//! 按固定顺序组合请求流水线，第一个失败的阶段直接短路：
//!
//! ```text
//! Received → RateChecked → CsrfChecked → AuthChecked → QuotaChecked → Executed
//!     └──────────────┴─────────────┴─────────────┴──────────→ Rejected
//! ```
//!
//! 限流阶段永不返回错误（故障开放）；配额阶段的存储错误会向上返回。

use crate::config::RateLimitConfig;
use crate::decision_chain::{ChainStats, DecisionChain};
use crate::error::GateError;
use crate::matchers::{CompositeExtractor, Identifier, IdentifierExtractor, RequestContext};
use crate::quota_controller::{DenyReason, Feature, QuotaController};
use crate::storage::UsageCounters;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, trace, warn};

/// 请求所处阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GateStage {
    Received,
    RateChecked,
    CsrfChecked,
    AuthChecked,
    QuotaChecked,
    Executed,
    Rejected,
}

impl GateStage {
    /// 是否为终止状态
    pub fn is_terminal(&self) -> bool {
        matches!(self, GateStage::Executed | GateStage::Rejected)
    }
}

/// 路由要求
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteRequirements {
    /// 是否要求已认证
    pub require_auth: bool,
    /// 受配额控制的功能；设置后隐含要求认证
    pub feature: Option<Feature>,
}

impl RouteRequirements {
    /// 公开路由，只做限流
    pub fn public() -> Self {
        Self::default()
    }

    /// 需要认证的路由
    pub fn authenticated() -> Self {
        Self {
            require_auth: true,
            feature: None,
        }
    }

    /// 受配额控制的功能路由
    pub fn feature(feature: Feature) -> Self {
        Self {
            require_auth: true,
            feature: Some(feature),
        }
    }

    fn needs_user(&self) -> bool {
        self.require_auth || self.feature.is_some()
    }
}

// ============================================================================
// CSRF
// ============================================================================

/// CSRF 校验器
///
/// 只会对会修改状态的方法调用。
pub trait CsrfValidator: Send + Sync {
    fn validate(&self, context: &RequestContext) -> bool;
}

/// 双重提交 Cookie 校验
///
/// 请求头中的令牌必须与 Cookie 中的令牌一致且非空。
#[derive(Debug, Clone)]
pub struct DoubleSubmitCsrf {
    header_name: String,
    cookie_name: String,
}

impl DoubleSubmitCsrf {
    pub fn new(header_name: &str, cookie_name: &str) -> Self {
        Self {
            header_name: header_name.to_lowercase(),
            cookie_name: cookie_name.to_string(),
        }
    }

    fn cookie_token<'a>(&self, context: &'a RequestContext) -> Option<&'a str> {
        context.get_header("cookie").and_then(|cookies| {
            cookies.split(';').find_map(|pair| {
                let (name, value) = pair.trim().split_once('=')?;
                (name == self.cookie_name).then_some(value)
            })
        })
    }
}

impl Default for DoubleSubmitCsrf {
    fn default() -> Self {
        Self::new("x-csrf-token", "csrf_token")
    }
}

impl CsrfValidator for DoubleSubmitCsrf {
    fn validate(&self, context: &RequestContext) -> bool {
        match (context.get_header(&self.header_name), self.cookie_token(context)) {
            (Some(header), Some(cookie)) if !header.is_empty() => {
                constant_time_eq(header.as_bytes(), cookie.as_bytes())
            }
            _ => false,
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// 不做 CSRF 校验（例如纯 API 令牌认证的部署）
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCsrf;

impl CsrfValidator for NoCsrf {
    fn validate(&self, _context: &RequestContext) -> bool {
        true
    }
}

// ============================================================================
// 判定结果
// ============================================================================

/// 拒绝原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// 超出限流
    RateLimited { retry_after_secs: u64 },
    /// CSRF 校验失败
    CsrfFailed,
    /// 需要认证
    Unauthenticated,
    /// 配额拒绝
    Quota(DenyReason),
}

impl Rejection {
    /// HTTP 状态码
    pub fn status(&self) -> u16 {
        match self {
            Rejection::RateLimited { .. } => 429,
            Rejection::CsrfFailed => 403,
            Rejection::Unauthenticated => 401,
            Rejection::Quota(reason) => reason.status(),
        }
    }

    /// 机器可读的原因码
    pub fn code(&self) -> &'static str {
        match self {
            Rejection::RateLimited { .. } => "rate_limited",
            Rejection::CsrfFailed => "csrf_failed",
            Rejection::Unauthenticated => "unauthenticated",
            Rejection::Quota(reason) => reason.code(),
        }
    }

    /// 面向用户的提示
    pub fn message(&self) -> &'static str {
        match self {
            Rejection::RateLimited { .. } => "Too many requests. Please slow down.",
            Rejection::CsrfFailed => "Invalid CSRF token",
            Rejection::Unauthenticated => "Authentication required",
            Rejection::Quota(reason) => reason.message(),
        }
    }

    /// 限流时的重试秒数
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Rejection::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }
}

/// 流水线判定
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// 放行，交给业务逻辑
    Allowed {
        identifier: Identifier,
        stage: GateStage,
    },
    /// 拒绝
    Rejected(Rejection),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }
}

/// Governor 统计信息
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GovernorStats {
    pub total_requests: u64,
    pub allowed: u64,
    pub rate_limited: u64,
    pub csrf_failed: u64,
    pub unauthenticated: u64,
    pub quota_denied: u64,
}

#[derive(Default)]
struct Counters {
    total_requests: AtomicU64,
    allowed: AtomicU64,
    rate_limited: AtomicU64,
    csrf_failed: AtomicU64,
    unauthenticated: AtomicU64,
    quota_denied: AtomicU64,
}

// ============================================================================
// Governor
// ============================================================================

/// Governor 主控制器
pub struct Governor {
    /// 限流配置
    config: RateLimitConfig,
    /// 限流评估器
    decision_chain: Arc<DecisionChain>,
    /// 配额控制器
    quota: Arc<QuotaController>,
    /// CSRF 校验器
    csrf: Arc<dyn CsrfValidator>,
    /// 标识符提取器
    identifier_extractor: CompositeExtractor,
    counters: Counters,
}

impl Governor {
    /// 创建新的 Governor 实例
    pub fn new(
        config: RateLimitConfig,
        decision_chain: Arc<DecisionChain>,
        quota: Arc<QuotaController>,
        csrf: Arc<dyn CsrfValidator>,
    ) -> Result<Self, GateError> {
        config.validate().map_err(GateError::ConfigError)?;

        let identifier_extractor = CompositeExtractor::user_then_ip(&config.forwarded_header);

        info!(
            "Governor 已创建: user_limit={}, ip_limit={}, window={}s, tiers={:?}",
            config.user_limit,
            config.ip_limit,
            config.window_secs,
            decision_chain.node_ids()
        );

        Ok(Self {
            config,
            decision_chain,
            quota,
            csrf,
            identifier_extractor,
            counters: Counters::default(),
        })
    }

    /// 检查请求
    ///
    /// # 返回
    /// - `Ok(Decision::Allowed)`: 所有阶段通过
    /// - `Ok(Decision::Rejected)`: 某个阶段拒绝
    /// - `Err(error)`: 配额存储错误
    #[instrument(skip(self, context), fields(method = %context.method, path = %context.path))]
    pub async fn check(
        &self,
        context: &RequestContext,
        requirements: RouteRequirements,
    ) -> Result<Decision, GateError> {
        self.counters.total_requests.fetch_add(1, Ordering::Relaxed);
        trace!("阶段: {:?}", GateStage::Received);

        let identifier = self
            .identifier_extractor
            .extract(context)
            .unwrap_or_else(|| Identifier::Ip(crate::constants::UNKNOWN_IP.to_string()));

        // 限流
        let limit = if identifier.is_user() {
            self.config.user_limit
        } else {
            self.config.ip_limit
        };
        let verdict = self
            .decision_chain
            .evaluate(&identifier.key(), limit, self.config.window())
            .await;
        if !verdict.allowed {
            self.counters.rate_limited.fetch_add(1, Ordering::Relaxed);
            let retry_after_secs = verdict
                .retry_after
                .map(ceil_secs)
                .unwrap_or(self.config.window_secs);
            debug!("请求被限流: key={}, retry_after={}s", identifier.key(), retry_after_secs);
            return Ok(Decision::Rejected(Rejection::RateLimited { retry_after_secs }));
        }
        trace!("阶段: {:?}", GateStage::RateChecked);

        // CSRF
        if context.is_mutating() && !self.csrf.validate(context) {
            self.counters.csrf_failed.fetch_add(1, Ordering::Relaxed);
            warn!("CSRF 校验失败: key={}", identifier.key());
            return Ok(Decision::Rejected(Rejection::CsrfFailed));
        }
        trace!("阶段: {:?}", GateStage::CsrfChecked);

        // 认证
        let user_id = match &identifier {
            Identifier::User(id) => Some(id.as_str()),
            Identifier::Ip(_) => None,
        };
        if requirements.needs_user() && user_id.is_none() {
            self.counters.unauthenticated.fetch_add(1, Ordering::Relaxed);
            return Ok(Decision::Rejected(Rejection::Unauthenticated));
        }
        trace!("阶段: {:?}", GateStage::AuthChecked);

        // 配额
        if let (Some(feature), Some(user_id)) = (requirements.feature, user_id) {
            let decision = self.quota.check_usage_limit(user_id, feature).await?;
            if let Some(reason) = decision.reason {
                self.counters.quota_denied.fetch_add(1, Ordering::Relaxed);
                return Ok(Decision::Rejected(Rejection::Quota(reason)));
            }
        }

        self.counters.allowed.fetch_add(1, Ordering::Relaxed);
        Ok(Decision::Allowed {
            identifier,
            stage: GateStage::QuotaChecked,
        })
    }

    /// 业务逻辑成功后记录用量
    pub async fn record_success(
        &self,
        user_id: &str,
        feature: Feature,
    ) -> Result<UsageCounters, GateError> {
        self.quota.increment_usage(user_id, feature).await
    }

    /// 启动后台清理任务
    ///
    /// 按固定间隔清理各层的过期计数；单次清理失败只记录警告。
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let chain = Arc::clone(&self.decision_chain);
        let interval = interval.max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // 第一次 tick 立即完成
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = chain.sweep_expired().await;
                if removed > 0 {
                    debug!("清理了 {} 条过期限流记录", removed);
                }
            }
        })
    }

    /// 获取统计信息
    pub fn stats(&self) -> GovernorStats {
        GovernorStats {
            total_requests: self.counters.total_requests.load(Ordering::Relaxed),
            allowed: self.counters.allowed.load(Ordering::Relaxed),
            rate_limited: self.counters.rate_limited.load(Ordering::Relaxed),
            csrf_failed: self.counters.csrf_failed.load(Ordering::Relaxed),
            unauthenticated: self.counters.unauthenticated.load(Ordering::Relaxed),
            quota_denied: self.counters.quota_denied.load(Ordering::Relaxed),
        }
    }

    /// 获取决策链统计
    pub fn decision_chain_stats(&self) -> ChainStats {
        self.decision_chain.stats()
    }

    /// 获取配额控制器
    pub fn quota(&self) -> &Arc<QuotaController> {
        &self.quota
    }

    /// 获取限流配置
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}

fn ceil_secs(d: Duration) -> u64 {
    let secs = d.as_secs() + u64::from(d.subsec_nanos() > 0);
    secs.max(1)
}

// ============================================================================
// 单元测试
// ============================================================================
