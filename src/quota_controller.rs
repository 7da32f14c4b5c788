//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 配额控制器模块
//!
//! 按订阅套餐、试用期和累计用量判定用户能否使用某项功能。
//! 与短窗口限流不同，这条路径不做故障开放：存储错误会直接返回给调用方。

use crate::config::QuotaConfig;
use crate::error::GateError;
use crate::storage::{UsageCounters, UsageProfile, UsageStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// 订阅套餐
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    /// 免费层（基础层）
    Free,
    /// 专业版
    Pro,
    /// 企业版
    Enterprise,
}

impl Plan {
    /// 从字符串解析套餐
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "free" => Some(Plan::Free),
            "pro" => Some(Plan::Pro),
            "enterprise" => Some(Plan::Enterprise),
            _ => None,
        }
    }

    /// 转换为字符串
    pub fn as_str(&self) -> &'static str {
        match self {
            Plan::Free => "free",
            Plan::Pro => "pro",
            Plan::Enterprise => "enterprise",
        }
    }

    /// 是否为付费套餐
    pub fn is_paid(&self) -> bool {
        !matches!(self, Plan::Free)
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 受配额控制的功能
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Feature {
    AiAssistant,
    DocGenerator,
    Crm,
    Research,
    CaseTracker,
    News,
    Analytics,
}

impl Feature {
    /// 全部功能
    pub const ALL: [Feature; 7] = [
        Feature::AiAssistant,
        Feature::DocGenerator,
        Feature::Crm,
        Feature::Research,
        Feature::CaseTracker,
        Feature::News,
        Feature::Analytics,
    ];

    /// 从字符串解析功能（大小写不敏感）
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "AI_ASSISTANT" => Some(Feature::AiAssistant),
            "DOC_GENERATOR" => Some(Feature::DocGenerator),
            "CRM" => Some(Feature::Crm),
            "RESEARCH" => Some(Feature::Research),
            "CASE_TRACKER" => Some(Feature::CaseTracker),
            "NEWS" => Some(Feature::News),
            "ANALYTICS" => Some(Feature::Analytics),
            _ => None,
        }
    }

    /// 转换为字符串
    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::AiAssistant => "AI_ASSISTANT",
            Feature::DocGenerator => "DOC_GENERATOR",
            Feature::Crm => "CRM",
            Feature::Research => "RESEARCH",
            Feature::CaseTracker => "CASE_TRACKER",
            Feature::News => "NEWS",
            Feature::Analytics => "ANALYTICS",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 套餐是否包含某功能
pub fn plan_allows(plan: Plan, feature: Feature) -> bool {
    match plan {
        Plan::Free => matches!(
            feature,
            Feature::AiAssistant | Feature::DocGenerator | Feature::Research | Feature::News
        ),
        Plan::Pro => !matches!(feature, Feature::Analytics),
        Plan::Enterprise => true,
    }
}

/// 拒绝原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    /// 用户档案不存在
    UserNotFound,
    /// 免费试用已结束
    TrialExpired,
    /// 免费层查询次数已用完
    QueryLimit,
    /// 当前套餐不包含该功能
    FeatureNotInPlan,
}

impl DenyReason {
    /// 机器可读的原因码
    pub fn code(&self) -> &'static str {
        match self {
            DenyReason::UserNotFound => "user_not_found",
            DenyReason::TrialExpired => "trial_expired",
            DenyReason::QueryLimit => "query_limit",
            DenyReason::FeatureNotInPlan => "feature_not_in_plan",
        }
    }

    /// 面向用户的提示
    pub fn message(&self) -> &'static str {
        match self {
            DenyReason::UserNotFound => "User profile not found",
            DenyReason::TrialExpired => {
                "Your free trial has ended. Upgrade your plan to keep using this feature."
            }
            DenyReason::QueryLimit => {
                "You have used all free queries. Upgrade your plan to continue."
            }
            DenyReason::FeatureNotInPlan => "This feature is not included in your current plan.",
        }
    }

    /// 对应的 HTTP 状态码
    ///
    /// 需要付费才能解决的原因返回 402，其余返回 403。
    pub fn status(&self) -> u16 {
        match self {
            DenyReason::TrialExpired | DenyReason::QueryLimit => 402,
            DenyReason::UserNotFound | DenyReason::FeatureNotInPlan => 403,
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// 配额判定结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<DenyReason>,
    /// 免费层剩余查询次数；付费层为 `None`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<u64>,
}

impl QuotaDecision {
    pub fn allow(remaining: Option<u64>) -> Self {
        Self {
            allowed: true,
            reason: None,
            remaining,
        }
    }

    pub fn deny(reason: DenyReason) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            remaining: None,
        }
    }
}

/// 套餐对账结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconciled {
    /// 本次判定实际生效的套餐
    pub effective_plan: Plan,
    /// 是否需要持久化降级
    pub mutated: bool,
}

/// 对账：付费套餐到期后视为免费层
///
/// 纯函数，不做任何写入；`mutated == true` 时由调用方负责持久化降级。
/// 付费套餐没有到期时间表示长期有效。
pub fn reconcile(profile: &UsageProfile, now: DateTime<Utc>) -> Reconciled {
    match profile.expiry_date {
        Some(expiry) if profile.plan.is_paid() && expiry <= now => Reconciled {
            effective_plan: Plan::Free,
            mutated: true,
        },
        _ => Reconciled {
            effective_plan: profile.plan,
            mutated: false,
        },
    }
}

/// 配额控制器
pub struct QuotaController {
    store: Arc<dyn UsageStore>,
    config: QuotaConfig,
}

impl QuotaController {
    /// 创建新的配额控制器
    ///
    /// # 示例
    /// ```rust
    /// use lexgate::config::QuotaConfig;
    /// use lexgate::quota_controller::QuotaController;
    /// use lexgate::storage::MemoryStorage;
    /// use std::sync::Arc;
    ///
    /// let controller = QuotaController::new(Arc::new(MemoryStorage::new()), QuotaConfig::default());
    /// assert_eq!(controller.config().free_query_limit, 10);
    /// ```
    pub fn new(store: Arc<dyn UsageStore>, config: QuotaConfig) -> Self {
        Self { store, config }
    }

    /// 检查用户能否使用功能
    ///
    /// # 返回
    /// - `Ok(decision)`: 判定结果，拒绝时带原因
    /// - `Err(error)`: 存储错误
    pub async fn check_usage_limit(
        &self,
        user_id: &str,
        feature: Feature,
    ) -> Result<QuotaDecision, GateError> {
        self.check_usage_limit_at(user_id, feature, Utc::now()).await
    }

    /// 以指定时间检查用户能否使用功能
    pub async fn check_usage_limit_at(
        &self,
        user_id: &str,
        feature: Feature,
        now: DateTime<Utc>,
    ) -> Result<QuotaDecision, GateError> {
        let Some(profile) = self.store.get_profile(user_id).await? else {
            info!("配额拒绝: user={}, reason=user_not_found", user_id);
            return Ok(QuotaDecision::deny(DenyReason::UserNotFound));
        };

        let mut profile = profile;
        let mut reconciled = reconcile(&profile, now);
        if reconciled.mutated {
            if self.store.downgrade_plan(user_id, now).await? {
                info!(
                    "付费套餐已到期，降级为免费层: user={}, plan={}",
                    user_id, profile.plan
                );
            } else {
                // 读取之后档案已被修改（续费或并发降级），以最新档案为准
                let Some(fresh) = self.store.get_profile(user_id).await? else {
                    return Ok(QuotaDecision::deny(DenyReason::UserNotFound));
                };
                debug!("降级条件不再成立，重新读取档案: user={}, plan={}", user_id, fresh.plan);
                reconciled = reconcile(&fresh, now);
                profile = fresh;
            }
        }

        let decision = self.evaluate(&profile, reconciled.effective_plan, feature, now);
        match decision.reason {
            Some(reason) => info!(
                "配额拒绝: user={}, feature={}, reason={}",
                user_id, feature, reason
            ),
            None => debug!(
                "配额放行: user={}, feature={}, remaining={:?}",
                user_id, feature, decision.remaining
            ),
        }
        Ok(decision)
    }

    fn evaluate(
        &self,
        profile: &UsageProfile,
        plan: Plan,
        feature: Feature,
        now: DateTime<Utc>,
    ) -> QuotaDecision {
        if !plan_allows(plan, feature) {
            return QuotaDecision::deny(DenyReason::FeatureNotInPlan);
        }

        if plan.is_paid() {
            return QuotaDecision::allow(None);
        }

        let days_since_creation = (now - profile.created_at).num_days();
        if days_since_creation > self.config.trial_days {
            return QuotaDecision::deny(DenyReason::TrialExpired);
        }

        if profile.usage_count >= self.config.free_query_limit {
            return QuotaDecision::deny(DenyReason::QueryLimit);
        }

        QuotaDecision::allow(Some(
            self.config.free_query_limit - profile.usage_count,
        ))
    }

    /// 记录一次成功使用
    ///
    /// 累计用量与功能计数在一次存储调用中原子提交。
    pub async fn increment_usage(
        &self,
        user_id: &str,
        feature: Feature,
    ) -> Result<UsageCounters, GateError> {
        let counters = self.store.increment_usage(user_id, feature).await?;
        debug!(
            "用量已记录: user={}, feature={}, usage_count={}, feature_count={}",
            user_id, feature, counters.usage_count, counters.feature_count
        );
        Ok(counters)
    }

    /// 获取配置
    pub fn config(&self) -> &QuotaConfig {
        &self.config
    }

    /// 获取底层存储
    pub fn store(&self) -> &Arc<dyn UsageStore> {
        &self.store
    }
}
