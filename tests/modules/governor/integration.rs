//! Governor 集成测试
//!
//! 阶段顺序、配额与限流的交互、持久层故障下的请求流程。

use crate::common::*;
use lexgate::config::RateLimitConfig;
use lexgate::governor::{Decision, GateStage, Rejection, RouteRequirements};
use lexgate::matchers::{Identifier, RequestContext};
use lexgate::quota_controller::{DenyReason, Feature, Plan};
use lexgate::storage::{MemoryStorage, UnavailableStorage, UsageStore};
use std::sync::Arc;

fn user_ctx(user: &str) -> RequestContext {
    RequestContext::new()
        .with_method("GET")
        .with_path("/api/research")
        .with_user(user)
}

/// 被限流的请求不会走到配额阶段，也不会消耗用量
#[tokio::test]
async fn test_rate_limited_requests_never_touch_quota() {
    let usage = create_memory_storage();
    usage.insert_profile(profile("u1", Plan::Free, 0, 0));
    let config = RateLimitConfig {
        user_limit: 2,
        ..Default::default()
    };
    let governor = create_test_governor(config, create_memory_storage(), usage.clone());
    let route = RouteRequirements::feature(Feature::Research);

    for _ in 0..2 {
        assert!(governor.check(&user_ctx("u1"), route).await.unwrap().is_allowed());
    }
    assert!(matches!(
        governor.check(&user_ctx("u1"), route).await.unwrap(),
        Decision::Rejected(Rejection::RateLimited { .. })
    ));

    let stats = governor.stats();
    assert_eq!(stats.total_requests, 3);
    assert_eq!(stats.allowed, 2);
    assert_eq!(stats.rate_limited, 1);
    assert_eq!(stats.quota_denied, 0);
    assert_eq!(usage.get_profile("u1").await.unwrap().unwrap().usage_count, 0);
}

/// 持久层完全不可用时请求仍然被处理，先按降级上限判定
#[tokio::test]
async fn test_outage_uses_fallback_limit() {
    let usage = create_memory_storage();
    let config = RateLimitConfig {
        ip_limit: 6,
        ..Default::default()
    };
    let governor = create_test_governor(config, Arc::new(UnavailableStorage), usage);
    let ctx = RequestContext::new()
        .with_method("GET")
        .with_client_ip(&format!("198.51.100.{}", std::process::id() % 250));

    let mut allowed = 0;
    for _ in 0..6 {
        if governor
            .check(&ctx, RouteRequirements::public())
            .await
            .unwrap()
            .is_allowed()
        {
            allowed += 1;
        }
    }
    assert_eq!(allowed, 3);

    let chain_stats = governor.decision_chain_stats();
    assert_eq!(chain_stats.tier_failures, 6);
    assert_eq!(chain_stats.fail_open_count, 0);
}

/// 用户请求优先使用用户标识，而不是转发头中的 IP
#[tokio::test]
async fn test_identifier_prefers_user_over_forwarded_ip() {
    let governor = create_test_governor(
        RateLimitConfig::default(),
        create_memory_storage(),
        create_memory_storage(),
    );
    let ctx = RequestContext::new()
        .with_method("GET")
        .with_header("x-forwarded-for", "203.0.113.9, 10.0.0.1")
        .with_user("lawyer-7");

    assert_eq!(
        governor
            .check(&ctx, RouteRequirements::authenticated())
            .await
            .unwrap(),
        Decision::Allowed {
            identifier: Identifier::User("lawyer-7".to_string()),
            stage: GateStage::QuotaChecked,
        }
    );
}

/// 用户与 IP 使用各自的上限，互不消耗
#[tokio::test]
async fn test_user_and_ip_budgets_are_separate() {
    let config = RateLimitConfig {
        user_limit: 1,
        ip_limit: 1,
        ..Default::default()
    };
    let governor = create_test_governor(config, create_memory_storage(), create_memory_storage());
    let ip = "192.0.2.77";

    let anonymous = RequestContext::new().with_method("GET").with_client_ip(ip);
    let signed_in = RequestContext::new()
        .with_method("GET")
        .with_client_ip(ip)
        .with_user("same-desk");

    assert!(governor
        .check(&anonymous, RouteRequirements::public())
        .await
        .unwrap()
        .is_allowed());
    assert!(governor
        .check(&signed_in, RouteRequirements::public())
        .await
        .unwrap()
        .is_allowed());
    assert!(!governor
        .check(&anonymous, RouteRequirements::public())
        .await
        .unwrap()
        .is_allowed());
}

/// 配额存储错误向上传播，由调用方决定响应
#[tokio::test]
async fn test_quota_storage_error_is_surfaced() {
    let governor = {
        use lexgate::config::QuotaConfig;
        use lexgate::governor::{Governor, NoCsrf};
        use lexgate::quota_controller::QuotaController;

        let quota = QuotaController::new(Arc::new(UnavailableStorage), QuotaConfig::default());
        Governor::new(
            RateLimitConfig::default(),
            Arc::new(create_chain(Arc::new(MemoryStorage::new()))),
            Arc::new(quota),
            Arc::new(NoCsrf),
        )
        .unwrap()
    };

    let result = governor
        .check(&user_ctx("u-err"), RouteRequirements::feature(Feature::News))
        .await;
    assert!(result.is_err());
}

/// 用量写入失败时不部分提交
#[tokio::test]
async fn test_record_success_failure_leaves_counters_unchanged() {
    let usage = create_memory_storage();
    usage.insert_profile(profile("u2", Plan::Free, 3, 0));
    let governor = create_test_governor(
        RateLimitConfig::default(),
        create_memory_storage(),
        usage.clone(),
    );

    usage.inject_write_failure();
    assert!(governor.record_success("u2", Feature::News).await.is_err());
    assert_eq!(usage.get_profile("u2").await.unwrap().unwrap().usage_count, 3);
    assert_eq!(usage.feature_usage("u2", Feature::News).await.unwrap(), 0);

    let counters = governor.record_success("u2", Feature::News).await.unwrap();
    assert_eq!(counters.usage_count, 4);
    assert_eq!(counters.feature_count, 1);
}

/// 拒绝原因到 HTTP 状态码的映射
#[test]
fn test_quota_rejection_statuses() {
    let cases = [
        (DenyReason::UserNotFound, 403),
        (DenyReason::TrialExpired, 402),
        (DenyReason::QueryLimit, 402),
        (DenyReason::FeatureNotInPlan, 403),
    ];
    for (reason, status) in cases {
        assert_eq!(Rejection::Quota(reason).status(), status, "{}", reason);
    }
}
