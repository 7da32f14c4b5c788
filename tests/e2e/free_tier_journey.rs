//! 端到端测试：免费用户用满查询额度
//!
//! 测试场景：
//! 1. 新用户以免费层注册
//! 2. 连续 10 次成功使用功能，每次成功后记录用量
//! 3. 第 11 次请求在配额阶段被拒绝（query_limit）
//! 4. 付费功能始终被拒绝（feature_not_in_plan）

use crate::common::*;
use lexgate::{
    config::RateLimitConfig,
    governor::{Decision, Rejection, RouteRequirements},
    matchers::RequestContext,
    quota_controller::{DenyReason, Feature},
    storage::UsageStore,
};

#[tokio::test]
async fn test_e2e_free_tier_query_limit() {
    let usage = create_memory_storage();
    let governor = create_test_governor(
        RateLimitConfig::default(),
        create_memory_storage(),
        usage.clone(),
    );
    let user_id = "free_tier_user";
    usage.ensure_profile(user_id).await.unwrap();

    let ctx = RequestContext::new()
        .with_method("GET")
        .with_path("/api/assistant")
        .with_user(user_id);
    let route = RouteRequirements::feature(Feature::AiAssistant);

    // Step 1-2: 10 次成功使用
    for i in 0..10 {
        let decision = governor.check(&ctx, route).await.unwrap();
        assert!(decision.is_allowed(), "request {} should pass", i + 1);
        let counters = governor
            .record_success(user_id, Feature::AiAssistant)
            .await
            .unwrap();
        assert_eq!(counters.usage_count, i + 1);
    }
    println!("✓ Step 1-2: 10 requests succeeded");

    // Step 3: 第 11 次被拒绝
    let decision = governor.check(&ctx, route).await.unwrap();
    assert_eq!(
        decision,
        Decision::Rejected(Rejection::Quota(DenyReason::QueryLimit))
    );
    if let Decision::Rejected(rejection) = decision {
        assert_eq!(rejection.status(), 402);
    }
    println!("✓ Step 3: request 11 rejected with query_limit");

    // Step 4: 付费功能
    let crm = governor
        .check(&ctx, RouteRequirements::feature(Feature::Crm))
        .await
        .unwrap();
    assert_eq!(
        crm,
        Decision::Rejected(Rejection::Quota(DenyReason::FeatureNotInPlan))
    );
    println!("✓ Step 4: paid feature rejected");

    let profile = usage.get_profile(user_id).await.unwrap().unwrap();
    assert_eq!(profile.usage_count, 10);
    assert_eq!(
        usage
            .feature_usage(user_id, Feature::AiAssistant)
            .await
            .unwrap(),
        10
    );
}
