//! 端到端测试：付费套餐到期
//!
//! 测试场景：
//! 1. Pro 用户在付费期内可使用 CRM
//! 2. 付费期结束后首次请求触发降级，CRM 被拒绝
//! 3. 免费功能按免费层规则放行
//! 4. 续费后 CRM 恢复可用

use crate::common::*;
use chrono::{Duration as ChronoDuration, Utc};
use lexgate::{
    config::RateLimitConfig,
    governor::{Decision, Rejection, RouteRequirements},
    matchers::RequestContext,
    quota_controller::{DenyReason, Feature, Plan},
    storage::UsageStore,
};

#[tokio::test]
async fn test_e2e_paid_plan_expiry_and_renewal() {
    let usage = create_memory_storage();
    let governor = create_test_governor(
        RateLimitConfig::default(),
        create_memory_storage(),
        usage.clone(),
    );
    let user_id = "renewing_firm";
    let mut pro = profile(user_id, Plan::Pro, 250, 3);
    pro.expiry_date = Some(Utc::now() + ChronoDuration::milliseconds(300));
    usage.insert_profile(pro);

    let ctx = RequestContext::new().with_method("GET").with_user(user_id);
    let crm = RouteRequirements::feature(Feature::Crm);

    // Step 1
    assert!(governor.check(&ctx, crm).await.unwrap().is_allowed());
    println!("✓ Step 1: CRM available during paid period");

    // Step 2
    tokio::time::sleep(std::time::Duration::from_millis(400)).await;
    assert_eq!(
        governor.check(&ctx, crm).await.unwrap(),
        Decision::Rejected(Rejection::Quota(DenyReason::FeatureNotInPlan))
    );
    let stored = usage.get_profile(user_id).await.unwrap().unwrap();
    assert_eq!(stored.plan, Plan::Free);
    assert_eq!(stored.expiry_date, None);
    println!("✓ Step 2: plan downgraded to free");

    // Step 3: 累计用量 250 已超过免费额度
    assert_eq!(
        governor
            .check(&ctx, RouteRequirements::feature(Feature::News))
            .await
            .unwrap(),
        Decision::Rejected(Rejection::Quota(DenyReason::QueryLimit))
    );
    println!("✓ Step 3: free-tier rules apply");

    // Step 4
    usage
        .set_plan(
            user_id,
            Plan::Pro,
            Some(Utc::now() + ChronoDuration::days(30)),
        )
        .await
        .unwrap();
    assert!(governor.check(&ctx, crm).await.unwrap().is_allowed());
    println!("✓ Step 4: renewal restores CRM");
}
