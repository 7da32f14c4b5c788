//! PostgreSQL集成测试
//!
//! 需要 `DATABASE_URL` 指向可写的测试库。

use crate::common::*;
use chrono::{Duration as ChronoDuration, Utc};
use lexgate::config::{QuotaConfig, RateLimitConfig};
use lexgate::decision_chain::{DecisionChainBuilder, DURABLE_NODE_ID};
use lexgate::governor::{Decision, Governor, NoCsrf, Rejection, RouteRequirements};
use lexgate::matchers::RequestContext;
use lexgate::postgres_storage::{PostgresStorage, PostgresStorageConfig};
use lexgate::quota_controller::{DenyReason, Feature, Plan, QuotaController};
use lexgate::storage::UsageStore;
use std::sync::Arc;
use std::time::Duration;

async fn storage() -> Arc<PostgresStorage> {
    let url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "postgresql://localhost/lexgate_test".to_string());
    let storage = PostgresStorage::new(
        PostgresStorageConfig::new(url).query_timeout(Duration::from_millis(500)),
    )
    .await
    .unwrap();
    storage.ensure_schema().await.unwrap();
    Arc::new(storage)
}

fn governor(storage: Arc<PostgresStorage>, config: RateLimitConfig) -> Governor {
    let chain = DecisionChainBuilder::new()
        .durable(storage.clone(), config.durable_timeout())
        .memory(
            Arc::new(lexgate::MemoryCounterStore::new()),
            config.fallback_limit_percent,
            config.window(),
        )
        .build();
    let quota = QuotaController::new(storage, QuotaConfig::default());
    Governor::new(config, Arc::new(chain), Arc::new(quota), Arc::new(NoCsrf)).unwrap()
}

/// 持久层作出判定
#[tokio::test]
#[ignore] // 需要PostgreSQL服务器运行
async fn test_postgres_chain_decides_durably() {
    let storage = storage().await;
    let chain = create_chain(storage);
    let key = unique_key("ip");

    for _ in 0..4 {
        let verdict = chain.evaluate(&key, 4, Duration::from_secs(60)).await;
        assert!(verdict.allowed);
        assert_eq!(verdict.decided_by.as_deref(), Some(DURABLE_NODE_ID));
    }
    assert!(!chain.allow(&key, 4, Duration::from_secs(60)).await);
}

/// 免费用户完整生命周期：用量记录、查询上限
#[tokio::test]
#[ignore]
async fn test_postgres_free_tier_lifecycle() {
    let storage = storage().await;
    let user = unique_key("pg-user").replace(':', "-");
    storage.ensure_profile(&user).await.unwrap();

    let governor = governor(storage.clone(), RateLimitConfig::default());
    let ctx = RequestContext::new().with_method("GET").with_user(&user);
    let route = RouteRequirements::feature(Feature::News);

    for _ in 0..10 {
        assert!(governor.check(&ctx, route).await.unwrap().is_allowed());
        governor.record_success(&user, Feature::News).await.unwrap();
    }
    assert_eq!(
        governor.check(&ctx, route).await.unwrap(),
        Decision::Rejected(Rejection::Quota(DenyReason::QueryLimit))
    );
    assert_eq!(storage.feature_usage(&user, Feature::News).await.unwrap(), 10);
}

/// 到期降级写入数据库
#[tokio::test]
#[ignore]
async fn test_postgres_lazy_downgrade_is_persisted() {
    let storage = storage().await;
    let user = unique_key("pg-lapsed").replace(':', "-");
    storage.ensure_profile(&user).await.unwrap();
    storage
        .set_plan(&user, Plan::Pro, Some(Utc::now() - ChronoDuration::minutes(5)))
        .await
        .unwrap();

    let governor = governor(storage.clone(), RateLimitConfig::default());
    let ctx = RequestContext::new().with_method("GET").with_user(&user);
    assert_eq!(
        governor
            .check(&ctx, RouteRequirements::feature(Feature::Crm))
            .await
            .unwrap(),
        Decision::Rejected(Rejection::Quota(DenyReason::FeatureNotInPlan))
    );

    let profile = storage.get_profile(&user).await.unwrap().unwrap();
    assert_eq!(profile.plan, Plan::Free);
    assert_eq!(profile.expiry_date, None);
}
