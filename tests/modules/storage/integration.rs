//! 存储集成测试

use crate::common::*;
use chrono::{Duration as ChronoDuration, Utc};
use lexgate::quota_controller::{Feature, Plan};
use lexgate::storage::{RateLimitRecord, RateLimitStore, UsageStore};
use std::sync::Arc;
use std::time::Duration;

/// 达到上限后的拒绝不修改记录
#[tokio::test]
async fn test_denied_hit_does_not_mutate_record() {
    let storage = create_memory_storage();
    let key = unique_key("user");
    let window = Duration::from_secs(30);

    storage.hit(&key, 2, window).await.unwrap();
    storage.hit(&key, 2, window).await.unwrap();
    let before = storage.get_record(&key).await.unwrap().unwrap();

    let outcome = storage.hit(&key, 2, window).await.unwrap();
    assert!(!outcome.allowed);
    assert_eq!(storage.get_record(&key).await.unwrap().unwrap(), before);
    assert_eq!(outcome.reset_time, before.reset_time);
}

/// 过期记录视为新窗口
#[test]
fn test_apply_hit_on_expired_record() {
    let now = Utc::now();
    let mut record = RateLimitRecord {
        key: "ip:10.0.0.1".to_string(),
        count: 500,
        reset_time: now - ChronoDuration::seconds(1),
    };

    let outcome = record.apply_hit(now, 3, Duration::from_secs(60));
    assert!(outcome.allowed);
    assert_eq!(record.count, 1);
    assert_eq!(record.reset_time, now + ChronoDuration::seconds(60));
}

/// 窗口到期时间与剩余时间
#[tokio::test]
async fn test_retry_after_within_window() {
    let storage = create_memory_storage();
    let key = unique_key("ip");

    storage.hit(&key, 1, Duration::from_secs(10)).await.unwrap();
    let outcome = storage.hit(&key, 1, Duration::from_secs(10)).await.unwrap();
    assert!(!outcome.allowed);

    let retry = outcome.retry_after(Utc::now());
    assert!(retry > Duration::from_secs(8));
    assert!(retry <= Duration::from_secs(10));
}

/// 清理只删除已过期的记录
#[tokio::test]
async fn test_cleanup_keeps_live_windows() {
    let storage = create_memory_storage();
    let short = unique_key("ip");
    let long = unique_key("ip");

    storage.hit(&short, 5, Duration::from_millis(50)).await.unwrap();
    storage.hit(&long, 5, Duration::from_secs(60)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;

    assert_eq!(storage.cleanup_expired().await.unwrap(), 1);
    assert!(storage.get_record(&short).await.unwrap().is_none());
    assert!(storage.get_record(&long).await.unwrap().is_some());
}

/// 并发递增用量不丢失写入
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_usage_increments() {
    let storage = create_memory_storage();
    storage.ensure_profile("busy").await.unwrap();

    let handles: Vec<_> = (0..50)
        .map(|i| {
            let storage = Arc::clone(&storage);
            let feature = if i % 2 == 0 {
                Feature::Research
            } else {
                Feature::News
            };
            tokio::spawn(async move { storage.increment_usage("busy", feature).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let profile = storage.get_profile("busy").await.unwrap().unwrap();
    assert_eq!(profile.usage_count, 50);
    assert_eq!(storage.feature_usage("busy", Feature::Research).await.unwrap(), 25);
    assert_eq!(storage.feature_usage("busy", Feature::News).await.unwrap(), 25);
}

/// ensure_profile 不覆盖已有档案
#[tokio::test]
async fn test_ensure_profile_keeps_existing() {
    let storage = create_memory_storage();
    storage.insert_profile(profile("paid", Plan::Enterprise, 42, 90));

    let existing = storage.ensure_profile("paid").await.unwrap();
    assert_eq!(existing.plan, Plan::Enterprise);
    assert_eq!(existing.usage_count, 42);
}

/// 对不存在的用户降级或设置套餐返回错误
#[tokio::test]
async fn test_missing_user_writes_fail() {
    let storage = create_memory_storage();
    assert!(storage.downgrade_plan("ghost", Utc::now()).await.is_err());
    assert!(storage.set_plan("ghost", Plan::Pro, None).await.is_err());
    assert_eq!(storage.feature_usage("ghost", Feature::Crm).await.unwrap(), 0);
}
