//! 限流评估器集成测试
//!
//! 窗口正确性、窗口重置、并发准入上限与降级透明性。

use crate::common::*;
use lexgate::decision_chain::{DecisionChainBuilder, DURABLE_NODE_ID, MEMORY_NODE_ID};
use lexgate::memory_counter::MemoryCounterStore;
use lexgate::storage::{MemoryStorage, RateLimitStore, UnavailableStorage};
use std::sync::Arc;
use std::time::Duration;

const WINDOW: Duration = Duration::from_secs(60);

/// 新键上限为 N：前 N 次放行，第 N+1 次拒绝
#[tokio::test]
async fn test_window_correctness() {
    let chain = create_chain(create_memory_storage());
    let key = unique_key("user");

    for i in 0..25 {
        assert!(chain.allow(&key, 25, WINDOW).await, "call {} should pass", i + 1);
    }
    assert!(!chain.allow(&key, 25, WINDOW).await);
    assert!(!chain.allow(&key, 25, WINDOW).await);
}

/// 窗口到期后重新计数，无论之前计数是多少
#[tokio::test]
async fn test_window_reset() {
    let storage = create_memory_storage();
    let chain = create_chain(storage.clone());
    let key = unique_key("ip");
    let window = Duration::from_millis(200);

    for _ in 0..3 {
        assert!(chain.allow(&key, 3, window).await);
    }
    assert!(!chain.allow(&key, 3, window).await);

    tokio::time::sleep(Duration::from_millis(250)).await;

    assert!(chain.allow(&key, 3, window).await);
    let record = storage.get_record(&key).await.unwrap().unwrap();
    assert_eq!(record.count, 1);
}

/// 持久层可用时，M 个并发请求恰好放行 N 个
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_admission_bound_durable() {
    let chain = Arc::new(create_chain(create_memory_storage()));
    let key = unique_key("user");

    let handles: Vec<_> = (0..100)
        .map(|_| {
            let chain = chain.clone();
            let key = key.clone();
            tokio::spawn(async move { chain.allow(&key, 20, WINDOW).await })
        })
        .collect();

    let mut admitted = 0;
    for handle in handles {
        if handle.await.unwrap() {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 20);
    assert_eq!(chain.stats().rejected_count, 80);
}

/// 仅内存降级层时不保证精确上限：读取与写入分两步，并发下可能多放行。
/// 这里只断言不会少于降级上限，且总数不超过请求数。
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_admission_memory_only_may_overshoot() {
    let chain = Arc::new(
        DecisionChainBuilder::new()
            .memory(Arc::new(MemoryCounterStore::new()), 100, WINDOW)
            .build(),
    );
    let key = unique_key("ip");

    let handles: Vec<_> = (0..100)
        .map(|_| {
            let chain = chain.clone();
            let key = key.clone();
            tokio::spawn(async move { chain.allow(&key, 20, WINDOW).await })
        })
        .collect();

    let mut admitted = 0;
    for handle in handles {
        if handle.await.unwrap() {
            admitted += 1;
        }
    }
    assert!(admitted >= 20, "admitted {}", admitted);
    assert!(admitted <= 100);
}

/// 持久层不可用时仍然返回布尔值，并使用更严格的降级上限
#[tokio::test]
async fn test_fallback_transparency() {
    let chain = create_chain(Arc::new(UnavailableStorage));
    let key = unique_key("ip");

    // 上限 20 在降级层为 10
    for _ in 0..10 {
        let verdict = chain.evaluate(&key, 20, WINDOW).await;
        assert!(verdict.allowed);
        assert_eq!(verdict.decided_by.as_deref(), Some(MEMORY_NODE_ID));
    }
    assert!(!chain.allow(&key, 20, WINDOW).await);
    assert_eq!(chain.stats().fail_open_count, 0);
}

/// 持久层恢复后重新由持久层判定，降级期间的内存计数不会回写
#[tokio::test]
async fn test_recovery_after_outage() {
    let store = Arc::new(FlakyStore::new());
    let chain = create_chain(store.clone());
    let key = unique_key("user");

    store.set_available(false);
    for _ in 0..4 {
        assert!(chain.allow(&key, 8, WINDOW).await);
    }
    assert!(!chain.allow(&key, 8, WINDOW).await);

    store.set_available(true);
    let verdict = chain.evaluate(&key, 8, WINDOW).await;
    assert!(verdict.allowed);
    assert_eq!(verdict.decided_by.as_deref(), Some(DURABLE_NODE_ID));
}

/// 持久层超时与连接失败一样触发降级
#[tokio::test]
async fn test_durable_timeout_triggers_fallback() {
    struct HangingStore;

    #[async_trait::async_trait]
    impl RateLimitStore for HangingStore {
        async fn hit(
            &self,
            _key: &str,
            _limit: u64,
            _window: Duration,
        ) -> Result<lexgate::storage::WindowOutcome, lexgate::StorageError> {
            futures::future::pending().await
        }

        async fn get_record(
            &self,
            _key: &str,
        ) -> Result<Option<lexgate::storage::RateLimitRecord>, lexgate::StorageError> {
            Ok(None)
        }

        async fn cleanup_expired(&self) -> Result<u64, lexgate::StorageError> {
            Ok(0)
        }
    }

    let chain = DecisionChainBuilder::new()
        .durable(Arc::new(HangingStore), Duration::from_millis(30))
        .memory(Arc::new(MemoryCounterStore::new()), 50, WINDOW)
        .build();

    let started = std::time::Instant::now();
    let verdict = chain.evaluate(&unique_key("ip"), 10, WINDOW).await;
    assert!(verdict.allowed);
    assert_eq!(verdict.decided_by.as_deref(), Some(MEMORY_NODE_ID));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(chain.stats().tier_failures, 1);
}

/// 不同键互不影响
#[tokio::test]
async fn test_keys_are_independent() {
    let chain = create_chain(Arc::new(MemoryStorage::new()));
    let a = unique_key("ip");
    let b = unique_key("ip");

    assert!(chain.allow(&a, 1, WINDOW).await);
    assert!(!chain.allow(&a, 1, WINDOW).await);
    assert!(chain.allow(&b, 1, WINDOW).await);
}
