//! 端到端测试：持久层故障
//!
//! 测试场景：
//! 1. 持久层正常，按完整上限判定
//! 2. 持久层故障，内存层按一半上限判定
//! 3. 内存层也失效，故障开放
//! 4. 持久层恢复

use crate::common::*;
use lexgate::{
    decision_chain::{DecisionChainBuilder, DecisionNode, DURABLE_NODE_ID, MEMORY_NODE_ID},
    limiters::{TierVerdict, WindowLimiter},
    GateError, StorageError,
};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const WINDOW: Duration = Duration::from_secs(60);

/// 可切换的内存层
struct SwitchableTier {
    broken: AtomicBool,
}

impl WindowLimiter for SwitchableTier {
    fn check<'a>(
        &'a self,
        _key: &'a str,
        _limit: u64,
        _window: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<TierVerdict, GateError>> + Send + 'a>> {
        Box::pin(async move {
            if self.broken.load(Ordering::SeqCst) {
                Err(GateError::StorageError(StorageError::ConnectionError(
                    "内存层失效".to_string(),
                )))
            } else {
                Ok(TierVerdict::allow())
            }
        })
    }

    fn sweep(&self) -> Pin<Box<dyn Future<Output = Result<u64, GateError>> + Send + '_>> {
        Box::pin(async { Ok(0) })
    }

    fn name(&self) -> &str {
        "switchable"
    }
}

#[tokio::test]
async fn test_e2e_storage_outage_degrades_then_fails_open() {
    let durable = Arc::new(FlakyStore::new());
    let chain = create_chain(durable.clone());
    let key = unique_key("user");

    // Step 1
    for _ in 0..6 {
        let verdict = chain.evaluate(&key, 6, WINDOW).await;
        assert!(verdict.allowed);
        assert_eq!(verdict.decided_by.as_deref(), Some(DURABLE_NODE_ID));
    }
    assert!(!chain.allow(&key, 6, WINDOW).await);
    println!("✓ Step 1: durable tier enforced the full limit");

    // Step 2
    durable.set_available(false);
    let outage_key = unique_key("user");
    for _ in 0..3 {
        let verdict = chain.evaluate(&outage_key, 6, WINDOW).await;
        assert!(verdict.allowed);
        assert_eq!(verdict.decided_by.as_deref(), Some(MEMORY_NODE_ID));
    }
    assert!(!chain.allow(&outage_key, 6, WINDOW).await);
    println!("✓ Step 2: memory tier enforced half the limit");

    // Step 4
    durable.set_available(true);
    assert_eq!(
        chain.evaluate(&outage_key, 6, WINDOW).await.decided_by.as_deref(),
        Some(DURABLE_NODE_ID)
    );
    println!("✓ Step 4: durable tier back in charge");

    let stats = chain.stats();
    assert_eq!(stats.tier_failures, 4);
    assert_eq!(stats.fail_open_count, 0);
}

#[tokio::test]
async fn test_e2e_all_tiers_down_fail_open() {
    let durable = Arc::new(FlakyStore::new());
    durable.set_available(false);
    let memory = Arc::new(SwitchableTier {
        broken: AtomicBool::new(false),
    });

    let mut builder = DecisionChainBuilder::new().durable(durable, Duration::from_millis(100));
    builder = builder.add_node(DecisionNode::new(
        MEMORY_NODE_ID.to_string(),
        "Switchable memory tier".to_string(),
        memory.clone(),
        100,
    ));
    let chain = builder.build();
    let key = unique_key("ip");

    assert_eq!(
        chain.evaluate(&key, 1, WINDOW).await.decided_by.as_deref(),
        Some(MEMORY_NODE_ID)
    );

    // Step 3
    memory.broken.store(true, Ordering::SeqCst);
    for _ in 0..20 {
        let verdict = chain.evaluate(&key, 1, WINDOW).await;
        assert!(verdict.allowed);
        assert!(verdict.failed_open);
        assert_eq!(verdict.decided_by, None);
    }
    println!("✓ Step 3: every request admitted while all tiers are down");
    assert_eq!(chain.stats().fail_open_count, 20);
}
