//! 决策链模块（限流评估器）
//!
//! 使用责任链模式组合多层限流器：持久层 → 内存降级层 → 放行。
//!
//! # 特性
//!
//! - 统一契约：每个节点都是 `(key, limit, window)` 判定
//! - 逐层降级：节点出错时记录警告并尝试下一个节点
//! - 故障开放：所有节点都失败时放行请求，可用性优先于严格限流
//! - 优先级排序：按优先级降序执行节点
//! - 统计：记录放行、拒绝、层故障与故障开放次数

use crate::config::RateLimitConfig;
use crate::limiters::{DurableWindowLimiter, MemoryWindowLimiter, WindowLimiter};
use crate::memory_counter::{CounterStore, GLOBAL_FALLBACK_COUNTERS};
use crate::storage::RateLimitStore;
use futures::FutureExt;
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

// ============================================================================
// 决策链节点
// ============================================================================

/// 决策链节点
///
/// 责任链中的单层，包含一个限流器和相关配置。
pub struct DecisionNode {
    /// 节点ID
    pub id: String,
    /// 节点名称
    pub name: String,
    /// 限流器
    pub limiter: Arc<dyn WindowLimiter>,
    /// 优先级（数值越大越先执行）
    pub priority: u16,
    /// 是否启用
    pub enabled: bool,
}

impl DecisionNode {
    /// 创建新的决策节点
    ///
    /// # 示例
    /// ```rust
    /// use lexgate::decision_chain::DecisionNode;
    /// use lexgate::limiters::MemoryWindowLimiter;
    /// use std::sync::Arc;
    ///
    /// let node = DecisionNode::new(
    ///     "memory".to_string(),
    ///     "Memory fallback".to_string(),
    ///     Arc::new(MemoryWindowLimiter::default()),
    ///     100,
    /// );
    /// assert!(node.enabled);
    /// ```
    pub fn new(id: String, name: String, limiter: Arc<dyn WindowLimiter>, priority: u16) -> Self {
        Self {
            id,
            name,
            limiter,
            priority,
            enabled: true,
        }
    }

    /// 设置是否启用
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

// ============================================================================
// 决策链
// ============================================================================

/// 限流判定结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateVerdict {
    pub allowed: bool,
    /// 被拒绝时距离窗口重置的时间
    pub retry_after: Option<Duration>,
    /// 作出判定的节点ID；故障开放时为 `None`
    pub decided_by: Option<String>,
    /// 是否因所有节点失败而放行
    pub failed_open: bool,
}

impl RateVerdict {
    fn fail_open() -> Self {
        Self {
            allowed: true,
            retry_after: None,
            decided_by: None,
            failed_open: true,
        }
    }
}

/// 决策链统计信息
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainStats {
    /// 总检查次数
    pub total_checks: u64,
    /// 放行次数
    pub allowed_count: u64,
    /// 拒绝次数
    pub rejected_count: u64,
    /// 节点故障次数（每次降级计一次）
    pub tier_failures: u64,
    /// 故障开放次数
    pub fail_open_count: u64,
    /// 各节点作出判定的次数
    pub node_decisions: Vec<(String, u64)>,
}

/// 决策链
///
/// 限流评估器：按优先级依次尝试各层，第一个成功返回的层给出结论。
pub struct DecisionChain {
    /// 链中的节点（按优先级排序）
    nodes: Vec<DecisionNode>,
    /// 统计信息
    stats: Mutex<ChainStats>,
}

impl DecisionChain {
    /// 创建新的决策链
    pub fn new(nodes: Vec<DecisionNode>) -> Self {
        let mut chain = Self {
            nodes: Vec::new(),
            stats: Mutex::new(ChainStats::default()),
        };

        for node in nodes {
            chain.add_node(node);
        }

        chain
    }

    /// 添加节点
    pub fn add_node(&mut self, node: DecisionNode) {
        // 按优先级排序（降序）
        let pos = self
            .nodes
            .binary_search_by(|n| n.priority.cmp(&node.priority).reverse())
            .unwrap_or_else(|pos| pos);

        self.nodes.insert(pos, node);
    }

    /// 移除节点
    pub fn remove_node(&mut self, node_id: &str) -> Option<DecisionNode> {
        let pos = self.nodes.iter().position(|n| n.id == node_id)?;
        Some(self.nodes.remove(pos))
    }

    /// 判定请求是否允许
    ///
    /// 从不返回错误：节点失败降级到下一个节点，全部失败时放行。
    pub async fn allow(&self, key: &str, limit: u64, window: Duration) -> bool {
        self.evaluate(key, limit, window).await.allowed
    }

    /// 判定请求并返回详细结果
    pub async fn evaluate(&self, key: &str, limit: u64, window: Duration) -> RateVerdict {
        // 上限与窗口至少为 1，避免 0 值导致所有请求被拒
        let limit = limit.max(1);
        let window = window.max(Duration::from_millis(1));

        self.stats.lock().total_checks += 1;

        for node in &self.nodes {
            if !node.enabled {
                trace!("跳过已禁用的节点: {}", node.id);
                continue;
            }

            let attempt = AssertUnwindSafe(node.limiter.check(key, limit, window))
                .catch_unwind()
                .await;

            match attempt {
                Ok(Ok(verdict)) => {
                    self.record_decision(&node.id, verdict.allowed);
                    if !verdict.allowed {
                        debug!("请求被限流: key={}, node={}", key, node.id);
                    }
                    return RateVerdict {
                        allowed: verdict.allowed,
                        retry_after: verdict.retry_after,
                        decided_by: Some(node.id.clone()),
                        failed_open: false,
                    };
                }
                Ok(Err(e)) => {
                    warn!("限流节点故障，降级到下一层: node={}, error={}", node.id, e);
                    self.stats.lock().tier_failures += 1;
                }
                Err(_) => {
                    error!("限流节点发生 panic，降级到下一层: node={}", node.id);
                    self.stats.lock().tier_failures += 1;
                }
            }
        }

        warn!("所有限流节点均不可用，故障开放: key={}", key);
        {
            let mut stats = self.stats.lock();
            stats.fail_open_count += 1;
            stats.allowed_count += 1;
        }
        RateVerdict::fail_open()
    }

    fn record_decision(&self, node_id: &str, allowed: bool) {
        let mut stats = self.stats.lock();
        if allowed {
            stats.allowed_count += 1;
        } else {
            stats.rejected_count += 1;
        }

        if let Some(entry) = stats
            .node_decisions
            .iter_mut()
            .find(|(id, _)| id == node_id)
        {
            entry.1 += 1;
        } else {
            stats.node_decisions.push((node_id.to_string(), 1));
        }
    }

    /// 清理所有节点的过期计数，单个节点失败不影响其他节点
    pub async fn sweep_expired(&self) -> u64 {
        let mut total = 0;
        for node in &self.nodes {
            match node.limiter.sweep().await {
                Ok(removed) => total += removed,
                Err(e) => warn!("清理过期计数失败: node={}, error={}", node.id, e),
            }
        }
        total
    }

    /// 获取统计信息
    pub fn stats(&self) -> ChainStats {
        self.stats.lock().clone()
    }

    /// 重置统计信息
    pub fn reset_stats(&self) {
        *self.stats.lock() = ChainStats::default();
    }

    /// 节点ID（按执行顺序）
    pub fn node_ids(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.id.as_str()).collect()
    }

    /// 获取节点数量
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// 启用节点
    pub fn enable_node(&mut self, node_id: &str) -> bool {
        self.set_node_enabled(node_id, true)
    }

    /// 禁用节点
    pub fn disable_node(&mut self, node_id: &str) -> bool {
        self.set_node_enabled(node_id, false)
    }

    fn set_node_enabled(&mut self, node_id: &str, enabled: bool) -> bool {
        match self.nodes.iter_mut().find(|n| n.id == node_id) {
            Some(node) => {
                node.enabled = enabled;
                info!("节点状态变更: {} enabled={}", node_id, enabled);
                true
            }
            None => {
                warn!("节点不存在: {}", node_id);
                false
            }
        }
    }
}

// ============================================================================
// 构建器
// ============================================================================

/// 持久层节点ID
pub const DURABLE_NODE_ID: &str = "durable";
/// 内存降级节点ID
pub const MEMORY_NODE_ID: &str = "memory";

/// 决策链构建器
///
/// 标准链为"持久层（可选）→ 内存降级层"。未配置持久层时只包含内存层。
pub struct DecisionChainBuilder {
    nodes: Vec<DecisionNode>,
}

impl DecisionChainBuilder {
    /// 创建新的构建器
    pub fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    /// 添加持久层节点
    pub fn durable(self, store: Arc<dyn RateLimitStore>, timeout: Duration) -> Self {
        self.add_node(DecisionNode::new(
            DURABLE_NODE_ID.to_string(),
            "Durable window store".to_string(),
            Arc::new(DurableWindowLimiter::new(store, timeout)),
            200,
        ))
    }

    /// 添加内存降级节点
    pub fn memory(
        self,
        store: Arc<dyn CounterStore>,
        limit_percent: u8,
        sweep_window: Duration,
    ) -> Self {
        self.add_node(DecisionNode::new(
            MEMORY_NODE_ID.to_string(),
            "In-memory fallback".to_string(),
            Arc::new(MemoryWindowLimiter::new(store, limit_percent).with_sweep_window(sweep_window)),
            100,
        ))
    }

    /// 按配置构建标准链
    ///
    /// `durable` 为 `None` 时只包含进程级内存降级层。
    pub fn from_config(
        config: &RateLimitConfig,
        durable: Option<Arc<dyn RateLimitStore>>,
    ) -> DecisionChain {
        let mut builder = Self::new();
        if let Some(store) = durable {
            builder = builder.durable(store, config.durable_timeout());
        } else {
            warn!("未配置持久层存储，限流仅使用内存降级层");
        }
        builder
            .memory(
                GLOBAL_FALLBACK_COUNTERS.clone(),
                config.fallback_limit_percent,
                config.window(),
            )
            .build()
    }

    /// 添加节点
    pub fn add_node(mut self, node: DecisionNode) -> Self {
        self.nodes.push(node);
        self
    }

    /// 构建决策链
    pub fn build(self) -> DecisionChain {
        DecisionChain::new(self.nodes)
    }
}

impl Default for DecisionChainBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// 单元测试
// ============================================================================
