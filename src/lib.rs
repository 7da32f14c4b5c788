//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! Lexgate - Request Gate for Multi-tenant SaaS
//!
//! Provides tiered fail-open rate limiting, plan entitlement checks and an
//! axum middleware that composes them.
//!
//! # API Layers
//!
//! ## Prelude (Quick Start)
//!
//! Use `use lexgate::prelude::*;` to import all commonly used types.
//!
//! ## Core API
//!
//! - [`Governor`] - Request pipeline: rate limit, CSRF, auth, quota
//! - [`DecisionChain`] - Rate limit evaluator over ordered storage tiers
//! - [`QuotaController`] - Plan, trial and usage entitlement checks
//! - [`GateConfig`] - Configuration loaded from file or environment
//! - [`GateError`] - Error types
//!
//! ## Storage
//!
//! - [`MemoryStorage`] - In-process durable tier (tests, single instance)
//! - `PostgresStorage` - Transactional durable tier (requires `postgres` feature)
//! - [`memory_counter`] - Process-local fallback counters
//!
//! ## Extensions (feature-gated)
//!
//! - HTTP middleware (requires `http` feature)
//! - Logging setup (requires `telemetry` feature)
//!
//! # Examples
//!
//! ```rust
//! use lexgate::prelude::*;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let chain = DecisionChainBuilder::from_config(
//!         &RateLimitConfig::default(),
//!         Some(Arc::new(MemoryStorage::new())),
//!     );
//!
//!     // 持久层可用时按持久层上限判定
//!     assert!(chain.allow("user:42", 100, Duration::from_secs(60)).await);
//! }
//! ```
//!
//! # Features
//!
//! - **Tiered rate limiting**: durable store, stricter in-memory fallback, then fail open
//! - **Atomic windows**: per-key read-check-write in one transaction
//! - **Entitlements**: free-tier trial and query ceilings, per-plan feature table, lazy downgrade
//! - **Usage tracking**: cumulative and per-feature counters committed together

pub mod prelude;

pub mod config;
pub mod constants;
pub mod decision_chain;
pub mod error;
pub mod governor;
pub mod limiters;
pub mod matchers;
pub mod memory_counter;
#[cfg(feature = "http")]
pub mod middleware;
#[cfg(feature = "postgres")]
pub mod postgres_storage;
pub mod quota_controller;
pub mod storage;
#[cfg(feature = "telemetry")]
pub mod telemetry;

// 重新导出常用类型
pub use config::{GateConfig, QuotaConfig, RateLimitConfig, StorageConfig};
pub use decision_chain::{ChainStats, DecisionChain, DecisionChainBuilder, DecisionNode, RateVerdict};
pub use error::{GateError, StorageError};
pub use governor::{
    CsrfValidator, Decision, DoubleSubmitCsrf, GateStage, Governor, GovernorStats, NoCsrf,
    Rejection, RouteRequirements,
};
pub use limiters::{DurableWindowLimiter, MemoryWindowLimiter, TierVerdict, WindowLimiter};
pub use matchers::{
    CompositeExtractor, Identifier, IdentifierExtractor, IpExtractor, RequestContext,
    UserIdExtractor,
};
pub use memory_counter::{CounterStore, MemoryCounter, MemoryCounterStore, GLOBAL_FALLBACK_COUNTERS};
#[cfg(feature = "http")]
pub use middleware::{gate, AuthenticatedUser, GateState};
#[cfg(feature = "postgres")]
pub use postgres_storage::{PostgresStorage, PostgresStorageConfig};
pub use quota_controller::{
    plan_allows, reconcile, DenyReason, Feature, Plan, QuotaController, QuotaDecision, Reconciled,
};
pub use storage::{
    MemoryStorage, RateLimitRecord, RateLimitStore, UnavailableStorage, UsageCounters,
    UsageProfile, UsageStore, WindowOutcome,
};
#[cfg(feature = "telemetry")]
pub use telemetry::{init_tracing, TelemetryConfig};
