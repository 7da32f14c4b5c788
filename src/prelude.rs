//! Prelude module - Commonly used types for quick imports
//!
//! This module re-exports the most commonly used types from Lexgate,
//! allowing users to import them with a single `use lexgate::prelude::*;`
//! statement instead of importing each type individually.

// Core types - always available
pub use crate::config::{GateConfig, QuotaConfig, RateLimitConfig};
pub use crate::error::{GateError, StorageError};
pub use crate::governor::{Decision, Governor, Rejection, RouteRequirements};

// Rate limiting
pub use crate::decision_chain::{DecisionChain, DecisionChainBuilder};

// Quota
pub use crate::quota_controller::{DenyReason, Feature, Plan, QuotaController, QuotaDecision};

// Common matchers
pub use crate::matchers::{Identifier, RequestContext};

// Storage
pub use crate::storage::{MemoryStorage, RateLimitStore, UsageStore};

// Feature-gated exports
#[cfg(feature = "http")]
pub use crate::middleware::{gate, AuthenticatedUser, GateState};

#[cfg(feature = "postgres")]
pub use crate::postgres_storage::PostgresStorage;
