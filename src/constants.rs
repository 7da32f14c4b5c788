//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! Centralized configuration constants for Lexgate.
//!
//! All magic numbers used by the rate limiter and the quota guard are defined here
//! with their purpose and usage context.

// ============================================================================
// Rate Limit Constants
// ============================================================================

/// Default request limit for an authenticated caller (`user:<id>` key) per window.
pub const DEFAULT_USER_RATE_LIMIT: u64 = 100;

/// Default request limit for an anonymous caller (`ip:<addr>` key) per window.
///
/// Stricter than the user limit because unidentifiable clients may share one bucket.
pub const DEFAULT_IP_RATE_LIMIT: u64 = 20;

/// Default rate limit window (1 minute).
pub const DEFAULT_RATE_LIMIT_WINDOW_SECS: u64 = 60;

/// Percentage of the requested limit applied by the in-memory fallback tier.
///
/// The fallback tier has no cross-instance visibility, so it enforces a lower limit.
/// The effective fallback limit never drops below 1.
pub const DEFAULT_FALLBACK_LIMIT_PERCENT: u8 = 50;

/// Timeout applied to every durable tier operation (3 seconds).
///
/// A timeout is handled exactly like any other durable tier failure.
pub const DEFAULT_DURABLE_TIMEOUT_MS: u64 = 3_000;

/// How often expired counters are swept from both tiers (1 minute).
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

/// Header carrying the proxy chain; the first value is taken as the client IP.
pub const DEFAULT_FORWARDED_HEADER: &str = "x-forwarded-for";

/// Sentinel used when no client IP can be determined.
///
/// All unidentifiable clients share this single bucket.
pub const UNKNOWN_IP: &str = "unknown";

/// Key prefix for authenticated callers.
pub const USER_KEY_PREFIX: &str = "user:";

/// Key prefix for anonymous callers.
pub const IP_KEY_PREFIX: &str = "ip:";

// ============================================================================
// Quota Constants
// ============================================================================

/// Length of the free tier trial, counted from account creation.
pub const DEFAULT_TRIAL_DAYS: i64 = 7;

/// Lifetime number of gated actions available on the free tier.
pub const DEFAULT_FREE_QUERY_LIMIT: u64 = 10;

// ============================================================================
// Storage Constants
// ============================================================================

/// Default maximum connections of the PostgreSQL pool.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// Default PostgreSQL connect timeout (seconds).
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;
