//! # Edge
//!
//! ## Responsibility
//! The collaborators that sit in front of the core: a result cache keyed by
//! content hash and a per-client rate limiter.
//!
//! ## Guarantees
//! - Non-blocking: both are lock-sharded maps; no call suspends
//! - Bounded: the cache never holds more than `max_entries` values
//!
//! ## NOT Responsible For
//! - Deciding what to cache (the pipeline caches genuine successes only)
//! - Distributed state (both live in process memory)

pub mod cache;
pub mod rate_limit;

pub use cache::{cache_key, cache_key_parts, CacheLayer, CacheStats, CacheTtls};
pub use rate_limit::{RateLimitInfo, RateLimiter};
