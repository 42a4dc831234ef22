//! Result caching over the key-value store.
//!
//! - `KeyArgs` / `CacheKey`: deterministic SHA-256 keys derived from call arguments
//! - `ResultCache`: JSON values with TTL, pattern invalidation, and `cache_around`
//!
//! Cache failures never fail the caller: an unreachable store is a miss.

pub mod key;
pub mod result_cache;

pub use key::{CacheKey, KeyArgs};
pub use result_cache::{CacheStats, ComputeError, ResultCache};
