//! Key-value store abstraction shared by the result cache and the job store.
//!
//! The contract mirrors what Redis offers natively: single-key reads and
//! writes with an optional TTL, glob scans, deletes, and a compare-and-set
//! that callers use to build atomic read-modify-write updates.

use std::sync::Arc;
use std::time::Duration;

use globset::{GlobBuilder, GlobMatcher};

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use in_memory::InMemoryKvStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisKvStore;

/// Key-value store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum KvError {
    /// The backing store could not be reached or refused the operation.
    #[error("key-value store unavailable: {0}")]
    Unavailable(String),
    #[error("invalid key pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

/// Key-value store with TTL and pattern scans.
pub trait KvStore: Send + Sync {
    /// Read a live (non-expired) value.
    fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    /// Write a value, replacing any previous one. `ttl = None` never expires.
    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError>;

    /// Delete a key. Returns whether a live key was removed.
    fn delete(&self, key: &str) -> Result<bool, KvError>;

    /// List live keys matching a Redis glob pattern (see [`KeyPattern`]).
    fn scan(&self, pattern: &str) -> Result<Vec<String>, KvError>;

    /// Atomically replace the value at `key` if it currently equals `expected`
    /// (`None` = key absent). Returns `false` when the current value differs.
    fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, KvError>;
}

impl<S> KvStore for Arc<S>
where
    S: KvStore + ?Sized,
{
    fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        (**self).set(key, value, ttl)
    }

    fn delete(&self, key: &str) -> Result<bool, KvError> {
        (**self).delete(key)
    }

    fn scan(&self, pattern: &str) -> Result<Vec<String>, KvError> {
        (**self).scan(pattern)
    }

    fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, KvError> {
        (**self).compare_and_set(key, expected, value, ttl)
    }
}

/// Compiled Redis-style key pattern: `*`, `?`, `[abc]`, `[^a-z]` and `\x`
/// escapes, matched the way `SCAN MATCH` does.
#[derive(Debug, Clone)]
pub struct KeyPattern {
    matcher: GlobMatcher,
}

impl KeyPattern {
    pub fn new(pattern: &str) -> Result<Self, KvError> {
        let glob = GlobBuilder::new(&redis_to_glob(pattern))
            .literal_separator(false)
            .backslash_escape(true)
            .build()
            .map_err(|e| KvError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            matcher: glob.compile_matcher(),
        })
    }

    pub fn matches(&self, key: &str) -> bool {
        self.matcher.is_match(key)
    }
}

/// Rewrite Redis glob syntax into `globset` syntax. Braces are literal in
/// Redis, so they are escaped; `[^..]` becomes `[!..]`; an unclosed `[` is a
/// literal bracket; runs of `*` collapse to one.
fn redis_to_glob(pattern: &str) -> String {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::with_capacity(pattern.len() + 4);
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '\\' if i + 1 < chars.len() => {
                out.push('\\');
                out.push(chars[i + 1]);
                i += 2;
            }
            '\\' => {
                out.push_str("\\\\");
                i += 1;
            }
            '*' => {
                out.push('*');
                while chars.get(i + 1) == Some(&'*') {
                    i += 1;
                }
                i += 1;
            }
            '{' | '}' => {
                out.push('\\');
                out.push(chars[i]);
                i += 1;
            }
            '[' => match class_end(&chars, i) {
                Some(end) => {
                    out.push('[');
                    let mut j = i + 1;
                    if chars[j] == '^' {
                        out.push('!');
                        j += 1;
                    }
                    while j < end {
                        // Escapes inside a class name the character itself.
                        if chars[j] == '\\' && j + 1 < end {
                            j += 1;
                        }
                        out.push(chars[j]);
                        j += 1;
                    }
                    out.push(']');
                    i = end + 1;
                }
                None => {
                    out.push_str("[[]");
                    i += 1;
                }
            },
            c => {
                out.push(c);
                i += 1;
            }
        }
    }

    out
}

/// Index of the `]` closing the class opened at `open`, if any. The class
/// must contain at least one member.
fn class_end(chars: &[char], open: usize) -> Option<usize> {
    let mut j = open + 1;
    if chars.get(j) == Some(&'^') {
        j += 1;
    }
    let first = j;
    while j < chars.len() {
        match chars[j] {
            '\\' => j += 2,
            ']' if j > first => return Some(j),
            _ => j += 1,
        }
    }
    None
}
