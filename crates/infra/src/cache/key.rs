//! Cache key derivation.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Arguments of a cached call: ordered positional values plus named values.
///
/// Named values are kept sorted by name, so insertion order never changes the key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyArgs {
    positional: Vec<String>,
    named: BTreeMap<String, String>,
}

impl KeyArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a positional value.
    pub fn arg(mut self, value: impl fmt::Display) -> Self {
        self.positional.push(value.to_string());
        self
    }

    /// Set a named value (a repeated name keeps the last value).
    pub fn named(mut self, name: impl Into<String>, value: impl fmt::Display) -> Self {
        self.named.insert(name.into(), value.to_string());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.named.is_empty()
    }
}

/// Opaque cache key: `{prefix}:{namespace}:{sha256 hex}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive the key for `args` under `namespace`.
    ///
    /// Every element is length-prefixed before hashing, so `["a:b"]` and
    /// `["a", "b"]` produce different digests.
    pub fn derive(prefix: &str, namespace: &str, args: &KeyArgs) -> Self {
        let mut hasher = Sha256::new();
        frame(&mut hasher, namespace);

        hasher.update([SECTION_POSITIONAL]);
        hasher.update((args.positional.len() as u64).to_le_bytes());
        for value in &args.positional {
            frame(&mut hasher, value);
        }

        hasher.update([SECTION_NAMED]);
        hasher.update((args.named.len() as u64).to_le_bytes());
        for (name, value) in &args.named {
            frame(&mut hasher, name);
            frame(&mut hasher, value);
        }

        let digest = hex::encode(hasher.finalize());
        Self(format!("{prefix}:{namespace}:{digest}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

const SECTION_POSITIONAL: u8 = 0x1e;
const SECTION_NAMED: u8 = 0x1f;

fn frame(hasher: &mut Sha256, value: &str) {
    hasher.update((value.len() as u64).to_le_bytes());
    hasher.update(value.as_bytes());
}
