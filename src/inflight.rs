//! Deduplication of concurrent summarization runs.
//!
//! Membership in the set is the only guard against two workers computing the
//! same key at once. It is not a global lock: workers for different keys
//! proceed independently.

use std::collections::HashSet;
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct InFlightSet {
    keys: Mutex<HashSet<String>>,
}

impl InFlightSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `key` as in flight. Returns false if it already was, in which
    /// case the caller must not start duplicate work.
    pub fn try_begin(&self, key: &str) -> bool {
        self.keys.lock().unwrap().insert(key.to_owned())
    }

    /// Remove `key` unconditionally. Idempotent; safe to call without a
    /// matching `try_begin`.
    pub fn end(&self, key: &str) {
        self.keys.lock().unwrap().remove(key);
    }

    pub fn len(&self) -> usize {
        self.keys.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
