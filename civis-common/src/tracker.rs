//! Reference-counted start/finish tracking.
//!
//! Test frameworks may report the start of one logical suite several times
//! (once per listener, once per parallel branch). The tracker turns those
//! nested calls into exactly one "create" and exactly one "end".

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;

/// Per-key nesting counter.
#[derive(Debug)]
pub struct ActivationTracker<K> {
    counters: Mutex<HashMap<K, usize>>,
}

impl<K> Default for ActivationTracker<K> {
    fn default() -> Self {
        Self {
            counters: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone> ActivationTracker<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` only for the call that takes `key` from zero to one.
    pub fn try_start(&self, key: &K) -> bool {
        let mut counters = self.counters.lock().unwrap();
        let count = counters.entry(key.clone()).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Returns `true` only for the call that brings `key` back to zero.
    ///
    /// Finishing a key that was never started is a no-op returning `false`.
    pub fn try_finish(&self, key: &K) -> bool {
        let mut counters = self.counters.lock().unwrap();
        match counters.get_mut(key) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                counters.remove(key);
                true
            }
            None => false,
        }
    }

    /// Current nesting depth of `key`.
    pub fn depth(&self, key: &K) -> usize {
        self.counters.lock().unwrap().get(key).copied().unwrap_or(0)
    }

    pub fn active_keys(&self) -> usize {
        self.counters.lock().unwrap().len()
    }
}
