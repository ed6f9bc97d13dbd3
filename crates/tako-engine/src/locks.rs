//! Process-wide named locks for the repository cache.
//!
//! Clone, fetch and checkout on the same `<owner>/<name>` cache entry must
//! never interleave, whether the callers are parallel graph workers or
//! child-workspace factories. One lock table serves the whole process; it is
//! one of the two sanctioned global singletons (the other is the expression
//! compile cache). Git work is synchronous, so async callers go through
//! `spawn_blocking` and hold the lock on a blocking thread.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

/// Table of named mutexes, created on first use.
#[derive(Debug, Default)]
pub struct LockTable {
    inner: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LockTable {
    /// The process-wide table.
    pub fn global() -> &'static Self {
        static TABLE: OnceLock<LockTable> = OnceLock::new();
        TABLE.get_or_init(Self::default)
    }

    fn entry(&self, key: &str) -> Arc<Mutex<()>> {
        let mut guard = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(
            guard
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Run `f` while holding the named lock.
    pub fn with_lock<T>(&self, key: &str, f: impl FnOnce() -> T) -> T {
        let entry = self.entry(key);
        let _guard = entry
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f()
    }
}
