//! Exclusive, non-blocking sentence locks for editing sessions.
//!
//! One flat table keyed by (filename, sentence index). Acquisition never
//! blocks: a conflict reports the current holder so the client can say who
//! is editing. The returned guard releases the lock on drop, which is what
//! guarantees that no lock survives its handler on any exit path,
//! whether commit, protocol error, or peer close.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

/// Who holds a lock, and since when.
#[derive(Clone, Debug)]
pub struct LockHolder {
    pub username: String,
    pub acquired: SystemTime,
}

/// The process-wide lock table of one storage server.
#[derive(Default, Debug)]
pub struct SentenceLocks {
    table: Mutex<HashMap<(String, usize), LockHolder>>,
}

impl SentenceLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Tries to take the lock on `(filename, sentence)` for `username`.
    ///
    /// Returns the holder on conflict. A user re-entering a sentence they
    /// already hold is still a conflict; the protocol has no lock
    /// re-entrancy because each editing session is one connection.
    pub fn try_acquire(
        self: &Arc<Self>,
        filename: &str,
        sentence: usize,
        username: &str,
    ) -> Result<SentenceLockGuard, LockHolder> {
        let mut table = self.table.lock().expect("sentence lock table poisoned");
        let key = (filename.to_string(), sentence);
        if let Some(holder) = table.get(&key) {
            return Err(holder.clone());
        }
        table.insert(
            key,
            LockHolder { username: username.to_string(), acquired: SystemTime::now() },
        );
        Ok(SentenceLockGuard {
            locks: Arc::clone(self),
            filename: filename.to_string(),
            sentence,
        })
    }

    /// Current holder of `(filename, sentence)`, if any.
    pub fn holder(&self, filename: &str, sentence: usize) -> Option<LockHolder> {
        let table = self.table.lock().expect("sentence lock table poisoned");
        table.get(&(filename.to_string(), sentence)).cloned()
    }

    /// Number of locks currently held on `filename`.
    pub fn active_locks(&self, filename: &str) -> usize {
        let table = self.table.lock().expect("sentence lock table poisoned");
        table.keys().filter(|(name, _)| name == filename).count()
    }

    fn release(&self, filename: &str, sentence: usize) {
        let mut table = self.table.lock().expect("sentence lock table poisoned");
        table.remove(&(filename.to_string(), sentence));
    }
}

/// Held sentence lock; releasing happens on drop.
#[derive(Debug)]
pub struct SentenceLockGuard {
    locks: Arc<SentenceLocks>,
    filename: String,
    sentence: usize,
}

impl Drop for SentenceLockGuard {
    fn drop(&mut self) {
        self.locks.release(&self.filename, self.sentence);
    }
}
