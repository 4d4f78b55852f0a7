use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;

use super::KvStore;
use crate::error::{MirrorError, MirrorResult};

/// In-process store. Used in tests and when no store path is configured.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
    writes: AtomicU64,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful write calls (`put`, `put_many`, `delete`).
    #[cfg(test)]
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Make every subsequent write fail (outage simulation).
    #[cfg(test)]
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    fn check_writable(&self) -> MirrorResult<()> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(MirrorError::Store("store unavailable".into()));
        }
        Ok(())
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> MirrorResult<Option<String>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: String) -> MirrorResult<()> {
        self.check_writable()?;
        self.entries.write().insert(key.to_string(), value);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn delete(&self, key: &str) -> MirrorResult<()> {
        self.check_writable()?;
        self.entries.write().remove(key);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn put_many(&self, entries: Vec<(String, String)>) -> MirrorResult<()> {
        self.check_writable()?;
        self.entries.write().extend(entries);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> MirrorResult<Vec<String>> {
        let mut keys: Vec<String> = self
            .entries
            .read()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}
