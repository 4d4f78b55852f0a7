// =============================================================================
// File-backed store — one JSON document, rewritten atomically on every write
// =============================================================================

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::{debug, info};

use super::KvStore;
use crate::error::{MirrorError, MirrorResult};

pub struct FileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileStore {
    /// Open the store at `path`, creating an empty one if the file is absent.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read store from {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("failed to parse store from {}", path.display()))?
        } else {
            BTreeMap::new()
        };

        info!(path = %path.display(), keys = entries.len(), "file store opened");
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    /// Write the whole map to a temporary sibling file, then rename over the
    /// target. Called with the entries lock held so writers never interleave.
    fn persist(&self, entries: &BTreeMap<String, String>) -> MirrorResult<()> {
        let content = serde_json::to_string_pretty(entries)?;
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, content)
            .map_err(|e| MirrorError::Store(format!("write {}: {e}", tmp_path.display())))?;
        std::fs::rename(&tmp_path, &self.path)
            .map_err(|e| MirrorError::Store(format!("rename {}: {e}", self.path.display())))?;
        debug!(path = %self.path.display(), keys = entries.len(), "store persisted");
        Ok(())
    }

    fn mutate(&self, apply: impl FnOnce(&mut BTreeMap<String, String>)) -> MirrorResult<()> {
        let mut entries = self.entries.lock();
        let mut next = entries.clone();
        apply(&mut next);
        self.persist(&next)?;
        *entries = next;
        Ok(())
    }
}

impl KvStore for FileStore {
    fn get(&self, key: &str) -> MirrorResult<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn put(&self, key: &str, value: String) -> MirrorResult<()> {
        self.mutate(|m| {
            m.insert(key.to_string(), value);
        })
    }

    fn delete(&self, key: &str) -> MirrorResult<()> {
        self.mutate(|m| {
            m.remove(key);
        })
    }

    fn put_many(&self, entries: Vec<(String, String)>) -> MirrorResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.mutate(|m| m.extend(entries))
    }

    fn keys_with_prefix(&self, prefix: &str) -> MirrorResult<Vec<String>> {
        Ok(self
            .entries
            .lock()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}
