use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use ordinal_core::serialize;
use tracing::debug;

use super::overlay::Overlay;
use super::Storage;
use crate::error::StateError;

/// File-backed storage using a single snapshot file.
///
/// Every commit rewrites the snapshot to a temporary file and renames it
/// over the previous one, so a reader sees either the old or the new state.
#[derive(Debug, Clone)]
pub struct FileStorage {
    path: PathBuf,
    inner: Overlay,
}

impl FileStorage {
    pub fn new<P: Into<PathBuf>>(path: P) -> Result<Self, StateError> {
        let path = path.into();
        let data = if path.exists() {
            let bytes = fs::read(&path)?;
            if bytes.is_empty() {
                BTreeMap::new()
            } else {
                serialize::from_bytes(&bytes)
                    .map_err(|e| StateError::Serialization(e.to_string()))?
            }
        } else {
            BTreeMap::new()
        };
        debug!("Opened {} with {} keys", path.display(), data.len());

        Ok(FileStorage {
            path,
            inner: Overlay::with_data(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush_to_disk(&self) -> Result<(), StateError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let bytes = serialize::to_bytes(&self.inner.data)
            .map_err(|e| StateError::Serialization(e.to_string()))?;
        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, &bytes)?;
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

impl Storage for FileStorage {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.inner.get(key)
    }

    fn put(&mut self, key: &[u8], value: &[u8]) {
        self.inner.put(key, value);
    }

    fn delete(&mut self, key: &[u8]) {
        self.inner.delete(key);
    }

    fn commit(&mut self) -> Result<(), StateError> {
        if !self.inner.has_pending() {
            return Ok(());
        }
        let previous = self.inner.data.clone();
        self.inner.apply_pending();
        if let Err(err) = self.flush_to_disk() {
            self.inner.data = previous;
            return Err(err);
        }
        Ok(())
    }

    fn rollback(&mut self) {
        self.inner.discard_pending();
    }

    fn keys_with_prefix(&self, prefix: &[u8]) -> Vec<Vec<u8>> {
        self.inner.keys_with_prefix(prefix)
    }
}
