pub mod memory;
mod overlay;
pub mod persistent;

use crate::error::StateError;

/// A single staged mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// An ordered group of writes applied as one unit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Put(key.into(), value.into()));
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Delete(key.into()));
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}

/// Storage trait for consensus persistence
pub trait Storage: Send + Sync {
    /// Get a value by key
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

    /// Stage a key-value pair
    fn put(&mut self, key: &[u8], value: &[u8]);

    /// Stage a deletion
    fn delete(&mut self, key: &[u8]);

    /// Commit pending changes
    fn commit(&mut self) -> Result<(), StateError>;

    /// Rollback pending changes
    fn rollback(&mut self);

    fn exists(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    /// All visible keys starting with `prefix`, in ascending order
    fn keys_with_prefix(&self, prefix: &[u8]) -> Vec<Vec<u8>>;

    /// Key-value pairs under `prefix`, in ascending key order
    fn scan_prefix(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.keys_with_prefix(prefix)
            .into_iter()
            .filter_map(|key| self.get(&key).map(|value| (key, value)))
            .collect()
    }

    /// Apply every operation of `batch` and commit. Either all of them become
    /// visible or, on error, none of them do.
    fn write(&mut self, batch: WriteBatch) -> Result<(), StateError> {
        self.rollback();
        for op in batch.into_ops() {
            match op {
                BatchOp::Put(key, value) => self.put(&key, &value),
                BatchOp::Delete(key) => self.delete(&key),
            }
        }
        if let Err(err) = self.commit() {
            self.rollback();
            return Err(err);
        }
        Ok(())
    }
}

pub use memory::MemoryStorage;
pub use persistent::FileStorage;
