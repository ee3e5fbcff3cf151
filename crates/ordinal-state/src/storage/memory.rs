use super::overlay::Overlay;
use super::Storage;
use crate::error::StateError;

/// In-memory storage implementation using BTreeMap
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    inner: Overlay,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of committed keys
    pub fn len(&self) -> usize {
        self.inner.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.data.is_empty()
    }
}

impl Storage for MemoryStorage {
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
        self.inner.apply_pending();
        Ok(())
    }

    fn rollback(&mut self) {
        self.inner.discard_pending();
    }

    fn keys_with_prefix(&self, prefix: &[u8]) -> Vec<Vec<u8>> {
        self.inner.keys_with_prefix(prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::WriteBatch;

    #[test]
    fn test_pending_writes() {
        let mut storage = MemoryStorage::new();

        storage.put(b"round", b"1");
        // Not committed yet, but should still be visible
        assert_eq!(storage.get(b"round"), Some(b"1".to_vec()));

        storage.rollback();
        assert_eq!(storage.get(b"round"), None);
        assert!(storage.is_empty());
    }

    #[test]
    fn test_delete_then_rollback() {
        let mut storage = MemoryStorage::new();
        storage.put(b"step", b"4");
        storage.commit().unwrap();

        storage.delete(b"step");
        assert!(!storage.exists(b"step"));
        storage.rollback();
        assert!(storage.exists(b"step"));
    }

    #[test]
    fn test_batch_applies_in_order() {
        let mut storage = MemoryStorage::new();
        let mut batch = WriteBatch::new();
        batch.put(b"a".to_vec(), b"1".to_vec());
        batch.put(b"b".to_vec(), b"2".to_vec());
        batch.delete(b"a".to_vec());
        batch.put(b"c".to_vec(), b"3".to_vec());
        storage.write(batch).unwrap();

        assert_eq!(storage.get(b"a"), None);
        assert_eq!(storage.get(b"b"), Some(b"2".to_vec()));
        assert_eq!(storage.len(), 2);
    }

    #[test]
    fn test_prefix_scan_sees_pending_and_hides_deleted() {
        let mut storage = MemoryStorage::new();
        storage.put(b"votes:1", b"x");
        storage.put(b"votes:2", b"y");
        storage.put(b"other:1", b"z");
        storage.commit().unwrap();

        storage.delete(b"votes:1");
        storage.put(b"votes:3", b"w");

        let keys = storage.keys_with_prefix(b"votes:");
        assert_eq!(keys, vec![b"votes:2".to_vec(), b"votes:3".to_vec()]);

        let pairs = storage.scan_prefix(b"votes:");
        assert_eq!(pairs[1], (b"votes:3".to_vec(), b"w".to_vec()));
    }
}
