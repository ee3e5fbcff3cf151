use std::collections::BTreeMap;
use std::ops::Bound;

/// Committed map plus staged writes. Shared by the storage backends.
#[derive(Debug, Clone, Default)]
pub(crate) struct Overlay {
    pub(crate) data: BTreeMap<Vec<u8>, Vec<u8>>,
    pending: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl Overlay {
    pub(crate) fn with_data(data: BTreeMap<Vec<u8>, Vec<u8>>) -> Self {
        Overlay {
            data,
            pending: BTreeMap::new(),
        }
    }

    pub(crate) fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        match self.pending.get(key) {
            Some(pending) => pending.clone(),
            None => self.data.get(key).cloned(),
        }
    }

    pub(crate) fn put(&mut self, key: &[u8], value: &[u8]) {
        self.pending.insert(key.to_vec(), Some(value.to_vec()));
    }

    pub(crate) fn delete(&mut self, key: &[u8]) {
        self.pending.insert(key.to_vec(), None);
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Fold pending writes into the committed map
    pub(crate) fn apply_pending(&mut self) {
        for (key, value) in std::mem::take(&mut self.pending) {
            match value {
                Some(v) => {
                    self.data.insert(key, v);
                }
                None => {
                    self.data.remove(&key);
                }
            }
        }
    }

    pub(crate) fn discard_pending(&mut self) {
        self.pending.clear();
    }

    pub(crate) fn keys_with_prefix(&self, prefix: &[u8]) -> Vec<Vec<u8>> {
        let range = (Bound::Included(prefix.to_vec()), Bound::Unbounded);
        let mut keys: Vec<Vec<u8>> = self
            .data
            .range::<Vec<u8>, _>(range.clone())
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(k, _)| !matches!(self.pending.get(*k), Some(None)))
            .map(|(k, _)| k.clone())
            .collect();

        keys.extend(
            self.pending
                .range::<Vec<u8>, _>(range)
                .take_while(|(k, _)| k.starts_with(prefix))
                .filter(|(k, v)| v.is_some() && !self.data.contains_key(*k))
                .map(|(k, _)| k.clone()),
        );
        keys.sort();
        keys
    }
}
