//! In-memory backend used by tests and by nodes running without a datadir.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::{Column, KeyValueStore, StoreError, WriteBatch, WriteOp};

#[derive(Debug, Default)]
pub struct MemoryStore {
    columns: Mutex<BTreeMap<(Column, Vec<u8>), Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.columns.lock().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let map = self
            .columns
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))?;
        Ok(map.get(&(column, key.to_vec())).cloned())
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut map = self
            .columns
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))?;
        map.insert((column, key.to_vec()), value.to_vec());
        Ok(())
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        let mut map = self
            .columns
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))?;
        map.remove(&(column, key.to_vec()));
        Ok(())
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let mut map = self
            .columns
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))?;
        for op in batch.iter() {
            match op {
                WriteOp::Put { column, key, value } => {
                    map.insert((*column, key.as_slice().to_vec()), value.clone());
                }
                WriteOp::Delete { column, key } => {
                    map.remove(&(*column, key.as_slice().to_vec()));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::MemoryStore;
    use crate::{Column, KeyValueStore, WriteBatch};

    #[test]
    fn batch_applies_in_order() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        batch.put(Column::Meta, b"key", b"one".to_vec());
        batch.put(Column::Meta, b"key", b"two".to_vec());
        batch.delete(Column::MasternodeMan, b"absent");
        store.write_batch(&batch).expect("write batch");

        let value = store.get(Column::Meta, b"key").expect("get");
        assert_eq!(value.as_deref(), Some(b"two".as_slice()));
        assert!(store
            .get(Column::MasternodeMan, b"key")
            .expect("get")
            .is_none());
    }
}
