//! Durable key-value store backed by RocksDB.
//!
//! All multi-key mutations go through [`LedgerStore::batch_write`], which is
//! the atomicity unit for settlement: a stake debit, payout credit, and audit
//! record either all commit or none do.

use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};
use std::path::Path;
use std::sync::Arc;

#[derive(Clone)]
pub struct LedgerStore {
    db: Arc<DB>,
}

impl LedgerStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, rocksdb::Error> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_write_buffer_size(32 * 1024 * 1024);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let db = DB::open(&opts, path)?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Read one key. `Ok(None)` means confirmed absent; a read error is
    /// surfaced, never folded into absence, since callers lazily create
    /// rows for missing keys.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, rocksdb::Error> {
        self.db.get(key)
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), rocksdb::Error> {
        self.db.put(key, value)
    }

    pub fn delete(&self, key: &[u8]) -> Result<(), rocksdb::Error> {
        self.db.delete(key)
    }

    /// Write all items in a single atomic batch.
    pub fn batch_write<K, V>(&self, items: &[(K, V)]) -> Result<(), rocksdb::Error>
    where
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        let mut batch = WriteBatch::default();
        for (key, value) in items {
            batch.put(key, value);
        }
        self.db.write(batch)
    }

    /// Scan keys under `prefix` in ascending key order.
    ///
    /// When `cursor` is given, iteration resumes strictly after that key,
    /// so callers can page by passing back the last key they saw.
    pub fn scan_prefix(
        &self,
        prefix: &[u8],
        cursor: Option<&[u8]>,
        limit: usize,
    ) -> Vec<(Vec<u8>, Vec<u8>)> {
        let start: &[u8] = cursor.unwrap_or(prefix);
        let mode = IteratorMode::From(start, Direction::Forward);

        let mut rows = Vec::new();
        for item in self.db.iterator(mode) {
            let Ok((key, value)) = item else {
                break;
            };
            if !key.starts_with(prefix) {
                break;
            }
            if cursor == Some(key.as_ref()) {
                continue;
            }
            rows.push((key.to_vec(), value.to_vec()));
            if rows.len() >= limit {
                break;
            }
        }

        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_temp() -> (LedgerStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = LedgerStore::open(dir.path()).unwrap();
        (store, dir)
    }

    #[test]
    fn test_put_get_delete() {
        let (store, _dir) = open_temp();
        store.put(b"k", b"v").unwrap();
        assert_eq!(store.get(b"k").unwrap(), Some(b"v".to_vec()));
        store.delete(b"k").unwrap();
        assert_eq!(store.get(b"k").unwrap(), None);
    }

    #[test]
    fn test_missing_key_is_confirmed_absent() {
        let (store, _dir) = open_temp();
        // Absence is Ok(None), distinct from a read error.
        assert_eq!(store.get(b"never written").unwrap(), None);
    }

    #[test]
    fn test_batch_write_is_visible() {
        let (store, _dir) = open_temp();
        store
            .batch_write(&[(b"a".to_vec(), b"1".to_vec()), (b"b".to_vec(), b"2".to_vec())])
            .unwrap();
        assert_eq!(store.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.get(b"b").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn test_scan_prefix_pages_with_cursor() {
        let (store, _dir) = open_temp();
        for i in 0u8..5 {
            store.put(&[b'p', b':', i], &[i]).unwrap();
        }
        store.put(b"q:0", b"x").unwrap();

        let first = store.scan_prefix(b"p:", None, 3);
        assert_eq!(first.len(), 3);

        let cursor = first.last().unwrap().0.clone();
        let rest = store.scan_prefix(b"p:", Some(&cursor), 10);
        assert_eq!(rest.len(), 2);
        assert!(rest.iter().all(|(k, _)| k.starts_with(b"p:")));
    }
}
