//! Typed key/value storage, generalizing the teacher's `Item`/`Map` constants
//! (`state.rs`) and `DequeExtension` (`common-bitcoin/src/deque.rs`) onto a
//! RocksDB-backed store (spec §5: "Four LevelDB-equivalent key/value stores").
//!
//! Each component owns one column family; a single [`WriteBatch`] collects
//! writes from every component touched while a block is connected, and is
//! applied with one atomic `rocksdb::WriteBatch` (§3.5, §5).

use std::path::Path;
use std::sync::Arc;

use rocksdb::{ColumnFamilyDescriptor, Options, DB};
use serde::de::DeserializeOwned;
use serde::Serialize;

use bathron_types::{BathronError, BathronResult};

pub const CF_BTCSPV: &str = "btcspv";
pub const CF_BTCHEADERSDB: &str = "btcheadersdb";
pub const CF_SETTLEMENT: &str = "settlement";
pub const CF_HTLC: &str = "htlc";

pub const ALL_COLUMN_FAMILIES: [&str; 4] = [CF_BTCSPV, CF_BTCHEADERSDB, CF_SETTLEMENT, CF_HTLC];

/// The top-level handle to all four persisted databases (§5, §9 "Global
/// mutable state" — this is the one handle type; holding it does not confer
/// write rights, only the block-connect path calls `commit`).
pub struct Database {
    db: Arc<DB>,
}

impl Database {
    pub fn open(path: impl AsRef<Path>) -> BathronResult<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        let cfs = ALL_COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()));
        let db = DB::open_cf_descriptors(&opts, path, cfs)
            .map_err(|e| BathronError::Storage(e.to_string()))?;
        Ok(Database { db: Arc::new(db) })
    }

    /// Reopens the database at the same path, as if the process had
    /// restarted (§4.1 "Hot reload").
    pub fn reload(&mut self, path: impl AsRef<Path>) -> BathronResult<()> {
        *self = Database::open(path)?;
        Ok(())
    }

    pub fn column<K, V>(&self, cf_name: &'static str) -> Column<K, V> {
        Column {
            db: self.db.clone(),
            cf_name,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn batch(&self) -> WriteBatch {
        WriteBatch {
            db: self.db.clone(),
            inner: rocksdb::WriteBatch::default(),
        }
    }
}

/// A typed accessor into one column family, keyed by raw bytes and valued by
/// a `bincode`-encoded `V`. Stands in for the teacher's `Item<T>`/`Map<K,T>`
/// constants (`state.rs`), minus the CosmWasm `Storage` trait.
pub struct Column<K, V> {
    db: Arc<DB>,
    cf_name: &'static str,
    _marker: std::marker::PhantomData<(K, V)>,
}

impl<K, V> Clone for Column<K, V> {
    fn clone(&self) -> Self {
        Column {
            db: self.db.clone(),
            cf_name: self.cf_name,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<K: AsRef<[u8]>, V: Serialize + DeserializeOwned> Column<K, V> {
    fn cf(&self) -> &rocksdb::ColumnFamily {
        self.db
            .cf_handle(self.cf_name)
            .expect("column family registered at open()")
    }

    pub fn get(&self, key: &K) -> BathronResult<Option<V>> {
        let raw = self
            .db
            .get_cf(self.cf(), key.as_ref())
            .map_err(|e| BathronError::Storage(e.to_string()))?;
        raw.map(|bytes| {
            bincode::deserialize(&bytes).map_err(|e| BathronError::Storage(e.to_string()))
        })
        .transpose()
    }

    pub fn exists(&self, key: &K) -> BathronResult<bool> {
        Ok(self
            .db
            .get_pinned_cf(self.cf(), key.as_ref())
            .map_err(|e| BathronError::Storage(e.to_string()))?
            .is_some())
    }

    pub fn put(&self, key: &K, value: &V) -> BathronResult<()> {
        let bytes = bincode::serialize(value).map_err(|e| BathronError::Storage(e.to_string()))?;
        self.db
            .put_cf(self.cf(), key.as_ref(), bytes)
            .map_err(|e| BathronError::Storage(e.to_string()))
    }

    pub fn delete(&self, key: &K) -> BathronResult<()> {
        self.db
            .delete_cf(self.cf(), key.as_ref())
            .map_err(|e| BathronError::Storage(e.to_string()))
    }

    /// Iterates all entries whose key starts with `prefix`, used for the
    /// hashlock discovery lookups (§4.5.6).
    pub fn iter_prefix(&self, prefix: &[u8]) -> BathronResult<Vec<(Vec<u8>, V)>> {
        let mut out = Vec::new();
        let iter = self.db.prefix_iterator_cf(self.cf(), prefix);
        for item in iter {
            let (key, bytes) = item.map_err(|e| BathronError::Storage(e.to_string()))?;
            if !key.starts_with(prefix) {
                break;
            }
            let value: V =
                bincode::deserialize(&bytes).map_err(|e| BathronError::Storage(e.to_string()))?;
            out.push((key.to_vec(), value));
        }
        Ok(out)
    }
}

/// Accumulates writes across every component's column family while a block
/// is being connected/disconnected; `commit()` applies them as one atomic
/// RocksDB write (§3.5, §5).
pub struct WriteBatch {
    db: Arc<DB>,
    inner: rocksdb::WriteBatch,
}

impl WriteBatch {
    pub fn put<K: AsRef<[u8]>, V: Serialize>(
        &mut self,
        cf_name: &'static str,
        key: &K,
        value: &V,
    ) -> BathronResult<()> {
        let cf = self
            .db
            .cf_handle(cf_name)
            .expect("column family registered at open()");
        let bytes = bincode::serialize(value).map_err(|e| BathronError::Storage(e.to_string()))?;
        self.inner.put_cf(cf, key.as_ref(), bytes);
        Ok(())
    }

    pub fn delete<K: AsRef<[u8]>>(&mut self, cf_name: &'static str, key: &K) {
        let cf = self
            .db
            .cf_handle(cf_name)
            .expect("column family registered at open()");
        self.inner.delete_cf(cf, key.as_ref());
    }

    pub fn commit(self) -> BathronResult<()> {
        self.db
            .write(self.inner)
            .map_err(|e| BathronError::Storage(e.to_string()))
    }
}
