//! Namespaced keyed persistence for per-user learning state
//!
//! The engine persists weights, gradient accumulators, message buffers, and
//! metadata under per-user keys. Every storage failure is caught at this
//! boundary and converted to a `None`/`false` result with a warning — a
//! broken store must never prevent the agent from responding. Concurrent
//! saves to the same user key resolve last-write-wins by design.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Options, DB};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

// =============================================================================
// NAMESPACES
// =============================================================================

/// Per-user reranker weights (`RerankerState`)
pub const NS_WEIGHTS: &str = "weights";
/// Per-user gradient accumulator (`GradientAccumulatorState`)
pub const NS_GRADIENTS: &str = "gradients";
/// Live message buffer awaiting reflection
pub const NS_BUFFER: &str = "buffer";
/// Staged buffer snapshot while extraction is in flight
pub const NS_BUFFER_STAGING: &str = "buffer_staging";
/// Operational metadata (turn counters, last-reflection stamps)
pub const NS_METADATA: &str = "metadata";

/// All namespaces, in column-family declaration order
pub const ALL_NAMESPACES: &[&str] = &[
    NS_WEIGHTS,
    NS_GRADIENTS,
    NS_BUFFER,
    NS_BUFFER_STAGING,
    NS_METADATA,
];

/// A stored value plus the store's own last-write timestamp
///
/// `updated_at` is stamped by the store on every put; consumers that need an
/// inactivity clock (the reflection scheduler) read it from here, never from
/// timestamps embedded in the value itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRecord {
    pub value: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

/// Namespaced per-user key-value store
///
/// Implementations must degrade on I/O failure: `get` returns `None`, `put`
/// and `delete` return `false`, all after logging. They never panic or
/// propagate errors into turn processing.
pub trait KeyedStore: Send + Sync {
    fn get(&self, namespace: &str, user_id: &str) -> Option<StoredRecord>;
    fn put(&self, namespace: &str, user_id: &str, value: serde_json::Value) -> bool;
    fn delete(&self, namespace: &str, user_id: &str) -> bool;
}

/// Typed load: deserialize the stored value, returning it with `updated_at`
pub fn load_typed<T: DeserializeOwned>(
    store: &dyn KeyedStore,
    namespace: &str,
    user_id: &str,
) -> Option<(T, DateTime<Utc>)> {
    let record = store.get(namespace, user_id)?;
    match serde_json::from_value(record.value) {
        Ok(value) => Some((value, record.updated_at)),
        Err(e) => {
            tracing::warn!(namespace, user_id, error = %e, "Failed to deserialize stored record");
            None
        }
    }
}

/// Typed save: serialize and put, reporting success
pub fn save_typed<T: Serialize>(
    store: &dyn KeyedStore,
    namespace: &str,
    user_id: &str,
    value: &T,
) -> bool {
    match serde_json::to_value(value) {
        Ok(json) => store.put(namespace, user_id, json),
        Err(e) => {
            tracing::warn!(namespace, user_id, error = %e, "Failed to serialize record");
            false
        }
    }
}

// =============================================================================
// ROCKSDB IMPLEMENTATION
// =============================================================================

/// RocksDB-backed store, one column family per namespace, keys = user id
pub struct RocksStore {
    db: Arc<DB>,
}

impl RocksStore {
    /// Column family descriptors for every namespace
    ///
    /// Call this when opening a shared DB so the CFs are registered.
    pub fn column_family_descriptors() -> Vec<ColumnFamilyDescriptor> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        ALL_NAMESPACES
            .iter()
            .map(|ns| ColumnFamilyDescriptor::new(*ns, opts.clone()))
            .collect()
    }

    /// Open a standalone store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let mut cfs = vec![ColumnFamilyDescriptor::new("default", Options::default())];
        cfs.extend(Self::column_family_descriptors());

        let db = DB::open_cf_descriptors(&opts, path.as_ref(), cfs)?;
        tracing::info!(path = %path.as_ref().display(), "Reranker store opened");
        Ok(Self { db: Arc::new(db) })
    }

    /// Wrap an already-open shared DB (the CFs must be registered)
    pub fn with_shared_db(db: Arc<DB>) -> Self {
        Self { db }
    }

    fn cf(&self, namespace: &str) -> Option<&ColumnFamily> {
        let handle = self.db.cf_handle(namespace);
        if handle.is_none() {
            tracing::warn!(namespace, "Unknown store namespace");
        }
        handle
    }

    /// Flush all column families to disk (critical for graceful shutdown)
    pub fn flush(&self) -> anyhow::Result<()> {
        use rocksdb::FlushOptions;
        let mut flush_opts = FlushOptions::default();
        flush_opts.set_wait(true);
        for ns in ALL_NAMESPACES {
            if let Some(cf) = self.db.cf_handle(ns) {
                self.db
                    .flush_cf_opt(cf, &flush_opts)
                    .map_err(|e| anyhow::anyhow!("Failed to flush {ns}: {e}"))?;
            }
        }
        Ok(())
    }

    /// Reference to the underlying DB for backup tooling
    pub fn database(&self) -> &Arc<DB> {
        &self.db
    }
}

impl KeyedStore for RocksStore {
    fn get(&self, namespace: &str, user_id: &str) -> Option<StoredRecord> {
        let cf = self.cf(namespace)?;
        match self.db.get_cf(cf, user_id.as_bytes()) {
            Ok(Some(bytes)) => match serde_json::from_slice::<StoredRecord>(&bytes) {
                Ok(record) => Some(record),
                Err(e) => {
                    tracing::warn!(namespace, user_id, error = %e, "Corrupt stored record");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(namespace, user_id, error = %e, "Store read failed");
                None
            }
        }
    }

    fn put(&self, namespace: &str, user_id: &str, value: serde_json::Value) -> bool {
        let Some(cf) = self.cf(namespace) else {
            return false;
        };
        let record = StoredRecord {
            value,
            updated_at: Utc::now(),
        };
        let bytes = match serde_json::to_vec(&record) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(namespace, user_id, error = %e, "Failed to encode record");
                return false;
            }
        };
        match self.db.put_cf(cf, user_id.as_bytes(), &bytes) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(namespace, user_id, error = %e, "Store write failed");
                false
            }
        }
    }

    fn delete(&self, namespace: &str, user_id: &str) -> bool {
        let Some(cf) = self.cf(namespace) else {
            return false;
        };
        match self.db.delete_cf(cf, user_id.as_bytes()) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(namespace, user_id, error = %e, "Store delete failed");
                false
            }
        }
    }
}

// =============================================================================
// IN-MEMORY IMPLEMENTATION
// =============================================================================

/// In-memory store for tests and embedded operation
#[derive(Default)]
pub struct InMemoryStore {
    records: RwLock<HashMap<(String, String), StoredRecord>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a record's `updated_at` stamp (test hook for inactivity clocks)
    pub fn backdate(&self, namespace: &str, user_id: &str, updated_at: DateTime<Utc>) {
        let mut records = self.records.write();
        if let Some(record) = records.get_mut(&(namespace.to_string(), user_id.to_string())) {
            record.updated_at = updated_at;
        }
    }
}

impl KeyedStore for InMemoryStore {
    fn get(&self, namespace: &str, user_id: &str) -> Option<StoredRecord> {
        self.records
            .read()
            .get(&(namespace.to_string(), user_id.to_string()))
            .cloned()
    }

    fn put(&self, namespace: &str, user_id: &str, value: serde_json::Value) -> bool {
        self.records.write().insert(
            (namespace.to_string(), user_id.to_string()),
            StoredRecord {
                value,
                updated_at: Utc::now(),
            },
        );
        true
    }

    fn delete(&self, namespace: &str, user_id: &str) -> bool {
        self.records
            .write()
            .remove(&(namespace.to_string(), user_id.to_string()))
            .is_some()
    }
}
