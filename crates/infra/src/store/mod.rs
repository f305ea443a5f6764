//! Shared-store access layer.
//!
//! The routing engine only needs a handful of primitives from its backing
//! store: string-field hashes, sorted sets with a blocking pop, lists, and a
//! pipelined batch of writes. `Store` names exactly those, so the channel and
//! watcher code is backend-agnostic.
//!
//! ## Connectivity
//!
//! Implementations own their connection lifecycle. A backend that loses its
//! connection blocks and reconnects with a fixed backoff instead of returning
//! a "not connected" error; callers observe latency, never disconnects.
//!
//! ## Batches
//!
//! [`Store::apply_batch`] sends a sequence of writes in one round trip. It is
//! **not** atomic across commands: a failure mid-batch may leave a partial
//! effect. Everything built on batches (enqueue, advance, delete) is safe to
//! re-apply.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use in_memory::InMemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

/// Store handle shared by the components of one process (or one watcher).
pub type SharedStore = Arc<dyn Store>;

pub type StoreResult<T> = Result<T, StoreError>;

/// Store failure visible to callers. Connectivity loss is never one of these.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("store configuration error: {0}")]
    Config(String),

    #[error("store command failed: {0}")]
    Command(String),

    #[error("key `{key}` holds a different type")]
    WrongType { key: String },

    #[error("store backend error: {0}")]
    Backend(String),
}

/// One page of a cursor scan. A `cursor` of `0` means the scan is complete.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanPage<T> {
    pub cursor: u64,
    pub items: Vec<T>,
}

/// A single write inside a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    SetFields {
        key: String,
        fields: Vec<(String, String)>,
    },
    IncrementField {
        key: String,
        field: String,
        by: i64,
    },
    DeleteKey {
        key: String,
    },
    PushList {
        key: String,
        value: String,
    },
    PushSorted {
        key: String,
        member: String,
        score: f64,
    },
}

/// Ordered writes to send in one round trip.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fields(&mut self, key: impl Into<String>, fields: Vec<(String, String)>) -> &mut Self {
        self.ops.push(WriteOp::SetFields {
            key: key.into(),
            fields,
        });
        self
    }

    pub fn increment_field(
        &mut self,
        key: impl Into<String>,
        field: impl Into<String>,
        by: i64,
    ) -> &mut Self {
        self.ops.push(WriteOp::IncrementField {
            key: key.into(),
            field: field.into(),
            by,
        });
        self
    }

    pub fn delete_key(&mut self, key: impl Into<String>) -> &mut Self {
        self.ops.push(WriteOp::DeleteKey { key: key.into() });
        self
    }

    pub fn push_list(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.ops.push(WriteOp::PushList {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn push_sorted(
        &mut self,
        key: impl Into<String>,
        member: impl Into<String>,
        score: f64,
    ) -> &mut Self {
        self.ops.push(WriteOp::PushSorted {
            key: key.into(),
            member: member.into(),
            score,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

/// Atomic primitives of the shared store.
///
/// Each method is atomic on its own; no method spans keys atomically except
/// where stated (`pop_list` with a target moves each item atomically).
pub trait Store: Send + Sync {
    /// One hash field, `None` when the key or field is absent.
    fn get_field(&self, key: &str, field: &str) -> StoreResult<Option<String>>;

    /// Whole hash; empty when the key is absent.
    fn get_all(&self, key: &str) -> StoreResult<HashMap<String, String>>;

    fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Set hash fields, creating the hash if needed. Empty `fields` is a no-op.
    fn set_fields(&self, key: &str, fields: &[(String, String)]) -> StoreResult<()>;

    /// Increment an integer hash field, returning the new value.
    fn increment_field(&self, key: &str, field: &str, by: i64) -> StoreResult<i64>;

    /// Delete a key of any type. Deleting an absent key is not an error.
    fn delete_key(&self, key: &str) -> StoreResult<()>;

    /// Remove every occurrence of `value` from a list.
    fn remove_list_entry(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Append to the tail of a list.
    fn push_list(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Pop up to `count` items from the head of a list. With a `target`, each
    /// item is atomically moved to the tail of `target` instead of discarded.
    /// Stops early when the list runs dry.
    fn pop_list(&self, key: &str, target: Option<&str>, count: usize) -> StoreResult<Vec<String>>;

    /// Whole list, head first.
    fn list_range(&self, key: &str) -> StoreResult<Vec<String>>;

    /// Add (or re-score) a sorted-set member.
    fn push_sorted(&self, key: &str, member: &str, score: f64) -> StoreResult<()>;

    /// Blocking pop of the lowest-scored member. `None` once `timeout` elapses.
    fn pop_min_blocking(&self, key: &str, timeout: Duration) -> StoreResult<Option<String>>;

    /// Non-blocking pop of up to `count` lowest-scored members.
    fn pop_min(&self, key: &str, count: usize) -> StoreResult<Vec<String>>;

    fn remove_sorted(&self, key: &str, member: &str) -> StoreResult<()>;

    fn contains_sorted(&self, key: &str, member: &str) -> StoreResult<bool>;

    /// One page of a hash scan starting at `cursor` (`0` starts a new scan).
    fn scan_hash_page(
        &self,
        key: &str,
        cursor: u64,
        page_size: usize,
    ) -> StoreResult<ScanPage<(String, String)>>;

    /// One page of a sorted-set scan starting at `cursor` (`0` starts a new scan).
    fn scan_sorted_page(&self, key: &str, cursor: u64, page_size: usize)
    -> StoreResult<ScanPage<String>>;

    /// Apply writes in one round trip, without cross-command atomicity.
    fn apply_batch(&self, batch: WriteBatch) -> StoreResult<()>;
}

impl dyn Store {
    /// Build and apply a batch in one go.
    pub fn batch(&self, build: impl FnOnce(&mut WriteBatch)) -> StoreResult<()> {
        let mut batch = WriteBatch::new();
        build(&mut batch);
        if batch.is_empty() {
            return Ok(());
        }
        self.apply_batch(batch)
    }

    /// Lazy `(field, value)` sequence over a hash, fetched a page at a time.
    pub fn scan_hash(&self, key: &str, page_size: usize) -> Scan<'_, (String, String)> {
        Scan::new(self, key, page_size, |store, key, cursor, size| {
            store.scan_hash_page(key, cursor, size)
        })
    }

    /// Lazy member sequence over a sorted set, fetched a page at a time.
    pub fn scan_sorted(&self, key: &str, page_size: usize) -> Scan<'_, String> {
        Scan::new(self, key, page_size, |store, key, cursor, size| {
            store.scan_sorted_page(key, cursor, size)
        })
    }
}

type PageFetch<T> = fn(&dyn Store, &str, u64, usize) -> StoreResult<ScanPage<T>>;

/// Iterator over a cursor scan.
///
/// Each page is an independent store call, so a scan interrupted by an error
/// can be restarted from the last cursor it reached (see [`Scan::cursor`]).
/// Entries written concurrently may be seen twice or not at all, as with any
/// cursor scan.
pub struct Scan<'a, T> {
    store: &'a dyn Store,
    key: String,
    page_size: usize,
    cursor: u64,
    started: bool,
    finished: bool,
    buffer: VecDeque<T>,
    fetch: PageFetch<T>,
}

impl<'a, T> Scan<'a, T> {
    fn new(store: &'a dyn Store, key: &str, page_size: usize, fetch: PageFetch<T>) -> Self {
        Self {
            store,
            key: key.to_string(),
            page_size: page_size.max(1),
            cursor: 0,
            started: false,
            finished: false,
            buffer: VecDeque::new(),
            fetch,
        }
    }

    /// Cursor of the next page to fetch.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }
}

impl<T> Iterator for Scan<'_, T> {
    type Item = StoreResult<T>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.buffer.pop_front() {
                return Some(Ok(item));
            }
            if self.finished || (self.started && self.cursor == 0) {
                return None;
            }

            match (self.fetch)(self.store, &self.key, self.cursor, self.page_size) {
                Ok(page) => {
                    self.started = true;
                    self.cursor = page.cursor;
                    self.buffer.extend(page.items);
                }
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_builder_records_ops_in_order() {
        let mut b = WriteBatch::new();
        b.set_fields("h", vec![("a".into(), "1".into())])
            .increment_field("h", "n", 2)
            .push_list("l", "x")
            .push_sorted("z", "m", 9.0)
            .delete_key("gone");

        assert_eq!(b.len(), 5);
        assert!(matches!(b.ops()[0], WriteOp::SetFields { .. }));
        assert!(matches!(b.ops()[4], WriteOp::DeleteKey { .. }));
    }

    #[test]
    fn scan_walks_every_page() {
        let store: SharedStore = Arc::new(InMemoryStore::new());
        for i in 0..25 {
            store.push_sorted("z", &format!("m{i:02}"), 1.0).unwrap();
        }

        let members: Vec<String> = store
            .scan_sorted("z", 10)
            .collect::<StoreResult<_>>()
            .unwrap();

        assert_eq!(members.len(), 25);
        assert_eq!(members.first().map(String::as_str), Some("m00"));
        assert_eq!(members.last().map(String::as_str), Some("m24"));
    }

    #[test]
    fn scan_of_missing_key_is_empty() {
        let store: SharedStore = Arc::new(InMemoryStore::new());
        assert_eq!(store.scan_hash("nope", 10).count(), 0);
    }

    #[test]
    fn empty_batch_is_skipped() {
        let store: SharedStore = Arc::new(InMemoryStore::new());
        store.batch(|_| {}).unwrap();
    }
}
