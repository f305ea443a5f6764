//! In-memory store for tests/dev.
//!
//! Mirrors the Redis semantics the routing engine relies on:
//! - collections disappear once emptied (so `exists` tracks them)
//! - using a key as the wrong type fails with [`StoreError::WrongType`]
//! - sorted-set ties are broken by member order
//! - blocking pops wait on a condition variable until a write arrives

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::{ScanPage, Store, StoreError, StoreResult, WriteBatch, WriteOp};

#[derive(Debug)]
enum Entry {
    Hash(HashMap<String, String>),
    List(VecDeque<String>),
    Sorted(BTreeMap<String, f64>),
}

impl Entry {
    fn is_empty(&self) -> bool {
        match self {
            Entry::Hash(h) => h.is_empty(),
            Entry::List(l) => l.is_empty(),
            Entry::Sorted(z) => z.is_empty(),
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    keys: HashMap<String, Entry>,
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::WrongType {
        key: key.to_string(),
    }
}

impl MemoryState {
    fn hash(&self, key: &str) -> StoreResult<Option<&HashMap<String, String>>> {
        match self.keys.get(key) {
            None => Ok(None),
            Some(Entry::Hash(h)) => Ok(Some(h)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn hash_mut(&mut self, key: &str) -> StoreResult<&mut HashMap<String, String>> {
        match self
            .keys
            .entry(key.to_string())
            .or_insert_with(|| Entry::Hash(HashMap::new()))
        {
            Entry::Hash(h) => Ok(h),
            _ => Err(wrong_type(key)),
        }
    }

    fn list(&self, key: &str) -> StoreResult<Option<&VecDeque<String>>> {
        match self.keys.get(key) {
            None => Ok(None),
            Some(Entry::List(l)) => Ok(Some(l)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn list_mut(&mut self, key: &str) -> StoreResult<&mut VecDeque<String>> {
        match self
            .keys
            .entry(key.to_string())
            .or_insert_with(|| Entry::List(VecDeque::new()))
        {
            Entry::List(l) => Ok(l),
            _ => Err(wrong_type(key)),
        }
    }

    fn sorted(&self, key: &str) -> StoreResult<Option<&BTreeMap<String, f64>>> {
        match self.keys.get(key) {
            None => Ok(None),
            Some(Entry::Sorted(z)) => Ok(Some(z)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn sorted_mut(&mut self, key: &str) -> StoreResult<&mut BTreeMap<String, f64>> {
        match self
            .keys
            .entry(key.to_string())
            .or_insert_with(|| Entry::Sorted(BTreeMap::new()))
        {
            Entry::Sorted(z) => Ok(z),
            _ => Err(wrong_type(key)),
        }
    }

    /// Drop `key` if its collection is empty.
    fn prune(&mut self, key: &str) {
        if self.keys.get(key).is_some_and(Entry::is_empty) {
            self.keys.remove(key);
        }
    }

    fn set_fields(&mut self, key: &str, fields: &[(String, String)]) -> StoreResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let hash = self.hash_mut(key)?;
        for (f, v) in fields {
            hash.insert(f.clone(), v.clone());
        }
        Ok(())
    }

    fn increment_field(&mut self, key: &str, field: &str, by: i64) -> StoreResult<i64> {
        let result = (|| {
            let hash = self.hash_mut(key)?;
            let current = match hash.get(field) {
                None => 0,
                Some(raw) => raw.parse::<i64>().map_err(|_| {
                    StoreError::Command(format!("hash value `{raw}` is not an integer"))
                })?,
            };
            let next = current + by;
            hash.insert(field.to_string(), next.to_string());
            Ok(next)
        })();
        self.prune(key);
        result
    }

    fn push_list(&mut self, key: &str, value: &str) -> StoreResult<()> {
        self.list_mut(key)?.push_back(value.to_string());
        Ok(())
    }

    fn push_sorted(&mut self, key: &str, member: &str, score: f64) -> StoreResult<()> {
        self.sorted_mut(key)?.insert(member.to_string(), score);
        Ok(())
    }

    fn pop_min_one(&mut self, key: &str) -> StoreResult<Option<String>> {
        let Some(set) = self.sorted(key)? else {
            return Ok(None);
        };

        let mut best: Option<(&String, f64)> = None;
        for (member, score) in set {
            match best {
                Some((_, s)) if score.total_cmp(&s).is_ge() => {}
                _ => best = Some((member, *score)),
            }
        }

        let Some(member) = best.map(|(m, _)| m.clone()) else {
            return Ok(None);
        };

        self.sorted_mut(key)?.remove(&member);
        self.prune(key);
        Ok(Some(member))
    }

    fn apply(&mut self, op: &WriteOp) -> StoreResult<()> {
        match op {
            WriteOp::SetFields { key, fields } => self.set_fields(key, fields),
            WriteOp::IncrementField { key, field, by } => {
                self.increment_field(key, field, *by).map(|_| ())
            }
            WriteOp::DeleteKey { key } => {
                self.keys.remove(key);
                Ok(())
            }
            WriteOp::PushList { key, value } => self.push_list(key, value),
            WriteOp::PushSorted { key, member, score } => self.push_sorted(key, member, *score),
        }
    }
}

/// In-memory [`Store`] for tests and local development.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<MemoryState>,
    changed: Condvar,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| StoreError::Backend("in-memory store lock poisoned".to_string()))
    }

    /// Run a write and wake any blocked poppers.
    fn write<T>(&self, f: impl FnOnce(&mut MemoryState) -> StoreResult<T>) -> StoreResult<T> {
        let result = {
            let mut state = self.lock()?;
            f(&mut state)
        };
        self.changed.notify_all();
        result
    }
}

impl Store for InMemoryStore {
    fn get_field(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        let state = self.lock()?;
        Ok(state.hash(key)?.and_then(|h| h.get(field).cloned()))
    }

    fn get_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let state = self.lock()?;
        Ok(state.hash(key)?.cloned().unwrap_or_default())
    }

    fn exists(&self, key: &str) -> StoreResult<bool> {
        Ok(self.lock()?.keys.contains_key(key))
    }

    fn set_fields(&self, key: &str, fields: &[(String, String)]) -> StoreResult<()> {
        self.write(|s| s.set_fields(key, fields))
    }

    fn increment_field(&self, key: &str, field: &str, by: i64) -> StoreResult<i64> {
        self.write(|s| s.increment_field(key, field, by))
    }

    fn delete_key(&self, key: &str) -> StoreResult<()> {
        self.write(|s| {
            s.keys.remove(key);
            Ok(())
        })
    }

    fn remove_list_entry(&self, key: &str, value: &str) -> StoreResult<()> {
        self.write(|s| {
            if s.list(key)?.is_none() {
                return Ok(());
            }
            s.list_mut(key)?.retain(|v| v != value);
            s.prune(key);
            Ok(())
        })
    }

    fn push_list(&self, key: &str, value: &str) -> StoreResult<()> {
        self.write(|s| s.push_list(key, value))
    }

    fn pop_list(&self, key: &str, target: Option<&str>, count: usize) -> StoreResult<Vec<String>> {
        self.write(|s| {
            let mut items = Vec::new();
            if let Some(target) = target {
                // Type-check the target before moving anything into it.
                s.list(target)?;
            }
            for _ in 0..count {
                if s.list(key)?.is_none() {
                    break;
                }
                let Some(item) = s.list_mut(key)?.pop_front() else {
                    break;
                };
                s.prune(key);
                if let Some(target) = target {
                    s.push_list(target, &item)?;
                }
                items.push(item);
            }
            Ok(items)
        })
    }

    fn list_range(&self, key: &str) -> StoreResult<Vec<String>> {
        let state = self.lock()?;
        Ok(state
            .list(key)?
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn push_sorted(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
        self.write(|s| s.push_sorted(key, member, score))
    }

    fn pop_min_blocking(&self, key: &str, timeout: Duration) -> StoreResult<Option<String>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock()?;
        loop {
            if let Some(member) = state.pop_min_one(key)? {
                return Ok(Some(member));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let (guard, _) = self
                .changed
                .wait_timeout(state, deadline - now)
                .map_err(|_| StoreError::Backend("in-memory store lock poisoned".to_string()))?;
            state = guard;
        }
    }

    fn pop_min(&self, key: &str, count: usize) -> StoreResult<Vec<String>> {
        let mut state = self.lock()?;
        let mut members = Vec::new();
        for _ in 0..count {
            match state.pop_min_one(key)? {
                Some(m) => members.push(m),
                None => break,
            }
        }
        Ok(members)
    }

    fn remove_sorted(&self, key: &str, member: &str) -> StoreResult<()> {
        self.write(|s| {
            if s.sorted(key)?.is_none() {
                return Ok(());
            }
            s.sorted_mut(key)?.remove(member);
            s.prune(key);
            Ok(())
        })
    }

    fn contains_sorted(&self, key: &str, member: &str) -> StoreResult<bool> {
        let state = self.lock()?;
        Ok(state.sorted(key)?.is_some_and(|z| z.contains_key(member)))
    }

    fn scan_hash_page(
        &self,
        key: &str,
        cursor: u64,
        page_size: usize,
    ) -> StoreResult<ScanPage<(String, String)>> {
        let state = self.lock()?;
        let mut fields: Vec<(String, String)> = state
            .hash(key)?
            .map(|h| h.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        fields.sort();
        Ok(page_of(fields, cursor, page_size))
    }

    fn scan_sorted_page(
        &self,
        key: &str,
        cursor: u64,
        page_size: usize,
    ) -> StoreResult<ScanPage<String>> {
        let state = self.lock()?;
        let members: Vec<String> = state
            .sorted(key)?
            .map(|z| z.keys().cloned().collect())
            .unwrap_or_default();
        Ok(page_of(members, cursor, page_size))
    }

    fn apply_batch(&self, batch: WriteBatch) -> StoreResult<()> {
        self.write(|s| {
            // Like a pipeline: every op runs, the first failure is reported.
            let mut first_err = None;
            for op in batch.ops() {
                if let Err(e) = s.apply(op) {
                    first_err.get_or_insert(e);
                }
            }
            first_err.map_or(Ok(()), Err)
        })
    }
}

/// Offset-cursor paging over a snapshot of the collection.
fn page_of<T>(items: Vec<T>, cursor: u64, page_size: usize) -> ScanPage<T> {
    let start = usize::try_from(cursor).unwrap_or(usize::MAX).min(items.len());
    let end = start.saturating_add(page_size.max(1)).min(items.len());
    let next = if end >= items.len() { 0 } else { end as u64 };
    ScanPage {
        cursor: next,
        items: items.into_iter().skip(start).take(end - start).collect(),
    }
}
