//! Redis-backed store.
//!
//! One `RedisStore` owns one synchronous connection. Blocking pops hold that
//! connection for their whole timeout, so every watcher (and the archival
//! sink) should get its own handle rather than share one.
//!
//! ## Reconnects
//!
//! Before each command the cached connection is checked with `PING`. A dead
//! or missing connection is re-established in a loop with a fixed backoff, and
//! a command that fails with a connection-class error is re-issued on the new
//! connection. When the server applied a command but its reply was lost:
//! - writes run twice: `HINCRBY` over-counts, `RPUSH` duplicates a log entry,
//!   while `HSET`, `ZADD`, `ZREM`, `LREM` and `DEL` are unaffected;
//! - pops (`BZPOPMIN`, `ZPOPMIN`, `LPOP`) lose the popped items, which left
//!   the queue or log but never reached the caller; `LMOVE` leaves them in
//!   the target list without the caller knowing.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use redis::{Client, Connection, IntoConnectionInfo, RedisError, RedisResult};
use tracing::{info, warn};

use super::{ScanPage, Store, StoreError, StoreResult, WriteBatch, WriteOp};
use crate::config::StoreConfig;

/// `BZPOPMIN 0` blocks forever; never send less than this.
const MIN_BLOCKING_TIMEOUT: Duration = Duration::from_millis(10);

pub struct RedisStore {
    client: Client,
    conn: Mutex<Option<Connection>>,
    reconnect_backoff: Duration,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("addr", &self.client.get_connection_info().addr)
            .field("reconnect_backoff", &self.reconnect_backoff)
            .finish()
    }
}

/// Accept both `host:port` and full `redis://` URLs.
fn normalize_url(url: &str) -> String {
    if url.contains("://") {
        url.to_string()
    } else {
        format!("redis://{url}")
    }
}

fn is_connectivity(err: &RedisError) -> bool {
    err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout()
}

fn classify(err: RedisError, key: &str) -> StoreError {
    if err.code() == Some("WRONGTYPE") {
        StoreError::WrongType {
            key: key.to_string(),
        }
    } else {
        StoreError::Command(err.to_string())
    }
}

impl RedisStore {
    /// Build a handle. No connection is made until the first command.
    pub fn open(config: &StoreConfig) -> StoreResult<Self> {
        let mut info = normalize_url(&config.url)
            .into_connection_info()
            .map_err(|e| StoreError::Config(e.to_string()))?;
        if let Some(password) = config.password.as_ref().filter(|p| !p.is_empty()) {
            info.redis.password = Some(password.clone());
        }

        let client = Client::open(info).map_err(|e| StoreError::Config(e.to_string()))?;

        Ok(Self {
            client,
            conn: Mutex::new(None),
            reconnect_backoff: config.reconnect_backoff(),
        })
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Option<Connection>>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Backend("redis connection lock poisoned".to_string()))
    }

    /// Block until the server accepts a connection.
    fn connect_blocking(&self) -> Connection {
        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            match self.client.get_connection() {
                Ok(conn) => {
                    if attempt > 1 {
                        info!(attempt, "redis connection re-established");
                    }
                    return conn;
                }
                Err(e) => {
                    warn!(
                        attempt,
                        error = %e,
                        backoff_ms = self.reconnect_backoff.as_millis() as u64,
                        "redis unreachable; retrying"
                    );
                    thread::sleep(self.reconnect_backoff);
                }
            }
        }
    }

    fn live_connection<'g>(&self, slot: &'g mut Option<Connection>) -> &'g mut Connection {
        let alive = slot
            .as_mut()
            .is_some_and(|c| redis::cmd("PING").query::<String>(c).is_ok());
        if !alive {
            *slot = None;
        }
        slot.get_or_insert_with(|| self.connect_blocking())
    }

    /// Run `op` on a live connection, reconnecting and re-issuing it on
    /// connection loss. `key` is only used for error reporting.
    fn with_conn<T>(
        &self,
        key: &str,
        mut op: impl FnMut(&mut Connection) -> RedisResult<T>,
    ) -> StoreResult<T> {
        let mut guard = self.lock()?;
        loop {
            let conn = self.live_connection(&mut guard);
            match op(conn) {
                Ok(value) => return Ok(value),
                Err(e) if is_connectivity(&e) => {
                    warn!(key, error = %e, "redis connection lost mid-command; reconnecting");
                    *guard = None;
                }
                Err(e) => return Err(classify(e, key)),
            }
        }
    }
}

impl Store for RedisStore {
    fn get_field(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        self.with_conn(key, |c| redis::cmd("HGET").arg(key).arg(field).query(c))
    }

    fn get_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        self.with_conn(key, |c| redis::cmd("HGETALL").arg(key).query(c))
    }

    fn exists(&self, key: &str) -> StoreResult<bool> {
        self.with_conn(key, |c| redis::cmd("EXISTS").arg(key).query(c))
    }

    fn set_fields(&self, key: &str, fields: &[(String, String)]) -> StoreResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        self.with_conn(key, |c| {
            let mut cmd = redis::cmd("HSET");
            cmd.arg(key);
            for (field, value) in fields {
                cmd.arg(field).arg(value);
            }
            cmd.query(c)
        })
    }

    fn increment_field(&self, key: &str, field: &str, by: i64) -> StoreResult<i64> {
        self.with_conn(key, |c| {
            redis::cmd("HINCRBY").arg(key).arg(field).arg(by).query(c)
        })
    }

    fn delete_key(&self, key: &str) -> StoreResult<()> {
        self.with_conn(key, |c| redis::cmd("DEL").arg(key).query(c))
    }

    fn remove_list_entry(&self, key: &str, value: &str) -> StoreResult<()> {
        self.with_conn(key, |c| redis::cmd("LREM").arg(key).arg(0).arg(value).query(c))
    }

    fn push_list(&self, key: &str, value: &str) -> StoreResult<()> {
        self.with_conn(key, |c| redis::cmd("RPUSH").arg(key).arg(value).query(c))
    }

    fn pop_list(&self, key: &str, target: Option<&str>, count: usize) -> StoreResult<Vec<String>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        match target {
            // One LMOVE per item: a reconnect can only ever repeat one move.
            Some(target) => {
                let mut moved = Vec::new();
                for _ in 0..count {
                    let item: Option<String> = self.with_conn(key, |c| {
                        redis::cmd("LMOVE")
                            .arg(key)
                            .arg(target)
                            .arg("LEFT")
                            .arg("RIGHT")
                            .query(c)
                    })?;
                    match item {
                        Some(item) => moved.push(item),
                        None => break,
                    }
                }
                Ok(moved)
            }
            None => {
                let items: Option<Vec<String>> = self.with_conn(key, |c| {
                    redis::cmd("LPOP").arg(key).arg(count).query(c)
                })?;
                Ok(items.unwrap_or_default())
            }
        }
    }

    fn list_range(&self, key: &str) -> StoreResult<Vec<String>> {
        self.with_conn(key, |c| redis::cmd("LRANGE").arg(key).arg(0).arg(-1).query(c))
    }

    fn push_sorted(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
        self.with_conn(key, |c| {
            redis::cmd("ZADD").arg(key).arg(score).arg(member).query(c)
        })
    }

    fn pop_min_blocking(&self, key: &str, timeout: Duration) -> StoreResult<Option<String>> {
        let secs = timeout.max(MIN_BLOCKING_TIMEOUT).as_secs_f64();
        let popped: Option<(String, String, String)> = self.with_conn(key, |c| {
            redis::cmd("BZPOPMIN").arg(key).arg(secs).query(c)
        })?;
        Ok(popped.map(|(_key, member, _score)| member))
    }

    fn pop_min(&self, key: &str, count: usize) -> StoreResult<Vec<String>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        // Reply alternates member, score.
        let flat: Vec<String> = self.with_conn(key, |c| {
            redis::cmd("ZPOPMIN").arg(key).arg(count).query(c)
        })?;
        Ok(flat.into_iter().step_by(2).collect())
    }

    fn remove_sorted(&self, key: &str, member: &str) -> StoreResult<()> {
        self.with_conn(key, |c| redis::cmd("ZREM").arg(key).arg(member).query(c))
    }

    fn contains_sorted(&self, key: &str, member: &str) -> StoreResult<bool> {
        let score: Option<String> =
            self.with_conn(key, |c| redis::cmd("ZSCORE").arg(key).arg(member).query(c))?;
        Ok(score.is_some())
    }

    fn scan_hash_page(
        &self,
        key: &str,
        cursor: u64,
        page_size: usize,
    ) -> StoreResult<ScanPage<(String, String)>> {
        let (next, flat): (u64, Vec<String>) = self.with_conn(key, |c| {
            redis::cmd("HSCAN")
                .arg(key)
                .arg(cursor)
                .arg("COUNT")
                .arg(page_size)
                .query(c)
        })?;

        let mut items = Vec::with_capacity(flat.len() / 2);
        let mut parts = flat.into_iter();
        while let (Some(field), Some(value)) = (parts.next(), parts.next()) {
            items.push((field, value));
        }
        Ok(ScanPage {
            cursor: next,
            items,
        })
    }

    fn scan_sorted_page(
        &self,
        key: &str,
        cursor: u64,
        page_size: usize,
    ) -> StoreResult<ScanPage<String>> {
        let (next, flat): (u64, Vec<String>) = self.with_conn(key, |c| {
            redis::cmd("ZSCAN")
                .arg(key)
                .arg(cursor)
                .arg("COUNT")
                .arg(page_size)
                .query(c)
        })?;
        Ok(ScanPage {
            cursor: next,
            items: flat.into_iter().step_by(2).collect(),
        })
    }

    fn apply_batch(&self, batch: WriteBatch) -> StoreResult<()> {
        if batch.is_empty() {
            return Ok(());
        }

        // Plain pipeline, not MULTI: writes are sent together but applied
        // independently.
        let mut pipe = redis::pipe();
        for op in batch.ops() {
            match op {
                WriteOp::SetFields { key, fields } => {
                    if fields.is_empty() {
                        continue;
                    }
                    let cmd = pipe.cmd("HSET").arg(key);
                    for (field, value) in fields {
                        cmd.arg(field).arg(value);
                    }
                    cmd.ignore();
                }
                WriteOp::IncrementField { key, field, by } => {
                    pipe.cmd("HINCRBY").arg(key).arg(field).arg(*by).ignore();
                }
                WriteOp::DeleteKey { key } => {
                    pipe.cmd("DEL").arg(key).ignore();
                }
                WriteOp::PushList { key, value } => {
                    pipe.cmd("RPUSH").arg(key).arg(value).ignore();
                }
                WriteOp::PushSorted { key, member, score } => {
                    pipe.cmd("ZADD").arg(key).arg(*score).arg(member).ignore();
                }
            }
        }

        self.with_conn("<batch>", |c| pipe.query::<()>(c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_host_port_gets_a_scheme() {
        assert_eq!(normalize_url("localhost:6379"), "redis://localhost:6379");
        assert_eq!(
            normalize_url("redis://cache:6380/2"),
            "redis://cache:6380/2"
        );
    }

    #[test]
    fn open_applies_password_without_connecting() {
        let config = StoreConfig {
            url: "localhost:6379".to_string(),
            password: Some("hunter2".to_string()),
            ..StoreConfig::default()
        };
        let store = RedisStore::open(&config).unwrap();
        assert_eq!(
            store.client.get_connection_info().redis.password.as_deref(),
            Some("hunter2")
        );
    }

    #[test]
    fn open_rejects_garbage_url() {
        let config = StoreConfig {
            url: "http://not-redis".to_string(),
            ..StoreConfig::default()
        };
        assert!(matches!(
            RedisStore::open(&config),
            Err(StoreError::Config(_))
        ));
    }
}
