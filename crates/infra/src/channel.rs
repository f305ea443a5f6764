//! Channels: named job queues with status counters and a pause flag.
//!
//! A channel is three store keys: a sorted-set queue of job ids, a status
//! hash (`name`, `appended`, `routed`, `created`, `is_paused`) and a working
//! set list holding ids claimed by watchers and still in flight.
//!
//! Two sequences here are deliberately not atomic:
//! - status creation is check-then-create; two producers racing on a new
//!   channel both write the initial hash (same values, counters reset once).
//! - claim pops from the queue, then appends to the working set; a crash in
//!   between loses track of the popped ids. A store error in between puts
//!   the untracked ids back on the queue.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use switchyard_core::command::CommandEntry;
use switchyard_core::keys::{
    CHANNEL_REGISTRY_KEY, COMMAND_LOG_KEY, channel_queue_key, channel_status_key, job_key,
    working_set_key,
};
use switchyard_core::record::{FIELD_CHANNEL, FIELD_CREATED, FIELD_ID};
use switchyard_core::{ChannelName, DomainError, FieldValue, JobId, JobRecord, encode_fields};

use crate::store::{SharedStore, Store, StoreError};

/// Score used for every queue entry under [`QueuePriority::Constant`].
pub const CONSTANT_SCORE: f64 = 9.0;

const STATUS_NAME: &str = "name";
const STATUS_APPENDED: &str = "appended";
const STATUS_ROUTED: &str = "routed";
const STATUS_CREATED: &str = "created";
const STATUS_PAUSED: &str = "is_paused";

const REGISTRY_PAGE: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel `{0}` does not exist")]
    ChannelMissing(ChannelName),

    #[error("channel `{0}` is paused")]
    ChannelPaused(ChannelName),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Domain(#[from] DomainError),
}

pub type ChannelResult<T> = Result<T, ChannelError>;

/// How queue scores are assigned on enqueue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuePriority {
    /// Every entry gets the same score: claim order among waiting jobs is
    /// whatever the store uses to break ties.
    #[default]
    Constant,
    /// Score is the enqueue time in unix milliseconds: FIFO across producers,
    /// up to their clock skew.
    EnqueueTime,
}

impl QueuePriority {
    fn score(self) -> f64 {
        match self {
            QueuePriority::Constant => CONSTANT_SCORE,
            QueuePriority::EnqueueTime => Utc::now().timestamp_millis() as f64,
        }
    }
}

/// Decoded status hash of a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelStatus {
    pub name: String,
    pub appended: i64,
    pub routed: i64,
    pub created: DateTime<Utc>,
    pub paused: bool,
}

impl ChannelStatus {
    fn from_hash(hash: HashMap<String, String>) -> Self {
        let record = JobRecord::from(hash);
        Self {
            name: record.string(STATUS_NAME).to_string(),
            appended: record.int(STATUS_APPENDED),
            routed: record.int(STATUS_ROUTED),
            created: record.time(STATUS_CREATED),
            paused: record.bool(STATUS_PAUSED),
        }
    }
}

/// Channel operations over a shared store handle.
#[derive(Clone)]
pub struct Channels {
    store: SharedStore,
    priority: QueuePriority,
}

impl std::fmt::Debug for Channels {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channels")
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

impl Channels {
    pub fn new(store: SharedStore) -> Self {
        Self::with_priority(store, QueuePriority::default())
    }

    pub fn with_priority(store: SharedStore, priority: QueuePriority) -> Self {
        Self { store, priority }
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    pub fn shared_store(&self) -> SharedStore {
        self.store.clone()
    }

    /// Create the status hash of `name` unless it already exists.
    pub fn ensure_status(&self, name: &ChannelName) -> ChannelResult<()> {
        let key = channel_status_key(name);
        if self.store.exists(&key)? {
            return Ok(());
        }

        let now = Utc::now();
        self.store.set_fields(
            &key,
            &encode_fields([
                (STATUS_NAME, FieldValue::from(name.as_str())),
                (STATUS_APPENDED, FieldValue::Int(0)),
                (STATUS_ROUTED, FieldValue::Int(0)),
                (STATUS_CREATED, FieldValue::Time(now)),
                (STATUS_PAUSED, FieldValue::Bool(false)),
            ]),
        )?;
        debug!(channel = %name, "created channel status");
        Ok(())
    }

    /// Status of `name`, `None` if the channel was never referenced.
    pub fn status(&self, name: &ChannelName) -> ChannelResult<Option<ChannelStatus>> {
        let hash = self.store.get_all(&channel_status_key(name))?;
        if hash.is_empty() {
            return Ok(None);
        }
        Ok(Some(ChannelStatus::from_hash(hash)))
    }

    /// Every channel ever enqueued into.
    pub fn list(&self) -> ChannelResult<Vec<ChannelName>> {
        let mut names = Vec::new();
        for member in self.store.scan_sorted(CHANNEL_REGISTRY_KEY, REGISTRY_PAGE) {
            let member = member?;
            match ChannelName::new(member.as_str()) {
                Ok(name) => names.push(name),
                Err(e) => warn!(member = %member, error = %e, "skipping invalid registry entry"),
            }
        }
        Ok(names)
    }

    /// Write the job record and queue `id` in `channel`.
    ///
    /// The record gets `id`, `channel` and `created` (now) on top of the
    /// caller's fields; caller values for those three are ignored.
    pub fn enqueue<K, V>(
        &self,
        channel: &ChannelName,
        id: &JobId,
        fields: impl IntoIterator<Item = (K, V)>,
    ) -> ChannelResult<()>
    where
        K: Into<String>,
        V: Into<FieldValue>,
    {
        self.ensure_status(channel)?;

        let mut record: Vec<(String, String)> = encode_fields(fields)
            .into_iter()
            .filter(|(field, _)| {
                let reserved = matches!(field.as_str(), FIELD_ID | FIELD_CHANNEL | FIELD_CREATED);
                if reserved {
                    debug!(job_id = %id, field = %field, "ignoring reserved field on enqueue");
                }
                !reserved
            })
            .collect();
        record.extend(encode_fields([
            (FIELD_ID, FieldValue::from(id.as_str())),
            (FIELD_CHANNEL, FieldValue::from(channel.as_str())),
            (FIELD_CREATED, FieldValue::Time(Utc::now())),
        ]));

        let score = self.priority.score();
        self.store.batch(|b| {
            b.set_fields(job_key(id), record)
                .push_sorted(channel_queue_key(channel), id.as_str(), score)
                .push_sorted(CHANNEL_REGISTRY_KEY, channel.as_str(), CONSTANT_SCORE)
                .increment_field(channel_status_key(channel), STATUS_APPENDED, 1);
        })?;

        debug!(channel = %channel, job_id = %id, "enqueued job");
        Ok(())
    }

    /// Claim up to `count` ids from `name` into `working_set`.
    ///
    /// Blocks at most `timeout` for the first id, then takes whatever else is
    /// immediately available. An empty result means "poll again".
    pub fn claim(
        &self,
        name: &ChannelName,
        working_set: &str,
        count: usize,
        timeout: std::time::Duration,
    ) -> ChannelResult<Vec<JobId>> {
        let status = self.store.get_all(&channel_status_key(name))?;
        match status.get(STATUS_PAUSED).map(String::as_str) {
            None => return Err(ChannelError::ChannelMissing(name.clone())),
            Some("true") => return Err(ChannelError::ChannelPaused(name.clone())),
            Some(_) => {}
        }

        if count == 0 {
            return Ok(Vec::new());
        }

        let queue = channel_queue_key(name);
        let Some(first) = self.store.pop_min_blocking(&queue, timeout)? else {
            return Ok(Vec::new());
        };
        let mut raw = vec![first];
        if count > 1 {
            raw.extend(self.store.pop_min(&queue, count - 1)?);
        }

        let mut claimed = Vec::with_capacity(raw.len());
        let mut popped = raw.into_iter();
        while let Some(member) = popped.next() {
            let id = match JobId::new(member.as_str()) {
                Ok(id) => id,
                Err(e) => {
                    warn!(channel = %name, member = %member, error = %e, "dropping invalid id from queue");
                    continue;
                }
            };
            if let Err(e) = self.store.push_list(working_set, id.as_str()) {
                let untracked: Vec<String> = std::iter::once(member).chain(popped).collect();
                self.return_to_queue(name, &queue, &untracked);
                // Ids already tracked are still handed out for dispatch.
                if claimed.is_empty() {
                    return Err(e.into());
                }
                warn!(channel = %name, error = %e, claimed = claimed.len(), "claim cut short");
                return Ok(claimed);
            }
            claimed.push(id);
        }
        Ok(claimed)
    }

    fn return_to_queue(&self, name: &ChannelName, queue: &str, members: &[String]) {
        let score = self.priority.score();
        for member in members {
            if let Err(e) = self.store.push_sorted(queue, member, score) {
                error!(channel = %name, member = %member, error = %e, "failed to return claimed id to queue");
            }
        }
    }

    /// Drop `id` from `working_set`.
    pub fn release(&self, working_set: &str, id: &JobId) -> ChannelResult<()> {
        self.store.remove_list_entry(working_set, id.as_str())?;
        Ok(())
    }

    /// Route `id` from `from` into `to`.
    ///
    /// Without field changes the id goes straight into `to`'s queue and the
    /// record's `channel` field is updated. With changes a `sync` entry is
    /// logged instead and the archival sink completes the move. `routed` is
    /// bumped on `to`, and on `from` too when it differs.
    pub fn advance(
        &self,
        id: &JobId,
        from: &ChannelName,
        to: &ChannelName,
        has_changes: bool,
    ) -> ChannelResult<()> {
        self.ensure_status(to)?;

        let score = self.priority.score();
        self.store.batch(|b| {
            if has_changes {
                b.push_list(COMMAND_LOG_KEY, CommandEntry::sync(id.as_str(), to.as_str()).encode());
            } else {
                b.set_fields(
                    job_key(id),
                    vec![(FIELD_CHANNEL.to_string(), to.to_string())],
                )
                .push_sorted(channel_queue_key(to), id.as_str(), score)
                .push_sorted(CHANNEL_REGISTRY_KEY, to.as_str(), CONSTANT_SCORE);
            }
            b.increment_field(channel_status_key(to), STATUS_ROUTED, 1);
            if from != to {
                b.increment_field(channel_status_key(from), STATUS_ROUTED, 1);
            }
        })?;

        debug!(job_id = %id, from = %from, to = %to, deferred = has_changes, "advanced job");
        Ok(())
    }

    /// Remove the job record and log a delete. Safe to repeat.
    pub fn delete(&self, id: &JobId) -> ChannelResult<()> {
        self.store.batch(|b| {
            b.delete_key(job_key(id))
                .push_list(COMMAND_LOG_KEY, CommandEntry::delete(id.as_str()).encode());
        })?;
        debug!(job_id = %id, "deleted job");
        Ok(())
    }

    pub fn pause(&self, name: &ChannelName) -> ChannelResult<()> {
        self.set_paused(name, true)
    }

    pub fn resume(&self, name: &ChannelName) -> ChannelResult<()> {
        self.set_paused(name, false)
    }

    fn set_paused(&self, name: &ChannelName, paused: bool) -> ChannelResult<()> {
        self.ensure_status(name)?;
        self.store.set_fields(
            &channel_status_key(name),
            &encode_fields([(STATUS_PAUSED, paused)]),
        )?;
        info!(channel = %name, paused, "channel pause flag changed");
        Ok(())
    }

    /// The stored record of `id`, `None` if absent.
    pub fn load_record(&self, id: &JobId) -> ChannelResult<Option<JobRecord>> {
        let hash = self.store.get_all(&job_key(id))?;
        if hash.is_empty() {
            return Ok(None);
        }
        Ok(Some(JobRecord::from(hash)))
    }

    /// Queue push only: finishes a route deferred through the command log.
    /// Counters were already bumped by [`Channels::advance`].
    pub fn complete_route(&self, id: &JobId, channel: &ChannelName) -> ChannelResult<()> {
        self.ensure_status(channel)?;
        let score = self.priority.score();
        self.store.batch(|b| {
            b.push_sorted(channel_queue_key(channel), id.as_str(), score)
                .push_sorted(CHANNEL_REGISTRY_KEY, channel.as_str(), CONSTANT_SCORE);
        })?;
        Ok(())
    }

    /// Move every id in `name`'s working set back into its queue.
    ///
    /// There are no claim leases, so this also steals ids from live watchers:
    /// only run it while no watcher is active on the channel.
    pub fn requeue_orphans(&self, name: &ChannelName) -> ChannelResult<Vec<JobId>> {
        let working_set = working_set_key(name);
        let queue = channel_queue_key(name);
        let pending = self.store.list_range(&working_set)?.len();
        let score = self.priority.score();

        let mut requeued = Vec::new();
        for member in self.store.pop_list(&working_set, None, pending)? {
            match JobId::new(member.as_str()) {
                Ok(id) => {
                    self.store.push_sorted(&queue, id.as_str(), score)?;
                    requeued.push(id);
                }
                Err(e) => warn!(channel = %name, member = %member, error = %e, "dropping invalid working-set entry"),
            }
        }

        if !requeued.is_empty() {
            info!(channel = %name, count = requeued.len(), "requeued orphaned claims");
        }
        Ok(requeued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::store::InMemoryStore;

    const WAIT: Duration = Duration::from_millis(20);

    fn channels() -> Channels {
        Channels::new(Arc::new(InMemoryStore::new()))
    }

    fn ch(name: &str) -> ChannelName {
        ChannelName::new(name).unwrap()
    }

    fn job(id: &str) -> JobId {
        JobId::new(id).unwrap()
    }

    const NO_FIELDS: [(&str, &str); 0] = [];

    #[test]
    fn ensure_status_is_idempotent() {
        let c = channels();
        let intake = ch("intake");
        c.ensure_status(&intake).unwrap();
        c.store()
            .increment_field(&channel_status_key(&intake), STATUS_APPENDED, 5)
            .unwrap();
        c.ensure_status(&intake).unwrap();

        let status = c.status(&intake).unwrap().unwrap();
        assert_eq!(status.name, "intake");
        assert_eq!(status.appended, 5);
        assert!(!status.paused);
        assert!(status.created.timestamp() > 0);
    }

    #[test]
    fn enqueue_writes_record_and_counters() {
        let c = channels();
        let intake = ch("intake");
        let before = Utc::now().timestamp();
        c.enqueue(&intake, &job("j1"), [("status", "new"), ("id", "forged")])
            .unwrap();
        let after = Utc::now().timestamp();

        let record = c.load_record(&job("j1")).unwrap().unwrap();
        assert_eq!(record.id(), "j1");
        assert_eq!(record.channel(), "intake");
        assert_eq!(record.string("status"), "new");
        let created = record.created().timestamp();
        assert!(before <= created && created <= after, "{before} <= {created} <= {after}");

        assert_eq!(c.status(&intake).unwrap().unwrap().appended, 1);
        assert_eq!(c.list().unwrap(), vec![intake]);
    }

    #[test]
    fn claim_moves_ids_into_working_set() {
        let c = channels();
        let intake = ch("intake");
        for id in ["a", "b", "c"] {
            c.enqueue(&intake, &job(id), NO_FIELDS).unwrap();
        }

        let claimed = c.claim(&intake, "ws", 2, WAIT).unwrap();
        assert_eq!(claimed, vec![job("a"), job("b")]);
        assert_eq!(c.store().list_range("ws").unwrap(), vec!["a", "b"]);

        c.release("ws", &job("a")).unwrap();
        assert_eq!(c.store().list_range("ws").unwrap(), vec!["b"]);
    }

    #[test]
    fn claim_into_unusable_working_set_returns_ids_to_queue() {
        let c = channels();
        let intake = ch("intake");
        for id in ["a", "b"] {
            c.enqueue(&intake, &job(id), NO_FIELDS).unwrap();
        }
        // A hash under the working-set key rejects list pushes.
        c.store()
            .set_fields("ws", &[("k".to_string(), "v".to_string())])
            .unwrap();

        assert!(matches!(
            c.claim(&intake, "ws", 2, WAIT),
            Err(ChannelError::Store(StoreError::WrongType { .. }))
        ));

        let queue = channel_queue_key(&intake);
        assert!(c.store().contains_sorted(&queue, "a").unwrap());
        assert!(c.store().contains_sorted(&queue, "b").unwrap());
        assert_eq!(c.claim(&intake, "ws2", 2, WAIT).unwrap(), vec![job("a"), job("b")]);
    }

    #[test]
    fn claim_on_empty_channel_returns_nothing() {
        let c = channels();
        let intake = ch("intake");
        c.ensure_status(&intake).unwrap();
        assert!(c.claim(&intake, "ws", 5, WAIT).unwrap().is_empty());
    }

    #[test]
    fn claim_distinguishes_missing_from_paused() {
        let c = channels();
        let intake = ch("intake");
        assert!(matches!(
            c.claim(&intake, "ws", 1, WAIT),
            Err(ChannelError::ChannelMissing(_))
        ));

        c.enqueue(&intake, &job("j1"), NO_FIELDS).unwrap();
        c.pause(&intake).unwrap();
        assert!(matches!(
            c.claim(&intake, "ws", 1, WAIT),
            Err(ChannelError::ChannelPaused(_))
        ));

        c.resume(&intake).unwrap();
        assert_eq!(c.claim(&intake, "ws", 1, WAIT).unwrap(), vec![job("j1")]);
    }

    #[test]
    fn status_hash_without_pause_flag_counts_as_missing() {
        let c = channels();
        let intake = ch("intake");
        c.store()
            .set_fields(
                &channel_status_key(&intake),
                &[("name".to_string(), "intake".to_string())],
            )
            .unwrap();
        assert!(matches!(
            c.claim(&intake, "ws", 1, WAIT),
            Err(ChannelError::ChannelMissing(_))
        ));
    }

    #[test]
    fn advance_without_changes_moves_directly() {
        let c = channels();
        let (intake, done) = (ch("intake"), ch("done"));
        c.enqueue(&intake, &job("j2"), NO_FIELDS).unwrap();
        c.claim(&intake, "ws", 1, WAIT).unwrap();

        c.advance(&job("j2"), &intake, &done, false).unwrap();

        assert!(
            c.store()
                .contains_sorted(&channel_queue_key(&done), "j2")
                .unwrap()
        );
        assert!(!c.store().exists(COMMAND_LOG_KEY).unwrap());
        assert_eq!(c.load_record(&job("j2")).unwrap().unwrap().channel(), "done");
        assert_eq!(c.status(&intake).unwrap().unwrap().routed, 1);
        assert_eq!(c.status(&done).unwrap().unwrap().routed, 1);
    }

    #[test]
    fn advance_with_changes_logs_sync() {
        let c = channels();
        let (intake, done) = (ch("intake"), ch("done"));
        c.enqueue(&intake, &job("j1"), NO_FIELDS).unwrap();

        c.advance(&job("j1"), &intake, &done, true).unwrap();

        assert_eq!(
            c.store().list_range(COMMAND_LOG_KEY).unwrap(),
            vec!["j1|done|sync"]
        );
        assert!(!c.store().exists(&channel_queue_key(&done)).unwrap());
        assert_eq!(c.status(&done).unwrap().unwrap().routed, 1);
    }

    #[test]
    fn advance_to_same_channel_counts_once() {
        let c = channels();
        let intake = ch("intake");
        c.enqueue(&intake, &job("j1"), NO_FIELDS).unwrap();
        c.advance(&job("j1"), &intake, &intake, false).unwrap();
        assert_eq!(c.status(&intake).unwrap().unwrap().routed, 1);
    }

    #[test]
    fn delete_is_idempotent() {
        let c = channels();
        let intake = ch("intake");
        c.enqueue(&intake, &job("j3"), NO_FIELDS).unwrap();

        c.delete(&job("j3")).unwrap();
        c.delete(&job("j3")).unwrap();

        assert_eq!(c.load_record(&job("j3")).unwrap(), None);
        assert_eq!(
            c.store().list_range(COMMAND_LOG_KEY).unwrap(),
            vec!["j3||delete", "j3||delete"]
        );
    }

    #[test]
    fn enqueue_time_priority_is_fifo() {
        let c = Channels::with_priority(Arc::new(InMemoryStore::new()), QueuePriority::EnqueueTime);
        let intake = ch("intake");
        // "z" sorts last by member but is enqueued first.
        c.enqueue(&intake, &job("z"), NO_FIELDS).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        c.enqueue(&intake, &job("a"), NO_FIELDS).unwrap();

        assert_eq!(c.claim(&intake, "ws", 2, WAIT).unwrap(), vec![job("z"), job("a")]);
    }

    #[test]
    fn requeue_orphans_returns_claims_to_queue() {
        let c = channels();
        let intake = ch("intake");
        c.enqueue(&intake, &job("j1"), NO_FIELDS).unwrap();
        let ws = working_set_key(&intake);
        c.claim(&intake, &ws, 1, WAIT).unwrap();

        let requeued = c.requeue_orphans(&intake).unwrap();
        assert_eq!(requeued, vec![job("j1")]);
        assert!(!c.store().exists(&ws).unwrap());
        assert_eq!(c.claim(&intake, &ws, 1, WAIT).unwrap(), vec![job("j1")]);
    }
}
