//! Archival sink: drains the command log into the snapshot store.
//!
//! `sync` entries snapshot the job and then finish the route the watcher
//! deferred; `route` entries only finish the route; `delete` entries drop the
//! snapshot. The system commands `empty` and `print` clear and report the
//! archival bucket. Entries are popped before they are applied, so an entry
//! whose application fails is logged and lost.

use std::sync::mpsc::{self, TryRecvError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use switchyard_core::command::CommandEntry;
use switchyard_core::keys::{ARCHIVE_BUCKET, COMMAND_LOG_KEY, job_key};
use switchyard_core::record::FIELD_CHANNEL;
use switchyard_core::{ChannelName, CommandKind, JobId};

use super::snapshot_store::{SnapshotError, SnapshotStore};
use crate::channel::{ChannelError, Channels};
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error("failed to encode snapshot: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkConfig {
    /// Log entries popped per drain.
    pub batch_size: usize,
    /// Sleep when the log is empty or unreadable.
    pub poll_interval: Duration,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            poll_interval: Duration::from_millis(250),
        }
    }
}

/// Counts for one drain, or accumulated over a sink's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub drained: u64,
    pub synced: u64,
    pub routed: u64,
    pub deleted: u64,
    /// `empty` / `print` entries.
    pub system: u64,
    /// Malformed, unrecognized or unparsable entries.
    pub ignored: u64,
    pub failed: u64,
}

impl DrainReport {
    pub fn absorb(&mut self, other: &DrainReport) {
        self.drained += other.drained;
        self.synced += other.synced;
        self.routed += other.routed;
        self.deleted += other.deleted;
        self.system += other.system;
        self.ignored += other.ignored;
        self.failed += other.failed;
    }
}

enum Applied {
    Synced,
    Routed,
    Deleted,
    System,
    Ignored,
}

/// Handle to control a running sink.
#[derive(Debug)]
pub struct SinkHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    totals: Arc<Mutex<DrainReport>>,
}

impl SinkHandle {
    /// Request shutdown and wait for the current drain to finish.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    pub fn totals(&self) -> DrainReport {
        self.totals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

pub struct ArchivalSink {
    channels: Channels,
    snapshots: Arc<dyn SnapshotStore>,
    bucket: String,
    config: SinkConfig,
}

impl ArchivalSink {
    pub fn new(channels: Channels, snapshots: Arc<dyn SnapshotStore>, config: SinkConfig) -> Self {
        Self {
            channels,
            snapshots,
            bucket: ARCHIVE_BUCKET.to_string(),
            config,
        }
    }

    pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = bucket.into();
        self
    }

    /// Pop and apply up to one batch of log entries.
    pub fn drain_once(&self) -> Result<DrainReport, SinkError> {
        let entries = self
            .channels
            .store()
            .pop_list(COMMAND_LOG_KEY, None, self.config.batch_size)?;

        let mut report = DrainReport::default();
        for raw in entries {
            report.drained += 1;
            match self.apply(&raw) {
                Ok(Applied::Synced) => report.synced += 1,
                Ok(Applied::Routed) => report.routed += 1,
                Ok(Applied::Deleted) => report.deleted += 1,
                Ok(Applied::System) => report.system += 1,
                Ok(Applied::Ignored) => report.ignored += 1,
                Err(e) => {
                    error!(entry = %raw, error = %e, "failed to apply command log entry");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    fn apply(&self, raw: &str) -> Result<Applied, SinkError> {
        let entry = CommandEntry::decode(raw);
        if entry.is_sentinel() {
            warn!(entry = %raw, job_id = %entry.id, channel = %entry.channel, "malformed command log entry");
            return Ok(Applied::Ignored);
        }

        match &entry.command {
            CommandKind::Empty => {
                let dropped = self.snapshots.count(&self.bucket)?;
                self.snapshots.clear(&self.bucket)?;
                info!(bucket = %self.bucket, dropped, "emptied archival bucket");
                return Ok(Applied::System);
            }
            CommandKind::Print => {
                let count = self.snapshots.count(&self.bucket)?;
                info!(bucket = %self.bucket, count, "archival bucket size");
                return Ok(Applied::System);
            }
            _ => {}
        }

        let Ok(id) = JobId::new(entry.id.as_str()) else {
            warn!(entry = %raw, "command log entry has an invalid job id");
            return Ok(Applied::Ignored);
        };

        match &entry.command {
            CommandKind::Delete => {
                self.snapshots.delete(&self.bucket, id.as_str())?;
                debug!(job_id = %id, "dropped snapshot");
                Ok(Applied::Deleted)
            }
            CommandKind::Sync => {
                let Some(channel) = self.target(&entry, raw) else {
                    return Ok(Applied::Ignored);
                };
                self.snapshot(&id, &channel)?;
                self.channels.complete_route(&id, &channel)?;
                debug!(job_id = %id, channel = %channel, "synced job");
                Ok(Applied::Synced)
            }
            CommandKind::Route => {
                let Some(channel) = self.target(&entry, raw) else {
                    return Ok(Applied::Ignored);
                };
                self.channels.complete_route(&id, &channel)?;
                Ok(Applied::Routed)
            }
            CommandKind::Empty | CommandKind::Print => Ok(Applied::System),
            CommandKind::Unrecognized(command) => {
                warn!(entry = %raw, command = %command, "ignoring unrecognized command");
                Ok(Applied::Ignored)
            }
        }
    }

    fn target(&self, entry: &CommandEntry, raw: &str) -> Option<ChannelName> {
        match ChannelName::new(entry.channel.as_str()) {
            Ok(channel) => Some(channel),
            Err(e) => {
                warn!(entry = %raw, error = %e, "command log entry has an invalid channel");
                None
            }
        }
    }

    /// Point the record at `channel` and archive it. An absent record gets
    /// the channel field only and no snapshot.
    fn snapshot(&self, id: &JobId, channel: &ChannelName) -> Result<(), SinkError> {
        self.channels.store().set_fields(
            &job_key(id),
            &[(FIELD_CHANNEL.to_string(), channel.to_string())],
        )?;

        if let Some(record) = self.channels.load_record(id)? {
            let json = serde_json::to_string(&record)?;
            self.snapshots.put(&self.bucket, id.as_str(), &json)?;
        }
        Ok(())
    }

    /// Drain until a shutdown signal arrives or its sender is dropped.
    pub fn run(self, shutdown_rx: mpsc::Receiver<()>, totals: Arc<Mutex<DrainReport>>) {
        info!(bucket = %self.bucket, "archival sink started");

        loop {
            match shutdown_rx.try_recv() {
                Ok(()) | Err(TryRecvError::Disconnected) => break,
                Err(TryRecvError::Empty) => {}
            }

            match self.drain_once() {
                Ok(report) if report.drained > 0 => {
                    totals
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .absorb(&report);
                }
                Ok(_) => thread::sleep(self.config.poll_interval),
                Err(e) => {
                    error!(error = %e, "failed to read command log");
                    thread::sleep(self.config.poll_interval);
                }
            }
        }

        info!("archival sink stopped");
    }

    /// Run the drain loop on a background thread.
    pub fn spawn(self) -> SinkHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let totals = Arc::new(Mutex::new(DrainReport::default()));
        let totals_clone = totals.clone();

        let join = thread::Builder::new()
            .name("archival-sink".to_string())
            .spawn(move || self.run(shutdown_rx, totals_clone))
            .expect("failed to spawn archival sink thread");

        SinkHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            totals,
        }
    }
}
