//! Archival of job snapshots driven by the command log.

pub mod sink;
pub mod snapshot_store;

pub use sink::{ArchivalSink, DrainReport, SinkConfig, SinkError, SinkHandle};
pub use snapshot_store::{
    InMemorySnapshotStore, SnapshotError, SnapshotResult, SnapshotStore, SqliteSnapshotStore,
};
