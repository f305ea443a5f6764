//! Shared state of the admin surface.
//!
//! Store and snapshot calls are blocking, so handlers run them on the
//! blocking pool through [`AppServices::run`].

use std::sync::Arc;

use switchyard_core::DomainError;
use switchyard_core::keys::ARCHIVE_BUCKET;
use switchyard_infra::archive::{SnapshotError, SnapshotStore};
use switchyard_infra::channel::{ChannelError, Channels};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("blocking task failed: {0}")]
    Join(String),
}

#[derive(Clone)]
pub struct AppServices {
    pub channels: Channels,
    pub snapshots: Arc<dyn SnapshotStore>,
    pub bucket: String,
}

impl AppServices {
    pub fn new(channels: Channels, snapshots: Arc<dyn SnapshotStore>) -> Self {
        Self {
            channels,
            snapshots,
            bucket: ARCHIVE_BUCKET.to_string(),
        }
    }

    pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = bucket.into();
        self
    }

    /// Run blocking store work off the async runtime.
    pub async fn run<T, F>(&self, f: F) -> Result<T, ServiceError>
    where
        T: Send + 'static,
        F: FnOnce(&AppServices) -> Result<T, ServiceError> + Send + 'static,
    {
        let services = self.clone();
        tokio::task::spawn_blocking(move || f(&services))
            .await
            .map_err(|e| ServiceError::Join(e.to_string()))?
    }
}
