//! Store key namespace.
//!
//! These strings are the wire contract shared with every other process that
//! touches the store (watchers, producers, the archival sink); changing them
//! strands existing data.

use crate::id::{ChannelName, JobId};

/// Sorted set of every channel name ever enqueued into.
pub const CHANNEL_REGISTRY_KEY: &str = "sq_channels";

/// Sorted set of `watcher|channel` entries for running watchers.
pub const WATCH_REGISTRY_KEY: &str = "sq_watches";

/// List holding encoded command log entries.
pub const COMMAND_LOG_KEY: &str = "sq_store_";

/// Bucket of the archival snapshot store.
pub const ARCHIVE_BUCKET: &str = "__container__";

/// Sorted-set queue of job ids waiting in `channel`.
pub fn channel_queue_key(channel: &ChannelName) -> String {
    format!("sq_channel_{channel}")
}

/// Status hash of `channel`.
pub fn channel_status_key(channel: &ChannelName) -> String {
    format!("sq_channel_status_{channel}")
}

/// List of ids claimed from `channel` and still in flight.
pub fn working_set_key(channel: &ChannelName) -> String {
    format!("workingset_{channel}")
}

/// Hash holding the job record.
pub fn job_key(id: &JobId) -> String {
    format!("sq_job_{id}")
}

/// Member stored in [`WATCH_REGISTRY_KEY`].
pub fn watch_registry_member(watcher: &str, channel: &ChannelName) -> String {
    format!("{watcher}|{channel}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout() {
        let c = ChannelName::new("intake").unwrap();
        let j = JobId::new("j1").unwrap();
        assert_eq!(channel_queue_key(&c), "sq_channel_intake");
        assert_eq!(channel_status_key(&c), "sq_channel_status_intake");
        assert_eq!(working_set_key(&c), "workingset_intake");
        assert_eq!(job_key(&j), "sq_job_j1");
        assert_eq!(watch_registry_member("w1", &c), "w1|intake");
    }
}
