//! Infrastructure layer: store access, channels, watchers, archival, config.

pub mod archive;
pub mod channel;
pub mod config;
pub mod store;
pub mod watcher;


pub use channel::{ChannelError, ChannelResult, ChannelStatus, Channels, QueuePriority};
pub use config::{ConfigError, StoreConfig, SwitchyardConfig};
pub use store::{InMemoryStore, SharedStore, Store, StoreError, StoreResult, WriteBatch};
pub use watcher::{
    DispatchOutcome, Iteration, WatchContext, Watcher, WatcherConfig, WatcherHandle, WatcherStats,
};
