//! Administrative HTTP surface: archived snapshots and channel control.

pub mod app;
