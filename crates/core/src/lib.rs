//! `switchyard-core`: routing engine building blocks.
//!
//! This crate contains **pure** primitives (no store access, no I/O): ids,
//! field values, job records, route tokens, the command log codec and the key
//! namespace every process agrees on.

pub mod command;
pub mod error;
pub mod id;
pub mod keys;
pub mod record;
pub mod route;
pub mod value;

pub use command::{CommandEntry, CommandKind};
pub use error::{DomainError, DomainResult};
pub use id::{ChannelName, JobId, SessionId};
pub use record::JobRecord;
pub use route::{RouteAction, RouteToken};
pub use value::{FieldValue, encode_fields};
