//! Command log entries.
//!
//! The command log is an append-only list of `id|channel|command` strings
//! consumed by the archival sink. There is no escaping: a `|` inside any part
//! corrupts the entry, which is why identifiers reject it on construction.
//! Entries with fewer than three parts decode to a fixed sentinel pair so that
//! one bad entry can never stall the drain.

use core::fmt;

/// Delimiter between entry parts.
pub const LOG_DELIMITER: char = '|';

/// Id attributed to malformed entries.
pub const SENTINEL_JOB_ID: &str = "trash_job";
/// Channel attributed to malformed entries.
pub const SENTINEL_CHANNEL: &str = "trash_channel";

/// Transition recorded in the log.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CommandKind {
    /// Complete a route into `channel`.
    Route,
    /// Drop the archived snapshot of the job.
    Delete,
    /// Snapshot the (mutated) job, then complete the route into `channel`.
    Sync,
    /// Clear the whole archival bucket. Id and channel are ignored.
    Empty,
    /// Report the archival bucket's size. Id and channel are ignored.
    Print,
    /// Anything else, kept verbatim so the sink can log it.
    Unrecognized(String),
}

impl CommandKind {
    pub fn as_str(&self) -> &str {
        match self {
            CommandKind::Route => "route",
            CommandKind::Delete => "delete",
            CommandKind::Sync => "sync",
            CommandKind::Empty => "empty",
            CommandKind::Print => "print",
            CommandKind::Unrecognized(raw) => raw,
        }
    }

    /// Commands addressed to the archive rather than to one job.
    pub fn is_system(&self) -> bool {
        matches!(self, CommandKind::Empty | CommandKind::Print)
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "route" => CommandKind::Route,
            "delete" => CommandKind::Delete,
            "sync" => CommandKind::Sync,
            "empty" => CommandKind::Empty,
            "print" => CommandKind::Print,
            other => CommandKind::Unrecognized(other.to_string()),
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decoded command log entry.
///
/// Parts are plain strings rather than validated ids: decoding must accept
/// whatever is in the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandEntry {
    pub id: String,
    pub channel: String,
    pub command: CommandKind,
}

impl CommandEntry {
    pub fn new(id: impl Into<String>, channel: impl Into<String>, command: CommandKind) -> Self {
        Self {
            id: id.into(),
            channel: channel.into(),
            command,
        }
    }

    pub fn route(id: impl Into<String>, channel: impl Into<String>) -> Self {
        Self::new(id, channel, CommandKind::Route)
    }

    pub fn sync(id: impl Into<String>, channel: impl Into<String>) -> Self {
        Self::new(id, channel, CommandKind::Sync)
    }

    /// Delete entries carry no channel.
    pub fn delete(id: impl Into<String>) -> Self {
        Self::new(id, "", CommandKind::Delete)
    }

    /// System entries carry neither id nor channel.
    pub fn system(command: CommandKind) -> Self {
        Self::new("", "", command)
    }

    /// `id|channel|command`.
    pub fn encode(&self) -> String {
        format!(
            "{}{d}{}{d}{}",
            self.id,
            self.channel,
            self.command,
            d = LOG_DELIMITER
        )
    }

    /// Decode an entry. Never fails: fewer than three parts yields the
    /// sentinel id/channel with an empty unrecognized command, and parts past
    /// the third are ignored.
    pub fn decode(raw: &str) -> Self {
        let mut parts = raw.split(LOG_DELIMITER);
        match (parts.next(), parts.next(), parts.next()) {
            (Some(id), Some(channel), Some(command)) => Self {
                id: id.to_string(),
                channel: channel.to_string(),
                command: CommandKind::parse(command),
            },
            _ => Self::sentinel(),
        }
    }

    pub fn sentinel() -> Self {
        Self::new(
            SENTINEL_JOB_ID,
            SENTINEL_CHANNEL,
            CommandKind::Unrecognized(String::new()),
        )
    }

    pub fn is_sentinel(&self) -> bool {
        self.id == SENTINEL_JOB_ID && self.channel == SENTINEL_CHANNEL
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn encodes_pipe_delimited() {
        assert_eq!(CommandEntry::sync("j1", "done").encode(), "j1|done|sync");
        assert_eq!(CommandEntry::route("j2", "done").encode(), "j2|done|route");
        assert_eq!(CommandEntry::delete("j3").encode(), "j3||delete");
    }

    #[test]
    fn decodes_known_commands() {
        let e = CommandEntry::decode("j1|done|sync");
        assert_eq!(e, CommandEntry::sync("j1", "done"));

        let d = CommandEntry::decode("j3||delete");
        assert_eq!(d.id, "j3");
        assert_eq!(d.channel, "");
        assert_eq!(d.command, CommandKind::Delete);
    }

    #[test]
    fn malformed_entries_map_to_sentinel() {
        for raw in ["onlyonepart", "a|b", ""] {
            let e = CommandEntry::decode(raw);
            assert!(e.is_sentinel(), "{raw:?} should be sentinel");
            assert_eq!(e.command, CommandKind::Unrecognized(String::new()));
        }
    }

    #[test]
    fn unknown_commands_are_kept_verbatim() {
        let e = CommandEntry::decode("j1|c|explode");
        assert_eq!(e.command, CommandKind::Unrecognized("explode".into()));
        assert!(!e.is_sentinel());
    }

    #[test]
    fn system_commands_ignore_id_and_channel() {
        assert_eq!(CommandEntry::system(CommandKind::Empty).encode(), "||empty");
        let e = CommandEntry::decode("anything|at-all|print");
        assert_eq!(e.command, CommandKind::Print);
        assert!(e.command.is_system());
        assert!(!CommandKind::Sync.is_system());
    }

    #[test]
    fn extra_parts_are_ignored() {
        let e = CommandEntry::decode("j1|done|route|junk");
        assert_eq!(e, CommandEntry::route("j1", "done"));
    }

    proptest! {
        /// Property: delimiter-free parts survive encode/decode.
        #[test]
        fn delimiter_free_entries_survive(
            id in "[A-Za-z0-9_-]{1,32}",
            channel in "[A-Za-z0-9_.-]{0,32}",
            kind in prop_oneof![Just("route"), Just("delete"), Just("sync"), Just("empty"), Just("print")],
        ) {
            let entry = CommandEntry::new(id, channel, CommandKind::parse(kind));
            prop_assert_eq!(CommandEntry::decode(&entry.encode()), entry);
        }
    }
}
