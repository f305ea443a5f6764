//! Strongly-typed identifiers used across the routing engine.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::command::LOG_DELIMITER;
use crate::error::DomainError;

/// Identifier of a job (opaque, assigned by the producer).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobId(String);

/// Name of a channel (a routing stage).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChannelName(String);

/// Identity of one watcher session. Route tokens are only honored by the
/// session that issued them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

/// Compact UUIDv7 rendering (32 hex chars, no dashes).
fn compact_uuid() -> String {
    Uuid::now_v7().simple().to_string()
}

macro_rules! impl_token_newtype {
    ($t:ident, $name:literal) => {
        impl $t {
            /// Validate and wrap a raw token.
            ///
            /// Tokens must be non-empty and must not contain `|`, which is the
            /// command log delimiter and is never escaped.
            pub fn new(raw: impl Into<String>) -> Result<Self, DomainError> {
                let raw = raw.into();
                if raw.is_empty() {
                    return Err(DomainError::invalid_id(format!("{}: empty", $name)));
                }
                if raw.contains(LOG_DELIMITER) {
                    return Err(DomainError::invalid_id(format!(
                        "{}: `{}` contains `{}`",
                        $name, raw, LOG_DELIMITER
                    )));
                }
                Ok(Self(raw))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $t {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl TryFrom<String> for $t {
            type Error = DomainError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl TryFrom<&str> for $t {
            type Error = DomainError;

            fn try_from(value: &str) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$t> for String {
            fn from(value: $t) -> Self {
                value.0
            }
        }
    };
}

impl_token_newtype!(JobId, "JobId");
impl_token_newtype!(ChannelName, "ChannelName");

impl JobId {
    /// Generate a fresh, globally unique job id.
    pub fn generate() -> Self {
        Self(compact_uuid())
    }
}

impl SessionId {
    /// Start a new session identity.
    pub fn new() -> Self {
        Self(compact_uuid())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for SessionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_and_delimited_tokens() {
        assert!(JobId::new("").is_err());
        assert!(JobId::new("a|b").is_err());
        assert!(ChannelName::new("in|take").is_err());
        assert_eq!(ChannelName::new("intake").unwrap().as_str(), "intake");
    }

    #[test]
    fn generated_ids_are_compact_and_unique() {
        let a = JobId::generate();
        let b = JobId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
        assert!(!a.as_str().contains('-'));
    }

    #[test]
    fn sessions_differ() {
        assert_ne!(SessionId::new(), SessionId::new());
    }

    #[test]
    fn serde_validates_on_the_way_in() {
        let ok: JobId = serde_json::from_str("\"j1\"").unwrap();
        assert_eq!(ok.as_str(), "j1");
        assert!(serde_json::from_str::<JobId>("\"j|1\"").is_err());
    }
}
