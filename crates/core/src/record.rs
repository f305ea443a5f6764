//! Job records: flat string field-sets with typed, forgiving accessors.
//!
//! Typed reads never fail. An absent or malformed field decodes to the type's
//! zero value (`0`, `0.0`, `false`, the unix epoch). Callers that need strict
//! validation must check the raw string themselves.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::value::FieldValue;

/// Reserved field: the job id. Immutable once written.
pub const FIELD_ID: &str = "id";
/// Reserved field: current or last channel of the job.
pub const FIELD_CHANNEL: &str = "channel";
/// Reserved field: creation time in unix seconds.
pub const FIELD_CREATED: &str = "created";

/// One unit of work, as stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobRecord {
    fields: BTreeMap<String, String>,
}

impl JobRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }

    pub fn into_fields(self) -> BTreeMap<String, String> {
        self.fields
    }

    /// Raw field access.
    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    /// Set a field on this in-memory copy (does not write to any store).
    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<FieldValue>) {
        self.fields.insert(field.into(), value.into().encode());
    }

    pub fn id(&self) -> &str {
        self.string(FIELD_ID)
    }

    pub fn channel(&self) -> &str {
        self.string(FIELD_CHANNEL)
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.time(FIELD_CREATED)
    }

    /// String field, `""` when absent.
    pub fn string(&self, field: &str) -> &str {
        self.get(field).unwrap_or_default()
    }

    /// Integer field, `0` when absent or malformed.
    pub fn int(&self, field: &str) -> i64 {
        let raw = self.string(field);
        if raw.is_empty() {
            return 0;
        }
        match raw.trim().parse::<i64>() {
            Ok(v) => v,
            Err(e) => {
                debug!(field, value = raw, error = %e, "int field did not parse; using 0");
                0
            }
        }
    }

    /// Float field, `0.0` when absent or malformed.
    pub fn float(&self, field: &str) -> f64 {
        let raw = self.string(field);
        if raw.is_empty() {
            return 0.0;
        }
        match raw.trim().parse::<f64>() {
            Ok(v) => v,
            Err(e) => {
                debug!(field, value = raw, error = %e, "float field did not parse; using 0.0");
                0.0
            }
        }
    }

    /// Boolean field, `false` when absent or malformed.
    ///
    /// Accepts `1/t/T/true/TRUE/True` and `0/f/F/false/FALSE/False`.
    pub fn bool(&self, field: &str) -> bool {
        match self.string(field) {
            "1" | "t" | "T" | "true" | "TRUE" | "True" => true,
            "" | "0" | "f" | "F" | "false" | "FALSE" | "False" => false,
            other => {
                debug!(field, value = other, "bool field did not parse; using false");
                false
            }
        }
    }

    /// Timestamp field stored as unix seconds; the epoch when absent, zero, or malformed.
    pub fn time(&self, field: &str) -> DateTime<Utc> {
        let secs = self.int(field);
        if secs == 0 {
            return DateTime::<Utc>::default();
        }
        DateTime::from_timestamp(secs, 0).unwrap_or_default()
    }
}

impl From<HashMap<String, String>> for JobRecord {
    fn from(value: HashMap<String, String>) -> Self {
        Self {
            fields: value.into_iter().collect(),
        }
    }
}

impl From<BTreeMap<String, String>> for JobRecord {
    fn from(fields: BTreeMap<String, String>) -> Self {
        Self { fields }
    }
}

impl FromIterator<(String, String)> for JobRecord {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

/// Merge already-encoded fields into the local copy.
impl Extend<(String, String)> for JobRecord {
    fn extend<T: IntoIterator<Item = (String, String)>>(&mut self, iter: T) {
        self.fields.extend(iter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn record(pairs: &[(&str, &str)]) -> JobRecord {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn missing_fields_decode_to_zero_values() {
        let r = JobRecord::new();
        assert_eq!(r.string("x"), "");
        assert_eq!(r.int("x"), 0);
        assert_eq!(r.float("x"), 0.0);
        assert!(!r.bool("x"));
        assert_eq!(r.time("x"), DateTime::<Utc>::default());
        assert_eq!(r.created().timestamp(), 0);
    }

    #[test]
    fn malformed_fields_decode_to_zero_values() {
        let r = record(&[("n", "seven"), ("f", "1.2.3"), ("b", "yes"), ("t", "later")]);
        assert_eq!(r.int("n"), 0);
        assert_eq!(r.float("f"), 0.0);
        assert!(!r.bool("b"));
        assert_eq!(r.time("t").timestamp(), 0);
    }

    #[test]
    fn well_formed_fields_decode() {
        let r = record(&[
            ("id", "j1"),
            ("channel", "intake"),
            ("created", "1700000000"),
            ("n", "-12"),
            ("f", "0.25"),
            ("b", "T"),
        ]);
        assert_eq!(r.id(), "j1");
        assert_eq!(r.channel(), "intake");
        assert_eq!(r.created().timestamp(), 1_700_000_000);
        assert_eq!(r.int("n"), -12);
        assert_eq!(r.float("f"), 0.25);
        assert!(r.bool("b"));
    }

    #[test]
    fn insert_uses_field_encoding() {
        let mut r = JobRecord::new();
        r.insert("done", true);
        r.insert("score", 9i64);
        assert_eq!(r.get("done"), Some("true"));
        assert_eq!(r.int("score"), 9);
    }

    #[test]
    fn serializes_as_flat_object() {
        let r = record(&[("id", "j1"), ("status", "processed")]);
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json, serde_json::json!({"id": "j1", "status": "processed"}));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: typed reads never panic, whatever the stored string.
        #[test]
        fn typed_reads_are_total(raw in ".*") {
            let r = record(&[("v", raw.as_str())]);
            let _ = r.int("v");
            let _ = r.float("v");
            let _ = r.bool("v");
            let _ = r.time("v");
        }

        /// Property: integers written through FieldValue read back unchanged.
        #[test]
        fn ints_read_back(n in any::<i64>()) {
            let mut r = JobRecord::new();
            r.insert("n", n);
            prop_assert_eq!(r.int("n"), n);
        }
    }
}
