//! Field values written into job records.
//!
//! Every job field is stored as a string. `FieldValue` is the single place
//! where typed values get their string encoding, so writers (producers,
//! watch contexts, the admin surface) all encode the same way.

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

/// A typed value destined for a job record field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    /// Encoded as unix seconds.
    Time(DateTime<Utc>),
    /// Opaque structured value, encoded as compact JSON.
    Json(JsonValue),
}

impl FieldValue {
    /// String encoding stored in the record.
    pub fn encode(&self) -> String {
        match self {
            FieldValue::Str(s) => s.clone(),
            FieldValue::Int(i) => i.to_string(),
            FieldValue::Float(f) => f.to_string(),
            FieldValue::Bool(b) => b.to_string(),
            FieldValue::Time(t) => t.timestamp().to_string(),
            FieldValue::Json(v) => v.to_string(),
        }
    }

    /// Map a loosely-typed JSON value (e.g. from an HTTP body) to a field value.
    ///
    /// Scalars keep their natural variant; arrays and objects stay opaque JSON.
    pub fn from_json(value: JsonValue) -> Self {
        match value {
            JsonValue::String(s) => FieldValue::Str(s),
            JsonValue::Bool(b) => FieldValue::Bool(b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => FieldValue::Int(i),
                None => FieldValue::Float(n.as_f64().unwrap_or_default()),
            },
            JsonValue::Null => FieldValue::Str(String::new()),
            other => FieldValue::Json(other),
        }
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Str(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Str(value.to_string())
    }
}

impl From<&String> for FieldValue {
    fn from(value: &String) -> Self {
        FieldValue::Str(value.clone())
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        FieldValue::Int(value.into())
    }
}

impl From<u32> for FieldValue {
    fn from(value: u32) -> Self {
        FieldValue::Int(value.into())
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(value: DateTime<Utc>) -> Self {
        FieldValue::Time(value)
    }
}

impl From<JsonValue> for FieldValue {
    fn from(value: JsonValue) -> Self {
        FieldValue::Json(value)
    }
}

/// Encode `(field, value)` pairs into the string pairs a store write takes.
pub fn encode_fields<K, V>(fields: impl IntoIterator<Item = (K, V)>) -> Vec<(String, String)>
where
    K: Into<String>,
    V: Into<FieldValue>,
{
    fields
        .into_iter()
        .map(|(k, v)| (k.into(), v.into().encode()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scalar_encodings() {
        assert_eq!(FieldValue::from("new").encode(), "new");
        assert_eq!(FieldValue::from(42i64).encode(), "42");
        assert_eq!(FieldValue::from(-7i32).encode(), "-7");
        assert_eq!(FieldValue::from(2.5f64).encode(), "2.5");
        assert_eq!(FieldValue::from(true).encode(), "true");
    }

    #[test]
    fn time_encodes_as_unix_seconds() {
        let t = DateTime::from_timestamp(1_700_000_000, 123).unwrap();
        assert_eq!(FieldValue::from(t).encode(), "1700000000");
    }

    #[test]
    fn json_is_compact() {
        let v = FieldValue::from(json!({"a": [1, 2]}));
        assert_eq!(v.encode(), r#"{"a":[1,2]}"#);
    }

    #[test]
    fn from_json_picks_natural_variant() {
        assert_eq!(FieldValue::from_json(json!("x")), FieldValue::Str("x".into()));
        assert_eq!(FieldValue::from_json(json!(3)), FieldValue::Int(3));
        assert_eq!(FieldValue::from_json(json!(1.5)), FieldValue::Float(1.5));
        assert_eq!(FieldValue::from_json(json!(false)), FieldValue::Bool(false));
        assert_eq!(
            FieldValue::from_json(json!([1])),
            FieldValue::Json(json!([1]))
        );
    }

    #[test]
    fn encode_fields_keeps_order() {
        let encoded = encode_fields([("status", FieldValue::from("new")), ("n", 1i64.into())]);
        assert_eq!(
            encoded,
            vec![
                ("status".to_string(), "new".to_string()),
                ("n".to_string(), "1".to_string())
            ]
        );
    }
}
