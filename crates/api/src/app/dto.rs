use serde::Deserialize;
use serde_json::{Map, Value};

use switchyard_core::FieldValue;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    /// Generated when absent.
    pub id: Option<String>,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl EnqueueRequest {
    pub fn field_values(self) -> Vec<(String, FieldValue)> {
        self.fields
            .into_iter()
            .map(|(k, v)| (k, FieldValue::from_json(v)))
            .collect()
    }
}

// -------------------------
// Response mapping
// -------------------------

/// Snapshot values that look like JSON are returned parsed.
pub fn snapshot_value(raw: String) -> (Value, bool) {
    if raw.starts_with('{') || raw.starts_with('[') {
        if let Ok(parsed) = serde_json::from_str::<Value>(&raw) {
            return (parsed, true);
        }
    }
    (Value::String(raw), false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_looking_values_are_parsed() {
        assert_eq!(
            snapshot_value(r#"{"a":1}"#.to_string()),
            (json!({"a": 1}), true)
        );
        assert_eq!(snapshot_value("[1,2]".to_string()), (json!([1, 2]), true));
        assert_eq!(snapshot_value("plain".to_string()), (json!("plain"), false));
        assert_eq!(snapshot_value("{broken".to_string()), (json!("{broken"), false));
    }

    #[test]
    fn enqueue_fields_map_to_natural_variants() {
        let req: EnqueueRequest =
            serde_json::from_value(json!({"fields": {"n": 3, "ok": true, "s": "x"}})).unwrap();
        assert_eq!(req.id, None);
        let mut values = req.field_values();
        values.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            values,
            vec![
                ("n".to_string(), FieldValue::Int(3)),
                ("ok".to_string(), FieldValue::Bool(true)),
                ("s".to_string(), FieldValue::Str("x".to_string())),
            ]
        );
    }
}
