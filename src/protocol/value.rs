//! Remote object and value conversion.
//!
//! CDP returns `RemoteObject`s whose `value` is already plain JSON. BiDi
//! returns typed `RemoteValue`s and expects typed `LocalValue` arguments;
//! the helpers here convert between those and [`serde_json::Value`].

// ============================================================================
// Imports
// ============================================================================

use serde_json::{Map, Value, json};

// ============================================================================
// RemoteRef
// ============================================================================

/// Reference to an object held by the peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteRef {
    /// CDP `objectId` / BiDi `handle`.
    pub object_id: String,
    /// BiDi `sharedId` (DOM nodes), usable across realms of one context.
    pub shared_id: Option<String>,
}

// ============================================================================
// RemoteObject
// ============================================================================

/// Decoded evaluation result.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteObject {
    /// JavaScript type (`object`, `number`, `node`, ...).
    pub kind: String,
    /// CDP subtype (`node`, `array`, `null`, ...).
    pub subtype: Option<String>,
    /// Description, if reported.
    pub description: Option<String>,
    /// Plain value for primitives or by-value results.
    pub value: Option<Value>,
    /// Remote reference for by-reference results.
    pub remote: Option<RemoteRef>,
}

impl RemoteObject {
    /// Returns the plain value, `null` when the object has none.
    #[must_use]
    pub fn into_value(self) -> Value {
        self.value.unwrap_or(Value::Null)
    }

    /// Parses a CDP `Runtime.RemoteObject`.
    pub(crate) fn from_cdp(object: &Value) -> Self {
        let text = |key: &str| object.get(key).and_then(Value::as_str).map(str::to_string);

        let value = match object.get("value") {
            Some(v) => Some(v.clone()),
            None => object
                .get("unserializableValue")
                .and_then(Value::as_str)
                .map(|s| Value::String(s.to_string())),
        };

        Self {
            kind: text("type").unwrap_or_else(|| "undefined".to_string()),
            subtype: text("subtype"),
            description: text("description"),
            value,
            remote: text("objectId").map(|object_id| RemoteRef {
                object_id,
                shared_id: None,
            }),
        }
    }

    /// Parses a BiDi `script.RemoteValue`.
    pub(crate) fn from_bidi(remote: &Value) -> Self {
        let text = |key: &str| remote.get(key).and_then(Value::as_str).map(str::to_string);
        let kind = text("type").unwrap_or_else(|| "undefined".to_string());

        let value = match kind.as_str() {
            "undefined" => None,
            _ if remote.get("value").is_some() || kind == "null" => Some(remote_value_to_json(remote)),
            _ => None,
        };

        Self {
            description: None,
            subtype: None,
            value,
            remote: text("handle")
                .or_else(|| text("sharedId"))
                .map(|object_id| RemoteRef {
                    object_id,
                    shared_id: text("sharedId"),
                }),
            kind,
        }
    }
}

// ============================================================================
// BiDi Value Conversion
// ============================================================================

/// Converts a BiDi `RemoteValue` into plain JSON.
///
/// Non-serializable values (nodes, windows, functions) become `null`.
#[must_use]
pub fn remote_value_to_json(remote: &Value) -> Value {
    let kind = remote.get("type").and_then(Value::as_str).unwrap_or_default();
    let value = remote.get("value");

    match kind {
        "string" | "boolean" | "date" => value.cloned().unwrap_or(Value::Null),
        "number" => match value {
            Some(Value::String(special)) => Value::String(special.clone()),
            Some(number) => number.clone(),
            None => Value::Null,
        },
        "bigint" => value
            .and_then(Value::as_str)
            .map(|s| Value::String(s.to_string()))
            .unwrap_or(Value::Null),
        "array" | "set" => Value::Array(
            value
                .and_then(Value::as_array)
                .map(|items| items.iter().map(remote_value_to_json).collect())
                .unwrap_or_default(),
        ),
        "object" | "map" => {
            let mut map = Map::new();
            for entry in value.and_then(Value::as_array).into_iter().flatten() {
                let Some([key, item]) = entry.as_array().map(Vec::as_slice).and_then(|s| <&[Value; 2]>::try_from(s).ok()) else {
                    continue;
                };
                let key = match key {
                    Value::String(s) => s.clone(),
                    other => match remote_value_to_json(other) {
                        Value::String(s) => s,
                        converted => converted.to_string(),
                    },
                };
                map.insert(key, remote_value_to_json(item));
            }
            Value::Object(map)
        }
        "regexp" => value
            .map(|re| {
                let pattern = re.get("pattern").and_then(Value::as_str).unwrap_or_default();
                let flags = re.get("flags").and_then(Value::as_str).unwrap_or_default();
                Value::String(format!("/{pattern}/{flags}"))
            })
            .unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

/// Converts plain JSON into a BiDi `LocalValue`.
#[must_use]
pub fn json_to_local_value(value: &Value) -> Value {
    match value {
        Value::Null => json!({"type": "null"}),
        Value::Bool(b) => json!({"type": "boolean", "value": b}),
        Value::Number(n) => json!({"type": "number", "value": n}),
        Value::String(s) => json!({"type": "string", "value": s}),
        Value::Array(items) => json!({
            "type": "array",
            "value": items.iter().map(json_to_local_value).collect::<Vec<_>>(),
        }),
        Value::Object(map) => json!({
            "type": "object",
            "value": map
                .iter()
                .map(|(k, v)| json!([k, json_to_local_value(v)]))
                .collect::<Vec<_>>(),
        }),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cdp_primitive() {
        let object = RemoteObject::from_cdp(&json!({"type": "number", "value": 42, "description": "42"}));
        assert_eq!(object.kind, "number");
        assert_eq!(object.value, Some(json!(42)));
        assert!(object.remote.is_none());
    }

    #[test]
    fn test_cdp_reference() {
        let object = RemoteObject::from_cdp(&json!({
            "type": "object",
            "subtype": "node",
            "className": "HTMLDivElement",
            "description": "div#main",
            "objectId": "obj-1"
        }));
        assert_eq!(object.subtype.as_deref(), Some("node"));
        assert_eq!(object.remote.map(|r| r.object_id), Some("obj-1".to_string()));
    }

    #[test]
    fn test_cdp_unserializable() {
        let object = RemoteObject::from_cdp(&json!({"type": "number", "unserializableValue": "NaN"}));
        assert_eq!(object.value, Some(json!("NaN")));
    }

    #[test]
    fn test_bidi_nested_object() {
        let remote = json!({
            "type": "object",
            "value": [
                ["a", {"type": "number", "value": 1}],
                ["b", {"type": "array", "value": [{"type": "string", "value": "x"}, {"type": "null"}]}]
            ]
        });
        assert_eq!(remote_value_to_json(&remote), json!({"a": 1, "b": ["x", null]}));
    }

    #[test]
    fn test_bidi_map_entries_need_key_and_value() {
        let remote = json!({
            "type": "map",
            "value": [
                [{"type": "number", "value": 7}, {"type": "boolean", "value": true}],
                ["lonely"],
                ["a", {"type": "null"}, "extra"],
                "not-a-pair"
            ]
        });
        assert_eq!(remote_value_to_json(&remote), json!({"7": true}));
    }

    #[test]
    fn test_bidi_node_reference() {
        let object = RemoteObject::from_bidi(&json!({
            "type": "node",
            "sharedId": "node-7",
            "handle": "h-3"
        }));
        let remote = object.remote.expect("reference");
        assert_eq!(remote.object_id, "h-3");
        assert_eq!(remote.shared_id.as_deref(), Some("node-7"));
        assert!(object.value.is_none());
    }

    #[test]
    fn test_bidi_special_numbers() {
        assert_eq!(remote_value_to_json(&json!({"type": "number", "value": "-0"})), json!("-0"));
        assert_eq!(remote_value_to_json(&json!({"type": "bigint", "value": "12"})), json!("12"));
        assert_eq!(remote_value_to_json(&json!({"type": "undefined"})), Value::Null);
    }

    #[test]
    fn test_local_value_encoding() {
        let local = json_to_local_value(&json!({"k": [1, true, null]}));
        assert_eq!(
            local,
            json!({
                "type": "object",
                "value": [["k", {
                    "type": "array",
                    "value": [
                        {"type": "number", "value": 1},
                        {"type": "boolean", "value": true},
                        {"type": "null"}
                    ]
                }]]
            })
        );
    }
}
