//! Tolerant decoding of IVR REST reply metadata.
//!
//! The server answers the `create`/`save`/`fail` calls with a small JSON
//! object. Absent keys, non-string values, or an unparsable body are all
//! treated as "field not present" rather than as errors; the protocol
//! layer decides what absence means.

use serde_json::Value;

const NAME_FIELD: &str = "name";
const URI_FIELD: &str = "uri";
const INFO_FIELD: &str = "info";

/// Fields consumed from an IVR reply body.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IvrReply {
    /// Server-issued file name.
    pub name: Option<String>,
    /// Reserved upload URI.
    pub uri: Option<String>,
    /// Diagnostic detail accompanying an error status.
    pub info: Option<String>,
}

impl IvrReply {
    pub fn decode(body: &[u8]) -> Self {
        let Ok(root) = serde_json::from_slice::<Value>(body) else {
            return Self::default();
        };
        Self {
            name: string_field(&root, NAME_FIELD),
            uri: string_field(&root, URI_FIELD),
            info: string_field(&root, INFO_FIELD),
        }
    }
}

fn string_field(root: &Value, key: &str) -> Option<String> {
    match root.get(key) {
        Some(Value::String(s)) => Some(s.clone()),
        _ => None,
    }
}

/// Absent and empty read the same way for reservation fields.
#[must_use]
pub fn non_empty(field: Option<&str>) -> Option<&str> {
    field.filter(|s| !s.is_empty())
}
