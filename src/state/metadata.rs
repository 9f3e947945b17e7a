use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;

/// Well-known record keys shared with the external workers
pub mod keys {
    pub const TITLE: &str = "title";
    pub const YEAR: &str = "year";
    pub const TIMESTAMP: &str = "timestamp";
    pub const ISO_PATH: &str = "iso_path";
    pub const MAPFILE_PATH: &str = "mapfile_path";
    pub const KEYS_DIR: &str = "keys_dir";
    pub const MKV_PATH: &str = "mkv_path";
    pub const PREVIEW_PATH: &str = "preview_path";
    pub const NAS_PATH: &str = "nas_path";
    pub const NEEDS_IDENTIFICATION: &str = "needs_identification";
    pub const IDENTIFIED_AT: &str = "identified_at";
    pub const ORIGINAL_TITLE: &str = "original_title";
    pub const IS_REMOTE_JOB: &str = "is_remote_job";
    pub const ORIGIN_NODE: &str = "origin_node";
    pub const ENCODER_SLOT: &str = "encoder_slot";
    pub const DEST_NODE: &str = "dest_node";
    pub const RECEIVED_AT: &str = "received_at";
    pub const REMOTE_COMPLETED_AT: &str = "remote_completed_at";
    pub const REMOTE_FAILED_AT: &str = "remote_failed_at";
}

/// Record content: an ordered JSON object with typed accessors.
///
/// Kept as a raw map so keys this crate does not know about survive
/// every rewrite.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(Map<String, Value>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// A value rendered as a string; numbers are accepted too since some
    /// workers write timestamps unquoted
    pub fn text(&self, key: &str) -> Option<String> {
        match self.0.get(key)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn path(&self, key: &str) -> Option<PathBuf> {
        self.text(key).map(PathBuf::from)
    }

    /// Truthy flags: `true`, `1`, `"1"`, `"true"`
    pub fn flag(&self, key: &str) -> bool {
        match self.0.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_i64() == Some(1),
            Some(Value::String(s)) => s == "1" || s.eq_ignore_ascii_case("true"),
            _ => false,
        }
    }

    pub fn title(&self) -> Option<String> {
        self.text(keys::TITLE)
    }

    pub fn timestamp(&self) -> Option<String> {
        self.text(keys::TIMESTAMP)
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }
}

impl From<Map<String, Value>> for Metadata {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unknown_keys_survive_rewrite() {
        let raw = r#"{"title":"Apollo_13","timestamp":1700000000,"handbrake_preset":"HQ 1080p","chapters":[1,2]}"#;
        let mut metadata: Metadata = serde_json::from_str(raw).unwrap();
        metadata.set(keys::MKV_PATH, "/var/tmp/dvd-rips/Apollo_13.mkv");

        let rewritten: Value = serde_json::to_value(&metadata).unwrap();
        assert_eq!(rewritten["handbrake_preset"], json!("HQ 1080p"));
        assert_eq!(rewritten["chapters"], json!([1, 2]));
        assert_eq!(metadata.timestamp().unwrap(), "1700000000");
    }

    #[test]
    fn test_flags() {
        let metadata: Metadata = serde_json::from_value(json!({
            "is_remote_job": true,
            "needs_identification": "1",
            "encoder_slot": 2
        }))
        .unwrap();
        assert!(metadata.flag(keys::IS_REMOTE_JOB));
        assert!(metadata.flag(keys::NEEDS_IDENTIFICATION));
        assert!(!metadata.flag(keys::DEST_NODE));
    }
}
