//! Wire bodies of the peer HTTP surface.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::state::{Metadata, Stage};

pub const CAPACITY_PATH: &str = "/api/worker/capacity";
pub const ACCEPT_JOB_PATH: &str = "/api/worker/accept-job";
pub const CONFIRM_FILES_PATH: &str = "/api/cluster/confirm-files";
pub const JOB_COMPLETE_PATH: &str = "/api/cluster/job-complete";
pub const PING_PATH: &str = "/api/cluster/ping";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptJobRequest {
    pub metadata: Metadata,
    #[serde(default = "unknown_origin")]
    pub origin: String,
}

fn unknown_origin() -> String {
    "unknown".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptJobResponse {
    pub status: String,
    pub state_file: String,
    pub node_name: String,
    pub queue_position: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmFilesRequest {
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfirmFilesResponse {
    pub confirmed: Vec<String>,
    pub missing: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobCompleteRequest {
    #[serde(default)]
    pub title: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub timestamp: String,
    #[serde(default = "default_success")]
    pub success: bool,
    /// Encoded file on the reporting peer
    #[serde(default, alias = "result_path", skip_serializing_if = "Option::is_none")]
    pub mkv_path: Option<String>,
}

fn default_success() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobCompleteResponse {
    pub status: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_file: Option<String>,
}

/// A job this node handed to a peer
#[derive(Debug, Clone, Serialize)]
pub struct DistributedJob {
    pub title: String,
    pub timestamp: String,
    pub dest_node: String,
    pub state: Stage,
    pub file: String,
}

/// A job a peer handed to this node
#[derive(Debug, Clone, Serialize)]
pub struct ReceivedJob {
    pub title: String,
    pub timestamp: String,
    pub origin_node: String,
    pub received_at: String,
    pub state: Stage,
    pub file: String,
}

/// Workers are inconsistent about quoting timestamps
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Null => Ok(String::new()),
        other => Err(de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}
