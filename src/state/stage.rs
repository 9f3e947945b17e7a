use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::PipelineError;

const SHADOW_PREFIX: &str = "distributed-to-";

/// Pipeline phase of a work item, stored on disk as the record file suffix
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    ImageCreating,
    ImageReady,
    Distributing,
    /// Shadow record on the origin node while a peer encodes the item
    DistributedTo(String),
    Encoding,
    EncodedReady,
    Transferring,
    Transferred,
    Archiving,
    Archived,
}

impl Stage {
    /// The regular stages in pipeline order
    pub const PIPELINE: [Stage; 9] = [
        Stage::ImageCreating,
        Stage::ImageReady,
        Stage::Distributing,
        Stage::Encoding,
        Stage::EncodedReady,
        Stage::Transferring,
        Stage::Transferred,
        Stage::Archiving,
        Stage::Archived,
    ];

    pub fn suffix(&self) -> String {
        match self {
            Stage::DistributedTo(peer) => format!("{SHADOW_PREFIX}{peer}"),
            other => other.fixed_suffix().to_string(),
        }
    }

    fn fixed_suffix(&self) -> &'static str {
        match self {
            Stage::ImageCreating => "image-creating",
            Stage::ImageReady => "image-ready",
            Stage::Distributing => "distributing",
            Stage::DistributedTo(_) => SHADOW_PREFIX,
            Stage::Encoding => "encoding",
            Stage::EncodedReady => "encoded-ready",
            Stage::Transferring => "transferring",
            Stage::Transferred => "transferred",
            Stage::Archiving => "archiving",
            Stage::Archived => "archived",
        }
    }

    /// Position in the pipeline; a shadow record ranks with `distributing`
    pub fn rank(&self) -> usize {
        match self {
            Stage::DistributedTo(_) => 2,
            other => Self::PIPELINE
                .iter()
                .position(|s| s == other)
                .unwrap_or(usize::MAX),
        }
    }

    pub fn is_shadow(&self) -> bool {
        matches!(self, Stage::DistributedTo(_))
    }

    /// Waiting stages no worker holds, where an item's files may be renamed
    pub fn is_renameable(&self) -> bool {
        matches!(
            self,
            Stage::ImageReady | Stage::EncodedReady | Stage::Transferred
        )
    }

    /// Peer named by a shadow stage
    pub fn shadow_peer(&self) -> Option<&str> {
        match self {
            Stage::DistributedTo(peer) => Some(peer),
            _ => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::DistributedTo(peer) => write!(f, "{SHADOW_PREFIX}{peer}"),
            other => f.write_str(other.fixed_suffix()),
        }
    }
}

impl FromStr for Stage {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(peer) = s.strip_prefix(SHADOW_PREFIX) {
            if peer.is_empty() || peer.contains(['.', '/', '\\']) {
                return Err(PipelineError::InvalidInput(format!("bad shadow stage: {s}")));
            }
            return Ok(Stage::DistributedTo(peer.to_string()));
        }
        Self::PIPELINE
            .iter()
            .find(|stage| stage.fixed_suffix() == s)
            .cloned()
            .ok_or_else(|| PipelineError::InvalidInput(format!("unknown stage: {s}")))
    }
}

impl Serialize for Stage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Title and creation timestamp identifying one work item
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkItemKey {
    pub title: String,
    pub timestamp: String,
}

impl WorkItemKey {
    pub fn new(title: impl Into<String>, timestamp: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            timestamp: timestamp.into(),
        }
    }

    /// `{title}-{timestamp}`, the part of a record name that never changes
    pub fn base_name(&self) -> String {
        format!("{}-{}", self.title, self.timestamp)
    }

    pub fn file_name(&self, stage: &Stage) -> String {
        format!("{}.{}", self.base_name(), stage)
    }

    /// Split a base name on its last `-`; titles may contain dashes
    pub fn from_base_name(base: &str) -> Option<Self> {
        let (title, timestamp) = base.rsplit_once('-')?;
        if title.is_empty() || timestamp.is_empty() {
            return None;
        }
        Some(Self::new(title, timestamp))
    }
}

/// Split a record file name into its base name and stage
pub fn parse_record_name(file_name: &str) -> Option<(&str, Stage)> {
    if file_name.starts_with('.') {
        return None;
    }
    let (base, suffix) = file_name.rsplit_once('.')?;
    let stage = suffix.parse().ok()?;
    if base.is_empty() {
        return None;
    }
    Some((base, stage))
}
