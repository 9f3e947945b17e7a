use crate::locks::LockFamily;
use crate::state::{keys, Stage};

/// What cancelling or killing an item in a given stage involves
#[derive(Debug, Clone, PartialEq)]
pub struct StageConfig {
    /// Lock family whose holder is working on the item
    pub lock: Option<LockFamily>,
    /// Where the record goes afterwards; `None` deletes it
    pub revert_to: Option<Stage>,
    /// Metadata key naming a half-written output to discard
    pub partial_artifact: Option<&'static str>,
    /// Metadata key naming a finished output that only goes on request
    pub queued_artifact: Option<&'static str>,
}

impl StageConfig {
    fn new(lock: Option<LockFamily>, revert_to: Option<Stage>) -> Self {
        Self {
            lock,
            revert_to,
            partial_artifact: None,
            queued_artifact: None,
        }
    }

    /// The reversion entry for `stage`, or `None` if it is not cancellable
    pub fn lookup(stage: &Stage) -> Option<Self> {
        let entry = match stage {
            Stage::ImageCreating => Self {
                partial_artifact: Some(keys::ISO_PATH),
                ..Self::new(Some(LockFamily::Image), None)
            },
            Stage::ImageReady => Self {
                queued_artifact: Some(keys::ISO_PATH),
                ..Self::new(None, None)
            },
            Stage::Distributing => {
                Self::new(Some(LockFamily::Distribute), Some(Stage::ImageReady))
            }
            Stage::DistributedTo(_) => Self::new(None, Some(Stage::ImageReady)),
            Stage::Encoding => Self {
                partial_artifact: Some(keys::MKV_PATH),
                ..Self::new(Some(LockFamily::Encoder), Some(Stage::ImageReady))
            },
            Stage::EncodedReady => Self {
                queued_artifact: Some(keys::MKV_PATH),
                ..Self::new(None, None)
            },
            Stage::Transferring => {
                Self::new(Some(LockFamily::Transfer), Some(Stage::EncodedReady))
            }
            Stage::Archiving => Self::new(Some(LockFamily::Archive), Some(Stage::Transferred)),
            Stage::Transferred | Stage::Archived => return None,
        };
        Some(entry)
    }

    /// Stages with a running worker
    pub fn is_active(&self) -> bool {
        self.lock.is_some()
    }
}
