//! Moving encode work between nodes.
//!
//! The receiving node exposes accept-job and confirm-files, the origin node
//! exposes job-complete. Copying the image itself happens out of band.

mod capacity;
mod peer;
pub mod protocol;

pub use capacity::{Capacity, CapacityReport, LoadSource, PeerStatus, StaticLoad, SystemLoad};
pub use peer::{PeerClient, PeerSpec, CAPACITY_TIMEOUT};

use serde::Serialize;
use std::cmp::Reverse;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{PipelineError, PipelineResult};
use crate::process::{self, ProcessTable, ENCODER_BINARY};
use crate::state::{keys, validate_file_name, Metadata, Record, Stage, StateStore, WorkItemKey};
use crate::supervisor::StageConfig;
use protocol::{
    AcceptJobRequest, AcceptJobResponse, ConfirmFilesResponse, DistributedJob, JobCompleteRequest,
    JobCompleteResponse, ReceivedJob,
};

/// Result of handing a local item to a peer
#[derive(Debug, Clone, Serialize)]
pub struct HandOff {
    pub peer: String,
    pub state_file: String,
    pub remote_state_file: String,
    pub queue_position: usize,
    pub message: String,
}

pub struct Coordinator {
    config: Arc<Config>,
    store: StateStore,
    processes: Arc<dyn ProcessTable>,
    load: Arc<dyn LoadSource>,
    client: PeerClient,
}

impl Coordinator {
    pub fn new(
        config: Arc<Config>,
        store: StateStore,
        processes: Arc<dyn ProcessTable>,
        load: Arc<dyn LoadSource>,
        client: PeerClient,
    ) -> Self {
        Self {
            config,
            store,
            processes,
            load,
            client,
        }
    }

    pub fn node_name(&self) -> &str {
        &self.config.node_name
    }

    /// This node's encode capacity right now
    pub async fn capacity(&self) -> PipelineResult<Capacity> {
        let running =
            process::scan_processes(self.processes.clone(), |t| t.count_matching(ENCODER_BINARY)).await;
        let queue_depth = self.store.enumerate(&Stage::ImageReady).await?.len();
        Ok(Capacity::compute(
            &self.config,
            self.load.as_ref(),
            running,
            queue_depth,
        ))
    }

    pub async fn capacity_report(&self) -> PipelineResult<CapacityReport> {
        Ok(CapacityReport {
            node_name: self.config.node_name.clone(),
            capacity: self.capacity().await?,
        })
    }

    /// Query every configured peer concurrently, in configuration order
    pub async fn peer_statuses(&self) -> Vec<PeerStatus> {
        let mut queries = JoinSet::new();
        for (index, peer) in self.config.peers.iter().cloned().enumerate() {
            let client = self.client.clone();
            queries.spawn(async move {
                let report = client.capacity(&peer).await;
                (index, peer, report)
            });
        }

        let mut statuses = Vec::with_capacity(self.config.peers.len());
        while let Some(joined) = queries.join_next().await {
            match joined {
                Ok((index, peer, report)) => statuses.push((
                    index,
                    PeerStatus {
                        online: report.is_some(),
                        capacity: report.map(|r| r.capacity),
                        name: peer.name,
                        host: peer.host,
                        port: peer.port,
                    },
                )),
                Err(e) => warn!("Peer capacity query aborted: {}", e),
            }
        }
        statuses.sort_by_key(|(index, _)| *index);
        statuses.into_iter().map(|(_, status)| status).collect()
    }

    /// The online peer with the most free encoder slots, earliest configured
    /// on ties
    pub async fn find_available_peer(&self) -> Option<PeerSpec> {
        let mut candidates: Vec<PeerStatus> = self
            .peer_statuses()
            .await
            .into_iter()
            .filter(PeerStatus::is_available)
            .collect();
        candidates.sort_by_key(|p| Reverse(p.slots_free()));
        let best = candidates.into_iter().next()?;
        self.config.peer(&best.name).cloned()
    }

    /// Take in a job whose image a peer has already copied into staging
    pub async fn accept_job(&self, request: AcceptJobRequest) -> PipelineResult<AcceptJobResponse> {
        if !self.config.cluster_enabled {
            return Err(PipelineError::InvalidInput(
                "Cluster mode is not enabled".to_string(),
            ));
        }

        let mut metadata = request.metadata;
        let (Some(title), Some(timestamp)) = (metadata.title(), metadata.timestamp()) else {
            return Err(PipelineError::InvalidInput(
                "Missing title or timestamp in metadata".to_string(),
            ));
        };
        let key = WorkItemKey::new(title, timestamp);
        validate_file_name(&key.base_name())?;

        let image_name = image_file_name(&metadata, &key);
        let local_image = self.store.staging_dir().join(&image_name);
        if !tokio::fs::try_exists(&local_image).await.unwrap_or(false) {
            return Err(PipelineError::not_found("ISO file", local_image));
        }

        // Already accepted and picked up by a local worker
        if let Some(existing) = self
            .store
            .find_by_key(&key, |s| !s.is_shadow() && *s != Stage::ImageReady)
            .await?
        {
            debug!("{} already in progress as {}", key.base_name(), existing.file_name);
            return Ok(AcceptJobResponse {
                status: "accepted".to_string(),
                state_file: existing.file_name,
                node_name: self.config.node_name.clone(),
                queue_position: self.store.enumerate(&Stage::ImageReady).await?.len(),
            });
        }

        metadata.set(keys::ISO_PATH, local_image.to_string_lossy().into_owned());
        metadata.set(keys::ORIGIN_NODE, request.origin.clone());
        metadata.set(keys::IS_REMOTE_JOB, true);
        metadata.set(keys::RECEIVED_AT, chrono::Utc::now().to_rfc3339());

        self.store.write(&key, &Stage::ImageReady, &metadata).await?;
        let queue_position = self.store.enumerate(&Stage::ImageReady).await?.len();
        info!(
            "📥 Accepted {} from {} (queue position {})",
            key.base_name(),
            request.origin,
            queue_position
        );

        Ok(AcceptJobResponse {
            status: "accepted".to_string(),
            state_file: key.file_name(&Stage::ImageReady),
            node_name: self.config.node_name.clone(),
            queue_position,
        })
    }

    /// Which of `files` already sit in staging. Names that are not bare file
    /// names are left out of both lists.
    pub async fn confirm_files(&self, files: &[String]) -> ConfirmFilesResponse {
        let mut response = ConfirmFilesResponse::default();
        for name in files {
            if validate_file_name(name).is_err() {
                warn!("Ignoring suspicious file name in confirm-files: {:?}", name);
                continue;
            }
            let path = self.store.staging_dir().join(name);
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                response.confirmed.push(name.clone());
            } else {
                response.missing.push(name.clone());
            }
        }
        response
    }

    /// A peer finished (or gave up on) a job this node handed it
    pub async fn job_complete(
        &self,
        request: JobCompleteRequest,
    ) -> PipelineResult<JobCompleteResponse> {
        if request.title.is_empty() || request.timestamp.is_empty() {
            return Err(PipelineError::InvalidInput(
                "Missing title or timestamp".to_string(),
            ));
        }
        let key = WorkItemKey::new(&request.title, &request.timestamp);
        validate_file_name(&key.base_name())?;

        let Some(shadow) = self.store.find_by_key(&key, Stage::is_shadow).await? else {
            debug!("No distributed record for {}", key.base_name());
            return Ok(JobCompleteResponse {
                status: "ok".to_string(),
                message: "No matching distributed state file found (may have been cleaned up)"
                    .to_string(),
                state_file: None,
            });
        };

        let peer = shadow.stage.shadow_peer().unwrap_or("peer").to_string();
        let mut metadata = shadow.metadata.clone();
        let (target, message) = if request.success {
            if let Some(mkv) = &request.mkv_path {
                metadata.set(keys::MKV_PATH, mkv.clone());
            }
            metadata.set(keys::REMOTE_COMPLETED_AT, chrono::Utc::now().to_rfc3339());
            info!("✅ {} finished encoding {}", peer, key.base_name());
            (Stage::EncodedReady, "State updated to encoded-ready")
        } else {
            metadata.remove(keys::IS_REMOTE_JOB);
            metadata.remove(keys::ORIGIN_NODE);
            metadata.remove(keys::DEST_NODE);
            metadata.set(keys::REMOTE_FAILED_AT, chrono::Utc::now().to_rfc3339());
            warn!("❌ {} failed to encode {}, retrying locally", peer, key.base_name());
            (Stage::ImageReady, "State reverted to image-ready for local retry")
        };

        self.store.rewrite(&shadow, &target, &metadata).await?;
        Ok(JobCompleteResponse {
            status: "ok".to_string(),
            message: message.to_string(),
            state_file: Some(key.file_name(&target)),
        })
    }

    /// Hand a local item to a peer: confirm its image arrived, have the peer
    /// accept it, then park the local record as `distributed-to-{peer}`.
    ///
    /// Any failure puts the record back in `image-ready`.
    pub async fn hand_off(&self, file_name: &str, peer: Option<&str>) -> PipelineResult<HandOff> {
        let record = self.store.open(file_name).await?;
        if !matches!(record.stage, Stage::ImageReady | Stage::Distributing) {
            return Err(PipelineError::InvalidInput(format!(
                "{file_name} is {} and cannot be handed off",
                record.stage
            )));
        }

        match self.try_hand_off(&record, peer).await {
            Ok(handoff) => Ok(handoff),
            Err(e) => {
                warn!("❌ Hand-off of {} failed: {}", record.file_name, e);
                self.revert_hand_off(&record).await;
                Err(e)
            }
        }
    }

    async fn try_hand_off(&self, record: &Record, peer: Option<&str>) -> PipelineResult<HandOff> {
        let key = record.key().ok_or_else(|| {
            PipelineError::InvalidInput(format!("malformed record name {}", record.file_name))
        })?;
        let peer = match peer {
            Some(name) => self
                .config
                .peer(name)
                .cloned()
                .ok_or_else(|| PipelineError::not_found("peer", name))?,
            None => self
                .find_available_peer()
                .await
                .ok_or_else(|| PipelineError::PeerUnreachable {
                    peer: "any".to_string(),
                    reason: "no peer has free capacity".to_string(),
                })?,
        };

        let image = image_file_name(&record.metadata, &key);
        let confirmed = self
            .client
            .confirm_files(&peer, vec![image.clone()])
            .await?;
        if !confirmed.confirmed.contains(&image) {
            return Err(PipelineError::not_found("image on peer", image));
        }

        let accepted = self
            .client
            .accept_job(
                &peer,
                &AcceptJobRequest {
                    metadata: record.metadata.clone(),
                    origin: self.config.node_name.clone(),
                },
            )
            .await?;

        let mut metadata = record.metadata.clone();
        metadata.set(keys::DEST_NODE, peer.name.clone());
        let target = Stage::DistributedTo(peer.name.clone());
        let message = self.store.rewrite(record, &target, &metadata).await?;
        info!(
            "📤 Handed {} to {} as {}",
            key.base_name(),
            peer.name,
            accepted.state_file
        );

        Ok(HandOff {
            peer: peer.name,
            state_file: key.file_name(&target),
            remote_state_file: accepted.state_file,
            queue_position: accepted.queue_position,
            message,
        })
    }

    async fn revert_hand_off(&self, record: &Record) {
        if record.stage == Stage::ImageReady {
            return;
        }
        let target = StageConfig::lookup(&record.stage).and_then(|c| c.revert_to);
        if let Err(e) = self.store.transition(record, target.as_ref()).await {
            warn!("Could not revert {}: {}", record.file_name, e);
        }
    }

    /// Tell the node a received job came from how it ended
    pub async fn notify_origin(
        &self,
        file_name: &str,
        success: bool,
        result_path: Option<String>,
    ) -> PipelineResult<JobCompleteResponse> {
        let record = self.store.open(file_name).await?;
        if !record.metadata.flag(keys::IS_REMOTE_JOB) {
            return Err(PipelineError::NotOurs(format!(
                "{file_name} was not received from a peer"
            )));
        }
        let origin = record.metadata.text(keys::ORIGIN_NODE).ok_or_else(|| {
            PipelineError::InvalidInput(format!("{file_name} has no origin node"))
        })?;
        let peer = self
            .config
            .peer(&origin)
            .ok_or_else(|| PipelineError::not_found("peer", origin.as_str()))?;
        let key = record.key().ok_or_else(|| {
            PipelineError::InvalidInput(format!("malformed record name {file_name}"))
        })?;

        let mkv_path = if success {
            result_path.or_else(|| record.metadata.text(keys::MKV_PATH))
        } else {
            None
        };
        let request = JobCompleteRequest {
            title: key.title,
            timestamp: key.timestamp,
            success,
            mkv_path,
        };
        let response = self.client.job_complete(peer, &request).await?;
        info!("📣 Notified {} about {}: {}", origin, file_name, response.message);
        Ok(response)
    }

    /// Items this node handed to peers and has not heard back about
    pub async fn distributed_jobs(&self) -> PipelineResult<Vec<DistributedJob>> {
        let records = self
            .store
            .enumerate_matching(|s| s.is_shadow() || *s == Stage::Distributing)
            .await?;
        Ok(records
            .into_iter()
            .map(|record| {
                let (title, timestamp) = identity(&record);
                DistributedJob {
                    dest_node: record
                        .metadata
                        .text(keys::DEST_NODE)
                        .or_else(|| record.stage.shadow_peer().map(str::to_string))
                        .unwrap_or_else(|| "unknown".to_string()),
                    title,
                    timestamp,
                    state: record.stage,
                    file: record.file_name,
                }
            })
            .collect())
    }

    /// Items peers handed to this node that are still in the encode stages
    pub async fn received_jobs(&self) -> PipelineResult<Vec<ReceivedJob>> {
        let records = self
            .store
            .enumerate_matching(|s| {
                matches!(s, Stage::ImageReady | Stage::Encoding | Stage::EncodedReady)
            })
            .await?;
        Ok(records
            .into_iter()
            .filter(|record| record.metadata.flag(keys::IS_REMOTE_JOB))
            .map(|record| {
                let (title, timestamp) = identity(&record);
                ReceivedJob {
                    origin_node: record
                        .metadata
                        .text(keys::ORIGIN_NODE)
                        .unwrap_or_else(|| "unknown".to_string()),
                    received_at: record
                        .metadata
                        .text(keys::RECEIVED_AT)
                        .unwrap_or_default(),
                    title,
                    timestamp,
                    state: record.stage,
                    file: record.file_name,
                }
            })
            .collect())
    }
}

/// Staging file name of an item's disc image
fn image_file_name(metadata: &Metadata, key: &WorkItemKey) -> String {
    metadata
        .path(keys::ISO_PATH)
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| format!("{}.iso", key.base_name()))
}

/// Title and timestamp from metadata, falling back to the record name
fn identity(record: &Record) -> (String, String) {
    let key = record.key();
    let title = record
        .metadata
        .title()
        .or_else(|| key.as_ref().map(|k| k.title.clone()))
        .unwrap_or_default();
    let timestamp = record
        .metadata
        .timestamp()
        .or_else(|| key.map(|k| k.timestamp))
        .unwrap_or_default();
    (title, timestamp)
}
