//! Durable work-item records.
//!
//! One JSON file per item in the staging directory, named
//! `{title}-{timestamp}.{stage}`. The suffix is the stage; moving an item
//! through the pipeline is a single rename.

mod identify;
mod metadata;
mod stage;

pub use identify::{is_generic_title, is_year, library_file_name, PendingItem, Renamed};
pub use metadata::{keys, Metadata};
pub use stage::{parse_record_name, Stage, WorkItemKey};

use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs as async_fs;
use tracing::{debug, info};

use crate::error::{PipelineError, PipelineResult};

/// Default page size for queue listings
pub const QUEUE_ITEMS_PER_PAGE: usize = 10;

static UNSAFE_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-zA-Z0-9._-]").expect("valid regex"));
static UNDERSCORE_RUNS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"__+").expect("valid regex"));

/// Make a title safe for use in record and artifact file names
pub fn sanitize_title(name: &str) -> String {
    let replaced = UNSAFE_CHARS.replace_all(name, "_");
    let collapsed = UNDERSCORE_RUNS.replace_all(&replaced, "_");
    collapsed.trim_matches('_').to_string()
}

/// Reject names that could escape the staging directory
pub fn validate_file_name(name: &str) -> PipelineResult<()> {
    if name.is_empty() || name.contains('/') || name.contains('\\') || name.contains("..") {
        return Err(PipelineError::InvalidInput(format!(
            "file name must be a bare name: {name:?}"
        )));
    }
    Ok(())
}

/// One record file as observed at read time
#[derive(Debug, Clone)]
pub struct Record {
    pub stage: Stage,
    pub file_name: String,
    pub path: PathBuf,
    pub metadata: Metadata,
    pub modified: SystemTime,
}

impl Record {
    /// `{title}-{timestamp}`
    pub fn base_name(&self) -> &str {
        self.file_name
            .strip_suffix(&format!(".{}", self.stage))
            .unwrap_or(&self.file_name)
    }

    pub fn key(&self) -> Option<WorkItemKey> {
        WorkItemKey::from_base_name(self.base_name())
    }

    fn modified_secs(&self) -> f64 {
        self.modified
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default()
    }
}

/// Serializable view of a record for queue listings
#[derive(Debug, Clone, Serialize)]
pub struct QueueItem {
    pub state: Stage,
    pub file: String,
    pub metadata: Metadata,
    pub mtime: f64,
}

impl From<&Record> for QueueItem {
    fn from(record: &Record) -> Self {
        Self {
            state: record.stage.clone(),
            file: record.file_name.clone(),
            metadata: record.metadata.clone(),
            mtime: record.modified_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueuePage {
    pub items: Vec<QueueItem>,
    pub total: usize,
    pub page: usize,
    pub per_page: usize,
    pub total_pages: usize,
}

/// Owns the record files in one staging directory
#[derive(Debug, Clone)]
pub struct StateStore {
    staging_dir: PathBuf,
}

impl StateStore {
    pub fn new(staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            staging_dir: staging_dir.into(),
        }
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Create the staging directory if it does not exist yet
    pub async fn init(&self) -> PipelineResult<()> {
        async_fs::create_dir_all(&self.staging_dir)
            .await
            .map_err(|e| PipelineError::io(format!("creating {:?}", self.staging_dir), e))
    }

    /// All records whose stage satisfies `wanted`, oldest first
    pub async fn enumerate_matching<F>(&self, wanted: F) -> PipelineResult<Vec<Record>>
    where
        F: Fn(&Stage) -> bool,
    {
        let mut entries = match async_fs::read_dir(&self.staging_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(PipelineError::io(
                    format!("listing {:?}", self.staging_dir),
                    e,
                ))
            }
        };

        let mut records = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| PipelineError::io("reading staging directory", e))?
        {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let Some((_, stage)) = parse_record_name(&file_name) else {
                continue;
            };
            if !wanted(&stage) {
                continue;
            }
            // Gone between listing and stat: a worker renamed it under us
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }

            let path = entry.path();
            records.push(Record {
                stage,
                metadata: read_metadata(&path).await,
                modified: meta.modified().unwrap_or(UNIX_EPOCH),
                file_name,
                path,
            });
        }

        records.sort_by(|a, b| {
            a.modified
                .cmp(&b.modified)
                .then_with(|| a.file_name.cmp(&b.file_name))
        });
        Ok(records)
    }

    /// All records in `stage`, oldest first
    pub async fn enumerate(&self, stage: &Stage) -> PipelineResult<Vec<Record>> {
        self.enumerate_matching(|s| s == stage).await
    }

    /// Record count for every regular pipeline stage
    pub async fn count_by_stage(&self) -> PipelineResult<BTreeMap<Stage, usize>> {
        let mut counts: BTreeMap<Stage, usize> =
            Stage::PIPELINE.iter().map(|s| (s.clone(), 0)).collect();
        for record in self.enumerate_matching(|s| !s.is_shadow()).await? {
            *counts.entry(record.stage).or_default() += 1;
        }
        Ok(counts)
    }

    /// Load one record by its file name
    pub async fn open(&self, file_name: &str) -> PipelineResult<Record> {
        validate_file_name(file_name)?;
        let (_, stage) = parse_record_name(file_name).ok_or_else(|| {
            PipelineError::InvalidInput(format!("not a record file name: {file_name}"))
        })?;
        let path = self.staging_dir.join(file_name);
        let meta = match async_fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(PipelineError::not_found("state file", path))
            }
            Err(e) => return Err(PipelineError::io(format!("reading {path:?}"), e)),
        };

        Ok(Record {
            stage,
            file_name: file_name.to_string(),
            metadata: read_metadata(&path).await,
            modified: meta.modified().unwrap_or(UNIX_EPOCH),
            path,
        })
    }

    /// The record for `key` whose stage satisfies `wanted`, if any
    pub async fn find_by_key<F>(&self, key: &WorkItemKey, wanted: F) -> PipelineResult<Option<Record>>
    where
        F: Fn(&Stage) -> bool,
    {
        let base = key.base_name();
        Ok(self
            .enumerate_matching(wanted)
            .await?
            .into_iter()
            .find(|r| r.base_name() == base))
    }

    /// Move a record to `to` with one rename, or delete it when `to` is `None`
    pub async fn transition(&self, record: &Record, to: Option<&Stage>) -> PipelineResult<String> {
        let Some(to) = to else {
            async_fs::remove_file(&record.path)
                .await
                .map_err(|e| map_missing(e, &record.path))?;
            info!("Removed state file {}", record.file_name);
            return Ok(format!("Removed {}", record.file_name));
        };

        let target = self.staging_dir.join(format!("{}.{}", record.base_name(), to));
        async_fs::rename(&record.path, &target)
            .await
            .map_err(|e| map_missing(e, &record.path))?;

        let verb = if to.rank() < record.stage.rank() {
            "Reverted"
        } else {
            "Advanced"
        };
        info!("{} {} to {}", verb, record.file_name, to);
        Ok(format!("{} {} to {}", verb, record.file_name, to))
    }

    /// Atomically create or replace the record for `key` in `stage`
    pub async fn write(
        &self,
        key: &WorkItemKey,
        stage: &Stage,
        metadata: &Metadata,
    ) -> PipelineResult<PathBuf> {
        let target = self.staging_dir.join(key.file_name(stage));
        self.write_atomic(&target, metadata).await?;
        debug!("Wrote state file {:?}", target);
        Ok(target)
    }

    /// Replace a record's content in place, then move it to `to`.
    ///
    /// Both steps are single renames, so the item is never without a record
    /// and never has two.
    pub async fn rewrite(
        &self,
        record: &Record,
        to: &Stage,
        metadata: &Metadata,
    ) -> PipelineResult<String> {
        if async_fs::metadata(&record.path).await.is_err() {
            return Err(PipelineError::not_found("state file", &record.path));
        }
        self.write_atomic(&record.path, metadata).await?;
        let updated = Record {
            metadata: metadata.clone(),
            ..record.clone()
        };
        self.transition(&updated, Some(to)).await
    }

    /// Every record across all stages, newest first, optionally paginated
    pub async fn queue_items(&self, page: Option<usize>, per_page: usize) -> PipelineResult<QueuePage> {
        let mut records = self.enumerate_matching(|_| true).await?;
        records.reverse();
        let items: Vec<QueueItem> = records.iter().map(QueueItem::from).collect();
        let total = items.len();

        let Some(page) = page else {
            return Ok(QueuePage {
                per_page: total,
                items,
                total,
                page: 1,
                total_pages: 1,
            });
        };

        let per_page = per_page.max(1);
        let total_pages = total.div_ceil(per_page).max(1);
        let page = page.clamp(1, total_pages);
        let items = items
            .into_iter()
            .skip((page - 1) * per_page)
            .take(per_page)
            .collect();

        Ok(QueuePage {
            items,
            total,
            page,
            per_page,
            total_pages,
        })
    }

    async fn write_atomic(&self, target: &Path, metadata: &Metadata) -> PipelineResult<()> {
        let file_name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp = self.staging_dir.join(format!(".{file_name}.tmp"));
        let body = serde_json::to_vec_pretty(metadata)
            .map_err(|e| PipelineError::InvalidInput(format!("unserializable metadata: {e}")))?;

        async_fs::write(&temp, body)
            .await
            .map_err(|e| PipelineError::io(format!("writing {temp:?}"), e))?;

        // Group-writable so the worker accounts can update it
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = async_fs::set_permissions(&temp, std::fs::Permissions::from_mode(0o664)).await;
        }

        if let Err(e) = async_fs::rename(&temp, target).await {
            let _ = async_fs::remove_file(&temp).await;
            return Err(PipelineError::io(format!("renaming onto {target:?}"), e));
        }
        Ok(())
    }
}

/// Corrupt or half-written content degrades to empty metadata
async fn read_metadata(path: &Path) -> Metadata {
    match async_fs::read_to_string(path).await {
        Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
            debug!("Unparsable state file {:?}: {}", path, e);
            Metadata::default()
        }),
        Err(e) => {
            debug!("Unreadable state file {:?}: {}", path, e);
            Metadata::default()
        }
    }
}

fn map_missing(e: std::io::Error, path: &Path) -> PipelineError {
    if e.kind() == ErrorKind::NotFound {
        PipelineError::not_found("state file", path)
    } else {
        PipelineError::io(format!("updating {path:?}"), e)
    }
}
