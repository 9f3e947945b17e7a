//! Identification of items ripped under a generic disc label.
//!
//! Renaming is the one event that changes an item's base name: the title
//! part of every record and artifact name moves to the new title while the
//! timestamp and stage stay put.

use regex::Regex;
use serde::Serialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tokio::fs as async_fs;
use tracing::{info, warn};

use super::{keys, map_missing, sanitize_title, Metadata, Record, Stage, StateStore, WorkItemKey};
use crate::error::{PipelineError, PipelineResult};
use crate::supervisor::{CleanupReport, Step};

static GENERIC_TITLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(DVD_\d{8}_\d{6}|DVD_VIDEO|DVDVIDEO|DISC\d*|DISK\d*|VIDEO_TS|MYDVD|DVD)$")
        .expect("valid regex")
});
static YEAR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d{4}$").expect("valid regex"));

const ARCHIVE_MARKER: &str = ".archive-ready";

/// Disc labels that say nothing about the movie, and very short titles
pub fn is_generic_title(title: &str) -> bool {
    title.chars().count() <= 3 || GENERIC_TITLE.is_match(&title.to_uppercase())
}

pub fn is_year(value: &str) -> bool {
    YEAR.is_match(value)
}

/// Media library file name, e.g. `The Matrix (1999).mkv`
pub fn library_file_name(title: &str, year: Option<&str>, extension: &str) -> String {
    let clean = title
        .replace('_', " ")
        .split_whitespace()
        .map(capitalize)
        .collect::<Vec<_>>()
        .join(" ");
    match year.filter(|y| is_year(y)) {
        Some(year) => format!("{clean} ({year}).{extension}"),
        None => format!("{clean}.{extension}"),
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first
            .to_uppercase()
            .chain(chars.flat_map(char::to_lowercase))
            .collect(),
        None => String::new(),
    }
}

/// An item waiting for an operator to name it
#[derive(Debug, Clone, Serialize)]
pub struct PendingItem {
    pub state_file: String,
    pub state: Stage,
    pub metadata: Metadata,
    pub mtime: f64,
}

impl From<&Record> for PendingItem {
    fn from(record: &Record) -> Self {
        Self {
            state_file: record.file_name.clone(),
            state: record.stage.clone(),
            metadata: record.metadata.clone(),
            mtime: record.modified_secs(),
        }
    }
}

/// Result of a rename: the new record name plus every file step taken
#[derive(Debug, Clone, Serialize)]
pub struct Renamed {
    pub state_file: String,
    pub title: String,
    pub year: Option<String>,
    pub report: CleanupReport,
}

impl StateStore {
    /// Items in renameable stages that are flagged for identification, or
    /// that have a preview clip but no release year. Oldest first.
    pub async fn pending_identification(&self) -> PipelineResult<Vec<PendingItem>> {
        let mut pending = Vec::new();
        for record in self.enumerate_matching(Stage::is_renameable).await? {
            if needs_identification(&record).await {
                pending.push(PendingItem::from(&record));
            }
        }
        Ok(pending)
    }

    /// Give an item its real title.
    ///
    /// Local artifacts are renamed first, each as a best-effort step; the
    /// record is then rewritten in place and moved to its new name with one
    /// rename, so the item never has two records or none.
    pub async fn rename_item(
        &self,
        record: &Record,
        new_title: &str,
        year: Option<&str>,
    ) -> PipelineResult<Renamed> {
        if !record.stage.is_renameable() {
            return Err(PipelineError::InvalidInput(format!(
                "Cannot rename items in '{}' state",
                record.stage
            )));
        }
        let title = sanitize_title(new_title.trim());
        if title.is_empty() {
            return Err(PipelineError::InvalidInput("Title is required".to_string()));
        }
        let year = year.map(str::trim).filter(|y| !y.is_empty());
        if year.is_some_and(|y| !is_year(y)) {
            return Err(PipelineError::InvalidInput("Year must be 4 digits".to_string()));
        }
        if !exists(&record.path).await {
            return Err(PipelineError::not_found("state file", &record.path));
        }
        let old_key = record.key().ok_or_else(|| {
            PipelineError::InvalidInput(format!("not a title-timestamp record: {}", record.file_name))
        })?;

        let key = WorkItemKey::new(title.clone(), old_key.timestamp.clone());
        let state_file = key.file_name(&record.stage);
        let target = self.staging_dir.join(&state_file);
        if target != record.path && exists(&target).await {
            return Err(PipelineError::InvalidInput(format!("{state_file} already exists")));
        }

        let mut metadata = record.metadata.clone();
        let year = year
            .map(str::to_string)
            .or_else(|| metadata.text(keys::YEAR).filter(|y| is_year(y)));
        let base = key.base_name();
        let mut report = CleanupReport::new();

        let library_name = |current: &Path, _: bool| {
            let extension = current
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("mkv");
            self.staging_dir
                .join(library_file_name(&title, year.as_deref(), extension))
        };
        rename_artifact(&mut metadata, keys::MKV_PATH, library_name, &mut report).await;

        let old_image = metadata.path(keys::ISO_PATH);
        let image_name = |_: &Path, is_dir: bool| {
            if is_dir {
                self.staging_dir.join(&base)
            } else {
                self.staging_dir.join(format!("{base}.iso"))
            }
        };
        rename_artifact(&mut metadata, keys::ISO_PATH, image_name, &mut report).await;
        if let (Some(old), Some(new)) = (old_image, metadata.path(keys::ISO_PATH)) {
            if old != new {
                rename_marker(&old, &new, &mut report).await;
            }
        }

        let preview_name = |_: &Path, _: bool| self.staging_dir.join(format!("{base}.preview.mp4"));
        rename_artifact(&mut metadata, keys::PREVIEW_PATH, preview_name, &mut report).await;

        let original_title = metadata.title().unwrap_or_else(|| old_key.title.clone());
        metadata.set(keys::TITLE, title.clone());
        if let Some(year) = &year {
            metadata.set(keys::YEAR, year.clone());
        }
        if metadata.timestamp().is_none() {
            metadata.set(keys::TIMESTAMP, old_key.timestamp.clone());
        }
        metadata.set(keys::NEEDS_IDENTIFICATION, false);
        metadata.set(keys::IDENTIFIED_AT, chrono::Local::now().to_rfc3339());
        metadata.set(keys::ORIGINAL_TITLE, original_title);

        self.write_atomic(&record.path, &metadata).await?;
        if target != record.path {
            async_fs::rename(&record.path, &target)
                .await
                .map_err(|e| map_missing(e, &record.path))?;
        }
        report.done(
            Step::Transition,
            format!("Renamed {} to {}", record.file_name, state_file),
        );
        info!("🏷️ Identified {} as {}", record.file_name, state_file);

        Ok(Renamed {
            state_file,
            title,
            year,
            report,
        })
    }

    /// Drop an item from the pending list: delete its preview clip and
    /// clear the identification flag
    pub async fn dismiss_identification(&self, record: &Record) -> PipelineResult<CleanupReport> {
        if !exists(&record.path).await {
            return Err(PipelineError::not_found("state file", &record.path));
        }
        let mut metadata = record.metadata.clone();
        let mut report = CleanupReport::new();

        let preview_gone = match metadata.path(keys::PREVIEW_PATH) {
            None => {
                report.skipped(Step::RemovePreview, "No preview recorded");
                true
            }
            Some(path) => match async_fs::remove_file(&path).await {
                Ok(()) => {
                    report.done(Step::RemovePreview, format!("Removed preview {}", path.display()));
                    true
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    report.skipped(Step::RemovePreview, format!("{} already absent", path.display()));
                    true
                }
                Err(e) => {
                    report.failed(
                        Step::RemovePreview,
                        format!("Could not delete {}: {}", path.display(), e),
                    );
                    false
                }
            },
        };

        if preview_gone {
            metadata.set(keys::PREVIEW_PATH, "");
        }
        metadata.set(keys::NEEDS_IDENTIFICATION, false);
        self.write_atomic(&record.path, &metadata).await?;
        info!("Dismissed {} from identification", record.file_name);
        Ok(report)
    }
}

async fn needs_identification(record: &Record) -> bool {
    let metadata = &record.metadata;
    let flagged = match metadata.get(keys::NEEDS_IDENTIFICATION) {
        Some(_) => metadata.flag(keys::NEEDS_IDENTIFICATION),
        None => {
            let title = metadata
                .title()
                .or_else(|| record.key().map(|k| k.title))
                .unwrap_or_default();
            is_generic_title(&title)
        }
    };
    if flagged {
        return true;
    }

    let has_year = metadata.text(keys::YEAR).is_some_and(|y| is_year(y.trim()));
    let has_preview = match metadata.path(keys::PREVIEW_PATH) {
        Some(path) => async_fs::metadata(&path)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false),
        None => false,
    };
    has_preview && !has_year
}

async fn exists(path: &Path) -> bool {
    async_fs::try_exists(path).await.unwrap_or(false)
}

/// Move the local file or directory named by `key` to `target(current, is_dir)`
/// and point the metadata at it. Paths on other nodes are left alone.
async fn rename_artifact<F>(metadata: &mut Metadata, key: &str, target: F, report: &mut CleanupReport)
where
    F: FnOnce(&Path, bool) -> PathBuf,
{
    let Some(current) = metadata.path(key) else {
        report.skipped(Step::RenameArtifact, format!("No {key} recorded"));
        return;
    };
    let is_dir = match async_fs::metadata(&current).await {
        Ok(meta) => meta.is_dir(),
        Err(_) => {
            report.skipped(
                Step::RenameArtifact,
                format!("{} is not on this node", current.display()),
            );
            return;
        }
    };

    let target = target(&current, is_dir);
    if target == current {
        report.skipped(Step::RenameArtifact, format!("{} already named", current.display()));
        return;
    }
    if exists(&target).await {
        report.failed(
            Step::RenameArtifact,
            format!("Not renaming {}: {} exists", current.display(), target.display()),
        );
        return;
    }

    match async_fs::rename(&current, &target).await {
        Ok(()) => {
            metadata.set(key, target.to_string_lossy().into_owned());
            report.done(
                Step::RenameArtifact,
                format!("Renamed {} to {}", current.display(), target.display()),
            );
        }
        Err(e) => {
            warn!("Could not rename {:?}: {}", current, e);
            report.failed(
                Step::RenameArtifact,
                format!("Could not rename {}: {}", current.display(), e),
            );
        }
    }
}

/// The archive worker's marker follows its image
async fn rename_marker(old_image: &Path, new_image: &Path, report: &mut CleanupReport) {
    let old = marker_path(old_image);
    if !exists(&old).await {
        return;
    }
    let new = marker_path(new_image);
    match async_fs::rename(&old, &new).await {
        Ok(()) => report.done(
            Step::RenameArtifact,
            format!("Renamed {} to {}", old.display(), new.display()),
        ),
        Err(e) => report.failed(
            Step::RenameArtifact,
            format!("Could not rename {}: {}", old.display(), e),
        ),
    }
}

fn marker_path(image: &Path) -> PathBuf {
    let mut name = image.as_os_str().to_os_string();
    name.push(ARCHIVE_MARKER);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    fn seed(dir: &Path, name: &str, value: serde_json::Value) {
        fs::write(dir.join(name), value.to_string()).unwrap();
    }

    #[test]
    fn test_generic_titles() {
        for title in ["DVD_20240101_120000", "dvd_video", "DISC1", "Disk", "VIDEO_TS", "MyDVD", "DVD", "Up", ""] {
            assert!(is_generic_title(title), "{title} should be generic");
        }
        for title in ["Heat", "The_Matrix", "DVD_Extras_Vol_2"] {
            assert!(!is_generic_title(title), "{title} should not be generic");
        }
    }

    #[test]
    fn test_library_file_name() {
        assert_eq!(
            library_file_name("the_MATRIX", Some("1999"), "mkv"),
            "The Matrix (1999).mkv"
        );
        assert_eq!(library_file_name("Heat", Some("95"), "mp4"), "Heat.mp4");
        assert_eq!(library_file_name("Heat", None, "mkv"), "Heat.mkv");
    }

    #[tokio::test]
    async fn test_pending_identification() {
        let temp_dir = TempDir::new().unwrap();
        let staging = temp_dir.path();
        let store = StateStore::new(staging);
        let preview = staging.join("Alien-3.preview.mp4");
        fs::write(&preview, "clip").unwrap();

        seed(staging, "DVD_VIDEO-1.image-ready", json!({ "title": "DVD_VIDEO" }));
        seed(staging, "Heat-2.encoded-ready", json!({ "title": "Heat", "needs_identification": true }));
        seed(staging, "Alien-3.transferred", json!({ "title": "Alien", "preview_path": preview }));
        seed(staging, "Alien-4.transferred", json!({ "title": "Alien", "year": "1979", "preview_path": preview }));
        seed(staging, "MYDVD-5.encoding", json!({ "title": "MYDVD" }));
        seed(staging, "DISC-6.image-ready", json!({ "title": "DISC", "needs_identification": false }));

        let mut pending: Vec<String> = store
            .pending_identification()
            .await
            .unwrap()
            .into_iter()
            .map(|item| item.state_file)
            .collect();
        pending.sort();
        assert_eq!(
            pending,
            vec!["Alien-3.transferred", "DVD_VIDEO-1.image-ready", "Heat-2.encoded-ready"]
        );
    }

    #[tokio::test]
    async fn test_rename_item_moves_record_and_artifacts() {
        let temp_dir = TempDir::new().unwrap();
        let staging = temp_dir.path();
        let store = StateStore::new(staging);

        let iso = staging.join("DVD_VIDEO-1700000000.iso");
        let mkv = staging.join("DVD_VIDEO.mkv");
        let preview = staging.join("DVD_VIDEO-1700000000.preview.mp4");
        for path in [&iso, &mkv, &preview] {
            fs::write(path, "data").unwrap();
        }
        fs::write(staging.join("DVD_VIDEO-1700000000.iso.archive-ready"), "").unwrap();
        seed(
            staging,
            "DVD_VIDEO-1700000000.encoded-ready",
            json!({
                "title": "DVD_VIDEO",
                "timestamp": "1700000000",
                "iso_path": iso,
                "mkv_path": mkv,
                "preview_path": preview,
                "nas_path": "/volume1/Movies/DVD_VIDEO.mkv",
                "needs_identification": true,
                "handbrake_preset": "HQ 1080p"
            }),
        );

        let record = store.open("DVD_VIDEO-1700000000.encoded-ready").await.unwrap();
        let renamed = store
            .rename_item(&record, "The Matrix", Some("1999"))
            .await
            .unwrap();

        assert_eq!(renamed.state_file, "The_Matrix-1700000000.encoded-ready");
        assert!(!renamed.report.has_failures(), "{:?}", renamed.report);
        assert_eq!(renamed.report.outcomes(Step::RenameArtifact).len(), 4);

        assert!(!staging.join("DVD_VIDEO-1700000000.encoded-ready").exists());
        assert!(staging.join("The Matrix (1999).mkv").exists());
        assert!(staging.join("The_Matrix-1700000000.iso").exists());
        assert!(staging.join("The_Matrix-1700000000.iso.archive-ready").exists());
        assert!(staging.join("The_Matrix-1700000000.preview.mp4").exists());

        let updated = store.open(&renamed.state_file).await.unwrap();
        let metadata = &updated.metadata;
        assert_eq!(metadata.title().unwrap(), "The_Matrix");
        assert_eq!(metadata.text(keys::YEAR).unwrap(), "1999");
        assert_eq!(metadata.text(keys::ORIGINAL_TITLE).unwrap(), "DVD_VIDEO");
        assert!(!metadata.flag(keys::NEEDS_IDENTIFICATION));
        assert!(metadata.text(keys::IDENTIFIED_AT).is_some());
        assert_eq!(metadata.path(keys::MKV_PATH).unwrap(), staging.join("The Matrix (1999).mkv"));
        assert_eq!(metadata.text(keys::NAS_PATH).unwrap(), "/volume1/Movies/DVD_VIDEO.mkv");
        assert_eq!(metadata.text("handbrake_preset").unwrap(), "HQ 1080p");
    }

    #[tokio::test]
    async fn test_rename_item_skips_remote_artifacts() {
        let temp_dir = TempDir::new().unwrap();
        let staging = temp_dir.path();
        let store = StateStore::new(staging);
        seed(
            staging,
            "DISC1-5.image-ready",
            json!({ "title": "DISC1", "iso_path": "/elsewhere/DISC1-5.iso" }),
        );

        let record = store.open("DISC1-5.image-ready").await.unwrap();
        let renamed = store.rename_item(&record, "Heat", None).await.unwrap();

        assert_eq!(renamed.state_file, "Heat-5.image-ready");
        assert!(renamed.year.is_none());
        let updated = store.open("Heat-5.image-ready").await.unwrap();
        assert_eq!(updated.metadata.text(keys::ISO_PATH).unwrap(), "/elsewhere/DISC1-5.iso");
        assert_eq!(updated.metadata.timestamp().unwrap(), "5");
    }

    #[tokio::test]
    async fn test_rename_item_rejects_bad_input() {
        let temp_dir = TempDir::new().unwrap();
        let staging = temp_dir.path();
        let store = StateStore::new(staging);
        seed(staging, "DVD-1.encoding", json!({}));
        seed(staging, "DVD-2.image-ready", json!({}));
        seed(staging, "Heat-2.image-ready", json!({}));

        let encoding = store.open("DVD-1.encoding").await.unwrap();
        let err = store.rename_item(&encoding, "Heat", None).await.unwrap_err();
        assert!(err.to_string().contains("Cannot rename items in 'encoding' state"));

        let waiting = store.open("DVD-2.image-ready").await.unwrap();
        for (title, year, message) in [
            ("  ", None, "Title is required"),
            ("Heat", Some("95"), "Year must be 4 digits"),
            ("Heat", None, "Heat-2.image-ready already exists"),
        ] {
            let err = store.rename_item(&waiting, title, year).await.unwrap_err();
            assert!(err.to_string().contains(message), "{err}");
        }
        assert!(staging.join("DVD-2.image-ready").exists());
    }

    #[tokio::test]
    async fn test_dismiss_identification() {
        let temp_dir = TempDir::new().unwrap();
        let staging = temp_dir.path();
        let store = StateStore::new(staging);
        let preview = staging.join("DVD-1.preview.mp4");
        fs::write(&preview, "clip").unwrap();
        seed(
            staging,
            "DVD-1.image-ready",
            json!({ "needs_identification": true, "preview_path": preview }),
        );

        let record = store.open("DVD-1.image-ready").await.unwrap();
        let report = store.dismiss_identification(&record).await.unwrap();
        assert!(!report.has_failures());
        assert!(!preview.exists());

        let updated = store.open("DVD-1.image-ready").await.unwrap();
        assert!(!updated.metadata.flag(keys::NEEDS_IDENTIFICATION));
        assert!(updated.metadata.text(keys::PREVIEW_PATH).is_none());
        assert!(store.pending_identification().await.unwrap().is_empty());
    }
}
