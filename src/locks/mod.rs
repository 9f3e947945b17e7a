//! Advisory lock inspection.
//!
//! Workers write their pid into `{family}.lock` (singleton) or
//! `{family}-{shard}.lock` (sharded) before touching a stage. A lock counts
//! as held only while that pid is in the process table, so a worker that
//! crashed without cleaning up never wedges its stage.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::process::ProcessTable;

/// Pseudo-shard name for an unsharded lock file in a sharded family
pub const LEGACY_SHARD: &str = "legacy";

/// Named resource a stage's worker must hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LockFamily {
    /// Disc imaging, sharded by optical device (`image-sr0.lock`)
    Image,
    Distribute,
    /// Encoding, sharded by parallel slot (`encoder-1.lock`)
    Encoder,
    /// NAS transfer, sharded by parallel slot (`transfer-1.lock`)
    Transfer,
    Archive,
}

impl LockFamily {
    pub const ALL: [LockFamily; 5] = [
        LockFamily::Image,
        LockFamily::Distribute,
        LockFamily::Encoder,
        LockFamily::Transfer,
        LockFamily::Archive,
    ];

    pub fn stem(self) -> &'static str {
        match self {
            LockFamily::Image => "image",
            LockFamily::Distribute => "distribute",
            LockFamily::Encoder => "encoder",
            LockFamily::Transfer => "transfer",
            LockFamily::Archive => "archive",
        }
    }

    pub fn is_sharded(self) -> bool {
        matches!(
            self,
            LockFamily::Image | LockFamily::Encoder | LockFamily::Transfer
        )
    }
}

impl fmt::Display for LockFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.stem())
    }
}

/// One lock file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockId {
    pub family: LockFamily,
    /// `None` for singletons and legacy unsharded files
    pub shard: Option<String>,
}

impl LockId {
    pub fn singleton(family: LockFamily) -> Self {
        Self {
            family,
            shard: None,
        }
    }

    pub fn shard(family: LockFamily, shard: impl Into<String>) -> Self {
        Self {
            family,
            shard: Some(shard.into()),
        }
    }

    pub fn file_name(&self) -> String {
        match &self.shard {
            Some(shard) => format!("{}-{}.lock", self.family.stem(), shard),
            None => format!("{}.lock", self.family.stem()),
        }
    }

    /// Key used in status maps
    pub fn shard_label(&self) -> &str {
        self.shard.as_deref().unwrap_or(LEGACY_SHARD)
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_name())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LockStatus {
    pub active: bool,
    pub pid: Option<u32>,
}

/// Status of a whole family. `active` is the OR over all shards; `shards`
/// is only present for sharded families.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FamilyStatus {
    pub active: bool,
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shards: Option<BTreeMap<String, LockStatus>>,
}

/// Reads lock files under one lock directory
#[derive(Clone)]
pub struct LockRegistry {
    lock_dir: PathBuf,
    processes: Arc<dyn ProcessTable>,
}

impl LockRegistry {
    pub fn new(lock_dir: impl Into<PathBuf>, processes: Arc<dyn ProcessTable>) -> Self {
        Self {
            lock_dir: lock_dir.into(),
            processes,
        }
    }

    pub fn lock_dir(&self) -> &Path {
        &self.lock_dir
    }

    pub fn path_of(&self, lock: &LockId) -> PathBuf {
        self.lock_dir.join(lock.file_name())
    }

    /// Liveness of one lock. Anything other than a readable pid that is in
    /// the process table reads as inactive.
    pub fn check(&self, lock: &LockId) -> LockStatus {
        self.check_path(&self.path_of(lock))
    }

    fn check_path(&self, path: &Path) -> LockStatus {
        match read_pid(path) {
            Some(pid) if self.processes.is_alive(pid) => LockStatus {
                active: true,
                pid: Some(pid),
            },
            _ => LockStatus::default(),
        }
    }

    /// The pid recorded in a lock file, live or not
    pub fn recorded_pid(&self, lock: &LockId) -> Option<u32> {
        read_pid(&self.path_of(lock))
    }

    /// Every lock file present for `family`: shards in name order, then the
    /// unsharded file
    pub fn family_locks(&self, family: LockFamily) -> Vec<LockId> {
        let mut locks = Vec::new();

        if family.is_sharded() {
            let prefix = format!("{}-", family.stem());
            let pattern = format!(
                "{}/{}*.lock",
                glob::Pattern::escape(&self.lock_dir.to_string_lossy()),
                prefix
            );
            match glob::glob(&pattern) {
                Ok(paths) => {
                    let mut shards: Vec<String> = paths
                        .filter_map(|p| p.ok())
                        .filter_map(|p| {
                            let name = p.file_name()?.to_str()?.to_string();
                            let shard = name.strip_prefix(&prefix)?.strip_suffix(".lock")?;
                            (!shard.is_empty()).then(|| shard.to_string())
                        })
                        .collect();
                    shards.sort();
                    locks.extend(shards.into_iter().map(|s| LockId::shard(family, s)));
                }
                Err(e) => warn!("Bad lock glob {}: {}", pattern, e),
            }
        }

        let unsharded = LockId::singleton(family);
        if self.path_of(&unsharded).exists() {
            locks.push(unsharded);
        }
        locks
    }

    pub fn family_status(&self, family: LockFamily) -> FamilyStatus {
        if !family.is_sharded() {
            let status = self.check(&LockId::singleton(family));
            return FamilyStatus {
                active: status.active,
                pid: status.pid,
                shards: None,
            };
        }

        let shards: BTreeMap<String, LockStatus> = self
            .family_locks(family)
            .into_iter()
            .map(|lock| {
                let status = self.check(&lock);
                (lock.shard_label().to_string(), status)
            })
            .collect();

        FamilyStatus {
            active: shards.values().any(|s| s.active),
            pid: None,
            shards: Some(shards),
        }
    }

    /// Status of every family
    pub fn status_all(&self) -> BTreeMap<LockFamily, FamilyStatus> {
        LockFamily::ALL
            .iter()
            .map(|family| (*family, self.family_status(*family)))
            .collect()
    }

    /// First live lock in a family, with its owner
    pub fn find_owner_lock(&self, family: LockFamily) -> Option<(LockId, u32)> {
        self.family_locks(family).into_iter().find_map(|lock| {
            let status = self.check(&lock);
            status.pid.filter(|_| status.active).map(|pid| (lock, pid))
        })
    }

    /// Pid of the first live lock holder in a family
    pub fn find_owner(&self, family: LockFamily) -> Option<u32> {
        self.find_owner_lock(family).map(|(_, pid)| pid)
    }

    /// Locks in `family` that are dead or recorded as held by `holder`
    pub fn releasable(&self, family: LockFamily, holder: Option<u32>) -> Vec<LockId> {
        self.family_locks(family)
            .into_iter()
            .filter(|lock| {
                let recorded = self.recorded_pid(lock);
                (holder.is_some() && recorded == holder) || !self.check(lock).active
            })
            .collect()
    }

    /// Remove every lock in `family` that is dead or held by `holder`.
    /// Each removal's result is returned; none aborts the others.
    pub fn release(
        &self,
        family: LockFamily,
        holder: Option<u32>,
    ) -> Vec<(LockId, PipelineResult<()>)> {
        self.releasable(family, holder)
            .into_iter()
            .map(|lock| {
                let result = self.remove(&lock);
                (lock, result)
            })
            .collect()
    }

    /// Delete one lock file; an already missing file is not an error
    pub fn remove(&self, lock: &LockId) -> PipelineResult<()> {
        let path = self.path_of(lock);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                debug!("Removed lock {:?}", path);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PipelineError::io(format!("removing {path:?}"), e)),
        }
    }
}

fn read_pid(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path)
        .ok()?
        .trim()
        .parse::<u32>()
        .ok()
        .filter(|pid| *pid > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::InMemoryProcessTable;
    use std::fs;
    use tempfile::TempDir;

    fn registry(dir: &TempDir) -> (LockRegistry, Arc<InMemoryProcessTable>) {
        let table = Arc::new(InMemoryProcessTable::new());
        (LockRegistry::new(dir.path(), table.clone()), table)
    }

    #[test]
    fn test_check_live_and_stale() {
        let temp_dir = TempDir::new().unwrap();
        let (registry, table) = registry(&temp_dir);
        table.spawn(4242, "HandBrakeCLI");
        fs::write(temp_dir.path().join("encoder-1.lock"), "4242\n").unwrap();
        fs::write(temp_dir.path().join("encoder-2.lock"), "4343").unwrap();

        let live = registry.check(&LockId::shard(LockFamily::Encoder, "1"));
        assert_eq!(live, LockStatus { active: true, pid: Some(4242) });

        let stale = registry.check(&LockId::shard(LockFamily::Encoder, "2"));
        assert!(!stale.active);
        assert_eq!(stale.pid, None);
    }

    #[test]
    fn test_check_fails_open_on_garbage() {
        let temp_dir = TempDir::new().unwrap();
        let (registry, table) = registry(&temp_dir);
        table.spawn(1, "init");
        fs::write(temp_dir.path().join("distribute.lock"), "").unwrap();
        fs::write(temp_dir.path().join("archive.lock"), "not-a-pid").unwrap();

        assert!(!registry.check(&LockId::singleton(LockFamily::Distribute)).active);
        assert!(!registry.check(&LockId::singleton(LockFamily::Archive)).active);
        assert!(!registry.check(&LockId::shard(LockFamily::Image, "sr9")).active);
    }

    #[test]
    fn test_status_all_folds_legacy_shard() {
        let temp_dir = TempDir::new().unwrap();
        let (registry, table) = registry(&temp_dir);
        table.spawn(300, "rsync");
        fs::write(temp_dir.path().join("transfer-1.lock"), "299").unwrap();
        fs::write(temp_dir.path().join("transfer.lock"), "300").unwrap();
        fs::write(temp_dir.path().join("image-sr0.lock"), "299").unwrap();

        let status = registry.status_all();

        let transfer = &status[&LockFamily::Transfer];
        let shards = transfer.shards.as_ref().unwrap();
        assert_eq!(shards.len(), 2);
        assert!(!shards["1"].active);
        assert!(shards[LEGACY_SHARD].active);
        assert!(transfer.active);

        let image = &status[&LockFamily::Image];
        assert!(!image.active);
        assert_eq!(image.shards.as_ref().unwrap().len(), 1);

        let encoder = &status[&LockFamily::Encoder];
        assert!(!encoder.active);
        assert!(encoder.shards.as_ref().unwrap().is_empty());

        assert!(status[&LockFamily::Distribute].shards.is_none());
    }

    #[test]
    fn test_find_owner_skips_stale_shards() {
        let temp_dir = TempDir::new().unwrap();
        let (registry, table) = registry(&temp_dir);
        table.spawn(77, "ddrescue /dev/sr1");
        fs::write(temp_dir.path().join("image-sr0.lock"), "76").unwrap();
        fs::write(temp_dir.path().join("image-sr1.lock"), "77").unwrap();

        assert_eq!(registry.find_owner(LockFamily::Image), Some(77));
        assert_eq!(
            registry.find_owner_lock(LockFamily::Image).unwrap().0,
            LockId::shard(LockFamily::Image, "sr1")
        );
        assert_eq!(registry.find_owner(LockFamily::Encoder), None);
    }

    #[test]
    fn test_releasable_and_remove() {
        let temp_dir = TempDir::new().unwrap();
        let (registry, table) = registry(&temp_dir);
        table.spawn(10, "HandBrakeCLI");
        table.spawn(11, "HandBrakeCLI");
        fs::write(temp_dir.path().join("encoder-1.lock"), "10").unwrap();
        fs::write(temp_dir.path().join("encoder-2.lock"), "11").unwrap();
        fs::write(temp_dir.path().join("encoder-3.lock"), "12").unwrap();

        let releasable = registry.releasable(LockFamily::Encoder, Some(10));
        let names: Vec<String> = releasable.iter().map(LockId::file_name).collect();
        assert_eq!(names, vec!["encoder-1.lock", "encoder-3.lock"]);

        for lock in &releasable {
            registry.remove(lock).unwrap();
        }
        assert!(!temp_dir.path().join("encoder-1.lock").exists());
        assert!(temp_dir.path().join("encoder-2.lock").exists());
        registry.remove(&releasable[0]).unwrap();
    }

    #[test]
    fn test_release_keeps_other_live_holders() {
        let temp_dir = TempDir::new().unwrap();
        let (registry, table) = registry(&temp_dir);
        table.spawn(20, "rsync");
        fs::write(temp_dir.path().join("transfer.lock"), "19").unwrap();
        fs::write(temp_dir.path().join("transfer-2.lock"), "20").unwrap();

        let released = registry.release(LockFamily::Transfer, None);
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].0, LockId::singleton(LockFamily::Transfer));
        assert!(released[0].1.is_ok());
        assert!(!temp_dir.path().join("transfer.lock").exists());
        assert!(temp_dir.path().join("transfer-2.lock").exists());
    }
}
