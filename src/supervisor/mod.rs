//! Killing pipeline workers and reverting the work they left behind.
//!
//! Operator cancel and kill-runaway-process share [`StageConfig`], so an item
//! always lands in the same place no matter which path stopped its worker.

mod report;
mod table;

pub use report::{CleanupReport, Outcome, Step, StepOutcome};
pub use table::StageConfig;

use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs as async_fs;
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::locks::{LockFamily, LockId, LockRegistry};
use crate::process::{ProcessKind, ProcessTable, SignalError, Termination};
use crate::state::{keys, Record, StateStore};

const LIVENESS_POLL: Duration = Duration::from_millis(100);

/// How a process ended up terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminated {
    Gracefully,
    Forcefully,
}

/// Result of a kill-with-cleanup
#[derive(Debug, Clone)]
pub struct KillOutcome {
    pub pid: u32,
    pub kind: ProcessKind,
    pub report: CleanupReport,
}

impl KillOutcome {
    pub fn message(&self) -> String {
        self.report.summary()
    }
}

pub struct Supervisor {
    store: StateStore,
    locks: LockRegistry,
    processes: Arc<dyn ProcessTable>,
    grace: Duration,
}

impl Supervisor {
    pub fn new(
        store: StateStore,
        locks: LockRegistry,
        processes: Arc<dyn ProcessTable>,
        grace: Duration,
    ) -> Self {
        Self {
            store,
            locks,
            processes,
            grace,
        }
    }

    /// Kill a pipeline worker and revert every record in the stage it runs.
    ///
    /// Refuses, without touching anything, any pid whose command line does
    /// not carry a worker signature.
    pub async fn kill_with_cleanup(&self, pid: u32) -> PipelineResult<KillOutcome> {
        let not_ours = || PipelineError::NotOurs(format!("PID {pid} is not a recognized process"));
        let command = self.processes.command_line(pid).ok_or_else(not_ours)?;
        let kind = ProcessKind::classify(&command).ok_or_else(not_ours)?;
        let stage = kind.stage();
        let config = StageConfig::lookup(&stage).ok_or_else(not_ours)?;

        info!("🛑 Killing PID {} ({}) running stage {}", pid, kind.as_str(), stage);
        let how = self.terminate(pid).await?;

        let mut report = CleanupReport::new();
        report.done(
            Step::Terminate,
            match how {
                Terminated::Gracefully => format!("Killed PID {pid} ({})", kind.as_str()),
                Terminated::Forcefully => format!("Force-killed PID {pid} ({})", kind.as_str()),
            },
        );

        if let Some(family) = config.lock {
            self.release_locks(family, Some(pid), &mut report);
        }

        match self.store.enumerate(&stage).await {
            Ok(records) => {
                for record in records {
                    match self.store.transition(&record, config.revert_to.as_ref()).await {
                        Ok(message) => report.done(Step::Transition, message),
                        Err(e) => report.failed(
                            Step::Transition,
                            format!("Failed to clean up {}: {}", record.file_name, e),
                        ),
                    }
                }
            }
            Err(e) => report.failed(Step::Transition, format!("Could not list {stage} records: {e}")),
        }

        Ok(KillOutcome { pid, kind, report })
    }

    /// Cancel one queue item by record file name.
    ///
    /// Every step before the final transition is best effort. The call only
    /// fails when the record is missing, not cancellable, or cannot be moved.
    pub async fn cancel_queue_item(
        &self,
        file_name: &str,
        delete_files: bool,
    ) -> PipelineResult<CleanupReport> {
        let record = self.store.open(file_name).await?;
        let config = StageConfig::lookup(&record.stage)
            .ok_or_else(|| PipelineError::NotCancellable(record.stage.to_string()))?;

        info!("Cancelling {} (stage {})", record.file_name, record.stage);
        let mut report = CleanupReport::new();

        if let Some(family) = config.lock {
            // Only a stopped owner's lock goes; a survivor keeps its lock
            let mut stopped = None;
            match self.owner_for(&record, family) {
                Some(pid) => match self.terminate(pid).await {
                    Ok(Terminated::Gracefully) => {
                        report.done(Step::Terminate, format!("Killed process {pid}"));
                        stopped = Some(pid);
                    }
                    Ok(Terminated::Forcefully) => {
                        report.done(Step::Terminate, format!("Force-killed process {pid}"));
                        stopped = Some(pid);
                    }
                    Err(SignalError::PermissionDenied(_)) => report.failed(
                        Step::Terminate,
                        format!("Permission denied killing PID {pid}"),
                    ),
                    Err(e) => report.failed(Step::Terminate, format!("Could not kill process: {e}")),
                },
                None => report.skipped(Step::Terminate, format!("No live {family} process")),
            }
            self.release_locks(family, stopped, &mut report);
        }

        if let Some(key) = config.partial_artifact {
            remove_artifact(&record, key, Step::RemovePartial, &mut report).await;
        }
        if delete_files {
            if let Some(key) = config.queued_artifact {
                remove_artifact(&record, key, Step::RemoveQueued, &mut report).await;
            }
        }

        let message = self
            .store
            .transition(&record, config.revert_to.as_ref())
            .await?;
        report.done(Step::Transition, message);

        if report.has_failures() {
            warn!("Cancel of {} left leftovers: {}", file_name, report.summary());
        }
        Ok(report)
    }

    /// SIGTERM, wait out the grace window, then SIGKILL if still alive
    pub async fn terminate(&self, pid: u32) -> Result<Terminated, SignalError> {
        self.processes.signal(pid, Termination::Graceful)?;

        let deadline = Instant::now() + self.grace;
        while Instant::now() < deadline {
            if !self.processes.is_alive(pid) {
                return Ok(Terminated::Gracefully);
            }
            sleep(LIVENESS_POLL.min(self.grace)).await;
        }

        if !self.processes.is_alive(pid) {
            return Ok(Terminated::Gracefully);
        }
        warn!("PID {} survived SIGTERM, sending SIGKILL", pid);
        match self.processes.signal(pid, Termination::Forceful) {
            Ok(()) | Err(SignalError::NoSuchProcess(_)) => Ok(Terminated::Forcefully),
            Err(e) => Err(e),
        }
    }

    /// The process working on `record`. A recorded encoder slot pins the
    /// lookup to that slot's lock so a parallel sibling is never killed.
    fn owner_for(&self, record: &Record, family: LockFamily) -> Option<u32> {
        if family == LockFamily::Encoder {
            if let Some(slot) = record.metadata.text(keys::ENCODER_SLOT) {
                let status = self.locks.check(&LockId::shard(family, slot));
                return status.pid.filter(|_| status.active);
            }
        }
        self.locks.find_owner(family)
    }

    fn release_locks(&self, family: LockFamily, holder: Option<u32>, report: &mut CleanupReport) {
        for (lock, result) in self.locks.release(family, holder) {
            match result {
                Ok(()) => report.done(Step::ReleaseLock, format!("Removed {lock}")),
                Err(e) => report.failed(Step::ReleaseLock, format!("Could not remove {lock}: {e}")),
            }
        }
    }
}

async fn remove_artifact(record: &Record, key: &str, step: Step, report: &mut CleanupReport) {
    let Some(path) = record.metadata.path(key) else {
        report.skipped(step, format!("No {key} recorded"));
        return;
    };
    let label = if step == Step::RemovePartial {
        "partial"
    } else {
        "queued"
    };

    match async_fs::remove_file(&path).await {
        Ok(()) => report.done(step, format!("Removed {label} file {}", path.display())),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            report.skipped(step, format!("{} already absent", path.display()))
        }
        Err(e) => report.failed(step, format!("Could not delete {}: {}", path.display(), e)),
    }
}
