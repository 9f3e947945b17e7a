//! Process table access for liveness checks, worker classification and
//! termination.
//!
//! Everything that needs to know whether a pid exists goes through
//! [`ProcessTable`], so liveness is always read from the OS process table
//! (never checked by signalling) and tests can swap in
//! [`InMemoryProcessTable`].

use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, UpdateKind};
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::PipelineError;
use crate::state::Stage;

/// Binary whose live instances count as occupied encoder slots.
pub const ENCODER_BINARY: &str = "HandBrakeCLI";

/// Pipeline worker categories, recognized by command signature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessKind {
    Encoder,
    Imaging,
    Distribute,
    Archive,
    Transfer,
}

impl ProcessKind {
    /// Distribute and archive come before transfer: both scripts drive rsync.
    const SIGNATURES: &'static [(ProcessKind, &'static [&'static str])] = &[
        (ProcessKind::Encoder, &[ENCODER_BINARY, "dvd-encoder"]),
        (ProcessKind::Imaging, &["ddrescue", "dvd-iso"]),
        (ProcessKind::Distribute, &["dvd-distribute"]),
        (ProcessKind::Archive, &["dvd-archive"]),
        (ProcessKind::Transfer, &["rsync", "scp", "dvd-transfer"]),
    ];

    /// Classify a command line, or `None` if it is not a pipeline worker
    pub fn classify(command: &str) -> Option<Self> {
        Self::SIGNATURES
            .iter()
            .find(|(_, needles)| needles.iter().any(|n| command.contains(n)))
            .map(|(kind, _)| *kind)
    }

    /// The in-flight stage a worker of this kind occupies
    pub fn stage(self) -> Stage {
        match self {
            ProcessKind::Encoder => Stage::Encoding,
            ProcessKind::Imaging => Stage::ImageCreating,
            ProcessKind::Distribute => Stage::Distributing,
            ProcessKind::Archive => Stage::Archiving,
            ProcessKind::Transfer => Stage::Transferring,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProcessKind::Encoder => "encoder",
            ProcessKind::Imaging => "imaging",
            ProcessKind::Distribute => "distribute",
            ProcessKind::Archive => "archive",
            ProcessKind::Transfer => "transfer",
        }
    }
}

/// A live process recognized as a pipeline worker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineProcess {
    pub pid: u32,
    pub kind: ProcessKind,
    pub command: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// SIGTERM
    Graceful,
    /// SIGKILL
    Forceful,
}

#[derive(Debug, Error, PartialEq)]
pub enum SignalError {
    #[error("process {0} not found")]
    NoSuchProcess(u32),
    #[error("permission denied to signal pid {0}")]
    PermissionDenied(u32),
    #[error("failed to signal pid {pid}: {reason}")]
    Failed { pid: u32, reason: String },
}

impl From<SignalError> for PipelineError {
    fn from(err: SignalError) -> Self {
        let pid = match &err {
            SignalError::NoSuchProcess(pid) | SignalError::PermissionDenied(pid) => *pid,
            SignalError::Failed { pid, .. } => *pid,
        };
        PipelineError::Signal {
            pid,
            reason: err.to_string(),
        }
    }
}

/// Read access to the OS process table plus signal delivery
pub trait ProcessTable: Send + Sync {
    /// Whether `pid` is present (and not a zombie) in the process table
    fn is_alive(&self, pid: u32) -> bool;

    /// Full command line of `pid`, if it exists
    fn command_line(&self, pid: u32) -> Option<String>;

    /// All live processes matching a worker command signature
    fn pipeline_processes(&self) -> Vec<PipelineProcess>;

    fn signal(&self, pid: u32, termination: Termination) -> Result<(), SignalError>;

    /// Live processes whose command line contains `needle`
    fn count_matching(&self, needle: &str) -> usize {
        self.pipeline_processes()
            .iter()
            .filter(|p| p.command.contains(needle))
            .count()
    }
}

/// Run a full process table scan on the blocking pool.
///
/// Refreshing every process holds the table lock and reads `/proc`, which
/// must not stall an async worker thread.
pub async fn scan_processes<T, F>(table: Arc<dyn ProcessTable>, scan: F) -> T
where
    T: Default + Send + 'static,
    F: FnOnce(&dyn ProcessTable) -> T + Send + 'static,
{
    match tokio::task::spawn_blocking(move || scan(table.as_ref())).await {
        Ok(result) => result,
        Err(e) => {
            warn!("Process table scan aborted: {}", e);
            T::default()
        }
    }
}

/// [`ProcessTable`] backed by the real OS process table
pub struct SystemProcessTable {
    system: Mutex<sysinfo::System>,
}

impl SystemProcessTable {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(sysinfo::System::new_with_specifics(sysinfo::RefreshKind::nothing())),
        }
    }

    fn system(&self) -> MutexGuard<'_, sysinfo::System> {
        self.system.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn render_command(process: &sysinfo::Process) -> String {
        let parts: Vec<String> = process
            .cmd()
            .iter()
            .map(|part| part.to_string_lossy().into_owned())
            .collect();
        if parts.is_empty() {
            process.name().to_string_lossy().into_owned()
        } else {
            parts.join(" ")
        }
    }

    fn refresh_kind() -> ProcessRefreshKind {
        ProcessRefreshKind::nothing().with_cmd(UpdateKind::OnlyIfNotSet)
    }

    fn refresh_one(system: &mut sysinfo::System, pid: u32) -> Pid {
        let pid = Pid::from_u32(pid);
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            Self::refresh_kind(),
        );
        pid
    }
}

impl Default for SystemProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable for SystemProcessTable {
    fn is_alive(&self, pid: u32) -> bool {
        if pid == 0 {
            return false;
        }
        let mut system = self.system();
        let pid = Self::refresh_one(&mut system, pid);
        system
            .process(pid)
            .map(|p| p.status() != sysinfo::ProcessStatus::Zombie)
            .unwrap_or(false)
    }

    fn command_line(&self, pid: u32) -> Option<String> {
        if pid == 0 {
            return None;
        }
        let mut system = self.system();
        let pid = Self::refresh_one(&mut system, pid);
        system.process(pid).map(Self::render_command)
    }

    fn pipeline_processes(&self) -> Vec<PipelineProcess> {
        let mut system = self.system();
        system.refresh_processes_specifics(ProcessesToUpdate::All, true, Self::refresh_kind());

        let mut found: Vec<PipelineProcess> = system
            .processes()
            .iter()
            .filter(|(_, p)| p.status() != sysinfo::ProcessStatus::Zombie)
            .filter_map(|(pid, process)| {
                let command = Self::render_command(process);
                ProcessKind::classify(&command).map(|kind| PipelineProcess {
                    pid: pid.as_u32(),
                    kind,
                    command,
                })
            })
            .collect();
        found.sort_by_key(|p| p.pid);
        found
    }

    fn signal(&self, pid: u32, termination: Termination) -> Result<(), SignalError> {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid as NixPid;

        // pid 0 and negative pids address process groups
        let raw = i32::try_from(pid)
            .ok()
            .filter(|raw| *raw > 0)
            .ok_or(SignalError::NoSuchProcess(pid))?;
        let signal = match termination {
            Termination::Graceful => Signal::SIGTERM,
            Termination::Forceful => Signal::SIGKILL,
        };
        debug!("Sending {:?} to pid {}", signal, pid);

        kill(NixPid::from_raw(raw), signal).map_err(|errno| match errno {
            Errno::ESRCH => SignalError::NoSuchProcess(pid),
            Errno::EPERM => SignalError::PermissionDenied(pid),
            other => SignalError::Failed {
                pid,
                reason: other.to_string(),
            },
        })
    }
}

/// In-memory process table for tests and dry runs.
///
/// A graceful signal removes the process unless it was registered as
/// stubborn; a forceful signal always removes it.
#[derive(Debug, Default)]
pub struct InMemoryProcessTable {
    inner: Mutex<InMemoryState>,
}

#[derive(Debug, Default)]
struct InMemoryState {
    processes: BTreeMap<u32, String>,
    stubborn: HashSet<u32>,
    denied: HashSet<u32>,
    sent: Vec<(u32, Termination)>,
}

impl InMemoryProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, InMemoryState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn spawn(&self, pid: u32, command: impl Into<String>) {
        self.state().processes.insert(pid, command.into());
    }

    /// Register a process that ignores SIGTERM
    pub fn spawn_stubborn(&self, pid: u32, command: impl Into<String>) {
        let mut state = self.state();
        state.processes.insert(pid, command.into());
        state.stubborn.insert(pid);
    }

    /// Make every signal to `pid` fail with a permission error
    pub fn deny_signals(&self, pid: u32) {
        self.state().denied.insert(pid);
    }

    pub fn exit(&self, pid: u32) {
        self.state().processes.remove(&pid);
    }

    /// Signals delivered so far, in order
    pub fn signals_sent(&self) -> Vec<(u32, Termination)> {
        self.state().sent.clone()
    }
}

impl ProcessTable for InMemoryProcessTable {
    fn is_alive(&self, pid: u32) -> bool {
        self.state().processes.contains_key(&pid)
    }

    fn command_line(&self, pid: u32) -> Option<String> {
        self.state().processes.get(&pid).cloned()
    }

    fn pipeline_processes(&self) -> Vec<PipelineProcess> {
        self.state()
            .processes
            .iter()
            .filter_map(|(pid, command)| {
                ProcessKind::classify(command).map(|kind| PipelineProcess {
                    pid: *pid,
                    kind,
                    command: command.clone(),
                })
            })
            .collect()
    }

    fn signal(&self, pid: u32, termination: Termination) -> Result<(), SignalError> {
        let mut state = self.state();
        if state.denied.contains(&pid) {
            return Err(SignalError::PermissionDenied(pid));
        }
        if !state.processes.contains_key(&pid) {
            return Err(SignalError::NoSuchProcess(pid));
        }
        state.sent.push((pid, termination));
        if termination == Termination::Forceful || !state.stubborn.contains(&pid) {
            state.processes.remove(&pid);
        }
        Ok(())
    }
}
