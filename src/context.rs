use std::sync::Arc;

use crate::cluster::{Coordinator, LoadSource, PeerClient, SystemLoad};
use crate::config::Config;
use crate::locks::LockRegistry;
use crate::process::{ProcessTable, SystemProcessTable};
use crate::state::StateStore;
use crate::supervisor::Supervisor;

/// Everything an operation needs from its surroundings.
///
/// Commands build one per invocation; the HTTP server shares one behind an
/// `Arc`.
pub struct AppContext {
    pub config: Arc<Config>,
    pub processes: Arc<dyn ProcessTable>,
    pub load: Arc<dyn LoadSource>,
    client: PeerClient,
}

impl AppContext {
    pub fn new(config: Config) -> Self {
        Self::with_parts(
            config,
            Arc::new(SystemProcessTable::new()),
            Arc::new(SystemLoad),
        )
    }

    pub fn with_parts(
        config: Config,
        processes: Arc<dyn ProcessTable>,
        load: Arc<dyn LoadSource>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            processes,
            load,
            client: PeerClient::new(),
        }
    }

    pub fn store(&self) -> StateStore {
        StateStore::new(&self.config.staging_dir)
    }

    pub fn locks(&self) -> LockRegistry {
        LockRegistry::new(&self.config.lock_dir, self.processes.clone())
    }

    pub fn supervisor(&self) -> Supervisor {
        Supervisor::new(
            self.store(),
            self.locks(),
            self.processes.clone(),
            self.config.kill_grace,
        )
    }

    pub fn coordinator(&self) -> Coordinator {
        Coordinator::new(
            self.config.clone(),
            self.store(),
            self.processes.clone(),
            self.load.clone(),
            self.client.clone(),
        )
    }
}
