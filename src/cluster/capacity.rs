use serde::{Deserialize, Serialize};

use crate::config::Config;

/// Recent system load and the parallelism it is measured against
pub trait LoadSource: Send + Sync {
    /// 1- and 5-minute load averages
    fn load_average(&self) -> (f64, f64);
    fn cpu_count(&self) -> usize;
}

/// Load as reported by the operating system
#[derive(Debug, Default)]
pub struct SystemLoad;

impl LoadSource for SystemLoad {
    fn load_average(&self) -> (f64, f64) {
        let load = sysinfo::System::load_average();
        (load.one, load.five)
    }

    fn cpu_count(&self) -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

/// Fixed readings, for tests and dry runs
#[derive(Debug, Clone)]
pub struct StaticLoad {
    pub load_1m: f64,
    pub load_5m: f64,
    pub cpus: usize,
}

impl StaticLoad {
    pub fn idle(cpus: usize) -> Self {
        Self {
            load_1m: 0.0,
            load_5m: 0.0,
            cpus,
        }
    }
}

impl LoadSource for StaticLoad {
    fn load_average(&self) -> (f64, f64) {
        (self.load_1m, self.load_5m)
    }

    fn cpu_count(&self) -> usize {
        self.cpus
    }
}

/// Whether this node can take another encode, and why
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capacity {
    pub available: bool,
    pub load_1m: f64,
    #[serde(default)]
    pub load_5m: f64,
    pub max_load: f64,
    #[serde(default)]
    pub cpu_count: usize,
    pub slots_total: usize,
    pub slots_used: usize,
    pub slots_free: usize,
    #[serde(default)]
    pub queue_depth: usize,
    #[serde(default)]
    pub transfer_mode: String,
}

impl Capacity {
    pub fn compute(
        config: &Config,
        load: &dyn LoadSource,
        running_encoders: usize,
        queue_depth: usize,
    ) -> Self {
        let (load_1m, load_5m) = load.load_average();
        let cpu_count = load.cpu_count().max(1);
        let max_load = cpu_count as f64 * config.load_threshold;

        let slots_total = config.encoder_slots();
        let slots_free = slots_total.saturating_sub(running_encoders);

        Self {
            available: load_1m < max_load && slots_free > 0,
            load_1m,
            load_5m,
            max_load: (max_load * 100.0).round() / 100.0,
            cpu_count,
            slots_total,
            slots_used: running_encoders,
            slots_free,
            queue_depth,
            transfer_mode: config.transfer_mode.clone(),
        }
    }
}

/// Capacity as served over HTTP, tagged with the answering node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapacityReport {
    #[serde(default)]
    pub node_name: String,
    #[serde(flatten)]
    pub capacity: Capacity,
}

/// One configured peer as last seen
#[derive(Debug, Clone, Serialize)]
pub struct PeerStatus {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub online: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capacity: Option<Capacity>,
}

impl PeerStatus {
    pub fn is_available(&self) -> bool {
        self.online && self.capacity.as_ref().is_some_and(|c| c.available)
    }

    pub fn slots_free(&self) -> usize {
        self.capacity.as_ref().map_or(0, |c| c.slots_free)
    }
}
