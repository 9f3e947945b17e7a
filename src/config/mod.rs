use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::cluster::PeerSpec;

/// Shell-style config shared with the external pipeline workers.
pub const DEFAULT_CONFIG_FILE: &str = "/etc/dvd-ripper.conf";

/// Every key this crate consumes. Environment variables with the same name
/// override values from the config file.
const KNOWN_KEYS: &[&str] = &[
    "STAGING_DIR",
    "LOCK_DIR",
    "CLUSTER_ENABLED",
    "CLUSTER_NODE_NAME",
    "CLUSTER_PEERS",
    "ENABLE_PARALLEL_ENCODING",
    "MAX_PARALLEL_ENCODERS",
    "ENCODER_LOAD_THRESHOLD",
    "TRANSFER_MODE",
    "DASHBOARD_LISTEN",
    "KILL_GRACE_SECS",
];

/// Configuration for the pipeline core and its HTTP surface
#[derive(Debug, Clone)]
pub struct Config {
    pub staging_dir: PathBuf,
    pub lock_dir: PathBuf,
    pub cluster_enabled: bool,
    pub node_name: String,
    pub peers: Vec<PeerSpec>,
    pub parallel_encoding: bool,
    pub max_parallel_encoders: usize,
    /// Fraction of the cpu count the 1-minute load may reach before this
    /// node stops advertising capacity.
    pub load_threshold: f64,
    pub transfer_mode: String,
    pub listen_addr: String,
    /// Wait between SIGTERM and SIGKILL.
    pub kill_grace: Duration,
}

impl Config {
    /// Load configuration from the config file named by `DISCQ_CONFIG`
    /// (or the system default), with environment variables taking priority
    pub fn from_env() -> Self {
        let path = env::var("DISCQ_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        let mut settings = read_conf_file(Path::new(&path));

        for key in KNOWN_KEYS {
            if let Ok(value) = env::var(key) {
                settings.insert((*key).to_string(), value);
            }
        }

        Self::from_settings(&settings)
    }

    /// Build a config from raw `KEY -> value` pairs, falling back to defaults
    /// for anything missing or unparsable
    pub fn from_settings(settings: &HashMap<String, String>) -> Self {
        let defaults = Self::default();
        let get = |key: &str| settings.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());
        let flag = |key: &str, default: bool| get(key).map(|v| v == "1").unwrap_or(default);

        let peers = get("CLUSTER_PEERS")
            .map(|raw| {
                raw.split_whitespace()
                    .filter_map(|entry| match entry.parse::<PeerSpec>() {
                        Ok(peer) => Some(peer),
                        Err(e) => {
                            warn!("Skipping malformed peer entry '{}': {}", entry, e);
                            None
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            staging_dir: get("STAGING_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.staging_dir),
            lock_dir: get("LOCK_DIR").map(PathBuf::from).unwrap_or(defaults.lock_dir),
            cluster_enabled: flag("CLUSTER_ENABLED", defaults.cluster_enabled),
            node_name: get("CLUSTER_NODE_NAME")
                .map(str::to_string)
                .unwrap_or(defaults.node_name),
            peers,
            parallel_encoding: flag("ENABLE_PARALLEL_ENCODING", defaults.parallel_encoding),
            max_parallel_encoders: get("MAX_PARALLEL_ENCODERS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_parallel_encoders),
            load_threshold: get("ENCODER_LOAD_THRESHOLD")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.load_threshold),
            transfer_mode: get("TRANSFER_MODE")
                .map(str::to_string)
                .unwrap_or(defaults.transfer_mode),
            listen_addr: get("DASHBOARD_LISTEN")
                .map(str::to_string)
                .unwrap_or(defaults.listen_addr),
            kill_grace: get("KILL_GRACE_SECS")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.kill_grace),
        }
    }

    /// Total encoder slots this node offers
    pub fn encoder_slots(&self) -> usize {
        if self.parallel_encoding {
            self.max_parallel_encoders.max(1)
        } else {
            1
        }
    }

    pub fn peer(&self, name: &str) -> Option<&PeerSpec> {
        self.peers.iter().find(|p| p.name == name)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            staging_dir: PathBuf::from("/var/tmp/dvd-rips"),
            lock_dir: PathBuf::from("/run/dvd-ripper"),
            cluster_enabled: false,
            node_name: sysinfo::System::host_name().unwrap_or_else(|| "localhost".to_string()),
            peers: Vec::new(),
            parallel_encoding: false,
            max_parallel_encoders: 2,
            load_threshold: 0.8,
            transfer_mode: "remote".to_string(),
            listen_addr: "0.0.0.0:5000".to_string(),
            kill_grace: Duration::from_secs(2),
        }
    }
}

/// Parse a `KEY="value"` file. A missing or unreadable file yields no
/// settings rather than an error.
pub fn read_conf_file(path: &Path) -> HashMap<String, String> {
    match fs::read_to_string(path) {
        Ok(content) => parse_conf(&content),
        Err(e) => {
            debug!("Config file {:?} not readable ({}), using defaults", path, e);
            HashMap::new()
        }
    }
}

fn parse_conf(content: &str) -> HashMap<String, String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| {
            let value = value.trim().trim_matches('"').trim_matches('\'');
            (key.trim().to_string(), value.to_string())
        })
        .collect()
}
