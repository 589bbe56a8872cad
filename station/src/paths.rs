//! On-disk layout for a state/cache root pair
//!
//! ```text
//! <state_root>/
//! ├── logs/activity.log
//! ├── logs/metrics.log
//! ├── logs/all.log
//! ├── logs/modules/<name>.log
//! ├── logs/station-host.log
//! ├── secrets/station_id
//! ├── modules/<name>/          module state
//! └── station.lock
//! <cache_root>/
//! └── module-cache/<name>/      module cache
//! ```

use std::path::{Path, PathBuf};

/// Default file name of the identity keystore under `secrets/`
pub const IDENTITY_FILE_NAME: &str = "station_id";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    state_root: PathBuf,
    cache_root: PathBuf,
}

impl StatePaths {
    pub fn new(state_root: impl Into<PathBuf>, cache_root: impl Into<PathBuf>) -> Self {
        Self {
            state_root: state_root.into(),
            cache_root: cache_root.into(),
        }
    }

    /// Platform default roots (`~/.local/state/station`, `~/.cache/station` on Linux)
    pub fn default_roots() -> Self {
        let state_root = dirs::state_dir()
            .or_else(dirs::data_local_dir)
            .unwrap_or_else(|| PathBuf::from(".station"))
            .join("station");
        let cache_root = dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from(".station-cache"))
            .join("station");
        Self::new(state_root, cache_root)
    }

    pub fn state_root(&self) -> &Path {
        &self.state_root
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.state_root.join("logs")
    }

    pub fn activity_log(&self) -> PathBuf {
        self.logs_dir().join("activity.log")
    }

    pub fn metrics_log(&self) -> PathBuf {
        self.logs_dir().join("metrics.log")
    }

    pub fn all_log(&self) -> PathBuf {
        self.logs_dir().join("all.log")
    }

    pub fn module_log(&self, module: &str) -> PathBuf {
        self.logs_dir().join("modules").join(format!("{}.log", module))
    }

    pub fn host_log(&self) -> PathBuf {
        self.logs_dir().join("station-host.log")
    }

    pub fn secrets_dir(&self) -> PathBuf {
        self.state_root.join("secrets")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.state_root.join("station.lock")
    }

    /// Working/state directory handed to a module
    pub fn module_state_dir(&self, module: &str) -> PathBuf {
        self.state_root.join("modules").join(module)
    }

    /// Cache directory handed to a module
    pub fn module_cache_dir(&self, module: &str) -> PathBuf {
        self.cache_root.join("module-cache").join(module)
    }
}
