//! Narrow interfaces to external collaborators
//!
//! The supervisor and buses only ever see these traits. Each one ships with a
//! local implementation so the host runs without any remote service configured.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::{debug, error};
use walkdir::WalkDir;

use crate::config::ModuleConfig;

/// Result of resolving a module's latest source bundle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceUpdate {
    /// Whether the content differs from the previously resolved version
    pub changed: bool,
    pub local_path: PathBuf,
}

/// Content-addressed fetch/cache of module sources. Must be idempotent.
#[async_trait]
pub trait SourceResolver: Send + Sync {
    async fn resolve_latest_source(&self, module: &ModuleConfig) -> eyre::Result<SourceUpdate>;
}

/// Best-effort lookup of scheduled rewards for a wallet address
#[async_trait]
pub trait RewardLookup: Send + Sync {
    async fn scheduled_rewards_for(&self, address: &str) -> eyre::Result<u128>;
}

/// Fire-and-forget error sink. Implementations must not block or panic.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, context: &str, error: &dyn fmt::Display);
}

/// Fire-and-forget time-series sink
pub trait TimeSeriesSink: Send + Sync {
    fn write_point(&self, name: &str, tags: &[(&str, &str)], fields: &[(&str, i64)]);
}

/// All collaborators consumed by the host, shared by reference
#[derive(Clone)]
pub struct Collaborators {
    pub sources: Arc<dyn SourceResolver>,
    pub rewards: Arc<dyn RewardLookup>,
    pub errors: Arc<dyn ErrorReporter>,
    pub telemetry: Arc<dyn TimeSeriesSink>,
}

impl Collaborators {
    /// Local-only collaborators
    pub fn local() -> Self {
        Self {
            sources: Arc::new(LocalSourceResolver::default()),
            rewards: Arc::new(NoRewards),
            errors: Arc::new(TracingErrorReporter),
            telemetry: Arc::new(TracingTimeSeries),
        }
    }
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

/// Treats `ModuleConfig::source` as a local directory and tracks a content fingerprint
#[derive(Debug, Default)]
pub struct LocalSourceResolver {
    fingerprints: Mutex<BTreeMap<String, String>>,
}

#[async_trait]
impl SourceResolver for LocalSourceResolver {
    async fn resolve_latest_source(&self, module: &ModuleConfig) -> eyre::Result<SourceUpdate> {
        debug!(module = %module.name, source = %module.source, "LocalSourceResolver::resolve_latest_source: called");
        let dir = PathBuf::from(&module.source);
        let walk_dir = dir.clone();
        let fingerprint = tokio::task::spawn_blocking(move || fingerprint_dir(&walk_dir)).await??;

        let mut known = self.fingerprints.lock().unwrap_or_else(|p| p.into_inner());
        let previous = known.insert(module.name.clone(), fingerprint.clone());
        let changed = previous.as_deref() != Some(fingerprint.as_str());
        debug!(module = %module.name, %fingerprint, changed, "LocalSourceResolver: resolved");

        Ok(SourceUpdate {
            changed,
            local_path: dir,
        })
    }
}

/// SHA-256 over relative paths and contents of every file under `dir`, in sorted order
pub fn fingerprint_dir(dir: &Path) -> eyre::Result<String> {
    if !dir.is_dir() {
        return Err(eyre::eyre!("Module source {} is not a directory", dir.display()));
    }

    let mut hasher = Sha256::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(dir).unwrap_or(entry.path());
        hasher.update(relative.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        hasher.update(std::fs::read(entry.path())?);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Reward lookup that never finds anything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRewards;

#[async_trait]
impl RewardLookup for NoRewards {
    async fn scheduled_rewards_for(&self, _address: &str) -> eyre::Result<u128> {
        Ok(0)
    }
}

/// Writes reports to the host log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorReporter;

impl ErrorReporter for TracingErrorReporter {
    fn report(&self, context: &str, error: &dyn fmt::Display) {
        error!(context, error = %error, "reported error");
    }
}

/// Writes time-series points to the host log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTimeSeries;

impl TimeSeriesSink for TracingTimeSeries {
    fn write_point(&self, name: &str, tags: &[(&str, &str)], fields: &[(&str, i64)]) {
        debug!(name, ?tags, ?fields, "time-series point");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn module(name: &str, source: &Path) -> ModuleConfig {
        ModuleConfig {
            name: name.to_string(),
            executable: "node".to_string(),
            args: Vec::new(),
            source: source.to_string_lossy().into_owned(),
            env: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_local_resolver_detects_changes() {
        let temp = tempdir().unwrap();
        std::fs::write(temp.path().join("main.js"), "console.log(1)").unwrap();
        let resolver = LocalSourceResolver::default();
        let m = module("spark", temp.path());

        let first = resolver.resolve_latest_source(&m).await.unwrap();
        assert!(first.changed);
        assert_eq!(first.local_path, temp.path());

        let second = resolver.resolve_latest_source(&m).await.unwrap();
        assert!(!second.changed);

        std::fs::write(temp.path().join("main.js"), "console.log(2)").unwrap();
        let third = resolver.resolve_latest_source(&m).await.unwrap();
        assert!(third.changed);
    }

    #[tokio::test]
    async fn test_local_resolver_missing_dir_fails() {
        let temp = tempdir().unwrap();
        let resolver = LocalSourceResolver::default();
        let m = module("spark", &temp.path().join("missing"));
        assert!(resolver.resolve_latest_source(&m).await.is_err());
    }

    #[test]
    fn test_fingerprint_includes_file_names() {
        let a = tempdir().unwrap();
        let b = tempdir().unwrap();
        std::fs::write(a.path().join("one.js"), "x").unwrap();
        std::fs::write(b.path().join("two.js"), "x").unwrap();
        assert_ne!(fingerprint_dir(a.path()).unwrap(), fingerprint_dir(b.path()).unwrap());
    }
}
