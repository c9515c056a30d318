//! Per-worker execution settings, computed once per worker identity.
//!
//! Computing settings is expensive (it usually means talking to a backend),
//! and every module running on the same runtime gets the same answer, so
//! the cache keeps one slot per [`WorkerIdentity`]. The map lock is held
//! only to find the slot; the provider runs under the slot's own lock, so
//! workers with different identities never wait on each other.

use anyhow::Context;
use civis_common::types::{ModuleExecutionSettings, WorkerIdentity};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

/// Source of settings for a worker identity.
pub trait SettingsProvider: Send + Sync {
    fn compute_settings(&self, identity: &WorkerIdentity) -> anyhow::Result<ModuleExecutionSettings>;
}

/// Hands out the same snapshot to every identity.
#[derive(Debug, Clone, Default)]
pub struct StaticSettingsProvider {
    settings: ModuleExecutionSettings,
}

impl StaticSettingsProvider {
    pub fn new(settings: ModuleExecutionSettings) -> Self {
        Self { settings }
    }
}

impl SettingsProvider for StaticSettingsProvider {
    fn compute_settings(&self, _identity: &WorkerIdentity) -> anyhow::Result<ModuleExecutionSettings> {
        Ok(self.settings.clone())
    }
}

/// Reads a JSON settings snapshot from disk on every compute.
#[derive(Debug, Clone)]
pub struct FileSettingsProvider {
    path: PathBuf,
}

impl FileSettingsProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsProvider for FileSettingsProvider {
    fn compute_settings(&self, identity: &WorkerIdentity) -> anyhow::Result<ModuleExecutionSettings> {
        debug!(%identity, path = ?self.path, "Reading settings snapshot");
        let raw = std::fs::read(&self.path)
            .with_context(|| format!("reading settings file {}", self.path.display()))?;
        serde_json::from_slice(&raw)
            .with_context(|| format!("parsing settings file {}", self.path.display()))
    }
}

type Slot = Arc<Mutex<Option<Arc<ModuleExecutionSettings>>>>;

pub struct SettingsCache {
    provider: Arc<dyn SettingsProvider>,
    slots: Mutex<HashMap<WorkerIdentity, Slot>>,
}

impl std::fmt::Debug for SettingsCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettingsCache")
            .field("identities", &self.slots.lock().unwrap().len())
            .finish()
    }
}

impl SettingsCache {
    pub fn new(provider: Arc<dyn SettingsProvider>) -> Self {
        Self {
            provider,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Settings for `identity`, computing them on first use.
    ///
    /// A failed computation leaves the slot empty, so the next caller retries.
    pub fn get_or_compute(
        &self,
        identity: &WorkerIdentity,
    ) -> anyhow::Result<Arc<ModuleExecutionSettings>> {
        let slot = {
            let mut slots = self.slots.lock().unwrap();
            Arc::clone(slots.entry(identity.clone()).or_default())
        };

        // A provider panic must not wedge the identity forever.
        let mut cached = slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(settings) = cached.as_ref() {
            return Ok(Arc::clone(settings));
        }
        let settings = Arc::new(self.provider.compute_settings(identity)?);
        info!(
            %identity,
            coverage = settings.code_coverage_enabled,
            skipping = settings.skip_enabled,
            "Computed module execution settings"
        );
        *cached = Some(Arc::clone(&settings));
        Ok(settings)
    }

    /// Settings for `identity` narrowed to the entries of one module.
    pub fn module_settings(
        &self,
        identity: &WorkerIdentity,
        module_name: &str,
    ) -> anyhow::Result<ModuleExecutionSettings> {
        Ok(self.get_or_compute(identity)?.narrow_to_module(module_name))
    }

    /// Number of identities with computed settings.
    pub fn computed(&self) -> usize {
        let slots: Vec<Slot> = self.slots.lock().unwrap().values().cloned().collect();
        slots
            .iter()
            .filter(|slot| slot.lock().unwrap_or_else(PoisonError::into_inner).is_some())
            .count()
    }
}
