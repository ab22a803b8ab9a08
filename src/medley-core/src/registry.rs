//! Registry of available sources and their lifecycle.
//!
//! Sources are kept in registration order. Every addition and removal is
//! broadcast as a [`SourceEvent`] so that long-running callers (the CLI's
//! follow mode) can react to sources appearing after a search started.

use crate::config::SourceEntry;
use crate::source::{Source, SourceError, SourceInfo};
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent {
    Added(SourceInfo),
    Removed(SourceInfo),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("a source with id '{id}' is already registered")]
    Duplicate { id: String },
}

/// Builds a live source from its configuration entry.
pub trait SourceLoader: Send + Sync {
    fn load(&self, id: &str, entry: &SourceEntry) -> Result<Arc<dyn Source>, SourceError>;
}

/// Outcome of [`SourceRegistry::load_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    /// Already registered or disabled.
    pub skipped: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl LoadReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct SourceRegistry {
    sources: RwLock<Vec<Arc<dyn Source>>>,
    events: broadcast::Sender<SourceEvent>,
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            sources: RwLock::new(Vec::new()),
            events,
        }
    }

    /// Receive every subsequent addition/removal.
    pub fn subscribe(&self) -> broadcast::Receiver<SourceEvent> {
        self.events.subscribe()
    }

    pub fn register(&self, source: Arc<dyn Source>) -> Result<(), RegistryError> {
        let info = SourceInfo::of(source.as_ref());
        {
            let mut sources = self.sources.write().unwrap_or_else(PoisonError::into_inner);
            if sources.iter().any(|s| s.id() == info.id) {
                return Err(RegistryError::Duplicate { id: info.id });
            }
            sources.push(source);
        }
        tracing::debug!(source_id = %info.id, "source registered");
        // No subscribers is fine.
        let _ = self.events.send(SourceEvent::Added(info));
        Ok(())
    }

    pub fn unregister(&self, id: &str) -> Option<Arc<dyn Source>> {
        let removed = {
            let mut sources = self.sources.write().unwrap_or_else(PoisonError::into_inner);
            let position = sources.iter().position(|s| s.id() == id)?;
            sources.remove(position)
        };
        tracing::debug!(source_id = %id, "source unregistered");
        let _ = self
            .events
            .send(SourceEvent::Removed(SourceInfo::of(removed.as_ref())));
        Some(removed)
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Source>> {
        self.read().iter().find(|s| s.id() == id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read().iter().any(|s| s.id() == id)
    }

    /// All sources in registration order.
    pub fn sources(&self) -> Vec<Arc<dyn Source>> {
        self.read().clone()
    }

    pub fn infos(&self) -> Vec<SourceInfo> {
        self.read().iter().map(|s| SourceInfo::of(s.as_ref())).collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Build and register every enabled entry not already present.
    ///
    /// Individual failures are logged and collected; loading continues.
    pub fn load_all(
        &self,
        entries: &BTreeMap<String, SourceEntry>,
        loader: &dyn SourceLoader,
    ) -> LoadReport {
        let mut report = LoadReport::default();
        for (id, entry) in entries {
            if !entry.enabled || self.contains(id) {
                report.skipped.push(id.clone());
                continue;
            }
            let loaded = loader
                .load(id, entry)
                .map_err(|e| e.to_string())
                .and_then(|source| self.register(source).map_err(|e| e.to_string()));
            match loaded {
                Ok(()) => report.loaded.push(id.clone()),
                Err(message) => {
                    tracing::warn!(source_id = %id, error = %message, "failed to load source");
                    report.failed.push((id.clone(), message));
                }
            }
        }
        report
    }

    /// Drop every source that reports itself unavailable.
    pub fn prune_unavailable(&self) -> Vec<String> {
        let stale: Vec<String> = self
            .read()
            .iter()
            .filter(|s| !s.is_available())
            .map(|s| s.id().to_string())
            .collect();
        stale
            .into_iter()
            .filter(|id| self.unregister(id).is_some())
            .collect()
    }

    /// Refresh every registered source, returning the ones that failed.
    pub async fn refresh_all(&self) -> Vec<(String, SourceError)> {
        let sources = self.sources();
        let mut failed = Vec::new();
        for source in sources {
            if let Err(err) = source.refresh().await {
                tracing::warn!(source_id = %source.id(), error = %err, "failed to refresh source");
                failed.push((source.id().to_string(), err));
            }
        }
        failed
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<Arc<dyn Source>>> {
        self.sources.read().unwrap_or_else(PoisonError::into_inner)
    }
}
