use crate::models::{Media, MediaId, OperationCaps, OperationOptions, Page};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Operations a source may support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Search,
    Browse,
    Resolve,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Search => "search",
            Operation::Browse => "browse",
            Operation::Resolve => "resolve",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capability flags describing which operations a source supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SourceCapabilities {
    pub search: bool,
    pub browse: bool,
    pub resolve: bool,
}

impl SourceCapabilities {
    pub fn all() -> Self {
        Self {
            search: true,
            browse: true,
            resolve: true,
        }
    }

    pub fn supports(&self, operation: Operation) -> bool {
        match operation {
            Operation::Search => self.search,
            Operation::Browse => self.browse,
            Operation::Resolve => self.resolve,
        }
    }

    pub fn operations(&self) -> Vec<Operation> {
        [Operation::Search, Operation::Browse, Operation::Resolve]
            .into_iter()
            .filter(|op| self.supports(*op))
            .collect()
    }
}

/// Common categories of source failures surfaced to the coordinator/CLI.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("network error: {message}")]
    Network { message: String },
    #[error("entity not found: {entity}")]
    NotFound { entity: String },
    #[error("operation not supported: {operation}")]
    NotSupported { operation: String },
    #[error("timed out after {millis}ms")]
    Timeout { millis: u64 },
    #[error("{message}")]
    Other { message: String },
}

impl SourceError {
    pub fn not_supported(operation: Operation) -> Self {
        SourceError::NotSupported {
            operation: operation.to_string(),
        }
    }
}

pub type SourceResult<T> = Result<T, SourceError>;

/// A content source: the local library, an external plugin, anything that can
/// answer queries with [`Media`].
#[async_trait::async_trait]
pub trait Source: Send + Sync {
    /// Stable source identifier (e.g., "music" or "podcasts").
    fn id(&self) -> &str;

    /// Human-friendly source name.
    fn name(&self) -> &str;

    fn capabilities(&self) -> SourceCapabilities;

    /// Limits for a given operation. Defaults to no limits.
    fn caps(&self, _operation: Operation) -> OperationCaps {
        OperationCaps::default()
    }

    /// Whether the source can still serve requests. Unavailable sources are
    /// pruned from the registry.
    fn is_available(&self) -> bool {
        true
    }

    async fn search(&self, query: &str, options: &OperationOptions) -> SourceResult<Page<Media>>;

    /// Lists the children of `container`, or the source's top level when `None`.
    async fn browse(
        &self,
        _container: Option<&MediaId>,
        _options: &OperationOptions,
    ) -> SourceResult<Page<Media>> {
        Err(SourceError::not_supported(Operation::Browse))
    }

    async fn resolve(&self, _id: &MediaId) -> SourceResult<Media> {
        Err(SourceError::not_supported(Operation::Resolve))
    }

    /// Re-read whatever backs the source so later searches see new content.
    /// Long-running hosts call this periodically. Defaults to a no-op.
    async fn refresh(&self) -> SourceResult<()> {
        Ok(())
    }
}

/// Snapshot of a registered source, cheap to clone and send across tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceInfo {
    pub id: String,
    pub name: String,
    pub capabilities: SourceCapabilities,
}

impl SourceInfo {
    pub fn of(source: &dyn Source) -> Self {
        Self {
            id: source.id().to_string(),
            name: source.name().to_string(),
            capabilities: source.capabilities(),
        }
    }
}
