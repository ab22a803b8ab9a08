pub mod aggregate;
pub mod config;
pub mod coordinator;
pub mod filter;
pub mod logging;
pub mod models;
pub mod paths;
pub mod playlist;
pub mod redact;
pub mod registry;
pub mod source;
pub mod source_contract;

pub use aggregate::{Aggregator, SearchHit};
pub use config::{
    Config, ConfigError, LogLevel, LoggingConfig, SearchConfig, SourceEntry, SourceKind,
    ValidationError,
};
pub use coordinator::{
    AggregatedResults, CoordinatorConfig, FanOut, OperationId, OutcomeStatus, SearchError,
    SearchEvent, SearchHandle, SourceOutcome,
};
pub use filter::CapabilityFilter;
pub use logging::{init_logging, LoggingError, LoggingGuard};
pub use paths::{AppDirs, DirsError};
pub use registry::{LoadReport, RegistryError, SourceEvent, SourceLoader, SourceRegistry};
pub use source::{
    Operation, Source, SourceCapabilities, SourceError, SourceInfo, SourceResult,
};

pub const APP_NAME: &str = "medley";
pub const APP_AUTHOR: &str = "Medley";
pub const APP_QUALIFIER: &str = "io";
