//! Request/response types exchanged with plugin processes.
//!
//! Every message is a single line of JSON.

use medley_core::models::{Media, MediaId, OperationOptions, Page};
use medley_core::source::{SourceCapabilities, SourceError};
use serde::{Deserialize, Serialize};

/// Protocol version for compatibility checking.
pub const PROTOCOL_VERSION: u32 = 1;

/// Request sent from Medley to a plugin process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginRequest {
    /// Correlates the response with this request.
    pub id: u64,
    pub method: PluginMethod,
}

/// Response from a plugin process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginResponse {
    pub id: u64,
    pub result: PluginResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "params")]
pub enum PluginMethod {
    /// Handshake; the plugin answers with [`PluginInfo`].
    Initialize,
    Capabilities,
    Search {
        query: String,
        options: OperationOptions,
    },
    /// List a container's children, or the plugin's top level.
    Browse {
        container: Option<MediaId>,
        options: OperationOptions,
    },
    Resolve {
        id: MediaId,
    },
    Shutdown,
}

impl PluginMethod {
    pub fn name(&self) -> &'static str {
        match self {
            PluginMethod::Initialize => "Initialize",
            PluginMethod::Capabilities => "Capabilities",
            PluginMethod::Search { .. } => "Search",
            PluginMethod::Browse { .. } => "Browse",
            PluginMethod::Resolve { .. } => "Resolve",
            PluginMethod::Shutdown => "Shutdown",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum PluginResult {
    Initialized(PluginInfo),
    Capabilities(SourceCapabilities),
    /// Search or browse results.
    Media(Page<Media>),
    /// A single resolved item.
    Item(Media),
    ShutdownAck,
    Error(PluginError),
}

/// Plugin metadata returned by the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginInfo {
    pub id: String,
    pub name: String,
    pub version: String,
    pub protocol_version: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginError {
    pub kind: PluginErrorKind,
    pub message: String,
}

/// Categories of plugin errors, mirroring [`SourceError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginErrorKind {
    Network,
    NotFound,
    NotSupported,
    Timeout,
    ProtocolMismatch,
    Internal,
}

impl std::fmt::Display for PluginError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl From<PluginError> for SourceError {
    fn from(err: PluginError) -> Self {
        match err.kind {
            PluginErrorKind::Network => SourceError::Network {
                message: err.message,
            },
            PluginErrorKind::NotFound => SourceError::NotFound {
                entity: err.message,
            },
            PluginErrorKind::NotSupported => SourceError::NotSupported {
                operation: err.message,
            },
            PluginErrorKind::Timeout => SourceError::Timeout { millis: 0 },
            PluginErrorKind::ProtocolMismatch | PluginErrorKind::Internal => SourceError::Other {
                message: err.message,
            },
        }
    }
}

impl From<SourceError> for PluginError {
    fn from(err: SourceError) -> Self {
        let (kind, message) = match err {
            SourceError::Network { message } => (PluginErrorKind::Network, message),
            SourceError::NotFound { entity } => (PluginErrorKind::NotFound, entity),
            SourceError::NotSupported { operation } => (PluginErrorKind::NotSupported, operation),
            timeout @ SourceError::Timeout { .. } => {
                (PluginErrorKind::Timeout, timeout.to_string())
            }
            SourceError::Other { message } => (PluginErrorKind::Internal, message),
        };
        Self { kind, message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medley_core::models::{Count, MediaKind};

    #[test]
    fn search_request_shape() {
        let req = PluginRequest {
            id: 7,
            method: PluginMethod::Search {
                query: "miles".into(),
                options: OperationOptions::first(5).with_skip(2),
            },
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["id"], 7);
        assert_eq!(json["method"]["type"], "Search");
        assert_eq!(json["method"]["params"]["query"], "miles");
        assert_eq!(json["method"]["params"]["options"]["skip"], 2);
        assert_eq!(json["method"]["params"]["options"]["count"]["limited"], 5);
    }

    #[test]
    fn unit_methods_have_no_params() {
        let json = serde_json::to_string(&PluginRequest {
            id: 1,
            method: PluginMethod::Initialize,
        })
        .unwrap();
        assert_eq!(json, r#"{"id":1,"method":{"type":"Initialize"}}"#);
    }

    #[test]
    fn media_page_response_parses() {
        let json = r#"{"id":3,"result":{"status":"Media","items":[{"id":"a","source_id":"p","kind":"audio","title":"A","url":"http://x/a"}],"remaining":4}}"#;
        let resp: PluginResponse = serde_json::from_str(json).unwrap();
        match resp.result {
            PluginResult::Media(page) => {
                assert_eq!(page.items.len(), 1);
                assert_eq!(page.items[0].kind, MediaKind::Audio);
                assert_eq!(page.items[0].url.as_deref(), Some("http://x/a"));
                assert_eq!(page.remaining, Some(4));
            }
            other => panic!("expected Media, got {other:?}"),
        }
    }

    #[test]
    fn options_default_when_omitted() {
        let json = r#"{"type":"Browse","params":{"container":null,"options":{}}}"#;
        let method: PluginMethod = serde_json::from_str(json).unwrap();
        match method {
            PluginMethod::Browse { container, options } => {
                assert!(container.is_none());
                assert_eq!(options.count, Count::Limited(10));
            }
            other => panic!("expected Browse, got {other:?}"),
        }
    }

    #[test]
    fn error_kinds_map_to_source_errors() {
        let err = PluginError {
            kind: PluginErrorKind::NotFound,
            message: "track-123".into(),
        };
        assert_eq!(
            SourceError::from(err),
            SourceError::NotFound {
                entity: "track-123".into()
            }
        );

        let back = PluginError::from(SourceError::Network {
            message: "down".into(),
        });
        assert_eq!(back.kind, PluginErrorKind::Network);
    }
}
