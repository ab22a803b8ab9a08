//! `Source` implementation backed by an external plugin process.

use crate::host::{ExecPluginHost, PluginConfig, PluginHostError};
use crate::protocol::{PluginMethod, PluginResult};
use medley_core::models::{Count, Media, MediaId, OperationOptions, Page};
use medley_core::source::{Operation, Source, SourceCapabilities, SourceError, SourceResult};

/// A source whose operations are answered by a plugin process.
///
/// Requests are awaited without parking a thread, so a search abandoned by
/// the coordinator's timeout leaves nothing running behind it.
pub struct ExecPluginSource {
    host: ExecPluginHost,
    id: String,
    name: String,
    capabilities: SourceCapabilities,
}

impl ExecPluginSource {
    /// Start the plugin and fetch its capabilities. Blocks until the
    /// handshake completes.
    ///
    /// `id` and `name` override what the plugin reports, so configuration
    /// stays in control of naming.
    pub fn start(
        config: PluginConfig,
        id: Option<String>,
        name: Option<String>,
    ) -> Result<Self, PluginHostError> {
        let host = ExecPluginHost::new(config);
        let info = host.start()?;

        let capabilities = match host.send_request(PluginMethod::Capabilities) {
            Ok(PluginResult::Capabilities(caps)) => caps,
            Ok(_) => {
                return Err(PluginHostError::UnexpectedResponse {
                    method: "Capabilities",
                })
            }
            Err(err) => {
                tracing::warn!(
                    plugin_id = %info.id,
                    error = %err,
                    "failed to fetch plugin capabilities, assuming search only"
                );
                SourceCapabilities {
                    search: true,
                    ..SourceCapabilities::default()
                }
            }
        };

        Ok(Self {
            host,
            id: id.unwrap_or(info.id),
            name: name.unwrap_or(info.name),
            capabilities,
        })
    }

    /// Stop the underlying plugin process.
    pub fn stop(&self) {
        self.host.stop();
    }

    fn map_host_error(err: PluginHostError) -> SourceError {
        match err {
            PluginHostError::Plugin(err) => err.into(),
            PluginHostError::ProcessTerminated => SourceError::Network {
                message: "plugin process terminated".to_string(),
            },
            PluginHostError::Timeout { millis, .. } => SourceError::Timeout { millis },
            other => SourceError::Other {
                message: other.to_string(),
            },
        }
    }

    async fn call(&self, method: PluginMethod) -> SourceResult<PluginResult> {
        self.host
            .request(method)
            .await
            .map_err(Self::map_host_error)
    }

    /// Items from a plugin are re-attributed to this source's configured id.
    fn claim(&self, mut media: Media) -> Media {
        media.source_id.clone_from(&self.id);
        media
    }

    fn expect_page(&self, result: PluginResult, method: &str) -> SourceResult<Page<Media>> {
        match result {
            PluginResult::Media(page) => Ok(Page {
                items: page.items.into_iter().map(|m| self.claim(m)).collect(),
                remaining: page.remaining,
            }),
            other => Err(unexpected(method, &other)),
        }
    }
}

fn unexpected(method: &str, result: &PluginResult) -> SourceError {
    SourceError::Other {
        message: format!("unexpected plugin response to {method}: {result:?}"),
    }
}

#[async_trait::async_trait]
impl Source for ExecPluginSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> SourceCapabilities {
        self.capabilities
    }

    fn is_available(&self) -> bool {
        self.host.is_running()
    }

    async fn search(&self, query: &str, options: &OperationOptions) -> SourceResult<Page<Media>> {
        let result = self
            .call(PluginMethod::Search {
                query: query.to_string(),
                options: *options,
            })
            .await?;
        let mut page = self.expect_page(result, "Search")?;
        // Plugins are not trusted to honour paging or type filters.
        page.items.retain(|m| options.type_filter.allows(m.kind));
        if let Count::Limited(count) = options.count {
            page.items.truncate(count as usize);
        }
        Ok(page)
    }

    async fn browse(
        &self,
        container: Option<&MediaId>,
        options: &OperationOptions,
    ) -> SourceResult<Page<Media>> {
        if !self.capabilities.browse {
            return Err(SourceError::not_supported(Operation::Browse));
        }
        let result = self
            .call(PluginMethod::Browse {
                container: container.cloned(),
                options: *options,
            })
            .await?;
        self.expect_page(result, "Browse")
    }

    async fn resolve(&self, id: &MediaId) -> SourceResult<Media> {
        if !self.capabilities.resolve {
            return Err(SourceError::not_supported(Operation::Resolve));
        }
        match self.call(PluginMethod::Resolve { id: id.clone() }).await? {
            PluginResult::Item(media) => Ok(self.claim(media)),
            other => Err(unexpected("Resolve", &other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{PluginError, PluginErrorKind};

    #[test]
    fn plugin_errors_keep_their_category() {
        let err = PluginHostError::Plugin(PluginError {
            kind: PluginErrorKind::NotFound,
            message: "track-1".into(),
        });
        assert_eq!(
            ExecPluginSource::map_host_error(err),
            SourceError::NotFound {
                entity: "track-1".into()
            }
        );
    }

    #[test]
    fn terminated_maps_to_network_error() {
        match ExecPluginSource::map_host_error(PluginHostError::ProcessTerminated) {
            SourceError::Network { message } => assert!(message.contains("terminated")),
            other => panic!("expected Network, got {other:?}"),
        }
    }
}

#[cfg(all(test, unix))]
mod plugin_tests {
    use super::*;
    use crate::host::tests::{fixture_config, fixture_plugin, SLOW_SEARCH};
    use medley_core::models::{MediaKind, TypeFilter};
    use medley_core::{CoordinatorConfig, FanOut, OutcomeStatus, SourceRegistry};
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use medley_core::source_contract::{run_source_contract, SourceContractExpectations};

    const CATALOGUE: &str = r#"    case "$method" in
        Initialize) echo '{"id":'$id',"result":{"status":"Initialized","id":"catalogue","name":"Catalogue","version":"2.0.0","protocol_version":1}}' ;;
        Capabilities) echo '{"id":'$id',"result":{"status":"Capabilities","search":true,"browse":false,"resolve":true}}' ;;
        Search)
            if echo "$line" | grep -q '"skip":1'; then
                echo '{"id":'$id',"result":{"status":"Media","items":[{"id":"b","source_id":"catalogue","kind":"video","title":"B"}],"remaining":0}}'
            else
                echo '{"id":'$id',"result":{"status":"Media","items":[{"id":"a","source_id":"catalogue","kind":"audio","title":"A","url":"http://cdn/a.ogg"},{"id":"b","source_id":"catalogue","kind":"video","title":"B"}],"remaining":0}}'
            fi ;;
        Resolve)
            rid=$(echo "$line" | grep -o '"params":{"id":"[a-z]*"' | cut -d'"' -f6)
            if [ "$rid" = "a" ]; then
                echo '{"id":'$id',"result":{"status":"Item","id":"a","source_id":"catalogue","kind":"audio","title":"A"}}'
            else
                echo '{"id":'$id',"result":{"status":"Error","kind":"not_found","message":"'$rid'"}}'
            fi ;;
        Shutdown) echo '{"id":'$id',"result":{"status":"ShutdownAck"}}'; exit 0 ;;
    esac"#;

    fn start(id: Option<&str>) -> (tempfile::TempPath, ExecPluginSource) {
        let script = fixture_plugin(CATALOGUE);
        let source =
            ExecPluginSource::start(fixture_config(&script), id.map(str::to_string), None)
                .expect("plugin starts");
        (script, source)
    }

    #[tokio::test]
    async fn satisfies_source_contract() {
        let (_script, source) = start(None);
        assert_eq!(source.name(), "Catalogue");
        assert!(!source.capabilities().browse);

        let expectations = SourceContractExpectations {
            source_id: "catalogue".into(),
            query: "anything".into(),
            expected_first_id: MediaId::new("a"),
            min_results: 2,
            browse_container: None,
        };
        run_source_contract(&source, &expectations).await.unwrap();
    }

    #[tokio::test]
    async fn configured_id_overrides_plugin_id() {
        let (_script, source) = start(Some("remote"));
        let page = source
            .search("x", &OperationOptions::unlimited())
            .await
            .unwrap();
        assert!(page.items.iter().all(|m| m.source_id == "remote"));
    }

    #[tokio::test]
    async fn results_are_clamped_to_options() {
        let (_script, source) = start(None);
        let options = OperationOptions {
            count: Count::Limited(5),
            type_filter: TypeFilter::only(MediaKind::Video),
            ..OperationOptions::default()
        };
        let page = source.search("x", &options).await.unwrap();
        let ids: Vec<_> = page.items.iter().map(|m| m.id.as_ref()).collect();
        assert_eq!(ids, ["b"]);
    }

    #[tokio::test]
    async fn resolve_errors_map_to_not_found() {
        let (_script, source) = start(None);
        assert!(matches!(
            source.resolve(&MediaId::new("zzz")).await,
            Err(SourceError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn availability_follows_process() {
        let (_script, source) = start(None);
        assert!(source.is_available());
        source.stop();
        assert!(!source.is_available());
        assert!(matches!(
            source.search("x", &OperationOptions::first(1)).await,
            Err(SourceError::Network { .. })
        ));
    }

    #[test]
    fn timed_out_search_releases_the_runtime() {
        let script = fixture_plugin(SLOW_SEARCH);
        let source = ExecPluginSource::start(fixture_config(&script), None, None).unwrap();
        let registry = Arc::new(SourceRegistry::new());
        registry.register(Arc::new(source)).unwrap();
        let fan_out = FanOut::new(
            registry,
            CoordinatorConfig {
                source_timeout: Duration::from_millis(200),
                ..CoordinatorConfig::default()
            },
        );

        let runtime = tokio::runtime::Runtime::new().unwrap();
        let started = Instant::now();
        let results = runtime.block_on(async {
            fan_out
                .search("x", OperationOptions::first(5))
                .unwrap()
                .collect()
                .await
        });
        assert_eq!(results.outcomes[0].status, OutcomeStatus::TimedOut);

        // Dropping the runtime waits on blocking tasks; none may be left.
        drop(runtime);
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
