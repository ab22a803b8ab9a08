//! Fan-out query coordinator.
//!
//! A search is dispatched to every capable source at once. Each source runs in
//! its own task under its own timeout; outcomes are streamed back as
//! [`SearchEvent`]s in completion order and can be folded into ranked hits
//! with [`SearchHandle::collect`].
//!
//! Event ordering for one operation:
//! 1. one `Dispatched` per selected source, before anything else;
//! 2. exactly one of `Results`, `Failed` or `TimedOut` per source, unless the
//!    operation is cancelled first, in which case a single `Cancelled`;
//! 3. `Finished`, always last.

use crate::aggregate::{Aggregator, SearchHit};
use crate::config::SearchConfig;
use crate::filter::CapabilityFilter;
use crate::models::{Media, MediaId, OperationOptions, Page};
use crate::registry::SourceRegistry;
use crate::source::{Operation, Source, SourceError};
use futures::FutureExt;
use std::collections::{BTreeMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Independent deadline applied to every source.
    pub source_timeout: Duration,
    /// Maximum number of aggregated hits returned by [`SearchHandle::collect`].
    pub max_results: usize,
    /// Buffered events before the coordinator waits on the consumer.
    pub channel_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self::from(&SearchConfig::default())
    }
}

impl From<&SearchConfig> for CoordinatorConfig {
    fn from(config: &SearchConfig) -> Self {
        Self {
            source_timeout: Duration::from_millis(config.timeout_ms),
            max_results: config.max_results,
            channel_capacity: 32,
        }
    }
}

/// Identifies one dispatched operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OperationId(pub u64);

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SearchEvent {
    Dispatched { source_id: String, name: String },
    Results { source_id: String, page: Page<Media> },
    Failed { source_id: String, error: SourceError },
    TimedOut { source_id: String },
    Cancelled,
    Finished,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SearchError {
    #[error("query is empty")]
    EmptyQuery,
    #[error("requested count is zero")]
    ZeroCount,
    #[error("all sources failed: {0}")]
    AllSourcesFailed(String),
    #[error("no source with id '{0}' is registered")]
    UnknownSource(String),
    #[error("source '{source_id}' does not support {operation}")]
    Unsupported {
        source_id: String,
        operation: Operation,
    },
    #[error("source '{source_id}' timed out")]
    TimedOut { source_id: String },
    #[error(transparent)]
    Source(#[from] SourceError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutcomeStatus {
    Completed { count: usize },
    Failed(String),
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceOutcome {
    pub source_id: String,
    pub name: String,
    pub status: OutcomeStatus,
}

/// Everything one search produced once all sources settled.
#[derive(Debug, Clone)]
pub struct AggregatedResults {
    pub operation: OperationId,
    pub hits: Vec<SearchHit>,
    pub outcomes: Vec<SourceOutcome>,
}

impl AggregatedResults {
    /// Fails only when sources were asked and every one of them failed or timed out.
    pub fn into_result(self) -> Result<Self, SearchError> {
        let all_failed = !self.outcomes.is_empty()
            && self.hits.is_empty()
            && self.outcomes.iter().all(|o| {
                matches!(o.status, OutcomeStatus::Failed(_) | OutcomeStatus::TimedOut)
            });
        if !all_failed {
            return Ok(self);
        }
        let summary = self
            .outcomes
            .iter()
            .map(|o| match &o.status {
                OutcomeStatus::Failed(message) => format!("{}: {message}", o.source_id),
                _ => format!("{}: timed out", o.source_id),
            })
            .collect::<Vec<_>>()
            .join("; ");
        Err(SearchError::AllSourcesFailed(summary))
    }
}

/// Dispatches queries to registered sources.
pub struct FanOut {
    registry: Arc<SourceRegistry>,
    config: CoordinatorConfig,
    weights: BTreeMap<String, f64>,
    next_id: AtomicU64,
}

impl FanOut {
    pub fn new(registry: Arc<SourceRegistry>, config: CoordinatorConfig) -> Self {
        Self {
            registry,
            config,
            weights: BTreeMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Per-source ranking weights; unlisted sources weigh 1.0.
    pub fn with_weights(mut self, weights: BTreeMap<String, f64>) -> Self {
        self.weights = weights;
        self
    }

    pub fn registry(&self) -> &Arc<SourceRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Search every registered source that supports searching.
    ///
    /// Must be called from within a tokio runtime.
    pub fn search(
        &self,
        query: &str,
        options: OperationOptions,
    ) -> Result<SearchHandle, SearchError> {
        self.search_restricted(query, options, Vec::<String>::new())
    }

    /// Like [`FanOut::search`], limited to the given source ids (none means all).
    pub fn search_restricted<I, S>(
        &self,
        query: &str,
        options: OperationOptions,
        only: I,
    ) -> Result<SearchHandle, SearchError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let sources = CapabilityFilter::new(Operation::Search)
            .restrict_to(only)
            .with_type_filter(options.type_filter)
            .select(&self.registry);
        self.search_sources(sources, query, options)
    }

    /// Search an explicit set of sources, e.g. ones registered after an earlier search.
    ///
    /// A source listed more than once is searched once.
    pub fn search_sources(
        &self,
        mut sources: Vec<Arc<dyn Source>>,
        query: &str,
        options: OperationOptions,
    ) -> Result<SearchHandle, SearchError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(SearchError::EmptyQuery);
        }
        if options.count.is_zero() {
            return Err(SearchError::ZeroCount);
        }

        let mut seen = HashSet::new();
        sources.retain(|source| {
            let first = seen.insert(source.id().to_string());
            if !first {
                tracing::debug!(source_id = %source.id(), "ignoring repeated source");
            }
            first
        });

        let id = OperationId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (events_tx, events_rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let (cancel_tx, cancel_rx) = oneshot::channel();

        tracing::debug!(operation = %id, sources = sources.len(), query, "dispatching search");
        tokio::spawn(drive_search(
            id,
            sources,
            Arc::from(query),
            options,
            self.config.source_timeout,
            events_tx,
            cancel_rx,
        ));

        Ok(SearchHandle {
            id,
            events: events_rx,
            cancel: Some(cancel_tx),
            weights: self.weights.clone(),
            max_results: self.config.max_results,
        })
    }

    /// Browse one source under the coordinator's timeout.
    pub async fn browse(
        &self,
        source_id: &str,
        container: Option<&MediaId>,
        options: OperationOptions,
    ) -> Result<Page<Media>, SearchError> {
        if options.count.is_zero() {
            return Err(SearchError::ZeroCount);
        }
        let source = self
            .registry
            .get(source_id)
            .ok_or_else(|| SearchError::UnknownSource(source_id.to_string()))?;
        if !CapabilityFilter::new(Operation::Browse).matches(source.as_ref()) {
            return Err(SearchError::Unsupported {
                source_id: source_id.to_string(),
                operation: Operation::Browse,
            });
        }
        let (narrowed, _, _) = options.obey_caps(&source.caps(Operation::Browse));
        tracing::info!("{} - browse {}", source.name(), container.map_or("/", |c| c.as_ref()));
        match tokio::time::timeout(
            self.config.source_timeout,
            source.browse(container, &narrowed),
        )
        .await
        {
            Ok(result) => Ok(result?),
            Err(_) => Err(SearchError::TimedOut {
                source_id: source_id.to_string(),
            }),
        }
    }
}

async fn drive_search(
    id: OperationId,
    sources: Vec<Arc<dyn Source>>,
    query: Arc<str>,
    options: OperationOptions,
    source_timeout: Duration,
    events: mpsc::Sender<SearchEvent>,
    mut cancel: oneshot::Receiver<()>,
) {
    let mut tasks = JoinSet::new();

    for source in sources {
        let source_id = source.id().to_string();
        tracing::info!("{} - {}", source.name(), query);
        let dispatched = SearchEvent::Dispatched {
            source_id: source_id.clone(),
            name: source.name().to_string(),
        };
        if events.send(dispatched).await.is_err() {
            // Consumer gone before we started.
            return;
        }

        let (narrowed, unsupported, obeyed) = options.obey_caps(&source.caps(Operation::Search));
        if !obeyed {
            tracing::debug!(
                operation = %id,
                source_id = %source_id,
                ?unsupported,
                "source cannot honour every option, narrowing"
            );
        }

        let query = Arc::clone(&query);
        tasks.spawn(async move {
            let search = tokio::time::timeout(source_timeout, source.search(&query, &narrowed));
            match AssertUnwindSafe(search).catch_unwind().await {
                Ok(Ok(Ok(page))) => SearchEvent::Results {
                    source_id,
                    page,
                },
                Ok(Ok(Err(error))) => SearchEvent::Failed { source_id, error },
                Ok(Err(_elapsed)) => SearchEvent::TimedOut { source_id },
                Err(_panic) => SearchEvent::Failed {
                    source_id,
                    error: SourceError::Other {
                        message: "source panicked during search".into(),
                    },
                },
            }
        });
    }

    loop {
        tokio::select! {
            biased;
            _ = &mut cancel => {
                tasks.abort_all();
                tracing::debug!(operation = %id, "search cancelled");
                let _ = events.send(SearchEvent::Cancelled).await;
                break;
            }
            joined = tasks.join_next() => {
                let Some(joined) = joined else { break };
                let Ok(event) = joined else { continue };
                log_outcome(id, &event);
                if events.send(event).await.is_err() {
                    tasks.abort_all();
                    return;
                }
            }
        }
    }

    tracing::debug!(operation = %id, "search finished");
    let _ = events.send(SearchEvent::Finished).await;
}

fn log_outcome(id: OperationId, event: &SearchEvent) {
    match event {
        SearchEvent::Results { source_id, page } => {
            tracing::debug!(
                operation = %id,
                source_id = %source_id,
                count = page.items.len(),
                "source answered"
            );
        }
        SearchEvent::Failed { source_id, error } => {
            tracing::warn!(
                operation = %id,
                source_id = %source_id,
                error = %error,
                "source search failed"
            );
        }
        SearchEvent::TimedOut { source_id } => {
            tracing::warn!(operation = %id, source_id = %source_id, "source search timed out");
        }
        _ => {}
    }
}

/// Handle to an in-flight search. Dropping it cancels outstanding source queries.
pub struct SearchHandle {
    id: OperationId,
    events: mpsc::Receiver<SearchEvent>,
    cancel: Option<oneshot::Sender<()>>,
    weights: BTreeMap<String, f64>,
    max_results: usize,
}

impl SearchHandle {
    pub fn id(&self) -> OperationId {
        self.id
    }

    /// Next event, or `None` once `Finished` has been delivered.
    pub async fn next_event(&mut self) -> Option<SearchEvent> {
        self.events.recv().await
    }

    /// Abort sources that haven't answered yet.
    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
    }

    /// Wait for every source to settle and rank what they returned.
    pub async fn collect(mut self) -> AggregatedResults {
        let mut aggregator = Aggregator::new(std::mem::take(&mut self.weights));
        let mut outcomes: Vec<SourceOutcome> = Vec::new();

        while let Some(event) = self.next_event().await {
            match event {
                SearchEvent::Dispatched { source_id, name } => outcomes.push(SourceOutcome {
                    source_id,
                    name,
                    // Stays Cancelled unless the source settles.
                    status: OutcomeStatus::Cancelled,
                }),
                SearchEvent::Results { source_id, page } => {
                    let count = page.items.len();
                    aggregator.push(&source_id, page.items);
                    set_status(&mut outcomes, &source_id, OutcomeStatus::Completed { count });
                }
                SearchEvent::Failed { source_id, error } => {
                    set_status(&mut outcomes, &source_id, OutcomeStatus::Failed(error.to_string()));
                }
                SearchEvent::TimedOut { source_id } => {
                    set_status(&mut outcomes, &source_id, OutcomeStatus::TimedOut);
                }
                SearchEvent::Cancelled => {}
                SearchEvent::Finished => break,
            }
        }

        AggregatedResults {
            operation: self.id,
            hits: aggregator.into_ranked(self.max_results),
            outcomes,
        }
    }
}

fn set_status(outcomes: &mut [SourceOutcome], source_id: &str, status: OutcomeStatus) {
    if let Some(outcome) = outcomes.iter_mut().find(|o| o.source_id == source_id) {
        outcome.status = status;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Count, MediaKind, OperationCaps, TypeFilter};
    use crate::source::{SourceCapabilities, SourceResult};
    use std::sync::Mutex;

    enum Behaviour {
        Answer(Vec<&'static str>),
        Fail,
        Sleep(Duration),
        Panic,
    }

    struct FakeSource {
        id: &'static str,
        behaviour: Behaviour,
        caps: OperationCaps,
        seen: Mutex<Vec<OperationOptions>>,
    }

    impl FakeSource {
        fn new(id: &'static str, behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                id,
                behaviour,
                caps: OperationCaps::default(),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait::async_trait]
    impl Source for FakeSource {
        fn id(&self) -> &str {
            self.id
        }

        fn name(&self) -> &str {
            self.id
        }

        fn capabilities(&self) -> SourceCapabilities {
            SourceCapabilities::all()
        }

        fn caps(&self, _operation: Operation) -> OperationCaps {
            self.caps
        }

        async fn search(
            &self,
            query: &str,
            options: &OperationOptions,
        ) -> SourceResult<Page<Media>> {
            self.seen.lock().unwrap().push(*options);
            match &self.behaviour {
                Behaviour::Answer(titles) => Ok(Page::single_page(
                    titles
                        .iter()
                        .map(|t| Media::new(*t, self.id, MediaKind::Audio, format!("{query} {t}")))
                        .collect(),
                )),
                Behaviour::Fail => Err(SourceError::Network {
                    message: "unreachable".into(),
                }),
                Behaviour::Sleep(duration) => {
                    tokio::time::sleep(*duration).await;
                    Ok(Page::empty())
                }
                Behaviour::Panic => panic!("boom"),
            }
        }

        async fn browse(
            &self,
            _container: Option<&MediaId>,
            options: &OperationOptions,
        ) -> SourceResult<Page<Media>> {
            self.seen.lock().unwrap().push(*options);
            Ok(Page::single_page(vec![Media::new(
                "root",
                self.id,
                MediaKind::Container,
                "root",
            )]))
        }
    }

    fn fan_out(sources: Vec<Arc<FakeSource>>, timeout: Duration) -> FanOut {
        let registry = Arc::new(SourceRegistry::new());
        for source in sources {
            registry.register(source).unwrap();
        }
        FanOut::new(
            registry,
            CoordinatorConfig {
                source_timeout: timeout,
                max_results: 10,
                channel_capacity: 4,
            },
        )
    }

    async fn drain(handle: &mut SearchHandle) -> Vec<SearchEvent> {
        let mut events = Vec::new();
        while let Some(event) = handle.next_event().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn rejects_empty_query_and_zero_count() {
        let fan = fan_out(vec![], Duration::from_secs(1));
        assert_eq!(
            fan.search("   ", OperationOptions::first(5)).err(),
            Some(SearchError::EmptyQuery)
        );
        assert_eq!(
            fan.search("q", OperationOptions::first(0)).err(),
            Some(SearchError::ZeroCount)
        );
    }

    #[tokio::test]
    async fn no_sources_finishes_immediately() {
        let fan = fan_out(vec![], Duration::from_secs(1));
        let mut handle = fan.search("anything", OperationOptions::first(5)).unwrap();
        assert_eq!(drain(&mut handle).await, vec![SearchEvent::Finished]);
    }

    #[tokio::test(start_paused = true)]
    async fn events_follow_documented_order() {
        let fan = fan_out(
            vec![
                FakeSource::new("ok", Behaviour::Answer(vec!["a", "b"])),
                FakeSource::new("bad", Behaviour::Fail),
                FakeSource::new("slow", Behaviour::Sleep(Duration::from_secs(60))),
                FakeSource::new("crash", Behaviour::Panic),
            ],
            Duration::from_millis(100),
        );
        let mut handle = fan.search("song", OperationOptions::first(5)).unwrap();
        let events = drain(&mut handle).await;

        assert_eq!(events.len(), 4 + 4 + 1);
        assert!(events[..4]
            .iter()
            .all(|e| matches!(e, SearchEvent::Dispatched { .. })));
        assert_eq!(events.last(), Some(&SearchEvent::Finished));

        let settled = &events[4..8];
        for id in ["ok", "bad", "slow", "crash"] {
            let count = settled
                .iter()
                .filter(|e| match e {
                    SearchEvent::Results { source_id, .. }
                    | SearchEvent::Failed { source_id, .. }
                    | SearchEvent::TimedOut { source_id } => source_id == id,
                    _ => false,
                })
                .count();
            assert_eq!(count, 1, "{id} should settle exactly once");
        }
        assert!(settled
            .iter()
            .any(|e| matches!(e, SearchEvent::TimedOut { source_id } if source_id == "slow")));
    }

    #[tokio::test(start_paused = true)]
    async fn collect_aggregates_and_reports_outcomes() {
        let fan = fan_out(
            vec![
                FakeSource::new("one", Behaviour::Answer(vec!["x", "y"])),
                FakeSource::new("two", Behaviour::Answer(vec!["z"])),
                FakeSource::new("late", Behaviour::Sleep(Duration::from_secs(5))),
            ],
            Duration::from_secs(1),
        );
        let results = fan
            .search("q", OperationOptions::first(5))
            .unwrap()
            .collect()
            .await
            .into_result()
            .unwrap();

        assert_eq!(results.hits.len(), 3);
        let titles: Vec<_> = results.hits.iter().map(|h| h.media.title.as_str()).collect();
        assert_eq!(titles, ["q x", "q z", "q y"]);

        let statuses: BTreeMap<_, _> = results
            .outcomes
            .iter()
            .map(|o| (o.source_id.as_str(), o.status.clone()))
            .collect();
        assert_eq!(statuses["one"], OutcomeStatus::Completed { count: 2 });
        assert_eq!(statuses["two"], OutcomeStatus::Completed { count: 1 });
        assert_eq!(statuses["late"], OutcomeStatus::TimedOut);
    }

    #[tokio::test]
    async fn all_failures_become_an_error() {
        let fan = fan_out(
            vec![
                FakeSource::new("a", Behaviour::Fail),
                FakeSource::new("b", Behaviour::Fail),
            ],
            Duration::from_secs(1),
        );
        let err = fan
            .search("q", OperationOptions::first(5))
            .unwrap()
            .collect()
            .await
            .into_result()
            .unwrap_err();
        match err {
            SearchError::AllSourcesFailed(summary) => {
                assert!(summary.contains("a: network error: unreachable"));
                assert!(summary.contains("b: "));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancel_stops_pending_sources() {
        let fan = fan_out(
            vec![FakeSource::new(
                "forever",
                Behaviour::Sleep(Duration::from_secs(3600)),
            )],
            Duration::from_secs(7200),
        );
        let mut handle = fan.search("q", OperationOptions::first(5)).unwrap();
        assert!(matches!(
            handle.next_event().await,
            Some(SearchEvent::Dispatched { .. })
        ));
        handle.cancel();
        assert_eq!(handle.next_event().await, Some(SearchEvent::Cancelled));
        assert_eq!(handle.next_event().await, Some(SearchEvent::Finished));
        assert_eq!(handle.next_event().await, None);
    }

    #[tokio::test]
    async fn restricted_search_and_caps_narrowing() {
        let narrow = Arc::new(FakeSource {
            id: "narrow",
            behaviour: Behaviour::Answer(vec!["n"]),
            caps: OperationCaps {
                type_filter: TypeFilter::ALL,
                max_count: Count::Limited(2),
            },
            seen: Mutex::new(Vec::new()),
        });
        let other = FakeSource::new("other", Behaviour::Answer(vec!["o"]));
        let fan = fan_out(vec![narrow.clone(), other.clone()], Duration::from_secs(1));

        let results = fan
            .search_restricted("q", OperationOptions::first(20), ["narrow"])
            .unwrap()
            .collect()
            .await;
        assert_eq!(results.outcomes.len(), 1);
        assert_eq!(narrow.seen.lock().unwrap()[0].count, Count::Limited(2));
        assert!(other.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn repeated_sources_are_searched_once() {
        let twice = FakeSource::new("twice", Behaviour::Answer(vec!["t"]));
        let fan = fan_out(vec![twice.clone()], Duration::from_secs(1));
        let listed: Vec<Arc<dyn Source>> = vec![twice.clone(), twice.clone()];

        let results = fan
            .search_sources(listed, "q", OperationOptions::first(5))
            .unwrap()
            .collect()
            .await;
        assert_eq!(results.outcomes.len(), 1);
        assert_eq!(results.outcomes[0].status, OutcomeStatus::Completed { count: 1 });
        assert_eq!(twice.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn operation_ids_increase() {
        let fan = fan_out(vec![], Duration::from_secs(1));
        let first = fan.search("a", OperationOptions::first(1)).unwrap().id();
        let second = fan.search("b", OperationOptions::first(1)).unwrap().id();
        assert!(second > first);
    }

    #[tokio::test]
    async fn browse_checks_registration_and_capability() {
        let fan = fan_out(
            vec![FakeSource::new("fs", Behaviour::Answer(vec![]))],
            Duration::from_secs(1),
        );
        let page = fan
            .browse("fs", None, OperationOptions::first(3))
            .await
            .unwrap();
        assert_eq!(page.items[0].title, "root");
        assert_eq!(
            fan.browse("missing", None, OperationOptions::first(3))
                .await
                .unwrap_err(),
            SearchError::UnknownSource("missing".into())
        );
    }
}
