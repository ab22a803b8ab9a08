mod loader;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use loader::ConfiguredLoader;
use medley_core::models::{
    Count, Media, MediaId, MediaKind, OperationOptions, Page, ResolutionFlags, TypeFilter,
};
use medley_core::{
    init_logging, AggregatedResults, AppDirs, CapabilityFilter, Config, CoordinatorConfig, FanOut,
    LogLevel, Operation, OutcomeStatus, SearchConfig, SearchError, SourceEntry, SourceEvent,
    SourceRegistry,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::time::MissedTickBehavior;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Sources are asked for complete metadata, delivered as it arrives.
const SEARCH_FLAGS: ResolutionFlags = ResolutionFlags {
    full: true,
    idle_relay: true,
    fast_only: false,
};

#[derive(Debug, Parser)]
#[command(name = "medley", version, about = "Search many media sources at once")]
struct Cli {
    /// Text to search for
    query: Option<String>,
    /// Results requested from each source ("all" for no limit)
    #[arg(long, value_parser = parse_count)]
    count: Option<Count>,
    /// Results each source should skip
    #[arg(long, default_value_t = 0)]
    skip: u32,
    /// Per-source timeout override in milliseconds
    #[arg(long = "timeout-ms")]
    timeout_ms: Option<u64>,
    /// Only query these source ids
    #[arg(long = "source", value_name = "ID")]
    sources: Vec<String>,
    /// Only return media of these types
    #[arg(long = "type", value_enum, value_name = "TYPE")]
    types: Vec<MediaTypeArg>,
    /// Keep running and search sources that appear later (Ctrl-C to exit)
    #[arg(long)]
    follow: bool,
    /// List registered sources and exit
    #[arg(long)]
    list_sources: bool,
    /// Browse a source instead of searching
    #[arg(long, value_name = "SOURCE_ID", conflicts_with = "list_sources")]
    browse: Option<String>,
    /// Container to browse (defaults to the source's top level)
    #[arg(long, value_name = "ID", requires = "browse")]
    container: Option<String>,
    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum MediaTypeArg {
    Audio,
    Video,
    Image,
}

impl MediaTypeArg {
    fn kind(self) -> MediaKind {
        match self {
            MediaTypeArg::Audio => MediaKind::Audio,
            MediaTypeArg::Video => MediaKind::Video,
            MediaTypeArg::Image => MediaKind::Image,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
enum CliError {
    #[error("--count must be greater than zero")]
    ZeroCount,
    #[error("--timeout-ms must be greater than zero")]
    ZeroTimeout,
}

fn parse_count(raw: &str) -> Result<Count, String> {
    match raw.trim() {
        "all" | "unlimited" => Ok(Count::Unlimited),
        value => value
            .parse::<u32>()
            .map(Count::Limited)
            .map_err(|_| format!("expected a number or \"all\", got '{value}'")),
    }
}

impl Cli {
    /// The trimmed query, or `None` when nothing searchable was given.
    fn query(&self) -> Option<&str> {
        self.query.as_deref().map(str::trim).filter(|q| !q.is_empty())
    }

    fn options(&self, search: &SearchConfig) -> Result<OperationOptions, CliError> {
        let count = self.count.unwrap_or(Count::Limited(search.default_count));
        if count.is_zero() {
            return Err(CliError::ZeroCount);
        }
        let type_filter = if self.types.is_empty() {
            TypeFilter::ALL
        } else {
            self.types.iter().fold(TypeFilter::NONE, |filter, t| {
                filter.union(&TypeFilter::only(t.kind()))
            })
        };
        Ok(OperationOptions {
            skip: self.skip,
            count,
            flags: SEARCH_FLAGS,
            type_filter,
        })
    }

    fn coordinator_config(&self, search: &SearchConfig) -> Result<CoordinatorConfig, CliError> {
        let mut config = CoordinatorConfig::from(search);
        if let Some(timeout_ms) = self.timeout_ms {
            if timeout_ms == 0 {
                return Err(CliError::ZeroTimeout);
            }
            config.source_timeout = Duration::from_millis(timeout_ms);
        }
        Ok(config)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(run(cli));
    // Work abandoned after a source timed out must not hold the process open.
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
    result
}

async fn run(cli: Cli) -> Result<()> {
    let dirs = AppDirs::discover()?;
    let mut config = Config::load_or_default(&dirs)?;
    if cli.verbose {
        config.logging.level = LogLevel::Debug;
    }
    let _logging = init_logging(&config.logging, &dirs)?;

    let options = cli.options(&config.search)?;
    let coordinator = cli.coordinator_config(&config.search)?;

    let registry = Arc::new(SourceRegistry::new());
    let mut events = registry.subscribe();
    load_sources(&registry, &config.sources).await;
    drain_events(&mut events);

    if cli.list_sources {
        print_sources(&registry);
        return Ok(());
    }

    let fan_out =
        FanOut::new(Arc::clone(&registry), coordinator).with_weights(config.source_weights());

    if let Some(source_id) = cli.browse.as_deref() {
        let container = cli.container.clone().map(MediaId::new);
        let page = fan_out
            .browse(source_id, container.as_ref(), options)
            .await?;
        print_page(&page);
        return Ok(());
    }

    for id in &cli.sources {
        if !registry.contains(id) {
            tracing::warn!(source_id = %id, "requested source is not registered");
        }
    }

    let query = cli.query();
    if let Some(results) = initial_search(&fan_out, query, options, &cli.sources).await? {
        print_results(&results);
        if !cli.follow {
            results.into_result()?;
        }
    }

    if cli.follow {
        follow(&fan_out, &config, query, options, &cli.sources, events).await?;
    }

    Ok(())
}

/// Search every registered source once. Without a query nothing is searched.
async fn initial_search(
    fan_out: &FanOut,
    query: Option<&str>,
    options: OperationOptions,
    only: &[String],
) -> Result<Option<AggregatedResults>, SearchError> {
    let Some(query) = query else {
        tracing::warn!("Query parameter missing");
        return Ok(None);
    };
    let handle = fan_out.search_restricted(query, options, only.iter().cloned())?;
    Ok(Some(handle.collect().await))
}

async fn load_sources(registry: &Arc<SourceRegistry>, entries: &BTreeMap<String, SourceEntry>) {
    let registry = Arc::clone(registry);
    let entries = entries.clone();
    // Plugin handshakes block, so loading stays off the async workers.
    let report =
        tokio::task::spawn_blocking(move || registry.load_all(&entries, &ConfiguredLoader)).await;
    match report {
        Ok(report) if report.is_success() => {
            tracing::debug!(
                loaded = report.loaded.len(),
                skipped = report.skipped.len(),
                "sources loaded"
            );
        }
        Ok(report) => tracing::error!(failed = report.failed.len(), "Failed to load sources"),
        Err(err) => tracing::error!(error = %err, "Failed to load sources"),
    }
}

fn log_source_event(event: &SourceEvent) {
    match event {
        SourceEvent::Added(info) => {
            tracing::info!("Detected new source available: '{}'", info.name);
            if info.capabilities.search {
                tracing::info!(source_id = %info.id, "Source supports search");
            } else {
                tracing::info!(source_id = %info.id, "Source does not support search");
            }
        }
        SourceEvent::Removed(info) => {
            tracing::info!(source_id = %info.id, name = %info.name, "source removed");
        }
    }
}

fn drain_events(events: &mut broadcast::Receiver<SourceEvent>) {
    loop {
        match events.try_recv() {
            Ok(event) => log_source_event(&event),
            Err(TryRecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "missed source events");
            }
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
        }
    }
}

/// Keep listening for registry changes until Ctrl-C. Sources that appear
/// later are searched on their own; a periodic rescan prunes unavailable
/// sources, refreshes the rest and retries loading the configured ones.
async fn follow(
    fan_out: &FanOut,
    config: &Config,
    query: Option<&str>,
    options: OperationOptions,
    only: &[String],
    mut events: broadcast::Receiver<SourceEvent>,
) -> Result<()> {
    let registry = Arc::clone(fan_out.registry());
    let filter = CapabilityFilter::new(Operation::Search)
        .restrict_to(only.iter().cloned())
        .with_type_filter(options.type_filter);

    let period = Duration::from_secs(config.search.rescan_secs.max(1));
    let mut rescan = tokio::time::interval(period);
    rescan.set_missed_tick_behavior(MissedTickBehavior::Delay);
    rescan.tick().await;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    tracing::info!("waiting for new sources, press Ctrl-C to exit");
    loop {
        tokio::select! {
            biased;
            signal = &mut ctrl_c => {
                if let Err(err) = signal {
                    tracing::warn!(error = %err, "failed to listen for Ctrl-C");
                }
                tracing::info!("shutting down");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => {
                    log_source_event(&event);
                    let (SourceEvent::Added(info), Some(query)) = (&event, query) else {
                        continue;
                    };
                    let Some(source) = registry.get(&info.id) else {
                        continue;
                    };
                    if !filter.matches(source.as_ref()) {
                        continue;
                    }
                    let handle = fan_out.search_sources(vec![source], query, options)?;
                    print_results(&handle.collect().await);
                }
                Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "missed source events"),
                Err(RecvError::Closed) => break,
            },
            _ = rescan.tick() => {
                let pruned = registry.prune_unavailable();
                if !pruned.is_empty() {
                    tracing::debug!(count = pruned.len(), "pruned unavailable sources");
                }
                registry.refresh_all().await;
                load_sources(&registry, &config.sources).await;
            }
        }
    }
    Ok(())
}

fn print_sources(registry: &SourceRegistry) {
    let infos = registry.infos();
    if infos.is_empty() {
        println!("No sources registered. Add [sources.<id>] entries to config.toml.");
        return;
    }
    for info in infos {
        let operations: Vec<&str> = info
            .capabilities
            .operations()
            .iter()
            .map(Operation::as_str)
            .collect();
        println!("{} ({})", info.name, info.id);
        println!("  operations: {}", operations.join(", "));
    }
}

fn describe_media(media: &Media) -> String {
    match (&media.artist, &media.album) {
        (Some(artist), Some(album)) => format!("{} - {artist} ({album})", media.title),
        (Some(artist), None) => format!("{} - {artist}", media.title),
        _ => media.title.clone(),
    }
}

fn print_results(results: &AggregatedResults) {
    if results.hits.is_empty() {
        println!("No results.");
    }
    for (rank, hit) in results.hits.iter().enumerate() {
        println!("{:>3}. [{:.3}] {}", rank + 1, hit.score, describe_media(&hit.media));
        println!("     sources: {}", hit.sources.join(", "));
        if let Some(url) = &hit.media.url {
            println!("     {url}");
        }
    }
    for outcome in &results.outcomes {
        println!("  {}: {}", outcome.name, describe_outcome(&outcome.status));
    }
}

fn describe_outcome(status: &OutcomeStatus) -> String {
    match status {
        OutcomeStatus::Completed { count: 1 } => "1 result".to_string(),
        OutcomeStatus::Completed { count } => format!("{count} results"),
        OutcomeStatus::Failed(message) => format!("failed ({message})"),
        OutcomeStatus::TimedOut => "timed out".to_string(),
        OutcomeStatus::Cancelled => "cancelled".to_string(),
    }
}

fn print_page(page: &Page<Media>) {
    if page.items.is_empty() {
        println!("Nothing to browse.");
    }
    for media in &page.items {
        let marker = if media.is_container() { "+" } else { " " };
        println!("{marker} {}", describe_media(media));
        println!("    id: {}", media.id);
    }
    if let Some(remaining) = page.remaining.filter(|r| *r > 0) {
        println!("({remaining} more)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medley_core::{SourceCapabilities, SourceInfo};
    use std::io::Write;
    use std::sync::Mutex;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["medley"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn query_is_positional_and_optional() {
        assert_eq!(cli(&["blue train"]).query(), Some("blue train"));
        assert_eq!(cli(&[]).query(), None);
        assert_eq!(cli(&["   "]).query(), None);
    }

    #[test]
    fn options_default_from_config() {
        let search = SearchConfig::default();
        let options = cli(&["jazz"]).options(&search).unwrap();
        assert_eq!(options.count, Count::Limited(search.default_count));
        assert_eq!(options.skip, 0);
        assert!(options.type_filter.is_all());
    }

    #[test]
    fn options_follow_flags() {
        let parsed = cli(&[
            "jazz", "--count", "all", "--skip", "5", "--type", "audio", "--type", "video",
        ]);
        let options = parsed.options(&SearchConfig::default()).unwrap();
        assert_eq!(options.count, Count::Unlimited);
        assert_eq!(options.skip, 5);
        assert!(options.type_filter.allows(MediaKind::Audio));
        assert!(options.type_filter.allows(MediaKind::Video));
        assert!(!options.type_filter.allows(MediaKind::Image));
        assert!(options.flags.full);
        assert!(options.flags.idle_relay);
        assert!(!options.flags.fast_only);
    }

    #[test]
    fn zero_count_and_timeout_are_rejected() {
        let search = SearchConfig::default();
        assert_eq!(
            cli(&["jazz", "--count", "0"]).options(&search),
            Err(CliError::ZeroCount)
        );
        assert_eq!(
            cli(&["jazz", "--timeout-ms", "0"])
                .coordinator_config(&search)
                .unwrap_err(),
            CliError::ZeroTimeout
        );
        assert!(Cli::try_parse_from(["medley", "--count", "lots"]).is_err());
    }

    #[test]
    fn timeout_override_applies() {
        let config = cli(&["jazz", "--timeout-ms", "250"])
            .coordinator_config(&SearchConfig::default())
            .unwrap();
        assert_eq!(config.source_timeout, Duration::from_millis(250));
    }

    #[test]
    fn container_requires_browse() {
        assert!(Cli::try_parse_from(["medley", "--container", "x"]).is_err());
        let parsed = cli(&["--browse", "music", "--container", "/srv/music/Jazz"]);
        assert_eq!(parsed.browse.as_deref(), Some("music"));
        assert_eq!(parsed.container.as_deref(), Some("/srv/music/Jazz"));
    }

    #[test]
    fn sources_are_repeatable() {
        let parsed = cli(&["jazz", "--source", "music", "--source", "radio"]);
        assert_eq!(parsed.sources, ["music", "radio"]);
    }

    #[test]
    fn outcomes_read_naturally() {
        assert_eq!(describe_outcome(&OutcomeStatus::Completed { count: 1 }), "1 result");
        assert_eq!(describe_outcome(&OutcomeStatus::Completed { count: 3 }), "3 results");
        assert_eq!(describe_outcome(&OutcomeStatus::TimedOut), "timed out");
    }

    /// Collects formatted log output for assertions.
    #[derive(Clone, Default)]
    struct LogCapture(Arc<Mutex<Vec<u8>>>);

    impl Write for LogCapture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl LogCapture {
        fn subscriber(&self) -> impl tracing::Subscriber + Send + Sync {
            let writer = self.clone();
            tracing_subscriber::fmt()
                .with_max_level(tracing::Level::DEBUG)
                .with_ansi(false)
                .without_time()
                .with_writer(move || writer.clone())
                .finish()
        }

        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    fn empty_fan_out() -> FanOut {
        FanOut::new(Arc::new(SourceRegistry::new()), CoordinatorConfig::default())
    }

    #[tokio::test]
    async fn missing_query_is_logged_and_skips_search() {
        let logs = LogCapture::default();
        let _guard = tracing::subscriber::set_default(logs.subscriber());

        let options = OperationOptions::first(5);
        let results = initial_search(&empty_fan_out(), None, options, &[])
            .await
            .unwrap();
        assert!(results.is_none());
        assert!(logs.text().contains("Query parameter missing"));
    }

    #[tokio::test]
    async fn query_runs_a_search() {
        let logs = LogCapture::default();
        let _guard = tracing::subscriber::set_default(logs.subscriber());

        let options = OperationOptions::first(5);
        let results = initial_search(&empty_fan_out(), Some("jazz"), options, &[])
            .await
            .unwrap()
            .unwrap();
        assert!(results.hits.is_empty());
        assert!(!logs.text().contains("Query parameter missing"));
    }

    #[test]
    fn new_sources_are_announced_by_name() {
        let logs = LogCapture::default();
        let _guard = tracing::subscriber::set_default(logs.subscriber());

        log_source_event(&SourceEvent::Added(SourceInfo {
            id: "radio".into(),
            name: "Web Radio".into(),
            capabilities: SourceCapabilities::all(),
        }));
        let text = logs.text();
        assert!(text.contains("Detected new source available: 'Web Radio'"));
        assert!(text.contains("Source supports search"));
    }
}
