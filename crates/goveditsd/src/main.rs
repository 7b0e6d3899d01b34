// # goveditsd - Government Edit Watcher Daemon
//
// Thin wiring layer over `govedits-core`. It reads configuration, takes the
// run lock, loads the range table, builds the feed factory and the
// collaborators, and runs one orchestrator until a signal arrives or a
// backfill window is consumed. No matching or cursor logic lives here.
//
// ## Commands
//
// - `run`: watch the feed in one mode
// - `ranges`: print range table statistics per tier
// - `dead-letters`: print the pages the sources gave up on
//
// ## Configuration
//
// Every option can be given as a flag or a `GOVEDITS_*` environment
// variable. An optional JSON file (`--config`, `GOVEDITS_CONFIG`) holding a
// `WatchConfig` is loaded first and flags override it.
//
// - `GOVEDITS_MODE`: stream, poll or backfill
// - `GOVEDITS_TIER`: all, federal or congress
// - `GOVEDITS_DAYS`: backfill window in days
// - `GOVEDITS_RANGES`: range table CSV
// - `GOVEDITS_STATE_DIR`: cursor documents, dead letters and the lock
// - `GOVEDITS_OUTPUT_DIR`: CSV records
// - `GOVEDITS_SCREENSHOTS_DIR`, `GOVEDITS_CAPTURE_COMMAND`, `GOVEDITS_NO_CAPTURE`
// - `GOVEDITS_PUBLISH`, `GOVEDITS_BLUESKY_IDENTIFIER`, `GOVEDITS_BLUESKY_PASSWORD`
// - `GOVEDITS_LOG_LEVEL`: tracing filter, falls back to `RUST_LOG`
//
// ## Example
//
// ```bash
// export GOVEDITS_RANGES=data/ranges.csv
// export GOVEDITS_BLUESKY_IDENTIFIER=watcher.bsky.social
// export GOVEDITS_BLUESKY_PASSWORD=app-password
//
// goveditsd run --mode stream --tier federal --publish
// goveditsd run --mode backfill --days 7 --tier congress
// ```

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

use govedits_core::clock::{Clock, SystemClock};
use govedits_core::engine::Collaborators;
use govedits_core::state::DeadLetterLog;
use govedits_core::traits::FeedMode;
use govedits_core::{
    AddressFamily, EngineEvent, FileCursorStore, Matcher, Orchestrator, RangeTable, RunLock,
    RunOutcome, Tier, WatchConfig,
};
use govedits_feed_wikimedia::WikimediaSourceFactory;
use govedits_sinks::{
    BlueskyPublisher, BlueskySettings, CommandCapture, CsvRecordSink, RegexClassifier,
};

/// Exit codes for different termination scenarios
///
/// - 0: Clean shutdown or completed backfill
/// - 1: Configuration or startup error (range table, lock contention)
/// - 2: Runtime error
#[derive(Debug, Clone, Copy)]
enum GoveditsExitCode {
    CleanShutdown = 0,
    ConfigError = 1,
    RuntimeError = 2,
}

impl From<GoveditsExitCode> for ExitCode {
    fn from(code: GoveditsExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

#[derive(Parser)]
#[command(name = "goveditsd")]
#[command(about = "Watch Wikipedia for edits made from government networks")]
#[command(version)]
struct Cli {
    /// Log filter (e.g. "info", "govedits_core=debug")
    #[arg(long, global = true, env = "GOVEDITS_LOG_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Watch the feed in one mode
    Run(Box<RunArgs>),
    /// Print range table statistics
    Ranges {
        /// Range table CSV
        #[arg(long, env = "GOVEDITS_RANGES")]
        ranges: PathBuf,
    },
    /// Print skipped feed pages
    DeadLetters {
        /// State directory
        #[arg(long, env = "GOVEDITS_STATE_DIR", default_value = "state")]
        state_dir: PathBuf,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// JSON file with a full watcher configuration
    #[arg(long, env = "GOVEDITS_CONFIG")]
    config: Option<PathBuf>,

    /// Feed mode: stream, poll or backfill
    #[arg(long, env = "GOVEDITS_MODE")]
    mode: Option<FeedMode>,

    /// Range filter: all, federal or congress
    #[arg(long, env = "GOVEDITS_TIER")]
    tier: Option<Tier>,

    /// Days of history a backfill covers
    #[arg(long, env = "GOVEDITS_DAYS")]
    days: Option<u32>,

    /// Range table CSV
    #[arg(long, env = "GOVEDITS_RANGES")]
    ranges: Option<PathBuf>,

    /// Directory for cursor documents, dead letters and the run lock
    #[arg(long, env = "GOVEDITS_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Seconds between poll cycles
    #[arg(long, env = "GOVEDITS_POLL_INTERVAL_SECS")]
    poll_interval_secs: Option<u64>,

    /// Wiki database name kept from the push feed
    #[arg(long, env = "GOVEDITS_WIKI")]
    wiki: Option<String>,

    /// Domain of that wiki
    #[arg(long, env = "GOVEDITS_WIKI_DOMAIN")]
    wiki_domain: Option<String>,

    #[command(flatten)]
    sinks: SinkArgs,
}

#[derive(Args, Debug)]
struct SinkArgs {
    /// Directory for the CSV records
    #[arg(long, env = "GOVEDITS_OUTPUT_DIR", default_value = "data")]
    output_dir: PathBuf,

    /// Directory for diff screenshots
    #[arg(long, env = "GOVEDITS_SCREENSHOTS_DIR", default_value = "data/screenshots")]
    screenshots_dir: PathBuf,

    /// Renderer command; {url}, {output} and {title} are substituted
    #[arg(long, env = "GOVEDITS_CAPTURE_COMMAND", value_delimiter = ' ')]
    capture_command: Vec<String>,

    /// Skip diff screenshots
    #[arg(long, env = "GOVEDITS_NO_CAPTURE")]
    no_capture: bool,

    /// Post matches to Bluesky
    #[arg(long, env = "GOVEDITS_PUBLISH")]
    publish: bool,

    /// Bluesky handle or email
    #[arg(long, env = "GOVEDITS_BLUESKY_IDENTIFIER")]
    bluesky_identifier: Option<String>,

    /// Bluesky app password
    #[arg(long, env = "GOVEDITS_BLUESKY_PASSWORD", hide_env_values = true)]
    bluesky_password: Option<String>,

    /// Bluesky PDS
    #[arg(long, env = "GOVEDITS_BLUESKY_SERVICE", default_value = govedits_sinks::bluesky::DEFAULT_SERVICE_URL)]
    bluesky_service: String,
}

impl RunArgs {
    /// Build and validate the watcher configuration
    fn to_config(&self) -> Result<WatchConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("Cannot read config file {}", path.display()))?;
                let mut config: WatchConfig = serde_json::from_str(&text)
                    .with_context(|| format!("Invalid config file {}", path.display()))?;
                if let Some(ranges) = &self.ranges {
                    config.ranges_path = ranges.clone();
                }
                config
            }
            None => {
                let ranges = self
                    .ranges
                    .clone()
                    .context("A range table is required (--ranges or GOVEDITS_RANGES)")?;
                WatchConfig::new(ranges)
            }
        };

        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if let Some(tier) = self.tier {
            config.tier = tier;
        }
        if let Some(days) = self.days {
            config.feed.backfill_days = days;
        }
        if let Some(dir) = &self.state_dir {
            config.state_dir = dir.clone();
        }
        if let Some(secs) = self.poll_interval_secs {
            config.feed.poll_interval_secs = secs;
        }
        if let Some(wiki) = &self.wiki {
            config.feed.wiki = wiki.clone();
        }
        if let Some(domain) = &self.wiki_domain {
            config.feed.wiki_domain = domain.clone();
        }

        config.validate()?;
        Ok(config)
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_tracing(cli.log_level.as_deref()) {
        eprintln!("Failed to initialize logging: {:#}", e);
        return GoveditsExitCode::ConfigError.into();
    }

    match cli.command {
        Command::Run(args) => run(*args),
        Command::Ranges { ranges } => print_ranges(&ranges),
        Command::DeadLetters { state_dir } => print_dead_letters(&state_dir),
    }
}

/// Install the global subscriber
///
/// An explicit level wins over `RUST_LOG`; with neither, `info`.
fn init_tracing(level: Option<&str>) -> Result<()> {
    let filter = match level {
        Some(level) => EnvFilter::try_new(level)
            .with_context(|| format!("Invalid log level '{}'", level))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to set tracing subscriber: {}", e))
}

fn run(args: RunArgs) -> ExitCode {
    let config = match args.to_config() {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {:#}", e);
            return GoveditsExitCode::ConfigError.into();
        }
    };

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            return GoveditsExitCode::RuntimeError.into();
        }
    };

    let code = rt.block_on(async {
        let daemon = match Daemon::start(config, &args.sinks).await {
            Ok(daemon) => daemon,
            Err(e) => {
                error!("Startup failed: {:#}", e);
                return GoveditsExitCode::ConfigError;
            }
        };

        match daemon.run().await {
            Ok(outcome) => {
                info!(?outcome, "Daemon finished");
                GoveditsExitCode::CleanShutdown
            }
            Err(e) => {
                error!("Daemon error: {:#}", e);
                GoveditsExitCode::RuntimeError
            }
        }
    });

    code.into()
}

/// A started watcher
struct Daemon {
    orchestrator: Orchestrator,
    event_logger: JoinHandle<()>,
    // released on drop, after the orchestrator has flushed
    _lock: RunLock,
}

impl Daemon {
    /// Everything that can fail before the feed is touched
    async fn start(config: WatchConfig, sinks: &SinkArgs) -> Result<Self> {
        info!(mode = %config.mode, tier = %config.tier, "Starting goveditsd");

        let lock = RunLock::acquire(&config.state_dir)?;

        let table = RangeTable::load_path(&config.ranges_path)?;
        info!(
            ranges = table.len(),
            visible = table.count_tier(config.tier),
            path = %config.ranges_path.display(),
            "Range table loaded"
        );
        if table.count_tier(config.tier) == 0 {
            warn!(tier = %config.tier, "No ranges visible under this tier; nothing will match");
        }
        let matcher = Matcher::new(Arc::new(table));

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let factory = Arc::new(WikimediaSourceFactory::new(&config, clock.clone())?);
        let store = Arc::new(FileCursorStore::new(&config.state_dir).await?);
        let collaborators = build_collaborators(&config, sinks).await?;

        let (orchestrator, events) =
            Orchestrator::new(&config, matcher, factory, store, collaborators, clock)?;
        let orchestrator = orchestrator.with_dead_letters(DeadLetterLog::in_dir(&config.state_dir));

        Ok(Self {
            orchestrator,
            event_logger: tokio::spawn(log_engine_events(ReceiverStream::new(events))),
            _lock: lock,
        })
    }

    /// Run until a signal or an exhausted backfill
    async fn run(mut self) -> Result<RunOutcome> {
        let shutdown = CancellationToken::new();
        let signals = tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                match wait_for_shutdown().await {
                    Ok(signal) => info!("Received shutdown signal: {}", signal),
                    Err(e) => error!("Signal handling failed: {:#}", e),
                }
                shutdown.cancel();
            }
        });

        let outcome = self.orchestrator.run(shutdown).await;
        signals.abort();

        // closes the event channel so the logger drains and exits
        drop(self.orchestrator);
        if tokio::time::timeout(Duration::from_secs(5), self.event_logger)
            .await
            .is_err()
        {
            warn!("Engine event logger did not finish");
        }

        Ok(outcome?)
    }
}

/// Record sink, classifier, and the optional capture and publisher
async fn build_collaborators(config: &WatchConfig, sinks: &SinkArgs) -> Result<Collaborators> {
    tokio::fs::create_dir_all(&sinks.output_dir)
        .await
        .with_context(|| format!("Cannot create output directory {}", sinks.output_dir.display()))?;
    let records = CsvRecordSink::in_dir(&sinks.output_dir);
    info!(path = %records.main_path().display(), "Recording matches");

    let capture = if sinks.no_capture {
        info!("Diff capture disabled");
        None
    } else {
        let command = if sinks.capture_command.is_empty() {
            govedits_sinks::capture::default_command()
        } else {
            sinks.capture_command.clone()
        };
        let capture = CommandCapture::new(&sinks.screenshots_dir, command)?;
        info!(dir = %capture.dir().display(), "Diff capture enabled");
        Some(Arc::new(capture) as Arc<dyn govedits_core::traits::DiffCapture>)
    };

    let publisher = if sinks.publish {
        let identifier = sinks
            .bluesky_identifier
            .clone()
            .context("Publishing needs GOVEDITS_BLUESKY_IDENTIFIER")?;
        let password = sinks
            .bluesky_password
            .clone()
            .context("Publishing needs GOVEDITS_BLUESKY_PASSWORD")?;
        let mut settings = BlueskySettings::new(identifier, password);
        settings.service_url = sinks.bluesky_service.clone();
        settings.request_timeout = config.dispatch.publish_timeout();
        let publisher = BlueskyPublisher::new(settings, &config.feed.user_agent)?;
        info!(?publisher, "Bluesky posting enabled");
        Some(Arc::new(publisher) as Arc<dyn govedits_core::traits::Publisher>)
    } else {
        info!("Bluesky posting disabled");
        None
    };

    Ok(Collaborators {
        classifier: Arc::new(RegexClassifier::new()?),
        capture,
        publisher,
        records: Arc::new(records),
    })
}

/// Log engine events until the orchestrator goes away
async fn log_engine_events(mut stream: ReceiverStream<EngineEvent>) {
    while let Some(event) = stream.next().await {
        match event {
            EngineEvent::Started { mode, tier } => debug!(%mode, %tier, "Engine started"),
            EngineEvent::BatchApplied {
                mode,
                events,
                dispatched,
            } => debug!(%mode, events, dispatched, "Batch applied"),
            EngineEvent::MatchDispatched { id, organization } => {
                info!(%id, %organization, "Government edit recorded")
            }
            EngineEvent::DuplicateSuppressed { id } => debug!(%id, "Duplicate suppressed"),
            EngineEvent::DispatchFailed {
                id,
                collaborator,
                error,
            } => debug!(%id, %collaborator, %error, "Collaborator failed"),
            EngineEvent::GapDetected { since, now } => {
                info!(%since, %now, "Feed gap, backfilling before streaming")
            }
            EngineEvent::BackfillCompleted {
                window_start,
                window_end,
            } => info!(%window_start, %window_end, "Backfill window consumed"),
            EngineEvent::FetchFailed { mode, error } => debug!(%mode, %error, "Fetch failed"),
            EngineEvent::Stopped { reason } => debug!(%reason, "Engine stopped"),
        }
    }
}

fn print_ranges(path: &Path) -> ExitCode {
    let table = match RangeTable::load_path(path) {
        Ok(table) => table,
        Err(e) => {
            error!("{}", e);
            return GoveditsExitCode::ConfigError.into();
        }
    };

    println!("{}", path.display());
    println!(
        "  ranges:   {} (IPv4 {}, IPv6 {})",
        table.len(),
        table.count(AddressFamily::V4),
        table.count(AddressFamily::V6)
    );
    for tier in [Tier::All, Tier::Federal, Tier::Congress] {
        println!("  {:<9} {}", format!("{}:", tier), table.count_tier(tier));
    }
    GoveditsExitCode::CleanShutdown.into()
}

fn print_dead_letters(state_dir: &Path) -> ExitCode {
    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            return GoveditsExitCode::RuntimeError.into();
        }
    };

    let log = DeadLetterLog::in_dir(state_dir);
    let pages = match rt.block_on(log.read_all()) {
        Ok(pages) => pages,
        Err(e) => {
            error!(path = %log.path().display(), "Cannot read dead letters: {}", e);
            return GoveditsExitCode::RuntimeError.into();
        }
    };

    for page in &pages {
        match serde_json::to_string(page) {
            Ok(line) => println!("{}", line),
            Err(e) => warn!("Unprintable dead letter: {}", e),
        }
    }
    info!(count = pages.len(), path = %log.path().display(), "Dead letters listed");
    GoveditsExitCode::CleanShutdown.into()
}

/// Wait for SIGTERM or SIGINT
#[cfg(unix)]
async fn wait_for_shutdown() -> Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGINT handler: {}", e))?;

    Ok(tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    })
}

/// Wait for CTRL-C
///
/// Fallback implementation for non-Unix platforms.
#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to wait for CTRL-C: {}", e))?;
    Ok("SIGINT")
}
