// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of newsfeed.
//
// newsfeed is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// newsfeed is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with newsfeed.  If not,
// see <http://www.gnu.org/licenses/>.

//! # newsfeedd
//!
//! # Introduction
//!
//! newsfeedd serves social news feeds over HTTP: paging through a user's feed, creating posts
//! (which are fanned-out to followers' feeds in the background) & maintaining the follow graph.

use std::{
    fmt::Display,
    fs::OpenOptions,
    future::IntoFuture,
    io,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use axum::{
    Router,
    http::{HeaderName, HeaderValue},
};
use clap::{Arg, ArgAction, Command, crate_authors, crate_version, value_parser};
use futures::{StreamExt, stream::FuturesUnordered};
use serde::Deserialize;
use snafu::{IntoError, prelude::*};
use tap::Pipe;
use tokio::{
    net::TcpListener,
    signal::unix::{SignalKind, signal},
    sync::{Notify, mpsc},
    task::JoinHandle,
};
use tower_http::request_id::{
    MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer,
};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::{
    Layer, Registry,
    filter::EnvFilter,
    fmt::{self, MakeWriter},
    layer::SubscriberExt,
};

use newsfeed::{
    background_tasks::{self, Backend as TasksBackend, BackgroundTasks, Context},
    cache::Backend as CacheBackend,
    config::Settings,
    counters::Counters,
    events::EventBus,
    fanout::FanoutCoordinator,
    graph::Friendships,
    http::{NewsFeed, make_router},
    memory::{MemoryCache, MemoryStore, MemoryTasks},
    metrics::{self, Instruments, check_metric_registrations},
    newsfeeds::{self, NewsFeeds},
    storage::Backend as StorageBackend,
    util::Credentials,
    wide_column,
};

/// The newsfeedd application error type
///
/// [Debug] is implemented by hand, in terms of [Display]: `main()` returns `Result<(), Error>`, and
/// the Rust runtime reports an `Err` on stderr using `Debug`. The derived implementation isn't
/// very readable.
#[derive(Snafu)]
pub enum Error {
    #[snafu(display("Failed to setup background task processing: {source}"))]
    BackgroundTasks { source: background_tasks::Error },
    #[snafu(display("Failed to bind to {addr}: {source}"))]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[snafu(display("Unable to read configuration file {pth:?}: {source}"))]
    ConfigNotFound {
        pth: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Error parsing configuration file {pth:?}: {source}"))]
    ConfigParse {
        pth: PathBuf,
        source: toml::de::Error,
    },
    #[snafu(display("Couldn't resolve the present working directory: {source}"))]
    CurrentDir { source: std::io::Error },
    #[snafu(display("Failed to parse RUST_LOG: {source}"))]
    EnvFilter {
        source: tracing_subscriber::filter::FromEnvError,
    },
    #[snafu(display("Failed to create the news feed tables: {source}"))]
    FeedTables { source: newsfeeds::Error },
    #[snafu(display("Failed to create the friendship tables: {source}"))]
    GraphTables { source: wide_column::Error },
    #[snafu(display("Failed to open the newsfeedd log file: {source}"))]
    LogFile { source: std::io::Error },
    #[snafu(display("Failed to HUP the logfile: {source}"))]
    LogHup {
        source: tokio::sync::mpsc::error::SendError<PathBuf>,
    },
    #[snafu(display("Metrics registration failure: {source}"))]
    Metrics { source: metrics::Error },
    #[snafu(display("Failed to install a handler for {name}: {source}"))]
    Signal {
        name: &'static str,
        source: std::io::Error,
    },
    #[snafu(display("Failed to set the tracing subscriber: {source}"))]
    Subscriber {
        source: tracing::subscriber::SetGlobalDefaultError,
    },
    #[snafu(display("Failed to connect to SycllaDB: {source}"))]
    Scylla {
        #[snafu(source(from(newsfeed::scylla::Error, Box::new)))]
        source: Box<newsfeed::scylla::Error>,
    },
    #[snafu(display("Failed to instantiate a Tokio runtime: {source}"))]
    TokioRuntime { source: std::io::Error },
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self, f)
    }
}

type Result<T> = std::result::Result<T, Error>;

type StdResult<T, E> = std::result::Result<T, E>;

static DEFAULT_CONFIG: &str = "/etc/newsfeed.toml";

/// Logging-related options read from the command line or the environment
struct LogOpts {
    pub to_file: bool,
    pub plain: bool,
    pub level: Level,
}

impl LogOpts {
    fn new(matches: &clap::ArgMatches) -> LogOpts {
        LogOpts {
            to_file: matches.get_flag("log-to-file"),
            plain: matches.get_flag("plain"),
            level: match (
                matches.get_flag("debug"),
                matches.get_flag("verbose"),
                matches.get_flag("quiet"),
            ) {
                (true, _, _) => Level::TRACE,
                (false, true, _) => Level::DEBUG,
                (false, false, true) => Level::ERROR,
                (_, _, _) => Level::INFO,
            },
        }
    }
}

/// Configuration options read from the CLI (or the environment)
struct CliOpts {
    pub log_opts: LogOpts,
    pub cfg: Option<PathBuf>,
}

impl CliOpts {
    fn new(matches: clap::ArgMatches) -> Result<CliOpts> {
        let here = std::env::current_dir().context(CurrentDirSnafu)?;
        Ok(CliOpts {
            log_opts: LogOpts::new(&matches),
            cfg: matches
                .get_one::<PathBuf>("config")
                .cloned()
                .map(|p| here.join(p)),
        })
    }
}

/// newsfeed datastore configuration
///
/// The rest of newsfeed writes to [StorageBackend] & [TasksBackend]; which implementation sits
/// behind them is decided here, at startup.
// Nb that we can only deserialize (i.e. not serialize) due to the presence of secrets in the
// struct
#[derive(Clone, Debug, Default, Deserialize)]
pub enum StorageConfig {
    /// Keep everything in process memory; handy for development, lost on exit
    #[default]
    Memory,
    /// Use ScyllaDB/CQL interface
    Scylla {
        /// ScyllaDB credentials, if authentication is to be used
        credentials: Option<Credentials>,
        /// ScyllaDB hosts; specify as "host:port"
        hosts: Vec<String>,
        keyspace: String,
        #[serde(rename = "replication-factor")]
        replication_factor: u32,
    },
}

/// newsfeed configuration, version one
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
struct ConfigV1 {
    /// The newsfeedd log file (only used when logging to file)
    #[serde(rename = "log-file")]
    log_file: PathBuf,
    /// Local address at which to listen for requests; specify as "address:port"
    #[serde(rename = "listen-address")]
    listen_address: SocketAddr,
    #[serde(rename = "storage-config")]
    storage_config: StorageConfig,
    /// Number of lists & counters the in-process cache will hold before evicting
    #[serde(rename = "cache-capacity")]
    cache_capacity: usize,
    settings: Settings,
    #[serde(rename = "background-tasks")]
    background_tasks: background_tasks::Config,
}

impl Default for ConfigV1 {
    fn default() -> Self {
        ConfigV1 {
            log_file: PathBuf::from("/tmp/newsfeed.log"),
            listen_address: SocketAddr::from(([0, 0, 0, 0], 20690)),
            storage_config: StorageConfig::default(),
            cache_capacity: 100_000,
            settings: Settings::default(),
            background_tasks: background_tasks::Config::default(),
        }
    }
}

#[derive(Deserialize)]
#[serde(tag = "version")] // tag "internally"
enum Configuration {
    #[serde(rename = "1")]
    V1(ConfigV1),
}

/// Parse the newsfeed configuration file
///
/// If no file was named & there's nothing at the default location, run with defaults.
fn parse_config(cfg: &Option<PathBuf>) -> Result<ConfigV1> {
    let (pth, defaulted): (PathBuf, bool) = cfg.as_ref().map_or_else(
        || (PathBuf::from(DEFAULT_CONFIG), true),
        |p| (p.clone(), false),
    );
    match std::fs::read_to_string(&pth) {
        Ok(text) => match toml::from_str::<Configuration>(&text) {
            Ok(Configuration::V1(cfg)) => Ok(cfg),
            Err(err) => Err(ConfigParseSnafu { pth }.into_error(err)),
        },
        Err(err) => {
            if defaulted {
                Ok(ConfigV1::default())
            } else {
                Err(ConfigNotFoundSnafu { pth }.into_error(err))
            }
        }
    }
}

/// A tracing-compatible, "reopenable" log file
///
/// The [Layer] gets the [LogFile] outright; we keep the send side of a channel on which to tell it
/// to close & re-open the file (in response to a `SIGHUP`, from `logrotate`, say).
struct LogFile {
    fd: Arc<Mutex<std::fs::File>>,
}

impl LogFile {
    /// Open a file at `pth`; return a [LogFile] instance along with the send side of a channel
    /// the caller can use to close & re-open the file.
    pub fn open(pth: &Path) -> StdResult<(LogFile, mpsc::Sender<PathBuf>), std::io::Error> {
        let (tx, rx) = mpsc::channel::<PathBuf>(1);
        let fd = OpenOptions::new()
            .create(true)
            .append(true)
            .open(pth)
            .map(|fd| Arc::new(Mutex::new(fd)))?;
        tokio::spawn(LogFile::rehup(fd.clone(), rx));
        Ok((LogFile { fd }, tx))
    }
    /// Close & re-open the file
    async fn rehup(fd: Arc<Mutex<std::fs::File>>, mut rx: mpsc::Receiver<PathBuf>) {
        while let Some(ref pbuf) = rx.recv().await {
            match OpenOptions::new().create(true).append(true).open(pbuf) {
                Ok(f) => *LogFile::lock(&fd) = f,
                Err(err) => error!("Failed to open {:?} ({}).", pbuf, err),
            }
        }
    }
    // A writer that panicked mid-line leaves nothing we can't write past
    fn lock(fd: &Mutex<std::fs::File>) -> MutexGuard<'_, std::fs::File> {
        fd.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct LogFileWriter<'a>(MutexGuard<'a, std::fs::File>);

impl<'a> MakeWriter<'a> for LogFile {
    type Writer = LogFileWriter<'a>;
    fn make_writer(&'a self) -> Self::Writer {
        LogFileWriter(LogFile::lock(&self.fd))
    }
}

impl io::Write for LogFileWriter<'_> {
    #[inline]
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    #[inline]
    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }

    #[inline]
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.0.write_all(buf)
    }
}

/// Configure newsfeedd logging
///
/// Log to stdout unless asked to log to file. If we're logging to file, return the sender side of
/// a channel that can be used to signal the file to close & re-open itself.
#[allow(clippy::type_complexity)]
fn configure_logging(
    logopts: &LogOpts,
    logfile: &Path,
) -> Result<(
    Box<dyn Layer<Registry> + Send + Sync>,
    EnvFilter,
    Option<mpsc::Sender<PathBuf>>,
)> {
    let filter = EnvFilter::builder()
        .with_default_directive(logopts.level.into())
        .from_env()
        .context(EnvFilterSnafu)?;

    //               |  file        |  stdout      |
    //               |--------------+--------------|
    // --plain=false |  json,file   |  json,stdout |
    // --plain=true  |  !json,file  | !json,stdout |
    //
    // `json()` & `with_writer()` produce layers of different types, hence the box.
    let mut tx = None;
    let formatter: Box<dyn Layer<Registry> + Send + Sync> = if logopts.to_file {
        let (log_file, tx_inner) = LogFile::open(logfile).context(LogFileSnafu)?;
        tx = Some(tx_inner);
        if logopts.plain {
            Box::new(
                fmt::Layer::default()
                    .compact()
                    .with_ansi(false)
                    .with_writer(log_file),
            )
        } else {
            Box::new(
                fmt::Layer::default()
                    .json()
                    .with_current_span(true)
                    .with_writer(log_file),
            )
        }
    } else if logopts.plain {
        Box::new(fmt::Layer::default().compact().with_writer(io::stdout))
    } else {
        Box::new(
            fmt::Layer::default()
                .json()
                .with_current_span(true)
                .with_writer(io::stdout),
        )
    };

    Ok((formatter, filter, tx))
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           the server                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Request IDs are just a counter: less information than a UUID, but readable, and a rough gauge
/// of how long the server's been up.
#[derive(Clone, Debug, Default)]
struct RequestIdGenerator {
    counter: Arc<AtomicU64>,
}

impl MakeRequestId for RequestIdGenerator {
    fn make_request_id<B>(&mut self, _request: &axum::extract::Request<B>) -> Option<RequestId> {
        self.counter
            .fetch_add(1, Ordering::SeqCst)
            .to_string()
            .pipe(|s| HeaderValue::from_str(&s))
            .ok()
            .map(RequestId::new)
    }
}

/// Wrap the API [Router] in our request ID & tracing layers
///
/// Incoming requests should hit the `SetRequestIdLayer` first, so it's the last (outer) layer
/// applied:
///
/// ```text
///                 requests
///                    |
///                    v
/// +---------  SetRequestIdLayer      ---------+
/// | +-----      TraceLayer         -----+     |
/// | | +--- PropagateRequestIdLayer ---+ |     |
/// | | |          handler              | |     |
/// | | +--- PropagateRequestIdLayer ---+ |     |
/// | +-----      TraceLayer         -----+     |
/// +---------   SetRequestIdLayer     ---------+
///                    |
///                    v
///                responses
/// ```
fn make_world_router(state: Arc<NewsFeed>) -> Router {
    make_router(state)
        .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
            "x-request-id",
        )))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_response(DefaultOnResponse::new().include_headers(true)),
        )
        .layer(SetRequestIdLayer::new(
            HeaderName::from_static("x-request-id"),
            RequestIdGenerator::default(),
        ))
}

async fn select_storage(
    config: &StorageConfig,
) -> Result<(
    Arc<dyn StorageBackend + Send + Sync>,
    Arc<dyn TasksBackend + Send + Sync>,
)> {
    match config {
        StorageConfig::Memory => {
            warn!("Using in-memory storage; nothing will survive a restart.");
            Ok((Arc::new(MemoryStore::new()), Arc::new(MemoryTasks::new())))
        }
        StorageConfig::Scylla {
            credentials,
            hosts,
            keyspace,
            replication_factor,
        } => {
            let x = Arc::new(
                newsfeed::scylla::Session::new(hosts, credentials, keyspace, *replication_factor)
                    .await
                    .context(ScyllaSnafu)?,
            );
            Ok((x.clone(), x))
        }
    }
}

/// Serve newsfeed API requests
///
/// The datastore connections & cache are built once; a `SIGHUP` re-reads the configuration &
/// rebuilds everything else (listener, settings, background task processing) from it. Changes to
/// the storage configuration take a restart.
#[tracing::instrument(skip(opts, cfg, log_file_hup))]
async fn serve(
    opts: CliOpts,
    mut cfg: ConfigV1,
    log_file_hup: Option<mpsc::Sender<PathBuf>>,
) -> Result<()> {
    // Produce a future which can be used to signal graceful shutdown, below.
    async fn shutdown_signal(nfy: Arc<Notify>) {
        nfy.notified().await
    }

    fn log_on_err<T, E>(x: StdResult<T, E>)
    where
        E: std::fmt::Debug,
    {
        if let Err(err) = x {
            error!("{:?}", err);
        }
    }

    type Processors = FuturesUnordered<JoinHandle<background_tasks::Result<()>>>;

    // Signal each task processor to shut-down & give them a bit to do so.
    async fn shutdown_processors(shutdowns: Vec<Arc<Notify>>, processors: Processors) {
        shutdowns.iter().for_each(|s| s.notify_one());
        match tokio::time::timeout(Duration::from_secs(5), processors.collect::<Vec<_>>()).await {
            Ok(results) => results.into_iter().for_each(|res| match res {
                Ok(Err(err)) => error!("Failed to shut-down a task processor: {:?}", err),
                Err(err) => error!("A task processor panicked: {:?}", err),
                _ => (),
            }),
            Err(err) => error!("Failed waiting to shut-down the task processors: {:?}", err),
        }
    }

    let mut sighup = signal(SignalKind::hangup()).context(SignalSnafu { name: "SIGHUP" })?;
    let mut sigterm = signal(SignalKind::terminate()).context(SignalSnafu { name: "SIGTERM" })?;

    let instruments = Arc::new(Instruments::new("newsfeed"));
    let (storage, tasks) = select_storage(&cfg.storage_config).await?;
    let cache: Arc<dyn CacheBackend + Send + Sync> =
        Arc::new(MemoryCache::new(cfg.cache_capacity));

    // Loop forever, handling SIGHUPs, until asked to terminate:
    loop {
        let settings = cfg.settings.clone();
        let feeds = Arc::new(NewsFeeds::new(
            storage.clone(),
            cache.clone(),
            &settings,
            instruments.clone(),
        ));
        feeds.create_if_missing().await.context(FeedTablesSnafu)?;
        let graph = Arc::new(Friendships::new(
            storage.clone(),
            settings.mode,
            settings.io_timeout,
        ));
        graph.create_if_missing().await.context(GraphTablesSnafu)?;
        let events = Arc::new(EventBus::new(
            feeds.clone(),
            Counters::new(cache.clone(), &settings),
        ));
        let background = Arc::new(BackgroundTasks::new(
            tasks.clone(),
            cfg.background_tasks.clone(),
            instruments.clone(),
        ));
        let context = Context {
            feeds: feeds.clone(),
            events,
            graph: graph.clone(),
            tasks: background.clone(),
            settings,
        };

        // One processor per queue, so that a flood of fan-out batches can't starve the
        // per-post planning tasks (or vice versa).
        let mut shutdowns: Vec<Arc<Notify>> = Vec::new();
        let mut processors: Processors = FuturesUnordered::new();
        for queue in &cfg.background_tasks.queues {
            let (handle, shutdown) = background_tasks::new(
                background.receiver(queue),
                context.clone(),
                Some(cfg.background_tasks.clone()),
                instruments.clone(),
            )
            .context(BackgroundTasksSnafu)?
            .into_parts();
            debug!("Processing background tasks on queue {}.", queue);
            processors.push(handle);
            shutdowns.push(shutdown);
        }

        let state = Arc::new(NewsFeed {
            feeds,
            graph,
            coordinator: FanoutCoordinator::new(context, instruments.clone()),
        });

        let nfy = Arc::new(Notify::new());
        let mut server = axum::serve(
            TcpListener::bind(cfg.listen_address)
                .await
                .context(BindSnafu {
                    addr: cfg.listen_address,
                })?,
            make_world_router(state),
        )
        .with_graceful_shutdown(shutdown_signal(nfy.clone()))
        .into_future();
        info!("Listening on {}.", cfg.listen_address);

        tokio::select! {
            // The server should never exit on its own, but it needs to be polled here.
            res = &mut server => {
                error!("The server exited unexpectedly with {:?}; shutting-down.", res);
                shutdown_processors(shutdowns, processors).await;
                break;
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP; re-reading configuration.");
                nfy.notify_one();
                log_on_err(server.await);
                shutdown_processors(shutdowns, processors).await;
                // On failure, keep going with the last known-good configuration.
                cfg = match parse_config(&opts.cfg) {
                    Ok(cfg) => cfg,
                    Err(err) => {
                        error!("{}; keeping the current configuration.", err);
                        cfg
                    }
                };
                if let Some(ref lfh) = log_file_hup {
                    // Whatever renamed the log file underneath us (`logrotate`, e.g.) wants us to
                    // start a new one under the old name.
                    lfh.send(cfg.log_file.clone()).await.context(LogHupSnafu)?;
                    info!("Started new log file.");
                }
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM; terminating.");
                nfy.notify_one();
                log_on_err(server.await);
                shutdown_processors(shutdowns, processors).await;
                break;
            }
            Some(res) = processors.next() => {
                error!("A background task processor exited early with {:?}; shutting-down.", res);
                nfy.notify_one();
                log_on_err(server.await);
                shutdown_processors(shutdowns, processors).await;
                break;
            }
        }; // End tokio::select!.
    } // End loop.

    Ok(())
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                    main() & process startup                                    //
////////////////////////////////////////////////////////////////////////////////////////////////////

async fn go_async(
    opts: CliOpts,
    bootstrap_logging_guard: tracing::dispatcher::DefaultGuard,
) -> Result<()> {
    // Configure logging *before* calling `serve()`, since it's instrumented. Failure to parse the
    // configuration here is fatal; in `serve()` we fall back to the last known-good configuration.
    fn go_async1(
        opts: &CliOpts,
    ) -> Result<(
        ConfigV1,
        Box<dyn Layer<Registry> + Send + Sync>,
        EnvFilter,
        Option<mpsc::Sender<PathBuf>>,
    )> {
        let cfg = parse_config(&opts.cfg)?;
        let (formatter, filter, log_file_hup) = configure_logging(&opts.log_opts, &cfg.log_file)?;
        Ok((cfg, formatter, filter, log_file_hup))
    }

    match go_async1(&opts) {
        Ok((cfg, formatter, filter, log_file_hup)) => {
            // Nb. this can only be invoked once
            tracing::subscriber::set_global_default(
                Registry::default().with(formatter).with(filter),
            )
            .context(SubscriberSnafu)?;
            drop(bootstrap_logging_guard);

            info!("newsfeedd version {} starting.", crate_version!());
            check_metric_registrations().context(MetricsSnafu)?;

            serve(opts, cfg, log_file_hup).await
        }
        Err(err) => {
            error!("While configuring logging: {err:?}");
            Err(err)
        }
    }
}

fn main() -> Result<()> {
    // Most configuration is read from file; the command-line options govern where to find that
    // file & how to log. They all have corresponding environment variables for the sake of
    // running in a container.
    let opts = CliOpts::new(
        Command::new("newsfeedd")
            .version(crate_version!())
            .author(crate_authors!())
            .about("Social news feeds")
            .long_about("`newsfeedd` serves users' news feeds, fanning-out new posts to followers.")
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .num_args(1)
                    .value_parser(value_parser!(PathBuf))
                    .env("NEWSFEED_CONFIG")
                    .help(
                        "path (absolute or relative to the process' current directory) to a \
                       configuration file",
                    ),
            )
            .arg(
                Arg::new("debug")
                    .short('D')
                    .long("debug")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("NEWSFEED_DEBUG")
                    .help("produce debug output"),
            )
            .arg(
                Arg::new("log-to-file")
                    .short('l')
                    .long("log-to-file")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("NEWSFEED_LOG_TO_FILE")
                    .help("log to the configured log file rather than stdout"),
            )
            .arg(
                Arg::new("plain")
                    .short('p')
                    .long("plain")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("NEWSFEED_PLAIN")
                    .help("log in human-readable format, not JSON/structured logging"),
            )
            .arg(
                Arg::new("quiet")
                    .short('q')
                    .long("quiet")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("NEWSFEED_QUIET")
                    .help("produce only error output"),
            )
            .arg(
                Arg::new("verbose")
                    .short('v')
                    .long("verbose")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("NEWSFEED_VERBOSE")
                    .help("produce prolix output"),
            )
            .get_matches(),
    )?;

    // Things can go wrong before we've parsed our configuration file & configured logging; log
    // them to stderr with a temporary subscriber (see
    // <https://github.com/tokio-rs/tracing/issues/2903>).
    let bootstrap_subscriber = Registry::default()
        .with(fmt::Layer::default().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(opts.log_opts.level.into())
                .from_env()
                .context(EnvFilterSnafu)?,
        );
    let bootstrap_logging_guard = tracing::subscriber::set_default(bootstrap_subscriber);
    debug!("Temporarily logging to stderr while initializing.");

    tokio::runtime::Runtime::new()
        .context(TokioRuntimeSnafu)?
        .block_on(go_async(opts, bootstrap_logging_guard))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn config() {
        let cfg = match toml::from_str::<Configuration>(
            r#"
version = "1"
listen-address = "127.0.0.1:8080"
cache-capacity = 64

[storage-config.Scylla]
hosts = ["localhost:9042"]
keyspace = "newsfeed"
replication-factor = 1

[settings]
list-capacity = 5
list-ttl = { secs = 60, nanos = 0 }
fanout-batch-size = 3
page-size = 2
io-timeout = { secs = 1, nanos = 0 }
"#,
        )
        .unwrap()
        {
            Configuration::V1(cfg) => cfg,
        };
        assert_eq!(cfg.cache_capacity, 64);
        assert_eq!(cfg.settings.page_size, 2);
        assert!(matches!(
            cfg.storage_config,
            StorageConfig::Scylla { replication_factor: 1, .. }
        ));
        // Unspecified sections take their defaults
        assert_eq!(cfg.log_file, PathBuf::from("/tmp/newsfeed.log"));
        assert_eq!(cfg.background_tasks.max_attempts, 3);
    }

    #[test]
    fn missing_named_config() {
        assert!(parse_config(&Some(PathBuf::from("/no/such/newsfeed.toml"))).is_err());
    }
}
