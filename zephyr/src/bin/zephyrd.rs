// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of zephyr.
//
// zephyr is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// zephyr is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even
// the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU General
// Public License for more details.
//
// You should have received a copy of the GNU General Public License along with zephyr.  If not,
// see <http://www.gnu.org/licenses/>.

//! # zephyrd
//!
//! The zephyr daemon.
//!
//! # Introduction
//!
//! zephyrd serves two HTTP listeners: the public API (under `/api`) & a private one for operators
//! (`/healthcheck`, `/metrics` & `/ops`). It's meant to run in the foreground, under a process
//! supervisor or in a container; it logs to stdout unless given a log file.
//!
//! `SIGHUP` re-reads the configuration file (keeping the last good one if the new one won't parse),
//! re-opens the log file & rebuilds every connection. `SIGTERM` shuts down gracefully.

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
};

use axum::{
    Router,
    extract::State,
    http::{HeaderName, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::get,
};
use chrono::Duration;
use clap::{Arg, ArgAction, Command, crate_authors, crate_version, value_parser};
use opentelemetry::{KeyValue, global};
use opentelemetry_prometheus_text_exporter::PrometheusExporter;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use snafu::{IntoError, prelude::*};
use tap::Pipe;
use tokio::{
    net::TcpListener,
    signal::unix::{SignalKind, signal},
    sync::{Notify, mpsc},
    time::MissedTickBehavior,
};
use tower_http::{
    request_id::{MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer},
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{Level, debug, error, info};
use tracing_subscriber::{
    Layer, Registry,
    filter::EnvFilter,
    fmt::{self, MakeWriter},
    layer::SubscriberExt,
};
use url::Url;

use zephyr::{
    chat::{self, ChatProvisioner, Disabled, StreamChat},
    github::{self, GitHub, GitHubOptions},
    kv_store::{self, Redis, RedisOptions, Store},
    memory::Memory,
    metrics::{Instruments, check_metric_registrations},
    post_views::PostViews,
    postgres::{self, Postgres},
    session::{CookieOptions, Sessions},
    signing_keys::SigningKeys,
    storage::Backend as StorageBackend,
    trending::{self, TopicSource, TrendingTopics, make_ops_router},
    zephyr::{Zephyr, make_api_router},
};

/// The zephyrd error type
///
/// `main()` returns `Result<(), Error>`, so should it fail, the runtime will print the error via
/// its [Debug] implementation. The derived implementation is unreadable, so [Debug] is implemented
/// by hand, below, in terms of [Display].
#[derive(Snafu)]
pub enum Error {
    #[snafu(display("Failed to bind {addr}: {source}"))]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[snafu(display("Failed to setup the chat service client: {source}"))]
    Chat { source: chat::Error },
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
    #[snafu(display("Failed to setup the GitHub client: {source}"))]
    GitHub { source: github::Error },
    #[snafu(display("Failed to connect to the key-value store: {source}"))]
    KvStore { source: kv_store::Error },
    #[snafu(display("Failed to open the zephyr log file: {source}"))]
    LogFile { source: std::io::Error },
    #[snafu(display("Failed to HUP the logfile: {source}"))]
    LogHup {
        source: tokio::sync::mpsc::error::SendError<PathBuf>,
    },
    #[snafu(display("Failed to connect to PostgreSQL: {source}"))]
    Postgres {
        #[snafu(source(from(postgres::Error, Box::new)))]
        source: Box<postgres::Error>,
    },
    #[snafu(display("Failed to install a handler for {signal}: {source}"))]
    Signal {
        signal: &'static str,
        source: std::io::Error,
    },
    #[snafu(display("Failed to set the tracing subscriber: {source}"))]
    Subscriber {
        source: tracing::subscriber::SetGlobalDefaultError,
    },
    #[snafu(display("Failed to instantiate a Tokio runtime: {source}"))]
    TokioRuntime { source: std::io::Error },
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self::Display::fmt(&self, f)
    }
}

type Result<T> = std::result::Result<T, Error>;

type StdResult<T, E> = std::result::Result<T, E>;

const DEFAULT_CONFIG: &str = "/etc/zephyr.toml";

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         configuration                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Logging-related options read from the command line or the environment
struct LogOpts {
    pub plain: bool,
    pub level: Level,
    /// Overrides the configuration file's `log-file`
    pub log_file: Option<PathBuf>,
}

impl LogOpts {
    fn new(matches: &clap::ArgMatches) -> LogOpts {
        LogOpts {
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
            log_file: matches.get_one::<PathBuf>("log-file").cloned(),
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

/// Where trending topics & view counters live
#[derive(Clone, Debug, Deserialize)]
pub enum KvStoreConfig {
    Redis {
        url: SecretString,
        #[serde(rename = "connect-timeout-secs")]
        connect_timeout_secs: Option<u64>,
        #[serde(rename = "response-timeout-secs")]
        response_timeout_secs: Option<u64>,
        retries: Option<usize>,
    },
    /// In-process; nothing survives a restart (or a `SIGHUP`)
    Memory,
}

impl Default for KvStoreConfig {
    fn default() -> Self {
        KvStoreConfig::Redis {
            url: SecretString::from("redis://127.0.0.1:6379".to_owned()),
            connect_timeout_secs: None,
            response_timeout_secs: None,
            retries: None,
        }
    }
}

/// Where accounts, posts & mentions live
#[derive(Clone, Debug, Deserialize)]
pub enum StorageConfig {
    Postgres {
        url: SecretString,
        #[serde(rename = "max-connections")]
        max_connections: Option<u32>,
        #[serde(rename = "acquire-timeout-secs")]
        acquire_timeout_secs: Option<u64>,
    },
    /// In-process; for development only
    Memory,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Postgres {
            url: SecretString::from("postgres://zephyr@localhost/zephyr".to_owned()),
            max_connections: None,
            acquire_timeout_secs: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct TrendingConfig {
    #[serde(rename = "primary-ttl-secs")]
    primary_ttl_secs: u64,
    #[serde(rename = "backup-ttl-secs")]
    backup_ttl_secs: u64,
    /// Only posts this many hours old (or younger) count
    #[serde(rename = "window-hours")]
    window_hours: i64,
    limit: usize,
    /// How often to check whether the cache needs warming
    #[serde(rename = "warm-interval-secs")]
    warm_interval_secs: u64,
}

impl Default for TrendingConfig {
    fn default() -> Self {
        let options = trending::Options::default();
        TrendingConfig {
            primary_ttl_secs: options.primary_ttl,
            backup_ttl_secs: options.backup_ttl,
            window_hours: options.window.num_hours(),
            limit: options.limit,
            warm_interval_secs: 300,
        }
    }
}

impl TrendingConfig {
    fn options(&self) -> trending::Options {
        trending::Options {
            primary_ttl: self.primary_ttl_secs,
            backup_ttl: self.backup_ttl_secs,
            window: Duration::hours(self.window_hours),
            limit: self.limit,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    #[serde(rename = "signing-keys")]
    signing_keys: SigningKeys,
    #[serde(rename = "lifetime-days")]
    lifetime_days: i64,
    /// Should be true anywhere but local development
    #[serde(rename = "secure-cookies")]
    secure_cookies: bool,
    #[serde(rename = "cookie-domain")]
    cookie_domain: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            signing_keys: SigningKeys::default(),
            lifetime_days: 30,
            secure_cookies: false,
            cookie_domain: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct GitHubConfig {
    #[serde(rename = "client-id")]
    client_id: String,
    #[serde(rename = "client-secret")]
    client_secret: SecretString,
    /// Defaults to `/api/auth/callback/github` on the public origin
    #[serde(rename = "redirect-uri")]
    redirect_uri: Option<Url>,
    #[serde(rename = "authorize-url")]
    authorize_url: Url,
    #[serde(rename = "token-url")]
    token_url: Url,
    #[serde(rename = "api-base")]
    api_base: Url,
    #[serde(rename = "timeout-secs")]
    timeout_secs: u64,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        GitHubConfig {
            client_id: String::new(),
            client_secret: SecretString::from(String::new()),
            redirect_uri: None,
            authorize_url: Url::parse("https://github.com/login/oauth/authorize")
                .unwrap(/* known good */),
            token_url: Url::parse("https://github.com/login/oauth/access_token")
                .unwrap(/* known good */),
            api_base: Url::parse("https://api.github.com/").unwrap(/* known good */),
            timeout_secs: 10,
        }
    }
}

/// Stream chat credentials
#[derive(Clone, Debug, Deserialize)]
pub struct ChatConfig {
    #[serde(rename = "api-base")]
    api_base: Url,
    #[serde(rename = "api-key")]
    api_key: String,
    #[serde(rename = "api-secret")]
    api_secret: SecretString,
    #[serde(rename = "timeout-secs")]
    timeout_secs: Option<u64>,
}

/// zephyr configuration, version one
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
struct ConfigV1 {
    /// Log here rather than stdout
    #[serde(rename = "log-file")]
    log_file: Option<PathBuf>,
    /// Local address at which to listen for public requests; specify as "address:port"
    #[serde(rename = "public-address")]
    public_address: SocketAddr,
    /// Address at which to listen for operator requests; specify as "address:port"
    #[serde(rename = "private-address")]
    private_address: SocketAddr,
    /// The origin at which browsers reach this zephyr instance
    #[serde(rename = "public-origin")]
    public_origin: Url,
    #[serde(rename = "user-agent")]
    user_agent: String,
    #[serde(rename = "kv-store")]
    kv_store: KvStoreConfig,
    storage: StorageConfig,
    trending: TrendingConfig,
    session: SessionConfig,
    github: GitHubConfig,
    /// None means no chat service
    chat: Option<ChatConfig>,
}

impl Default for ConfigV1 {
    fn default() -> Self {
        ConfigV1 {
            log_file: None,
            public_address: "0.0.0.0:20779".parse::<SocketAddr>().unwrap(/* known good */),
            private_address: "127.0.0.1:20780".parse::<SocketAddr>().unwrap(/* known good */),
            public_origin: Url::parse("http://localhost:20779").unwrap(/* known good */),
            user_agent: format!("zephyr/{}; +sp1ff@pobox.com", crate_version!()),
            kv_store: KvStoreConfig::default(),
            storage: StorageConfig::default(),
            trending: TrendingConfig::default(),
            session: SessionConfig::default(),
            github: GitHubConfig::default(),
            chat: None,
        }
    }
}

#[derive(Deserialize)]
#[serde(tag = "version")] // tag "internally"
enum Configuration {
    #[serde(rename = "1")]
    V1(ConfigV1),
}

/// Parse the zephyr configuration file
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

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            logging                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A tracing-compatible, "reopenable" log file
///
/// [MakeWriter] is implemented for `Mutex<W>` but not for `Arc<Mutex<W>>`, so the [Layer] gets
/// this, & we keep the send side of a channel over which to tell it to re-open the file (on
/// `SIGHUP`, after `logrotate` has moved it out of the way, say).
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
    fn lock(fd: &Mutex<std::fs::File>) -> MutexGuard<'_, std::fs::File> {
        fd.lock().unwrap_or_else(|err| err.into_inner())
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

/// Configure zephyr logging
///
/// JSON unless `--plain`; to the log file if there is one, to stdout otherwise. If we're logging
/// to file, also return the sender side of a channel that can be used to signal the file to close
/// & re-open itself.
#[allow(clippy::type_complexity)]
fn configure_logging(
    logopts: &LogOpts,
    logfile: Option<&Path>,
) -> Result<(
    Box<dyn Layer<Registry> + Send + Sync>,
    EnvFilter,
    Option<mpsc::Sender<PathBuf>>,
)> {
    let filter = EnvFilter::builder()
        .with_default_directive(logopts.level.into())
        .from_env()
        .context(EnvFilterSnafu)?;

    // `json()` & `with_writer()` produce layers of different types, hence the boxing.
    let mut tx = None;
    let formatter: Box<dyn Layer<Registry> + Send + Sync> = match logfile {
        Some(logfile) => {
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
        }
        None if logopts.plain => Box::new(fmt::Layer::default().compact().with_writer(io::stdout)),
        None => Box::new(
            fmt::Layer::default()
                .json()
                .with_current_span(true)
                .with_writer(io::stdout),
        ),
    };

    Ok((formatter, filter, tx))
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           the server                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Name the request counter for `method` & the route template that matched (if any); concrete
/// paths never appear in the name, so the set of counters is bounded by the routing table
fn counter_name(method: &axum::http::Method, matched: Option<&str>) -> String {
    // OTel names are restricted to ASCII alphanumerics, '_', '.', '-' & '/'; drop anything else &
    // map '/' to '.'
    let stem: String = match matched {
        Some(path) => path
            .chars()
            .filter_map(|c| match c {
                '/' => Some('.'),
                c if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' => Some(c),
                _ => None,
            })
            .collect(),
        None => ".unmatched".to_owned(),
    };
    format!("http.{}{}", method.as_str().to_lowercase(), stem)
}

/// Count requests per method & route
async fn otel_middleware(
    request: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let name = counter_name(
        request.method(),
        request
            .extensions()
            .get::<axum::extract::MatchedPath>()
            .map(|matched| matched.as_str()),
    );
    global::meter("zephyr").u64_counter(name).build().add(1, &[]);
    next.run(request).await
}

async fn healthcheck() -> &'static str {
    "GOOD"
}

async fn metrics(State(state): State<Arc<Zephyr>>) -> axum::response::Response {
    let mut output = Vec::new();
    match state.exporter.export(&mut output) {
        Ok(_) => String::from_utf8_lossy(&output).into_owned().into_response(),
        Err(err) => {
            error!("Failed to encode Prometheus metrics: {err:?}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Counter for generating request IDs; a u64 is more readable than a UUID & tells you roughly how
/// long the server's been up
#[derive(Clone, Debug, Default)]
struct RequestIdGenerator {
    counter: Arc<AtomicU64>,
}

impl MakeRequestId for RequestIdGenerator {
    fn make_request_id<B>(&mut self, _request: &axum::extract::Request<B>) -> Option<RequestId> {
        self.counter
            .fetch_add(1, Ordering::SeqCst)
            .to_string()
            .pipe(|s| HeaderValue::from_str(&s).ok())
            .map(RequestId::new)
    }
}

/// Make the [Router] that will be accessible to the world
fn make_world_router(state: Arc<Zephyr>) -> Router {
    Router::new()
        .nest("/api", make_api_router(state.clone()))
        // Incoming requests should hit `SetRequestIdLayer` first, so it's the last (outermost)
        // layer applied:
        //
        //                 requests
        //                    |
        //                    v
        // +---------  SetRequestIdLayer      ---------+
        // | +-------      OTEL layer         -------+ |
        // | | +-----      TraceLayer         -----+ | |
        // | | | +--- PropagateRequestIdLayer ---+ | | |
        // | | | |          handler              | | | |
        // | | | +--- PropagateRequestIdLayer ---+ | | |
        // | | +-----      TraceLayer         -----+ | |
        // | +-------      OTEL Layer         -------+ |
        // +---------   SetRequestIdLayer     ---------+
        //                    |
        //                    v
        //                responses
        .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
            "x-request-id",
        )))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_response(DefaultOnResponse::new().include_headers(true)),
        )
        .layer(axum::middleware::from_fn(otel_middleware))
        .layer(SetRequestIdLayer::new(
            HeaderName::from_static("x-request-id"),
            RequestIdGenerator::default(),
        ))
        .with_state(state)
}

/// Make the [Router] that will only be locally accessible
fn make_local_router(state: Arc<Zephyr>) -> Router {
    Router::new()
        .route("/healthcheck", get(healthcheck))
        .route("/metrics", get(metrics))
        .nest("/ops", make_ops_router(state.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(otel_middleware))
        .with_state(state)
}

fn select_kv_store(config: &KvStoreConfig) -> Result<Arc<dyn Store>> {
    match config {
        KvStoreConfig::Redis {
            url,
            connect_timeout_secs,
            response_timeout_secs,
            retries,
        } => {
            let defaults = RedisOptions::default();
            let options = RedisOptions {
                connect_timeout: connect_timeout_secs
                    .map(std::time::Duration::from_secs)
                    .unwrap_or(defaults.connect_timeout),
                response_timeout: response_timeout_secs
                    .map(std::time::Duration::from_secs)
                    .unwrap_or(defaults.response_timeout),
                retries: retries.unwrap_or(defaults.retries),
            };
            Ok(Arc::new(
                Redis::new(url.expose_secret(), &options).context(KvStoreSnafu)?,
            ))
        }
        KvStoreConfig::Memory => Ok(Arc::new(kv_store::Memory::new())),
    }
}

#[allow(clippy::type_complexity)]
async fn select_storage(
    config: &StorageConfig,
) -> Result<(
    Arc<dyn StorageBackend + Send + Sync>,
    Arc<dyn TopicSource + Send + Sync>,
)> {
    match config {
        StorageConfig::Postgres {
            url,
            max_connections,
            acquire_timeout_secs,
        } => {
            let x: Arc<Postgres> = Arc::new(
                Postgres::new(
                    url,
                    max_connections.unwrap_or(10),
                    std::time::Duration::from_secs(acquire_timeout_secs.unwrap_or(5)),
                )
                .await
                .context(PostgresSnafu)?,
            );
            Ok((
                x.clone() as Arc<dyn StorageBackend + Send + Sync>,
                x as Arc<dyn TopicSource + Send + Sync>,
            ))
        }
        StorageConfig::Memory => {
            let x = Arc::new(Memory::new());
            Ok((
                x.clone() as Arc<dyn StorageBackend + Send + Sync>,
                x as Arc<dyn TopicSource + Send + Sync>,
            ))
        }
    }
}

fn select_chat(
    config: Option<&ChatConfig>,
    user_agent: &str,
) -> Result<Arc<dyn ChatProvisioner + Send + Sync>> {
    match config {
        Some(config) => Ok(Arc::new(
            StreamChat::new(
                &config.api_base,
                &config.api_key,
                config.api_secret.clone(),
                user_agent,
                std::time::Duration::from_secs(config.timeout_secs.unwrap_or(5)),
            )
            .context(ChatSnafu)?,
        )),
        None => Ok(Arc::new(Disabled)),
    }
}

fn make_github(cfg: &ConfigV1) -> Result<GitHub> {
    GitHub::new(GitHubOptions {
        client_id: cfg.github.client_id.clone(),
        client_secret: cfg.github.client_secret.clone(),
        redirect_uri: cfg
            .github
            .redirect_uri
            .clone()
            .or_else(|| cfg.public_origin.join("/api/auth/callback/github").ok()),
        authorize_url: cfg.github.authorize_url.clone(),
        token_url: cfg.github.token_url.clone(),
        api_base: cfg.github.api_base.clone(),
        user_agent: cfg.user_agent.clone(),
        timeout: std::time::Duration::from_secs(cfg.github.timeout_secs),
    })
    .context(GitHubSnafu)
}

/// Warm the trending topics cache every `period`, until notified
async fn warm_periodically(
    trending: Arc<TrendingTopics>,
    period: std::time::Duration,
    nfy: Arc<Notify>,
) {
    let mut ticks = tokio::time::interval(period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticks.tick() => {
                if trending.warm_cache().await {
                    debug!("Warmed the trending topics cache.");
                }
            }
            _ = nfy.notified() => break,
        }
    }
}

/// Serve zephyr API requests
#[tracing::instrument(skip(opts, cfg, log_file_hup))]
async fn serve(
    opts: CliOpts,
    mut cfg: ConfigV1,
    log_file_hup: Option<mpsc::Sender<PathBuf>>,
) -> Result<()> {
    async fn shutdown_signal(nfy: Arc<Notify>) {
        nfy.notified().await
    }

    fn log_on_err<T, E>(x: StdResult<T, E>)
    where
        E: std::error::Error + std::fmt::Debug,
    {
        if let Err(err) = x {
            error!("{:?}", err);
        }
    }

    let mut sighup = signal(SignalKind::hangup()).context(SignalSnafu { signal: "SIGHUP" })?;
    let mut sigterm = signal(SignalKind::terminate()).context(SignalSnafu { signal: "SIGTERM" })?;

    let exporter = init_telemetry();
    let instruments = Arc::new(Instruments::new("zephyr"));

    let mut previous_store: Option<Arc<dyn Store>> = None;

    // Loop forever, handling SIGHUPs, until asked to terminate:
    loop {
        // Re-build our connections each pass, in case configuration values have changed. A bad
        // key-value store configuration on reload leaves the previous store in place:
        let kv = match (select_kv_store(&cfg.kv_store), previous_store.take()) {
            (Ok(kv), _) => kv,
            (Err(err), Some(previous)) => {
                error!("{err}; keeping the previous key-value store.");
                previous
            }
            (Err(err), None) => return Err(err),
        };
        previous_store = Some(kv.clone());
        let store = kv;
        let (storage, source) = select_storage(&cfg.storage).await?;
        let trending = Arc::new(TrendingTopics::new(
            store.clone(),
            source,
            cfg.trending.options(),
            instruments.clone(),
        ));
        let state = Arc::new(Zephyr {
            storage,
            trending: trending.clone(),
            views: PostViews::new(store, instruments.clone()),
            identity: Arc::new(make_github(&cfg)?),
            chat: select_chat(cfg.chat.as_ref(), &cfg.user_agent)?,
            sessions: Sessions::new(
                cfg.session.signing_keys.clone(),
                cfg.public_origin.host_str().unwrap_or("localhost"),
                Duration::days(cfg.session.lifetime_days),
                CookieOptions {
                    secure: cfg.session.secure_cookies,
                    domain: cfg.session.cookie_domain.clone(),
                },
            ),
            exporter: exporter.clone(),
            instruments: instruments.clone(),
        });

        let world_nfy = Arc::new(Notify::new());
        let local_nfy = Arc::new(Notify::new());
        let warmer_nfy = Arc::new(Notify::new());

        let world_server = axum::serve(
            TcpListener::bind(cfg.public_address)
                .await
                .context(BindSnafu {
                    addr: cfg.public_address,
                })?,
            make_world_router(state.clone()),
        )
        .with_graceful_shutdown(shutdown_signal(world_nfy.clone()));

        let local_server = axum::serve(
            TcpListener::bind(cfg.private_address)
                .await
                .context(BindSnafu {
                    addr: cfg.private_address,
                })?,
            make_local_router(state.clone()),
        )
        .with_graceful_shutdown(shutdown_signal(local_nfy.clone()));

        let warmer = tokio::spawn(warm_periodically(
            trending,
            std::time::Duration::from_secs(cfg.trending.warm_interval_secs.max(1)),
            warmer_nfy.clone(),
        ));

        info!(
            "Serving the public API on {} & operator endpoints on {}.",
            cfg.public_address, cfg.private_address
        );

        let mut world_server = world_server.into_future();
        let mut local_server = local_server.into_future();

        let terminate = tokio::select! {
            res = &mut world_server => {
                error!("The public server exited unexpectedly ({res:?}); shutting-down.");
                local_nfy.notify_one();
                log_on_err(local_server.await);
                true
            }
            res = &mut local_server => {
                error!("The private server exited unexpectedly ({res:?}); shutting-down.");
                world_nfy.notify_one();
                log_on_err(world_server.await);
                true
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP; re-reading configuration & re-connecting.");
                world_nfy.notify_one();
                local_nfy.notify_one();
                log_on_err(world_server.await);
                log_on_err(local_server.await);
                false
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM; terminating.");
                world_nfy.notify_one();
                local_nfy.notify_one();
                log_on_err(world_server.await);
                log_on_err(local_server.await);
                true
            }
        };

        warmer_nfy.notify_one();
        log_on_err(warmer.await);

        if terminate {
            break;
        }

        // Keep the last good configuration if the new one won't do
        cfg = match parse_config(&opts.cfg) {
            Ok(cfg) => cfg,
            Err(err) => {
                error!("{err}; keeping the current configuration.");
                cfg
            }
        };
        if let Some(ref lfh) = log_file_hup {
            // `logrotate` & friends rename the log file & then HUP us; re-open under the configured
            // name
            let pth = opts
                .log_opts
                .log_file
                .clone()
                .or_else(|| cfg.log_file.clone());
            if let Some(pth) = pth {
                lfh.send(pth).await.context(LogHupSnafu)?;
                info!("Started new log file.");
            }
        }
    }

    Ok(())
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                    main() & process startup                                    //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Initialize telemetry; must be invoked before any instruments are created
///
/// Return an exporter that can be used to implement a `/metrics` endpoint.
fn init_telemetry() -> PrometheusExporter {
    check_metric_registrations();
    let exporter = PrometheusExporter::new();

    let provider = opentelemetry_sdk::metrics::SdkMeterProvider::builder()
        .with_resource(
            opentelemetry_sdk::Resource::builder_empty()
                .with_attribute(KeyValue::new("service.name", "zephyr"))
                .build(),
        )
        .with_reader(exporter.clone())
        .build();
    global::set_meter_provider(provider);

    exporter
}

/// Configure logging (which depends on configuration) & then serve
async fn go_async(
    opts: CliOpts,
    bootstrap_logging_guard: tracing::dispatcher::DefaultGuard,
) -> Result<()> {
    #[allow(clippy::type_complexity)]
    fn go_async1(
        opts: &CliOpts,
    ) -> Result<(
        ConfigV1,
        Box<dyn Layer<Registry> + Send + Sync>,
        EnvFilter,
        Option<mpsc::Sender<PathBuf>>,
    )> {
        // Failure to parse at this point is fatal; in `serve()`, on SIGHUP, we fall back to the
        // last good configuration.
        let cfg = parse_config(&opts.cfg)?;
        let log_file = opts.log_opts.log_file.clone().or_else(|| cfg.log_file.clone());
        let (formatter, filter, log_file_hup) =
            configure_logging(&opts.log_opts, log_file.as_deref())?;
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

            info!("zephyr version {} starting.", crate_version!());

            serve(opts, cfg, log_file_hup).await
        }
        Err(err) => {
            error!("While configuring logging: {err:?}");
            Err(err)
        }
    }
}

fn main() -> Result<()> {
    // Most configuration is read from file; the command-line options say where to find it & govern
    // logging. They all have corresponding environment variables for the sake of containers.
    let opts = CliOpts::new(
        Command::new("zephyrd")
            .version(crate_version!())
            .author(crate_authors!())
            .about("The zephyr social network daemon")
            .long_about(
                "`zephyrd` serves zephyr's trending topics, post view counters & GitHub sign-in.",
            )
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .num_args(1)
                    .value_parser(value_parser!(PathBuf))
                    .env("ZEPHYR_CONFIG")
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
                    .env("ZEPHYR_DEBUG")
                    .help("produce debug output"),
            )
            .arg(
                Arg::new("log-file")
                    .short('l')
                    .long("log-file")
                    .num_args(1)
                    .value_parser(value_parser!(PathBuf))
                    .env("ZEPHYR_LOG_FILE")
                    .help("log to this file rather than stdout"),
            )
            .arg(
                Arg::new("plain")
                    .short('p')
                    .long("plain")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("ZEPHYR_PLAIN")
                    .help("log in human-readable format, not JSON/structured logging"),
            )
            .arg(
                Arg::new("quiet")
                    .short('q')
                    .long("quiet")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("ZEPHYR_QUIET")
                    .help("produce only error output"),
            )
            .arg(
                Arg::new("verbose")
                    .short('v')
                    .long("verbose")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("ZEPHYR_VERBOSE")
                    .help("produce prolix output"),
            )
            .get_matches(),
    )?;

    // Plenty can go wrong before we've parsed our configuration & configured logging properly, so
    // log to stderr in the meantime (<https://github.com/tokio-rs/tracing/issues/2903>).
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

    use zephyr::github::IdentityProvider;

    #[test]
    fn parse_a_full_configuration() {
        let cfg: Configuration = toml::from_str(
            r#"
version = "1"
public-address = "0.0.0.0:8080"
private-address = "127.0.0.1:8081"
public-origin = "https://zephyr.example.com"
user-agent = "zephyr-test"

[kv-store.Redis]
url = "redis://cache:6379"
retries = 4

[storage.Postgres]
url = "postgres://zephyr:hunter2@db/zephyr"
max-connections = 20

[trending]
primary-ttl-secs = 600
warm-interval-secs = 60

[session]
lifetime-days = 7
secure-cookies = true
cookie-domain = "example.com"

[github]
client-id = "Iv1.0123456789abcdef"
client-secret = "shh"

[chat]
api-base = "https://chat.stream-io-api.com/"
api-key = "key"
api-secret = "secret"
"#,
        )
        .unwrap();
        let Configuration::V1(cfg) = cfg;
        assert_eq!(cfg.public_address.port(), 8080);
        assert!(matches!(
            cfg.kv_store,
            KvStoreConfig::Redis {
                retries: Some(4),
                ..
            }
        ));
        assert!(matches!(
            cfg.storage,
            StorageConfig::Postgres {
                max_connections: Some(20),
                ..
            }
        ));
        let options = cfg.trending.options();
        assert_eq!(options.primary_ttl, 600);
        // Unspecified values take their defaults
        assert_eq!(options.backup_ttl, 86_400);
        assert_eq!(options.limit, 10);
        assert!(cfg.session.secure_cookies);
        assert_eq!(cfg.github.token_url.as_str(), "https://github.com/login/oauth/access_token");
        assert_eq!(
            make_github(&cfg)
                .unwrap()
                .authorization_url("xyz")
                .query_pairs()
                .find(|(k, _)| k == "redirect_uri")
                .map(|(_, v)| v.into_owned()),
            Some("https://zephyr.example.com/api/auth/callback/github".to_owned())
        );
        assert!(cfg.chat.is_some());
    }

    #[test]
    fn minimal_configuration_for_development() {
        let cfg: Configuration = toml::from_str(
            r#"
version = "1"
kv-store = "Memory"
storage = "Memory"
"#,
        )
        .unwrap();
        let Configuration::V1(cfg) = cfg;
        assert!(matches!(cfg.kv_store, KvStoreConfig::Memory));
        assert!(matches!(cfg.storage, StorageConfig::Memory));
        assert!(cfg.chat.is_none());
        assert!(cfg.log_file.is_none());
    }

    #[test]
    fn request_counters_are_named_by_route() {
        use axum::http::Method;
        assert_eq!(
            counter_name(&Method::GET, Some("/api/posts/{post_id}/views")),
            "http.get.api.posts.post_id.views"
        );
        assert_eq!(
            counter_name(&Method::POST, Some("/api/posts/views")),
            "http.post.api.posts.views"
        );
        // Paths that matched no route share one counter, whatever they were
        assert_eq!(counter_name(&Method::GET, None), "http.get.unmatched");
        assert_eq!(counter_name(&Method::DELETE, None), "http.delete.unmatched");
    }

    #[tokio::test]
    async fn request_counters_see_the_matched_route() {
        use axum::{body::Body, http::Request};
        use std::sync::Mutex;
        use tower::ServiceExt;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = seen.clone();
        let app = Router::new()
            .nest(
                "/api",
                Router::new().route("/posts/{post_id}/views", get(healthcheck)),
            )
            .layer(axum::middleware::from_fn(
                move |request: axum::extract::Request, next: axum::middleware::Next| {
                    let record = record.clone();
                    async move {
                        let matched = request
                            .extensions()
                            .get::<axum::extract::MatchedPath>()
                            .map(|matched| matched.as_str().to_owned());
                        record
                            .lock()
                            .unwrap()
                            .push(counter_name(request.method(), matched.as_deref()));
                        next.run(request).await
                    }
                },
            ));
        for uri in ["/api/posts/1/views", "/api/posts/2/views", "/no/such/1", "/no/such/2"] {
            app.clone()
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
        }
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                "http.get.api.posts.post_id.views",
                "http.get.api.posts.post_id.views",
                "http.get.unmatched",
                "http.get.unmatched",
            ]
        );
    }

    #[test]
    fn select_a_redis_store_without_connecting() {
        // Nothing listens on port 1; selection succeeds regardless
        let config = KvStoreConfig::Redis {
            url: SecretString::from("redis://127.0.0.1:1".to_owned()),
            connect_timeout_secs: Some(1),
            response_timeout_secs: None,
            retries: None,
        };
        assert!(select_kv_store(&config).is_ok());
        let config = KvStoreConfig::Redis {
            url: SecretString::from("not a redis url".to_owned()),
            connect_timeout_secs: None,
            response_timeout_secs: None,
            retries: None,
        };
        assert!(matches!(select_kv_store(&config), Err(Error::KvStore { .. })));
    }

    #[test]
    fn missing_explicit_config_is_an_error() {
        assert!(matches!(
            parse_config(&Some(PathBuf::from("/no/such/zephyr.toml"))),
            Err(Error::ConfigNotFound { .. })
        ));
    }
}
