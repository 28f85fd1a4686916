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

//! # Trending topics
//!
//! Trending topics are the most-used hashtags over a recent window. Computing them means scanning
//! every recent post, so we cache the result in the key-value store under three keys:
//!
//! - `trending:topics`: the topics, as JSON, with a short TTL (an hour by default)
//! - `trending:topics:backup`: the same, with a long TTL (a day by default)
//! - `trending:topics:last_updated`: epoch milliseconds of the last write, with the short TTL
//!
//! All three are written in a single pipeline. Reads go to the primary key; if *reading* it fails
//! (as opposed to finding it absent) we fall back to the backup, and if that fails too we answer
//! with nothing at all. Invalidation removes the primary & its timestamp but leaves the backup in
//! place.
//!
//! A refresh is due once half the primary TTL has elapsed since the last write (or there's no
//! record of a write at all), so a warmer running more often than that keeps readers from ever
//! seeing the primary expire.
//!
//! Recomputation is single-flight per [TrendingTopics] instance. A warm that finds a recomputation
//! already underway just returns; a reader that finds the cache empty waits for the in-flight
//! recomputation & then re-checks the cache before computing anything itself.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::State,
    http::{HeaderValue, StatusCode, header::CONTENT_TYPE},
    response::IntoResponse,
    routing::{delete, get, post},
};
use chrono::{DateTime, Duration, Utc};
use snafu::{Backtrace, prelude::*};
use tower_http::{cors::CorsLayer, set_header::SetResponseHeaderLayer};
use tracing::{debug, error, info};

use zephyr_shared::{TrendingTopic, api::TrendingTopicsRsp};

use crate::{
    counter_add,
    fallback::{Fallback, Level},
    gauge_setu,
    http::ErrorResponseBody,
    kv_store::{self, Command, Store},
    metrics::{self, Instruments, Sort},
    storage,
    zephyr::Zephyr,
};

pub const PRIMARY_KEY: &str = "trending:topics";
pub const BACKUP_KEY: &str = "trending:topics:backup";
pub const LAST_UPDATED_KEY: &str = "trending:topics:last_updated";

const GET_PRIMARY: Fallback<()> = Fallback::new("trending.get.primary", Level::Error, || ());
const GET_BACKUP: Fallback<Vec<TrendingTopic>> =
    Fallback::new("trending.get.backup", Level::Error, Vec::new);
const SET: Fallback<()> = Fallback::new("trending.set", Level::Error, || ());
const INVALIDATE: Fallback<()> = Fallback::new("trending.invalidate", Level::Error, || ());
const SHOULD_REFRESH: Fallback<bool> =
    Fallback::new("trending.should_refresh", Level::Warn, || true);

inventory::submit! { metrics::Registration::new("trending.refreshes", Sort::IntegralCounter) }
inventory::submit! {
    metrics::Registration::new("trending.refresh.failures", Sort::IntegralCounter)
}
inventory::submit! { metrics::Registration::new("trending.topics", Sort::IntegralGauge) }

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to (de)serialize trending topics: {source}"))]
    Json {
        source: serde_json::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to compute trending topics: {source}"))]
    Source { source: storage::Error },
    #[snafu(display("Key-value store error: {source}"))]
    Store { source: kv_store::Error },
}

impl Error {
    pub fn as_status_and_msg(&self) -> (StatusCode, String) {
        match self {
            Error::Json { source, .. } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Bad trending topics: {source}"),
            ),
            Error::Source { source } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to compute trending topics: {source}"),
            ),
            Error::Store { source } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Key-value store error: {source}"),
            ),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        let (code, msg) = self.as_status_and_msg();
        (code, ErrorResponseBody::new(msg)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          TopicSource                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Whatever can compute trending topics from scratch
#[async_trait]
pub trait TopicSource {
    /// The `limit` most-used hashtags in posts created at or after `since`, most-used first (ties
    /// broken by hashtag)
    async fn trending_topics(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> storage::Result<Vec<TrendingTopic>>;
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         TrendingTopics                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Cache tuning
#[derive(Clone, Debug)]
pub struct Options {
    /// TTL, in seconds, for the primary & timestamp keys
    pub primary_ttl: u64,
    /// TTL, in seconds, for the backup key
    pub backup_ttl: u64,
    /// Only posts this recent count towards trending topics
    pub window: Duration,
    /// Maximum number of topics to keep
    pub limit: usize,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            primary_ttl: 3600,
            backup_ttl: 86_400,
            window: Duration::hours(24),
            limit: 10,
        }
    }
}

pub struct TrendingTopics {
    store: Arc<dyn Store>,
    source: Arc<dyn TopicSource + Send + Sync>,
    options: Options,
    instruments: Arc<Instruments>,
    refreshing: tokio::sync::Mutex<()>,
}

/// What the cache holds: the primary value (or, if it couldn't be decoded, a non-empty backup),
/// nothing, or the backup because the store couldn't be reached
enum Cached {
    Hit(Vec<TrendingTopic>),
    Miss,
    Unavailable(Vec<TrendingTopic>),
}

impl TrendingTopics {
    pub fn new(
        store: Arc<dyn Store>,
        source: Arc<dyn TopicSource + Send + Sync>,
        options: Options,
        instruments: Arc<Instruments>,
    ) -> TrendingTopics {
        TrendingTopics {
            store,
            source,
            options,
            instruments,
            refreshing: tokio::sync::Mutex::new(()),
        }
    }
    async fn read(&self, key: &str) -> Result<Option<Vec<TrendingTopic>>> {
        match self.store.get(key).await.context(StoreSnafu)? {
            Some(text) => serde_json::from_str(&text).context(JsonSnafu).map(Some),
            None => Ok(None),
        }
    }
    async fn cached(&self) -> Cached {
        match self.read(PRIMARY_KEY).await {
            Ok(Some(topics)) => Cached::Hit(topics),
            Ok(None) => Cached::Miss,
            Err(err) => {
                GET_PRIMARY.note(&err, &self.instruments);
                let backup = self.get_backup().await;
                match err {
                    Error::Store { .. } => Cached::Unavailable(backup),
                    _ if backup.is_empty() => Cached::Miss,
                    _ => Cached::Hit(backup),
                }
            }
        }
    }
    /// Retrieve the cached topics; an absent primary key yields an empty list
    pub async fn get(&self) -> Vec<TrendingTopic> {
        match self.cached().await {
            Cached::Hit(topics) | Cached::Unavailable(topics) => topics,
            Cached::Miss => Vec::new(),
        }
    }
    pub async fn get_backup(&self) -> Vec<TrendingTopic> {
        GET_BACKUP.recover(
            self.read(BACKUP_KEY).await.map(Option::unwrap_or_default),
            &self.instruments,
        )
    }
    async fn set1(&self, topics: &[TrendingTopic], now_ms: i64) -> Result<()> {
        let text = serde_json::to_string(topics).context(JsonSnafu)?;
        self.store
            .pipeline(&[
                Command::set_ex(PRIMARY_KEY, text.clone(), self.options.primary_ttl),
                Command::set_ex(BACKUP_KEY, text, self.options.backup_ttl),
                Command::set_ex(
                    LAST_UPDATED_KEY,
                    now_ms.to_string(),
                    self.options.primary_ttl,
                ),
            ])
            .await
            .context(StoreSnafu)?;
        Ok(())
    }
    /// Write `topics` to the primary & backup keys & record the time
    pub async fn set(&self, topics: &[TrendingTopic]) {
        SET.recover(
            self.set1(topics, Utc::now().timestamp_millis()).await,
            &self.instruments,
        )
    }
    /// Drop the primary key & its timestamp; the backup survives
    pub async fn invalidate(&self) {
        let result = self
            .store
            .pipeline(&[Command::del(PRIMARY_KEY), Command::del(LAST_UPDATED_KEY)])
            .await
            .map(|_| info!("Invalidated the trending topics cache"));
        INVALIDATE.recover(result, &self.instruments)
    }
    async fn should_refresh1(&self, now_ms: i64) -> Result<bool> {
        let last_updated = self
            .store
            .get(LAST_UPDATED_KEY)
            .await
            .context(StoreSnafu)?
            .and_then(|text| text.trim().parse::<i64>().ok());
        let half_life_ms = (self.options.primary_ttl as i64).saturating_mul(1000) / 2;
        Ok(last_updated.is_none_or(|ts| now_ms - ts > half_life_ms))
    }
    /// True if there's no record of the last write, or more than half the primary TTL has
    /// elapsed since it, as of `now_ms` (milliseconds since the epoch)
    pub async fn should_refresh_at(&self, now_ms: i64) -> bool {
        SHOULD_REFRESH.recover(self.should_refresh1(now_ms).await, &self.instruments)
    }
    pub async fn should_refresh(&self) -> bool {
        self.should_refresh_at(Utc::now().timestamp_millis()).await
    }
    /// Compute the topics from scratch & cache them; callers must hold `refreshing`
    async fn recompute(&self) -> Result<Vec<TrendingTopic>> {
        let since = Utc::now() - self.options.window;
        let topics = match self
            .source
            .trending_topics(since, self.options.limit)
            .await
            .context(SourceSnafu)
        {
            Ok(topics) => topics,
            Err(err) => {
                counter_add!(self.instruments, "trending.refresh.failures", 1, &[]);
                return Err(err);
            }
        };
        self.set(&topics).await;
        counter_add!(self.instruments, "trending.refreshes", 1, &[]);
        gauge_setu!(self.instruments, "trending.topics", topics.len() as u64, &[]);
        info!("Refreshed trending topics ({} topics)", topics.len());
        Ok(topics)
    }
    /// Recompute & re-cache the topics unconditionally, after any in-flight recomputation
    pub async fn refresh(&self) -> Result<Vec<TrendingTopic>> {
        let _guard = self.refreshing.lock().await;
        self.recompute().await
    }
    /// Recompute the topics if a refresh is due & no other recomputation is underway; return
    /// true if we did
    pub async fn warm_cache(&self) -> bool {
        let Ok(_guard) = self.refreshing.try_lock() else {
            debug!("A trending topics refresh is already underway");
            return false;
        };
        if !self.should_refresh().await {
            return false;
        }
        match self.recompute().await {
            Ok(_) => true,
            Err(err) => {
                error!("Failed to warm the trending topics cache: {err}");
                false
            }
        }
    }
    /// Serve readers: cached topics if there are any (scheduling a background warm if one's due),
    /// otherwise compute them, sharing the work with any concurrent callers. While the store is
    /// unreachable, readers get the backup (or nothing) & no computation is attempted.
    pub async fn get_or_refresh(self: &Arc<Self>) -> Result<Vec<TrendingTopic>> {
        match self.cached().await {
            Cached::Hit(topics) => {
                if self.should_refresh().await {
                    let this = self.clone();
                    tokio::spawn(async move {
                        this.warm_cache().await;
                    });
                }
                return Ok(topics);
            }
            Cached::Unavailable(backup) => return Ok(backup),
            Cached::Miss => (),
        }
        let _guard = self.refreshing.lock().await;
        match self.cached().await {
            Cached::Hit(topics) | Cached::Unavailable(topics) => Ok(topics),
            Cached::Miss => self.recompute().await,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            handlers                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// `GET /api/trending-topics`
async fn trending_topics(State(state): State<Arc<Zephyr>>) -> axum::response::Response {
    match state.trending.get_or_refresh().await {
        Ok(topics) => (StatusCode::OK, Json(TrendingTopicsRsp { topics })).into_response(),
        Err(err) => {
            error!("{err:#?}");
            err.into_response()
        }
    }
}

/// `POST /ops/trending/refresh`
async fn refresh(State(state): State<Arc<Zephyr>>) -> axum::response::Response {
    match state.trending.refresh().await {
        Ok(topics) => (StatusCode::OK, Json(TrendingTopicsRsp { topics })).into_response(),
        Err(err) => {
            error!("{err:#?}");
            err.into_response()
        }
    }
}

/// `DELETE /ops/trending`
async fn invalidate(State(state): State<Arc<Zephyr>>) -> StatusCode {
    state.trending.invalidate().await;
    StatusCode::NO_CONTENT
}

pub fn make_router(state: Arc<Zephyr>) -> Router<Arc<Zephyr>> {
    Router::new()
        .route("/trending-topics", get(trending_topics))
        .layer(SetResponseHeaderLayer::if_not_present(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        ))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Operator endpoints; these belong on the private listener only
pub fn make_ops_router(state: Arc<Zephyr>) -> Router<Arc<Zephyr>> {
    Router::new()
        .route("/trending/refresh", post(refresh))
        .route("/trending", delete(invalidate))
        .with_state(state)
}
