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

//! # Post views
//!
//! Per-post view counters, kept in the key-value store as `post:views:<post id>`, along with the
//! set `posts:with:views` of every post that's ever been viewed. A view increments the counter &
//! adds the post to the set in one pipeline.
//!
//! Losing a view is acceptable; failing a page render because the store is down is not. Every
//! operation here answers with a safe default (zero, false, nothing) on store failure.

use std::{collections::HashMap, str::FromStr, sync::Arc};

use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::{HeaderValue, StatusCode, header::CONTENT_TYPE},
    response::IntoResponse,
    routing::{get, post},
};
use itertools::Itertools;
use snafu::{Backtrace, prelude::*};
use tower_http::{cors::CorsLayer, set_header::SetResponseHeaderLayer};
use tracing::{debug, error};

use zephyr_shared::{
    PostId,
    api::{IncrementViewRsp, MultipleViewsReq, MultipleViewsRsp, ViewsRsp},
};

use crate::{
    counter_add,
    fallback::{Fallback, Level},
    http::ErrorResponseBody,
    kv_store::{self, Command, Store},
    metrics::{self, Instruments, Sort},
    zephyr::Zephyr,
};

pub const VIEWS_KEY_PREFIX: &str = "post:views:";
pub const VIEWS_SET: &str = "posts:with:views";

/// Maximum number of posts in a single multi-get
pub const MAX_POST_IDS: usize = 100;

const INCREMENT: Fallback<u64> = Fallback::new("views.increment", Level::Error, || 0);
const GET: Fallback<u64> = Fallback::new("views.get", Level::Error, || 0);
const GET_MULTIPLE: Fallback<HashMap<PostId, u64>> =
    Fallback::new("views.get_multiple", Level::Error, HashMap::new);
const IS_MEMBER: Fallback<bool> = Fallback::new("views.is_member", Level::Error, || false);

inventory::submit! { metrics::Registration::new("views.increments", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("views.errors", Sort::IntegralCounter) }

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{text} is not a valid post id: {source}"))]
    BadPostId {
        text: String,
        source: uuid::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Bad request body: {source}"))]
    Body { source: JsonRejection },
    #[snafu(display("{count} post ids requested; at most {MAX_POST_IDS} are allowed"))]
    TooManyIds { count: usize, backtrace: Backtrace },
}

impl Error {
    pub fn as_status_and_msg(&self) -> (StatusCode, String) {
        match self {
            Error::BadPostId { text, .. } => (
                StatusCode::BAD_REQUEST,
                format!("{text} is not a valid post id"),
            ),
            Error::Body { source } => (StatusCode::BAD_REQUEST, source.body_text()),
            Error::TooManyIds { count, .. } => (
                StatusCode::BAD_REQUEST,
                format!("At most {MAX_POST_IDS} post ids may be requested at once (got {count})"),
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

type Result<T> = std::result::Result<T, Error>;

fn views_key(post: &PostId) -> String {
    format!("{VIEWS_KEY_PREFIX}{post}")
}

// Absent, & anything that isn't a non-negative integer, count as zero
fn parse_count(text: Option<&str>) -> u64 {
    text.and_then(|s| s.trim().parse::<u64>().ok()).unwrap_or(0)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           PostViews                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone)]
pub struct PostViews {
    store: Arc<dyn Store>,
    instruments: Arc<Instruments>,
}

impl PostViews {
    pub fn new(store: Arc<dyn Store>, instruments: Arc<Instruments>) -> PostViews {
        PostViews { store, instruments }
    }
    /// Record a view of `post`, returning the new count
    pub async fn increment_view(&self, post: &PostId) -> u64 {
        let result = self
            .store
            .pipeline(&[
                Command::sadd(VIEWS_SET, post.to_string()),
                Command::incr(views_key(post)),
            ])
            .await
            .map(|replies| {
                replies
                    .get(1)
                    .and_then(kv_store::Reply::as_int)
                    .map_or(0, |n| n.max(0) as u64)
            });
        match result {
            Ok(views) => {
                debug!("Incremented views for post {post} to {views}");
                counter_add!(self.instruments, "views.increments", 1, &[]);
                views
            }
            Err(err) => INCREMENT.recover(Err(err), &self.instruments),
        }
    }
    pub async fn get_views(&self, post: &PostId) -> u64 {
        let result = self
            .store
            .get(&views_key(post))
            .await
            .map(|text| parse_count(text.as_deref()));
        GET.recover(result, &self.instruments)
    }
    /// Read many counters at once; each distinct post appears in the result exactly once
    pub async fn get_multiple_views(&self, posts: &[PostId]) -> HashMap<PostId, u64> {
        let posts = posts.iter().unique().collect::<Vec<_>>();
        if posts.is_empty() {
            return HashMap::new();
        }
        let commands = posts
            .iter()
            .map(|post| Command::get(views_key(post)))
            .collect::<Vec<_>>();
        let result = self.store.pipeline(&commands).await.map(|replies| {
            posts
                .iter()
                .zip(replies)
                .map(|(post, reply)| {
                    let count = match reply {
                        kv_store::Reply::Text(text) => parse_count(Some(&text)),
                        kv_store::Reply::Int(n) => n.max(0) as u64,
                        _ => 0,
                    };
                    (**post, count)
                })
                .collect::<HashMap<PostId, u64>>()
        });
        GET_MULTIPLE.recover(result, &self.instruments)
    }
    /// True if `post` has ever had a view recorded
    pub async fn is_in_view_set(&self, post: &PostId) -> bool {
        let result = self.store.sismember(VIEWS_SET, &post.to_string()).await;
        IS_MEMBER.recover(result, &self.instruments)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            handlers                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

fn handle_err(err: Error, instruments: &Instruments) -> axum::response::Response {
    error!("{err:#?}");
    counter_add!(instruments, "views.errors", 1, &[]);
    err.into_response()
}

fn parse_post_id(text: &str) -> Result<PostId> {
    PostId::from_str(text).context(BadPostIdSnafu { text })
}

/// `POST /api/posts/{post_id}/views`
async fn increment(
    State(state): State<Arc<Zephyr>>,
    Path(post_id): Path<String>,
) -> axum::response::Response {
    match parse_post_id(&post_id) {
        Ok(post) => {
            let views = state.views.increment_view(&post).await;
            (StatusCode::OK, Json(IncrementViewRsp { views })).into_response()
        }
        Err(err) => handle_err(err, &state.instruments),
    }
}

/// `GET /api/posts/{post_id}/views`
async fn views(
    State(state): State<Arc<Zephyr>>,
    Path(post_id): Path<String>,
) -> axum::response::Response {
    match parse_post_id(&post_id) {
        Ok(post) => {
            let (views, tracked) = tokio::join!(
                state.views.get_views(&post),
                state.views.is_in_view_set(&post)
            );
            (StatusCode::OK, Json(ViewsRsp { views, tracked })).into_response()
        }
        Err(err) => handle_err(err, &state.instruments),
    }
}

/// `POST /api/posts/views`
async fn multiple_views(
    State(state): State<Arc<Zephyr>>,
    req: std::result::Result<Json<MultipleViewsReq>, JsonRejection>,
) -> axum::response::Response {
    async fn multiple_views1(
        state: &Zephyr,
        req: std::result::Result<Json<MultipleViewsReq>, JsonRejection>,
    ) -> Result<MultipleViewsRsp> {
        let Json(req) = req.context(BodySnafu)?;
        ensure!(
            req.post_ids.len() <= MAX_POST_IDS,
            TooManyIdsSnafu {
                count: req.post_ids.len()
            }
        );
        Ok(MultipleViewsRsp {
            views: state.views.get_multiple_views(&req.post_ids).await,
        })
    }

    match multiple_views1(&state, req).await {
        Ok(rsp) => (StatusCode::OK, Json(rsp)).into_response(),
        Err(err) => handle_err(err, &state.instruments),
    }
}

pub fn make_router(state: Arc<Zephyr>) -> Router<Arc<Zephyr>> {
    Router::new()
        .route("/posts/views", post(multiple_views))
        .route("/posts/{post_id}/views", get(views).post(increment))
        .layer(SetResponseHeaderLayer::if_not_present(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        ))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
mod test {
    use axum::{
        body::{Body, to_bytes},
        http::Request,
    };
    use opentelemetry::metrics::MeterProvider;
    use opentelemetry_prometheus_text_exporter::PrometheusExporter;
    use opentelemetry_sdk::metrics::SdkMeterProvider;
    use tower::ServiceExt;

    use super::*;
    use crate::kv_store::{Memory, testing::Flaky};

    fn views_over(store: Arc<dyn Store>) -> PostViews {
        PostViews::new(store, Arc::new(Instruments::new("zephyr")))
    }

    #[tokio::test]
    async fn increments_count_and_track() {
        let views = views_over(Arc::new(Memory::new()));
        let post = PostId::default();

        assert_eq!(views.get_views(&post).await, 0);
        assert!(!views.is_in_view_set(&post).await);

        for n in 1..=5 {
            assert_eq!(views.increment_view(&post).await, n);
            assert!(views.is_in_view_set(&post).await);
        }
        assert_eq!(views.get_views(&post).await, 5);
    }

    #[tokio::test]
    async fn multiple_views_default_to_zero() {
        let views = views_over(Arc::new(Memory::new()));
        let (a, b) = (PostId::default(), PostId::default());
        views.increment_view(&a).await;
        views.increment_view(&a).await;

        let counts = views.get_multiple_views(&[a, b, a]).await;
        assert_eq!(counts.len(), 2);
        assert_eq!(counts[&a], 2);
        assert_eq!(counts[&b], 0);
        assert!(views.get_multiple_views(&[]).await.is_empty());
    }

    #[tokio::test]
    async fn store_failures_yield_defaults() {
        let store = Arc::new(Flaky::new());
        let views = views_over(store.clone());
        let post = PostId::default();
        views.increment_view(&post).await;

        store.fail_everything(true);
        assert_eq!(views.increment_view(&post).await, 0);
        assert_eq!(views.get_views(&post).await, 0);
        assert!(!views.is_in_view_set(&post).await);
        assert!(views.get_multiple_views(&[post]).await.is_empty());

        store.fail_everything(false);
        assert_eq!(views.get_views(&post).await, 1);
    }

    /// The value of the first sample whose name starts with `name`
    fn sample(exporter: &PrometheusExporter, name: &str) -> Option<u64> {
        let mut output = Vec::new();
        exporter.export(&mut output).unwrap();
        String::from_utf8(output)
            .unwrap()
            .lines()
            .filter(|line| line.starts_with(name))
            .find_map(|line| line.rsplit(' ').next()?.parse::<u64>().ok())
    }

    #[tokio::test]
    async fn only_successful_increments_are_counted() {
        let exporter = PrometheusExporter::new();
        let provider = SdkMeterProvider::builder()
            .with_reader(exporter.clone())
            .build();
        let store = Arc::new(Flaky::new());
        let views = PostViews::new(
            store.clone(),
            Arc::new(Instruments::with_meter(provider.meter("zephyr"))),
        );
        let post = PostId::default();

        views.increment_view(&post).await;
        views.increment_view(&post).await;
        assert_eq!(sample(&exporter, "views_increments"), Some(2));

        store.fail_everything(true);
        for _ in 0..3 {
            assert_eq!(views.increment_view(&post).await, 0);
        }
        assert_eq!(sample(&exporter, "views_increments"), Some(2));
    }

    #[tokio::test]
    async fn view_endpoints() {
        let state = crate::zephyr::testing::state_with(
            Arc::new(Memory::new()),
            Arc::new(crate::memory::Memory::new()),
        );
        let app: Router = make_router(state.clone()).with_state(state.clone());
        let post = PostId::default();

        let rsp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/posts/{post}/views"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(rsp.status(), StatusCode::OK);
        let body = to_bytes(rsp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(
            serde_json::from_slice::<IncrementViewRsp>(&body)
                .unwrap()
                .views,
            1
        );

        let rsp = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/posts/{post}/views"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = to_bytes(rsp.into_body(), usize::MAX).await.unwrap();
        let rsp: ViewsRsp = serde_json::from_slice(&body).unwrap();
        assert_eq!(rsp.views, 1);
        assert!(rsp.tracked);

        let rsp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/posts/views")
                    .header("content-type", "application/json")
                    .body(Body::from(format!("{{\"postIds\": [\"{post}\"]}}")))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(rsp.status(), StatusCode::OK);
        let body = to_bytes(rsp.into_body(), usize::MAX).await.unwrap();
        let rsp: MultipleViewsRsp = serde_json::from_slice(&body).unwrap();
        assert_eq!(rsp.views[&post], 1);

        let rsp = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/posts/not-a-uuid/views")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(rsp.status(), StatusCode::BAD_REQUEST);

        let too_many = (0..=MAX_POST_IDS)
            .map(|_| format!("\"{}\"", PostId::default()))
            .join(", ");
        let rsp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/posts/views")
                    .header("content-type", "application/json")
                    .body(Body::from(format!("{{\"postIds\": [{too_many}]}}")))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(rsp.status(), StatusCode::BAD_REQUEST);
    }
}
