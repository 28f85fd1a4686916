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

//! # zephyr application state
//!
//! Everything a request handler might need, built once per serving pass by `zephyrd` (i.e. at
//! startup & again on each `SIGHUP`) & shared behind an [Arc].

use std::sync::Arc;

use axum::Router;
use opentelemetry_prometheus_text_exporter::PrometheusExporter;

use crate::{
    chat::ChatProvisioner, github::IdentityProvider, mentions, metrics::Instruments, oauth,
    post_views::{self, PostViews},
    session::{self, Sessions},
    storage::Backend as StorageBackend,
    trending::{self, TrendingTopics},
};

pub struct Zephyr {
    pub storage: Arc<dyn StorageBackend + Send + Sync>,
    pub trending: Arc<TrendingTopics>,
    pub views: PostViews,
    pub identity: Arc<dyn IdentityProvider + Send + Sync>,
    pub chat: Arc<dyn ChatProvisioner + Send + Sync>,
    pub sessions: Sessions,
    pub exporter: PrometheusExporter,
    pub instruments: Arc<Instruments>,
}

/// The public API, to be nested under `/api`
pub fn make_api_router(state: Arc<Zephyr>) -> Router<Arc<Zephyr>> {
    Router::new()
        .merge(trending::make_router(state.clone()))
        .merge(post_views::make_router(state.clone()))
        .merge(session::make_router(state.clone()))
        .merge(oauth::make_router(state.clone()))
        .merge(mentions::make_router(state.clone()))
        .with_state(state)
}
