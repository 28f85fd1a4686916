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

//! # zephyr
//!
//! The service side of the zephyr social network: a trending-topics cache & post-view counters
//! over Redis, and GitHub sign-in (account creation, linking & sessions) over PostgreSQL. The
//! `zephyrd` binary serves all of it.
pub mod chat;
pub mod entities;
pub mod fallback;
pub mod github;
pub mod http;
#[path = "kv-store.rs"]
pub mod kv_store;
pub mod memory;
pub mod mentions;
pub mod metrics;
pub mod oauth;
#[path = "post-views.rs"]
pub mod post_views;
pub mod postgres;
pub mod resolution;
pub mod session;
#[path = "signing-keys.rs"]
pub mod signing_keys;
pub mod storage;
pub mod trending;
pub mod util;
pub mod zephyr;
