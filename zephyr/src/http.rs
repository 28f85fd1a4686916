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

//! HTTP odds & ends shared by the zephyr routers.

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header::LOCATION},
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};

/// A serializable struct for use in HTTP error responses
///
/// This is intended to be used in the [IntoResponse] implementations for whatever error type
/// an axum handler is using.
///
/// [IntoResponse]: https://docs.rs/axum/latest/axum/response/trait.IntoResponse.html
#[derive(Debug, Deserialize, Serialize)]
pub struct ErrorResponseBody {
    pub error: String,
}

impl ErrorResponseBody {
    pub fn new(error: impl Into<String>) -> ErrorResponseBody {
        ErrorResponseBody {
            error: error.into(),
        }
    }
}

impl IntoResponse for ErrorResponseBody {
    fn into_response(self) -> axum::response::Response {
        Json(self).into_response()
    }
}

/// Produce a "302 Found" redirect to `location`
///
/// [axum::response::Redirect] offers 303, 307 & 308, but browsers following an OAuth flow expect
/// the classic 302.
pub fn found(location: &str) -> axum::response::Response {
    match HeaderValue::from_str(location) {
        Ok(value) => (StatusCode::FOUND, [(LOCATION, value)]).into_response(),
        // Only reachable if we've built a location containing control characters
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorResponseBody::new(format!("Invalid redirect location {location:?}")),
        )
            .into_response(),
    }
}
