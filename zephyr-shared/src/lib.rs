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

//! # zephyr-shared
//!
//! Types shared between the zephyr service & its front ends: opaque identifiers, the trending
//! topic record, the vocabulary of machine-readable auth error codes, and (in [api]) the JSON
//! bodies of the public API.

pub mod api;

use std::{fmt::Display, ops::Deref, str::FromStr};

use serde::{Deserialize, Serialize};
use snafu::{Backtrace, prelude::*};
use uuid::Uuid;

type StdResult<T, E> = std::result::Result<T, E>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{text} is not a recognized error code"))]
    ErrorCode { text: String, backtrace: Backtrace },
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          Identifiers                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Declare a type intended to be used as an opaque identifier for some other sort of entity
///
/// I couldn't bring myself to use the same type ([Uuid]) to represent identifiers for users and
/// posts at the same time, so this macro defines a newtype struct wrapping [Uuid], implementing
/// [Display], [FromStr], [Deref] and serde's traits on it.
#[macro_export]
macro_rules! define_id {
    ($type_name:ident) => {
        #[derive(
            Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
        )]
        #[serde(transparent)]
        pub struct $type_name(Uuid);
        impl $type_name {
            pub fn new(s: &str) -> StdResult<$type_name, uuid::Error> {
                Ok($type_name(Uuid::parse_str(s)?))
            }
            /// The un-hyphenated, lower-case hex representation of this id
            pub fn to_raw_string(&self) -> String {
                format!("{}", self.0.as_simple())
            }
        }
        impl Default for $type_name {
            fn default() -> Self {
                $type_name(Uuid::new_v4())
            }
        }
        impl Display for $type_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0.as_hyphenated())
            }
        }
        impl FromStr for $type_name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                $type_name::new(s)
            }
        }
        impl AsRef<Uuid> for $type_name {
            fn as_ref(&self) -> &Uuid {
                self.deref()
            }
        }
        impl Deref for $type_name {
            type Target = Uuid;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }
        impl From<Uuid> for $type_name {
            fn from(value: Uuid) -> Self {
                $type_name(value)
            }
        }
        impl From<$type_name> for Uuid {
            fn from(value: $type_name) -> Self {
                value.0
            }
        }
    };
}

define_id!(UserId);
define_id!(PostId);

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         TrendingTopic                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A hashtag along with the number of recent posts using it
///
/// Trending topics travel as an ordered list; the order is significant (most popular first) & is
/// preserved through the cache.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct TrendingTopic {
    pub hashtag: String,
    pub count: u64,
}

impl TrendingTopic {
    pub fn new(hashtag: impl Into<String>, count: u64) -> TrendingTopic {
        TrendingTopic {
            hashtag: hashtag.into(),
            count,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         auth outcomes                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Machine-readable codes surfaced to the front end via the `error` query parameter
///
/// These are carried on redirects to `/login/error` & `/settings`; front ends map them to
/// user-facing text with [ErrorCode::message].
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    EmailExists,
    InvalidCredentials,
    OauthError,
    ServerError,
    AccountNotFound,
    Unauthorized,
    GithubAccountLinkedOther,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::EmailExists => "email_exists",
            ErrorCode::InvalidCredentials => "invalid_credentials",
            ErrorCode::OauthError => "oauth_error",
            ErrorCode::ServerError => "server_error",
            ErrorCode::AccountNotFound => "account_not_found",
            ErrorCode::Unauthorized => "unauthorized",
            ErrorCode::GithubAccountLinkedOther => "github_account_linked_other",
        }
    }
    /// Human-readable text for this code
    pub fn message(&self) -> &'static str {
        match self {
            ErrorCode::EmailExists => {
                "An account with this email already exists. Please sign in with your password and \
                 link your GitHub account from your settings."
            }
            ErrorCode::InvalidCredentials => "Invalid username or password.",
            ErrorCode::OauthError => "There was a problem signing in with your provider.",
            ErrorCode::ServerError => "Something went wrong on our end. Please try again later.",
            ErrorCode::AccountNotFound => "No account was found with these credentials.",
            ErrorCode::Unauthorized => "You are not authorized to access this resource.",
            ErrorCode::GithubAccountLinkedOther => {
                "This GitHub account is already linked to another user."
            }
        }
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ErrorCode {
    type Err = Error;

    fn from_str(s: &str) -> StdResult<Self, Self::Err> {
        match s {
            "email_exists" => Ok(ErrorCode::EmailExists),
            "invalid_credentials" => Ok(ErrorCode::InvalidCredentials),
            "oauth_error" => Ok(ErrorCode::OauthError),
            "server_error" => Ok(ErrorCode::ServerError),
            "account_not_found" => Ok(ErrorCode::AccountNotFound),
            "unauthorized" => Ok(ErrorCode::Unauthorized),
            "github_account_linked_other" => Ok(ErrorCode::GithubAccountLinkedOther),
            _ => ErrorCodeSnafu { text: s.to_owned() }.fail(),
        }
    }
}

/// Success indicators carried on the `success` query parameter of the settings page
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SuccessCode {
    GithubLinked,
}

impl SuccessCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuccessCode::GithubLinked => "github_linked",
        }
    }
}

impl Display for SuccessCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn error_codes_round_trip_through_their_wire_names() {
        for code in [
            ErrorCode::EmailExists,
            ErrorCode::InvalidCredentials,
            ErrorCode::OauthError,
            ErrorCode::ServerError,
            ErrorCode::AccountNotFound,
            ErrorCode::Unauthorized,
            ErrorCode::GithubAccountLinkedOther,
        ] {
            assert_eq!(code, code.as_str().parse::<ErrorCode>().unwrap());
            // serde agrees with `as_str`
            assert_eq!(
                format!("\"{}\"", code.as_str()),
                serde_json::to_string(&code).unwrap()
            );
        }
        assert!("github_linked".parse::<ErrorCode>().is_err());
    }

    #[test]
    fn ids_display_hyphenated() {
        let id = UserId::new("67e55044-10b1-426f-9247-bb680e5fe0c8").unwrap();
        assert_eq!(format!("{id}"), "67e55044-10b1-426f-9247-bb680e5fe0c8");
        assert_eq!(id.to_raw_string(), "67e5504410b1426f9247bb680e5fe0c8");
        assert!(PostId::new("not-a-uuid").is_err());
    }
}
