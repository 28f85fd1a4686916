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

//! # storage
//!
//! Abstractions for the zephyr persistence layer.
//!
//! The relational store is the source of truth for accounts, posts & mentions. Callers
//! distinguish the handful of uniqueness violations they can do something about (an e-mail or
//! GitHub identity already claimed, say); everything else is an opaque backend failure.

use async_trait::async_trait;
use snafu::prelude::*;

use zephyr_shared::{PostId, UserId};

use crate::entities::{GithubId, User, UserEmail, Username};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("{source}"))]
    Backend {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
    #[snafu(display("The e-mail address {email} is already in use"))]
    EmailClaimed { email: UserEmail },
    #[snafu(display("GitHub user {github_id} is already linked to an account"))]
    GithubIdClaimed { github_id: GithubId },
    #[snafu(display("No post with id {id}"))]
    UnknownPost { id: PostId },
    #[snafu(display("No user with id {id}"))]
    UnknownUser { id: UserId },
    #[snafu(display("The username {username} is already taken"))]
    UsernameClaimed { username: Username },
}

impl Error {
    pub fn new(err: impl std::error::Error + Send + Sync + 'static) -> Error {
        Error::Backend {
            source: Box::new(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[async_trait]
pub trait Backend {
    /// Add a brand-new account
    async fn add_user(&self, user: &User) -> Result<()>;
    /// Attach `github_id` to an existing account; linking an identity the account already holds
    /// is a no-op.
    async fn link_github(&self, id: &UserId, github_id: &GithubId) -> Result<()>;
    /// The users mentioned in a post; an unknown post simply has no mentions
    async fn mentioned_users(&self, post: &PostId) -> Result<Vec<User>>;
    /// The author of a post; `None` means there is no such post
    async fn post_author(&self, post: &PostId) -> Result<Option<UserId>>;
    /// Replace the set of users mentioned in `post`, notifying each on behalf of `issuer`
    ///
    /// The old mentions are removed and the new mentions & their notifications are written as a
    /// unit: either all of it happens, or none of it does. Ids that don't name a user are skipped.
    async fn replace_mentions(&self, post: &PostId, issuer: &UserId, users: &[UserId])
    -> Result<()>;
    async fn user_by_email(&self, email: &UserEmail) -> Result<Option<User>>;
    async fn user_by_github_id(&self, github_id: &GithubId) -> Result<Option<User>>;
    async fn user_by_id(&self, id: &UserId) -> Result<Option<User>>;
}
