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

//! # In-memory storage
//!
//! A [storage::Backend] that lives & dies with the process. Useful for local development (no
//! database to stand up) & for tests. Every operation takes a single lock, so each is atomic.
//!
//! [storage::Backend]: crate::storage::Backend

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use itertools::Itertools;
use snafu::prelude::*;

use zephyr_shared::{PostId, TrendingTopic, UserId};

use crate::{
    entities::{GithubId, Notification, Post, User, UserEmail},
    storage::{
        Backend, EmailClaimedSnafu, GithubIdClaimedSnafu, Result, UnknownUserSnafu,
        UsernameClaimedSnafu,
    },
    trending::TopicSource,
};

#[derive(Debug, Default)]
struct Tables {
    users: HashMap<UserId, User>,
    posts: HashMap<PostId, Post>,
    mentions: HashMap<PostId, Vec<UserId>>,
    notifications: Vec<Notification>,
}

#[derive(Debug, Default)]
pub struct Memory {
    tables: Mutex<Tables>,
}

impl Memory {
    pub fn new() -> Memory {
        Memory::default()
    }
    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|err| err.into_inner())
    }
    /// Posting is out of scope for zephyr proper; this is how posts get here in development &
    /// tests
    pub fn add_post(&self, post: Post) {
        self.lock().posts.insert(post.id, post);
    }
    /// Notifications issued so far, oldest first
    pub fn notifications(&self) -> Vec<Notification> {
        self.lock().notifications.clone()
    }
    pub fn user_count(&self) -> usize {
        self.lock().users.len()
    }
}

#[async_trait]
impl Backend for Memory {
    async fn add_user(&self, user: &User) -> Result<()> {
        let mut tables = self.lock();
        for other in tables.users.values() {
            if other.username() == user.username() {
                return UsernameClaimedSnafu {
                    username: user.username().clone(),
                }
                .fail();
            }
            if other.email() == user.email() {
                return EmailClaimedSnafu {
                    email: user.email().clone(),
                }
                .fail();
            }
            if let Some(github_id) = user.github_id() {
                if other.github_id() == Some(github_id) {
                    return GithubIdClaimedSnafu {
                        github_id: *github_id,
                    }
                    .fail();
                }
            }
        }
        tables.users.insert(*user.id(), user.clone());
        Ok(())
    }
    async fn link_github(&self, id: &UserId, github_id: &GithubId) -> Result<()> {
        let mut tables = self.lock();
        if tables
            .users
            .values()
            .any(|other| other.id() != id && other.github_id() == Some(github_id))
        {
            return GithubIdClaimedSnafu {
                github_id: *github_id,
            }
            .fail();
        }
        tables
            .users
            .get_mut(id)
            .map(|user| user.link_github(*github_id))
            .context(UnknownUserSnafu { id: *id })
    }
    async fn mentioned_users(&self, post: &PostId) -> Result<Vec<User>> {
        let tables = self.lock();
        Ok(tables
            .mentions
            .get(post)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| tables.users.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }
    async fn post_author(&self, post: &PostId) -> Result<Option<UserId>> {
        Ok(self.lock().posts.get(post).map(|post| post.author))
    }
    async fn replace_mentions(
        &self,
        post: &PostId,
        issuer: &UserId,
        users: &[UserId],
    ) -> Result<()> {
        let mut tables = self.lock();
        let users = users
            .iter()
            .unique()
            .filter(|id| tables.users.contains_key(*id))
            .copied()
            .collect::<Vec<UserId>>();
        tables.notifications.extend(
            users
                .iter()
                .map(|recipient| Notification::mention(*recipient, *issuer, *post)),
        );
        tables.mentions.insert(*post, users);
        Ok(())
    }
    async fn user_by_email(&self, email: &UserEmail) -> Result<Option<User>> {
        Ok(self
            .lock()
            .users
            .values()
            .find(|user| user.email() == email)
            .cloned())
    }
    async fn user_by_github_id(&self, github_id: &GithubId) -> Result<Option<User>> {
        Ok(self
            .lock()
            .users
            .values()
            .find(|user| user.github_id() == Some(github_id))
            .cloned())
    }
    async fn user_by_id(&self, id: &UserId) -> Result<Option<User>> {
        Ok(self.lock().users.get(id).cloned())
    }
}

#[async_trait]
impl TopicSource for Memory {
    async fn trending_topics(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TrendingTopic>> {
        let tables = self.lock();
        Ok(tables
            .posts
            .values()
            .filter(|post| post.created_at >= since)
            .flat_map(|post| post.hashtags())
            .counts()
            .into_iter()
            .sorted_by(|(lhs_tag, lhs_n), (rhs_tag, rhs_n)| {
                rhs_n.cmp(lhs_n).then_with(|| lhs_tag.cmp(rhs_tag))
            })
            .take(limit)
            .map(|(hashtag, count)| TrendingTopic::new(hashtag, count as u64))
            .collect())
    }
}
