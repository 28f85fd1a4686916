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

//! # PostgreSQL storage
//!
//! The production [storage::Backend]. The schema lives in `zephyr/migrations` & is applied at
//! startup.
//!
//! [storage::Backend]: crate::storage::Backend

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use itertools::Itertools;
use secrecy::{ExposeSecret, SecretString};
use snafu::{Backtrace, prelude::*};
use sqlx::{
    PgPool, Row,
    postgres::{PgPoolOptions, PgRow},
};
use tracing::info;
use uuid::Uuid;

use zephyr_shared::{PostId, TrendingTopic, UserId};

use crate::{
    entities::{GithubId, NotificationKind, User, UserEmail, Username},
    storage::{self, Backend},
    trending::TopicSource,
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to connect to PostgreSQL: {source}"))]
    Connect {
        source: sqlx::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to migrate the schema: {source}"))]
    Migrate {
        source: sqlx::migrate::MigrateError,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Translate a failed insert or update into the uniqueness violation it represents, if any
fn classify(err: sqlx::Error, user: &User) -> storage::Error {
    let constraint = err
        .as_database_error()
        .and_then(|db_err| db_err.constraint())
        .map(str::to_owned);
    match constraint.as_deref() {
        Some("users_username_key") => storage::Error::UsernameClaimed {
            username: user.username().clone(),
        },
        Some("users_email_key") => storage::Error::EmailClaimed {
            email: user.email().clone(),
        },
        Some("users_github_id_key") => match user.github_id() {
            Some(github_id) => storage::Error::GithubIdClaimed {
                github_id: *github_id,
            },
            None => storage::Error::new(err),
        },
        _ => storage::Error::new(err),
    }
}

fn user_from_row(row: &PgRow) -> storage::Result<User> {
    let id: Uuid = row.try_get("id").map_err(storage::Error::new)?;
    let username: String = row.try_get("username").map_err(storage::Error::new)?;
    let email: String = row.try_get("email").map_err(storage::Error::new)?;
    let github_id: Option<i64> = row.try_get("github_id").map_err(storage::Error::new)?;
    Ok(User::from_parts(
        UserId::from(id),
        Username::new(&username).map_err(storage::Error::new)?,
        row.try_get("display_name").map_err(storage::Error::new)?,
        UserEmail::new(&email).map_err(storage::Error::new)?,
        row.try_get("email_verified").map_err(storage::Error::new)?,
        github_id.map(|id| GithubId::new(id as u64)),
        row.try_get("avatar_url").map_err(storage::Error::new)?,
        row.try_get("created_at").map_err(storage::Error::new)?,
    ))
}

const USER_COLUMNS: &str =
    "id, username, display_name, email, email_verified, github_id, avatar_url, created_at";

pub struct Postgres {
    pool: PgPool,
}

impl Postgres {
    pub async fn new(
        url: &SecretString,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Postgres> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(url.expose_secret())
            .await
            .context(ConnectSnafu)?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(MigrateSnafu)?;
        info!("Connected to PostgreSQL; schema is current");
        Ok(Postgres { pool })
    }
}

#[async_trait]
impl Backend for Postgres {
    async fn add_user(&self, user: &User) -> storage::Result<()> {
        sqlx::query(
            "INSERT INTO users (id, username, display_name, email, email_verified, github_id, \
             avatar_url, created_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(**user.id())
        .bind(user.username().as_ref())
        .bind(user.display_name())
        .bind(user.email().as_ref())
        .bind(user.email_verified())
        .bind(user.github_id().map(|id| id.as_u64() as i64))
        .bind(user.avatar_url())
        .bind(*user.created_at())
        .execute(&self.pool)
        .await
        .map_err(|err| classify(err, user))?;
        Ok(())
    }
    async fn link_github(&self, id: &UserId, github_id: &GithubId) -> storage::Result<()> {
        let result = sqlx::query("UPDATE users SET github_id = $2 WHERE id = $1")
            .bind(**id)
            .bind(github_id.as_u64() as i64)
            .execute(&self.pool)
            .await;
        match result {
            Ok(done) if done.rows_affected() == 0 => storage::UnknownUserSnafu { id: *id }.fail(),
            Ok(_) => Ok(()),
            Err(err)
                if err
                    .as_database_error()
                    .and_then(|db_err| db_err.constraint())
                    == Some("users_github_id_key") =>
            {
                storage::GithubIdClaimedSnafu {
                    github_id: *github_id,
                }
                .fail()
            }
            Err(err) => Err(storage::Error::new(err)),
        }
    }
    async fn mentioned_users(&self, post: &PostId) -> storage::Result<Vec<User>> {
        let sql = format!(
            "SELECT {} FROM users u JOIN mentions m ON m.user_id = u.id WHERE m.post_id = $1 \
             ORDER BY m.created_at, u.username",
            USER_COLUMNS
                .split(", ")
                .map(|column| format!("u.{column}"))
                .join(", ")
        );
        sqlx::query(&sql)
            .bind(**post)
            .fetch_all(&self.pool)
            .await
            .map_err(storage::Error::new)?
            .iter()
            .map(user_from_row)
            .collect()
    }
    async fn post_author(&self, post: &PostId) -> storage::Result<Option<UserId>> {
        let row = sqlx::query("SELECT author_id FROM posts WHERE id = $1")
            .bind(**post)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage::Error::new)?;
        row.map(|row| {
            row.try_get::<Uuid, _>("author_id")
                .map(UserId::from)
                .map_err(storage::Error::new)
        })
        .transpose()
    }
    async fn replace_mentions(
        &self,
        post: &PostId,
        issuer: &UserId,
        users: &[UserId],
    ) -> storage::Result<()> {
        let mut tx = self.pool.begin().await.map_err(storage::Error::new)?;
        sqlx::query("DELETE FROM mentions WHERE post_id = $1")
            .bind(**post)
            .execute(&mut *tx)
            .await
            .map_err(storage::Error::new)?;
        for user in users.iter().unique() {
            // Unknown users are skipped rather than failing the whole update
            let inserted = sqlx::query(
                "INSERT INTO mentions (post_id, user_id) SELECT $1, id FROM users WHERE id = $2",
            )
            .bind(**post)
            .bind(**user)
            .execute(&mut *tx)
            .await
            .map_err(storage::Error::new)?
            .rows_affected();
            if inserted > 0 {
                sqlx::query(
                    "INSERT INTO notifications (id, recipient_id, issuer_id, post_id, kind) \
                     VALUES ($1, $2, $3, $4, $5)",
                )
                .bind(Uuid::new_v4())
                .bind(**user)
                .bind(**issuer)
                .bind(**post)
                .bind(NotificationKind::Mention.as_str())
                .execute(&mut *tx)
                .await
                .map_err(storage::Error::new)?;
            }
        }
        tx.commit().await.map_err(storage::Error::new)
    }
    async fn user_by_email(&self, email: &UserEmail) -> storage::Result<Option<User>> {
        sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users WHERE email = $1"))
            .bind(email.as_ref())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage::Error::new)?
            .as_ref()
            .map(user_from_row)
            .transpose()
    }
    async fn user_by_github_id(&self, github_id: &GithubId) -> storage::Result<Option<User>> {
        sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users WHERE github_id = $1"))
            .bind(github_id.as_u64() as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage::Error::new)?
            .as_ref()
            .map(user_from_row)
            .transpose()
    }
    async fn user_by_id(&self, id: &UserId) -> storage::Result<Option<User>> {
        sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
            .bind(**id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage::Error::new)?
            .as_ref()
            .map(user_from_row)
            .transpose()
    }
}

#[async_trait]
impl TopicSource for Postgres {
    async fn trending_topics(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> storage::Result<Vec<TrendingTopic>> {
        sqlx::query(
            "SELECT '#' || lower(m[1]) AS hashtag, count(*) AS n \
             FROM posts, regexp_matches(content, '#([A-Za-z0-9_]+)', 'g') AS m \
             WHERE created_at >= $1 \
             GROUP BY hashtag \
             ORDER BY n DESC, hashtag COLLATE \"C\" ASC \
             LIMIT $2",
        )
        .bind(since)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage::Error::new)?
        .iter()
        .map(|row| {
            let hashtag: String = row.try_get("hashtag").map_err(storage::Error::new)?;
            let count: i64 = row.try_get("n").map_err(storage::Error::new)?;
            Ok(TrendingTopic::new(hashtag, count.max(0) as u64))
        })
        .collect()
    }
}
