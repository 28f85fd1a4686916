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

//! # Post mentions
//!
//! The users a post mentions, & the author's means of changing them. Replacing the list notifies
//! everyone on the new one.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::{HeaderValue, StatusCode, header::CONTENT_TYPE},
    response::IntoResponse,
    routing::get,
};
use axum_extra::extract::cookie::CookieJar;
use snafu::{Backtrace, prelude::*};
use tower_http::{cors::CorsLayer, set_header::SetResponseHeaderLayer};
use tracing::{error, info};

use zephyr_shared::{
    PostId,
    api::{MentionedUser, MentionsRsp, UpdateMentionsReq},
};

use crate::{
    counter_add,
    entities::User,
    http::ErrorResponseBody,
    metrics::{self, Sort},
    storage::{self, Backend as StorageBackend},
    zephyr::Zephyr,
};

/// The most users a single update may mention
pub const MAX_MENTIONS: usize = 100;

inventory::submit! { metrics::Registration::new("mentions.updates", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("mentions.failures", Sort::IntegralCounter) }

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Bad mentions request: {source}"))]
    Body { source: JsonRejection },
    #[snafu(display("{post} is not a post id: {source}"))]
    BadPostId { post: String, source: uuid::Error },
    #[snafu(display("User {username} may not edit mentions on {post}"))]
    NotAuthor {
        username: String,
        post: PostId,
        backtrace: Backtrace,
    },
    #[snafu(display("No session"))]
    NoSession { backtrace: Backtrace },
    #[snafu(display("No such post {post}"))]
    NoSuchPost { post: PostId, backtrace: Backtrace },
    #[snafu(display("Storage error: {source}"))]
    Storage { source: storage::Error },
    #[snafu(display("{count} users mentioned; at most {MAX_MENTIONS} are allowed"))]
    TooManyMentions { count: usize, backtrace: Backtrace },
}

impl Error {
    pub fn as_status_and_msg(&self) -> (StatusCode, String) {
        match self {
            Error::Body { .. } | Error::BadPostId { .. } => {
                (StatusCode::BAD_REQUEST, format!("{self}"))
            }
            Error::NotAuthor { .. } => (StatusCode::FORBIDDEN, "Unauthorized".to_owned()),
            Error::NoSession { .. } => (StatusCode::UNAUTHORIZED, "Unauthorized".to_owned()),
            Error::NoSuchPost { .. } => (StatusCode::NOT_FOUND, "Post not found".to_owned()),
            Error::Storage { .. } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_owned(),
            ),
            Error::TooManyMentions { count, .. } => (
                StatusCode::BAD_REQUEST,
                format!("At most {MAX_MENTIONS} users may be mentioned at once (got {count})"),
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

async fn caller(
    state: &Zephyr,
    jar: &CookieJar,
    storage: &(dyn StorageBackend + Send + Sync),
) -> Result<User> {
    state
        .sessions
        .current_user(jar, storage)
        .await
        .context(StorageSnafu)?
        .context(NoSessionSnafu)
}

async fn mentions_for(
    storage: &(dyn StorageBackend + Send + Sync),
    post: &PostId,
) -> Result<MentionsRsp> {
    Ok(MentionsRsp {
        mentions: storage
            .mentioned_users(post)
            .await
            .context(StorageSnafu)?
            .iter()
            .map(MentionedUser::from)
            .collect(),
    })
}

/// `GET /api/posts/{post_id}/mentions`
async fn get_mentions(
    State(state): State<Arc<Zephyr>>,
    jar: CookieJar,
    Path(post): Path<String>,
) -> axum::response::Response {
    async fn get_mentions1(state: &Zephyr, jar: &CookieJar, post: &str) -> Result<MentionsRsp> {
        let storage = state.storage.as_ref();
        caller(state, jar, storage).await?;
        let post = post.parse::<PostId>().context(BadPostIdSnafu { post })?;
        mentions_for(storage, &post).await
    }

    match get_mentions1(&state, &jar, &post).await {
        Ok(rsp) => (StatusCode::OK, Json(rsp)).into_response(),
        Err(err @ Error::Storage { .. }) => {
            error!("{err:#?}");
            err.into_response()
        }
        Err(err) => {
            info!("{err}");
            err.into_response()
        }
    }
}

/// `POST /api/posts/{post_id}/mentions`
async fn update_mentions(
    State(state): State<Arc<Zephyr>>,
    jar: CookieJar,
    Path(post): Path<String>,
    req: std::result::Result<Json<UpdateMentionsReq>, JsonRejection>,
) -> axum::response::Response {
    async fn update_mentions1(
        state: &Zephyr,
        jar: &CookieJar,
        post: &str,
        req: std::result::Result<Json<UpdateMentionsReq>, JsonRejection>,
    ) -> Result<MentionsRsp> {
        let storage = state.storage.as_ref();
        let user = caller(state, jar, storage).await?;
        let post = post.parse::<PostId>().context(BadPostIdSnafu { post })?;
        let Json(req) = req.context(BodySnafu)?;
        ensure!(
            req.user_ids.len() <= MAX_MENTIONS,
            TooManyMentionsSnafu {
                count: req.user_ids.len()
            }
        );

        let author = storage
            .post_author(&post)
            .await
            .context(StorageSnafu)?
            .context(NoSuchPostSnafu { post })?;
        ensure!(
            author == *user.id(),
            NotAuthorSnafu {
                username: user.username().to_string(),
                post
            }
        );

        // Mentioning yourself is a no-op
        let mentioned = req
            .user_ids
            .into_iter()
            .filter(|id| id != user.id())
            .collect::<Vec<_>>();
        storage
            .replace_mentions(&post, user.id(), &mentioned)
            .await
            .context(StorageSnafu)?;
        info!(
            "{} replaced the mentions on {post} ({} users)",
            user.username(),
            mentioned.len()
        );
        mentions_for(storage, &post).await
    }

    match update_mentions1(&state, &jar, &post, req).await {
        Ok(rsp) => {
            counter_add!(state.instruments, "mentions.updates", 1, &[]);
            (StatusCode::OK, Json(rsp)).into_response()
        }
        Err(err) => {
            if matches!(err, Error::Storage { .. }) {
                error!("{err:#?}");
            } else {
                info!("{err}");
            }
            counter_add!(state.instruments, "mentions.failures", 1, &[]);
            err.into_response()
        }
    }
}

pub fn make_router(state: Arc<Zephyr>) -> Router<Arc<Zephyr>> {
    Router::new()
        .route(
            "/posts/{post_id}/mentions",
            get(get_mentions).post(update_mentions),
        )
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
        http::{
            Request,
            header::{COOKIE, CONTENT_TYPE},
        },
    };
    use chrono::Utc;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use super::*;
    use crate::{
        entities::{GithubId, NotificationKind, Post, UserEmail},
        memory::Memory,
        session::SESSION_COOKIE,
        zephyr::testing::{Recording, Scripted, oauth_state},
    };
    use zephyr_shared::UserId;

    fn user(login: &str, github_id: u64) -> User {
        User::from_github(
            GithubId::new(github_id),
            login,
            None,
            &UserEmail::new(&format!("{login}@example.com")).unwrap(),
            None,
        )
    }

    struct Fixture {
        app: Router,
        storage: Arc<Memory>,
        post: PostId,
        author: User,
        author_session: String,
        others: Vec<User>,
        other_session: String,
    }

    async fn fixture() -> Fixture {
        let storage = Arc::new(Memory::new());
        let author = user("author", 1);
        let others = vec![user("bob", 2), user("carol", 3)];
        storage.add_user(&author).await.unwrap();
        for other in &others {
            storage.add_user(other).await.unwrap();
        }
        let post = PostId::default();
        storage.add_post(Post {
            id: post,
            author: *author.id(),
            content: "hello @bob & @carol".to_owned(),
            created_at: Utc::now(),
        });
        let state = oauth_state(
            storage.clone(),
            Arc::new(Scripted::octocat()),
            Arc::new(Recording::default()),
        );
        let author_session = state.sessions.mint(author.id()).unwrap();
        let other_session = state.sessions.mint(others[0].id()).unwrap();
        Fixture {
            app: make_router(state.clone()).with_state(state.clone()),
            storage,
            post,
            author,
            author_session,
            others,
            other_session,
        }
    }

    fn update(post: &str, session: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(format!("/posts/{post}/mentions"))
            .header(CONTENT_TYPE, "application/json");
        if let Some(session) = session {
            builder = builder.header(COOKIE, format!("{SESSION_COOKIE}={session}"));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn body_of(rsp: axum::response::Response) -> Value {
        serde_json::from_slice(&to_bytes(rsp.into_body(), usize::MAX).await.unwrap()).unwrap()
    }

    #[tokio::test]
    async fn author_replaces_mentions() {
        let f = fixture().await;
        let ids = json!({
            "userIds": [
                f.others[0].id(), f.others[1].id(), f.author.id(), f.others[0].id()
            ]
        });
        let rsp = f
            .app
            .clone()
            .oneshot(update(
                &f.post.to_string(),
                Some(&f.author_session),
                ids,
            ))
            .await
            .unwrap();
        assert_eq!(rsp.status(), StatusCode::OK);
        let rsp: MentionsRsp = serde_json::from_value(body_of(rsp).await).unwrap();
        assert_eq!(
            rsp.mentions,
            f.others.iter().map(MentionedUser::from).collect::<Vec<_>>()
        );

        let notifications = f.storage.notifications();
        assert_eq!(notifications.len(), 2);
        assert!(notifications.iter().all(|n| n.kind == NotificationKind::Mention
            && n.issuer == *f.author.id()
            && n.post == f.post));

        // Replacing, not appending
        let rsp = f
            .app
            .clone()
            .oneshot(update(
                &f.post.to_string(),
                Some(&f.author_session),
                json!({"userIds": [f.others[1].id()]}),
            ))
            .await
            .unwrap();
        let rsp: MentionsRsp = serde_json::from_value(body_of(rsp).await).unwrap();
        assert_eq!(rsp.mentions, vec![MentionedUser::from(&f.others[1])]);

        let rsp = f
            .app
            .oneshot(
                Request::builder()
                    .uri(format!("/posts/{}/mentions", f.post))
                    .header(COOKIE, format!("{SESSION_COOKIE}={}", f.other_session))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(rsp.status(), StatusCode::OK);
        let rsp: MentionsRsp = serde_json::from_value(body_of(rsp).await).unwrap();
        assert_eq!(rsp.mentions.len(), 1);
    }

    #[tokio::test]
    async fn mentions_are_capped() {
        let f = fixture().await;
        let too_many = (0..=MAX_MENTIONS)
            .map(|_| UserId::default())
            .collect::<Vec<_>>();
        let rsp = f
            .app
            .clone()
            .oneshot(update(
                &f.post.to_string(),
                Some(&f.author_session),
                json!({ "userIds": too_many }),
            ))
            .await
            .unwrap();
        assert_eq!(rsp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_of(rsp).await,
            json!({"error": format!(
                "At most {MAX_MENTIONS} users may be mentioned at once (got {})",
                MAX_MENTIONS + 1
            )})
        );
        assert!(f.storage.notifications().is_empty());

        // Exactly at the limit is fine
        let rsp = f
            .app
            .oneshot(update(
                &f.post.to_string(),
                Some(&f.author_session),
                json!({ "userIds": &too_many[..MAX_MENTIONS] }),
            ))
            .await
            .unwrap();
        assert_eq!(rsp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn mention_errors() {
        let f = fixture().await;

        let rsp = f
            .app
            .clone()
            .oneshot(update(&f.post.to_string(), None, json!({"userIds": []})))
            .await
            .unwrap();
        assert_eq!(rsp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_of(rsp).await, json!({"error": "Unauthorized"}));

        let rsp = f
            .app
            .clone()
            .oneshot(update(
                &f.post.to_string(),
                Some(&f.other_session),
                json!({"userIds": []}),
            ))
            .await
            .unwrap();
        assert_eq!(rsp.status(), StatusCode::FORBIDDEN);
        assert_eq!(body_of(rsp).await, json!({"error": "Unauthorized"}));

        let rsp = f
            .app
            .clone()
            .oneshot(update(
                &PostId::default().to_string(),
                Some(&f.author_session),
                json!({"userIds": []}),
            ))
            .await
            .unwrap();
        assert_eq!(rsp.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_of(rsp).await, json!({"error": "Post not found"}));

        let rsp = f
            .app
            .oneshot(update("not-a-post", Some(&f.author_session), json!({})))
            .await
            .unwrap();
        assert_eq!(rsp.status(), StatusCode::BAD_REQUEST);
        assert!(f.storage.notifications().is_empty());
    }
}
