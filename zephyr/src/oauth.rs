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

//! # Signing-in with GitHub
//!
//! The browser side of the OAuth 2.0 [authorization code grant]. There are three routes:
//!
//! - `GET /api/auth/login/github` & `GET /api/auth/link/github` begin the dance: each stashes a
//!   random `state` in a short-lived cookie & redirects to GitHub; the second also sets a
//!   `linking` cookie recording that the user wants to attach their GitHub account to the one
//!   they're signed-in to, rather than sign-in with it
//! - `GET /api/auth/callback/github` is where GitHub sends the browser back; we check `state`,
//!   trade the code for a token, ask GitHub who this is, & then do whatever
//!   [resolve](crate::resolution::resolve) says
//!
//! The callback never answers with a page; it redirects to the front end, carrying an error code
//! where appropriate. `GET /api/auth/error` turns such a code into something displayable.
//!
//! [authorization code grant]: https://www.rfc-editor.org/rfc/rfc6749#section-4.1

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, State},
    http::{HeaderValue, StatusCode, header::CONTENT_TYPE},
    response::IntoResponse,
    routing::get,
};
use axum_extra::extract::cookie::CookieJar;
use chrono::Duration;
use opentelemetry::KeyValue;
use serde::Deserialize;
use snafu::{Backtrace, prelude::*};
use tower_http::{cors::CorsLayer, set_header::SetResponseHeaderLayer};
use tracing::{debug, error, info, warn};
use url::form_urlencoded;

use zephyr_shared::{ErrorCode, SuccessCode, UserId, api::AuthErrorRsp};

use crate::{
    counter_add,
    entities::{self, GithubId, User, UserEmail},
    github::{self, primary_email},
    http::{ErrorResponseBody, found},
    metrics::{self, Sort},
    resolution::{Facts, Resolution, resolve},
    session, storage,
    util::random_token,
    zephyr::Zephyr,
};

pub const STATE_COOKIE: &str = "state";
pub const LINKING_COOKIE: &str = "linking";

/// How long a browser has to complete the round-trip through GitHub
const FLOW_LIFETIME_SECS: i64 = 600;
/// Octets of randomness in each `state`
const STATE_BYTES: usize = 32;
/// Attempts at finding an unused username before giving up
const USERNAME_ATTEMPTS: usize = 3;

inventory::submit! { metrics::Registration::new("oauth.initiations", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("oauth.callbacks", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("oauth.failures", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("oauth.chat.failures", Sort::IntegralCounter) }

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("The callback carried no authorization code"))]
    MissingCode { backtrace: Backtrace },
    #[snafu(display("GitHub's primary e-mail address {email} is invalid: {source}"))]
    BadEmail {
        email: String,
        source: entities::Error,
    },
    #[snafu(display("GitHub reported no primary e-mail address for {login}"))]
    NoPrimaryEmail { login: String, backtrace: Backtrace },
    #[snafu(display("GitHub request failed: {source}"))]
    Provider { source: github::Error },
    #[snafu(display("Failed to mint a session: {source}"))]
    Session { source: session::Error },
    #[snafu(display("The OAuth state didn't match the one we issued"))]
    StateMismatch { backtrace: Backtrace },
    #[snafu(display("Storage error: {source}"))]
    Storage { source: storage::Error },
    #[snafu(display("{text} is not a recognized error code"))]
    UnknownErrorCode {
        text: String,
        source: zephyr_shared::Error,
    },
    #[snafu(display("Account {id} went missing mid-flight"))]
    Vanished { id: UserId, backtrace: Backtrace },
    #[snafu(display("Couldn't find a free username for {login}"))]
    UsernamesExhausted { login: String, backtrace: Backtrace },
}

impl Error {
    /// Problems with the request itself are answered with a bare 400
    fn is_client_error(&self) -> bool {
        match self {
            Error::MissingCode { .. } | Error::StateMismatch { .. } => true,
            Error::Provider { source } => source.is_protocol_error(),
            _ => false,
        }
    }
    pub fn as_status_and_msg(&self) -> (StatusCode, String) {
        match self {
            Error::MissingCode { .. } | Error::StateMismatch { .. } => {
                (StatusCode::BAD_REQUEST, String::new())
            }
            Error::Provider { source } if source.is_protocol_error() => {
                (StatusCode::BAD_REQUEST, String::new())
            }
            Error::UnknownErrorCode { text, .. } => (
                StatusCode::BAD_REQUEST,
                format!("{text} is not a recognized error code"),
            ),
            err => (StatusCode::INTERNAL_SERVER_ERROR, format!("{err}")),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        match self.as_status_and_msg() {
            (code, msg) if msg.is_empty() => code.into_response(),
            (code, msg) => (code, ErrorResponseBody::new(msg)).into_response(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                     beginning the dance                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Set a fresh `state` cookie (& set or clear `linking`) and send the browser to GitHub
fn begin(
    state: &Zephyr,
    jar: CookieJar,
    linking: bool,
) -> (CookieJar, axum::response::Response) {
    let token = random_token(STATE_BYTES);
    let location = state.identity.authorization_url(&token);
    let cookies = state.sessions.cookie_options();
    let lifetime = Duration::seconds(FLOW_LIFETIME_SECS);
    let jar = jar.add(cookies.cookie(STATE_COOKIE, token, lifetime));
    let jar = if linking {
        jar.add(cookies.cookie(LINKING_COOKIE, "true".to_owned(), lifetime))
    } else {
        jar.remove(cookies.removal(LINKING_COOKIE))
    };
    counter_add!(
        state.instruments,
        "oauth.initiations",
        1,
        &[KeyValue::new("linking", linking)]
    );
    (jar, found(location.as_str()))
}

/// `GET /api/auth/login/github`
async fn login(State(state): State<Arc<Zephyr>>, jar: CookieJar) -> axum::response::Response {
    begin(&state, jar, false).into_response()
}

/// `GET /api/auth/link/github`
async fn link(State(state): State<Arc<Zephyr>>, jar: CookieJar) -> axum::response::Response {
    match state
        .sessions
        .current_user(&jar, state.storage.as_ref())
        .await
    {
        Ok(Some(user)) => {
            debug!("{} is linking a GitHub account", user.username());
            begin(&state, jar, true).into_response()
        }
        Ok(None) => found("/login"),
        Err(err) => {
            error!("{err:#?}");
            Error::Storage { source: err }.into_response()
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          the callback                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Deserialize)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
}

/// How a callback ended up
struct Completion {
    jar: CookieJar,
    location: String,
    outcome: &'static str,
}

fn email_exists(email: &UserEmail) -> String {
    format!(
        "/login/error?{}",
        form_urlencoded::Serializer::new(String::new())
            .append_pair("error", ErrorCode::EmailExists.as_str())
            .append_pair("email", email.as_ref())
            .finish()
    )
}

fn linked_to_other() -> String {
    format!(
        "/settings?error={}",
        ErrorCode::GithubAccountLinkedOther.as_str()
    )
}

/// The account [resolve] chose, which must be among the ones we gave it
fn account(candidate: Option<User>, id: UserId) -> Result<User> {
    candidate
        .filter(|user| *user.id() == id)
        .context(VanishedSnafu { id })
}

/// Open a new account for a GitHub identity, re-rolling the username on the (unlikely) event of a
/// collision; `None` means someone claimed the e-mail address while we weren't looking
async fn create_user(
    storage: &(dyn storage::Backend + Send + Sync),
    github_user: &github::GithubUser,
    email: &UserEmail,
) -> Result<Option<User>> {
    for _ in 0..USERNAME_ATTEMPTS {
        let user = User::from_github(
            GithubId::new(github_user.id),
            &github_user.login,
            github_user.name.as_deref(),
            email,
            github_user.avatar_url.as_deref(),
        );
        match storage.add_user(&user).await {
            Ok(()) => return Ok(Some(user)),
            Err(storage::Error::UsernameClaimed { username, .. }) => {
                debug!("Username {username} is taken; trying another");
            }
            Err(storage::Error::EmailClaimed { .. }) => return Ok(None),
            Err(err) => return Err(Error::Storage { source: err }),
        }
    }
    UsernamesExhaustedSnafu {
        login: github_user.login.clone(),
    }
    .fail()
}

/// `GET /api/auth/callback/github`
async fn callback(
    State(state): State<Arc<Zephyr>>,
    jar: CookieJar,
    Query(params): Query<CallbackParams>,
) -> axum::response::Response {
    async fn callback1(
        state: &Zephyr,
        jar: CookieJar,
        params: CallbackParams,
    ) -> Result<Completion> {
        let expected = jar.get(STATE_COOKIE).map(|cookie| cookie.value().to_owned());
        ensure!(
            expected.is_some() && params.state == expected,
            StateMismatchSnafu
        );
        let code = params
            .code
            .filter(|code| !code.is_empty())
            .context(MissingCodeSnafu)?;
        let linking = jar
            .get(LINKING_COOKIE)
            .is_some_and(|cookie| cookie.value() == "true");

        let token = state
            .identity
            .exchange_code(&code)
            .await
            .context(ProviderSnafu)?;
        let github_user = state.identity.user(&token).await.context(ProviderSnafu)?;
        let emails = state.identity.emails(&token).await.context(ProviderSnafu)?;
        let primary = primary_email(&emails).context(NoPrimaryEmailSnafu {
            login: github_user.login.clone(),
        })?;
        let email = UserEmail::new(&primary.email).context(BadEmailSnafu {
            email: primary.email.clone(),
        })?;
        let github_id = GithubId::new(github_user.id);

        let storage = state.storage.as_ref();
        let current = if linking {
            state
                .sessions
                .current_user(&jar, storage)
                .await
                .context(StorageSnafu)?
        } else {
            None
        };
        let by_email = storage.user_by_email(&email).await.context(StorageSnafu)?;
        let by_github = storage
            .user_by_github_id(&github_id)
            .await
            .context(StorageSnafu)?;

        let resolution = resolve(&Facts {
            linking,
            current: current.as_ref(),
            by_email: by_email.as_ref(),
            by_github: by_github.as_ref(),
        });
        debug!(
            "GitHub user {} ({github_id}) resolved to {resolution:?}",
            github_user.login
        );

        let cookies = state.sessions.cookie_options();
        let jar = jar.remove(cookies.removal(STATE_COOKIE));
        let outcome = resolution.as_str();
        let (jar, location) = match resolution {
            Resolution::RequireLogin => (jar, "/login".to_owned()),
            Resolution::LinkedToOther => (jar, linked_to_other()),
            Resolution::EmailExists(email) => (jar, email_exists(&email)),
            Resolution::Link(id) => match storage.link_github(&id, &github_id).await {
                Ok(()) => {
                    let user = account(current, id)?;
                    info!("Linked GitHub user {} to {}", github_user.login, user.username());
                    let session = state.sessions.issue(&user).context(SessionSnafu)?;
                    (
                        jar.remove(cookies.removal(LINKING_COOKIE)).add(session),
                        format!("/settings?success={}", SuccessCode::GithubLinked.as_str()),
                    )
                }
                // Someone beat us to it
                Err(storage::Error::GithubIdClaimed { .. }) => (jar, linked_to_other()),
                Err(err) => return Err(Error::Storage { source: err }),
            },
            Resolution::SignIn(id) => {
                let user = account(by_github, id)?;
                let session = state.sessions.issue(&user).context(SessionSnafu)?;
                (jar.add(session), "/".to_owned())
            }
            Resolution::Create => match create_user(storage, &github_user, &email).await? {
                Some(user) => {
                    info!(
                        "Created user {} for GitHub user {}",
                        user.username(),
                        github_user.login
                    );
                    if let Err(err) = state
                        .chat
                        .upsert_user(
                            user.id(),
                            user.username(),
                            user.display_name(),
                            user.avatar_url(),
                        )
                        .await
                    {
                        warn!("Failed to provision {} for chat: {err}", user.username());
                        counter_add!(state.instruments, "oauth.chat.failures", 1, &[]);
                    }
                    let session = state.sessions.issue(&user).context(SessionSnafu)?;
                    (jar.add(session), "/".to_owned())
                }
                None => (jar, email_exists(&email)),
            },
        };

        Ok(Completion {
            jar,
            location,
            outcome,
        })
    }

    match callback1(&state, jar, params).await {
        Ok(Completion {
            jar,
            location,
            outcome,
        }) => {
            info!("GitHub callback completed: {outcome}; redirecting to {location}");
            counter_add!(
                state.instruments,
                "oauth.callbacks",
                1,
                &[KeyValue::new("outcome", outcome)]
            );
            (jar, found(&location)).into_response()
        }
        Err(err) => {
            if err.is_client_error() {
                info!("Rejecting GitHub callback: {err}");
            } else {
                error!("{err:#?}");
            }
            counter_add!(state.instruments, "oauth.failures", 1, &[]);
            err.into_response()
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        error page data                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Deserialize)]
struct ErrorParams {
    error: Option<String>,
    email: Option<String>,
}

/// `GET /api/auth/error`
async fn auth_error(Query(params): Query<ErrorParams>) -> axum::response::Response {
    fn auth_error1(params: ErrorParams) -> Result<AuthErrorRsp> {
        // No code at all is the generic "something went wrong with the provider"
        let code = match params.error.as_deref() {
            None | Some("") => ErrorCode::OauthError,
            Some(text) => text.parse::<ErrorCode>().context(UnknownErrorCodeSnafu {
                text: text.to_owned(),
            })?,
        };
        Ok(AuthErrorRsp {
            code,
            message: code.message().to_owned(),
            email: params.email.filter(|email| !email.is_empty()),
        })
    }

    match auth_error1(params) {
        Ok(rsp) => (StatusCode::OK, Json(rsp)).into_response(),
        Err(err) => {
            info!("{err}");
            err.into_response()
        }
    }
}

pub fn make_router(state: Arc<Zephyr>) -> Router<Arc<Zephyr>> {
    Router::new()
        .route("/auth/login/github", get(login))
        .route("/auth/link/github", get(link))
        .route("/auth/callback/github", get(callback))
        .route("/auth/error", get(auth_error))
        .layer(SetResponseHeaderLayer::if_not_present(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        ))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
mod test {
    use std::sync::atomic::Ordering;

    use axum::{
        body::{Body, to_bytes},
        http::{
            Request, Response,
            header::{COOKIE, LOCATION, SET_COOKIE},
        },
    };
    use axum_extra::extract::cookie::Cookie;
    use tower::ServiceExt;

    use super::*;
    use crate::{
        memory::Memory,
        session::SESSION_COOKIE,
        storage::Backend,
        zephyr::testing::{Recording, Scripted, oauth_state},
    };

    fn set_cookies(rsp: &Response<Body>) -> Vec<Cookie<'static>> {
        rsp.headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .filter_map(|value| Cookie::parse(value.to_owned()).ok())
            .collect()
    }

    fn location(rsp: &Response<Body>) -> &str {
        rsp.headers().get(LOCATION).unwrap().to_str().unwrap()
    }

    fn callback_req(code: &str, state: &str, cookies: &str) -> Request<Body> {
        Request::builder()
            .uri(format!("/auth/callback/github?code={code}&state={state}"))
            .header(COOKIE, cookies)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn login_sets_state_and_redirects() {
        let state = oauth_state(
            Arc::new(Memory::new()),
            Arc::new(Scripted::octocat()),
            Arc::new(Recording::default()),
        );
        let app: Router = make_router(state.clone()).with_state(state.clone());
        let rsp = app
            .oneshot(
                Request::builder()
                    .uri("/auth/login/github")
                    .header(COOKIE, "linking=true")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(rsp.status(), StatusCode::FOUND);

        let cookies = set_cookies(&rsp);
        let state_cookie = cookies.iter().find(|c| c.name() == STATE_COOKIE).unwrap();
        assert_eq!(state_cookie.value().len(), 43);
        assert_eq!(state_cookie.http_only(), Some(true));
        assert_eq!(state_cookie.max_age(), Some(time::Duration::seconds(600)));
        // The stale linking intent is dropped
        let linking = cookies.iter().find(|c| c.name() == LINKING_COOKIE).unwrap();
        assert_eq!(linking.value(), "");

        let target = url::Url::parse(location(&rsp)).unwrap();
        let pairs: Vec<(String, String)> = target.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("state".to_owned(), state_cookie.value().to_owned())));
    }

    #[tokio::test]
    async fn link_requires_a_session() {
        let storage = Arc::new(Memory::new());
        let state = oauth_state(
            storage.clone(),
            Arc::new(Scripted::octocat()),
            Arc::new(Recording::default()),
        );
        let app: Router = make_router(state.clone()).with_state(state.clone());

        let rsp = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/auth/link/github")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(rsp.status(), StatusCode::FOUND);
        assert_eq!(location(&rsp), "/login");
        assert!(set_cookies(&rsp).is_empty());

        let user = User::from_github(
            GithubId::new(99),
            "someone",
            None,
            &UserEmail::new("someone@example.com").unwrap(),
            None,
        );
        storage.add_user(&user).await.unwrap();
        let session = state.sessions.mint(user.id()).unwrap();
        let rsp = app
            .oneshot(
                Request::builder()
                    .uri("/auth/link/github")
                    .header(COOKIE, format!("{SESSION_COOKIE}={session}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(rsp.status(), StatusCode::FOUND);
        let cookies = set_cookies(&rsp);
        assert!(cookies.iter().any(|c| c.name() == STATE_COOKIE));
        assert!(
            cookies
                .iter()
                .any(|c| c.name() == LINKING_COOKIE && c.value() == "true")
        );
    }

    #[tokio::test]
    async fn callback_without_a_code_is_rejected() {
        let state = oauth_state(
            Arc::new(Memory::new()),
            Arc::new(Scripted::octocat()),
            Arc::new(Recording::default()),
        );
        let app: Router = make_router(state.clone()).with_state(state.clone());
        let rsp = app
            .oneshot(
                Request::builder()
                    .uri("/auth/callback/github?state=abc")
                    .header(COOKIE, "state=abc")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(rsp.status(), StatusCode::BAD_REQUEST);
        assert!(set_cookies(&rsp).is_empty());
        let body = to_bytes(rsp.into_body(), usize::MAX).await.unwrap();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn refused_codes_are_client_errors() {
        let identity = Arc::new(Scripted::octocat());
        identity.refuse_codes.store(true, Ordering::SeqCst);
        let state = oauth_state(
            Arc::new(Memory::new()),
            identity,
            Arc::new(Recording::default()),
        );
        let app: Router = make_router(state.clone()).with_state(state.clone());
        let rsp = app
            .oneshot(callback_req("stale", "abc", "state=abc"))
            .await
            .unwrap();
        assert_eq!(rsp.status(), StatusCode::BAD_REQUEST);
        let body = to_bytes(rsp.into_body(), usize::MAX).await.unwrap();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn upstream_failures_are_server_errors() {
        let identity = Arc::new(Scripted::octocat());
        identity.fail_profile.store(true, Ordering::SeqCst);
        let state = oauth_state(
            Arc::new(Memory::new()),
            identity,
            Arc::new(Recording::default()),
        );
        let app: Router = make_router(state.clone()).with_state(state.clone());
        let rsp = app
            .oneshot(callback_req("good", "abc", "state=abc"))
            .await
            .unwrap();
        assert_eq!(rsp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = to_bytes(rsp.into_body(), usize::MAX).await.unwrap();
        let body: ErrorResponseBody = serde_json::from_slice(&body).unwrap();
        assert!(!body.error.is_empty());
    }

    #[tokio::test]
    async fn no_primary_email_is_fatal() {
        let mut identity = Scripted::octocat();
        identity.emails.iter_mut().for_each(|email| email.primary = false);
        let storage = Arc::new(Memory::new());
        let state = oauth_state(
            storage.clone(),
            Arc::new(identity),
            Arc::new(Recording::default()),
        );
        let app: Router = make_router(state.clone()).with_state(state.clone());
        let rsp = app
            .oneshot(callback_req("good", "abc", "state=abc"))
            .await
            .unwrap();
        assert_eq!(rsp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(storage.user_count(), 0);
    }

    #[tokio::test]
    async fn returning_users_are_signed_in() {
        let storage = Arc::new(Memory::new());
        let identity = Arc::new(Scripted::octocat());
        let octocat = User::from_github(
            GithubId::new(identity.user.id),
            "octocat",
            None,
            &UserEmail::new("octocat@github.com").unwrap(),
            None,
        );
        storage.add_user(&octocat).await.unwrap();
        let chat = Arc::new(Recording::default());
        let state = oauth_state(storage.clone(), identity, chat.clone());
        let app: Router = make_router(state.clone()).with_state(state.clone());

        let rsp = app
            .oneshot(callback_req("good", "abc", "state=abc"))
            .await
            .unwrap();
        assert_eq!(rsp.status(), StatusCode::FOUND);
        assert_eq!(location(&rsp), "/");
        let cookies = set_cookies(&rsp);
        let session = cookies.iter().find(|c| c.name() == SESSION_COOKIE).unwrap();
        assert_eq!(state.sessions.verify(session.value()).unwrap(), *octocat.id());
        // The state cookie is spent
        assert!(
            cookies
                .iter()
                .any(|c| c.name() == STATE_COOKIE && c.value().is_empty())
        );
        assert_eq!(storage.user_count(), 1);
        assert!(chat.upserted().is_empty());
    }

    #[tokio::test]
    async fn linking_attaches_the_identity() {
        let storage = Arc::new(Memory::new());
        let identity = Arc::new(Scripted::octocat());
        let alice = User::from_parts(
            Default::default(),
            entities::Username::new("alice").unwrap(),
            "Alice".to_owned(),
            UserEmail::new("alice@example.com").unwrap(),
            true,
            None,
            None,
            chrono::Utc::now(),
        );
        storage.add_user(&alice).await.unwrap();
        let state = oauth_state(
            storage.clone(),
            identity.clone(),
            Arc::new(Recording::default()),
        );
        let session = state.sessions.mint(alice.id()).unwrap();
        let app: Router = make_router(state.clone()).with_state(state.clone());

        let rsp = app
            .oneshot(callback_req(
                "good",
                "abc",
                &format!("state=abc; linking=true; {SESSION_COOKIE}={session}"),
            ))
            .await
            .unwrap();
        assert_eq!(rsp.status(), StatusCode::FOUND);
        assert_eq!(location(&rsp), "/settings?success=github_linked");
        assert!(
            set_cookies(&rsp)
                .iter()
                .any(|c| c.name() == LINKING_COOKIE && c.value().is_empty())
        );
        let alice = storage.user_by_id(alice.id()).await.unwrap().unwrap();
        assert_eq!(alice.github_id(), Some(&GithubId::new(identity.user.id)));
    }

    #[tokio::test]
    async fn linking_without_a_session_redirects_to_login() {
        let storage = Arc::new(Memory::new());
        let state = oauth_state(
            storage.clone(),
            Arc::new(Scripted::octocat()),
            Arc::new(Recording::default()),
        );
        let app: Router = make_router(state.clone()).with_state(state.clone());
        let rsp = app
            .oneshot(callback_req("good", "abc", "state=abc; linking=true"))
            .await
            .unwrap();
        assert_eq!(rsp.status(), StatusCode::FOUND);
        assert_eq!(location(&rsp), "/login");
        assert_eq!(storage.user_count(), 0);
    }

    #[tokio::test]
    async fn chat_failures_dont_block_sign_up() {
        let storage = Arc::new(Memory::new());
        let chat = Arc::new(Recording::default());
        chat.fail.store(true, Ordering::SeqCst);
        let state = oauth_state(storage.clone(), Arc::new(Scripted::octocat()), chat);
        let app: Router = make_router(state.clone()).with_state(state.clone());
        let rsp = app
            .oneshot(callback_req("good", "abc", "state=abc"))
            .await
            .unwrap();
        assert_eq!(rsp.status(), StatusCode::FOUND);
        assert_eq!(location(&rsp), "/");
        assert!(
            set_cookies(&rsp)
                .iter()
                .any(|c| c.name() == SESSION_COOKIE)
        );
        assert_eq!(storage.user_count(), 1);
    }

    #[tokio::test]
    async fn error_codes_are_explained() {
        let state = oauth_state(
            Arc::new(Memory::new()),
            Arc::new(Scripted::octocat()),
            Arc::new(Recording::default()),
        );
        let app: Router = make_router(state.clone()).with_state(state.clone());
        let rsp = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/auth/error?error=email_exists&email=octocat%40github.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(rsp.status(), StatusCode::OK);
        let body = to_bytes(rsp.into_body(), usize::MAX).await.unwrap();
        let rsp: AuthErrorRsp = serde_json::from_slice(&body).unwrap();
        assert_eq!(rsp.code, ErrorCode::EmailExists);
        assert_eq!(rsp.message, ErrorCode::EmailExists.message());
        assert_eq!(rsp.email.as_deref(), Some("octocat@github.com"));

        let rsp = app
            .oneshot(
                Request::builder()
                    .uri("/auth/error?error=bogus")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(rsp.status(), StatusCode::BAD_REQUEST);
    }
}
