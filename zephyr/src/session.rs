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

//! # zephyr sessions
//!
//! A zephyr session is a [JWT] carried in the `auth_session` cookie. The token names the user
//! (`sub`) & the session (`jti`), and is signed with the current [SigningKey]; the header names
//! the key, so tokens signed under older keys keep verifying until their key is retired.
//!
//! [JWT]: https://www.rfc-editor.org/rfc/rfc7519.html
//!
//! Nothing about a session is stored server-side, which means there's no revocation short of
//! rotating keys. Logging out just drops the cookie.

use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::{HeaderValue, StatusCode, header::CONTENT_TYPE},
    routing::post,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use jwt::{Header, SignWithKey, Token, VerifyWithKey};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use snafu::{Backtrace, prelude::*};
use tower_http::{cors::CorsLayer, set_header::SetResponseHeaderLayer};
use tracing::{debug, info};
use uuid::Uuid;

use zephyr_shared::UserId;

use crate::{
    entities::User,
    signing_keys::{self, KeyId, SigningKey, SigningKeys},
    storage::{self, Backend as StorageBackend},
    zephyr::Zephyr,
};

pub const SESSION_COOKIE: &str = "auth_session";

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Session expired at {expires}"))]
    Expired {
        expires: DateTime<Utc>,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to create an HMAC: {source}"))]
    Hmac {
        source: hmac::digest::InvalidLength,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to refine a string to a KeyId: {source}"))]
    KeyId {
        source: signing_keys::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("The Key ID was missing from the JWT"))]
    MissingKeyId { backtrace: Backtrace },
    #[snafu(display("No signing key matching {keyid}: {source}"))]
    NoKey {
        keyid: KeyId,
        source: signing_keys::Error,
    },
    #[snafu(display("No signing keys configured: {source}"))]
    NoKeys { source: signing_keys::Error },
    #[snafu(display("Invalid session: not before {not_before}"))]
    NotBefore {
        not_before: DateTime<Utc>,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to parse JWT: {source}"))]
    Parse {
        source: jwt::error::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to sign JWT claims: {source}"))]
    Signature {
        source: jwt::error::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Unknown session audience {audience}"))]
    UnknownAudience {
        audience: String,
        backtrace: Backtrace,
    },
    #[snafu(display("Unknown session issuer {issuer}"))]
    UnknownIssuer {
        issuer: String,
        backtrace: Backtrace,
    },
    #[snafu(display("Verification failure: {source}"))]
    Verification {
        source: jwt::error::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            cookies                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Attributes common to every cookie zephyr sets
#[derive(Clone, Debug, Default)]
pub struct CookieOptions {
    /// Set the `Secure` attribute; should be true anywhere but local development
    pub secure: bool,
    pub domain: Option<String>,
}

impl CookieOptions {
    /// Build an http-only, same-site lax cookie scoped to the whole site
    pub fn cookie(&self, name: &str, value: String, max_age: Duration) -> Cookie<'static> {
        let mut builder = Cookie::build((name.to_owned(), value))
            .http_only(true)
            .same_site(SameSite::Lax)
            .path("/")
            .secure(self.secure)
            .max_age(time::Duration::seconds(max_age.num_seconds()));
        if let Some(domain) = &self.domain {
            builder = builder.domain(domain.clone());
        }
        builder.build()
    }
    /// A cookie that, handed to [CookieJar::remove], clears the cookie named `name`
    pub fn removal(&self, name: &str) -> Cookie<'static> {
        let mut builder = Cookie::build(name.to_owned()).path("/");
        if let Some(domain) = &self.domain {
            builder = builder.domain(domain.clone());
        }
        builder.build()
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         session tokens                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// zephyr session [JWT] claims
#[derive(Clone, Debug, Deserialize, Serialize)]
struct SessionClaims {
    #[serde(rename = "iat")]
    issued_at: DateTime<Utc>,
    #[serde(rename = "iss")]
    issuer: String,
    #[serde(rename = "aud")]
    audience: String,
    #[serde(rename = "nbf")]
    not_before: DateTime<Utc>,
    #[serde(rename = "exp")]
    expires: DateTime<Utc>,
    #[serde(rename = "jti")]
    session: Uuid,
    #[serde(rename = "sub")]
    subject: UserId,
}

/// The session authority: mints, verifies & wraps session tokens
pub struct Sessions {
    keys: SigningKeys,
    issuer: String,
    lifetime: Duration,
    cookies: CookieOptions,
}

impl Sessions {
    /// `issuer` is the host name under which zephyr is served
    pub fn new(
        keys: SigningKeys,
        issuer: &str,
        lifetime: Duration,
        cookies: CookieOptions,
    ) -> Sessions {
        Sessions {
            keys,
            issuer: issuer.to_owned(),
            lifetime,
            cookies,
        }
    }
    pub fn cookie_options(&self) -> &CookieOptions {
        &self.cookies
    }
    fn audience(&self) -> String {
        format!("api.{}", self.issuer)
    }
    fn hmac(signing_key: &SigningKey) -> Result<Hmac<Sha256>> {
        Hmac::new_from_slice(signing_key.as_ref().expose_secret()).context(HmacSnafu)
    }
    /// Mint a new session token for `user`; return the fully serialized JWT
    pub fn mint(&self, user: &UserId) -> Result<String> {
        let (keyid, signing_key) = self.keys.current().context(NoKeysSnafu)?;
        let key = Sessions::hmac(&signing_key)?;
        let header = Header {
            key_id: Some(keyid.to_string()),
            ..Default::default()
        };
        let now = Utc::now();
        let claims = SessionClaims {
            issued_at: now,
            issuer: self.issuer.clone(),
            audience: self.audience(),
            not_before: now,
            expires: now + self.lifetime,
            session: Uuid::new_v4(),
            subject: *user,
        };
        Ok(Token::new(header, claims)
            .sign_with_key(&key)
            .context(SignatureSnafu)?
            .as_str()
            .to_owned())
    }
    /// Verify a session token, returning the user it names
    pub fn verify(&self, token_string: &str) -> Result<UserId> {
        let token: Token<Header, SessionClaims, _> =
            Token::parse_unverified(token_string).context(ParseSnafu)?;
        let keyid = token
            .header()
            .key_id
            .clone()
            .context(MissingKeyIdSnafu)?;
        let keyid = KeyId::new(&keyid).context(KeyIdSnafu)?;
        let signing_key = self
            .keys
            .find_by_version(&keyid)
            .context(NoKeySnafu { keyid })?;
        let key = Sessions::hmac(&signing_key)?;
        let token: Token<Header, SessionClaims, _> = token_string
            .verify_with_key(&key)
            .context(VerificationSnafu)?;
        let claims = token.claims();

        let now = Utc::now();
        ensure!(
            now >= claims.not_before,
            NotBeforeSnafu {
                not_before: claims.not_before
            }
        );
        ensure!(
            now <= claims.expires,
            ExpiredSnafu {
                expires: claims.expires
            }
        );
        ensure!(
            claims.issuer == self.issuer,
            UnknownIssuerSnafu {
                issuer: claims.issuer.clone()
            }
        );
        ensure!(
            claims.audience == self.audience(),
            UnknownAudienceSnafu {
                audience: claims.audience.clone()
            }
        );

        Ok(claims.subject)
    }
    /// Mint a session for `user` & wrap it in the session cookie
    pub fn issue(&self, user: &User) -> Result<Cookie<'static>> {
        let token = self.mint(user.id())?;
        info!("Issued a session for {}", user.username());
        Ok(self.cookies.cookie(SESSION_COOKIE, token, self.lifetime))
    }
    pub fn clear(&self) -> Cookie<'static> {
        self.cookies.removal(SESSION_COOKIE)
    }
    /// The user named by the session cookie in `jar`, if any
    ///
    /// A missing, malformed, expired or otherwise invalid session is simply no session; only a
    /// failure to look the user up is an error.
    pub async fn current_user(
        &self,
        jar: &CookieJar,
        storage: &(dyn StorageBackend + Send + Sync),
    ) -> storage::Result<Option<User>> {
        let Some(cookie) = jar.get(SESSION_COOKIE) else {
            return Ok(None);
        };
        match self.verify(cookie.value()) {
            Ok(id) => storage.user_by_id(&id).await,
            Err(err) => {
                debug!("Ignoring invalid session: {err}");
                Ok(None)
            }
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            handlers                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// `POST /api/auth/logout`
async fn logout(State(state): State<Arc<Zephyr>>, jar: CookieJar) -> (CookieJar, StatusCode) {
    (jar.remove(state.sessions.clear()), StatusCode::NO_CONTENT)
}

pub fn make_router(state: Arc<Zephyr>) -> Router<Arc<Zephyr>> {
    Router::new()
        .route("/auth/logout", post(logout))
        .layer(SetResponseHeaderLayer::if_not_present(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        ))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
