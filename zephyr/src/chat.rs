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

//! # Chat identities
//!
//! Direct messaging is provided by a hosted chat service ([Stream]), which keeps its own user
//! directory. New zephyr accounts are "upserted" there on creation. This is strictly
//! best-effort: the relational store is the source of truth, & a failure here never fails
//! sign-up (the chat service will learn of the user on their first chat session anyway).
//!
//! [Stream]: https://getstream.io/chat/docs/rest/

use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use jwt::SignWithKey;
use reqwest::{StatusCode, header::AUTHORIZATION};
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use sha2::Sha256;
use snafu::{Backtrace, prelude::*};
use tracing::debug;
use url::Url;

use zephyr_shared::UserId;

use crate::entities::Username;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Failed to build an HTTP client: {source}"))]
    Client {
        source: reqwest::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Bad chat service URL: {source}"))]
    Endpoint {
        source: url::ParseError,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to create an HMAC: {source}"))]
    Hmac {
        source: hmac::digest::InvalidLength,
        backtrace: Backtrace,
    },
    #[snafu(display("Request to the chat service failed: {source}"))]
    Request {
        source: reqwest::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to sign the chat server token: {source}"))]
    Signature {
        source: jwt::error::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("The chat service answered {status}: {body}"))]
    Status {
        status: StatusCode,
        body: String,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

#[async_trait]
pub trait ChatProvisioner {
    /// Create or update the chat service's record of a zephyr user
    async fn upsert_user(
        &self,
        id: &UserId,
        username: &Username,
        display_name: &str,
        avatar_url: Option<&str>,
    ) -> Result<()>;
}

/// No chat service configured
pub struct Disabled;

#[async_trait]
impl ChatProvisioner for Disabled {
    async fn upsert_user(
        &self,
        id: &UserId,
        _username: &Username,
        _display_name: &str,
        _avatar_url: Option<&str>,
    ) -> Result<()> {
        debug!("No chat service configured; not provisioning {id}");
        Ok(())
    }
}

/// A [ChatProvisioner] backed by Stream's REST API
pub struct StreamChat {
    client: reqwest::Client,
    users_url: Url,
    api_key: String,
    api_secret: SecretString,
}

impl StreamChat {
    pub fn new(
        base: &Url,
        api_key: &str,
        api_secret: SecretString,
        user_agent: &str,
        timeout: Duration,
    ) -> Result<StreamChat> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent.to_owned())
            .timeout(timeout)
            .build()
            .context(ClientSnafu)?;
        let mut users_url = base.join("users").context(EndpointSnafu)?;
        users_url.query_pairs_mut().append_pair("api_key", api_key);
        Ok(StreamChat {
            client,
            users_url,
            api_key: api_key.to_owned(),
            api_secret,
        })
    }
    /// Server-side requests are authorized by a JWT claiming `server: true`, signed with the API
    /// secret
    fn server_token(&self) -> Result<String> {
        let key: Hmac<Sha256> =
            Hmac::new_from_slice(self.api_secret.expose_secret().as_bytes()).context(HmacSnafu)?;
        BTreeMap::from([("server", true)])
            .sign_with_key(&key)
            .context(SignatureSnafu)
    }
}

#[async_trait]
impl ChatProvisioner for StreamChat {
    async fn upsert_user(
        &self,
        id: &UserId,
        username: &Username,
        display_name: &str,
        avatar_url: Option<&str>,
    ) -> Result<()> {
        let id = id.to_string();
        let mut user = json!({
            "id": id,
            "name": display_name,
            "username": username.as_ref(),
        });
        if let Some(avatar_url) = avatar_url {
            user["image"] = json!(avatar_url);
        }
        let rsp = self
            .client
            .post(self.users_url.clone())
            .header(AUTHORIZATION, self.server_token()?)
            .header("stream-auth-type", "jwt")
            .json(&json!({ "users": { id.clone(): user } }))
            .send()
            .await
            .context(RequestSnafu)?;
        let status = rsp.status();
        if !status.is_success() {
            let body = rsp.text().await.unwrap_or_default();
            return StatusSnafu { status, body }.fail();
        }
        debug!("Upserted chat user {id} (api key {})", self.api_key);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use jwt::VerifyWithKey;
    use serde_json::Value;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{header, method, path, query_param},
    };

    use super::*;

    fn client(server: &MockServer) -> StreamChat {
        StreamChat::new(
            &Url::parse(&format!("{}/", server.uri())).unwrap(),
            "key123",
            SecretString::from("secret456".to_owned()),
            "zephyr unit tests/0.0.1; +sp1ff@pobox.com",
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn upsert_posts_the_user() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/users"))
            .and(query_param("api_key", "key123"))
            .and(header("stream-auth-type", "jwt"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"users": {}})))
            .expect(1)
            .mount(&server)
            .await;

        let id = UserId::default();
        client(&server)
            .upsert_user(
                &id,
                &Username::new("octocat-1a2b").unwrap(),
                "The Octocat",
                None,
            )
            .await
            .unwrap();

        let requests = server.received_requests().await.unwrap();
        let request = &requests[0];
        let token = request
            .headers
            .get("authorization")
            .unwrap()
            .to_str()
            .unwrap();
        let key: Hmac<Sha256> = Hmac::new_from_slice(b"secret456").unwrap();
        let claims: BTreeMap<String, bool> = token.verify_with_key(&key).unwrap();
        assert!(claims["server"]);

        let body: Value = request.body_json().unwrap();
        let user = &body["users"][id.to_string()];
        assert_eq!(user["username"], "octocat-1a2b");
        assert_eq!(user["name"], "The Octocat");
        assert!(user.get("image").is_none());
    }

    #[tokio::test]
    async fn rejections_are_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/users"))
            .respond_with(ResponseTemplate::new(503).set_body_string("try later"))
            .mount(&server)
            .await;

        let err = client(&server)
            .upsert_user(
                &UserId::default(),
                &Username::new("octocat-1a2b").unwrap(),
                "The Octocat",
                Some("https://avatars.githubusercontent.com/u/583231"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Status { status, .. } if status.as_u16() == 503));
    }
}
