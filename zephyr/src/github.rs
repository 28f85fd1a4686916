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

//! # GitHub as an identity provider
//!
//! zephyr signs people in with GitHub's [OAuth web application flow]: redirect the browser to
//! GitHub's authorization page, receive it back at our callback with a `code`, exchange that for
//! an access token, then ask the GitHub API who the user is & what their e-mail addresses are.
//!
//! [OAuth web application flow]: https://docs.github.com/en/apps/oauth-apps/building-oauth-apps/authorizing-oauth-apps
//!
//! Errors fall into two classes. The token endpoint refusing the code (it answers with an OAuth2
//! `error` member, or a 4xx) means the *request* was bad (an expired or replayed code, say): that's
//! [Error::OAuth2Request], and the callback answers 400. Anything else (transport failures,
//! unexpected statuses, undecodable bodies) is an upstream failure.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{
    StatusCode,
    header::{ACCEPT, AUTHORIZATION},
};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use snafu::{Backtrace, prelude::*};
use tracing::debug;
use url::Url;

pub const SCOPES: &str = "read:user user:email";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Failed to build an HTTP client: {source}"))]
    Client {
        source: reqwest::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to decode the response from {url}: {source}"))]
    Decode {
        url: Url,
        source: reqwest::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Bad endpoint URL: {source}"))]
    Endpoint {
        source: url::ParseError,
        backtrace: Backtrace,
    },
    #[snafu(display("GitHub refused the authorization code: {error}"))]
    OAuth2Request {
        error: String,
        description: Option<String>,
        backtrace: Backtrace,
    },
    #[snafu(display("Request to {url} failed: {source}"))]
    Request {
        url: Url,
        source: reqwest::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("{url} answered {status}"))]
    Status {
        url: Url,
        status: StatusCode,
        backtrace: Backtrace,
    },
}

impl Error {
    /// True if this error reflects a bad authorization request rather than an upstream failure
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, Error::OAuth2Request { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        IdentityProvider                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// An OAuth access token; only ever shown to the provider that issued it
#[derive(Clone, Debug)]
pub struct AccessToken(SecretString);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> AccessToken {
        AccessToken(SecretString::from(token.into()))
    }
    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

/// The parts of a GitHub profile zephyr cares about
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct GithubUser {
    pub id: u64,
    pub login: String,
    pub name: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct GithubEmail {
    pub email: String,
    pub primary: bool,
    #[serde(default)]
    pub verified: bool,
}

/// The first address GitHub marks as primary, if any
pub fn primary_email(emails: &[GithubEmail]) -> Option<&GithubEmail> {
    emails.iter().find(|email| email.primary)
}

#[async_trait]
pub trait IdentityProvider {
    /// Where to send the browser to begin authorization, correlated by `state`
    fn authorization_url(&self, state: &str) -> Url;
    async fn exchange_code(&self, code: &str) -> Result<AccessToken>;
    async fn user(&self, token: &AccessToken) -> Result<GithubUser>;
    async fn emails(&self, token: &AccessToken) -> Result<Vec<GithubEmail>>;
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             GitHub                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug)]
pub struct GitHubOptions {
    pub client_id: String,
    pub client_secret: SecretString,
    /// Our callback, as registered with GitHub
    pub redirect_uri: Option<Url>,
    pub authorize_url: Url,
    pub token_url: Url,
    pub api_base: Url,
    pub user_agent: String,
    pub timeout: Duration,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TokenRsp {
    Token {
        access_token: String,
    },
    Refused {
        error: String,
        error_description: Option<String>,
    },
}

/// An [IdentityProvider] that talks to GitHub (or anything speaking its API) over HTTPS
pub struct GitHub {
    client: reqwest::Client,
    options: GitHubOptions,
    user_url: Url,
    emails_url: Url,
}

impl GitHub {
    pub fn new(options: GitHubOptions) -> Result<GitHub> {
        let client = reqwest::Client::builder()
            .user_agent(options.user_agent.clone())
            .timeout(options.timeout)
            .build()
            .context(ClientSnafu)?;
        let user_url = options.api_base.join("user").context(EndpointSnafu)?;
        let emails_url = options.api_base.join("user/emails").context(EndpointSnafu)?;
        Ok(GitHub {
            client,
            options,
            user_url,
            emails_url,
        })
    }
    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        url: &Url,
        token: &AccessToken,
    ) -> Result<T> {
        let rsp = self
            .client
            .get(url.clone())
            .header(AUTHORIZATION, format!("Bearer {}", token.expose()))
            .header(ACCEPT, "application/vnd.github+json")
            .send()
            .await
            .context(RequestSnafu { url: url.clone() })?;
        ensure!(
            rsp.status().is_success(),
            StatusSnafu {
                url: url.clone(),
                status: rsp.status()
            }
        );
        rsp.json::<T>().await.context(DecodeSnafu { url: url.clone() })
    }
}

#[async_trait]
impl IdentityProvider for GitHub {
    fn authorization_url(&self, state: &str) -> Url {
        let mut url = self.options.authorize_url.clone();
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("response_type", "code")
                .append_pair("client_id", &self.options.client_id)
                .append_pair("state", state)
                .append_pair("scope", SCOPES);
            if let Some(redirect_uri) = &self.options.redirect_uri {
                query.append_pair("redirect_uri", redirect_uri.as_str());
            }
        }
        url
    }
    async fn exchange_code(&self, code: &str) -> Result<AccessToken> {
        let url = &self.options.token_url;
        let mut form = vec![
            ("grant_type", "authorization_code".to_owned()),
            ("client_id", self.options.client_id.clone()),
            (
                "client_secret",
                self.options.client_secret.expose_secret().to_owned(),
            ),
            ("code", code.to_owned()),
        ];
        if let Some(redirect_uri) = &self.options.redirect_uri {
            form.push(("redirect_uri", redirect_uri.to_string()));
        }
        let rsp = self
            .client
            .post(url.clone())
            .header(ACCEPT, "application/json")
            .form(&form)
            .send()
            .await
            .context(RequestSnafu { url: url.clone() })?;
        let status = rsp.status();
        if status.is_server_error() || status.is_informational() || status.is_redirection() {
            return StatusSnafu {
                url: url.clone(),
                status,
            }
            .fail();
        }
        let body = rsp.json::<TokenRsp>().await;
        match (status.is_client_error(), body) {
            (false, Ok(TokenRsp::Token { access_token })) => {
                debug!("Exchanged an authorization code for an access token");
                Ok(AccessToken::new(access_token))
            }
            (_, Ok(TokenRsp::Refused {
                error,
                error_description,
            })) => OAuth2RequestSnafu {
                error,
                description: error_description,
            }
            .fail(),
            (true, _) => OAuth2RequestSnafu {
                error: status.to_string(),
                description: None,
            }
            .fail(),
            (false, Err(err)) => Err(err).context(DecodeSnafu { url: url.clone() }),
        }
    }
    async fn user(&self, token: &AccessToken) -> Result<GithubUser> {
        self.get(&self.user_url, token).await
    }
    async fn emails(&self, token: &AccessToken) -> Result<Vec<GithubEmail>> {
        self.get(&self.emails_url, token).await
    }
}
