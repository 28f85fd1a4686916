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

//! # zephyr entities
//!
//! The account model, as far as this service is concerned. Accounts are owned by the persistence
//! layer; this module only provides refined types for their fields & a few constructors.

use std::{fmt::Display, ops::Deref, str::FromStr};

use chrono::{DateTime, Utc};
use email_address::EmailAddress;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use snafu::{Backtrace, prelude::*};

use zephyr_shared::{PostId, UserId, api::MentionedUser};

type StdResult<T, E> = std::result::Result<T, E>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{email} is not a valid e-mail address"))]
    BadEmail { email: String, backtrace: Backtrace },
    #[snafu(display("{text} is not a valid GitHub user id"))]
    BadGithubId { text: String, backtrace: Backtrace },
    #[snafu(display("{name} is not a valid username"))]
    BadUsername { name: String, backtrace: Backtrace },
}

type Result<T> = std::result::Result<T, Error>;

fn mk_serde_de_err<'de, D: serde::Deserializer<'de>>(err: impl std::error::Error) -> D::Error {
    <D::Error as serde::de::Error>::custom(format!("{:?}", err))
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            Username                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

pub const MAX_USERNAME_LENGTH: usize = 64;

lazy_static! {
    static ref USERNAME: Regex = Regex::new("^[a-z0-9][-a-z0-9]*$").unwrap(/* known good */);
}

fn check_username(s: &str) -> bool {
    s.len() <= MAX_USERNAME_LENGTH && USERNAME.is_match(s)
}

/// A refined type representing a zephyr username
///
/// zephyr usernames are lower-case ASCII alphanumerics & '-', may not begin with '-', and are at
/// most sixty-four characters in length. That's more restrictive than GitHub logins, which is
/// why usernames for accounts created through GitHub are derived (see [derive_username]).
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct Username(String);

impl Username {
    pub fn new(name: &str) -> Result<Username> {
        check_username(name)
            .then_some(Username(name.to_owned()))
            .context(BadUsernameSnafu {
                name: name.to_owned(),
            })
    }
}

impl AsRef<str> for Username {
    fn as_ref(&self) -> &str {
        self.deref()
    }
}

impl Deref for Username {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<'de> Deserialize<'de> for Username {
    fn deserialize<D>(deserializer: D) -> StdResult<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        Username::try_from(s).map_err(mk_serde_de_err::<'de, D>)
    }
}

impl Display for Username {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Username {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Username::new(s)
    }
}

impl TryFrom<String> for Username {
    type Error = Error;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if check_username(&s) {
            Ok(Username(s))
        } else {
            BadUsernameSnafu { name: s }.fail()
        }
    }
}

/// Lower-case `text`, collapse every run of non-alphanumerics to a single '-' & trim dashes
fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut pending_dash = false;
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    slug
}

/// Derive a username for a new account from a third-party login
///
/// The result is the slugified `login`, a dash, and the first four hex digits of `id`; the suffix
/// makes collisions between similar logins unlikely (not impossible; the persistence layer
/// still enforces uniqueness).
pub fn derive_username(login: &str, id: &UserId) -> Username {
    let suffix: String = id.to_raw_string().chars().take(4).collect();
    let mut slug = slugify(login);
    slug.truncate(MAX_USERNAME_LENGTH - suffix.len() - 1);
    // truncation can leave a trailing dash
    let slug = slug.trim_end_matches('-');
    let slug = if slug.is_empty() { "user" } else { slug };
    // Safe by construction: `slug` is [a-z0-9] runs joined by single dashes, & `suffix` is hex
    Username(format!("{slug}-{suffix}"))
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           UserEmail                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A refined type representing an e-mail address
///
/// Addresses are lower-cased on construction, so that equality is case-insensitive.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct UserEmail(String);

impl UserEmail {
    pub fn new(email: &str) -> Result<UserEmail> {
        EmailAddress::is_valid(email)
            .then_some(UserEmail(email.to_lowercase()))
            .context(BadEmailSnafu {
                email: email.to_string(),
            })
    }
}

impl AsRef<str> for UserEmail {
    fn as_ref(&self) -> &str {
        self.deref()
    }
}

impl Deref for UserEmail {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<'de> Deserialize<'de> for UserEmail {
    fn deserialize<D>(deserializer: D) -> StdResult<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        UserEmail::new(&s).map_err(mk_serde_de_err::<'de, D>)
    }
}

impl Display for UserEmail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            GithubId                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// GitHub's numeric user id
///
/// Note that this is the id, not the login: logins can be changed, ids can't.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct GithubId(u64);

impl GithubId {
    pub fn new(id: u64) -> GithubId {
        GithubId(id)
    }
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for GithubId {
    fn from(value: u64) -> Self {
        GithubId(value)
    }
}

impl Display for GithubId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for GithubId {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.parse::<u64>()
            .ok()
            .map(GithubId)
            .context(BadGithubIdSnafu { text: s.to_owned() })
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                              User                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A zephyr account
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct User {
    id: UserId,
    username: Username,
    display_name: String,
    email: UserEmail,
    email_verified: bool,
    github_id: Option<GithubId>,
    avatar_url: Option<String>,
    created_at: DateTime<Utc>,
}

impl User {
    /// Build a brand-new account from a GitHub profile
    ///
    /// The display name falls back to the login when the profile has no name, and the e-mail is
    /// taken to be verified since GitHub told us it's the account's primary address.
    pub fn from_github(
        github_id: GithubId,
        login: &str,
        name: Option<&str>,
        email: &UserEmail,
        avatar_url: Option<&str>,
    ) -> User {
        let id = UserId::default();
        User {
            id,
            username: derive_username(login, &id),
            display_name: name
                .filter(|name| !name.trim().is_empty())
                .unwrap_or(login)
                .to_owned(),
            email: email.clone(),
            email_verified: true,
            github_id: Some(github_id),
            avatar_url: avatar_url.map(str::to_owned),
            created_at: Utc::now(),
        }
    }
    /// Re-hydrate an account from storage
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        id: UserId,
        username: Username,
        display_name: String,
        email: UserEmail,
        email_verified: bool,
        github_id: Option<GithubId>,
        avatar_url: Option<String>,
        created_at: DateTime<Utc>,
    ) -> User {
        User {
            id,
            username,
            display_name,
            email,
            email_verified,
            github_id,
            avatar_url,
            created_at,
        }
    }
    pub fn id(&self) -> &UserId {
        &self.id
    }
    pub fn username(&self) -> &Username {
        &self.username
    }
    pub fn display_name(&self) -> &str {
        &self.display_name
    }
    pub fn email(&self) -> &UserEmail {
        &self.email
    }
    pub fn email_verified(&self) -> bool {
        self.email_verified
    }
    pub fn github_id(&self) -> Option<&GithubId> {
        self.github_id.as_ref()
    }
    pub fn avatar_url(&self) -> Option<&str> {
        self.avatar_url.as_deref()
    }
    pub fn created_at(&self) -> &DateTime<Utc> {
        &self.created_at
    }
    /// Attach a GitHub identity to this account
    pub fn link_github(&mut self, github_id: GithubId) {
        self.github_id = Some(github_id);
    }
}

impl From<&User> for MentionedUser {
    fn from(user: &User) -> Self {
        MentionedUser {
            id: *user.id(),
            username: user.username().to_string(),
            display_name: user.display_name().to_owned(),
            avatar_url: user.avatar_url().map(str::to_owned),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                              Post                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Just enough of a post to compute trending topics & to authorize mention edits
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Post {
    pub id: PostId,
    pub author: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

lazy_static! {
    static ref HASHTAG: Regex = Regex::new("#([A-Za-z0-9_]+)").unwrap(/* known good */);
}

impl Post {
    /// The hashtags in this post's content, lower-cased & prefixed with '#', in order of
    /// appearance (duplicates included)
    pub fn hashtags(&self) -> impl Iterator<Item = String> + '_ {
        HASHTAG
            .captures_iter(&self.content)
            .map(|caps| format!("#{}", caps[1].to_lowercase()))
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         Notification                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    Mention,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Mention => "MENTION",
        }
    }
}

/// `issuer` did something involving `recipient` in the context of `post`
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Notification {
    pub recipient: UserId,
    pub issuer: UserId,
    pub post: PostId,
    pub kind: NotificationKind,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn mention(recipient: UserId, issuer: UserId, post: PostId) -> Notification {
        Notification {
            recipient,
            issuer,
            post,
            kind: NotificationKind::Mention,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn usernames() {
        assert!(Username::new("jdoe").is_ok());
        assert!(Username::new("j-doe-1a2b").is_ok());
        assert!(Username::new("7up").is_ok());
        assert!(Username::new("-jdoe").is_err());
        assert!(Username::new("JDoe").is_err());
        assert!(Username::new("j.doe").is_err());
        assert!(Username::new("").is_err());
        assert!(Username::new(&"a".repeat(65)).is_err());
    }

    #[test]
    fn derived_usernames() {
        let id = UserId::new("1a2b3c4d-0000-4000-8000-000000000000").unwrap();
        assert_eq!(derive_username("octocat", &id).as_ref(), "octocat-1a2b");
        assert_eq!(derive_username("Mona_Lisa--Octo", &id).as_ref(), "mona-lisa-octo-1a2b");
        assert_eq!(derive_username("--__--", &id).as_ref(), "user-1a2b");
        let long = derive_username(&"x".repeat(100), &id);
        assert_eq!(long.len(), MAX_USERNAME_LENGTH);
        assert!(Username::new(long.as_ref()).is_ok());
    }

    #[test]
    fn emails_are_case_insensitive() {
        let a = UserEmail::new("Octo.Cat@GitHub.com").unwrap();
        let b = UserEmail::new("octo.cat@github.com").unwrap();
        assert_eq!(a, b);
        assert!(UserEmail::new("not an email").is_err());
    }

    #[test]
    fn new_github_accounts() {
        let email = UserEmail::new("octocat@github.com").unwrap();
        let user = User::from_github(GithubId::new(583231), "octocat", None, &email, None);
        assert_eq!(user.display_name(), "octocat");
        assert!(user.email_verified());
        assert_eq!(user.github_id(), Some(&GithubId::new(583231)));
        assert!(user.username().starts_with("octocat-"));

        let user = User::from_github(
            GithubId::new(583231),
            "octocat",
            Some("The Octocat"),
            &email,
            Some("https://avatars.githubusercontent.com/u/583231"),
        );
        assert_eq!(user.display_name(), "The Octocat");
        assert_eq!(
            user.avatar_url(),
            Some("https://avatars.githubusercontent.com/u/583231")
        );
    }

    #[test]
    fn hashtags() {
        let post = Post {
            id: PostId::default(),
            author: UserId::default(),
            content: "Loving #Rust and #rust-lang, also #tokio_rs! # nope".to_owned(),
            created_at: Utc::now(),
        };
        assert_eq!(
            post.hashtags().collect::<Vec<_>>(),
            vec!["#rust", "#rust", "#tokio_rs"]
        );
    }
}
