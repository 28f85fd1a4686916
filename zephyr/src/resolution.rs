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

//! # Account resolution
//!
//! Once GitHub has vouched for an identity, we have to decide what to do with it: attach it to
//! the signed-in account, sign in the account that already has it, refuse, or open a new
//! account. That decision is made here, as a pure function of what we've looked up, so that it
//! can be reasoned about (& tested) without a database or an identity provider in sight. The
//! [oauth](crate::oauth) module carries out the result.
//!
//! Two rules are worth calling out:
//!
//! 1. a GitHub identity already linked to one account is never moved to another
//! 2. we never open a second account for an e-mail address we already have; the holder has to
//!    sign in & link from their settings

use zephyr_shared::UserId;

use crate::entities::{User, UserEmail};

/// Everything [resolve] needs to know
#[derive(Clone, Copy, Debug)]
pub struct Facts<'a> {
    /// The browser started this flow from "link my GitHub account"
    pub linking: bool,
    /// The account named by the session cookie, if any
    pub current: Option<&'a User>,
    /// The account holding the GitHub account's primary e-mail address, if any
    pub by_email: Option<&'a User>,
    /// The account to which the GitHub identity is linked, if any
    pub by_github: Option<&'a User>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Resolution {
    /// Linking requires a session, and there isn't one
    RequireLogin,
    /// The identity belongs to someone else
    LinkedToOther,
    /// Attach the identity to this (the current) account
    Link(UserId),
    /// Someone already has this e-mail address
    EmailExists(UserEmail),
    /// Sign in the account that already has this identity
    SignIn(UserId),
    /// Open a new account
    Create,
}

impl Resolution {
    /// Short, stable name for logs & metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::RequireLogin => "require-login",
            Resolution::LinkedToOther => "linked-to-other",
            Resolution::Link(_) => "link",
            Resolution::EmailExists(_) => "email-exists",
            Resolution::SignIn(_) => "sign-in",
            Resolution::Create => "create",
        }
    }
}

pub fn resolve(facts: &Facts<'_>) -> Resolution {
    if facts.linking {
        return match (facts.current, facts.by_github) {
            (None, _) => Resolution::RequireLogin,
            (Some(current), Some(owner)) if owner.id() != current.id() => {
                Resolution::LinkedToOther
            }
            (Some(current), _) => Resolution::Link(*current.id()),
        };
    }

    match (facts.by_email, facts.by_github) {
        (Some(holder), Some(owner)) if holder.id() == owner.id() => {
            Resolution::SignIn(*owner.id())
        }
        // An address on an account with no GitHub identity wins over the identity's owner
        (Some(holder), Some(_)) if holder.github_id().is_none() => {
            Resolution::EmailExists(holder.email().clone())
        }
        (_, Some(owner)) => Resolution::SignIn(*owner.id()),
        (Some(holder), None) => Resolution::EmailExists(holder.email().clone()),
        (None, None) => Resolution::Create,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::entities::GithubId;

    fn user(login: &str, github_id: Option<u64>) -> User {
        let user = User::from_github(
            GithubId::new(github_id.unwrap_or(0)),
            login,
            None,
            &UserEmail::new(&format!("{login}@example.com")).unwrap(),
            None,
        );
        User::from_parts(
            *user.id(),
            user.username().clone(),
            user.display_name().to_owned(),
            user.email().clone(),
            true,
            github_id.map(GithubId::new),
            None,
            *user.created_at(),
        )
    }

    fn facts<'a>(
        linking: bool,
        current: Option<&'a User>,
        by_email: Option<&'a User>,
        by_github: Option<&'a User>,
    ) -> Facts<'a> {
        Facts {
            linking,
            current,
            by_email,
            by_github,
        }
    }

    #[test]
    fn linking() {
        let alice = user("alice", None);
        let bob = user("bob", Some(42));

        assert_eq!(
            resolve(&facts(true, None, None, None)),
            Resolution::RequireLogin
        );
        // Even when the identity's owner could be signed-in instead
        assert_eq!(
            resolve(&facts(true, None, None, Some(&bob))),
            Resolution::RequireLogin
        );
        assert_eq!(
            resolve(&facts(true, Some(&alice), None, Some(&bob))),
            Resolution::LinkedToOther
        );
        assert_eq!(
            resolve(&facts(true, Some(&alice), None, None)),
            Resolution::Link(*alice.id())
        );
        // The GitHub e-mail belonging to someone else doesn't matter when linking
        assert_eq!(
            resolve(&facts(true, Some(&alice), Some(&bob), None)),
            Resolution::Link(*alice.id())
        );
        // Re-linking is idempotent
        assert_eq!(
            resolve(&facts(true, Some(&bob), Some(&bob), Some(&bob))),
            Resolution::Link(*bob.id())
        );
    }

    #[test]
    fn signing_in() {
        let alice = user("alice", Some(7));
        let bob = user("bob", None);
        let carol = user("carol", Some(9));

        assert_eq!(
            resolve(&facts(false, None, Some(&alice), Some(&alice))),
            Resolution::SignIn(*alice.id())
        );
        // GitHub's primary address has since changed to one we've never seen
        assert_eq!(
            resolve(&facts(false, None, None, Some(&alice))),
            Resolution::SignIn(*alice.id())
        );
        // A session for someone else doesn't change the outcome
        assert_eq!(
            resolve(&facts(false, Some(&bob), None, Some(&alice))),
            Resolution::SignIn(*alice.id())
        );

        assert_eq!(
            resolve(&facts(false, None, Some(&bob), None)),
            Resolution::EmailExists(bob.email().clone())
        );
        // The address is on an account linked to a different GitHub identity
        assert_eq!(
            resolve(&facts(false, None, Some(&carol), None)),
            Resolution::EmailExists(carol.email().clone())
        );
        // Conflict is checked before sign-in
        assert_eq!(
            resolve(&facts(false, None, Some(&bob), Some(&alice))),
            Resolution::EmailExists(bob.email().clone())
        );
        // ...but only for an address on an account without a GitHub identity
        assert_eq!(
            resolve(&facts(false, None, Some(&carol), Some(&alice))),
            Resolution::SignIn(*alice.id())
        );

        assert_eq!(resolve(&facts(false, None, None, None)), Resolution::Create);
        assert_eq!(
            resolve(&facts(false, Some(&bob), None, None)),
            Resolution::Create
        );
    }
}
