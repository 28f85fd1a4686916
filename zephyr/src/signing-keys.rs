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

//! # zephyr Signing Keys
//!
//! zephyr sessions are JWTs signed with HMAC-SHA256. This module provides a way to keep the signing
//! keys in memory securely, & to version & rotate them.
//!
//! The set of supported keys is read from configuration at startup:
//!
//! ```toml
//! [session.signing-keys]
//! "keyid:2025-02-12" = [1, 2, 3, 4, ..., 64] # Keys must be 64 octets in length
//! "keyid:2025-02-15" = [65, 66, 67,..., 128]
//! ```
//!
//! Versions are compared lexicographically and the greatest one signs new sessions. Each session
//! token names the key that signed it in its header, so sessions signed under an older key keep
//! verifying until that key is removed from configuration. To rotate, add a newer key & SIGHUP the
//! daemon; once every session signed under the old key has expired, remove it. Removing a key
//! early simply signs everyone holding a session under it out.

use std::{collections::BTreeMap, fmt::Display, str::FromStr};

use lazy_static::lazy_static;
use rand::{RngCore, rngs::OsRng};
use regex::Regex;
use serde::Deserialize;
use snafu::{Backtrace, prelude::*};

use crate::util::Key;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to recognize {text} as a KeyId"))]
    KeyId { text: String, backtrace: Backtrace },
    #[snafu(display("No signing key available"))]
    NoKey { backtrace: Backtrace },
    #[snafu(display("Signing keys must be 64 octets in length"))]
    SigningKey { backtrace: Backtrace },
}

type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             KeyId                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

lazy_static! {
    static ref KEY_ID : Regex = Regex::new("^keyid:[-0-9a-zA-Z]+$").unwrap(/* known good */);
}

#[derive(Clone, Debug, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct KeyId(String);

impl KeyId {
    pub fn new(s: &str) -> Result<KeyId> {
        if KEY_ID.find(s).is_none() {
            KeyIdSnafu { text: s.to_owned() }.fail()
        } else {
            Ok(KeyId(s.to_owned()))
        }
    }
}

// Refuse malformed key ids at config-parse time, rather than at first use
impl<'de> Deserialize<'de> for KeyId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = <String as Deserialize>::deserialize(deserializer)?;
        KeyId::new(&s).map_err(|err| <D::Error as serde::de::Error>::custom(format!("{err}")))
    }
}

impl Display for KeyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for KeyId {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        KeyId::new(s)
    }
}

impl AsRef<str> for KeyId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           SigningKey                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A refined type enforcing a key length (of 64 octets)
#[derive(Clone, Debug)]
pub struct SigningKey(Key);

impl SigningKey {
    pub fn new(b: Vec<u8>) -> Result<SigningKey> {
        if b.len() == 64 {
            Ok(SigningKey(b.into()))
        } else {
            SigningKeySnafu.fail()
        }
    }
}

impl<'de> Deserialize<'de> for SigningKey {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let key = <Key as Deserialize>::deserialize(deserializer)?;
        if key.len() == 64 {
            Ok(SigningKey(key))
        } else {
            Err(<D::Error as serde::de::Error>::custom(
                "signing keys must be 64 octets in length",
            ))
        }
    }
}

impl Default for SigningKey {
    fn default() -> Self {
        let mut bytes: Vec<u8> = vec![0; 64];
        OsRng.fill_bytes(&mut bytes);
        SigningKey(bytes.into())
    }
}

impl AsRef<Key> for SigningKey {
    fn as_ref(&self) -> &Key {
        &self.0
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          SigningKeys                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, Deserialize)]
#[serde(transparent)]
pub struct SigningKeys {
    keys: BTreeMap<KeyId, SigningKey>,
}

impl SigningKeys {
    /// Retrieve the current (i.e. the most recent) SigningKey
    pub fn current(&self) -> Result<(KeyId, SigningKey)> {
        let (key, value) = self.keys.last_key_value().context(NoKeySnafu)?;
        Ok((key.clone(), value.clone()))
    }
    /// Retrieve a signing key by version
    pub fn find_by_version(&self, keyid: &KeyId) -> Result<SigningKey> {
        Ok(self.keys.get(keyid).context(NoKeySnafu)?.clone())
    }
}

/// A single, random, key: sessions won't survive a restart, which is fine for development
impl Default for SigningKeys {
    fn default() -> Self {
        SigningKeys {
            keys: BTreeMap::from_iter(vec![(
                KeyId(chrono::Local::now().format("keyid:%Y%m%d").to_string()),
                SigningKey::default(),
            )]),
        }
    }
}

impl<const N: usize> From<[(KeyId, SigningKey); N]> for SigningKeys {
    fn from(value: [(KeyId, SigningKey); N]) -> Self {
        Self {
            keys: BTreeMap::from(value),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn newest_key_is_current() {
        let older = KeyId::new("keyid:2025-02-12").unwrap();
        let newer = KeyId::new("keyid:2025-02-15").unwrap();
        let keys = SigningKeys::from([
            (newer.clone(), SigningKey::default()),
            (older.clone(), SigningKey::default()),
        ]);
        assert_eq!(keys.current().unwrap().0, newer);
        assert!(keys.find_by_version(&older).is_ok());
        assert!(
            keys.find_by_version(&KeyId::new("keyid:1999").unwrap())
                .is_err()
        );
    }

    #[test]
    fn key_ids_and_lengths_are_checked() {
        assert!(KeyId::new("2025-02-12").is_err());
        assert!(KeyId::new("keyid:2025 02 12").is_err());
        assert!(SigningKey::new(vec![0; 63]).is_err());
        assert!(SigningKey::new(vec![0; 64]).is_ok());
    }

    #[test]
    fn keys_parse_from_toml() {
        let text = format!(
            "\"keyid:20250101\" = [{}]",
            std::iter::repeat_n("7", 64).collect::<Vec<_>>().join(", ")
        );
        let keys: SigningKeys = toml::from_str(&text).unwrap();
        assert_eq!(keys.current().unwrap().0.as_ref(), "keyid:20250101");

        assert!(toml::from_str::<SigningKeys>("\"keyid:20250101\" = [1, 2, 3]").is_err());
    }
}
