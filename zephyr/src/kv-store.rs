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

//! # The zephyr key-value store
//!
//! zephyr caches derived data (trending topics) & keeps counters (post views) in a key-value
//! store. In production that's Redis; in development & tests it's an in-process map. Both sit
//! behind the [Store] trait, which exposes exactly the handful of commands zephyr needs.
//!
//! The interesting operation is [Store::pipeline]: a batch of [Command]s submitted in order on a
//! single connection. The store applies them in submission order, but the batch is *not* a
//! transaction: if the store fails part-way through, some commands may have been applied & others
//! not. Callers that care (the trending cache) accept this.
//!
//! The Redis handle wraps a [ConnectionManager], which transparently reconnects (with bounded,
//! exponential backoff) on connection loss. It's cheap to clone; clones share the underlying
//! multiplexed connection. The manager itself is created lazily, on the first command, so an
//! unreachable Redis never keeps the daemon from starting (or reloading).

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use redis::{
    AsyncCommands, Client, Pipeline, Value,
    aio::{ConnectionManager, ConnectionManagerConfig},
};
use snafu::{Backtrace, prelude::*};
use tokio::{sync::OnceCell, time::Instant};
use tracing::{debug, info, warn};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to connect to Redis at {url}: {source}"))]
    Connect {
        url: String,
        source: redis::RedisError,
        backtrace: Backtrace,
    },
    #[snafu(display("Not retrying the connection to Redis at {url} yet"))]
    BackingOff { url: String, backtrace: Backtrace },
    #[snafu(display("Timed out connecting to Redis at {url}"))]
    ConnectTimeout { url: String, backtrace: Backtrace },
    #[snafu(display("Redis command failed: {source}"))]
    Command {
        source: redis::RedisError,
        backtrace: Backtrace,
    },
    #[snafu(display("{key} holds a value that is not an integer"))]
    NotAnInteger { key: String, backtrace: Backtrace },
    #[snafu(display("Redis returned a reply zephyr doesn't understand: {reply}"))]
    UnexpectedReply { reply: String, backtrace: Backtrace },
    #[cfg(test)]
    #[snafu(display("The store is unavailable for {key}"))]
    Unavailable { key: String, backtrace: Backtrace },
    #[snafu(display("{key} holds a value of the wrong type"))]
    WrongType { key: String, backtrace: Backtrace },
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       commands & replies                                       //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A single key-value store command, for use in a [pipeline](Store::pipeline)
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Command {
    Get { key: String },
    /// Set `key` to `value`, expiring after `ttl` seconds
    SetEx { key: String, value: String, ttl: u64 },
    Del { key: String },
    Incr { key: String },
    SAdd { key: String, member: String },
}

impl Command {
    pub fn get(key: impl Into<String>) -> Command {
        Command::Get { key: key.into() }
    }
    pub fn set_ex(key: impl Into<String>, value: impl Into<String>, ttl: u64) -> Command {
        Command::SetEx {
            key: key.into(),
            value: value.into(),
            ttl,
        }
    }
    pub fn del(key: impl Into<String>) -> Command {
        Command::Del { key: key.into() }
    }
    pub fn incr(key: impl Into<String>) -> Command {
        Command::Incr { key: key.into() }
    }
    pub fn sadd(key: impl Into<String>, member: impl Into<String>) -> Command {
        Command::SAdd {
            key: key.into(),
            member: member.into(),
        }
    }
    pub fn key(&self) -> &str {
        match self {
            Command::Get { key }
            | Command::SetEx { key, .. }
            | Command::Del { key }
            | Command::Incr { key }
            | Command::SAdd { key, .. } => key,
        }
    }
}

/// The store's reply to a single [Command]
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Reply {
    Nil,
    Okay,
    Int(i64),
    Text(String),
}

impl Reply {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Reply::Int(n) => Some(*n),
            Reply::Text(s) => s.parse::<i64>().ok(),
            _ => None,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          Store trait                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[async_trait]
pub trait Store: Send + Sync {
    /// Read a textual value; `None` means the key is absent (or expired)
    async fn get(&self, key: &str) -> Result<Option<String>>;
    /// Test set membership
    async fn sismember(&self, key: &str, member: &str) -> Result<bool>;
    /// Submit `commands` as a single, ordered, non-transactional batch; on success, return one
    /// [Reply] per [Command], in order
    async fn pipeline(&self, commands: &[Command]) -> Result<Vec<Reply>>;
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             Redis                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Connection parameters for [Redis]
#[derive(Clone, Debug)]
pub struct RedisOptions {
    /// Time allowed to establish a connection
    pub connect_timeout: Duration,
    /// Time allowed for any one command (or pipeline) to complete
    pub response_timeout: Duration,
    /// Reconnection attempts before a command fails
    pub retries: usize,
}

impl Default for RedisOptions {
    fn default() -> Self {
        RedisOptions {
            connect_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(3),
            retries: 2,
        }
    }
}

/// A [Store] backed by Redis
///
/// Construction only validates the URL; the connection is made on first use. Until that succeeds,
/// commands fail (and are answered by the callers' fallbacks). After a failed attempt, commands
/// fail immediately for `connect_timeout` before the next attempt is made.
#[derive(Clone)]
pub struct Redis {
    client: Client,
    url: String,
    options: RedisOptions,
    conn: Arc<OnceCell<ConnectionManager>>,
    failed_at: Arc<Mutex<Option<Instant>>>,
}

impl Redis {
    pub fn new(url: &str, options: &RedisOptions) -> Result<Redis> {
        let client = Client::open(url).context(ConnectSnafu { url })?;
        Ok(Redis {
            client,
            url: url.to_owned(),
            options: options.clone(),
            conn: Arc::new(OnceCell::new()),
            failed_at: Arc::new(Mutex::new(None)),
        })
    }
    async fn connect(&self) -> Result<ConnectionManager> {
        let config = ConnectionManagerConfig::new()
            .set_number_of_retries(self.options.retries)
            .set_connection_timeout(self.options.connect_timeout)
            .set_response_timeout(self.options.response_timeout);
        let conn = tokio::time::timeout(
            self.options.connect_timeout,
            self.client.get_connection_manager_with_config(config),
        )
        .await
        .ok()
        .context(ConnectTimeoutSnafu { url: &self.url })?
        .context(ConnectSnafu { url: &self.url })?;
        info!("Connected to Redis at {}", self.url);
        Ok(conn)
    }
    async fn connection(&self) -> Result<ConnectionManager> {
        if let Some(conn) = self.conn.get() {
            return Ok(conn.clone());
        }
        let failed_at = *self.failed_at.lock().unwrap_or_else(|err| err.into_inner());
        if let Some(at) = failed_at {
            ensure!(
                at.elapsed() >= self.options.connect_timeout,
                BackingOffSnafu { url: &self.url }
            );
        }
        match self.conn.get_or_try_init(|| self.connect()).await {
            Ok(conn) => Ok(conn.clone()),
            Err(err) => {
                warn!("{err}");
                let mut failed_at = self.failed_at.lock().unwrap_or_else(|err| err.into_inner());
                *failed_at = Some(Instant::now());
                Err(err)
            }
        }
    }
}

fn to_reply(value: Value) -> Result<Reply> {
    match value {
        Value::Nil => Ok(Reply::Nil),
        Value::Okay => Ok(Reply::Okay),
        Value::Int(n) => Ok(Reply::Int(n)),
        Value::SimpleString(s) => Ok(Reply::Text(s)),
        Value::BulkString(bytes) => match String::from_utf8(bytes) {
            Ok(s) => Ok(Reply::Text(s)),
            Err(err) => UnexpectedReplySnafu {
                reply: format!("{:?}", err.as_bytes()),
            }
            .fail(),
        },
        other => UnexpectedReplySnafu {
            reply: format!("{other:?}"),
        }
        .fail(),
    }
}

#[async_trait]
impl Store for Redis {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection().await?;
        let value: Option<String> = conn.get(key).await.context(CommandSnafu)?;
        Ok(value)
    }
    async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.connection().await?;
        let member: bool = conn.sismember(key, member).await.context(CommandSnafu)?;
        Ok(member)
    }
    async fn pipeline(&self, commands: &[Command]) -> Result<Vec<Reply>> {
        let mut pipe = Pipeline::new();
        for command in commands {
            match command {
                Command::Get { key } => pipe.get(key),
                Command::SetEx { key, value, ttl } => pipe.set_ex(key, value, *ttl),
                Command::Del { key } => pipe.del(key),
                Command::Incr { key } => pipe.incr(key, 1),
                Command::SAdd { key, member } => pipe.sadd(key, member),
            };
        }
        let mut conn = self.connection().await?;
        let values = pipe
            .query_async::<Vec<Value>>(&mut conn)
            .await
            .context(CommandSnafu)?;
        debug!("Pipelined {} commands", commands.len());
        values.into_iter().map(to_reply).collect()
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             Memory                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug)]
enum Datum {
    Text(String),
    Set(HashSet<String>),
}

#[derive(Clone, Debug)]
struct Entry {
    datum: Datum,
    expires: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires.is_none_or(|at| now < at)
    }
}

/// An in-process [Store], honouring expiry
///
/// Suitable for development & tests; obviously not shared between processes.
#[derive(Debug, Default)]
pub struct Memory {
    map: Mutex<HashMap<String, Entry>>,
}

impl Memory {
    pub fn new() -> Memory {
        Memory::default()
    }
    fn apply(map: &mut HashMap<String, Entry>, command: &Command, now: Instant) -> Result<Reply> {
        // Lazily expire the key we're about to touch
        let key = command.key();
        if map.get(key).is_some_and(|entry| !entry.is_live(now)) {
            map.remove(key);
        }
        match command {
            Command::Get { key } => match map.get(key) {
                None => Ok(Reply::Nil),
                Some(Entry {
                    datum: Datum::Text(s),
                    ..
                }) => Ok(Reply::Text(s.clone())),
                Some(_) => WrongTypeSnafu { key }.fail(),
            },
            Command::SetEx { key, value, ttl } => {
                map.insert(
                    key.clone(),
                    Entry {
                        datum: Datum::Text(value.clone()),
                        expires: Some(now + Duration::from_secs(*ttl)),
                    },
                );
                Ok(Reply::Okay)
            }
            Command::Del { key } => Ok(Reply::Int(map.remove(key).is_some() as i64)),
            Command::Incr { key } => {
                let entry = map.entry(key.clone()).or_insert(Entry {
                    datum: Datum::Text("0".to_owned()),
                    expires: None,
                });
                match &mut entry.datum {
                    Datum::Text(s) => {
                        let n = s
                            .parse::<i64>()
                            .ok()
                            .and_then(|n| n.checked_add(1))
                            .context(NotAnIntegerSnafu { key })?;
                        *s = n.to_string();
                        Ok(Reply::Int(n))
                    }
                    Datum::Set(_) => WrongTypeSnafu { key }.fail(),
                }
            }
            Command::SAdd { key, member } => {
                let entry = map.entry(key.clone()).or_insert(Entry {
                    datum: Datum::Set(HashSet::new()),
                    expires: None,
                });
                match &mut entry.datum {
                    Datum::Set(set) => Ok(Reply::Int(set.insert(member.clone()) as i64)),
                    Datum::Text(_) => WrongTypeSnafu { key }.fail(),
                }
            }
        }
    }
}

#[async_trait]
impl Store for Memory {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut map = self.map.lock().unwrap_or_else(|err| err.into_inner());
        match Memory::apply(&mut map, &Command::get(key), Instant::now())? {
            Reply::Text(s) => Ok(Some(s)),
            _ => Ok(None),
        }
    }
    async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        let map = self.map.lock().unwrap_or_else(|err| err.into_inner());
        match map.get(key) {
            Some(entry) if entry.is_live(Instant::now()) => match &entry.datum {
                Datum::Set(set) => Ok(set.contains(member)),
                Datum::Text(_) => WrongTypeSnafu { key }.fail(),
            },
            _ => Ok(false),
        }
    }
    async fn pipeline(&self, commands: &[Command]) -> Result<Vec<Reply>> {
        let mut map = self.map.lock().unwrap_or_else(|err| err.into_inner());
        let now = Instant::now();
        commands
            .iter()
            .map(|command| Memory::apply(&mut map, command, now))
            .collect()
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        failure injection                                       //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;

    /// A [Memory] store that can be told to fail operations touching particular keys (or all
    /// operations); counts the pipelines it's been asked to run
    #[derive(Debug, Default)]
    pub struct Flaky {
        pub inner: Memory,
        failing: Mutex<HashSet<String>>,
        everything: AtomicBool,
        pub pipelines: AtomicUsize,
    }

    impl Flaky {
        pub fn new() -> Flaky {
            Flaky::default()
        }
        pub fn fail_key(&self, key: &str) {
            self.failing.lock().unwrap().insert(key.to_owned());
        }
        pub fn fail_everything(&self, fail: bool) {
            self.everything.store(fail, Ordering::SeqCst);
        }
        fn check(&self, key: &str) -> Result<()> {
            if self.everything.load(Ordering::SeqCst) || self.failing.lock().unwrap().contains(key)
            {
                UnavailableSnafu { key }.fail()
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl Store for Flaky {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            self.check(key)?;
            self.inner.get(key).await
        }
        async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
            self.check(key)?;
            self.inner.sismember(key, member).await
        }
        async fn pipeline(&self, commands: &[Command]) -> Result<Vec<Reply>> {
            self.pipelines.fetch_add(1, Ordering::SeqCst);
            for command in commands {
                self.check(command.key())?;
            }
            self.inner.pipeline(commands).await
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn memory_pipelines_apply_in_order() {
        let store = Memory::new();
        let replies = store
            .pipeline(&[
                Command::sadd("seen", "a"),
                Command::incr("count:a"),
                Command::incr("count:a"),
                Command::sadd("seen", "a"),
                Command::get("count:a"),
                Command::set_ex("name", "zephyr", 60),
                Command::del("name"),
                Command::del("name"),
            ])
            .await
            .unwrap();
        assert_eq!(
            replies,
            vec![
                Reply::Int(1),
                Reply::Int(1),
                Reply::Int(2),
                Reply::Int(0),
                Reply::Text("2".to_owned()),
                Reply::Okay,
                Reply::Int(1),
                Reply::Int(0),
            ]
        );
        assert!(store.sismember("seen", "a").await.unwrap());
        assert!(!store.sismember("seen", "b").await.unwrap());
        assert!(!store.sismember("nothing-here", "a").await.unwrap());
        assert_eq!(store.get("name").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn memory_keys_expire() {
        let store = Memory::new();
        store
            .pipeline(&[Command::set_ex("k", "v", 10)])
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_owned()));
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn redis_connects_on_first_use() {
        let options = RedisOptions {
            connect_timeout: Duration::from_millis(250),
            response_timeout: Duration::from_millis(250),
            retries: 0,
        };
        assert!(matches!(
            Redis::new("not a redis url", &options),
            Err(Error::Connect { .. })
        ));

        // Nothing listens on port 1; construction succeeds anyway
        let store = Redis::new("redis://127.0.0.1:1", &options).unwrap();
        let first = tokio::time::timeout(Duration::from_secs(5), store.get("k"))
            .await
            .unwrap();
        assert!(matches!(
            first,
            Err(Error::Connect { .. } | Error::ConnectTimeout { .. })
        ));
        // Subsequent commands fail fast until the back-off elapses
        let second = tokio::time::timeout(Duration::from_millis(50), store.sismember("s", "m"))
            .await
            .unwrap();
        assert!(matches!(second, Err(Error::BackingOff { .. })));
        tokio::time::sleep(Duration::from_millis(300)).await;
        let third = tokio::time::timeout(Duration::from_secs(5), store.pipeline(&[]))
            .await
            .unwrap();
        assert!(matches!(
            third,
            Err(Error::Connect { .. } | Error::ConnectTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn memory_type_errors() {
        let store = Memory::new();
        store.pipeline(&[Command::sadd("s", "x")]).await.unwrap();
        assert!(matches!(
            store.pipeline(&[Command::incr("s")]).await,
            Err(Error::WrongType { .. })
        ));
        assert!(store.get("s").await.is_err());
        store
            .pipeline(&[Command::set_ex("t", "not a number", 60)])
            .await
            .unwrap();
        assert!(matches!(
            store.pipeline(&[Command::incr("t")]).await,
            Err(Error::NotAnInteger { .. })
        ));
    }
}
