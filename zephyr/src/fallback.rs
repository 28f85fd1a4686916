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

//! # Fallback policies
//!
//! The cache & counters must never fail a request because the key-value store is down: every
//! operation has a safe answer to give instead. Rather than scatter `match ... Err(_) => 0` through
//! the code, each operation declares its policy up-front as a `const` [Fallback]:
//!
//! ```ignore
//! const GET_VIEWS: Fallback<u64> = Fallback::new("views.get", Level::Error, || 0);
//! // ...
//! GET_VIEWS.recover(self.read(post).await, &self.instruments)
//! ```
//!
//! so the full table of degraded behaviour can be read off the top of each module.

use std::fmt::Display;

use opentelemetry::KeyValue;
use tracing::{error, warn};

use crate::{
    counter_add,
    metrics::{self, Instruments, Sort},
};

inventory::submit! { metrics::Registration::new("cache.fallbacks", Sort::IntegralCounter) }

/// How loudly to complain when falling back
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Level {
    Error,
    Warn,
    Silent,
}

/// A declared fallback policy for a single cache operation
#[derive(Clone, Copy, Debug)]
pub struct Fallback<T: 'static> {
    operation: &'static str,
    level: Level,
    default: fn() -> T,
}

impl<T> Fallback<T> {
    pub const fn new(operation: &'static str, level: Level, default: fn() -> T) -> Fallback<T> {
        Fallback {
            operation,
            level,
            default,
        }
    }
    pub fn operation(&self) -> &'static str {
        self.operation
    }
    /// Log & count a failure of this operation, without producing the default
    pub fn note<E: Display>(&self, err: &E, instruments: &Instruments) {
        match self.level {
            Level::Error => error!(operation = self.operation, "{err}; falling back"),
            Level::Warn => warn!(operation = self.operation, "{err}; falling back"),
            Level::Silent => (),
        }
        counter_add!(
            instruments,
            "cache.fallbacks",
            1,
            &[KeyValue::new("operation", self.operation)]
        );
    }
    /// Yield the success value, or (having noted the failure) this policy's default
    pub fn recover<E: Display>(
        &self,
        result: std::result::Result<T, E>,
        instruments: &Instruments,
    ) -> T {
        match result {
            Ok(t) => t,
            Err(err) => {
                self.note(&err, instruments);
                (self.default)()
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const ANSWER: Fallback<u64> = Fallback::new("test.answer", Level::Silent, || 42);

    #[test]
    fn recover_yields_the_declared_default() {
        let instruments = Instruments::new("zephyr");
        assert_eq!(ANSWER.recover(Ok::<u64, String>(7), &instruments), 7);
        assert_eq!(
            ANSWER.recover(Err::<u64, String>("boom".to_owned()), &instruments),
            42
        );
        assert_eq!(ANSWER.operation(), "test.answer");
    }
}
