// Copyright (C) 2024-2025 Michael Herstine <sp1ff@pobox.com>
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

//! # zephyr metrics
//!
//! zephyr uses [OpenTelemetry] to collect & export metrics. OTel asks us to re-use instruments
//! rather than re-creating them on each use, which raises the question of where to keep them. I'd
//! rather not grow a field on the application state for every counter, nor maintain a centralized
//! list of metric names that every module has to edit.
//!
//! [OpenTelemetry]: https://docs.rs/opentelemetry/latest/opentelemetry/index.html
//!
//! Instead, each module "registers" the metrics it uses with David Tolnay's [inventory] crate at
//! the collection site:
//!
//! ```ignore
//! inventory::submit! {
//!     metrics::Registration::new("oauth.callback.sign-ins", Sort::IntegralCounter)
//! }
//! // ...
//! async fn callback(/* ... */) {
//!     // ...
//!     counter_add!(state.instruments, "oauth.callback.sign-ins", 1, &[]);
//! }
//! ```
//!
//! An [Instruments] instance built once at startup walks the inventory, checks for name clashes &
//! pre-builds every instrument. `counter_add!` looks the instrument up by name at runtime.
//!
//! Looking-up a name that was never registered (or that names an instrument of the wrong sort) is
//! a logic error, and panics. That's the convention for errors that a richer type system would
//! catch at compile time, but it does mean a typo in a little-used code path is a time bomb; keep
//! metric names in `const`s where they're used more than once.

use std::collections::{HashMap, HashSet, hash_map::Entry};

use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Gauge},
};

/// Instrument type
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Sort {
    /// Corresponds to `Counter<u64>`
    IntegralCounter,
    /// `Gauge<u64>`
    IntegralGauge,
}

/// The type of thing being inventoried
///
/// Register a metric by name & type using
///
/// ```ignore
/// inventory::submit!{metrics::Registration::new("views.increments", Sort::IntegralCounter)}
/// ```
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Registration {
    name: &'static str,
    sort: Sort,
}

impl Registration {
    pub const fn new(name: &'static str, sort: Sort) -> Registration {
        Registration { name, sort }
    }
    pub fn name(&self) -> &'static str {
        self.name
    }
    pub fn sort(&self) -> Sort {
        self.sort
    }
}

inventory::collect!(Registration);

/// Panic if any metric name has been registered twice
///
/// Call this early in process startup; [Instruments::new] will also catch clashes, but this is
/// cheap enough to run before anything else has been set up.
pub fn check_metric_registrations() {
    let mut names: HashSet<&'static str> = HashSet::new();
    IntoIterator::into_iter(inventory::iter::<Registration>).for_each(|reg| {
        if !names.insert(reg.name()) {
            panic!("The metric name {} was registered twice", reg.name());
        }
    });
}

enum Instrument {
    CounterU64(Counter<u64>),
    GaugeU64(Gauge<u64>),
}

/// Container for OTel instruments
pub struct Instruments {
    meter: opentelemetry::metrics::Meter,
    map: HashMap<&'static str, Instrument>,
}

impl Instruments {
    pub fn new(prefix: &'static str) -> Instruments {
        Instruments::with_meter(global::meter(prefix))
    }
    /// Build every registered instrument from `meter` rather than the global provider's
    pub fn with_meter(meter: opentelemetry::metrics::Meter) -> Instruments {
        let mut m: HashMap<&'static str, Instrument> = HashMap::new();
        // Building everything up-front means `add` & `record` only need `&self`, so an instance
        // can live in an `Arc`.
        IntoIterator::into_iter(inventory::iter::<Registration>).for_each(|reg| {
            let name = reg.name();
            match m.entry(name) {
                Entry::Occupied(_) => panic!("The metric name {} was used twice", name),
                Entry::Vacant(vacant_entry) => {
                    vacant_entry.insert(match reg.sort() {
                        Sort::IntegralCounter => {
                            Instrument::CounterU64(meter.u64_counter(name).build())
                        }
                        Sort::IntegralGauge => Instrument::GaugeU64(meter.u64_gauge(name).build()),
                    });
                }
            }
        });

        Instruments { meter, map: m }
    }
    pub fn meter(&self) -> &opentelemetry::metrics::Meter {
        &self.meter
    }
    // panics if `name` doesn't name a counter
    pub fn add(&self, name: &str, count: u64, attributes: &[KeyValue]) {
        if let Some(Instrument::CounterU64(c)) = self.map.get(name) {
            c.add(count, attributes);
        } else {
            panic!("{} does not name a counter", name);
        }
    }
    // panics if `name` doesn't name a gauge
    pub fn recordu(&self, name: &str, value: u64, attributes: &[KeyValue]) {
        if let Some(Instrument::GaugeU64(g)) = self.map.get(name) {
            g.record(value, attributes);
        } else {
            panic!("{} does not name a gauge", name);
        }
    }
}

#[macro_export]
macro_rules! counter_add {
    ($instr:expr, $name:expr, $count:expr, $attrs:expr) => {
        $instr.add($name, $count, $attrs);
    };
}

#[macro_export]
macro_rules! gauge_setu {
    ($instr:expr, $name:expr, $value:expr, $attrs:expr) => {
        $instr.recordu($name, $value, $attrs);
    };
}
