// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of newsfeed.
//
// newsfeed is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// newsfeed is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with newsfeed.  If not,
// see <http://www.gnu.org/licenses/>.

//! # newsfeed metrics
//!
//! newsfeed uses [OpenTelemetry] to collect metrics. OTel would have us build each instrument once
//! & re-use it, which raises the question of where to keep them all. Rather than a field per
//! instrument on some state type (or a central list of names), each module registers the metrics
//! it records where it records them:
//!
//! [OpenTelemetry]: https://docs.rs/opentelemetry/latest/opentelemetry/index.html
//!
//! ```ignore
//! inventory::submit! { metrics::Registration::new("cache.list.hits", Sort::IntegralCounter) }
//! // ...
//! counter_add!(self.instruments, "cache.list.hits", 1, &[]);
//! ```
//!
//! [Instruments::new] walks the [inventory] of registrations & builds every instrument up-front,
//! so that recording doesn't need `&mut self` & an [Instruments] can live in an `Arc`.
//!
//! Recording against a name that wasn't registered (or was registered as a different sort of
//! instrument) is a logic error; it's logged, and the measurement dropped. The daemon calls
//! [check_metric_registrations] at startup to catch names registered twice.

use std::collections::{HashMap, HashSet, hash_map::Entry};

use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Gauge},
};
use snafu::prelude::*;
use tracing::error;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("The metric name {name} was registered more than once"))]
    Duplicate { name: String },
}

/// Instrument type
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Sort {
    /// `Counter<u64>`
    IntegralCounter,
    /// `Gauge<f64>`
    FloatGauge,
    /// `Gauge<u64>`
    IntegralGauge,
}

/// A metric name & its instrument type
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

/// Verify that no metric name has been registered twice
pub fn check_metric_registrations() -> Result<(), Error> {
    let mut names: HashSet<&'static str> = HashSet::new();
    inventory::iter::<Registration>
        .into_iter()
        .try_for_each(|reg| {
            ensure!(names.insert(reg.name()), DuplicateSnafu { name: reg.name() });
            Ok(())
        })
}

enum Instrument {
    CounterU64(Counter<u64>),
    GaugeF64(Gauge<f64>),
    GaugeU64(Gauge<u64>),
}

/// Container for OTel instruments
pub struct Instruments {
    meter: opentelemetry::metrics::Meter,
    map: HashMap<&'static str, Instrument>,
}

impl Instruments {
    pub fn new(prefix: &'static str) -> Instruments {
        let mut map = HashMap::new();
        let meter = global::meter(prefix);
        inventory::iter::<Registration>.into_iter().for_each(|reg| {
            match map.entry(reg.name()) {
                // First one wins; `check_metric_registrations()` reports the clash
                Entry::Occupied(_) => (),
                Entry::Vacant(vacant) => {
                    vacant.insert(match reg.sort() {
                        Sort::IntegralCounter => {
                            Instrument::CounterU64(meter.u64_counter(reg.name()).build())
                        }
                        Sort::FloatGauge => {
                            Instrument::GaugeF64(meter.f64_gauge(reg.name()).build())
                        }
                        Sort::IntegralGauge => {
                            Instrument::GaugeU64(meter.u64_gauge(reg.name()).build())
                        }
                    });
                }
            }
        });
        Instruments { meter, map }
    }
    pub fn meter(&self) -> &opentelemetry::metrics::Meter {
        &self.meter
    }
    pub fn add(&self, name: &str, count: u64, attributes: &[KeyValue]) {
        match self.map.get(name) {
            Some(Instrument::CounterU64(c)) => c.add(count, attributes),
            _ => error!("{} does not name a counter", name),
        }
    }
    pub fn recordf(&self, name: &str, value: f64, attributes: &[KeyValue]) {
        match self.map.get(name) {
            Some(Instrument::GaugeF64(g)) => g.record(value, attributes),
            _ => error!("{} does not name a floating-point gauge", name),
        }
    }
    pub fn recordu(&self, name: &str, value: u64, attributes: &[KeyValue]) {
        match self.map.get(name) {
            Some(Instrument::GaugeU64(g)) => g.record(value, attributes),
            _ => error!("{} does not name an integral gauge", name),
        }
    }
    pub fn is_registered(&self, name: &str) -> bool {
        self.map.contains_key(name)
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
