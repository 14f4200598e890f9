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

//! # newsfeed integration tests against the in-memory backends
//!
//! Every scenario gets its own store, so these can run in parallel.

use std::{fmt::Display, io, sync::Arc};

use common::{Configuration, Test};

use itertools::Itertools;
use libtest_mimic::{Arguments, Trial};
use snafu::prelude::*;
use tokio::runtime::Runtime;
use tracing_subscriber::{EnvFilter, Registry, fmt, layer::SubscriberExt};

use newsfeed::memory::{MemoryStore, MemoryTasks};
use newsfeed_test::Backends;

#[macro_use]
mod common;

#[derive(Snafu)]
enum Error {
    #[snafu(display("Error obtaining test configuration: {source}"))]
    Configuration { source: common::Error },
    #[snafu(display("Failed to parse RUST_LOG: {source}"))]
    Filter {
        source: tracing_subscriber::filter::FromEnvError,
    },
    #[snafu(display("Failed to build a tokio runtime: {source}"))]
    Runtime { source: std::io::Error },
    #[snafu(display("Failed to set the global tracing subscriber: {source}"))]
    SetGlobalDefault {
        source: tracing::subscriber::SetGlobalDefaultError,
    },
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self, f)
    }
}

type Result<T> = std::result::Result<T, Error>;

register_scenarios!();

fn main() -> Result<()> {
    // libtest-mimic wants synchronous test functions; build the runtime ourselves so each can
    // `block_on` it.
    let rt = Arc::new(Runtime::new().context(RuntimeSnafu)?);

    // We can't add command-line arguments, so configuration comes via the environment:
    let config = Configuration::new().context(ConfigurationSnafu)?;

    if config.logging {
        let filter = EnvFilter::builder()
            .with_default_directive(config.log_level.into())
            .from_env()
            .context(FilterSnafu)?;
        tracing::subscriber::set_global_default(
            Registry::default()
                .with(fmt::Layer::default().compact().with_writer(io::stdout))
                .with(filter),
        )
        .context(SetGlobalDefaultSnafu)?;
    }

    let args = Arguments::from_args();

    let conclusion = libtest_mimic::run(
        &args,
        inventory::iter::<Test>
            .into_iter()
            .sorted_by_key(|t| t.name)
            .map(|test| {
                Trial::test(test.name, {
                    let rt = rt.clone();
                    move || {
                        let backends = Backends {
                            storage: Arc::new(MemoryStore::new()),
                            tasks: Arc::new(MemoryTasks::new()),
                        };
                        rt.block_on((test.test_fn)(backends))
                    }
                })
            })
            .collect(),
    );

    conclusion.exit();
}
