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

//! # newsfeed integration tests against ScyllaDB
//!
//! Skipped unless the test configuration names a cluster:
//!
//! ```toml
//! no-setup = true
//! [scylla]
//! hosts = ["localhost:9042"]
//! ```

use std::{fmt::Display, io, sync::Arc};

use common::{Configuration, ScyllaConfig, Test, run};

use itertools::Itertools;
use libtest_mimic::{Arguments, Trial};
use snafu::prelude::*;
use tokio::runtime::Runtime;
use tracing_subscriber::{EnvFilter, Registry, fmt, layer::SubscriberExt};

use newsfeed::scylla::Session;
use newsfeed_test::Backends;

#[macro_use]
mod common;

#[derive(Snafu)]
enum Error {
    #[snafu(display("Failed to run {cmd}: {source}"))]
    Command { cmd: String, source: common::Error },
    #[snafu(display("Error obtaining test configuration: {source}"))]
    Configuration { source: common::Error },
    #[snafu(display("Failed to parse RUST_LOG: {source}"))]
    Filter {
        source: tracing_subscriber::filter::FromEnvError,
    },
    #[snafu(display("Failed to build a tokio runtime: {source}"))]
    Runtime { source: std::io::Error },
    #[snafu(display("Failed to create ScyllaDB session: {source}"))]
    Session { source: newsfeed::scylla::Error },
    #[snafu(display("Failed to set the global tracing subscriber: {source}"))]
    SetGlobalDefault {
        source: tracing::subscriber::SetGlobalDefaultError,
    },
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Command { cmd, source } => {
                write!(f, "Failed to run command {}: {}", cmd, source)
            }
            _ => Display::fmt(&self, f),
        }
    }
}

type Result<T> = std::result::Result<T, Error>;

fn run_command(cmd: &Option<String>) -> Result<()> {
    match cmd {
        Some(cmd) => run(cmd, &[]).context(CommandSnafu { cmd: cmd.clone() }),
        None => Ok(()),
    }
}

register_scenarios!();

fn main() -> Result<()> {
    let rt = Arc::new(Runtime::new().context(RuntimeSnafu)?);

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

    let mut args = Arguments::from_args();
    // The scenarios share one keyspace, so they can't run simultaneously.
    if !matches!(args.test_threads, Some(1)) {
        eprintln!("Overriding --test-threads to 1.");
        args.test_threads = Some(1);
    }

    let tests = inventory::iter::<Test>
        .into_iter()
        .sorted_by_key(|t| t.name)
        .collect::<Vec<_>>();

    let Some(scylla) = config.scylla.clone() else {
        // No cluster configured; report the scenarios as ignored rather than passed.
        libtest_mimic::run(
            &args,
            tests
                .into_iter()
                .map(|test| Trial::test(test.name, || Ok(())).with_ignored_flag(true))
                .collect(),
        )
        .exit();
    };
    let ScyllaConfig {
        hosts,
        credentials,
        keyspace,
        up,
        down,
    } = scylla;

    if !config.no_setup {
        run_command(&up)?;
    }

    let session = Arc::new(
        rt.block_on(Session::new(&hosts, &credentials, &keyspace, 1))
            .context(SessionSnafu)?,
    );

    let conclusion = libtest_mimic::run(
        &args,
        tests
            .into_iter()
            .map(|test| {
                Trial::test(test.name, {
                    let rt = rt.clone();
                    let backends = Backends {
                        storage: session.clone(),
                        tasks: session.clone(),
                    };
                    move || rt.block_on((test.test_fn)(backends))
                })
            })
            .collect(),
    );

    if !config.no_teardown {
        let _ = run_command(&down);
    }

    conclusion.exit();
}
