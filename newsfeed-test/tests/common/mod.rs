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

//! Test framework code shared by the newsfeed integration test programs

// Not every test program uses every item
#![allow(dead_code)]

use std::{env, fs, future::Future, pin::Pin, process::Command};

use libtest_mimic::Failed;
use serde::Deserialize;
use snafu::{Backtrace, IntoError, prelude::*};
use tap::Pipe;
use tracing::Level;

use newsfeed::util::Credentials;
use newsfeed_test::Backends;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to run {command}; stdout was '{stdout}' & stderr was '{stderr}'."))]
    Command {
        command: String,
        code: Option<i32>,
        stdout: String,
        stderr: String,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to parse {pth}: {source}"))]
    De {
        pth: String,
        source: toml::de::Error,
    },
    #[snafu(display("Failed to read NEWSFEED_TEST_CONFIG: {source}"))]
    Env { source: std::env::VarError },
    #[snafu(display("Failed to execute {command}: {source}"))]
    Process {
        command: String,
        source: std::io::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to read {pth}: {source}"))]
    Read { pth: String, source: std::io::Error },
}

type Result<T> = std::result::Result<T, Error>;

pub fn run(cmd: &str, args: &[&str]) -> Result<()> {
    let output = Command::new(cmd)
        .args(args.iter())
        .output()
        .context(ProcessSnafu {
            command: cmd.to_string(),
        })?;
    if output.status.success() {
        Ok(())
    } else {
        CommandSnafu {
            command: cmd.to_string(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout),
            stderr: String::from_utf8_lossy(&output.stderr),
        }
        .fail()
    }
}

/// Where to find a ScyllaDB cluster
#[derive(Clone, Debug, Deserialize)]
pub struct ScyllaConfig {
    pub hosts: Vec<String>,
    pub credentials: Option<Credentials>,
    #[serde(default = "default_keyspace")]
    pub keyspace: String,
    /// Command to run to bring the cluster up (if `no-setup` is false)
    pub up: Option<String>,
    /// Command to run to take it down (if `no-teardown` is false)
    pub down: Option<String>,
}

fn default_keyspace() -> String {
    "newsfeed_test".to_owned()
}

/// Common test configuration
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Configuration {
    #[serde(rename = "no-setup")]
    pub no_setup: bool,
    #[serde(rename = "no-teardown")]
    pub no_teardown: bool,
    pub logging: bool,
    #[serde(rename = "log-level", with = "level")]
    pub log_level: Level,
    /// Absent means: skip the ScyllaDB tests
    pub scylla: Option<ScyllaConfig>,
}

mod level {
    use serde::{Deserialize, Deserializer};
    use tracing::Level;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Level, D::Error> {
        String::deserialize(deserializer)?
            .parse::<Level>()
            .map_err(serde::de::Error::custom)
    }
}

impl Configuration {
    /// Obtain a [Configuration]
    ///
    /// Check the `NEWSFEED_TEST_CONFIG` environment variable; if defined, attempt to parse a
    /// [Configuration] from the file named therein; else return a default instance.
    pub fn new() -> Result<Configuration> {
        match env::var("NEWSFEED_TEST_CONFIG") {
            Ok(f) => fs::read_to_string(&f)
                .context(ReadSnafu { pth: f.clone() })?
                .pipe(|s| toml::from_str::<Configuration>(&s))
                .context(DeSnafu { pth: f.clone() }),
            Err(env::VarError::NotPresent) => Ok(Configuration::default()),
            Err(err) => Err(EnvSnafu.into_error(err)),
        }
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Configuration {
            no_setup: true,
            no_teardown: true,
            logging: false,
            log_level: Level::INFO,
            scylla: None,
        }
    }
}

pub type TestFuture = Pin<Box<dyn Future<Output = std::result::Result<(), Failed>> + Send>>;

/// A scenario, registered with [inventory] by each test program
#[derive(Debug)]
pub struct Test {
    pub name: &'static str,
    pub test_fn: fn(Backends) -> TestFuture,
}

inventory::collect!(Test);

/// Register every scenario in `newsfeed_test`
///
/// The names carry a numeric prefix so that they sort (and run) in a stable order.
macro_rules! register_scenarios {
    () => {
        inventory::submit!($crate::common::Test {
            name: "010idempotent_upsert",
            test_fn: |b| Box::pin(newsfeed_test::store::idempotent_upsert(b)),
        });
        inventory::submit!($crate::common::Test {
            name: "020prefix_round_trip",
            test_fn: |b| Box::pin(newsfeed_test::store::prefix_round_trip(b)),
        });
        inventory::submit!($crate::common::Test {
            name: "030numeric_order",
            test_fn: |b| Box::pin(newsfeed_test::store::numeric_order(b)),
        });
        inventory::submit!($crate::common::Test {
            name: "040own_post_visible",
            test_fn: |b| Box::pin(newsfeed_test::feeds::own_post_visible(b)),
        });
        inventory::submit!($crate::common::Test {
            name: "050fanout_completeness",
            test_fn: |b| Box::pin(newsfeed_test::feeds::fanout_completeness(b)),
        });
        inventory::submit!($crate::common::Test {
            name: "060cache_capacity",
            test_fn: |b| Box::pin(newsfeed_test::feeds::cache_capacity(b)),
        });
        inventory::submit!($crate::common::Test {
            name: "070paging",
            test_fn: |b| Box::pin(newsfeed_test::feeds::paging(b)),
        });
        inventory::submit!($crate::common::Test {
            name: "080newer_than_unbounded",
            test_fn: |b| Box::pin(newsfeed_test::feeds::newer_than_unbounded(b)),
        });
    };
}
