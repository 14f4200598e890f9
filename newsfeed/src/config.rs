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

//! # config
//!
//! Tunables shared across the library. The daemon reads these from the `[settings]` table of its
//! configuration file; tests generally build them by hand.

use std::time::Duration;

use serde::Deserialize;

/// Production or test
///
/// In test mode, table names are prefixed with `test_` & tables may be dropped. Outside of test
/// mode, dropping a table is refused.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    Production,
    Test,
}

impl ExecutionMode {
    pub fn table_name(&self, base: &str) -> String {
        match self {
            ExecutionMode::Production => base.to_owned(),
            ExecutionMode::Test => format!("test_{}", base),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct Settings {
    /// Maximum number of entries cached per subject
    #[serde(rename = "list-capacity")]
    pub list_capacity: usize,
    /// Lifetime of a cached list, measured from the moment it was loaded
    #[serde(rename = "list-ttl")]
    pub list_ttl: Duration,
    /// Number of followers handled by a single fan-out batch task
    #[serde(rename = "fanout-batch-size")]
    pub fanout_batch_size: usize,
    #[serde(rename = "page-size")]
    pub page_size: usize,
    /// Upper bound on any single store or cache round trip
    #[serde(rename = "io-timeout")]
    pub io_timeout: Duration,
    #[serde(default)]
    pub mode: ExecutionMode,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            list_capacity: 200,
            list_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            fanout_batch_size: 1000,
            page_size: 20,
            io_timeout: Duration::from_secs(5),
            mode: ExecutionMode::Production,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse() {
        let settings: Settings = toml::from_str(
            r#"
list-capacity = 5
list-ttl = { secs = 60, nanos = 0 }
fanout-batch-size = 3
page-size = 2
io-timeout = { secs = 1, nanos = 0 }
mode = "test"
"#,
        )
        .unwrap();
        assert_eq!(settings.list_capacity, 5);
        assert_eq!(settings.list_ttl, Duration::from_secs(60));
        assert_eq!(settings.mode, ExecutionMode::Test);
        assert_eq!(settings.mode.table_name("newsfeeds"), "test_newsfeeds");
        assert_eq!(
            ExecutionMode::Production.table_name("newsfeeds"),
            "newsfeeds"
        );
    }
}
