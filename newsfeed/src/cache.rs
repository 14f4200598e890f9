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

//! # cache
//!
//! The wire-level contract newsfeed requires of its cache: keyed lists of opaque byte strings with
//! per-key expiry, plus integer counters. Think Redis `LPUSH`/`LTRIM`/`LRANGE`/`EXPIRE` &
//! `INCR`/`DECR`.
//!
//! Two operations carry atomicity requirements that implementations must honor:
//!
//! - [Backend::push_trim] pushes & trims in one step, and only if the list already exists
//! - [Backend::store_list] replaces the list & sets its expiry in one step
//!
//! Nothing else here is transactional.

use std::time::Duration;

use async_trait::async_trait;

/// Transport-level cache failure
#[derive(Debug)]
pub struct Error {
    source: Box<dyn std::error::Error + Send + Sync + 'static>,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

impl Error {
    pub fn new(err: impl std::error::Error + Send + Sync + 'static) -> Error {
        Error {
            source: Box::new(err),
        }
    }
}

#[async_trait]
pub trait Backend {
    /// Read the entire list at `key`, head first; `None` if `key` doesn't exist (or has expired).
    /// A list stored empty comes back as `Some(vec![])`.
    async fn range(&self, key: &str) -> Result<Option<Vec<Vec<u8>>>, Error>;
    /// Replace the list at `key` with `items` & set it to expire after `ttl`. An empty `items`
    /// still creates the key (as an empty list).
    async fn store_list(&self, key: &str, items: &[Vec<u8>], ttl: Duration) -> Result<(), Error>;
    /// If the list at `key` exists, push `item` onto its head & trim it to at most `cap` items,
    /// leaving its expiry untouched; return true. If it does not exist, do nothing & return false.
    async fn push_trim(&self, key: &str, item: &[u8], cap: usize) -> Result<bool, Error>;
    /// Reset the expiry of `key`; return false if `key` doesn't exist
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, Error>;
    /// Remove `key` altogether
    async fn delete(&self, key: &str) -> Result<(), Error>;
    /// Increment the counter at `key` if it exists; return the new value
    async fn incr(&self, key: &str) -> Result<Option<i64>, Error>;
    /// Decrement the counter at `key` if it exists; return the new value
    async fn decr(&self, key: &str) -> Result<Option<i64>, Error>;
    async fn get_count(&self, key: &str) -> Result<Option<i64>, Error>;
    async fn set_count(&self, key: &str, value: i64, ttl: Duration) -> Result<(), Error>;
}
