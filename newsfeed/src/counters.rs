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

//! # Cached counters
//!
//! Like & comment counts are owned by the content service; we keep cached copies so that rendering
//! a feed doesn't mean a count query per post. A cached count is only ever adjusted if it's
//! already present: incrementing a missing key would create a count of one that the next
//! [Counters::get] would trust, when the real count could be anything.

use std::{fmt::Display, sync::Arc, time::Duration};

use snafu::{Backtrace, IntoError, prelude::*};

use crate::{
    cache::{self, Backend as CacheBackend},
    config::Settings,
    entities::PostId,
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Cache {op} on {key} failed: {source}"))]
    Cache {
        op: &'static str,
        key: String,
        source: cache::Error,
    },
    #[snafu(display("While loading {key}, {source}"))]
    Load {
        key: String,
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
    #[snafu(display("Cache {op} on {key} timed-out after {timeout:?}"))]
    Timeout {
        op: &'static str,
        key: String,
        timeout: Duration,
        source: tokio::time::error::Elapsed,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// The denormalized counts we cache
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Counter {
    PostLikes(PostId),
    PostComments(PostId),
}

impl Display for Counter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Counter::PostLikes(id) => write!(f, "posts.post.likes_count:{}", id),
            Counter::PostComments(id) => write!(f, "posts.post.comments_count:{}", id),
        }
    }
}

#[derive(Clone)]
pub struct Counters {
    backend: Arc<dyn CacheBackend + Send + Sync>,
    ttl: Duration,
    timeout: Duration,
}

impl Counters {
    pub fn new(backend: Arc<dyn CacheBackend + Send + Sync>, settings: &Settings) -> Counters {
        Counters {
            backend,
            ttl: settings.list_ttl,
            timeout: settings.io_timeout,
        }
    }
    async fn call<T>(
        &self,
        op: &'static str,
        key: &str,
        fut: impl Future<Output = std::result::Result<T, cache::Error>>,
    ) -> Result<T> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .context(TimeoutSnafu {
                op,
                key,
                timeout: self.timeout,
            })?
            .map_err(|err| CacheSnafu { op, key }.into_error(err))
    }
    /// Bump `counter` if it's cached; return the new value
    pub async fn incr(&self, counter: Counter) -> Result<Option<i64>> {
        let key = counter.to_string();
        self.call("incr", &key, self.backend.incr(&key)).await
    }
    /// Decrement `counter` if it's cached; return the new value
    pub async fn decr(&self, counter: Counter) -> Result<Option<i64>> {
        let key = counter.to_string();
        self.call("decr", &key, self.backend.decr(&key)).await
    }
    /// Read `counter`, loading (& caching) the durable count via `loader` on a miss
    pub async fn get<F, Fut, E>(&self, counter: Counter, loader: F) -> Result<i64>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<i64, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let key = counter.to_string();
        if let Some(count) = self.call("get", &key, self.backend.get_count(&key)).await? {
            return Ok(count);
        }
        let count = loader()
            .await
            .map_err(|err| LoadSnafu { key: key.clone() }.into_error(Box::new(err)))?;
        self.call("set", &key, self.backend.set_count(&key, count, self.ttl))
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::memory::MemoryCache;

    #[tokio::test]
    async fn counts() {
        let counters = Counters::new(Arc::new(MemoryCache::new(8)), &Settings::default());
        let likes = Counter::PostLikes(PostId(9));
        assert_eq!(likes.to_string(), "posts.post.likes_count:9");

        // Cold: adjustments are dropped
        assert_eq!(counters.incr(likes).await.unwrap(), None);
        let count = counters
            .get(likes, || async { Ok::<_, std::io::Error>(41) })
            .await
            .unwrap();
        assert_eq!(count, 41);
        assert_eq!(counters.incr(likes).await.unwrap(), Some(42));
        // Warm: the loader isn't consulted
        let count = counters
            .get(likes, || async {
                Err::<i64, _>(std::io::Error::other("should not be called"))
            })
            .await
            .unwrap();
        assert_eq!(count, 42);
        assert_eq!(
            counters.decr(Counter::PostComments(PostId(9))).await.unwrap(),
            None
        );
    }
}
