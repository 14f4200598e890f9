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

//! # The social graph
//!
//! Fan-out needs to know who follows whom; [FollowerSource] is all it asks. [Friendships] is our
//! own implementation, keeping each edge twice in the wide-column store: once keyed by the
//! follower ([Following]) & once keyed by the followee ([Follower]). Both copies share a timestamp,
//! which is what lets us find & delete them together.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tracing::debug;

use crate::{
    config::ExecutionMode,
    entities::{Follower, Following, Timestamp, UserId},
    key,
    storage::Backend as StorageBackend,
    wide_column::{self, ScanSpec, Table},
};

/// Failure fetching social graph information
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

/// Anything that can list a user's followers
///
/// The list may be very large; callers are expected to batch whatever they do with it.
#[async_trait]
pub trait FollowerSource {
    async fn follower_ids(&self, user: UserId) -> Result<Vec<UserId>, Error>;
}

/// Follow edges in the wide-column store
#[derive(Clone)]
pub struct Friendships {
    followings: Table<Following>,
    followers: Table<Follower>,
}

impl Friendships {
    pub fn new(
        storage: Arc<dyn StorageBackend + Send + Sync>,
        mode: ExecutionMode,
        timeout: Duration,
    ) -> Friendships {
        Friendships {
            followings: Table::new(storage.clone(), mode, timeout),
            followers: Table::new(storage, mode, timeout),
        }
    }
    pub async fn create_if_missing(&self) -> wide_column::Result<()> {
        self.followings.create_if_missing().await?;
        self.followers.create_if_missing().await
    }
    pub async fn drop_tables(&self) -> wide_column::Result<()> {
        self.followings.drop_table().await?;
        self.followers.drop_table().await
    }
    // The edge from `from` to `to`, if there is one
    async fn edge(&self, from: UserId, to: UserId) -> wide_column::Result<Option<Following>> {
        Ok(self
            .followings
            .scan(&ScanSpec::prefix(key![from]))
            .await?
            .into_iter()
            .find(|f| f.to_user_id == to))
    }
    /// Have `from` follow `to`; return false if that was already so (or if `from` is `to`)
    pub async fn follow(&self, from: UserId, to: UserId) -> wide_column::Result<bool> {
        if from == to || self.edge(from, to).await?.is_some() {
            return Ok(false);
        }
        let created_at = Timestamp::now();
        self.followings
            .put(&Following {
                from_user_id: from,
                created_at,
                to_user_id: to,
            })
            .await?;
        self.followers
            .put(&Follower {
                to_user_id: to,
                created_at,
                from_user_id: from,
            })
            .await?;
        debug!("{} now follows {}", from, to);
        Ok(true)
    }
    /// Have `from` stop following `to`; return false if `from` wasn't
    pub async fn unfollow(&self, from: UserId, to: UserId) -> wide_column::Result<bool> {
        if from == to {
            return Ok(false);
        }
        match self.edge(from, to).await? {
            Some(edge) => {
                self.followings
                    .delete(&key![from, edge.created_at])
                    .await?;
                self.followers.delete(&key![to, edge.created_at]).await?;
                debug!("{} no longer follows {}", from, to);
                Ok(true)
            }
            None => Ok(false),
        }
    }
    pub async fn has_followed(&self, from: UserId, to: UserId) -> wide_column::Result<bool> {
        Ok(from != to && self.edge(from, to).await?.is_some())
    }
    /// Everyone `user` follows, most recent first
    pub async fn following_ids(&self, user: UserId) -> wide_column::Result<Vec<UserId>> {
        Ok(self
            .followings
            .scan(&ScanSpec::prefix(key![user]).reverse())
            .await?
            .into_iter()
            .map(|f| f.to_user_id)
            .collect())
    }
    /// Everyone following `user`, most recent first
    pub async fn list_follower_ids(&self, user: UserId) -> wide_column::Result<Vec<UserId>> {
        Ok(self
            .followers
            .scan(&ScanSpec::prefix(key![user]).reverse())
            .await?
            .into_iter()
            .map(|f| f.from_user_id)
            .collect())
    }
}

#[async_trait]
impl FollowerSource for Friendships {
    async fn follower_ids(&self, user: UserId) -> Result<Vec<UserId>, Error> {
        self.list_follower_ids(user).await.map_err(Error::new)
    }
}
