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

//! # News feeds
//!
//! [NewsFeeds] ties the pieces together for one kind of list: the `newsfeeds` table holds every
//! user's feed, a [BoundedListCache] holds the head of each, and a [CursorPaginator] pages through
//! them. It also caches each author's own posts (which arrive as [Post] entities, rather than
//! records) with the same cache mechanics.

use std::sync::Arc;

use snafu::prelude::*;

use crate::{
    cache::Backend as CacheBackend,
    config::Settings,
    entities::{NewsFeedEntry, Post, Timestamp, UserId},
    key,
    list_cache::{self, BoundedListCache, EntitySerializer, RecordSerializer},
    metrics::Instruments,
    paginate::{self, Cursor, CursorPaginator, Page},
    storage::Backend as StorageBackend,
    wide_column::{self, ScanSpec, Table},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("News feed cache failure: {source}"))]
    Cache { source: list_cache::Error },
    #[snafu(display("Failed to page through {user}'s news feed: {source}"))]
    Paginate {
        user: UserId,
        source: paginate::Error,
    },
    #[snafu(display("News feed store failure: {source}"))]
    Store { source: wide_column::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

/// The cache key for `user`'s news feed
pub fn newsfeed_key(user: UserId) -> String {
    format!("user_newsfeeds:{}", user)
}

/// The cache key for `user`'s own posts
pub fn user_posts_key(user: UserId) -> String {
    format!("user_posts:{}", user)
}

pub struct NewsFeeds {
    table: Table<NewsFeedEntry>,
    cache: BoundedListCache,
    paginator: CursorPaginator,
}

impl NewsFeeds {
    pub fn new(
        storage: Arc<dyn StorageBackend + Send + Sync>,
        cache: Arc<dyn CacheBackend + Send + Sync>,
        settings: &Settings,
        instruments: Arc<Instruments>,
    ) -> NewsFeeds {
        NewsFeeds {
            table: Table::new(storage, settings.mode, settings.io_timeout),
            cache: BoundedListCache::new(cache, settings, instruments),
            paginator: CursorPaginator::new(settings.page_size, settings.list_capacity),
        }
    }
    pub fn table(&self) -> &Table<NewsFeedEntry> {
        &self.table
    }
    pub fn cache(&self) -> &BoundedListCache {
        &self.cache
    }
    pub async fn create_if_missing(&self) -> Result<()> {
        self.table.create_if_missing().await.context(StoreSnafu)
    }
    /// Write `entry` to the store (only)
    pub async fn create(&self, entry: &NewsFeedEntry) -> Result<()> {
        self.table.put(entry).await.context(StoreSnafu)
    }
    /// Write `entries` to the store in a single round trip
    pub async fn batch_create(&self, entries: &[NewsFeedEntry]) -> Result<()> {
        self.table.batch_create(entries).await.context(StoreSnafu)
    }
    /// Remove an entry from `user`'s feed
    ///
    /// A cached copy of the feed can't be edited in place, so it's dropped; the next read reloads
    /// it.
    pub async fn delete(&self, user: UserId, created_at: Timestamp) -> Result<()> {
        self.table
            .delete(&key![user, created_at])
            .await
            .context(StoreSnafu)?;
        self.invalidate(user).await
    }
    /// Drop `user`'s cached feed
    pub async fn invalidate(&self, user: UserId) -> Result<()> {
        self.cache
            .invalidate(&newsfeed_key(user))
            .await
            .context(CacheSnafu)
    }
    /// Push `entry` onto the head of its owner's cached feed, if that's cached
    pub async fn push_newsfeed(&self, entry: &NewsFeedEntry) -> Result<bool> {
        self.cache
            .push(
                &newsfeed_key(entry.user_id),
                &RecordSerializer::<NewsFeedEntry>::new(),
                entry,
            )
            .await
            .context(CacheSnafu)
    }
    /// The head of `user`'s feed (up to the cache capacity), newest first
    pub async fn cached_newsfeeds(&self, user: UserId) -> Result<Vec<NewsFeedEntry>> {
        self.cache
            .load(
                &newsfeed_key(user),
                &RecordSerializer::<NewsFeedEntry>::new(),
                |limit| {
                    let spec = ScanSpec::prefix(key![user]).reverse().limit(limit);
                    async move { self.table.scan(&spec).await }
                },
            )
            .await
            .context(CacheSnafu)
    }
    /// One page of `user`'s feed
    pub async fn page(&self, user: UserId, cursor: &Cursor) -> Result<Page<NewsFeedEntry>> {
        self.paginator
            .paginate(
                &self.cache,
                &newsfeed_key(user),
                &RecordSerializer::<NewsFeedEntry>::new(),
                &self.table,
                user,
                cursor,
            )
            .await
            .context(PaginateSnafu { user })
    }
    /// `user`'s own posts, newest first, loaded from the content service via `loader` on a miss
    pub async fn cached_user_posts<F, Fut, E>(&self, user: UserId, loader: F) -> Result<Vec<Post>>
    where
        F: FnOnce(usize) -> Fut,
        Fut: Future<Output = std::result::Result<Vec<Post>, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.cache
            .load(&user_posts_key(user), &EntitySerializer::<Post>::new(), loader)
            .await
            .context(CacheSnafu)
    }
    /// Drop `user`'s cached posts
    pub async fn invalidate_user_posts(&self, user: UserId) -> Result<()> {
        self.cache
            .invalidate(&user_posts_key(user))
            .await
            .context(CacheSnafu)
    }
    /// Push `post` onto its author's cached posts, if those are cached
    pub async fn push_user_post(&self, post: &Post) -> Result<bool> {
        self.cache
            .push(
                &user_posts_key(post.user_id),
                &EntitySerializer::<Post>::new(),
                post,
            )
            .await
            .context(CacheSnafu)
    }
}
