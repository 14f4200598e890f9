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

//! # Fan-out on write
//!
//! When a post is created, it goes into its author's feed right away (so that they see it on their
//! next read), and a [FanoutTask] is queued to deliver it to everyone else. That task lists the
//! author's followers & splits them into batches of `fanout-batch-size`, queueing a
//! [FanoutBatchTask] for each on the `newsfeeds` queue. A batch task writes its entries to the
//! store in one round trip, then pushes each onto its follower's cached feed.
//!
//! Every entry is keyed on `(follower, post.created_at)`, so re-running any of these tasks
//! overwrites rather than duplicates.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, prelude::*};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    background_tasks::{
        self, BackgroundTask, Context, DeSnafu, NEWSFEEDS_QUEUE, Sender, TaggedTask, Task,
    },
    counter_add,
    entities::{NewsFeedEntry, Post, PostId, Timestamp, UserId},
    events::Event,
    graph,
    metrics::{self, Instruments, Sort},
    newsfeeds,
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to write post {post_id} to its author's feed: {source}"))]
    Author {
        post_id: PostId,
        source: newsfeeds::Error,
    },
    #[snafu(display("Failed to write a batch of {count} entries for post {post_id}: {source}"))]
    Batch {
        post_id: PostId,
        count: usize,
        source: newsfeeds::Error,
    },
    #[snafu(display("Failed to queue fan-out work for post {post_id}: {source}"))]
    Enqueue {
        post_id: PostId,
        source: background_tasks::Error,
    },
    #[snafu(display("Failed to list {author}'s followers: {source}"))]
    Followers {
        author: UserId,
        source: graph::Error,
    },
    #[snafu(display("Listing {author}'s followers timed-out after {timeout:?}"))]
    FollowersTimeout {
        author: UserId,
        timeout: Duration,
        source: tokio::time::error::Elapsed,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to drop {user}'s cached feed: {source}"))]
    Invalidate {
        user: UserId,
        source: newsfeeds::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// What a fan-out planning step decided
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FanoutReport {
    pub followers: usize,
    pub batches: usize,
}

/// Split `followers` into batches of at most `batch_size`
pub fn plan_batches(
    followers: Vec<UserId>,
    batch_size: usize,
) -> (Vec<Vec<UserId>>, FanoutReport) {
    let count = followers.len();
    let batches = followers
        .into_iter()
        .chunks(batch_size.max(1))
        .into_iter()
        .map(|chunk| chunk.collect::<Vec<UserId>>())
        .collect::<Vec<_>>();
    let report = FanoutReport {
        followers: count,
        batches: batches.len(),
    };
    (batches, report)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           FanoutTask                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A UUID identifying the background task [FanoutTask]
// 8e0c3b52-64d1-4f0b-b7a3-2a5f0d91c6e4
const FANOUT_TASK: Uuid = Uuid::from_fields(
    0x8e0c3b52,
    0x64d1,
    0x4f0b,
    &[0xb7, 0xa3, 0x2a, 0x5f, 0x0d, 0x91, 0xc6, 0xe4],
);

/// Deliver a post to its author's followers (by planning the batches that will)
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FanoutTask {
    pub post_id: PostId,
    pub created_at: Timestamp,
    pub author: UserId,
}

impl FanoutTask {
    async fn plan(&self, context: &Context) -> Result<FanoutReport> {
        let timeout = context.settings.io_timeout;
        let followers = tokio::time::timeout(timeout, context.graph.follower_ids(self.author))
            .await
            .context(FollowersTimeoutSnafu {
                author: self.author,
                timeout,
            })?
            .context(FollowersSnafu {
                author: self.author,
            })?;
        let (batches, report) = plan_batches(followers, context.settings.fanout_batch_size);
        for follower_ids in batches {
            context
                .tasks
                .send(FanoutBatchTask {
                    post_id: self.post_id,
                    created_at: self.created_at,
                    follower_ids,
                })
                .await
                .context(EnqueueSnafu {
                    post_id: self.post_id,
                })?;
        }
        Ok(report)
    }
}

#[async_trait]
impl Task<Context> for FanoutTask {
    async fn exec(self: Box<Self>, context: Context) -> background_tasks::Result<()> {
        let report = self
            .plan(&context)
            .await
            .map_err(background_tasks::Error::new)?;
        info!(
            "Post {}: {} newsfeeds going to fanout, {} batches created",
            self.post_id, report.followers, report.batches
        );
        Ok(())
    }
    fn timeout(&self) -> Option<Duration> {
        Some(Duration::from_secs(60))
    }
}

impl TaggedTask<Context> for FanoutTask {
    type Tag = Uuid;
    fn get_tag() -> Self::Tag {
        FANOUT_TASK
    }
}

inventory::submit! {
    BackgroundTask {
        id: FANOUT_TASK,
        de: |buf| {
            Ok(Box::new(
                rmp_serde::from_slice::<FanoutTask>(buf).context(DeSnafu)?,
            ))
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        FanoutBatchTask                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A UUID identifying the background task [FanoutBatchTask]
// 3fa1d7c9-0b2e-4a66-9d14-c85e7b203f18
const FANOUT_BATCH_TASK: Uuid = Uuid::from_fields(
    0x3fa1d7c9,
    0x0b2e,
    0x4a66,
    &[0x9d, 0x14, 0xc8, 0x5e, 0x7b, 0x20, 0x3f, 0x18],
);

inventory::submit! { metrics::Registration::new("fanout.author.writes", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("fanout.enqueue.failures", Sort::IntegralCounter) }

/// Write one post into a batch of followers' feeds
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FanoutBatchTask {
    pub post_id: PostId,
    pub created_at: Timestamp,
    pub follower_ids: Vec<UserId>,
}

impl FanoutBatchTask {
    async fn deliver(&self, context: &Context) -> Result<()> {
        let entries = self
            .follower_ids
            .iter()
            .map(|follower| NewsFeedEntry::new(*follower, self.created_at, self.post_id))
            .collect::<Vec<_>>();
        context
            .feeds
            .batch_create(&entries)
            .await
            .context(BatchSnafu {
                post_id: self.post_id,
                count: entries.len(),
            })?;
        for entry in entries {
            let user = entry.user_id;
            if let Err(err) = context.events.publish(&Event::NewsFeedCreated(entry)).await {
                // The entry is in the store; a cached feed that missed it must go, so that the
                // next read reloads it
                warn!("{}; dropping {}'s cached feed", err, user);
                context
                    .feeds
                    .invalidate(user)
                    .await
                    .context(InvalidateSnafu { user })?;
            }
        }
        debug!(
            "Post {} delivered to {} feeds",
            self.post_id,
            self.follower_ids.len()
        );
        Ok(())
    }
}

#[async_trait]
impl Task<Context> for FanoutBatchTask {
    async fn exec(self: Box<Self>, context: Context) -> background_tasks::Result<()> {
        self.deliver(&context)
            .await
            .map_err(background_tasks::Error::new)
    }
    fn timeout(&self) -> Option<Duration> {
        Some(Duration::from_secs(30))
    }
}

impl TaggedTask<Context> for FanoutBatchTask {
    type Tag = Uuid;
    fn get_tag() -> Self::Tag {
        FANOUT_BATCH_TASK
    }
    fn queue() -> &'static str {
        NEWSFEEDS_QUEUE
    }
}

inventory::submit! {
    BackgroundTask {
        id: FANOUT_BATCH_TASK,
        de: |buf| {
            Ok(Box::new(
                rmp_serde::from_slice::<FanoutBatchTask>(buf).context(DeSnafu)?,
            ))
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       FanoutCoordinator                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The entry point for fan-out: call [FanoutCoordinator::on_post_created] once a post is durable
pub struct FanoutCoordinator {
    context: Context,
    instruments: Arc<Instruments>,
}

impl FanoutCoordinator {
    pub fn new(context: Context, instruments: Arc<Instruments>) -> FanoutCoordinator {
        FanoutCoordinator {
            context,
            instruments,
        }
    }
    pub fn context(&self) -> &Context {
        &self.context
    }
    /// Put `post` in its author's feed & schedule its delivery to their followers
    ///
    /// Only the author's own write can fail this call. Once that's durable, a cache that can't
    /// take the new entry has the affected list dropped, and a delivery that can't be scheduled is
    /// logged & counted; the author's entry is returned regardless.
    pub async fn on_post_created(&self, post: &Post) -> Result<NewsFeedEntry> {
        let author = post.user_id;
        let entry = NewsFeedEntry::new(author, post.created_at, post.id);
        self.context
            .feeds
            .create(&entry)
            .await
            .context(AuthorSnafu { post_id: post.id })?;
        counter_add!(self.instruments, "fanout.author.writes", 1, &[]);

        for event in [
            Event::NewsFeedCreated(entry.clone()),
            Event::PostCreated(post.clone()),
        ] {
            if let Err(err) = self.context.events.publish(&event).await {
                warn!("{}; dropping {}'s cached list", err, author);
                let dropped = match event {
                    Event::PostCreated(_) => {
                        self.context.feeds.invalidate_user_posts(author).await
                    }
                    _ => self.context.feeds.invalidate(author).await,
                };
                if let Err(err) = dropped {
                    error!("Failed to drop {}'s cached list: {}", author, err);
                }
            }
        }

        if let Err(err) = self
            .context
            .tasks
            .send(FanoutTask {
                post_id: post.id,
                created_at: post.created_at,
                author: post.user_id,
            })
            .await
        {
            error!("Failed to schedule fan-out for post {}: {}", post.id, err);
            counter_add!(self.instruments, "fanout.enqueue.failures", 1, &[]);
        }

        Ok(entry)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use chrono::{DateTime, Utc};

    use crate::{
        background_tasks::{
            self as bt, BackgroundTasks, Config, DEFAULT_QUEUE, FlatTask, run_until_idle,
        },
        cache::{self, Backend as _},
        config::{ExecutionMode, Settings},
        counters::Counters,
        events::EventBus,
        graph::Friendships,
        memory::{MemoryCache, MemoryStore, MemoryTasks},
        newsfeeds::NewsFeeds,
        paginate::Cursor,
    };

    fn context(tasks: Arc<dyn bt::Backend + Send + Sync>) -> (Context, Arc<Friendships>) {
        context_with(tasks, Arc::new(MemoryCache::new(64)))
    }

    fn context_with(
        tasks: Arc<dyn bt::Backend + Send + Sync>,
        cache: Arc<dyn cache::Backend + Send + Sync>,
    ) -> (Context, Arc<Friendships>) {
        let settings = Settings {
            fanout_batch_size: 2,
            page_size: 10,
            mode: ExecutionMode::Test,
            ..Default::default()
        };
        let storage = Arc::new(MemoryStore::new());
        let instruments = Arc::new(Instruments::new("newsfeed"));
        let feeds = Arc::new(NewsFeeds::new(
            storage.clone(),
            cache.clone(),
            &settings,
            instruments.clone(),
        ));
        let graph = Arc::new(Friendships::new(
            storage,
            settings.mode,
            settings.io_timeout,
        ));
        let context = Context {
            feeds: feeds.clone(),
            events: Arc::new(EventBus::new(feeds, Counters::new(cache, &settings))),
            graph: graph.clone(),
            tasks: Arc::new(BackgroundTasks::new(tasks, Config::default(), instruments)),
            settings,
        };
        (context, graph)
    }

    #[test]
    fn batches() {
        let ids = |n: i64| (1..=n).map(UserId).collect::<Vec<_>>();
        assert_eq!(
            plan_batches(ids(5), 2).1,
            FanoutReport {
                followers: 5,
                batches: 3
            }
        );
        assert_eq!(
            plan_batches(ids(4), 2).1,
            FanoutReport {
                followers: 4,
                batches: 2
            }
        );
        let (batches, report) = plan_batches(Vec::new(), 2);
        assert!(batches.is_empty());
        assert_eq!(report.batches, 0);
        let (batches, _) = plan_batches(ids(3), 1000);
        assert_eq!(batches, vec![ids(3)]);
    }

    #[tokio::test]
    async fn fanout_reaches_every_follower() {
        let (context, graph) = context(Arc::new(MemoryTasks::new()));
        context.feeds.create_if_missing().await.unwrap();
        graph.create_if_missing().await.unwrap();
        let author = UserId(1);
        for follower in 2..=6 {
            graph.follow(UserId(follower), author).await.unwrap();
        }
        // Warm one follower's feed so the push has somewhere to go
        assert!(
            context
                .feeds
                .cached_newsfeeds(UserId(2))
                .await
                .unwrap()
                .is_empty()
        );

        let coordinator = FanoutCoordinator::new(
            context.clone(),
            Arc::new(Instruments::new("newsfeed")),
        );
        let post = Post {
            id: PostId(100),
            user_id: author,
            created_at: Timestamp::now(),
            content: "hello".to_owned(),
        };
        let entry = coordinator.on_post_created(&post).await.unwrap();
        assert_eq!(entry.user_id, author);
        // The author sees it before any fan-out has run
        let page = context.feeds.page(author, &Cursor::First).await.unwrap();
        assert_eq!(page.items, vec![entry]);

        let timeout = Duration::from_secs(5);
        let planned = run_until_idle(
            &context.tasks.receiver(DEFAULT_QUEUE),
            context.clone(),
            timeout,
        )
        .await
        .unwrap();
        assert_eq!(planned, 1);
        let delivered = run_until_idle(
            &context.tasks.receiver(NEWSFEEDS_QUEUE),
            context.clone(),
            timeout,
        )
        .await
        .unwrap();
        // Five followers, two to a batch
        assert_eq!(delivered, 3);

        for follower in 2..=6 {
            let page = context
                .feeds
                .page(UserId(follower), &Cursor::First)
                .await
                .unwrap();
            assert_eq!(
                page.items,
                vec![NewsFeedEntry::new(UserId(follower), post.created_at, post.id)]
            );
        }
    }

    /// A task store that's always down
    struct Down;

    #[async_trait]
    impl bt::Backend for Down {
        async fn write_task(&self, _: &str, _: &Uuid, _: &[u8]) -> bt::Result<Uuid> {
            Err(bt::Error::new(std::io::Error::other("down")))
        }
        async fn lease_task(&self, _: &str, _: Duration) -> bt::Result<Option<FlatTask>> {
            Ok(None)
        }
        async fn close_task(&self, _: &Uuid) -> bt::Result<()> {
            Ok(())
        }
        async fn release_task(&self, _: &Uuid, _: DateTime<Utc>, _: &str) -> bt::Result<()> {
            Ok(())
        }
        async fn bury_task(&self, _: &Uuid, _: &str) -> bt::Result<()> {
            Ok(())
        }
        async fn dead_tasks(&self, _: &str) -> bt::Result<Vec<FlatTask>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn enqueue_failures_are_not_the_authors_problem() {
        let (context, _) = context(Arc::new(Down));
        context.feeds.create_if_missing().await.unwrap();
        let coordinator = FanoutCoordinator::new(
            context.clone(),
            Arc::new(Instruments::new("newsfeed")),
        );
        let post = Post {
            id: PostId(7),
            user_id: UserId(9),
            created_at: Timestamp::now(),
            content: String::new(),
        };
        let entry = coordinator.on_post_created(&post).await.unwrap();
        let page = context.feeds.page(UserId(9), &Cursor::First).await.unwrap();
        assert_eq!(page.items, vec![entry]);
    }

    type CacheResult<T> = std::result::Result<T, cache::Error>;

    /// A cache that holds lists but can't push onto them
    struct PushDown(MemoryCache);

    #[async_trait]
    impl cache::Backend for PushDown {
        async fn range(&self, key: &str) -> CacheResult<Option<Vec<Vec<u8>>>> {
            self.0.range(key).await
        }
        async fn store_list(&self, key: &str, items: &[Vec<u8>], ttl: Duration) -> CacheResult<()> {
            self.0.store_list(key, items, ttl).await
        }
        async fn push_trim(&self, _: &str, _: &[u8], _: usize) -> CacheResult<bool> {
            Err(cache::Error::new(std::io::Error::other("push down")))
        }
        async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<bool> {
            self.0.expire(key, ttl).await
        }
        async fn delete(&self, key: &str) -> CacheResult<()> {
            self.0.delete(key).await
        }
        async fn incr(&self, key: &str) -> CacheResult<Option<i64>> {
            self.0.incr(key).await
        }
        async fn decr(&self, key: &str) -> CacheResult<Option<i64>> {
            self.0.decr(key).await
        }
        async fn get_count(&self, key: &str) -> CacheResult<Option<i64>> {
            self.0.get_count(key).await
        }
        async fn set_count(&self, key: &str, value: i64, ttl: Duration) -> CacheResult<()> {
            self.0.set_count(key, value, ttl).await
        }
    }

    #[tokio::test]
    async fn cache_push_failures_drop_the_authors_lists() {
        let (context, graph) = context_with(
            Arc::new(MemoryTasks::new()),
            Arc::new(PushDown(MemoryCache::new(64))),
        );
        context.feeds.create_if_missing().await.unwrap();
        graph.create_if_missing().await.unwrap();
        let author = UserId(11);
        // Warm both of the author's lists; each is empty, and so trusted as complete
        assert!(context.feeds.cached_newsfeeds(author).await.unwrap().is_empty());
        assert!(
            context
                .feeds
                .cached_user_posts(author, |_| async {
                    Ok::<_, std::io::Error>(Vec::new())
                })
                .await
                .unwrap()
                .is_empty()
        );

        let coordinator = FanoutCoordinator::new(
            context.clone(),
            Arc::new(Instruments::new("newsfeed")),
        );
        let post = Post {
            id: PostId(12),
            user_id: author,
            created_at: Timestamp::now(),
            content: "cache trouble".to_owned(),
        };
        let entry = coordinator.on_post_created(&post).await.unwrap();

        let page = context.feeds.page(author, &Cursor::First).await.unwrap();
        assert_eq!(page.items, vec![entry]);
        let expected = post.clone();
        let posts = context
            .feeds
            .cached_user_posts(author, |_| async move {
                Ok::<_, std::io::Error>(vec![expected])
            })
            .await
            .unwrap();
        assert_eq!(posts, vec![post]);
        // Delivery was still scheduled
        let planned = run_until_idle(
            &context.tasks.receiver(DEFAULT_QUEUE),
            context.clone(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(planned, 1);
    }
}
