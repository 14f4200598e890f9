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

//! Scenarios exercising the read path end-to-end: fan-out, the bounded list cache & pagination.

use libtest_mimic::Failed;

use newsfeed::{
    entities::{NewsFeedEntry, Post, PostId, Timestamp, UserId},
    key,
    paginate::{Cursor, Page},
    wide_column::ScanSpec,
};

use crate::{Backends, World, test_settings};

fn timestamps(page: &Page<NewsFeedEntry>) -> Vec<i64> {
    page.items.iter().map(|e| e.created_at.0).collect()
}

async fn seed(world: &World, user: UserId, count: i64) -> Result<(), Failed> {
    let entries = (1..=count)
        .map(|ts| NewsFeedEntry::new(user, Timestamp(ts), PostId(ts)))
        .collect::<Vec<_>>();
    world.feeds.batch_create(&entries).await?;
    Ok(())
}

fn make_post(id: i64, author: UserId) -> Post {
    Post {
        id: PostId(id),
        user_id: author,
        created_at: Timestamp::now(),
        content: format!("post #{}", id),
    }
}

/// An author sees their own post on their first page as soon as it's been created, before any
/// fan-out has run
pub async fn own_post_visible(backends: Backends) -> Result<(), Failed> {
    let world = World::new(&backends, test_settings(5, 2, 10)).await?;
    let author = UserId(201);
    // Warm the author's cached feed first; the new entry has to land on it
    assert!(world.feeds.page(author, &Cursor::First).await?.items.is_empty());
    let entry = world.coordinator.on_post_created(&make_post(1, author)).await?;
    let page = world.feeds.page(author, &Cursor::First).await?;
    assert_eq!(page.items, vec![entry]);
    assert!(!page.has_next);
    Ok(())
}

/// Once the background tasks have run, every follower has the post, exactly once
pub async fn fanout_completeness(backends: Backends) -> Result<(), Failed> {
    let world = World::new(&backends, test_settings(5, 2, 2)).await?;
    let author = UserId(301);
    let followers = (302..309).map(UserId).collect::<Vec<_>>();
    for follower in &followers {
        assert!(world.graph.follow(*follower, author).await?);
    }
    // Someone who doesn't follow the author
    let bystander = UserId(399);
    // Warm a couple of followers' cached feeds; delivery has to land at their heads
    for follower in &followers[..2] {
        world
            .feeds
            .batch_create(&[NewsFeedEntry::new(*follower, Timestamp(1), PostId(1))])
            .await?;
        assert_eq!(world.feeds.cached_newsfeeds(*follower).await?.len(), 1);
    }

    let post = make_post(2, author);
    let entry = world.coordinator.on_post_created(&post).await?;
    // One planning task, then four batches of (at most) two
    assert!(world.drain().await? >= 5);

    let delivered = |user: UserId| NewsFeedEntry::new(user, entry.created_at, entry.post_id);
    for follower in followers.iter().chain(std::iter::once(&author)) {
        let stored = world
            .feeds
            .table()
            .scan(&ScanSpec::prefix(key![*follower]).reverse())
            .await?;
        assert_eq!(stored[0], delivered(*follower), "{} is missing the post", follower);
        assert_eq!(
            stored.iter().filter(|e| e.post_id == entry.post_id).count(),
            1,
            "{} should have exactly one entry for the post",
            follower
        );
    }
    for follower in &followers[..2] {
        let cached = world.feeds.cached_newsfeeds(*follower).await?;
        assert_eq!(cached.first(), Some(&delivered(*follower)));
        assert_eq!(cached.len(), 2);
    }
    assert!(
        world
            .feeds
            .page(bystander, &Cursor::First)
            .await?
            .items
            .is_empty()
    );

    // Re-delivering the same post overwrites the same rows
    world.coordinator.on_post_created(&post).await?;
    world.drain().await?;
    for follower in &followers[2..] {
        let stored = world
            .feeds
            .table()
            .scan(&ScanSpec::prefix(key![*follower]))
            .await?;
        assert_eq!(stored, vec![delivered(*follower)]);
    }
    Ok(())
}

/// The cached list never holds more than its capacity, and holds the newest entries
pub async fn cache_capacity(backends: Backends) -> Result<(), Failed> {
    let world = World::new(&backends, test_settings(5, 2, 10)).await?;
    let user = UserId(401);
    seed(&world, user, 7).await?;
    let cached = world.feeds.cached_newsfeeds(user).await?;
    assert_eq!(
        cached.iter().map(|e| e.created_at.0).collect::<Vec<_>>(),
        vec![7, 6, 5, 4, 3]
    );
    // Pushing onto a full list drops the oldest
    assert!(
        world
            .feeds
            .push_newsfeed(&NewsFeedEntry::new(user, Timestamp(8), PostId(8)))
            .await?
    );
    let cached = world.feeds.cached_newsfeeds(user).await?;
    assert_eq!(
        cached.iter().map(|e| e.created_at.0).collect::<Vec<_>>(),
        vec![8, 7, 6, 5, 4]
    );
    // A user with fewer entries than the capacity gets them all
    let sparse = UserId(402);
    seed(&world, sparse, 2).await?;
    assert_eq!(world.feeds.cached_newsfeeds(sparse).await?.len(), 2);
    Ok(())
}

/// Walking a seven-entry feed two at a time, with a cache holding five, crosses from the cache to
/// the store without a seam
pub async fn paging(backends: Backends) -> Result<(), Failed> {
    let world = World::new(&backends, test_settings(5, 2, 10)).await?;
    let user = UserId(501);
    seed(&world, user, 7).await?;

    let page = world.feeds.page(user, &Cursor::First).await?;
    assert_eq!(timestamps(&page), vec![7, 6]);
    assert!(page.has_next);

    let page = world
        .feeds
        .page(user, &Cursor::Before(Timestamp(6)))
        .await?;
    assert_eq!(timestamps(&page), vec![5, 4]);
    assert!(page.has_next);

    let page = world
        .feeds
        .page(user, &Cursor::Before(Timestamp(4)))
        .await?;
    assert_eq!(timestamps(&page), vec![3, 2]);
    assert!(page.has_next);

    let page = world
        .feeds
        .page(user, &Cursor::Before(Timestamp(2)))
        .await?;
    assert_eq!(timestamps(&page), vec![1]);
    assert!(!page.has_next);

    let page = world.feeds.page(user, &Cursor::After(Timestamp(5))).await?;
    assert_eq!(timestamps(&page), vec![7, 6]);
    assert!(!page.has_next);
    Ok(())
}

/// "Newer than" isn't bounded by the page size, nor by the cache
pub async fn newer_than_unbounded(backends: Backends) -> Result<(), Failed> {
    let world = World::new(&backends, test_settings(5, 2, 10)).await?;
    let user = UserId(601);
    seed(&world, user, 12).await?;
    let page = world.feeds.page(user, &Cursor::After(Timestamp(1))).await?;
    assert_eq!(timestamps(&page), (2..=12).rev().collect::<Vec<_>>());
    assert!(!page.has_next);
    // Nothing newer than the newest
    let page = world.feeds.page(user, &Cursor::After(Timestamp(12))).await?;
    assert!(page.items.is_empty());
    Ok(())
}
