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

//! # Domain events
//!
//! Write paths say what happened by publishing an [Event]; the [EventBus] brings the caches up to
//! date. The set of subscribers is fixed: the news feed & user posts caches, and the counters.

use std::sync::Arc;

use snafu::prelude::*;
use tracing::debug;

use crate::{
    counters::{self, Counter, Counters},
    entities::{NewsFeedEntry, Post, PostId},
    newsfeeds::{self, NewsFeeds},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("While updating a counter for {event}, {source}"))]
    Counters {
        event: String,
        source: counters::Error,
    },
    #[snafu(display("While updating a cached list for {event}, {source}"))]
    Lists {
        event: String,
        source: newsfeeds::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Event {
    /// An entry was written to someone's news feed
    NewsFeedCreated(NewsFeedEntry),
    /// A post was written (by its author)
    PostCreated(Post),
    LikeCreated { post_id: PostId },
    LikeDeleted { post_id: PostId },
    CommentCreated { post_id: PostId },
    CommentDeleted { post_id: PostId },
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::NewsFeedCreated(entry) => write!(
                f,
                "NewsFeedCreated({}, {}, {})",
                entry.user_id, entry.created_at, entry.post_id
            ),
            Event::PostCreated(post) => write!(f, "PostCreated({})", post.id),
            Event::LikeCreated { post_id } => write!(f, "LikeCreated({})", post_id),
            Event::LikeDeleted { post_id } => write!(f, "LikeDeleted({})", post_id),
            Event::CommentCreated { post_id } => write!(f, "CommentCreated({})", post_id),
            Event::CommentDeleted { post_id } => write!(f, "CommentDeleted({})", post_id),
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    feeds: Arc<NewsFeeds>,
    counters: Counters,
}

impl EventBus {
    pub fn new(feeds: Arc<NewsFeeds>, counters: Counters) -> EventBus {
        EventBus { feeds, counters }
    }
    pub fn counters(&self) -> &Counters {
        &self.counters
    }
    /// Deliver `event` to every subscriber interested in it
    pub async fn publish(&self, event: &Event) -> Result<()> {
        debug!("Publishing {}", event);
        let ctx = || event.to_string();
        match event {
            Event::NewsFeedCreated(entry) => {
                self.feeds
                    .push_newsfeed(entry)
                    .await
                    .context(ListsSnafu { event: ctx() })?;
            }
            Event::PostCreated(post) => {
                self.feeds
                    .push_user_post(post)
                    .await
                    .context(ListsSnafu { event: ctx() })?;
            }
            Event::LikeCreated { post_id } => {
                self.counters
                    .incr(Counter::PostLikes(*post_id))
                    .await
                    .context(CountersSnafu { event: ctx() })?;
            }
            Event::LikeDeleted { post_id } => {
                self.counters
                    .decr(Counter::PostLikes(*post_id))
                    .await
                    .context(CountersSnafu { event: ctx() })?;
            }
            Event::CommentCreated { post_id } => {
                self.counters
                    .incr(Counter::PostComments(*post_id))
                    .await
                    .context(CountersSnafu { event: ctx() })?;
            }
            Event::CommentDeleted { post_id } => {
                self.counters
                    .decr(Counter::PostComments(*post_id))
                    .await
                    .context(CountersSnafu { event: ctx() })?;
            }
        }
        Ok(())
    }
}
