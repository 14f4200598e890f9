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

//! # Cursor pagination
//!
//! ## Introduction
//!
//! Feeds are paged by timestamp cursors, newest first. A client asks for the first page, then for
//! pages older than the last entry it has seen ([Cursor::Before]); to refresh, it asks for
//! everything newer than the first entry it has ([Cursor::After]). There is no server-side
//! pagination state.
//!
//! ## Cache or store?
//!
//! A cached feed holds at most `capacity` entries, so it is a *prefix* of the real feed. A page
//! can be served from the cache only if the cache can prove it isn't hiding anything:
//!
//! - if the cached list is shorter than `capacity`, it holds the entire feed
//! - if the window we'd serve is followed by at least one more cached entry, the window is complete
//!   (entries are contiguous from the head) & we know there's a next page
//!
//! Otherwise we go to the store. A page of "older than" that runs off the end of the cache is the
//! typical case.
//!
//! Newer-than pages are unbounded (a client that far behind would just have to ask again) & are
//! nearly always answered by the cache; they fall through only when every cached entry is newer
//! than the cursor in a full list, since the gap may hold more.
//!
//! ## Inclusive bounds
//!
//! Store scans are inclusive at their start, so the entry *at* a cursor can turn up in the scan.
//! It's dropped before the page is cut.

use snafu::{Backtrace, prelude::*};
use tracing::debug;

use crate::{
    entities::{Timestamp, Timestamped},
    list_cache::{self, BoundedListCache, Serializer},
    row_key::{KeyTuple, Value},
    wide_column::{self, Record, ScanSpec, Table},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Only one of before & after may be given"))]
    BothCursors { backtrace: Backtrace },
    #[snafu(display("While reading the cached list, {source}"))]
    Cache { source: list_cache::Error },
    #[snafu(display("While reading the store, {source}"))]
    Store { source: wide_column::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Where a page starts
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Cursor {
    /// The most recent entries
    #[default]
    First,
    /// Entries strictly older than this
    Before(Timestamp),
    /// All entries strictly newer than this
    After(Timestamp),
}

impl Cursor {
    /// Build a cursor from optional `before`/`after` request parameters
    pub fn from_params(before: Option<Timestamp>, after: Option<Timestamp>) -> Result<Cursor> {
        match (before, after) {
            (None, None) => Ok(Cursor::First),
            (Some(before), None) => Ok(Cursor::Before(before)),
            (None, Some(after)) => Ok(Cursor::After(after)),
            (Some(_), Some(_)) => BothCursorsSnafu.fail(),
        }
    }
}

/// One page of results, newest first
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub has_next: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct CursorPaginator {
    page_size: usize,
    capacity: usize,
}

impl CursorPaginator {
    /// `capacity` is the capacity of the cached lists this paginator will be handed
    pub fn new(page_size: usize, capacity: usize) -> CursorPaginator {
        CursorPaginator {
            page_size,
            capacity,
        }
    }
    pub fn page_size(&self) -> usize {
        self.page_size
    }
    /// Serve `cursor` from `list` (a cached feed, newest first) if that can be done correctly
    pub fn paginate_cached<T: Timestamped + Clone>(
        &self,
        list: &[T],
        cursor: &Cursor,
    ) -> Option<Page<T>> {
        let complete = list.len() < self.capacity;
        match cursor {
            Cursor::After(after) => {
                let newer = list
                    .iter()
                    .take_while(|item| item.timestamp() > *after)
                    .cloned()
                    .collect::<Vec<_>>();
                (complete || newer.len() < list.len()).then_some(Page {
                    items: newer,
                    has_next: false,
                })
            }
            Cursor::First | Cursor::Before(_) => {
                let start = match cursor {
                    Cursor::Before(before) => list
                        .iter()
                        .position(|item| item.timestamp() < *before)
                        .unwrap_or(list.len()),
                    _ => 0,
                };
                let end = (start + self.page_size).min(list.len());
                let has_next = list.len() > start + self.page_size;
                (has_next || complete).then(|| Page {
                    items: list[start..end].to_vec(),
                    has_next,
                })
            }
        }
    }
    /// Serve `cursor` from `table`, for the feed belonging to `subject`
    pub async fn paginate_store<R: Record + Timestamped>(
        &self,
        table: &Table<R>,
        subject: impl Into<Value>,
        cursor: &Cursor,
    ) -> Result<Page<R>> {
        let subject: Value = subject.into();
        let with_ts = |ts: Timestamp| KeyTuple(vec![subject.clone(), ts.into()]);
        match cursor {
            Cursor::First => {
                let mut items = table
                    .scan(
                        &ScanSpec::prefix(KeyTuple(vec![subject.clone()]))
                            .reverse()
                            .limit(self.page_size + 1),
                    )
                    .await
                    .context(StoreSnafu)?;
                let has_next = items.len() > self.page_size;
                items.truncate(self.page_size);
                Ok(Page { items, has_next })
            }
            Cursor::Before(before) => {
                // The scan starts at the cursor (inclusive), so allow for the entry at the cursor
                // plus the one telling us there's a next page
                let mut items = table
                    .scan(
                        &ScanSpec::range(
                            Some(with_ts(*before)),
                            Some(KeyTuple(vec![subject.clone()])),
                        )
                        .reverse()
                        .limit(self.page_size + 2),
                    )
                    .await
                    .context(StoreSnafu)?;
                if items.first().is_some_and(|item| item.timestamp() == *before) {
                    items.remove(0);
                }
                let has_next = items.len() > self.page_size;
                items.truncate(self.page_size);
                Ok(Page { items, has_next })
            }
            Cursor::After(after) => {
                let mut items = table
                    .scan(&ScanSpec::range(
                        Some(with_ts(*after)),
                        Some(with_ts(Timestamp::MAX)),
                    ))
                    .await
                    .context(StoreSnafu)?;
                if items.first().is_some_and(|item| item.timestamp() == *after) {
                    items.remove(0);
                }
                items.reverse();
                Ok(Page {
                    items,
                    has_next: false,
                })
            }
        }
    }
    /// Serve `cursor` for the feed belonging to `subject`, cached at `key` in `cache` & stored in
    /// `table`
    ///
    /// A cold cache is loaded from `table` first. Failures of either are returned as such; a stale
    /// cache is never substituted for a store that can't be read.
    pub async fn paginate<R, S>(
        &self,
        cache: &BoundedListCache,
        key: &str,
        serializer: &S,
        table: &Table<R>,
        subject: impl Into<Value>,
        cursor: &Cursor,
    ) -> Result<Page<R>>
    where
        R: Record + Timestamped + Clone,
        S: Serializer<Item = R>,
    {
        let subject: Value = subject.into();
        let cached = cache
            .load(key, serializer, |limit| {
                let spec = ScanSpec::prefix(KeyTuple(vec![subject.clone()]))
                    .reverse()
                    .limit(limit);
                async move { table.scan(&spec).await }
            })
            .await
            .context(CacheSnafu)?;
        match self.paginate_cached(&cached, cursor) {
            Some(page) => Ok(page),
            None => {
                debug!("{} can't serve {:?} from cache; going to the store", key, cursor);
                self.paginate_store(table, subject, cursor).await
            }
        }
    }
}

/// Parse a cursor parameter given in microseconds; `None` unless it's a timestamp a row key can
/// carry
pub fn parse_cursor(text: &str) -> Option<Timestamp> {
    text.parse::<i64>()
        .ok()
        .filter(|micros| (0..=Timestamp::MAX.0).contains(micros))
        .map(Timestamp)
}

#[cfg(test)]
mod test {
    use super::*;

    use std::{sync::Arc, time::Duration};

    use crate::{
        config::{ExecutionMode, Settings},
        entities::{NewsFeedEntry, PostId, UserId},
        list_cache::RecordSerializer,
        memory::{MemoryCache, MemoryStore},
        metrics::Instruments,
    };

    #[derive(Clone, Debug, PartialEq)]
    struct Item(i64);

    impl Timestamped for Item {
        fn timestamp(&self) -> Timestamp {
            Timestamp(self.0)
        }
    }

    fn items(ts: &[i64]) -> Vec<Item> {
        ts.iter().map(|t| Item(*t)).collect()
    }

    #[test]
    fn cursors() {
        assert_eq!(Cursor::from_params(None, None).unwrap(), Cursor::First);
        assert_eq!(
            Cursor::from_params(Some(Timestamp(3)), None).unwrap(),
            Cursor::Before(Timestamp(3))
        );
        assert!(Cursor::from_params(Some(Timestamp(3)), Some(Timestamp(4))).is_err());
        assert_eq!(parse_cursor("17"), Some(Timestamp(17)));
        assert_eq!(parse_cursor("x"), None);
        assert_eq!(parse_cursor("0"), Some(Timestamp(0)));
        assert_eq!(parse_cursor("-1"), None);
        assert_eq!(parse_cursor("9999999999999999"), Some(Timestamp::MAX));
        assert_eq!(parse_cursor("10000000000000000"), None);
    }

    #[test]
    fn cached_windows() {
        let pager = CursorPaginator::new(2, 5);
        let full = items(&[7, 6, 5, 4, 3]);

        let page = pager.paginate_cached(&full, &Cursor::First).unwrap();
        assert_eq!(page.items, items(&[7, 6]));
        assert!(page.has_next);
        let page = pager
            .paginate_cached(&full, &Cursor::Before(Timestamp(6)))
            .unwrap();
        assert_eq!(page.items, items(&[5, 4]));
        assert!(page.has_next);
        // Runs off the end of a full list: can't prove there's nothing more
        assert!(
            pager
                .paginate_cached(&full, &Cursor::Before(Timestamp(4)))
                .is_none()
        );
        assert!(
            pager
                .paginate_cached(&full, &Cursor::Before(Timestamp(1)))
                .is_none()
        );

        // A short list is the whole feed
        let short = items(&[4, 3, 2]);
        let page = pager
            .paginate_cached(&short, &Cursor::Before(Timestamp(3)))
            .unwrap();
        assert_eq!(page.items, items(&[2]));
        assert!(!page.has_next);
        let page = pager
            .paginate_cached(&short, &Cursor::Before(Timestamp(1)))
            .unwrap();
        assert!(page.items.is_empty());
        assert!(!page.has_next);
        let page = pager.paginate_cached::<Item>(&[], &Cursor::First).unwrap();
        assert!(page.items.is_empty());

        // Newer-than ignores the page size
        let page = pager
            .paginate_cached(&full, &Cursor::After(Timestamp(3)))
            .unwrap();
        assert_eq!(page.items, items(&[7, 6, 5, 4]));
        assert!(!page.has_next);
        // ...but every entry of a full list being newer leaves a possible gap
        assert!(
            pager
                .paginate_cached(&full, &Cursor::After(Timestamp(1)))
                .is_none()
        );
    }

    async fn setup(cap: usize) -> (BoundedListCache, Table<NewsFeedEntry>) {
        let settings = Settings {
            list_capacity: cap,
            mode: ExecutionMode::Test,
            ..Default::default()
        };
        let table = Table::new(
            Arc::new(MemoryStore::new()),
            settings.mode,
            Duration::from_secs(1),
        );
        table.create_if_missing().await.unwrap();
        let cache = BoundedListCache::new(
            Arc::new(MemoryCache::new(16)),
            &settings,
            Arc::new(Instruments::new("newsfeed")),
        );
        (cache, table)
    }

    fn ts(page: &Page<NewsFeedEntry>) -> Vec<i64> {
        page.items.iter().map(|e| e.created_at.0).collect()
    }

    #[tokio::test]
    async fn store_pages() {
        let (_, table) = setup(5).await;
        let subject = UserId(3);
        for t in 1..=7 {
            table
                .put(&NewsFeedEntry::new(subject, Timestamp(t), PostId(100 + t)))
                .await
                .unwrap();
            // A neighbor whose entries must never leak into the page
            table
                .put(&NewsFeedEntry::new(UserId(4), Timestamp(t), PostId(t)))
                .await
                .unwrap();
        }
        let pager = CursorPaginator::new(2, 5);

        let page = pager
            .paginate_store(&table, subject, &Cursor::First)
            .await
            .unwrap();
        assert_eq!((ts(&page), page.has_next), (vec![7, 6], true));
        let page = pager
            .paginate_store(&table, subject, &Cursor::Before(Timestamp(4)))
            .await
            .unwrap();
        assert_eq!((ts(&page), page.has_next), (vec![3, 2], true));
        let page = pager
            .paginate_store(&table, subject, &Cursor::Before(Timestamp(2)))
            .await
            .unwrap();
        assert_eq!((ts(&page), page.has_next), (vec![1], false));
        let page = pager
            .paginate_store(&table, subject, &Cursor::After(Timestamp(4)))
            .await
            .unwrap();
        assert_eq!((ts(&page), page.has_next), (vec![7, 6, 5], false));
        let page = pager
            .paginate_store(&table, UserId(5), &Cursor::First)
            .await
            .unwrap();
        assert!(page.items.is_empty());
    }

    #[tokio::test]
    async fn walks_past_the_cache() {
        let (cache, table) = setup(5).await;
        let subject = UserId(3);
        for t in 1..=7 {
            table
                .put(&NewsFeedEntry::new(subject, Timestamp(t), PostId(100 + t)))
                .await
                .unwrap();
        }
        let pager = CursorPaginator::new(2, 5);
        let serializer = RecordSerializer::<NewsFeedEntry>::new();

        let mut cursor = Cursor::First;
        let mut seen = Vec::new();
        loop {
            let page = pager
                .paginate(&cache, "user_newsfeeds:3", &serializer, &table, subject, &cursor)
                .await
                .unwrap();
            seen.extend(ts(&page));
            if !page.has_next {
                break;
            }
            cursor = Cursor::Before(page.items.last().unwrap().created_at);
        }
        assert_eq!(seen, vec![7, 6, 5, 4, 3, 2, 1]);

        let page = pager
            .paginate(
                &cache,
                "user_newsfeeds:3",
                &serializer,
                &table,
                subject,
                &Cursor::After(Timestamp(5)),
            )
            .await
            .unwrap();
        assert_eq!((ts(&page), page.has_next), (vec![7, 6], false));
    }
}
