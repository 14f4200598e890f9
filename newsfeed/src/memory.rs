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

//! # memory
//!
//! In-process implementations of the three backends newsfeed needs: a wide-column store
//! ([MemoryStore]), a list & counter cache ([MemoryCache]) and a background task queue
//! ([MemoryTasks]).
//!
//! These back the test suites & single-node deployments. They honor the same atomicity contracts as
//! the networked backends (each operation takes a single lock), but of course nothing survives a
//! restart.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    num::NonZeroUsize,
    ops::Bound,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lru::LruCache;
use snafu::{Backtrace, prelude::*};
use tap::Pipe;
use tokio::{
    sync::{Mutex, RwLock},
    time::Instant,
};
use uuid::Uuid;

use crate::{
    background_tasks::{self, FlatTask, TaskState},
    cache,
    storage::{self, Columns, Row, ScanRange},
    util::exactly_two,
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{key} holds a {found}, not a {expected}"))]
    WrongType {
        key: String,
        expected: &'static str,
        found: &'static str,
        backtrace: Backtrace,
    },
    #[snafu(display("No such table {table}"))]
    NoSuchTable { table: String, backtrace: Backtrace },
    #[snafu(display("{table} has no column family {family}"))]
    UnknownFamily {
        table: String,
        family: String,
        backtrace: Backtrace,
    },
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          MemoryStore                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Default)]
struct MemoryTable {
    families: Vec<String>,
    rows: BTreeMap<Vec<u8>, Columns>,
}

/// A sorted, in-memory wide-column store
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<String, MemoryTable>>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }
}

fn bounds(range: &ScanRange) -> (Bound<Vec<u8>>, Bound<Vec<u8>>) {
    fn or_unbounded(key: &Option<Vec<u8>>, f: fn(Vec<u8>) -> Bound<Vec<u8>>) -> Bound<Vec<u8>> {
        key.clone().map(f).unwrap_or(Bound::Unbounded)
    }
    if range.reverse {
        (
            or_unbounded(&range.stop, Bound::Excluded),
            or_unbounded(&range.start, Bound::Included),
        )
    } else {
        (
            or_unbounded(&range.start, Bound::Included),
            or_unbounded(&range.stop, Bound::Excluded),
        )
    }
}

#[async_trait]
impl storage::Backend for MemoryStore {
    async fn create_table(
        &self,
        table: &str,
        families: &[&'static str],
    ) -> Result<(), storage::Error> {
        self.tables
            .write()
            .await
            .entry(table.to_owned())
            .or_insert_with(|| MemoryTable {
                families: families.iter().map(|f| f.to_string()).collect(),
                rows: BTreeMap::new(),
            });
        Ok(())
    }
    async fn drop_table(&self, table: &str) -> Result<(), storage::Error> {
        self.tables.write().await.remove(table);
        Ok(())
    }
    async fn put_rows(&self, table: &str, rows: &[Row]) -> Result<(), storage::Error> {
        let mut tables = self.tables.write().await;
        let target = tables
            .get_mut(table)
            .context(NoSuchTableSnafu { table })
            .map_err(storage::Error::new)?;
        // Validate the whole batch before applying any of it
        for column in rows.iter().flat_map(|row| row.columns.keys()) {
            let family = exactly_two(column.split(':'))
                .map(|(family, _)| family)
                .unwrap_or(column.as_str());
            ensure!(
                target.families.iter().any(|f| f == family),
                UnknownFamilySnafu { table, family }
            );
        }
        for row in rows {
            target
                .rows
                .entry(row.key.clone())
                .or_default()
                .extend(row.columns.clone());
        }
        Ok(())
    }
    async fn get_row(&self, table: &str, key: &[u8]) -> Result<Option<Columns>, storage::Error> {
        self.tables
            .read()
            .await
            .get(table)
            .context(NoSuchTableSnafu { table })
            .map_err(storage::Error::new)?
            .rows
            .get(key)
            .cloned()
            .pipe(Ok)
    }
    async fn delete_row(&self, table: &str, key: &[u8]) -> Result<(), storage::Error> {
        self.tables
            .write()
            .await
            .get_mut(table)
            .context(NoSuchTableSnafu { table })
            .map_err(storage::Error::new)?
            .rows
            .remove(key);
        Ok(())
    }
    async fn scan(&self, table: &str, range: &ScanRange) -> Result<Vec<Row>, storage::Error> {
        let tables = self.tables.read().await;
        let rows = &tables
            .get(table)
            .context(NoSuchTableSnafu { table })
            .map_err(storage::Error::new)?
            .rows;
        let (lower, upper) = bounds(range);
        // `BTreeMap::range` panics on inverted bounds
        if let (Bound::Included(l) | Bound::Excluded(l), Bound::Included(u) | Bound::Excluded(u)) =
            (&lower, &upper)
        {
            if l > u {
                return Ok(Vec::new());
            }
        }
        if let (Bound::Excluded(l), Bound::Excluded(u)) = (&lower, &upper) {
            if l == u {
                return Ok(Vec::new());
            }
        }
        let found = rows.range((lower, upper));
        let to_row = |(key, columns): (&Vec<u8>, &Columns)| Row {
            key: key.clone(),
            columns: columns.clone(),
        };
        let limit = range.limit.unwrap_or(usize::MAX);
        Ok(if range.reverse {
            found.rev().take(limit).map(to_row).collect()
        } else {
            found.take(limit).map(to_row).collect()
        })
    }
}

impl From<Error> for storage::Error {
    fn from(value: Error) -> Self {
        storage::Error::new(value)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          MemoryCache                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug)]
enum CacheValue {
    List(VecDeque<Vec<u8>>),
    Count(i64),
}

impl CacheValue {
    fn kind(&self) -> &'static str {
        match self {
            CacheValue::List(_) => "list",
            CacheValue::Count(_) => "counter",
        }
    }
}

#[derive(Debug)]
struct CacheEntry {
    value: CacheValue,
    expires: Option<Instant>,
}

/// An LRU-bounded, in-memory cache
///
/// Once `capacity` keys are held, writing a new key evicts the least-recently used one, which
/// callers can't distinguish from expiry.
#[derive(Debug)]
pub struct MemoryCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
}

impl MemoryCache {
    pub fn new(capacity: usize) -> MemoryCache {
        MemoryCache {
            entries: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN),
            )),
        }
    }
}

// Look up `key`, evicting it if it's expired
fn live<'a>(
    entries: &'a mut LruCache<String, CacheEntry>,
    key: &str,
) -> Option<&'a mut CacheEntry> {
    let expired = entries
        .peek(key)
        .and_then(|entry| entry.expires)
        .is_some_and(|expires| expires <= Instant::now());
    if expired {
        entries.pop(key);
        return None;
    }
    entries.get_mut(key)
}

fn wrong_type(key: &str, expected: &'static str, value: &CacheValue) -> cache::Error {
    cache::Error::new(
        WrongTypeSnafu {
            key,
            expected,
            found: value.kind(),
        }
        .build(),
    )
}

#[async_trait]
impl cache::Backend for MemoryCache {
    async fn range(&self, key: &str) -> Result<Option<Vec<Vec<u8>>>, cache::Error> {
        let mut entries = self.entries.lock().await;
        match live(&mut entries, key) {
            Some(CacheEntry {
                value: CacheValue::List(items),
                ..
            }) => Ok(Some(items.iter().cloned().collect())),
            Some(other) => Err(wrong_type(key, "list", &other.value)),
            None => Ok(None),
        }
    }
    async fn store_list(
        &self,
        key: &str,
        items: &[Vec<u8>],
        ttl: Duration,
    ) -> Result<(), cache::Error> {
        self.entries.lock().await.put(
            key.to_owned(),
            CacheEntry {
                value: CacheValue::List(items.iter().cloned().collect()),
                expires: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }
    async fn push_trim(&self, key: &str, item: &[u8], cap: usize) -> Result<bool, cache::Error> {
        let mut entries = self.entries.lock().await;
        match live(&mut entries, key) {
            Some(CacheEntry {
                value: CacheValue::List(items),
                ..
            }) => {
                items.push_front(item.to_vec());
                items.truncate(cap);
                Ok(true)
            }
            Some(other) => Err(wrong_type(key, "list", &other.value)),
            None => Ok(false),
        }
    }
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, cache::Error> {
        let mut entries = self.entries.lock().await;
        Ok(match live(&mut entries, key) {
            Some(entry) => {
                entry.expires = Some(Instant::now() + ttl);
                true
            }
            None => false,
        })
    }
    async fn delete(&self, key: &str) -> Result<(), cache::Error> {
        self.entries.lock().await.pop(key);
        Ok(())
    }
    async fn incr(&self, key: &str) -> Result<Option<i64>, cache::Error> {
        self.add(key, 1).await
    }
    async fn decr(&self, key: &str) -> Result<Option<i64>, cache::Error> {
        self.add(key, -1).await
    }
    async fn get_count(&self, key: &str) -> Result<Option<i64>, cache::Error> {
        let mut entries = self.entries.lock().await;
        match live(&mut entries, key) {
            Some(CacheEntry {
                value: CacheValue::Count(n),
                ..
            }) => Ok(Some(*n)),
            Some(other) => Err(wrong_type(key, "counter", &other.value)),
            None => Ok(None),
        }
    }
    async fn set_count(&self, key: &str, value: i64, ttl: Duration) -> Result<(), cache::Error> {
        self.entries.lock().await.put(
            key.to_owned(),
            CacheEntry {
                value: CacheValue::Count(value),
                expires: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }
}

impl MemoryCache {
    async fn add(&self, key: &str, delta: i64) -> Result<Option<i64>, cache::Error> {
        let mut entries = self.entries.lock().await;
        match live(&mut entries, key) {
            Some(CacheEntry {
                value: CacheValue::Count(n),
                ..
            }) => {
                *n += delta;
                Ok(Some(*n))
            }
            Some(other) => Err(wrong_type(key, "counter", &other.value)),
            None => Ok(None),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          MemoryTasks                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// An in-memory background task queue
#[derive(Debug, Default)]
pub struct MemoryTasks {
    // Ordered by creation
    tasks: Mutex<Vec<FlatTask>>,
}

impl MemoryTasks {
    pub fn new() -> MemoryTasks {
        MemoryTasks::default()
    }
    /// Number of tasks on `queue` still to be run
    pub async fn pending(&self, queue: &str) -> usize {
        self.tasks
            .lock()
            .await
            .iter()
            .filter(|t| t.queue == queue && t.state == TaskState::Pending)
            .count()
    }
}

fn find<'a>(
    tasks: &'a mut [FlatTask],
    id: &Uuid,
) -> background_tasks::Result<&'a mut FlatTask> {
    tasks
        .iter_mut()
        .find(|t| t.id == *id)
        .context(background_tasks::NoSuchTaskSnafu { id: *id })
}

#[async_trait]
impl background_tasks::Backend for MemoryTasks {
    async fn write_task(
        &self,
        queue: &str,
        tag: &Uuid,
        buf: &[u8],
    ) -> background_tasks::Result<Uuid> {
        let now = Utc::now();
        let id = Uuid::new_v4();
        self.tasks.lock().await.push(FlatTask {
            id,
            queue: queue.to_owned(),
            created: now,
            task: buf.to_vec(),
            tag: *tag,
            lease_expires: now,
            attempts: 0,
            state: TaskState::Pending,
            last_error: None,
        });
        Ok(id)
    }
    async fn lease_task(
        &self,
        queue: &str,
        lease: Duration,
    ) -> background_tasks::Result<Option<FlatTask>> {
        let now = Utc::now();
        let mut tasks = self.tasks.lock().await;
        Ok(tasks
            .iter_mut()
            .find(|t| t.queue == queue && t.state == TaskState::Pending && t.lease_expires <= now)
            .map(|task| {
                task.lease_expires =
                    now + chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::zero());
                task.attempts += 1;
                task.clone()
            }))
    }
    async fn close_task(&self, id: &Uuid) -> background_tasks::Result<()> {
        find(&mut self.tasks.lock().await, id)?.state = TaskState::Done;
        Ok(())
    }
    async fn release_task(
        &self,
        id: &Uuid,
        not_before: DateTime<Utc>,
        reason: &str,
    ) -> background_tasks::Result<()> {
        let mut tasks = self.tasks.lock().await;
        let task = find(&mut tasks, id)?;
        task.lease_expires = not_before;
        task.last_error = Some(reason.to_owned());
        Ok(())
    }
    async fn bury_task(&self, id: &Uuid, reason: &str) -> background_tasks::Result<()> {
        let mut tasks = self.tasks.lock().await;
        let task = find(&mut tasks, id)?;
        task.state = TaskState::Dead;
        task.last_error = Some(reason.to_owned());
        Ok(())
    }
    async fn dead_tasks(&self, queue: &str) -> background_tasks::Result<Vec<FlatTask>> {
        Ok(self
            .tasks
            .lock()
            .await
            .iter()
            .filter(|t| t.queue == queue && t.state == TaskState::Dead)
            .cloned()
            .collect())
    }
}
