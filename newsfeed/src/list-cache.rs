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

//! # Bounded List Caching
//!
//! ## Introduction
//!
//! Reading a feed from the store is a range scan; cheap enough, but the most recent page of a
//! popular feed gets read far more often than it changes. [BoundedListCache] keeps the most recent
//! `capacity` entries for each subject in a cache list, newest first, in front of the store.
//!
//! ## Semantics
//!
//! [BoundedListCache::load] is cache-aside: on a hit, return what's cached; on a miss, call the
//! loader for up to `capacity` items, write them to the cache with a TTL, and return them.
//!
//! [BoundedListCache::push] is called by write paths to keep a cached list current: the new item
//! goes onto the head of the list, and the list is trimmed back to `capacity`, atomically. If the
//! list isn't cached, the push does nothing; the next load will find the item in the store. Were a
//! push to create the list, it would hold a single item & look to readers like a complete (short)
//! feed.
//!
//! ## Expiry
//!
//! The TTL is set when a list is loaded, and neither hits nor pushes extend it. A frequently-read
//! list is thus still re-synchronized with the store at least once per TTL, which bounds the
//! lifetime of any inconsistency (a lost push, say) no matter how popular the feed.
//!
//! ## Serialization
//!
//! Cached items are opaque bytes to the cache; a [Serializer] supplied by the caller converts them.
//! Two are provided: [RecordSerializer] for wide-column [Record]s & [EntitySerializer] for
//! relational-style [Entity]s (objects owned by another service that we merely cache).

use std::{marker::PhantomData, sync::Arc, time::Duration};

use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use snafu::{Backtrace, IntoError, prelude::*};
use tracing::debug;

use crate::{
    cache::{self, Backend as CacheBackend},
    config::Settings,
    counter_add,
    metrics::{self, Instruments, Sort},
    row_key::{self, FieldMap, Value},
    wide_column::Record,
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Cache {op} on {key} failed: {source}"))]
    Cache {
        op: &'static str,
        key: String,
        source: cache::Error,
    },
    #[snafu(display("Failed to deserialize a cached {kind}: {source}"))]
    De {
        kind: &'static str,
        source: serde_json::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("While loading {key} from the store, {source}"))]
    Load {
        key: String,
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
    #[snafu(display("A cached {kind} was malformed: {source}"))]
    Malformed {
        kind: &'static str,
        source: row_key::Error,
    },
    #[snafu(display("Failed to serialize a {kind}: {source}"))]
    Ser {
        kind: &'static str,
        source: serde_json::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Cache {op} on {key} timed-out after {timeout:?}"))]
    Timeout {
        op: &'static str,
        key: String,
        timeout: Duration,
        source: tokio::time::error::Elapsed,
        backtrace: Backtrace,
    },
    #[snafu(display("Expected a cached {expected}, found {found}"))]
    WrongKind {
        expected: &'static str,
        found: String,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          serializers                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Convert cached items to & from bytes
pub trait Serializer {
    type Item;
    fn serialize(&self, item: &Self::Item) -> Result<Vec<u8>>;
    fn deserialize(&self, buf: &[u8]) -> Result<Self::Item>;
}

/// Serialize a wide-column [Record] as a JSON object holding every field of its schema, tagged
/// with the record's table
pub struct RecordSerializer<R>(PhantomData<fn() -> R>);

impl<R> RecordSerializer<R> {
    pub fn new() -> RecordSerializer<R> {
        RecordSerializer(PhantomData)
    }
}

impl<R> Default for RecordSerializer<R> {
    fn default() -> Self {
        Self::new()
    }
}

const RECORD_TAG: &str = "record";

impl<R: Record> Serializer for RecordSerializer<R> {
    type Item = R;
    fn serialize(&self, item: &R) -> Result<Vec<u8>> {
        let mut object = serde_json::Map::new();
        object.insert(RECORD_TAG.to_owned(), R::schema().table.into());
        for (name, value) in item.to_fields().iter() {
            if let Some(value) = value {
                object.insert(
                    name.to_string(),
                    serde_json::to_value(value).context(SerSnafu {
                        kind: R::schema().table,
                    })?,
                );
            }
        }
        serde_json::to_vec(&object).context(SerSnafu {
            kind: R::schema().table,
        })
    }
    fn deserialize(&self, buf: &[u8]) -> Result<R> {
        let kind = R::schema().table;
        let mut object: serde_json::Map<String, serde_json::Value> =
            serde_json::from_slice(buf).context(DeSnafu { kind })?;
        let tag = object.remove(RECORD_TAG);
        ensure!(
            tag.as_ref().and_then(|t| t.as_str()) == Some(kind),
            WrongKindSnafu {
                expected: kind,
                found: format!("{:?}", tag)
            }
        );
        let mut fields = FieldMap::new();
        for spec in R::schema().fields {
            if let Some(value) = object.remove(spec.name) {
                fields.insert(
                    spec.name,
                    Some(serde_json::from_value::<Value>(value).context(DeSnafu { kind })?),
                );
            }
        }
        R::from_fields(&fields).context(MalformedSnafu { kind })
    }
}

/// An object owned by some other (relational) service, cached here by value
pub trait Entity: Serialize + DeserializeOwned {
    /// "app.model", after the relational convention
    const MODEL: &'static str;
    fn pk(&self) -> i64;
}

#[derive(Deserialize, Serialize)]
struct Envelope<T> {
    model: String,
    pk: i64,
    fields: T,
}

/// Serialize an [Entity] as `{"model": ..., "pk": ..., "fields": {...}}`
pub struct EntitySerializer<E>(PhantomData<fn() -> E>);

impl<E> EntitySerializer<E> {
    pub fn new() -> EntitySerializer<E> {
        EntitySerializer(PhantomData)
    }
}

impl<E> Default for EntitySerializer<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Entity> Serializer for EntitySerializer<E> {
    type Item = E;
    fn serialize(&self, item: &E) -> Result<Vec<u8>> {
        serde_json::to_vec(&Envelope {
            model: E::MODEL.to_owned(),
            pk: item.pk(),
            fields: item,
        })
        .context(SerSnafu { kind: E::MODEL })
    }
    fn deserialize(&self, buf: &[u8]) -> Result<E> {
        let envelope: Envelope<E> =
            serde_json::from_slice(buf).context(DeSnafu { kind: E::MODEL })?;
        ensure!(
            envelope.model == E::MODEL,
            WrongKindSnafu {
                expected: E::MODEL,
                found: envelope.model
            }
        );
        Ok(envelope.fields)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        BoundedListCache                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

inventory::submit! { metrics::Registration::new("cache.list.hits", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("cache.list.misses", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("cache.list.pushes", Sort::IntegralCounter) }

/// Capped, TTL'd, cache-aside lists
#[derive(Clone)]
pub struct BoundedListCache {
    backend: Arc<dyn CacheBackend + Send + Sync>,
    capacity: usize,
    ttl: Duration,
    timeout: Duration,
    instruments: Arc<Instruments>,
}

impl BoundedListCache {
    pub fn new(
        backend: Arc<dyn CacheBackend + Send + Sync>,
        settings: &Settings,
        instruments: Arc<Instruments>,
    ) -> BoundedListCache {
        BoundedListCache {
            backend,
            capacity: settings.list_capacity,
            ttl: settings.list_ttl,
            timeout: settings.io_timeout,
            instruments,
        }
    }
    pub fn capacity(&self) -> usize {
        self.capacity
    }
    pub fn backend(&self) -> &Arc<dyn CacheBackend + Send + Sync> {
        &self.backend
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
    /// Return the list at `key`, loading it via `loader` on a miss
    ///
    /// `loader` is handed the list capacity & should return at most that many items, newest
    /// first. Whatever it returns (even nothing) is cached.
    pub async fn load<S, F, Fut, E>(
        &self,
        key: &str,
        serializer: &S,
        loader: F,
    ) -> Result<Vec<S::Item>>
    where
        S: Serializer,
        F: FnOnce(usize) -> Fut,
        Fut: Future<Output = std::result::Result<Vec<S::Item>, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        if let Some(cached) = self.call("range", key, self.backend.range(key)).await? {
            counter_add!(self.instruments, "cache.list.hits", 1, &[]);
            return cached
                .iter()
                .map(|buf| serializer.deserialize(buf))
                .collect::<Result<Vec<_>>>();
        }

        counter_add!(self.instruments, "cache.list.misses", 1, &[]);
        debug!("cache miss on {}; loading", key);
        let mut items = loader(self.capacity)
            .await
            .map_err(|err| LoadSnafu { key }.into_error(Box::new(err)))?;
        items.truncate(self.capacity);
        let serialized = items
            .iter()
            .map(|item| serializer.serialize(item))
            .collect::<Result<Vec<_>>>()?;
        self.call(
            "store",
            key,
            self.backend.store_list(key, &serialized, self.ttl),
        )
        .await?;
        Ok(items)
    }
    /// Push `item` onto the head of the list at `key`, if that list is cached; return true if it
    /// was
    pub async fn push<S: Serializer>(
        &self,
        key: &str,
        serializer: &S,
        item: &S::Item,
    ) -> Result<bool> {
        let buf = serializer.serialize(item)?;
        let applied = self
            .call("push", key, self.backend.push_trim(key, &buf, self.capacity))
            .await?;
        counter_add!(
            self.instruments,
            "cache.list.pushes",
            1,
            &[KeyValue::new("applied", applied)]
        );
        Ok(applied)
    }
    /// Drop the list at `key`; the next [BoundedListCache::load] will reload it
    pub async fn invalidate(&self, key: &str) -> Result<()> {
        self.call("delete", key, self.backend.delete(key)).await
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::{
        entities::{NewsFeedEntry, Post, PostId, Timestamp, UserId},
        memory::MemoryCache,
    };

    fn cache(capacity: usize, ttl: Duration) -> BoundedListCache {
        BoundedListCache::new(
            Arc::new(MemoryCache::new(16)),
            &Settings {
                list_capacity: capacity,
                list_ttl: ttl,
                ..Default::default()
            },
            Arc::new(Instruments::new("newsfeed")),
        )
    }

    fn entry(ts: i64) -> NewsFeedEntry {
        NewsFeedEntry::new(UserId(1), Timestamp(ts), PostId(ts * 10))
    }

    // Loader over the "store" `entries` (newest first) counting its invocations
    async fn load_entries(
        cache: &BoundedListCache,
        entries: &[NewsFeedEntry],
        calls: &AtomicUsize,
    ) -> Vec<NewsFeedEntry> {
        cache
            .load("feed:1", &RecordSerializer::<NewsFeedEntry>::new(), |limit| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, std::io::Error>(entries.iter().take(limit).cloned().collect())
            })
            .await
            .unwrap()
    }

    #[test]
    fn serializers() {
        let ser = RecordSerializer::<NewsFeedEntry>::new();
        let buf = ser.serialize(&entry(5)).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&buf).unwrap();
        assert_eq!(json["record"], "newsfeeds");
        assert_eq!(json["post_id"], 50);
        assert_eq!(ser.deserialize(&buf).unwrap(), entry(5));

        let post = Post {
            id: PostId(3),
            user_id: UserId(1),
            created_at: Timestamp(99),
            content: "hello".to_owned(),
        };
        let ser = EntitySerializer::<Post>::new();
        let buf = ser.serialize(&post).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&buf).unwrap();
        assert_eq!(json["model"], "posts.post");
        assert_eq!(json["pk"], 3);
        assert_eq!(ser.deserialize(&buf).unwrap(), post);

        // Feeding one shape to the other's serializer is an error, not a mis-read
        assert!(RecordSerializer::<NewsFeedEntry>::new()
            .deserialize(&buf)
            .is_err());
    }

    #[tokio::test]
    async fn cold_then_warm() {
        let cache = cache(3, Duration::from_secs(60));
        let store = (1..=5).rev().map(entry).collect::<Vec<_>>();
        let calls = AtomicUsize::new(0);

        let got = load_entries(&cache, &store, &calls).await;
        assert_eq!(got, store[..3].to_vec());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let got = load_entries(&cache, &store, &calls).await;
        assert_eq!(got, store[..3].to_vec());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Pushes land on the head & the list stays capped
        assert!(cache
            .push("feed:1", &RecordSerializer::new(), &entry(6))
            .await
            .unwrap());
        let got = load_entries(&cache, &store, &calls).await;
        assert_eq!(got, vec![entry(6), entry(5), entry(4)]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pushes_to_cold_keys_are_dropped() {
        let cache = cache(3, Duration::from_secs(60));
        assert!(!cache
            .push("feed:1", &RecordSerializer::new(), &entry(6))
            .await
            .unwrap());
        let calls = AtomicUsize::new(0);
        let got = load_entries(&cache, &[entry(2), entry(1)], &calls).await;
        assert_eq!(got, vec![entry(2), entry(1)]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_lists_are_cached() {
        let cache = cache(3, Duration::from_secs(60));
        let calls = AtomicUsize::new(0);
        assert!(load_entries(&cache, &[], &calls).await.is_empty());
        assert!(load_entries(&cache, &[], &calls).await.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // ...and can be pushed to
        assert!(cache
            .push("feed:1", &RecordSerializer::new(), &entry(1))
            .await
            .unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn hits_do_not_extend_the_ttl() {
        let cache = cache(3, Duration::from_secs(10));
        let store = vec![entry(1)];
        let calls = AtomicUsize::new(0);

        load_entries(&cache, &store, &calls).await;
        tokio::time::advance(Duration::from_secs(6)).await;
        load_entries(&cache, &store, &calls).await;
        cache
            .push("feed:1", &RecordSerializer::new(), &entry(2))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // Eleven seconds after the load; had the hit or the push refreshed the TTL, this would
        // still be cached
        tokio::time::advance(Duration::from_secs(5)).await;
        let got = load_entries(&cache, &store, &calls).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(got, store);
    }

    #[tokio::test]
    async fn loader_failures_surface() {
        let cache = cache(3, Duration::from_secs(10));
        let result = cache
            .load("feed:1", &RecordSerializer::<NewsFeedEntry>::new(), |_| async {
                Err(std::io::Error::other("store down"))
            })
            .await;
        assert!(matches!(result, Err(Error::Load { .. })));
        // Nothing was cached
        assert!(cache.backend().range("feed:1").await.unwrap().is_none());
    }
}
