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

//! # newsfeed
//!
//! General (i.e. not documenting a particular struct or a method) documentation goes here.
//!
//! ## The Read Path
//!
//! A user's news feed is the list of posts written by the people they follow, newest first. It's
//! read far more often than it's written, so the design leans on making reads cheap:
//!
//! 1. every feed entry lives in a wide-column table whose row keys sort by (user, newest first);
//!    a page of feed is a single range scan (see [crate::row_key])
//! 2. the most recent entries of each feed are kept in a bounded list in the cache, so the first
//!    page or two never touch the store at all (see [crate::list_cache])
//! 3. when someone posts, the post is written to the author's own feed immediately, and to each
//!    follower's feed later, by background tasks working through the followers in batches (see
//!    [crate::fanout])
//!
//! The caches are kept up-to-date by events published on the write path (see [crate::events]);
//! an event arriving for a list that isn't cached is simply dropped. The next read loads it.
//!
//! ## Row Keys
//!
//! A row key is a fixed sequence of fields, each rendered to a fixed width so that byte-wise order
//! matches the order of the values: integers & timestamps are zero-padded. "Newest first" is then
//! just a reverse scan. The first field of a table may be "scattered" (its rendering reversed) so
//! that consecutive user ids don't all land on the same region of the key space. A partial key
//! (the leading fields only) is a prefix of every full key that begins with those fields, which is
//! what makes "all of user 42's feed" a prefix scan.
//!
//! ## The Data Store
//!
//! Two storage back-ends are provided: an in-memory store, suitable for tests & for running the
//! daemon locally, and [ScyllaDB]. ScyllaDB doesn't offer an ordered scan across partitions, so
//! each logical table is one partition whose clustering column is the encoded row key; the
//! [storage](crate::storage) trait doesn't promise more than that.
//!
//! [ScyllaDB]: https://www.scylladb.com
//!
//! ## Background Tasks
//!
//! Fan-out runs on the background task machinery in [crate::background_tasks]: tasks are
//! serialized to MessagePack, written to a queue in the store, and leased out to processors.
//! A processor that dies mid-task leaves a lease that expires; the task will be retried, up to a
//! limit, after which it is buried. Since the entries a fan-out batch writes are idempotent
//! (same key, same value), a retry is harmless.
//!
//! ## Metrics
//!
//! See [crate::metrics].
