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
//! The read path of a social network's news feeds: a sorted wide-column store keyed by composite
//! row keys, a bounded list cache in front of it, asynchronous fan-out of new posts to followers'
//! feeds & cursor pagination over the lot. The daemon (`newsfeedd`) serves it over HTTP.
//!
//! Right now, the library crate has the same name as the binary, meaning that `rustdoc` will
//! ignore the binary create. See [_docs] for the general documentation.
pub mod _docs;
#[path = "background-tasks.rs"]
pub mod background_tasks;
pub mod cache;
pub mod config;
pub mod counters;
pub mod entities;
pub mod events;
pub mod fanout;
pub mod graph;
pub mod http;
#[path = "list-cache.rs"]
pub mod list_cache;
pub mod memory;
pub mod metrics;
pub mod newsfeeds;
pub mod paginate;
#[path = "row-key.rs"]
pub mod row_key;
pub mod scylla;
pub mod storage;
pub mod util;
#[path = "wide-column.rs"]
pub mod wide_column;
