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

//! # The newsfeed Integration Tests
//!
//! # Introduction
//!
//! The Rust test framework has no notion of fixtures, nor of setup & teardown that apply to a
//! group of tests. Following T.J. Telan's [approach], each integration test program here opts-out
//! of the default harness:
//!
//! ```toml
//! [[test]]
//!     name = "memory"
//!     harness = false
//! ```
//!
//! and supplies its own `main()`, using [libtest-mimic] to remain a well-behaved `cargo test`
//! citizen. Each program is a fixture: it sets-up one storage configuration & runs every scenario
//! in this crate against it.
//!
//! [approach]: https://tjtelan.com/blog/rust-custom-test-harness/
//! [libtest-mimic]: https://docs.rs/libtest-mimic/latest/libtest_mimic/index.html
//!
//! # Project Structure
//!
//! Scenarios (which know nothing of the storage they're running against) live in this library.
//! Code relating to the test framework itself (the `Test` struct, configuration) belongs in
//! `tests/common`. The test programs themselves go in `tests`.
use std::{sync::Arc, time::Duration};

use libtest_mimic::Failed;

use newsfeed::{
    background_tasks::{
        Backend as TasksBackend, BackgroundTasks, Config, Context, DEFAULT_QUEUE, NEWSFEEDS_QUEUE,
        run_until_idle,
    },
    config::{ExecutionMode, Settings},
    counters::Counters,
    events::EventBus,
    fanout::FanoutCoordinator,
    graph::Friendships,
    memory::MemoryCache,
    metrics::Instruments,
    newsfeeds::NewsFeeds,
    storage::Backend as StorageBackend,
};

pub mod feeds;
pub mod store;

/// The storage a scenario runs against
#[derive(Clone)]
pub struct Backends {
    pub storage: Arc<dyn StorageBackend + Send + Sync>,
    pub tasks: Arc<dyn TasksBackend + Send + Sync>,
}

/// Settings suitable for tests: test-mode table names, small lists & pages
pub fn test_settings(list_capacity: usize, page_size: usize, fanout_batch_size: usize) -> Settings {
    Settings {
        list_capacity,
        page_size,
        fanout_batch_size,
        mode: ExecutionMode::Test,
        ..Default::default()
    }
}

/// Everything a scenario needs, built over a [Backends] & a fresh cache
///
/// Construction drops & re-creates the test tables, and runs any tasks left over from an earlier
/// scenario, so each scenario starts from empty feeds.
pub struct World {
    pub feeds: Arc<NewsFeeds>,
    pub graph: Arc<Friendships>,
    pub tasks: Arc<BackgroundTasks>,
    pub coordinator: FanoutCoordinator,
}

impl World {
    pub async fn new(backends: &Backends, settings: Settings) -> Result<World, Failed> {
        let instruments = Arc::new(Instruments::new("newsfeed-test"));
        let cache = Arc::new(MemoryCache::new(1024));
        let feeds = Arc::new(NewsFeeds::new(
            backends.storage.clone(),
            cache.clone(),
            &settings,
            instruments.clone(),
        ));
        let graph = Arc::new(Friendships::new(
            backends.storage.clone(),
            settings.mode,
            settings.io_timeout,
        ));
        let tasks = Arc::new(BackgroundTasks::new(
            backends.tasks.clone(),
            Config::default(),
            instruments.clone(),
        ));
        let context = Context {
            feeds: feeds.clone(),
            events: Arc::new(EventBus::new(feeds.clone(), Counters::new(cache, &settings))),
            graph: graph.clone(),
            tasks: tasks.clone(),
            settings,
        };
        let world = World {
            feeds,
            graph,
            tasks,
            coordinator: FanoutCoordinator::new(context, instruments),
        };

        world.drain().await?;
        world.feeds.table().drop_table().await?;
        world.graph.drop_tables().await?;
        world.feeds.create_if_missing().await?;
        world.graph.create_if_missing().await?;
        Ok(world)
    }
    /// Run background tasks until there are none left on either queue; return the number run
    pub async fn drain(&self) -> Result<usize, Failed> {
        let context = self.coordinator.context().clone();
        let mut total = 0;
        loop {
            let mut count = 0;
            for queue in [DEFAULT_QUEUE, NEWSFEEDS_QUEUE] {
                count += run_until_idle(
                    &self.tasks.receiver(queue),
                    context.clone(),
                    Duration::from_secs(30),
                )
                .await?;
            }
            if count == 0 {
                break;
            }
            total += count;
        }
        Ok(total)
    }
}
