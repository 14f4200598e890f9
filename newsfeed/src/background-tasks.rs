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

//! # Background Task Processing
//!
//! Fanning a post out to a few thousand followers is not something to do on the request path. This
//! module provides a small persistent, multi-queue task system: request handlers "send" tasks,
//! which are serialized to [MessagePack] & written to a [Backend]; one [Processor] per queue leases
//! them back out & drives them to completion.
//!
//! [MessagePack]: https://msgpack.org/
//!
//! # Delivery
//!
//! Once [Sender::send] returns, the task has been persisted & won't be lost should the process
//! exit before it runs. Processing is at-least-once: a task is leased for a bounded time, and if
//! its processor dies mid-flight another will pick it up once the lease lapses. Tasks should
//! therefore be idempotent.
//!
//! A task that fails (or times-out) is released for another attempt after
//! [Config::retry_delay], up to [Config::max_attempts] attempts in total. After that it is moved to
//! the dead letter set, where it stays (for inspection) until someone deals with it.
//!
//! # Queues
//!
//! Each task type names the queue it goes on ([TaggedTask::queue]); processors are started per
//! queue, so a flood of tasks on one (fan-out, say) won't starve another.

use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc, task::Poll, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use pin_project::pin_project;
use rmp_serde::to_vec;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, prelude::*};
use tokio::{
    sync::Notify,
    task::{Id, JoinError, JoinHandle, JoinSet},
};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::{
    config::Settings,
    counter_add,
    events::EventBus,
    gauge_setu,
    graph::FollowerSource,
    metrics::{self, Instruments, Sort},
    newsfeeds::NewsFeeds,
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    // Generic error variant trait implementations can use
    #[snafu(display("{source}"))]
    Background {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to mark a task complete: {source}"))]
    Completion {
        #[snafu(source(from(Error, Box::new)))]
        source: Box<Error>,
    },
    #[snafu(display("Failed to deserialize a task: {source}"))]
    #[snafu(visibility(pub))]
    De {
        source: rmp_serde::decode::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to record a task failure: {source}"))]
    Failure {
        #[snafu(source(from(Error, Box::new)))]
        source: Box<Error>,
    },
    #[snafu(display("{tag} is not a recognized task type"))]
    Id { tag: Uuid },
    #[snafu(display("Task processing failed to run to completion: {source}"))]
    Join {
        source: tokio::task::JoinError,
        backtrace: Backtrace,
    },
    #[snafu(display("No task {id}"))]
    #[snafu(visibility(pub(crate)))]
    NoSuchTask { id: Uuid, backtrace: Backtrace },
    #[snafu(display("Timeout shutting-down the task processor: {source}"))]
    ShutdownTimeout {
        source: tokio::time::error::Elapsed,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to pick-up a new task: {source}"))]
    Take {
        #[snafu(source(from(Error, Box::new)))]
        source: Box<Error>,
    },
    #[snafu(display("Tried to remove an unknown TaskId"))]
    TaskId { backtrace: Backtrace },
    #[snafu(display("Failed to serialize a task to messagepack: {source}"))]
    TaskSer {
        source: rmp_serde::encode::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to wait for in-flight tasks: {source}"))]
    Timeout { source: tokio::time::error::Elapsed },
}

impl Error {
    pub fn new(err: impl std::error::Error + Send + Sync + 'static) -> Error {
        Error::Background {
            source: Box::new(err),
            backtrace: Backtrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             tasks                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The queue on which most tasks go
pub const DEFAULT_QUEUE: &str = "default";
/// The queue reserved for per-follower fan-out work
pub const NEWSFEEDS_QUEUE: &str = "newsfeeds";

/// Trait defining a "task" for our purposes.
///
/// Note that `exec()` consumes the task.
// Must be object-safe so that `process()` can handle tasks generically; hence the type parameter
// at the trait level & the `Box<Self>` receiver.
#[async_trait]
pub trait Task<C>: Send {
    async fn exec(self: Box<Self>, context: C) -> Result<()>;
    fn timeout(&self) -> Option<Duration>;
}

/// A [Task] with a per-type "tag" (used to find its deserializer) & a home queue
pub trait TaggedTask<C>: Task<C> {
    type Tag;
    fn get_tag() -> Self::Tag;
    fn queue() -> &'static str {
        DEFAULT_QUEUE
    }
}

/// Trait defining the ability to collect, or "send" [Task]s.
///
/// Generic over the [Task] type (rather than making `send()` generic) so that implementors can
/// express additional constraints on the types of [Task]s they can send.
#[async_trait]
pub trait Sender<C, T: Task<C>> {
    async fn send(&self, task: T) -> Result<()>;
}

/// Trait defining the ability to harvest, or "receive" [Task]s generically.
///
/// A [Receiver] moves [Task] trait objects out of the backend along with a "cookie" identifying
/// the task, and later marks them as complete (or failed).
#[async_trait]
pub trait Receiver<C> {
    type TaskId: Send + 'static;
    async fn mark_complete(&self, cookie: Self::TaskId) -> Result<()>;
    /// `cookie` ran, but failed (with `reason`)
    async fn mark_failed(&self, cookie: Self::TaskId, reason: String) -> Result<()>;
    async fn take_task(&self) -> Result<Option<(Box<dyn Task<C>>, Self::TaskId)>>;
}

/// If `T` is a [Receiver], then so is `Arc<T>`.
#[async_trait]
impl<C, T: Receiver<C> + Send + Sync> Receiver<C> for Arc<T> {
    type TaskId = T::TaskId;
    async fn mark_complete(&self, cookie: Self::TaskId) -> Result<()> {
        self.as_ref().mark_complete(cookie).await
    }
    async fn mark_failed(&self, cookie: Self::TaskId, reason: String) -> Result<()> {
        self.as_ref().mark_failed(cookie, reason).await
    }
    async fn take_task(&self) -> Result<Option<(Box<dyn Task<C>>, Self::TaskId)>> {
        self.as_ref().take_task().await
    }
}

/// Manages the ongoing processing of background tasks on one queue
#[pin_project]
pub struct Processor {
    // This               👇 must match the return type of `process()`
    #[pin]
    processor: JoinHandle<Result<()>>,
    shutdown: Arc<Notify>,
}

impl Future for Processor {
    type Output = std::result::Result<Result<()>, JoinError>;

    fn poll(self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        this.processor.poll(cx)
    }
}

impl Processor {
    /// Signal the processing task to shutdown, and wait for time `timeout` for it to exit.
    pub async fn shutdown(self, timeout: Duration) -> Result<()> {
        self.shutdown.notify_one();
        tokio::time::timeout(timeout, self.processor)
            .await
            .context(ShutdownTimeoutSnafu)?
            .context(JoinSnafu)?
    }
    /// Split the instance back into it's parts (for use in `tokio::select!`, e.g.)
    pub fn into_parts(self) -> (JoinHandle<Result<()>>, Arc<Notify>) {
        (self.processor, self.shutdown)
    }
}

/// Configuration parameters for processing background tasks
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Timeout that will be used for any task that doesn't define its own
    #[serde(rename = "default-timeout")]
    pub default_timeout: Duration,
    /// The maximum number of tasks to drive concurrently (per queue)
    #[serde(rename = "max-concurrent-tasks")]
    pub max_concurrent_tasks: usize,
    /// Amount of time to sleep when we have no tasks in process
    #[serde(rename = "sleep-duration")]
    pub sleep_duration: Duration,
    /// Amount of time to wait for in-flight tasks on shutdown
    #[serde(rename = "shutdown-timeout")]
    pub shutdown_timeout: Duration,
    /// Maximum amount of time to drive in-flight tasks without attempting to pick-up new tasks
    #[serde(rename = "pickup-timeout")]
    pub pickup_timeout: Duration,
    /// How long a leased task is hidden from other processors
    #[serde(rename = "lease-duration")]
    pub lease_duration: Duration,
    /// Total number of attempts a task gets before it's dead-lettered
    #[serde(rename = "max-attempts")]
    pub max_attempts: u32,
    /// How long a failed task waits before it may be retried
    #[serde(rename = "retry-delay")]
    pub retry_delay: Duration,
    /// The queues to process
    pub queues: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(5),
            max_concurrent_tasks: 16,
            sleep_duration: Duration::from_secs(1),
            shutdown_timeout: Duration::from_millis(500),
            pickup_timeout: Duration::from_millis(1000),
            lease_duration: Duration::from_secs(60),
            max_attempts: 3,
            retry_delay: Duration::from_secs(10),
            queues: vec![DEFAULT_QUEUE.to_owned(), NEWSFEEDS_QUEUE.to_owned()],
        }
    }
}

inventory::submit! { metrics::Registration::new("background.processor.tasks.completed", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("background.processor.tasks.failed", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("background.processor.tasks.inflight", Sort::IntegralGauge) }

/// Process background tasks. `receiver` is a [Receiver] from which we can draw tasks. `config`
/// holds configuration parameters for the algorithm. `shutdown` is a [Notify] instance the caller
/// can use to signal this function to exit.
async fn process<C: Clone + 'static, R: Receiver<C>>(
    receiver: R,
    context: C,
    config: Config,
    shutdown: Arc<Notify>,
    instruments: Arc<Instruments>,
) -> Result<()> {
    // Map tokio task Ids to our cookies
    let mut tasks: HashMap<Id, R::TaskId> = HashMap::new();
    let mut futures = JoinSet::new();
    let mut done = false;
    while !done {
        // so long as we don't have too much on our plate, try 'n grab another task:
        if futures.len() < config.max_concurrent_tasks {
            if let Some((task, cookie)) = receiver.take_task().await.context(TakeSnafu)? {
                let id = futures
                    .spawn(tokio::time::timeout(
                        task.timeout().unwrap_or(config.default_timeout),
                        task.exec(context.clone()),
                    ))
                    .id();
                tasks.insert(id, cookie);
            }
        }

        gauge_setu!(
            instruments,
            "background.processor.tasks.inflight",
            futures.len() as u64,
            &[]
        );

        if !futures.is_empty() {
            tokio::select! {
                Some(result) = futures.join_next_with_id() => {
                    let (id, outcome) = match result {
                        Ok((id, Ok(Ok(())))) => (id, None),
                        Ok((id, Ok(Err(err)))) => (id, Some(format!("{}", err))),
                        Ok((id, Err(_))) => (id, Some("timed-out".to_owned())),
                        Err(err) => (err.id(), Some(format!("{}", err))),
                    };
                    let cookie = tasks.remove(&id).context(TaskIdSnafu)?;
                    match outcome {
                        None => {
                            receiver.mark_complete(cookie).await.context(CompletionSnafu)?;
                            counter_add!(
                                instruments,
                                "background.processor.tasks.completed",
                                1,
                                &[]
                            );
                        }
                        Some(reason) => {
                            warn!("Background task failed: {}", reason);
                            receiver.mark_failed(cookie, reason).await.context(FailureSnafu)?;
                            counter_add!(instruments, "background.processor.tasks.failed", 1, &[]);
                        }
                    }
                },
                // A single long-running task would otherwise keep us here while others pile-up in
                // the queue; stop periodically to pick-up new tasks.
                _ = tokio::time::sleep(config.pickup_timeout) => (),
                _ = shutdown.notified()=> {
                    done = true;
                }
            }
        } else {
            tokio::select! {
                _ = tokio::time::sleep(config.sleep_duration) => (),
                _ = shutdown.notified() => {
                    done = true;
                }
            }
        }
    }

    // Give any in-flight tasks a chance to complete; any that don't will be picked-up again when
    // their leases lapse.
    tokio::time::timeout(config.shutdown_timeout, futures.join_all())
        .await
        .context(TimeoutSnafu)?;

    Ok(())
}

/// Create a new [Processor] given a [Receiver].
pub fn new<C: Clone + Send + 'static, R: Receiver<C> + Send + 'static>(
    receiver: R,
    context: C,
    config: Option<Config>,
    instruments: Arc<Instruments>,
) -> std::result::Result<Processor, Error> {
    let shutdown = Arc::new(Notify::new());
    let processor = tokio::spawn(process(
        receiver,
        context,
        config.unwrap_or_default(),
        shutdown.clone(),
        instruments,
    ));
    Ok(Processor {
        processor,
        shutdown,
    })
}

/// Run tasks from `receiver`, one at a time & in this task, until it has none to give; return the
/// number of tasks run
///
/// This is [Processor] without the concurrency: handy for administrative drains & for tests that
/// want every consequence of a request to have played-out before they look.
pub async fn run_until_idle<C: Clone, R: Receiver<C>>(
    receiver: &R,
    context: C,
    default_timeout: Duration,
) -> Result<usize> {
    let mut count = 0;
    while let Some((task, cookie)) = receiver.take_task().await.context(TakeSnafu)? {
        let timeout = task.timeout().unwrap_or(default_timeout);
        match tokio::time::timeout(timeout, task.exec(context.clone())).await {
            Ok(Ok(())) => receiver.mark_complete(cookie).await.context(CompletionSnafu)?,
            Ok(Err(err)) => receiver
                .mark_failed(cookie, format!("{}", err))
                .await
                .context(FailureSnafu)?,
            Err(_) => receiver
                .mark_failed(cookie, "timed-out".to_owned())
                .await
                .context(FailureSnafu)?,
        }
        count += 1;
    }
    Ok(count)
}

// Pressure-test `process()` with mock implementations of the traits defined so far
#[cfg(test)]
mod mock {

    use std::{collections::HashSet, sync::Mutex};

    use super::*;

    #[derive(Clone, Debug, Serialize)]
    struct SleepTask {
        pub duration: Duration,
        pub fail: bool,
    }

    #[async_trait]
    impl Task<()> for SleepTask {
        async fn exec(self: Box<Self>, _: ()) -> Result<()> {
            tokio::time::sleep(self.duration).await;
            if self.fail {
                Err(Error::new(std::io::Error::other("asked to fail")))
            } else {
                Ok(())
            }
        }
        fn timeout(&self) -> Option<Duration> {
            Some(Duration::from_secs(10))
        }
    }

    #[derive(Default)]
    struct InMemory {
        pub tasks: Mutex<HashMap<Uuid, Box<dyn Task<()>>>>,
        pub checkouts: Mutex<HashSet<Uuid>>,
        pub completed: Mutex<Vec<Uuid>>,
        pub failed: Mutex<Vec<Uuid>>,
    }

    #[async_trait]
    impl Receiver<()> for InMemory {
        type TaskId = Uuid;
        async fn mark_complete(&self, cookie: Self::TaskId) -> Result<()> {
            self.checkouts.lock().unwrap().remove(&cookie);
            self.completed.lock().unwrap().push(cookie);
            Ok(())
        }
        async fn mark_failed(&self, cookie: Self::TaskId, _reason: String) -> Result<()> {
            self.checkouts.lock().unwrap().remove(&cookie);
            self.failed.lock().unwrap().push(cookie);
            Ok(())
        }
        async fn take_task(&self) -> Result<Option<(Box<dyn Task<()>>, Self::TaskId)>> {
            let mut m = self.tasks.lock().unwrap();
            let key = { m.keys().next().cloned() };
            match key {
                Some(key) => {
                    let task = m.remove(&key).unwrap();
                    self.checkouts.lock().unwrap().insert(key);
                    Ok(Some((task, key)))
                }
                None => Ok(None),
            }
        }
    }

    #[async_trait]
    impl<T: Task<()> + 'static> Sender<(), T> for InMemory {
        async fn send(&self, task: T) -> Result<()> {
            self.tasks
                .lock()
                .unwrap()
                .insert(Uuid::new_v4(), Box::new(task));
            Ok(())
        }
    }

    #[tokio::test]
    async fn send_and_receive() {
        let sender = Arc::new(InMemory::default());
        let receiver = sender.clone();
        let processor = new(
            receiver,
            (),
            Some(Config {
                // Slightly longer than the longest task, below, in case that task has just gotten
                // started when the shutdown signal arrives.
                shutdown_timeout: Duration::from_millis(800),
                sleep_duration: Duration::from_millis(50),
                ..Default::default()
            }),
            Arc::new(Instruments::new("newsfeed")),
        )
        .unwrap();

        for (ms, fail) in [(250, false), (500, true), (350, false), (100, false)] {
            sender
                .send(SleepTask {
                    duration: Duration::from_millis(ms),
                    fail,
                })
                .await
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(1500)).await;
        let result = processor.shutdown(Duration::from_secs(5)).await;
        assert!(result.is_ok());
        assert_eq!(sender.completed.lock().unwrap().len(), 3);
        assert_eq!(sender.failed.lock().unwrap().len(), 1);
        assert!(sender.checkouts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn idle_runs() {
        let queue = InMemory::default();
        for fail in [false, true] {
            queue
                .send(SleepTask {
                    duration: Duration::from_millis(1),
                    fail,
                })
                .await
                .unwrap();
        }
        assert_eq!(
            run_until_idle(&queue, (), Duration::from_secs(1))
                .await
                .unwrap(),
            2
        );
        assert_eq!(queue.completed.lock().unwrap().len(), 1);
        assert_eq!(queue.failed.lock().unwrap().len(), 1);
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                      newsfeed background tasks                                 //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// What newsfeed background tasks get to work with
#[derive(Clone)]
pub struct Context {
    pub feeds: Arc<NewsFeeds>,
    pub events: Arc<EventBus>,
    pub graph: Arc<dyn FollowerSource + Send + Sync>,
    pub tasks: Arc<BackgroundTasks>,
    pub settings: Settings,
}

/// A background task type registration: a tag & a function that "knows" how to deserialize a
/// [MessagePack] serialization of a task of this type.
///
/// [MessagePack]: https://msgpack.org/
// No centralized registry; use Tolnay's [inventory] crate instead.
pub struct BackgroundTask {
    pub id: Uuid,
    #[allow(clippy::type_complexity)]
    pub de: fn(&[u8]) -> Result<Box<dyn Task<Context>>>,
}

inventory::collect!(BackgroundTask);

/// Task lifecycle
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Done,
    Dead,
}

/// A task as represented in the task backends
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FlatTask {
    pub id: Uuid,
    pub queue: String,
    pub created: DateTime<Utc>,
    pub task: Vec<u8>,
    pub tag: Uuid,
    /// The task may not be leased before this time
    pub lease_expires: DateTime<Utc>,
    /// Number of times this task has been leased
    pub attempts: u32,
    pub state: TaskState,
    pub last_error: Option<String>,
}

/// Object-safe trait abstracting over the stores that can hold background tasks
#[async_trait]
pub trait Backend {
    /// Persist a new task on `queue`; return its id
    async fn write_task(&self, queue: &str, tag: &Uuid, buf: &[u8]) -> Result<Uuid>;
    /// Atomically lease the oldest available pending task on `queue` (if any) for `lease`,
    /// incrementing its attempt count; the returned [FlatTask] reflects the lease
    async fn lease_task(&self, queue: &str, lease: Duration) -> Result<Option<FlatTask>>;
    /// Mark a task done
    async fn close_task(&self, id: &Uuid) -> Result<()>;
    /// Record a failed attempt; the task becomes leasable again at `not_before`
    async fn release_task(&self, id: &Uuid, not_before: DateTime<Utc>, reason: &str)
    -> Result<()>;
    /// Move a task to the dead letter set
    async fn bury_task(&self, id: &Uuid, reason: &str) -> Result<()>;
    /// List the dead-lettered tasks on `queue`
    async fn dead_tasks(&self, queue: &str) -> Result<Vec<FlatTask>>;
}

inventory::submit! { metrics::Registration::new("background.tasks.sent", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("background.tasks.dead", Sort::IntegralCounter) }

/// The newsfeed background task system
pub struct BackgroundTasks {
    storage: Arc<dyn Backend + Send + Sync>,
    config: Config,
    instruments: Arc<Instruments>,
}

impl BackgroundTasks {
    pub fn new(
        storage: Arc<dyn Backend + Send + Sync>,
        config: Config,
        instruments: Arc<Instruments>,
    ) -> BackgroundTasks {
        BackgroundTasks {
            storage,
            config,
            instruments,
        }
    }
    pub fn config(&self) -> &Config {
        &self.config
    }
    /// A [Receiver] for `queue`
    pub fn receiver(self: &Arc<Self>, queue: &str) -> QueueReceiver {
        QueueReceiver {
            tasks: self.clone(),
            queue: queue.to_owned(),
        }
    }
    pub async fn dead_tasks(&self, queue: &str) -> Result<Vec<FlatTask>> {
        self.storage.dead_tasks(queue).await
    }
}

#[async_trait]
impl<T> Sender<Context, T> for BackgroundTasks
where
    T: TaggedTask<Context, Tag = Uuid> + Serialize + 'static,
{
    /// Serialize to MessagePack, then write to the backend
    async fn send(&self, task: T) -> Result<()> {
        let tag = T::get_tag();
        let buf = to_vec(&task).context(TaskSerSnafu)?;
        let id = self.storage.write_task(T::queue(), &tag, &buf).await?;
        debug!("Sent task {} (type {}) to {}", id, tag, T::queue());
        counter_add!(
            self.instruments,
            "background.tasks.sent",
            1,
            &[KeyValue::new("queue", T::queue())]
        );
        Ok(())
    }
}

/// A lease on a task, as handed-out by [QueueReceiver]
#[derive(Clone, Copy, Debug)]
pub struct Lease {
    pub id: Uuid,
    pub attempts: u32,
}

/// Receives [Task]s from a single queue
#[derive(Clone)]
pub struct QueueReceiver {
    tasks: Arc<BackgroundTasks>,
    queue: String,
}

impl QueueReceiver {
    pub fn queue(&self) -> &str {
        &self.queue
    }
}

#[async_trait]
impl Receiver<Context> for QueueReceiver {
    type TaskId = Lease;
    async fn mark_complete(&self, cookie: Self::TaskId) -> Result<()> {
        self.tasks.storage.close_task(&cookie.id).await
    }
    async fn mark_failed(&self, cookie: Self::TaskId, reason: String) -> Result<()> {
        let config = &self.tasks.config;
        if cookie.attempts >= config.max_attempts {
            error!(
                "Task {} on {} failed {} times; dead-lettering it: {}",
                cookie.id, self.queue, cookie.attempts, reason
            );
            counter_add!(
                self.tasks.instruments,
                "background.tasks.dead",
                1,
                &[KeyValue::new("queue", self.queue.clone())]
            );
            self.tasks.storage.bury_task(&cookie.id, &reason).await
        } else {
            let not_before = Utc::now()
                + chrono::Duration::from_std(config.retry_delay)
                    .unwrap_or(chrono::Duration::zero());
            self.tasks
                .storage
                .release_task(&cookie.id, not_before, &reason)
                .await
        }
    }
    async fn take_task(&self) -> Result<Option<(Box<dyn Task<Context>>, Self::TaskId)>> {
        while let Some(flat) = self
            .tasks
            .storage
            .lease_task(&self.queue, self.tasks.config.lease_duration)
            .await?
        {
            let task = match inventory::iter::<BackgroundTask>().find(|t| t.id == flat.tag) {
                Some(registration) => (registration.de)(&flat.task),
                None => IdSnafu { tag: flat.tag }.fail(),
            };
            match task {
                Ok(task) => {
                    return Ok(Some((
                        task,
                        Lease {
                            id: flat.id,
                            attempts: flat.attempts,
                        },
                    )));
                }
                Err(err) => {
                    // Retrying won't help a task we can't even read
                    error!(
                        "Task {} can't be deserialized; dead-lettering it: {}",
                        flat.id, err
                    );
                    self.tasks
                        .storage
                        .bury_task(&flat.id, &format!("{}", err))
                        .await?;
                }
            }
        }
        Ok(None)
    }
}
