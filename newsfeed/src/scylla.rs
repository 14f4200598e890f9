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

//! # scylla
//!
//! [storage] & [background task] backends on ScyllaDB.
//!
//! [storage]: crate::storage
//! [background task]: crate::background_tasks
//!
//! Every logical wide-column table lives in one CQL table, `wide_rows`, partitioned by logical
//! table name & clustered by row key. Blobs cluster in unsigned byte order, which is exactly the
//! order the row key encoding is designed for, so range scans map directly onto clustering-key
//! slices. A row's cells are a `map<text, blob>` keyed by "family:qualifier"; puts append to the
//! map, so they overwrite the cells they name & leave the rest alone.
//!
//! Since a logical table is a single partition, this layout won't scale past what one partition
//! can hold.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use enum_map::{Enum, EnumMap};
use futures::stream::{self, StreamExt};
use itertools::Itertools;
use scylla::{
    client::{session::Session as ScyllaSession, session_builder::SessionBuilder},
    statement::{batch::Batch, prepared::PreparedStatement},
    value::{CqlValue, Row as CqlRow},
};
use secrecy::ExposeSecret;
use snafu::{Backtrace, prelude::*};
use tap::Pipe;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    background_tasks::{self, FlatTask, TaskState},
    storage::{self, Columns, Row, ScanRange},
    util::Credentials,
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("The number of prepared statements isn't consistent; this is a bug"))]
    BadPreparedStatementCount { backtrace: Backtrace },
    #[snafu(display("{keyspace} is not a legal keyspace name"))]
    BadKeyspace {
        keyspace: String,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to create schema ({stmt}): {source}"))]
    Ddl {
        stmt: String,
        source: scylla::errors::ExecutionError,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to set keyspace: {source}"))]
    Keyspace {
        source: scylla::errors::UseKeyspaceError,
        backtrace: Backtrace,
    },
    #[snafu(display("A lightweight transaction didn't report whether it applied"))]
    Lwt { backtrace: Backtrace },
    #[snafu(display("Failed to create a ScyllaDB session: {source}"))]
    NewSession {
        source: scylla::errors::NewSessionError,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to prepare statement: {stmt}: {source}"))]
    Prepare {
        stmt: String,
        source: scylla::errors::PrepareError,
        backtrace: Backtrace,
    },
    #[snafu(display("Unknown task state {state}"))]
    State { state: String, backtrace: Backtrace },
}

type Result<T> = std::result::Result<T, Error>;

type StdResult<T, E> = std::result::Result<T, E>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                 newsfeed ScyllaDB session type                                 //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The set of prepared statements used by newsfeed
///
/// Serves as both a mnemonic for each statement & the key type of the [EnumMap] holding them; the
/// statements themselves are listed, in this order, in [Session::new].
#[derive(Clone, Debug, Enum, Eq, PartialEq)]
enum PreparedStatements {
    InsertTable,
    DeleteTable,
    DropRows,
    PutRow,
    GetRow,
    DeleteRow,
    ScanAsc,
    ScanAscFrom,
    ScanAscTo,
    ScanAscBetween,
    ScanDesc,
    ScanDescFrom,
    ScanDescTo,
    ScanDescBetween,
    InsertTask,
    PendingTasks,
    LeaseTask,
    CloseTask,
    ReleaseTask,
    BuryTask,
    DeadTasks,
}

const SCHEMA: &[&str] = &[
    "create table if not exists wide_tables (table_name text primary key, families set<text>)",
    "create table if not exists wide_rows (table_name text, row_key blob, columns map<text, blob>, primary key ((table_name), row_key))",
    "create table if not exists background_tasks (id uuid primary key, queue text, created timestamp, task blob, tag uuid, lease_expires timestamp, attempts int, state text, last_error text)",
    "create index if not exists on background_tasks (queue)",
];

/// `newsfeed`-specific ScyllaDB Session type
pub struct Session {
    session: ScyllaSession,
    prepared_statements: EnumMap<PreparedStatements, PreparedStatement>,
}

impl Session {
    async fn prepare(scylla: &ScyllaSession, stmt: &str) -> Result<PreparedStatement> {
        scylla.prepare(stmt).await.context(PrepareSnafu {
            stmt: stmt.to_owned(),
        })
    }

    /// [Session] constructor
    ///
    /// Connects to `hosts`, creates `keyspace` (with `replication_factor`) & our tables if need be,
    /// and prepares every statement we'll use.
    pub async fn new(
        hosts: impl IntoIterator<Item = impl AsRef<str>>,
        credentials: &Option<Credentials>,
        keyspace: &str,
        replication_factor: u32,
    ) -> Result<Session> {
        ensure!(
            !keyspace.is_empty()
                && keyspace
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_'),
            BadKeyspaceSnafu { keyspace }
        );
        let mut builder = SessionBuilder::new().known_nodes(hosts);
        if let Some(Credentials((user, pass))) = credentials {
            builder = builder.user(user.expose_secret(), pass.expose_secret())
        }
        let scylla = builder.build().await.context(NewSessionSnafu)?;

        let create = format!(
            "create keyspace if not exists {} with replication = {{'class': 'SimpleStrategy', 'replication_factor': {}}}",
            keyspace, replication_factor
        );
        scylla
            .query_unpaged(create.as_str(), ())
            .await
            .context(DdlSnafu { stmt: create.clone() })?;
        scylla
            .use_keyspace(keyspace, false)
            .await
            .context(KeyspaceSnafu)?;
        for stmt in SCHEMA {
            scylla
                .query_unpaged(*stmt, ())
                .await
                .context(DdlSnafu { stmt: *stmt })?;
        }
        info!("Using ScyllaDB keyspace {}", keyspace);

        let prepared_statements = stream::iter(vec![
            // In the same order as [PreparedStatements]
            "insert into wide_tables (table_name, families) values (?, ?)",
            "delete from wide_tables where table_name=?",
            "delete from wide_rows where table_name=?",
            "update wide_rows set columns = columns + ? where table_name=? and row_key=?",
            "select columns from wide_rows where table_name=? and row_key=?",
            "delete from wide_rows where table_name=? and row_key=?",
            "select row_key, columns from wide_rows where table_name=? limit ?",
            "select row_key, columns from wide_rows where table_name=? and row_key>=? limit ?",
            "select row_key, columns from wide_rows where table_name=? and row_key<? limit ?",
            "select row_key, columns from wide_rows where table_name=? and row_key>=? and row_key<? limit ?",
            "select row_key, columns from wide_rows where table_name=? order by row_key desc limit ?",
            "select row_key, columns from wide_rows where table_name=? and row_key<=? order by row_key desc limit ?",
            "select row_key, columns from wide_rows where table_name=? and row_key>? order by row_key desc limit ?",
            "select row_key, columns from wide_rows where table_name=? and row_key<=? and row_key>? order by row_key desc limit ?",
            "insert into background_tasks (id, queue, created, task, tag, lease_expires, attempts, state) values (?, ?, ?, ?, ?, ?, 0, 'pending')",
            "select id, queue, created, task, tag, lease_expires, attempts, state, last_error from background_tasks where queue=? and state='pending' allow filtering",
            "update background_tasks set lease_expires=?, attempts=? where id=? if attempts=? and state='pending'",
            "update background_tasks set state='done' where id=?",
            "update background_tasks set lease_expires=?, last_error=? where id=?",
            "update background_tasks set state='dead', last_error=? where id=?",
            "select id, queue, created, task, tag, lease_expires, attempts, state, last_error from background_tasks where queue=? and state='dead' allow filtering",
        ])
        .then(|s| async { Self::prepare(&scylla, s).await })
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .collect::<Result<Vec<PreparedStatement>>>()?;
        // Fails (at compile time) if we're a statement short for [PreparedStatements]
        let prepared_statements: [PreparedStatement; 21] = prepared_statements
            .try_into()
            .map_err(|_| BadPreparedStatementCountSnafu.build())?;

        Ok(Session {
            session: scylla,
            prepared_statements: EnumMap::from_array(prepared_statements),
        })
    }

    fn stmt(&self, which: PreparedStatements) -> &PreparedStatement {
        &self.prepared_statements[which]
    }
}

use storage::Error as StorError;

impl std::convert::From<scylla::errors::ExecutionError> for StorError {
    fn from(value: scylla::errors::ExecutionError) -> Self {
        StorError::new(value)
    }
}

impl std::convert::From<scylla::response::query_result::IntoRowsResultError> for StorError {
    fn from(value: scylla::response::query_result::IntoRowsResultError) -> Self {
        StorError::new(value)
    }
}

impl std::convert::From<scylla::response::query_result::RowsError> for StorError {
    fn from(value: scylla::response::query_result::RowsError) -> Self {
        StorError::new(value)
    }
}

impl std::convert::From<scylla::deserialize::DeserializationError> for StorError {
    fn from(value: scylla::deserialize::DeserializationError) -> Self {
        StorError::new(value)
    }
}

// CQL `limit` takes an int
fn cql_limit(limit: Option<usize>) -> i32 {
    limit
        .map(|n| i32::try_from(n).unwrap_or(i32::MAX))
        .unwrap_or(i32::MAX)
}

#[async_trait]
impl storage::Backend for Session {
    async fn create_table(
        &self,
        table: &str,
        families: &[&'static str],
    ) -> StdResult<(), StorError> {
        self.session
            .execute_unpaged(
                self.stmt(PreparedStatements::InsertTable),
                (table, families.to_vec()),
            )
            .await?;
        Ok(())
    }

    async fn drop_table(&self, table: &str) -> StdResult<(), StorError> {
        self.session
            .execute_unpaged(self.stmt(PreparedStatements::DropRows), (table,))
            .await?;
        self.session
            .execute_unpaged(self.stmt(PreparedStatements::DeleteTable), (table,))
            .await?;
        debug!("Dropped {}", table);
        Ok(())
    }

    async fn put_rows(&self, table: &str, rows: &[Row]) -> StdResult<(), StorError> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut batch = Batch::default();
        let values = rows
            .iter()
            .map(|row| {
                batch.append_statement(self.stmt(PreparedStatements::PutRow).clone());
                (&row.columns, table, row.key.as_slice())
            })
            .collect::<Vec<_>>();
        self.session.batch(&batch, values).await?;
        Ok(())
    }

    async fn get_row(&self, table: &str, key: &[u8]) -> StdResult<Option<Columns>, StorError> {
        self.session
            .execute_unpaged(self.stmt(PreparedStatements::GetRow), (table, key))
            .await?
            .into_rows_result()?
            .rows::<(Option<Columns>,)>()?
            .map(|row| row.map(|(columns,)| columns.unwrap_or_default()))
            .next()
            .transpose()?
            .pipe(Ok)
    }

    async fn delete_row(&self, table: &str, key: &[u8]) -> StdResult<(), StorError> {
        self.session
            .execute_unpaged(self.stmt(PreparedStatements::DeleteRow), (table, key))
            .await?;
        Ok(())
    }

    async fn scan(&self, table: &str, range: &ScanRange) -> StdResult<Vec<Row>, StorError> {
        use PreparedStatements::*;
        let limit = cql_limit(range.limit);
        let (start, stop) = (range.start.as_deref(), range.stop.as_deref());
        let result = match (range.reverse, start, stop) {
            (false, None, None) => {
                self.session
                    .execute_unpaged(self.stmt(ScanAsc), (table, limit))
                    .await
            }
            (false, Some(start), None) => {
                self.session
                    .execute_unpaged(self.stmt(ScanAscFrom), (table, start, limit))
                    .await
            }
            (false, None, Some(stop)) => {
                self.session
                    .execute_unpaged(self.stmt(ScanAscTo), (table, stop, limit))
                    .await
            }
            (false, Some(start), Some(stop)) => {
                self.session
                    .execute_unpaged(self.stmt(ScanAscBetween), (table, start, stop, limit))
                    .await
            }
            (true, None, None) => {
                self.session
                    .execute_unpaged(self.stmt(ScanDesc), (table, limit))
                    .await
            }
            (true, Some(start), None) => {
                self.session
                    .execute_unpaged(self.stmt(ScanDescFrom), (table, start, limit))
                    .await
            }
            (true, None, Some(stop)) => {
                self.session
                    .execute_unpaged(self.stmt(ScanDescTo), (table, stop, limit))
                    .await
            }
            (true, Some(start), Some(stop)) => {
                self.session
                    .execute_unpaged(self.stmt(ScanDescBetween), (table, start, stop, limit))
                    .await
            }
        }?;
        result
            .into_rows_result()?
            .rows::<(Vec<u8>, Option<Columns>)>()?
            .map_ok(|(key, columns)| Row {
                key,
                columns: columns.unwrap_or_default(),
            })
            .collect::<StdResult<Vec<Row>, _>>()?
            .pipe(Ok)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        background tasks                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

type TaskRow = (
    Uuid,
    String,
    DateTime<Utc>,
    Vec<u8>,
    Uuid,
    DateTime<Utc>,
    i32,
    String,
    Option<String>,
);

fn flat_task(row: TaskRow) -> Result<FlatTask> {
    let (id, queue, created, task, tag, lease_expires, attempts, state, last_error) = row;
    let state = match state.as_str() {
        "pending" => TaskState::Pending,
        "done" => TaskState::Done,
        "dead" => TaskState::Dead,
        _ => return StateSnafu { state }.fail(),
    };
    Ok(FlatTask {
        id,
        queue,
        created,
        task,
        tag,
        lease_expires,
        attempts: attempts.max(0) as u32,
        state,
        last_error,
    })
}

impl Session {
    async fn tasks_in(
        &self,
        which: PreparedStatements,
        queue: &str,
    ) -> background_tasks::Result<Vec<FlatTask>> {
        self.session
            .execute_unpaged(self.stmt(which), (queue,))
            .await
            .map_err(background_tasks::Error::new)?
            .into_rows_result()
            .map_err(background_tasks::Error::new)?
            .rows::<TaskRow>()
            .map_err(background_tasks::Error::new)?
            .map(|row| {
                row.map_err(background_tasks::Error::new)
                    .and_then(|row| flat_task(row).map_err(background_tasks::Error::new))
            })
            .collect()
    }
}

#[async_trait]
impl background_tasks::Backend for Session {
    async fn write_task(
        &self,
        queue: &str,
        tag: &Uuid,
        buf: &[u8],
    ) -> background_tasks::Result<Uuid> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        self.session
            .execute_unpaged(
                self.stmt(PreparedStatements::InsertTask),
                (id, queue, now, buf, tag, now),
            )
            .await
            .map_err(background_tasks::Error::new)?;
        Ok(id)
    }

    /// Lease the oldest available task on `queue`
    ///
    /// The attempt count doubles as a fencing token: the lease is a lightweight transaction
    /// conditioned on it, so of two processors racing for the same task exactly one wins, and the
    /// loser moves on to the next candidate.
    async fn lease_task(
        &self,
        queue: &str,
        lease: std::time::Duration,
    ) -> background_tasks::Result<Option<FlatTask>> {
        let now = Utc::now();
        let expires = now + chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::zero());
        let candidates = self
            .tasks_in(PreparedStatements::PendingTasks, queue)
            .await?
            .into_iter()
            .filter(|task| task.lease_expires <= now)
            .sorted_by_key(|task| task.created);
        for mut task in candidates {
            let attempts = task.attempts as i32;
            let applied = self
                .session
                .execute_unpaged(
                    self.stmt(PreparedStatements::LeaseTask),
                    (expires, attempts + 1, task.id, attempts),
                )
                .await
                .map_err(background_tasks::Error::new)?
                .into_rows_result()
                .map_err(background_tasks::Error::new)?
                .rows::<CqlRow>()
                .map_err(background_tasks::Error::new)?
                .next()
                .transpose()
                .map_err(background_tasks::Error::new)?
                .and_then(|row| match row.columns.first() {
                    Some(Some(CqlValue::Boolean(applied))) => Some(*applied),
                    _ => None,
                })
                .context(LwtSnafu)
                .map_err(background_tasks::Error::new)?;
            if applied {
                task.lease_expires = expires;
                task.attempts += 1;
                return Ok(Some(task));
            }
            debug!("Lost the race for task {}", task.id);
        }
        Ok(None)
    }

    async fn close_task(&self, id: &Uuid) -> background_tasks::Result<()> {
        self.session
            .execute_unpaged(self.stmt(PreparedStatements::CloseTask), (id,))
            .await
            .map_err(background_tasks::Error::new)?;
        Ok(())
    }

    async fn release_task(
        &self,
        id: &Uuid,
        not_before: DateTime<Utc>,
        reason: &str,
    ) -> background_tasks::Result<()> {
        self.session
            .execute_unpaged(
                self.stmt(PreparedStatements::ReleaseTask),
                (not_before, reason, id),
            )
            .await
            .map_err(background_tasks::Error::new)?;
        Ok(())
    }

    async fn bury_task(&self, id: &Uuid, reason: &str) -> background_tasks::Result<()> {
        self.session
            .execute_unpaged(self.stmt(PreparedStatements::BuryTask), (reason, id))
            .await
            .map_err(background_tasks::Error::new)?;
        Ok(())
    }

    async fn dead_tasks(&self, queue: &str) -> background_tasks::Result<Vec<FlatTask>> {
        self.tasks_in(PreparedStatements::DeadTasks, queue).await
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn limits() {
        assert_eq!(cql_limit(None), i32::MAX);
        assert_eq!(cql_limit(Some(21)), 21);
        assert_eq!(cql_limit(Some(usize::MAX)), i32::MAX);
    }

    #[test]
    fn task_rows() {
        let now = Utc::now();
        let id = Uuid::new_v4();
        let row: TaskRow = (
            id,
            "newsfeeds".to_owned(),
            now,
            vec![1, 2],
            Uuid::new_v4(),
            now,
            2,
            "dead".to_owned(),
            Some("timed-out".to_owned()),
        );
        let task = flat_task(row.clone()).unwrap();
        assert_eq!(task.id, id);
        assert_eq!(task.attempts, 2);
        assert_eq!(task.state, TaskState::Dead);
        let mut bad = row;
        bad.7 = "lost".to_owned();
        assert!(flat_task(bad).is_err());
    }
}
