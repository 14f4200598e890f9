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

//! # Wide-Column Records
//!
//! Typed CRUD & range scans over a [storage::Backend].
//!
//! A [Record] is a type with a static [Schema]: some fields make up its row key (encoded by
//! [RowKeyCodec]), the rest are stored as named payload columns. [Table] binds a record type to a
//! backend, a table name & an I/O timeout.
//!
//! A few rules carried over from the store itself:
//!
//! - a put with an existing key overwrites that row's payload; there is no insert-only write
//! - a record with no payload columns can't be written at all (the store would silently drop the
//!   row), so [Table::put] refuses it with [Error::EmptyPayload]
//! - absence is not an error: [Table::get] returns `None` & [Table::delete] succeeds
//! - dropping a table is only permitted in [ExecutionMode::Test]
//!
//! [storage::Backend]: crate::storage::Backend

use std::{marker::PhantomData, sync::Arc, time::Duration};

use snafu::{Backtrace, IntoError, prelude::*};
use tracing::debug;

use crate::{
    config::ExecutionMode,
    row_key::{self, EncodeMode, FieldMap, KeyTuple, RowKeyCodec, Schema},
    storage::{self, Backend as StorageBackend, Columns, Row, ScanRange},
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Bad row key for {table}: {source}"))]
    BadKey {
        table: String,
        source: row_key::Error,
    },
    #[snafu(display("A scan of {table} may give start/stop or a prefix, but not both"))]
    BadScan { table: String, backtrace: Backtrace },
    #[snafu(display("Failed to decode row {key} of {table}: {source}"))]
    Decode {
        table: String,
        key: String,
        source: row_key::Error,
    },
    #[snafu(display("Refusing to drop {table} outside of test mode"))]
    DropRefused { table: String, backtrace: Backtrace },
    #[snafu(display("A record for {table} has no payload columns & can't be stored"))]
    EmptyPayload { table: String, backtrace: Backtrace },
    #[snafu(display("Store {op} on {table} failed: {source}"))]
    Storage {
        op: &'static str,
        table: String,
        source: storage::Error,
    },
    #[snafu(display("Store {op} on {table} timed-out after {timeout:?}"))]
    Timeout {
        op: &'static str,
        table: String,
        timeout: Duration,
        source: tokio::time::error::Elapsed,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            records                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A type that can be stored in a wide-column table
pub trait Record: Sized + Send + Sync + 'static {
    fn schema() -> &'static Schema;
    /// Every field (key & payload) of this record, by name
    fn to_fields(&self) -> FieldMap;
    /// Re-constitute a record from its fields
    fn from_fields(fields: &FieldMap) -> row_key::Result<Self>;
}

/// A scan over a [Table]
///
/// Either `start`/`stop` or `prefix` may be given, not both. Tuples are encoded in prefix mode, so a
/// partial tuple bounds the scan at the level of the fields it does name; an empty tuple is
/// unbounded.
#[derive(Clone, Debug, Default)]
pub struct ScanSpec {
    pub start: Option<KeyTuple>,
    pub stop: Option<KeyTuple>,
    pub prefix: Option<KeyTuple>,
    pub limit: Option<usize>,
    pub reverse: bool,
}

impl ScanSpec {
    pub fn range(start: Option<KeyTuple>, stop: Option<KeyTuple>) -> ScanSpec {
        ScanSpec {
            start,
            stop,
            ..Default::default()
        }
    }
    pub fn prefix(prefix: KeyTuple) -> ScanSpec {
        ScanSpec {
            prefix: Some(prefix),
            ..Default::default()
        }
    }
    pub fn limit(mut self, limit: usize) -> ScanSpec {
        self.limit = Some(limit);
        self
    }
    pub fn reverse(mut self) -> ScanSpec {
        self.reverse = true;
        self
    }
}

/// The smallest byte string greater than every string beginning with `prefix`; `None` if there is
/// no such string (`prefix` is empty or all `0xff`)
pub fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut succ = prefix.to_vec();
    while let Some(last) = succ.pop() {
        if last < 0xff {
            succ.push(last + 1);
            return Some(succ);
        }
    }
    None
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             Table                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A typed handle on a single wide-column table
pub struct Table<R: Record> {
    backend: Arc<dyn StorageBackend + Send + Sync>,
    name: String,
    mode: ExecutionMode,
    timeout: Duration,
    codec: RowKeyCodec,
    _record: PhantomData<fn() -> R>,
}

impl<R: Record> Clone for Table<R> {
    fn clone(&self) -> Self {
        Table {
            backend: self.backend.clone(),
            name: self.name.clone(),
            mode: self.mode,
            timeout: self.timeout,
            codec: self.codec,
            _record: PhantomData,
        }
    }
}

impl<R: Record> Table<R> {
    pub fn new(
        backend: Arc<dyn StorageBackend + Send + Sync>,
        mode: ExecutionMode,
        timeout: Duration,
    ) -> Table<R> {
        Table {
            backend,
            name: mode.table_name(R::schema().table),
            mode,
            timeout,
            codec: RowKeyCodec::new(R::schema()),
            _record: PhantomData,
        }
    }
    /// The table name as seen by the store (i.e. with any test prefix applied)
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn codec(&self) -> &RowKeyCodec {
        &self.codec
    }
    /// Bound a single store round trip by our I/O timeout & attach context to any failure
    async fn call<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = std::result::Result<T, storage::Error>>,
    ) -> Result<T> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .context(TimeoutSnafu {
                op,
                table: self.name.clone(),
                timeout: self.timeout,
            })?
            .map_err(|err| {
                StorageSnafu {
                    op,
                    table: self.name.clone(),
                }
                .into_error(err)
            })
    }
    fn encode(&self, key: &KeyTuple, mode: EncodeMode) -> Result<Vec<u8>> {
        self.codec.encode_tuple(key, mode).context(BadKeySnafu {
            table: self.name.clone(),
        })
    }
    /// Validate `record` & convert it to a [Row]
    pub fn row_for(&self, record: &R) -> Result<Row> {
        let fields = record.to_fields();
        let key = self
            .codec
            .encode(&fields, EncodeMode::Full)
            .context(BadKeySnafu {
                table: self.name.clone(),
            })?;
        let mut columns = Columns::new();
        for spec in R::schema().payload_fields() {
            if let (Some(value), Some(column)) = (fields.get(spec.name), spec.column()) {
                columns.insert(
                    column,
                    spec.render_cell(value).context(BadKeySnafu {
                        table: self.name.clone(),
                    })?,
                );
            }
        }
        ensure!(
            !columns.is_empty(),
            EmptyPayloadSnafu {
                table: self.name.clone()
            }
        );
        Ok(Row { key, columns })
    }
    fn record_for(&self, key: &[u8], columns: &Columns) -> Result<R> {
        let decode_context = || DecodeSnafu {
            table: self.name.clone(),
            key: String::from_utf8_lossy(key).into_owned(),
        };
        let mut fields = self.codec.decode(key).with_context(|_| decode_context())?;
        for (column, cell) in columns {
            // Cells the schema doesn't know about are ignored
            if let Some(spec) = R::schema().field_for_column(column) {
                fields.insert(
                    spec.name,
                    Some(spec.parse_cell(cell).with_context(|_| decode_context())?),
                );
            }
        }
        R::from_fields(&fields).with_context(|_| decode_context())
    }
    /// Create this table (with the column families named in the record's schema) if it doesn't
    /// already exist
    pub async fn create_if_missing(&self) -> Result<()> {
        self.call(
            "create",
            self.backend
                .create_table(&self.name, &R::schema().families()),
        )
        .await
    }
    /// Drop this table; refused unless running in test mode
    pub async fn drop_table(&self) -> Result<()> {
        ensure!(
            self.mode == ExecutionMode::Test,
            DropRefusedSnafu {
                table: self.name.clone()
            }
        );
        self.call("drop", self.backend.drop_table(&self.name)).await
    }
    /// Insert or overwrite `record`
    pub async fn put(&self, record: &R) -> Result<()> {
        let row = self.row_for(record)?;
        self.call("put", self.backend.put_rows(&self.name, &[row]))
            .await
    }
    /// Begin a batch of writes
    pub fn batch(&self) -> Batch<'_, R> {
        Batch {
            table: self,
            rows: Vec::new(),
        }
    }
    /// Write `records` in a single round trip
    pub async fn batch_create(&self, records: &[R]) -> Result<()> {
        let mut batch = self.batch();
        for record in records {
            batch.put(record)?;
        }
        batch.send().await
    }
    /// Point lookup by full key
    pub async fn get(&self, key: &KeyTuple) -> Result<Option<R>> {
        let key = self.encode(key, EncodeMode::Full)?;
        match self.call("get", self.backend.get_row(&self.name, &key)).await? {
            Some(columns) if !columns.is_empty() => Ok(Some(self.record_for(&key, &columns)?)),
            _ => Ok(None),
        }
    }
    /// Delete by full key
    pub async fn delete(&self, key: &KeyTuple) -> Result<()> {
        let key = self.encode(key, EncodeMode::Full)?;
        self.call("delete", self.backend.delete_row(&self.name, &key))
            .await
    }
    /// Range scan
    pub async fn scan(&self, spec: &ScanSpec) -> Result<Vec<R>> {
        let bound = |tuple: &Option<KeyTuple>| -> Result<Option<Vec<u8>>> {
            match tuple {
                Some(tuple) => Ok(Some(self.encode(tuple, EncodeMode::Prefix)?)
                    .filter(|key: &Vec<u8>| !key.is_empty())),
                None => Ok(None),
            }
        };
        let (range, prefix) = match &spec.prefix {
            Some(prefix) => {
                ensure!(
                    spec.start.is_none() && spec.stop.is_none(),
                    BadScanSnafu {
                        table: self.name.clone()
                    }
                );
                let prefix = self.encode(prefix, EncodeMode::Prefix)?;
                let succ = prefix_successor(&prefix);
                let lower = Some(prefix.clone()).filter(|p| !p.is_empty());
                if spec.reverse {
                    // The successor is the inclusive upper bound of a reverse scan; a row with
                    // exactly that key (if any) isn't in the prefix & is filtered out below, so
                    // ask for one extra row to make up for it.
                    (
                        ScanRange {
                            start: succ,
                            stop: None,
                            limit: spec.limit.map(|n| n + 1),
                            reverse: true,
                        },
                        Some(prefix),
                    )
                } else {
                    (
                        ScanRange {
                            start: lower,
                            stop: succ,
                            limit: spec.limit,
                            reverse: false,
                        },
                        None,
                    )
                }
            }
            None => (
                ScanRange {
                    start: bound(&spec.start)?,
                    stop: bound(&spec.stop)?,
                    limit: spec.limit,
                    reverse: spec.reverse,
                },
                None,
            ),
        };
        debug!("scanning {}: {:?}", self.name, range);

        let rows = self.call("scan", self.backend.scan(&self.name, &range)).await?;
        let mut records = Vec::with_capacity(rows.len());
        for row in rows
            .iter()
            .filter(|row| prefix.as_deref().is_none_or(|p| row.key.starts_with(p)))
            .take(spec.limit.unwrap_or(usize::MAX))
        {
            records.push(self.record_for(&row.key, &row.columns)?);
        }
        Ok(records)
    }
}

/// A set of writes to be flushed to the store in one round trip
///
/// Each [Batch::put] is validated locally as it's added; nothing is written until [Batch::send].
pub struct Batch<'a, R: Record> {
    table: &'a Table<R>,
    rows: Vec<Row>,
}

impl<R: Record> Batch<'_, R> {
    pub fn put(&mut self, record: &R) -> Result<()> {
        self.rows.push(self.table.row_for(record)?);
        Ok(())
    }
    pub fn len(&self) -> usize {
        self.rows.len()
    }
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
    pub async fn send(self) -> Result<()> {
        if self.rows.is_empty() {
            return Ok(());
        }
        self.table
            .call(
                "batch put",
                self.table.backend.put_rows(&self.table.name, &self.rows),
            )
            .await
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::{
        entities::{NewsFeedEntry, PostId, Timestamp, UserId},
        key,
        memory::MemoryStore,
        row_key::{FieldKind, FieldSpec, Value},
    };

    fn table(mode: ExecutionMode) -> Table<NewsFeedEntry> {
        Table::new(Arc::new(MemoryStore::new()), mode, Duration::from_secs(1))
    }

    fn entry(user: i64, ts: i64, post: i64) -> NewsFeedEntry {
        NewsFeedEntry::new(UserId(user), Timestamp(ts), PostId(post))
    }

    #[test]
    fn successors() {
        assert_eq!(prefix_successor(b"ab"), Some(b"ac".to_vec()));
        assert_eq!(prefix_successor(b"a\xff"), Some(b"b".to_vec()));
        assert_eq!(prefix_successor(b"\xff\xff"), None);
        assert_eq!(prefix_successor(b""), None);
    }

    #[tokio::test]
    async fn crud() {
        let table = table(ExecutionMode::Test);
        assert_eq!(table.name(), "test_newsfeeds");
        table.create_if_missing().await.unwrap();
        // Idempotent:
        table.create_if_missing().await.unwrap();

        assert!(table.get(&key![UserId(1), Timestamp(10)]).await.unwrap().is_none());
        table.put(&entry(1, 10, 100)).await.unwrap();
        assert_eq!(
            table.get(&key![UserId(1), Timestamp(10)]).await.unwrap(),
            Some(entry(1, 10, 100))
        );
        // Same ordering tuple, different payload: overwrite
        table.put(&entry(1, 10, 101)).await.unwrap();
        let all = table.scan(&ScanSpec::prefix(key![UserId(1)])).await.unwrap();
        assert_eq!(all, vec![entry(1, 10, 101)]);

        table.delete(&key![UserId(1), Timestamp(10)]).await.unwrap();
        // Absent, but not an error
        table.delete(&key![UserId(1), Timestamp(10)]).await.unwrap();
        assert!(table.get(&key![UserId(1), Timestamp(10)]).await.unwrap().is_none());

        assert!(matches!(
            table.get(&key![UserId(1)]).await,
            Err(Error::BadKey { .. })
        ));

        table.drop_table().await.unwrap();
    }

    #[tokio::test]
    async fn drops_refused_in_production() {
        let table = table(ExecutionMode::Production);
        table.create_if_missing().await.unwrap();
        assert!(matches!(
            table.drop_table().await,
            Err(Error::DropRefused { .. })
        ));
    }

    #[tokio::test]
    async fn scans() {
        let table = table(ExecutionMode::Test);
        table.create_if_missing().await.unwrap();
        let mut batch = table.batch();
        for ts in 1..=5 {
            batch.put(&entry(7, ts, ts * 10)).unwrap();
            batch.put(&entry(8, ts, ts * 100)).unwrap();
        }
        assert_eq!(batch.len(), 10);
        batch.send().await.unwrap();

        let ts = |v: Vec<NewsFeedEntry>| v.iter().map(|e| e.created_at.0).collect::<Vec<_>>();

        // Prefix scans stay within the subject
        let got = table.scan(&ScanSpec::prefix(key![UserId(7)])).await.unwrap();
        assert_eq!(ts(got), vec![1, 2, 3, 4, 5]);
        let got = table
            .scan(&ScanSpec::prefix(key![UserId(7)]).reverse().limit(3))
            .await
            .unwrap();
        assert_eq!(ts(got), vec![5, 4, 3]);

        // Forward: start inclusive, stop exclusive
        let got = table
            .scan(&ScanSpec::range(
                Some(key![UserId(7), Timestamp(2)]),
                Some(key![UserId(7), Timestamp(4)]),
            ))
            .await
            .unwrap();
        assert_eq!(ts(got), vec![2, 3]);

        // Reverse: start is the inclusive upper bound, stop the exclusive lower bound
        let got = table
            .scan(
                &ScanSpec::range(Some(key![UserId(7), Timestamp(4)]), Some(key![UserId(7)]))
                    .reverse(),
            )
            .await
            .unwrap();
        assert_eq!(ts(got), vec![4, 3, 2, 1]);

        assert!(matches!(
            table
                .scan(&ScanSpec {
                    start: Some(key![UserId(7)]),
                    prefix: Some(key![UserId(7)]),
                    ..Default::default()
                })
                .await,
            Err(Error::BadScan { .. })
        ));
    }

    // A record whose only payload field is optional
    #[derive(Debug, PartialEq)]
    struct Sparse {
        id: i64,
        note: Option<String>,
    }

    static SPARSE: Schema = Schema {
        table: "sparse",
        fields: &[
            FieldSpec::key("id", FieldKind::Int),
            FieldSpec::payload("cf", "note", FieldKind::Str),
        ],
    };

    impl Record for Sparse {
        fn schema() -> &'static Schema {
            &SPARSE
        }
        fn to_fields(&self) -> FieldMap {
            let mut fields = FieldMap::new().with("id", self.id);
            fields.insert("note", self.note.clone().map(Value::Str));
            fields
        }
        fn from_fields(fields: &FieldMap) -> row_key::Result<Self> {
            Ok(Sparse {
                id: fields.int("id")?,
                note: fields.get("note").and_then(|v| v.as_str()).map(str::to_owned),
            })
        }
    }

    #[tokio::test]
    async fn empty_payloads_are_refused() {
        let table: Table<Sparse> =
            Table::new(Arc::new(MemoryStore::new()), ExecutionMode::Test, Duration::from_secs(1));
        table.create_if_missing().await.unwrap();
        assert!(matches!(
            table.put(&Sparse { id: 1, note: None }).await,
            Err(Error::EmptyPayload { .. })
        ));
        // Nothing in the batch was sent if any record was bad
        let mut batch = table.batch();
        batch
            .put(&Sparse {
                id: 2,
                note: Some("x".to_owned()),
            })
            .unwrap();
        assert!(batch.put(&Sparse { id: 3, note: None }).is_err());
        assert!(table.get(&key![2i64]).await.unwrap().is_none());
    }
}
