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

//! # storage
//!
//! The wire-level contract newsfeed requires of its durable store: a sparse, sorted, wide-column
//! key-value store in the mold of HBase or Bigtable. Tables hold rows; a row is a byte-string key
//! and a map from column name ("family:qualifier") to byte-string value. Rows are kept sorted by
//! key, and the store supports point reads & writes along with forward & reverse range scans.
//!
//! Typed access (records, key encoding, validation) lives in [wide_column]; nothing here knows about
//! record types.
//!
//! [wide_column]: crate::wide_column

use std::collections::BTreeMap;

use async_trait::async_trait;

/// Transport-level store failure
///
/// Implementations box whatever error their client library produces; callers propagate these
/// unmodified (the store layer never retries).
#[derive(Debug)]
pub struct Error {
    source: Box<dyn std::error::Error + Send + Sync + 'static>,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

impl Error {
    pub fn new(err: impl std::error::Error + Send + Sync + 'static) -> Error {
        Error {
            source: Box::new(err),
        }
    }
}

/// A row's cells, keyed by "family:qualifier"
pub type Columns = BTreeMap<String, Vec<u8>>;

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Row {
    pub key: Vec<u8>,
    pub columns: Columns,
}

/// A range scan request
///
/// Bounds follow HBase conventions. Scanning forward, `start` is the inclusive lower bound & `stop`
/// the exclusive upper bound. Scanning in reverse, `start` is the inclusive *upper* bound & `stop`
/// the exclusive *lower* bound. A missing bound is unbounded. Rows come back in scan order, at most
/// `limit` of them.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ScanRange {
    pub start: Option<Vec<u8>>,
    pub stop: Option<Vec<u8>>,
    pub limit: Option<usize>,
    pub reverse: bool,
}

impl ScanRange {
    /// True if `key` falls within this range's bounds (ignoring `limit`)
    pub fn contains(&self, key: &[u8]) -> bool {
        let (lower_ok, upper_ok) = if self.reverse {
            (
                self.stop.as_deref().is_none_or(|stop| key > stop),
                self.start.as_deref().is_none_or(|start| key <= start),
            )
        } else {
            (
                self.start.as_deref().is_none_or(|start| key >= start),
                self.stop.as_deref().is_none_or(|stop| key < stop),
            )
        };
        lower_ok && upper_ok
    }
}

/// Object-safe trait abstracting over wide-column store implementations
///
/// Every method is a single round trip to the store. Implementations should not retry; failures are
/// reported as [Error] & surfaced to the caller.
#[async_trait]
pub trait Backend {
    /// Create `table` with the given column families, unless it already exists
    async fn create_table(&self, table: &str, families: &[&'static str]) -> Result<(), Error>;
    /// Drop `table` & all its rows; dropping a non-existent table is not an error
    async fn drop_table(&self, table: &str) -> Result<(), Error>;
    /// Write `rows` in one round trip. Cells in each row overwrite any existing cells with the same
    /// column name; other cells are untouched.
    async fn put_rows(&self, table: &str, rows: &[Row]) -> Result<(), Error>;
    /// Read a single row; `None` if there is no such row
    async fn get_row(&self, table: &str, key: &[u8]) -> Result<Option<Columns>, Error>;
    /// Delete a single row; deleting a non-existent row is not an error
    async fn delete_row(&self, table: &str, key: &[u8]) -> Result<(), Error>;
    /// Scan `table` over `range`
    async fn scan(&self, table: &str, range: &ScanRange) -> Result<Vec<Row>, Error>;
}
