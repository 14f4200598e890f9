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

//! # Row Keys
//!
//! ## Introduction
//!
//! The wide-column store keeps each table's rows sorted by key, byte-wise, and the only efficient
//! queries it offers are point lookups & range scans over that order. Every access pattern newsfeed
//! needs ("the most recent entries for user `u`", "entries for `u` older than `t`") therefore has
//! to be expressible as a contiguous key range, and that's the job of this module: map an ordered
//! tuple of typed fields to a byte string whose lexicographic order matches the tuple order.
//!
//! ## The Encoding
//!
//! Key fields are rendered in declaration order & joined with [SEPARATOR]:
//!
//! - integers & timestamps are zero-padded to sixteen decimal digits, so that `2` sorts before
//!   `10` (negative values & values wider than sixteen digits can't be ordered this way & are
//!   refused)
//! - strings are used as-is
//! - fields marked "scatter" have their rendering reversed; for a zero-padded integer this moves
//!   the fast-changing low-order digits to the front of the key, which spreads sequential ids
//!   across the keyspace (it promises nothing about the resulting distribution, it's simply the
//!   transform the stored data has always used)
//!
//! A rendered field may not itself contain the separator.
//!
//! Encoding comes in two flavors: [EncodeMode::Full] demands every key field, and
//! [EncodeMode::Prefix] stops at the first missing field, producing a key prefix suitable for
//! bounding a scan. Decoding is the inverse; key fields not present in the encoded form come back
//! as `None`.
//!
//! ## Schemas
//!
//! Rather than reflecting over record types, each record declares a [Schema] once, as a `static`:
//! an ordered list of [FieldSpec]s, each naming the field, its [FieldKind], and whether it's part of
//! the key or a payload column (in which case it names its column family).

use std::fmt::Display;

use serde::{Deserialize, Serialize};
use snafu::{Backtrace, prelude::*};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Field {field} is not a valid integer: {text}"))]
    BadInt {
        field: &'static str,
        text: String,
        source: std::num::ParseIntError,
        backtrace: Backtrace,
    },
    #[snafu(display("Row key field {field} is missing"))]
    MissingField {
        field: &'static str,
        backtrace: Backtrace,
    },
    #[snafu(display("Row key field {field} may not be negative ({value})"))]
    Negative {
        field: &'static str,
        value: i64,
        backtrace: Backtrace,
    },
    #[snafu(display("Row key field {field} may not contain the key separator: {value}"))]
    Separator {
        field: &'static str,
        value: String,
        backtrace: Backtrace,
    },
    #[snafu(display("Row key {key} has more components than the schema for {table} defines"))]
    TooManyComponents {
        table: &'static str,
        key: String,
        backtrace: Backtrace,
    },
    #[snafu(display("{count} values were given for the {keys} key fields of {table}"))]
    TooManyValues {
        table: &'static str,
        count: usize,
        keys: usize,
        backtrace: Backtrace,
    },
    #[snafu(display("Row key field {field} is too wide to be zero-padded ({value})"))]
    TooWide {
        field: &'static str,
        value: i64,
        backtrace: Backtrace,
    },
    #[snafu(display("Field {field} expected {expected}, got {value:?}"))]
    TypeMismatch {
        field: &'static str,
        expected: FieldKind,
        value: Value,
        backtrace: Backtrace,
    },
    #[snafu(display("Field {field} is not valid UTF-8: {source}"))]
    Utf8 {
        field: &'static str,
        source: std::str::Utf8Error,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Key fields are joined by this character; it may not appear in any rendered field
pub const SEPARATOR: char = ':';

/// Integer key fields are zero-padded to this many digits
pub const WIDTH: usize = 16;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            schemas                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The type of a record field
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FieldKind {
    Int,
    /// Microseconds since the Unix epoch; encoded exactly as [FieldKind::Int]
    Timestamp,
    Str,
}

impl Display for FieldKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldKind::Int => write!(f, "an integer"),
            FieldKind::Timestamp => write!(f, "a timestamp"),
            FieldKind::Str => write!(f, "a string"),
        }
    }
}

/// Whether a field participates in the row key, or is stored as a named column
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Role {
    Key,
    Payload { family: &'static str },
}

/// A single field in a record [Schema]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub role: Role,
    pub scatter: bool,
}

impl FieldSpec {
    pub const fn key(name: &'static str, kind: FieldKind) -> FieldSpec {
        FieldSpec {
            name,
            kind,
            role: Role::Key,
            scatter: false,
        }
    }
    /// A key field whose rendering is reversed before being written into the key
    pub const fn scattered_key(name: &'static str, kind: FieldKind) -> FieldSpec {
        FieldSpec {
            name,
            kind,
            role: Role::Key,
            scatter: true,
        }
    }
    pub const fn payload(family: &'static str, name: &'static str, kind: FieldKind) -> FieldSpec {
        FieldSpec {
            name,
            kind,
            role: Role::Payload { family },
            scatter: false,
        }
    }
    pub fn is_key(&self) -> bool {
        matches!(self.role, Role::Key)
    }
    /// The column name ("family:name") under which a payload field is stored; `None` for key
    /// fields
    pub fn column(&self) -> Option<String> {
        match self.role {
            Role::Key => None,
            Role::Payload { family } => Some(format!("{}:{}", family, self.name)),
        }
    }
    /// Render `value` as a key component
    fn render_key(&self, value: &Value) -> Result<String> {
        let text = match (self.kind, value) {
            (FieldKind::Int | FieldKind::Timestamp, Value::Int(n)) => {
                ensure!(
                    *n >= 0,
                    NegativeSnafu {
                        field: self.name,
                        value: *n
                    }
                );
                let text = format!("{:0width$}", n, width = WIDTH);
                ensure!(
                    text.len() == WIDTH,
                    TooWideSnafu {
                        field: self.name,
                        value: *n
                    }
                );
                text
            }
            (FieldKind::Str, Value::Str(s)) => {
                ensure!(
                    !s.contains(SEPARATOR),
                    SeparatorSnafu {
                        field: self.name,
                        value: s.clone()
                    }
                );
                s.clone()
            }
            (expected, value) => {
                return TypeMismatchSnafu {
                    field: self.name,
                    expected,
                    value: value.clone(),
                }
                .fail();
            }
        };
        Ok(if self.scatter {
            text.chars().rev().collect()
        } else {
            text
        })
    }
    /// Parse a key component back into a [Value]
    fn parse_key(&self, text: &str) -> Result<Value> {
        let text: String = if self.scatter {
            text.chars().rev().collect()
        } else {
            text.to_owned()
        };
        match self.kind {
            FieldKind::Int | FieldKind::Timestamp => {
                text.parse::<i64>()
                    .map(Value::Int)
                    .with_context(|_| BadIntSnafu {
                        field: self.name,
                        text: text.clone(),
                    })
            }
            FieldKind::Str => Ok(Value::Str(text)),
        }
    }
    /// Render a payload value as cell contents. Integers are written as plain decimal text; payload
    /// columns are never scanned, so they need no padding.
    pub fn render_cell(&self, value: &Value) -> Result<Vec<u8>> {
        match (self.kind, value) {
            (FieldKind::Int | FieldKind::Timestamp, Value::Int(n)) => {
                Ok(n.to_string().into_bytes())
            }
            (FieldKind::Str, Value::Str(s)) => Ok(s.clone().into_bytes()),
            (expected, value) => TypeMismatchSnafu {
                field: self.name,
                expected,
                value: value.clone(),
            }
            .fail(),
        }
    }
    pub fn parse_cell(&self, cell: &[u8]) -> Result<Value> {
        let text = std::str::from_utf8(cell).context(Utf8Snafu { field: self.name })?;
        match self.kind {
            FieldKind::Int | FieldKind::Timestamp => {
                text.parse::<i64>()
                    .map(Value::Int)
                    .with_context(|_| BadIntSnafu {
                        field: self.name,
                        text: text.to_owned(),
                    })
            }
            FieldKind::Str => Ok(Value::Str(text.to_owned())),
        }
    }
}

/// A record type's table name & fields, in declaration order
#[derive(Debug)]
pub struct Schema {
    pub table: &'static str,
    pub fields: &'static [FieldSpec],
}

impl Schema {
    pub fn key_fields(&self) -> impl Iterator<Item = &'static FieldSpec> {
        self.fields.iter().filter(|f| f.is_key())
    }
    pub fn payload_fields(&self) -> impl Iterator<Item = &'static FieldSpec> {
        self.fields.iter().filter(|f| !f.is_key())
    }
    /// The distinct column families used by this schema's payload fields, in declaration order
    pub fn families(&self) -> Vec<&'static str> {
        let mut families = Vec::new();
        for field in self.fields {
            if let Role::Payload { family } = field.role {
                if !families.contains(&family) {
                    families.push(family);
                }
            }
        }
        families
    }
    /// Look up a payload field by its column name ("family:name")
    pub fn field_for_column(&self, column: &str) -> Option<&'static FieldSpec> {
        self.fields
            .iter()
            .find(|f| f.column().as_deref() == Some(column))
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         field values                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A single field value
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Str(String),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            Value::Str(_) => None,
        }
    }
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Int(_) => None,
            Value::Str(s) => Some(s),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

/// An ordered map from field name to (optional) [Value]
///
/// Order is insertion order; [RowKeyCodec::decode] produces maps in key declaration order, with
/// `None` standing in for trailing key fields that weren't present in the encoded key.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FieldMap(Vec<(&'static str, Option<Value>)>);

impl FieldMap {
    pub fn new() -> FieldMap {
        FieldMap(Vec::new())
    }
    /// Builder-style [FieldMap::insert]
    pub fn with(mut self, name: &'static str, value: impl Into<Value>) -> FieldMap {
        self.insert(name, Some(value.into()));
        self
    }
    pub fn insert(&mut self, name: &'static str, value: Option<Value>) {
        match self.0.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value,
            None => self.0.push((name, value)),
        }
    }
    /// Retrieve the value for `name`; `None` if it's either absent or unset
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0
            .iter()
            .find(|(n, _)| *n == name)
            .and_then(|(_, v)| v.as_ref())
    }
    /// Retrieve a required integer (or timestamp) field
    pub fn int(&self, name: &'static str) -> Result<i64> {
        match self.get(name) {
            Some(Value::Int(n)) => Ok(*n),
            Some(value) => TypeMismatchSnafu {
                field: name,
                expected: FieldKind::Int,
                value: value.clone(),
            }
            .fail(),
            None => MissingFieldSnafu { field: name }.fail(),
        }
    }
    /// Retrieve a required string field
    pub fn string(&self, name: &'static str) -> Result<String> {
        match self.get(name) {
            Some(Value::Str(s)) => Ok(s.clone()),
            Some(value) => TypeMismatchSnafu {
                field: name,
                expected: FieldKind::Str,
                value: value.clone(),
            }
            .fail(),
            None => MissingFieldSnafu { field: name }.fail(),
        }
    }
    pub fn iter(&self) -> impl Iterator<Item = &(&'static str, Option<Value>)> {
        self.0.iter()
    }
    pub fn len(&self) -> usize {
        self.0.len()
    }
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A positional tuple of key values, possibly a prefix of the full key
///
/// Use the [key!] macro to build one: `key![user_id, created_at]`.
///
/// [key!]: crate::key
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct KeyTuple(pub Vec<Value>);

impl KeyTuple {
    pub fn len(&self) -> usize {
        self.0.len()
    }
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[macro_export]
macro_rules! key {
    ($($value:expr),* $(,)?) => {
        $crate::row_key::KeyTuple(vec![$($crate::row_key::Value::from($value)),*])
    };
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           the codec                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EncodeMode {
    /// Every key field must be present
    Full,
    /// Stop at the first missing key field
    Prefix,
}

/// Composite row key encoder/decoder for a single [Schema]
#[derive(Clone, Copy, Debug)]
pub struct RowKeyCodec {
    schema: &'static Schema,
}

impl RowKeyCodec {
    pub fn new(schema: &'static Schema) -> RowKeyCodec {
        RowKeyCodec { schema }
    }
    pub fn schema(&self) -> &'static Schema {
        self.schema
    }
    /// Encode the key fields in `fields`; payload fields are ignored
    pub fn encode(&self, fields: &FieldMap, mode: EncodeMode) -> Result<Vec<u8>> {
        let mut parts = Vec::new();
        for spec in self.schema.key_fields() {
            match fields.get(spec.name) {
                Some(value) => parts.push(spec.render_key(value)?),
                None => match mode {
                    EncodeMode::Full => return MissingFieldSnafu { field: spec.name }.fail(),
                    EncodeMode::Prefix => break,
                },
            }
        }
        Ok(parts.join(&SEPARATOR.to_string()).into_bytes())
    }
    /// Encode a positional [KeyTuple]
    pub fn encode_tuple(&self, tuple: &KeyTuple, mode: EncodeMode) -> Result<Vec<u8>> {
        self.encode(&self.tuple_fields(tuple)?, mode)
    }
    /// Name the values in `tuple` after this schema's key fields
    pub fn tuple_fields(&self, tuple: &KeyTuple) -> Result<FieldMap> {
        let keys = self.schema.key_fields().count();
        ensure!(
            tuple.len() <= keys,
            TooManyValuesSnafu {
                table: self.schema.table,
                count: tuple.len(),
                keys
            }
        );
        let mut fields = FieldMap::new();
        self.schema
            .key_fields()
            .zip(tuple.0.iter())
            .for_each(|(spec, value)| fields.insert(spec.name, Some(value.clone())));
        Ok(fields)
    }
    /// Decode `key` into a [FieldMap] holding every key field, in declaration order
    pub fn decode(&self, key: &[u8]) -> Result<FieldMap> {
        let text = std::str::from_utf8(key).context(Utf8Snafu { field: "row key" })?;
        let mut parts = if text.is_empty() {
            None
        } else {
            Some(text.split(SEPARATOR))
        };
        let mut fields = FieldMap::new();
        for spec in self.schema.key_fields() {
            let value = match parts.as_mut().and_then(|p| p.next()) {
                Some(part) => Some(spec.parse_key(part)?),
                None => None,
            };
            fields.insert(spec.name, value);
        }
        ensure!(
            parts.as_mut().and_then(|p| p.next()).is_none(),
            TooManyComponentsSnafu {
                table: self.schema.table,
                key: text.to_owned()
            }
        );
        Ok(fields)
    }
}
