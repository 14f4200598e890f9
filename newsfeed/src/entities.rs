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

//! # newsfeed entities
//!
//! Identifiers, timestamps & the records newsfeed keeps in its wide-column store:
//!
//! | record            | table        | key                              | payload            |
//! |-------------------|--------------|----------------------------------|--------------------|
//! | [NewsFeedEntry]   | `newsfeeds`  | user_id (scattered), created_at  | `cf:post_id`       |
//! | [Following]       | `followings` | from_user_id (scattered), created_at | `cf:to_user_id` |
//! | [Follower]        | `followers`  | to_user_id (scattered), created_at | `cf:from_user_id` |
//!
//! [Post] is different: posts belong to the (relational) content service. newsfeed only ever sees
//! them in flight, or cached.

use std::{
    fmt::Display,
    sync::atomic::{AtomicI64, Ordering},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    list_cache::Entity,
    row_key::{self, FieldKind, FieldMap, FieldSpec, Schema, Value},
    wide_column::Record,
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          identifiers                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

macro_rules! define_id {
    ($type_name:ident) => {
        #[derive(
            Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
        )]
        #[serde(transparent)]
        pub struct $type_name(pub i64);
        impl Display for $type_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
        impl From<$type_name> for Value {
            fn from(value: $type_name) -> Self {
                Value::Int(value.0)
            }
        }
    };
}

define_id!(UserId);
define_id!(PostId);

/// Microseconds since the Unix epoch
///
/// Sixteen decimal digits of microseconds takes us out to the year 2286, which is the widest value
/// the row key encoding can order.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct Timestamp(pub i64);

static LAST_ISSUED: AtomicI64 = AtomicI64::new(0);

impl Timestamp {
    /// The largest encodable timestamp; used as an exclusive upper bound on scans
    pub const MAX: Timestamp = Timestamp(9_999_999_999_999_999);
    /// The current time; strictly increasing within this process, so that two entries for one
    /// subject created in the same microsecond don't collide
    pub fn now() -> Timestamp {
        let wall = Utc::now().timestamp_micros();
        let mut last = LAST_ISSUED.load(Ordering::Relaxed);
        loop {
            let next = wall.max(last + 1);
            match LAST_ISSUED.compare_exchange_weak(last, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return Timestamp(next),
                Err(current) => last = current,
            }
        }
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match DateTime::<Utc>::from_timestamp_micros(self.0) {
            Some(dt) => write!(f, "{}", dt.to_rfc3339()),
            None => write!(f, "{}us", self.0),
        }
    }
}

impl From<Timestamp> for Value {
    fn from(value: Timestamp) -> Self {
        Value::Int(value.0)
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(value: DateTime<Utc>) -> Self {
        Timestamp(value.timestamp_micros())
    }
}

/// Anything carrying the timestamp by which feeds are ordered
pub trait Timestamped {
    fn timestamp(&self) -> Timestamp;
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         NewsFeedEntry                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

static NEWSFEEDS: Schema = Schema {
    table: "newsfeeds",
    fields: &[
        FieldSpec::scattered_key("user_id", FieldKind::Int),
        FieldSpec::key("created_at", FieldKind::Timestamp),
        FieldSpec::payload("cf", "post_id", FieldKind::Int),
    ],
};

/// "`post_id` appears in `user_id`'s feed at `created_at`"
///
/// `created_at` is the *post's* creation time, not the time the entry was written; that makes
/// re-delivering a post to the same feed an idempotent overwrite.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct NewsFeedEntry {
    pub user_id: UserId,
    pub created_at: Timestamp,
    pub post_id: PostId,
}

impl NewsFeedEntry {
    pub fn new(user_id: UserId, created_at: Timestamp, post_id: PostId) -> NewsFeedEntry {
        NewsFeedEntry {
            user_id,
            created_at,
            post_id,
        }
    }
}

impl Timestamped for NewsFeedEntry {
    fn timestamp(&self) -> Timestamp {
        self.created_at
    }
}

impl Record for NewsFeedEntry {
    fn schema() -> &'static Schema {
        &NEWSFEEDS
    }
    fn to_fields(&self) -> FieldMap {
        FieldMap::new()
            .with("user_id", self.user_id)
            .with("created_at", self.created_at)
            .with("post_id", self.post_id)
    }
    fn from_fields(fields: &FieldMap) -> row_key::Result<Self> {
        Ok(NewsFeedEntry {
            user_id: UserId(fields.int("user_id")?),
            created_at: Timestamp(fields.int("created_at")?),
            post_id: PostId(fields.int("post_id")?),
        })
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                     Following & Follower                                       //
////////////////////////////////////////////////////////////////////////////////////////////////////

static FOLLOWINGS: Schema = Schema {
    table: "followings",
    fields: &[
        FieldSpec::scattered_key("from_user_id", FieldKind::Int),
        FieldSpec::key("created_at", FieldKind::Timestamp),
        FieldSpec::payload("cf", "to_user_id", FieldKind::Int),
    ],
};

/// "`from_user_id` has followed `to_user_id` since `created_at`", keyed for the follower
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Following {
    pub from_user_id: UserId,
    pub created_at: Timestamp,
    pub to_user_id: UserId,
}

impl Record for Following {
    fn schema() -> &'static Schema {
        &FOLLOWINGS
    }
    fn to_fields(&self) -> FieldMap {
        FieldMap::new()
            .with("from_user_id", self.from_user_id)
            .with("created_at", self.created_at)
            .with("to_user_id", self.to_user_id)
    }
    fn from_fields(fields: &FieldMap) -> row_key::Result<Self> {
        Ok(Following {
            from_user_id: UserId(fields.int("from_user_id")?),
            created_at: Timestamp(fields.int("created_at")?),
            to_user_id: UserId(fields.int("to_user_id")?),
        })
    }
}

static FOLLOWERS: Schema = Schema {
    table: "followers",
    fields: &[
        FieldSpec::scattered_key("to_user_id", FieldKind::Int),
        FieldSpec::key("created_at", FieldKind::Timestamp),
        FieldSpec::payload("cf", "from_user_id", FieldKind::Int),
    ],
};

/// The same edge as [Following], keyed for the user being followed
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Follower {
    pub to_user_id: UserId,
    pub created_at: Timestamp,
    pub from_user_id: UserId,
}

impl Record for Follower {
    fn schema() -> &'static Schema {
        &FOLLOWERS
    }
    fn to_fields(&self) -> FieldMap {
        FieldMap::new()
            .with("to_user_id", self.to_user_id)
            .with("created_at", self.created_at)
            .with("from_user_id", self.from_user_id)
    }
    fn from_fields(fields: &FieldMap) -> row_key::Result<Self> {
        Ok(Follower {
            to_user_id: UserId(fields.int("to_user_id")?),
            created_at: Timestamp(fields.int("created_at")?),
            from_user_id: UserId(fields.int("from_user_id")?),
        })
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                              Post                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A post, as handed to us by the content service
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Post {
    pub id: PostId,
    pub user_id: UserId,
    pub created_at: Timestamp,
    #[serde(default)]
    pub content: String,
}

impl Timestamped for Post {
    fn timestamp(&self) -> Timestamp {
        self.created_at
    }
}

impl Entity for Post {
    const MODEL: &'static str = "posts.post";
    fn pk(&self) -> i64 {
        self.id.0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::row_key::{EncodeMode, RowKeyCodec};

    #[test]
    fn newsfeed_keys() {
        let entry = NewsFeedEntry::new(UserId(42), Timestamp(1_700_000_000_000_000), PostId(7));
        let codec = RowKeyCodec::new(NewsFeedEntry::schema());
        let key = codec.encode(&entry.to_fields(), EncodeMode::Full).unwrap();
        assert_eq!(key, b"2400000000000000:1700000000000000".to_vec());
        let mut fields = codec.decode(&key).unwrap();
        fields.insert("post_id", Some(Value::Int(7)));
        assert_eq!(NewsFeedEntry::from_fields(&fields).unwrap(), entry);
    }

    #[test]
    fn timestamps() {
        let (a, b) = (Timestamp::now(), Timestamp::now());
        assert!(a < b);
        assert!(b < Timestamp::MAX);
        assert_eq!(format!("{}", Timestamp(0)), "1970-01-01T00:00:00+00:00");
    }
}
