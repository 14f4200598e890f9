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

//! Scenarios exercising the wide-column store through [Table]: row key ordering & upsert
//! semantics, which every storage backend must honor.

use libtest_mimic::Failed;

use newsfeed::{
    entities::{NewsFeedEntry, PostId, Timestamp, UserId},
    key,
    row_key::{EncodeMode, RowKeyCodec},
    wide_column::{Record, ScanSpec},
};

use crate::{Backends, World, test_settings};

/// Writing the same entry twice leaves one row
pub async fn idempotent_upsert(backends: Backends) -> Result<(), Failed> {
    let world = World::new(&backends, test_settings(5, 2, 10)).await?;
    let table = world.feeds.table();
    let entry = NewsFeedEntry::new(UserId(101), Timestamp(1_000), PostId(1));
    table.put(&entry).await?;
    table.put(&entry).await?;
    // Same key, different payload: overwrite
    let moved = NewsFeedEntry::new(UserId(101), Timestamp(1_000), PostId(2));
    table.put(&moved).await?;
    let rows = table.scan(&ScanSpec::prefix(key![UserId(101)])).await?;
    assert_eq!(rows, vec![moved.clone()]);
    assert_eq!(table.get(&key![UserId(101), Timestamp(1_000)]).await?, Some(moved));
    // Deleting a missing row is fine
    table.delete(&key![UserId(101), Timestamp(2_000)]).await?;
    Ok(())
}

/// A partial key encodes to a prefix of every full key starting with the same fields, and full
/// keys decode to the values they were built from
pub async fn prefix_round_trip(backends: Backends) -> Result<(), Failed> {
    let world = World::new(&backends, test_settings(5, 2, 10)).await?;
    let codec = RowKeyCodec::new(NewsFeedEntry::schema());
    let entry = NewsFeedEntry::new(UserId(4242), Timestamp(1_700_000_000_000_000), PostId(9));
    let full = codec.encode(&entry.to_fields(), EncodeMode::Full)?;
    let prefix = codec.encode_tuple(&key![UserId(4242)], EncodeMode::Prefix)?;
    assert!(full.starts_with(&prefix));
    let fields = codec.decode(&full)?;
    assert_eq!(fields.int("user_id")?, 4242);
    assert_eq!(fields.int("created_at")?, 1_700_000_000_000_000);

    // ...and the prefix selects exactly that user's rows from the store
    let table = world.feeds.table();
    table.put(&entry).await?;
    table
        .put(&NewsFeedEntry::new(UserId(424), Timestamp(1), PostId(10)))
        .await?;
    table
        .put(&NewsFeedEntry::new(UserId(42420), Timestamp(1), PostId(11)))
        .await?;
    assert_eq!(
        table.scan(&ScanSpec::prefix(key![UserId(4242)])).await?,
        vec![entry]
    );
    Ok(())
}

/// Rows come back in numeric, not lexical, order of their timestamps, either way
pub async fn numeric_order(backends: Backends) -> Result<(), Failed> {
    let world = World::new(&backends, test_settings(5, 2, 10)).await?;
    let table = world.feeds.table();
    let user = UserId(7);
    for ts in [100, 2, 10, 1_000] {
        table
            .put(&NewsFeedEntry::new(user, Timestamp(ts), PostId(ts)))
            .await?;
    }
    let forward = table
        .scan(&ScanSpec::prefix(key![user]))
        .await?
        .into_iter()
        .map(|e| e.created_at.0)
        .collect::<Vec<_>>();
    assert_eq!(forward, vec![2, 10, 100, 1_000]);
    let newest = table
        .scan(&ScanSpec::prefix(key![user]).reverse().limit(2))
        .await?
        .into_iter()
        .map(|e| e.created_at.0)
        .collect::<Vec<_>>();
    assert_eq!(newest, vec![1_000, 100]);
    Ok(())
}
