// This file is part of Zangetsu, a replicated time-partitioned record store.
// Copyright (C) 2026 The Zangetsu Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The top-level store: a map of groups, an event stream for replication,
//! and a write barrier.
//!
//! Layout on disk is `<root>/<group>/<dayTimestamp>/data`; the directory
//! tree is the whole catalog. The [`Database`] caches it in RAM under the
//! assumption that only one process accesses the root at a time.
//!
//! Mutations are `async`: each takes a shared permit on the write barrier,
//! so [`Database::lock_writes`] can quiesce the store — once the exclusive
//! permit is granted, every outstanding mutation has completed and no
//! events will be emitted until the guard drops. Event emission happens
//! under the inner mutex *before* the file write commits, so subscribers
//! observe events in commit order and can enqueue the same bytes. The
//! write syscall itself runs on the blocking thread pool with no lock held
//! at all: the record's offset is reserved under the inner mutex (fixing
//! file order to event order), the mutex is released, and the positioned
//! write then lands at the reserved offset. A slow disk write never stalls
//! readers or writes to other entries; the entry's `written_size` advances
//! only along the contiguous frontier of completed writes.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use base::clock::{RealClocks, TimerGuard};
use base::{err, Error, Mutex};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::codec;
use crate::entry::{Record, TimeEntry};
use crate::fs;
use crate::group::{self, Group};

pub const SECONDS_PER_DAY: u64 = 86_400;

/// Truncates a timestamp in seconds to its day boundary, the bucket key
/// inside a group.
pub fn day_timestamp(timestamp: u64) -> u64 {
    timestamp - timestamp % SECONDS_PER_DAY
}

/// One value of the table of contents: the producer's written size.
#[derive(Copy, Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct TocEntry {
    pub size: u64,
}

/// The coarse content summary used for replication diffs:
/// `{group → {dayTimestamp → {size}}}`.
pub type Toc = BTreeMap<String, BTreeMap<u64, TocEntry>>;

/// A mutation notification, as delivered to [`EventStream`] subscribers.
#[derive(Clone, Debug)]
pub enum Event {
    /// Emitted before a record write commits. `record` is the full framed
    /// bytes as they will land on disk.
    Adding {
        group: String,
        day_timestamp: u64,
        record: Bytes,
    },

    /// Emitted after `remove`: the whole group (`before == None`) or every
    /// entry with a day timestamp strictly less than `before`.
    Remove { group: String, before: Option<u64> },

    /// Emitted after `remove_one`.
    RemoveOne { group: String, day_timestamp: u64 },
}

pub struct AddOutcome {
    pub day_timestamp: u64,
    pub offset: u64,
    pub record_size: u64,
}

struct LockedDatabase {
    groups: BTreeMap<String, Group>,
    subscribers: Vec<(u64, mpsc::UnboundedSender<Event>)>,
    next_subscriber_id: u64,
}

impl LockedDatabase {
    /// Fans the event out to every subscriber without blocking; subscribers
    /// that went away are dropped from the list.
    fn emit(&mut self, event: Event) {
        self.subscribers
            .retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }
}

pub struct Database {
    root: PathBuf,
    inner: Mutex<LockedDatabase>,
    barrier: tokio::sync::RwLock<()>,
}

impl Database {
    /// Opens (creating if necessary) the store rooted at `root`, loading
    /// every group directory within. Hidden directories left over from
    /// removals interrupted by a crash are unlinked.
    pub fn open(root: impl Into<PathBuf>) -> Result<Arc<Self>, Error> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .map_err(|e| err!(e, msg("unable to create db root {}", root.display())))?;
        let mut groups = BTreeMap::new();
        let iter = std::fs::read_dir(&root)
            .map_err(|e| err!(e, msg("unable to read db root {}", root.display())))?;
        for dent in iter {
            let dent =
                dent.map_err(|e| err!(e, msg("unable to read db root {}", root.display())))?;
            let fname = dent.file_name();
            let Some(name) = fname.to_str() else {
                warn!("skipping non-UTF-8 name in db root");
                continue;
            };
            if name.starts_with(".hidden-") {
                fs::spawn_unlink(dent.path());
                continue;
            }
            if group::validate_name(name).is_err() {
                warn!("skipping unexpected dir {name:?} in db root");
                continue;
            }
            groups.insert(name.to_owned(), Group::open(name, dent.path())?);
        }
        info!("loaded {} group(s) from {}", groups.len(), root.display());
        Ok(Arc::new(Database {
            root,
            inner: Mutex::new(LockedDatabase {
                groups,
                subscribers: Vec::new(),
                next_subscriber_id: 0,
            }),
            barrier: tokio::sync::RwLock::new(()),
        }))
    }

    /// Appends one record built from `payloads`, lazily creating the group
    /// and its time entry for `timestamp`'s day.
    pub async fn add(
        self: &Arc<Self>,
        group: &str,
        timestamp: u64,
        payloads: &[&[u8]],
        corrupted: bool,
    ) -> Result<AddOutcome, Error> {
        let record = Bytes::from(codec::encode(payloads, timestamp, corrupted));
        self.append_framed(group, day_timestamp(timestamp), record)
            .await
    }

    /// Appends one pre-framed record into the given day bucket, verifying
    /// its framing first. This is the replication apply path; the bytes
    /// land verbatim so the file stays byte-identical to the producer's.
    pub async fn append_record(
        self: &Arc<Self>,
        group: &str,
        day_timestamp: u64,
        record: Bytes,
    ) -> Result<AddOutcome, Error> {
        codec::verify_record(&record)
            .map_err(|e| err!(DataLoss, msg("refusing to apply bad record"), source(e)))?;
        self.append_framed(group, day_timestamp, record).await
    }

    async fn append_framed(
        self: &Arc<Self>,
        group: &str,
        day_timestamp: u64,
        record: Bytes,
    ) -> Result<AddOutcome, Error> {
        group::validate_name(group)?;
        let _permit = self.barrier.read().await;
        let this = self.clone();
        let group = group.to_owned();
        let (offset, record_size) = tokio::task::spawn_blocking(move || -> Result<(u64, u64), Error> {
            // Reserve the record's offset while the inner mutex is still
            // held, so per-entry file order matches event order; the write
            // itself happens only after the mutex is released.
            let mut l = this.inner.lock();
            if !l.groups.contains_key(&group) {
                let g = Group::create(&group, this.root.join(&group))?;
                l.groups.insert(group.clone(), g);
            }
            let entry = l
                .groups
                .get_mut(&group)
                .expect("group was just ensured")
                .get_or_create(day_timestamp)?;
            let appender = entry.begin_append(record.len() as u64)?;
            l.emit(Event::Adding {
                group,
                day_timestamp,
                record: record.clone(),
            });
            drop(l);
            appender.commit(&record)
        })
        .await
        .map_err(|e| err!(Internal, msg("append task panicked"), source(e)))??;
        Ok(AddOutcome {
            day_timestamp,
            offset,
            record_size,
        })
    }

    /// Reads the single record at `offset` within `timestamp`'s day bucket.
    pub fn get(&self, group: &str, timestamp: u64, offset: u64) -> Result<Record, Error> {
        let dst = day_timestamp(timestamp);
        let entry = self
            .entry(group, dst)
            .ok_or_else(|| err!(NotFound, msg("no such time entry {group}/{dst}")))?;
        entry.get(offset)
    }

    pub fn entry(&self, group: &str, day_timestamp: u64) -> Option<Arc<TimeEntry>> {
        self.inner
            .lock()
            .groups
            .get(group)
            .and_then(|g| g.entry(day_timestamp))
            .cloned()
    }

    /// Removes the whole group (`before == None`) or every entry strictly
    /// older than `before`. Removing something that doesn't exist is a
    /// no-op; replication replays must be idempotent.
    pub async fn remove(self: &Arc<Self>, group: &str, before: Option<u64>) -> Result<(), Error> {
        group::validate_name(group)?;
        let _permit = self.barrier.read().await;
        let this = self.clone();
        let group = group.to_owned();
        tokio::task::spawn_blocking(move || -> Result<(), Error> {
            let mut l = this.inner.lock();
            match before {
                None => {
                    if let Some(g) = l.groups.remove(&group) {
                        g.destroy()?;
                        l.emit(Event::Remove {
                            group,
                            before: None,
                        });
                    }
                }
                Some(day_timestamp) => {
                    let removed = match l.groups.get_mut(&group) {
                        None => return Ok(()),
                        Some(g) => g.remove_before(day_timestamp)?,
                    };
                    if !removed.is_empty() {
                        l.emit(Event::Remove {
                            group,
                            before: Some(day_timestamp),
                        });
                    }
                }
            }
            Ok(())
        })
        .await
        .map_err(|e| err!(Internal, msg("remove task panicked"), source(e)))??;
        Ok(())
    }

    /// Removes exactly one time entry; a no-op if absent.
    pub async fn remove_one(self: &Arc<Self>, group: &str, day_timestamp: u64) -> Result<(), Error> {
        group::validate_name(group)?;
        let _permit = self.barrier.read().await;
        let this = self.clone();
        let group = group.to_owned();
        tokio::task::spawn_blocking(move || -> Result<(), Error> {
            let mut l = this.inner.lock();
            let removed = match l.groups.get_mut(&group) {
                None => return Ok(()),
                Some(g) => g.remove_one(day_timestamp)?,
            };
            if removed {
                l.emit(Event::RemoveOne {
                    group,
                    day_timestamp,
                });
            }
            Ok(())
        })
        .await
        .map_err(|e| err!(Internal, msg("remove task panicked"), source(e)))??;
        Ok(())
    }

    /// Snapshots the table of contents: every entry's written size.
    pub fn toc(&self) -> Toc {
        let l = self.inner.lock();
        l.groups
            .iter()
            .map(|(name, g)| {
                let days = g
                    .entries()
                    .iter()
                    .map(|(&dst, e)| {
                        (
                            dst,
                            TocEntry {
                                size: e.written_size(),
                            },
                        )
                    })
                    .collect();
                (name.clone(), days)
            })
            .collect()
    }

    /// Subscribes to mutation events. The stream receives every event
    /// emitted after this call until it is dropped.
    pub fn subscribe(self: &Arc<Self>) -> EventStream {
        let mut l = self.inner.lock();
        let id = l.next_subscriber_id;
        l.next_subscriber_id += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        l.subscribers.push((id, tx));
        EventStream {
            db: self.clone(),
            id,
            rx,
        }
    }

    /// Waits for all outstanding mutations to complete, then returns a
    /// guard. Until the guard drops, mutations block and no events are
    /// emitted.
    pub async fn lock_writes(&self) -> WriteLockGuard<'_> {
        let timer = TimerGuard::new(&RealClocks {}, || "database write lock acquisition");
        let guard = self.barrier.write().await;
        drop(timer);
        WriteLockGuard { _guard: guard }
    }
}

/// Exclusive hold on the write barrier; see [`Database::lock_writes`].
pub struct WriteLockGuard<'a> {
    _guard: tokio::sync::RwLockWriteGuard<'a, ()>,
}

/// A subscription to [`Database`] events; unsubscribes on drop.
pub struct EventStream {
    db: Arc<Database>,
    id: u64,
    rx: mpsc::UnboundedReceiver<Event>,
}

impl EventStream {
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        let mut l = self.db.inner.lock();
        l.subscribers.retain(|(id, _)| *id != self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::testutil;

    #[tokio::test]
    async fn add_get_toc() {
        testutil::init();
        let tdb = testutil::TestDb::new();
        let db = &tdb.db;
        let o = db.add("foo", 172_801, &[b"hello world"], false).await.unwrap();
        assert_eq!(o.day_timestamp, 172_800);
        assert_eq!(o.offset, 0);
        assert_eq!(o.record_size, codec::record_size(11));
        assert_eq!(db.get("foo", 172_801, 0).unwrap().payload(), b"hello world");

        let toc = db.toc();
        assert_eq!(toc["foo"][&172_800].size, codec::record_size(11));
    }

    #[tokio::test]
    async fn reopen_sees_same_contents() {
        testutil::init();
        let tmp = tempfile::Builder::new().prefix("zangetsu-db").tempdir().unwrap();
        let toc1 = {
            let db = Database::open(tmp.path()).unwrap();
            db.add("a", 100, &[b"one"], false).await.unwrap();
            db.add("a", 86_500, &[b"two"], false).await.unwrap();
            db.add("b", 100, &[b"three"], true).await.unwrap();
            db.toc()
        };
        let db = Database::open(tmp.path()).unwrap();
        assert_eq!(db.toc(), toc1);
        assert!(db.get("b", 100, 0).unwrap().header.corrupted);
    }

    #[tokio::test]
    async fn bad_group_name() {
        testutil::init();
        let tdb = testutil::TestDb::new();
        let e = tdb.db.add("../oops", 0, &[b"x"], false).await.unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn events_in_commit_order() {
        testutil::init();
        let tdb = testutil::TestDb::new();
        let db = &tdb.db;
        let mut events = db.subscribe();
        db.add("foo", 100, &[b"hello"], false).await.unwrap();
        db.remove_one("foo", 0).await.unwrap();
        db.remove("foo", None).await.unwrap();

        match events.recv().await.unwrap() {
            Event::Adding {
                group,
                day_timestamp,
                record,
            } => {
                assert_eq!(group, "foo");
                assert_eq!(day_timestamp, 0);
                assert_eq!(codec::verify_record(&record).unwrap().size, 5);
            }
            other => panic!("unexpected event {other:?}"),
        }
        match events.recv().await.unwrap() {
            Event::RemoveOne {
                group,
                day_timestamp,
            } => {
                assert_eq!(group, "foo");
                assert_eq!(day_timestamp, 0);
            }
            other => panic!("unexpected event {other:?}"),
        }
        match events.recv().await.unwrap() {
            Event::Remove {
                group,
                before: None,
            } => assert_eq!(group, "foo"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn no_op_removes_emit_nothing() {
        testutil::init();
        let tdb = testutil::TestDb::new();
        let db = &tdb.db;
        let mut events = db.subscribe();
        db.remove("nope", None).await.unwrap();
        db.remove_one("nope", 0).await.unwrap();
        db.add("foo", 0, &[b"x"], false).await.unwrap();
        assert!(matches!(events.recv().await, Some(Event::Adding { .. })));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn write_lock_blocks_mutations() {
        testutil::init();
        let tdb = testutil::TestDb::new();
        let db = tdb.db.clone();
        let guard = db.lock_writes().await;

        let db2 = db.clone();
        let add = tokio::spawn(async move { db2.add("foo", 0, &[b"x"], false).await });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!add.is_finished());

        drop(guard);
        add.await.unwrap().unwrap();
        assert_eq!(db.toc()["foo"][&0].size, codec::record_size(1));
    }
}
