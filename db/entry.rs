// This file is part of Zangetsu, a replicated time-partitioned record store.
// Copyright (C) 2026 The Zangetsu Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! One append-only data file for a (group, day timestamp) pair.
//!
//! A `TimeEntry` tracks two sizes. `data_file_size` is the append cursor:
//! it advances when an append is reserved, so concurrent appends get
//! disjoint offsets and the file's byte order matches reservation order.
//! `written_size` is what downstream observers may see: the contiguous
//! frontier of completed writes, advanced only after the kernel-level
//! write at an offset (and every offset before it) has completed. Writes
//! are positioned, so no lock is held across the write syscall.
//!
//! Streaming readers hold a [`ReadOperation`] guard; destruction of the
//! entry's backing directory is deferred until the guard count reaches
//! zero.

use std::collections::BTreeMap;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::Arc;

use base::{bail, err, Error, Mutex};
use tracing::warn;

use crate::codec::{self, CodecError, Header, FOOTER_SIZE, HEADER_SIZE};
use crate::fs;
use crate::group::GroupTomb;

/// Where an entry's hidden directory goes once its readers quiesce.
pub(crate) enum Tomb {
    /// This entry was removed alone; unlink the given hidden directory.
    Entry(PathBuf),

    /// The whole group was removed; count down the shared tombstone.
    Group(Arc<GroupTomb>),
}

struct EntryState {
    data_file_size: u64,
    written_size: u64,

    /// Completed writes sitting beyond the contiguous frontier, as
    /// `offset → end`. Drained into `written_size` as the gaps before
    /// them fill in.
    completed: BTreeMap<u64, u64>,

    read_operations: usize,
    closed: bool,
    tomb: Option<Tomb>,
}

pub struct TimeEntry {
    group: String,
    day_timestamp: u64,

    /// Positioned reads and writes only; the offsets come from `state`.
    file: File,

    state: Mutex<EntryState>,
}

/// A record as returned by [`TimeEntry::get`] and [`RecordCursor::next`]:
/// the full framed bytes plus the decoded header.
pub struct Record {
    pub offset: u64,
    pub header: Header,

    /// The complete record as stored: header, payload, footer.
    pub data: Vec<u8>,
}

impl Record {
    pub fn payload(&self) -> &[u8] {
        &self.data[HEADER_SIZE..self.data.len() - FOOTER_SIZE]
    }

    pub fn record_size(&self) -> u64 {
        self.data.len() as u64
    }
}

impl TimeEntry {
    fn with_state(group: &str, day_timestamp: u64, file: File, size: u64) -> Arc<Self> {
        Arc::new(TimeEntry {
            group: group.to_owned(),
            day_timestamp,
            file,
            state: Mutex::new(EntryState {
                data_file_size: size,
                written_size: size,
                completed: BTreeMap::new(),
                read_operations: 0,
                closed: false,
                tomb: None,
            }),
        })
    }

    /// Creates a fresh entry, making its directory and empty data file.
    pub(crate) fn create(group: &str, day_timestamp: u64, dir: PathBuf) -> Result<Arc<Self>, Error> {
        std::fs::create_dir_all(&dir)
            .map_err(|e| err!(e, msg("unable to create {}", dir.display())))?;
        let path = dir.join("data");
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| err!(e, msg("unable to create {}", path.display())))?;
        fs::sync_dir(&dir).map_err(|e| err!(e, msg("unable to sync {}", dir.display())))?;
        Ok(Self::with_state(group, day_timestamp, file, 0))
    }

    /// Opens an existing entry, scanning its file for the longest valid
    /// prefix of records. A torn tail (from a crash mid-write) is truncated
    /// so that `written_size` always falls on a record boundary.
    pub(crate) fn open(group: &str, day_timestamp: u64, dir: PathBuf) -> Result<Arc<Self>, Error> {
        let path = dir.join("data");
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| err!(e, msg("unable to open {}", path.display())))?;
        let len = file
            .metadata()
            .map_err(|e| err!(e, msg("unable to stat {}", path.display())))?
            .len();
        let mut valid = 0;
        loop {
            match read_record_at(&file, valid, len) {
                Ok(None) => break,
                Ok(Some((_, data))) => valid += data.len() as u64,
                Err(ReadError::Codec(err)) => {
                    warn!(
                        %err,
                        "truncating {} from {} to {} bytes",
                        path.display(),
                        len,
                        valid
                    );
                    file.set_len(valid)
                        .map_err(|e| err!(e, msg("unable to truncate {}", path.display())))?;
                    file.sync_all()
                        .map_err(|e| err!(e, msg("unable to sync {}", path.display())))?;
                    break;
                }
                Err(ReadError::Io(e)) => {
                    return Err(err!(e, msg("unable to read {}", path.display())).build())
                }
            }
        }
        Ok(Self::with_state(group, day_timestamp, file, valid))
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn day_timestamp(&self) -> u64 {
        self.day_timestamp
    }

    pub fn written_size(&self) -> u64 {
        self.state.lock().written_size
    }

    pub fn data_file_size(&self) -> u64 {
        self.state.lock().data_file_size
    }

    #[cfg(test)]
    pub(crate) fn read_operations(&self) -> usize {
        self.state.lock().read_operations
    }

    /// Appends one record built from the given payload buffers.
    /// Returns the byte offset of the record's header and its total size.
    pub fn add(
        &self,
        payloads: &[&[u8]],
        timestamp: u64,
        corrupted: bool,
    ) -> Result<(u64, u64), Error> {
        self.append(&codec::encode(payloads, timestamp, corrupted))
    }

    /// Appends one pre-framed record. The caller has already validated the
    /// framing (see [`codec::verify_record`]).
    pub fn append(&self, framed: &[u8]) -> Result<(u64, u64), Error> {
        self.begin_append(framed.len() as u64)?.commit(framed)
    }

    /// Reserves the next `len` bytes of the file for one append, failing if
    /// the entry is closed. The write syscall itself happens in
    /// [`Appender::commit`]; a caller holding a broader lock reserves under
    /// it and commits after releasing it, so file order follows reservation
    /// order while the write blocks nothing else.
    pub fn begin_append(&self, len: u64) -> Result<Appender<'_>, Error> {
        let mut l = self.state.lock();
        if l.closed {
            bail!(
                FailedPrecondition,
                msg("time entry {}/{} is closed", self.group, self.day_timestamp)
            );
        }
        let offset = l.data_file_size;
        l.data_file_size += len;
        Ok(Appender {
            entry: self,
            offset,
            len,
            committed: false,
        })
    }

    /// Publishes a completed write. `written_size` only ever advances to a
    /// contiguous frontier: a write that finished ahead of a still-pending
    /// predecessor parks in `completed` until the gap fills.
    fn complete_append(&self, offset: u64, end: u64) {
        let mut l = self.state.lock();
        if l.written_size != offset {
            l.completed.insert(offset, end);
            return;
        }
        l.written_size = end;
        while let Some((&next, &next_end)) = l.completed.first_key_value() {
            if next != l.written_size {
                break;
            }
            l.completed.remove(&next);
            l.written_size = next_end;
        }
    }

    /// Permanently fails the entry: a reserved region will never be validly
    /// written, so nothing past the current frontier may ever be published.
    fn poison(&self) {
        self.state.lock().closed = true;
    }

    /// Takes out a read guard, deferring destruction until it is dropped.
    pub fn read_operation(self: &Arc<Self>) -> ReadOperation {
        self.state.lock().read_operations += 1;
        ReadOperation(self.clone())
    }

    /// Opens a streaming reader starting at the given byte offset. The
    /// reader sees a snapshot of `written_size` taken now; records appended
    /// later require a new cursor.
    pub fn cursor(self: &Arc<Self>, start: u64) -> RecordCursor {
        let op = self.read_operation();
        let end = self.state.lock().written_size;
        RecordCursor {
            entry: self.clone(),
            _op: op,
            offset: start,
            end,
        }
    }

    /// Reads the single record whose header lies at `offset`.
    pub fn get(self: &Arc<Self>, offset: u64) -> Result<Record, Error> {
        match self.cursor(offset).next()? {
            Some(r) => Ok(r),
            None => Err(err!(
                NotFound,
                msg(
                    "no record at offset {} in {}/{}",
                    offset,
                    self.group,
                    self.day_timestamp
                )
            )
            .build()),
        }
    }

    /// Marks the entry destroyed. Its directory has already been renamed
    /// aside by the owning group; the unlink happens now or (if streaming
    /// readers are active) when the last of them finishes.
    pub(crate) fn mark_removed(&self, tomb: Tomb) {
        let tomb = {
            let mut l = self.state.lock();
            l.closed = true;
            if l.read_operations > 0 {
                l.tomb = Some(tomb);
                return;
            }
            tomb
        };
        finish_tomb(tomb);
    }
}

fn finish_tomb(tomb: Tomb) {
    match tomb {
        Tomb::Entry(path) => fs::spawn_unlink(path),
        Tomb::Group(t) => t.entry_quiesced(),
    }
}

/// One reserved append; see [`TimeEntry::begin_append`]. Dropping it
/// without committing poisons the entry, since the reserved region would
/// otherwise be a permanent hole in the file.
pub struct Appender<'a> {
    entry: &'a TimeEntry,
    offset: u64,
    len: u64,
    committed: bool,
}

impl Appender<'_> {
    /// Writes the framed record at the reserved offset and publishes it.
    pub fn commit(mut self, framed: &[u8]) -> Result<(u64, u64), Error> {
        self.committed = true;
        assert_eq!(framed.len() as u64, self.len, "reservation length mismatch");
        if let Err(e) = self.entry.file.write_all_at(framed, self.offset) {
            // The file may now hold a torn record; nothing past written_size
            // is observable, and the open-time scan will trim it.
            self.entry.poison();
            return Err(err!(
                e,
                msg(
                    "write to {}/{} at offset {} failed",
                    self.entry.group,
                    self.entry.day_timestamp,
                    self.offset
                )
            )
            .build());
        }
        self.entry.complete_append(self.offset, self.offset + self.len);
        Ok((self.offset, self.len))
    }
}

impl Drop for Appender<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.entry.poison();
        }
    }
}

/// Guard held by active streaming readers of one [`TimeEntry`].
pub struct ReadOperation(Arc<TimeEntry>);

impl Drop for ReadOperation {
    fn drop(&mut self) {
        let tomb = {
            let mut l = self.0.state.lock();
            l.read_operations -= 1;
            if l.read_operations > 0 || !l.closed {
                return;
            }
            l.tomb.take()
        };
        if let Some(tomb) = tomb {
            finish_tomb(tomb);
        }
    }
}

enum ReadError {
    Codec(CodecError),
    Io(std::io::Error),
}

/// Reads and validates one record at `offset`, bounded by `end`.
/// `Ok(None)` means a clean end of records exactly at `end`.
fn read_record_at(file: &File, offset: u64, end: u64) -> Result<Option<(Header, Vec<u8>)>, ReadError> {
    if offset >= end {
        return Ok(None);
    }
    if offset + (HEADER_SIZE + FOOTER_SIZE) as u64 > end {
        return Err(ReadError::Codec(CodecError::Malformed(
            "framing extends past end",
        )));
    }
    let mut header_bytes = [0u8; HEADER_SIZE];
    file.read_exact_at(&mut header_bytes, offset)
        .map_err(ReadError::Io)?;
    let header = codec::decode_header(&header_bytes).map_err(ReadError::Codec)?;
    let record_size = codec::record_size(u64::from(header.size));
    if offset + record_size > end {
        return Err(ReadError::Codec(CodecError::Malformed(
            "record extends past end",
        )));
    }
    let mut data = vec![0u8; record_size as usize];
    data[..HEADER_SIZE].copy_from_slice(&header_bytes);
    file.read_exact_at(&mut data[HEADER_SIZE..], offset + HEADER_SIZE as u64)
        .map_err(ReadError::Io)?;
    let footer_start = data.len() - FOOTER_SIZE;
    let footer_bytes: &[u8; FOOTER_SIZE] = data[footer_start..].try_into().expect("sliced");
    codec::verify_footer(&header_bytes, &data[HEADER_SIZE..footer_start], footer_bytes)
        .map_err(ReadError::Codec)?;
    Ok(Some((header, data)))
}

/// A lazy, stoppable scan over a [`TimeEntry`]'s records. Stopping is
/// dropping the cursor; the read guard releases with it.
pub struct RecordCursor {
    entry: Arc<TimeEntry>,
    _op: ReadOperation,
    offset: u64,
    end: u64,
}

impl RecordCursor {
    /// Returns the next record, or `None` at the end of the snapshot.
    ///
    /// A malformed header or checksum mismatch surfaces as a `DataLoss`
    /// error; per the format there are no gaps between records, so the scan
    /// cannot continue past one.
    pub fn next(&mut self) -> Result<Option<Record>, Error> {
        let (header, data) = match read_record_at(&self.entry.file, self.offset, self.end) {
            Ok(None) => return Ok(None),
            Ok(Some(r)) => r,
            Err(ReadError::Codec(e)) => {
                return Err(err!(
                    DataLoss,
                    msg(
                        "corrupt record in {}/{} at offset {}",
                        self.entry.group,
                        self.entry.day_timestamp,
                        self.offset
                    ),
                    source(e)
                )
                .build());
            }
            Err(ReadError::Io(e)) => {
                return Err(err!(
                    e,
                    msg(
                        "unable to read {}/{} at offset {}",
                        self.entry.group,
                        self.entry.day_timestamp,
                        self.offset
                    )
                )
                .build());
            }
        };
        let offset = self.offset;
        self.offset += data.len() as u64;
        Ok(Some(Record {
            offset,
            header,
            data,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    fn entry_dir(tmp: &tempfile::TempDir) -> PathBuf {
        tmp.path().join("g").join("86400")
    }

    #[test]
    fn add_get_scan() {
        testutil::init();
        let tmp = tempfile::Builder::new().prefix("zangetsu-entry").tempdir().unwrap();
        let e = TimeEntry::create("g", 86_400, entry_dir(&tmp)).unwrap();
        let (o1, s1) = e.add(&[b"hello"], 86_401, false).unwrap();
        let (o2, s2) = e.add(&[b"world!"], 86_402, false).unwrap();
        assert_eq!(o1, 0);
        assert_eq!(s1, codec::record_size(5));
        assert_eq!(o2, s1);
        assert_eq!(e.written_size(), s1 + s2);
        assert_eq!(e.get(0).unwrap().payload(), b"hello");
        assert_eq!(e.get(o2).unwrap().payload(), b"world!");

        // Scan yields insertion order, then a single end.
        let mut c = e.cursor(0);
        assert_eq!(c.next().unwrap().unwrap().payload(), b"hello");
        let r = c.next().unwrap().unwrap();
        assert_eq!(r.payload(), b"world!");
        assert_eq!(r.header.timestamp, 86_402);
        assert!(c.next().unwrap().is_none());
        assert!(c.next().unwrap().is_none());
    }

    #[test]
    fn out_of_order_commits_keep_a_contiguous_frontier() {
        testutil::init();
        let tmp = tempfile::Builder::new().prefix("zangetsu-entry").tempdir().unwrap();
        let e = TimeEntry::create("g", 86_400, entry_dir(&tmp)).unwrap();
        let r1 = codec::encode(&[b"one"], 1, false);
        let r2 = codec::encode(&[b"two!"], 2, false);
        let a1 = e.begin_append(r1.len() as u64).unwrap();
        let a2 = e.begin_append(r2.len() as u64).unwrap();
        assert_eq!(e.data_file_size(), (r1.len() + r2.len()) as u64);
        assert_eq!(e.written_size(), 0);

        // The later reservation completing first publishes nothing.
        assert_eq!(a2.commit(&r2).unwrap().0, r1.len() as u64);
        assert_eq!(e.written_size(), 0);

        // Filling the gap publishes both at once, in reservation order.
        assert_eq!(a1.commit(&r1).unwrap().0, 0);
        assert_eq!(e.written_size(), (r1.len() + r2.len()) as u64);
        let mut c = e.cursor(0);
        assert_eq!(c.next().unwrap().unwrap().payload(), b"one");
        assert_eq!(c.next().unwrap().unwrap().payload(), b"two!");
        assert!(c.next().unwrap().is_none());
    }

    #[test]
    fn dropped_reservation_poisons_the_entry() {
        testutil::init();
        let tmp = tempfile::Builder::new().prefix("zangetsu-entry").tempdir().unwrap();
        let e = TimeEntry::create("g", 86_400, entry_dir(&tmp)).unwrap();
        drop(e.begin_append(10).unwrap());
        let err = e.add(&[b"hello"], 0, false).unwrap_err();
        assert_eq!(err.kind(), base::ErrorKind::FailedPrecondition);
    }

    #[test]
    fn get_past_end() {
        testutil::init();
        let tmp = tempfile::Builder::new().prefix("zangetsu-entry").tempdir().unwrap();
        let e = TimeEntry::create("g", 86_400, entry_dir(&tmp)).unwrap();
        e.add(&[b"hello"], 0, false).unwrap();
        let err = e.get(codec::record_size(5)).unwrap_err();
        assert_eq!(err.kind(), base::ErrorKind::NotFound);
    }

    #[test]
    fn misaligned_get_is_corruption() {
        testutil::init();
        let tmp = tempfile::Builder::new().prefix("zangetsu-entry").tempdir().unwrap();
        let e = TimeEntry::create("g", 86_400, entry_dir(&tmp)).unwrap();
        e.add(&[b"hello world"], 0, false).unwrap();
        let err = e.get(3).unwrap_err();
        assert_eq!(err.kind(), base::ErrorKind::DataLoss);
    }

    #[test]
    fn open_truncates_torn_tail() {
        testutil::init();
        let tmp = tempfile::Builder::new().prefix("zangetsu-entry").tempdir().unwrap();
        let dir = entry_dir(&tmp);
        let full_len;
        {
            let e = TimeEntry::create("g", 86_400, dir.clone()).unwrap();
            e.add(&[b"hello"], 1, false).unwrap();
            e.add(&[b"world"], 2, false).unwrap();
            full_len = e.written_size();
        }
        // Simulate a crash that tore the second record.
        let f = std::fs::OpenOptions::new()
            .write(true)
            .open(dir.join("data"))
            .unwrap();
        f.set_len(full_len - 3).unwrap();
        drop(f);

        let e = TimeEntry::open("g", 86_400, dir).unwrap();
        assert_eq!(e.written_size(), codec::record_size(5));
        assert_eq!(e.get(0).unwrap().payload(), b"hello");
    }

    #[test]
    fn closed_entry_rejects_add() {
        testutil::init();
        let tmp = tempfile::Builder::new().prefix("zangetsu-entry").tempdir().unwrap();
        let dir = entry_dir(&tmp);
        let e = TimeEntry::create("g", 86_400, dir.clone()).unwrap();
        e.mark_removed(Tomb::Entry(dir));
        let err = e.add(&[b"hello"], 0, false).unwrap_err();
        assert_eq!(err.kind(), base::ErrorKind::FailedPrecondition);
    }

    #[test]
    fn destruction_deferred_while_reading() {
        testutil::init();
        let tmp = tempfile::Builder::new().prefix("zangetsu-entry").tempdir().unwrap();
        let dir = entry_dir(&tmp);
        let e = TimeEntry::create("g", 86_400, dir.clone()).unwrap();
        e.add(&[b"hello"], 0, false).unwrap();

        let mut c = e.cursor(0);
        assert_eq!(e.read_operations(), 1);
        let hidden = crate::fs::hide(&dir).unwrap();
        e.mark_removed(Tomb::Entry(hidden.clone()));

        // The reader still works from its open descriptor.
        assert_eq!(c.next().unwrap().unwrap().payload(), b"hello");
        assert!(hidden.exists());
        drop(c);

        // Unlink happens in the background after the last reader drops.
        for _ in 0..100 {
            if !hidden.exists() {
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        panic!("hidden dir {} still exists", hidden.display());
    }
}
