// This file is part of Zangetsu, a replicated time-partitioned record store.
// Copyright (C) 2026 The Zangetsu Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! A named container of time entries, one directory per group.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use base::{bail, err, Error};
use tracing::warn;

use crate::entry::{TimeEntry, Tomb};
use crate::fs;

/// Checks the group-name charset: `[A-Za-z0-9_.-]`, non-empty, not starting
/// with `.`. This is also what keeps group names safe as path components.
pub fn validate_name(name: &str) -> Result<(), Error> {
    if name.is_empty() {
        bail!(InvalidArgument, msg("group name is empty"));
    }
    if name.starts_with('.') {
        bail!(InvalidArgument, msg("group name {name:?} starts with a dot"));
    }
    for c in name.chars() {
        if !(c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-') {
            bail!(
                InvalidArgument,
                msg("group name {name:?} has invalid character {c:?}")
            );
        }
    }
    Ok(())
}

/// Countdown for a removed group's hidden directory: unlinked once every
/// entry it contained has quiesced.
pub(crate) struct GroupTomb {
    path: PathBuf,
    remaining: AtomicUsize,
}

impl GroupTomb {
    pub(crate) fn entry_quiesced(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            fs::spawn_unlink(self.path.clone());
        }
    }
}

pub struct Group {
    name: String,
    path: PathBuf,
    entries: BTreeMap<u64, Arc<TimeEntry>>,
}

impl Group {
    pub(crate) fn create(name: &str, path: PathBuf) -> Result<Self, Error> {
        std::fs::create_dir(&path)
            .map_err(|e| err!(e, msg("unable to create group dir {}", path.display())))?;
        let parent = path.parent().expect("group dirs live under the db root");
        fs::sync_dir(parent).map_err(|e| err!(e, msg("unable to sync {}", parent.display())))?;
        Ok(Group {
            name: name.to_owned(),
            path,
            entries: BTreeMap::new(),
        })
    }

    /// Opens an existing group directory, loading every time entry within.
    /// Leftover hidden directories from interrupted removals are unlinked.
    pub(crate) fn open(name: &str, path: PathBuf) -> Result<Self, Error> {
        let mut entries = BTreeMap::new();
        let iter = std::fs::read_dir(&path)
            .map_err(|e| err!(e, msg("unable to read group dir {}", path.display())))?;
        for dent in iter {
            let dent = dent.map_err(|e| err!(e, msg("unable to read group dir {}", path.display())))?;
            let fname = dent.file_name();
            let Some(fname) = fname.to_str() else {
                warn!("skipping non-UTF-8 name in group {name}");
                continue;
            };
            if fname.starts_with(".hidden-") {
                fs::spawn_unlink(dent.path());
                continue;
            }
            let Ok(day_timestamp) = fname.parse::<u64>() else {
                warn!("skipping unexpected dir {fname:?} in group {name}");
                continue;
            };
            let entry = TimeEntry::open(name, day_timestamp, dent.path())?;
            entries.insert(day_timestamp, entry);
        }
        Ok(Group {
            name: name.to_owned(),
            path,
            entries,
        })
    }

    pub fn entries(&self) -> &BTreeMap<u64, Arc<TimeEntry>> {
        &self.entries
    }

    pub fn entry(&self, day_timestamp: u64) -> Option<&Arc<TimeEntry>> {
        self.entries.get(&day_timestamp)
    }

    pub(crate) fn get_or_create(&mut self, day_timestamp: u64) -> Result<Arc<TimeEntry>, Error> {
        if let Some(e) = self.entries.get(&day_timestamp) {
            return Ok(e.clone());
        }
        let dir = self.path.join(day_timestamp.to_string());
        let entry = TimeEntry::create(&self.name, day_timestamp, dir)?;
        self.entries.insert(day_timestamp, entry.clone());
        Ok(entry)
    }

    /// Destroys exactly one entry. Returns false if it doesn't exist.
    pub(crate) fn remove_one(&mut self, day_timestamp: u64) -> Result<bool, Error> {
        let Some(entry) = self.entries.remove(&day_timestamp) else {
            return Ok(false);
        };
        let dir = self.path.join(day_timestamp.to_string());
        let hidden =
            fs::hide(&dir).map_err(|e| err!(e, msg("unable to hide {}", dir.display())))?;
        entry.mark_removed(Tomb::Entry(hidden));
        Ok(true)
    }

    /// Destroys every entry with a day timestamp strictly less than the
    /// given one. Returns the timestamps removed.
    pub(crate) fn remove_before(&mut self, day_timestamp: u64) -> Result<Vec<u64>, Error> {
        let doomed: Vec<u64> = self
            .entries
            .range(..day_timestamp)
            .map(|(&k, _)| k)
            .collect();
        for &k in &doomed {
            self.remove_one(k)?;
        }
        Ok(doomed)
    }

    /// Destroys the whole group: one rename, one deferred recursive unlink.
    pub(crate) fn destroy(self) -> Result<(), Error> {
        let hidden = fs::hide(&self.path)
            .map_err(|e| err!(e, msg("unable to hide {}", self.path.display())))?;
        if self.entries.is_empty() {
            fs::spawn_unlink(hidden);
            return Ok(());
        }
        let tomb = Arc::new(GroupTomb {
            path: hidden,
            remaining: AtomicUsize::new(self.entries.len()),
        });
        for entry in self.entries.values() {
            entry.mark_removed(Tomb::Group(tomb.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    #[test]
    fn names() {
        validate_name("foo").unwrap();
        validate_name("Foo_bar-2.baz").unwrap();
        validate_name("").unwrap_err();
        validate_name(".foo").unwrap_err();
        validate_name("foo/bar").unwrap_err();
        validate_name("foo bar").unwrap_err();
        validate_name("föö").unwrap_err();
    }

    #[test]
    fn remove_before_is_strict() {
        testutil::init();
        let tmp = tempfile::Builder::new().prefix("zangetsu-group").tempdir().unwrap();
        let path = tmp.path().join("g");
        let mut g = Group::create("g", path).unwrap();
        for dst in [0, 86_400, 172_800] {
            g.get_or_create(dst).unwrap().add(&[b"x"], dst, false).unwrap();
        }
        let removed = g.remove_before(86_400).unwrap();
        assert_eq!(removed, &[0]);
        assert!(g.entry(86_400).is_some());
        assert!(g.entry(172_800).is_some());
    }

    #[test]
    fn name_reusable_after_remove_one() {
        testutil::init();
        let tmp = tempfile::Builder::new().prefix("zangetsu-group").tempdir().unwrap();
        let path = tmp.path().join("g");
        let mut g = Group::create("g", path).unwrap();
        g.get_or_create(86_400).unwrap().add(&[b"old"], 0, false).unwrap();
        assert!(g.remove_one(86_400).unwrap());
        assert!(!g.remove_one(86_400).unwrap());

        // The rename is synchronous, so the name is free immediately.
        let e = g.get_or_create(86_400).unwrap();
        assert_eq!(e.written_size(), 0);
    }

    #[test]
    fn open_skips_hidden_and_junk() {
        testutil::init();
        let tmp = tempfile::Builder::new().prefix("zangetsu-group").tempdir().unwrap();
        let path = tmp.path().join("g");
        {
            let mut g = Group::create("g", path.clone()).unwrap();
            g.get_or_create(86_400).unwrap().add(&[b"x"], 0, false).unwrap();
            g.remove_one(86_400).unwrap();
            g.get_or_create(172_800).unwrap().add(&[b"y"], 0, false).unwrap();
        }
        std::fs::create_dir(path.join("notaday")).unwrap();
        let g = Group::open("g", path).unwrap();
        assert_eq!(g.entries().keys().copied().collect::<Vec<_>>(), &[172_800]);
    }
}
