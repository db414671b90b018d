// This file is part of Zangetsu, a replicated time-partitioned record store.
// Copyright (C) 2026 The Zangetsu Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

pub mod codec;
mod db;
mod entry;
mod fs;
mod group;
pub mod testutil;

pub use crate::db::{
    day_timestamp, AddOutcome, Database, Event, EventStream, Toc, TocEntry, WriteLockGuard,
    SECONDS_PER_DAY,
};
pub use crate::entry::{Appender, ReadOperation, Record, RecordCursor, TimeEntry};
pub use crate::group::validate_name;
