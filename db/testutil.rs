// This file is part of Zangetsu, a replicated time-partitioned record store.
// Copyright (C) 2026 The Zangetsu Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Utilities for automated testing involving Zangetsu's persistence
//! library. Used for tests of both the `zangetsu_db` crate itself and the
//! `zangetsu` crate.

use std::sync::Arc;

use tempfile::TempDir;

use crate::db::Database;

static INIT: std::sync::Once = std::sync::Once::new();

/// Performs global initialization for tests: sets up logging.
/// (Note the output can be confusing unless `RUST_TEST_THREADS=1` is set in
/// the program's environment prior to running.)
pub fn init() {
    INIT.call_once(base::tracing_setup::install_for_tests);
}

pub struct TestDb {
    pub db: Arc<Database>,
    pub tmpdir: TempDir,
}

impl TestDb {
    /// Creates an empty store in a scratch directory.
    pub fn new() -> Self {
        let tmpdir = tempfile::Builder::new()
            .prefix("zangetsu-test")
            .tempdir()
            .unwrap();
        let db = Database::open(tmpdir.path()).unwrap();
        TestDb { db, tmpdir }
    }
}

impl Default for TestDb {
    fn default() -> Self {
        Self::new()
    }
}
