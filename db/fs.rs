// This file is part of Zangetsu, a replicated time-partitioned record store.
// Copyright (C) 2026 The Zangetsu Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Filesystem helpers for the two-phase removal scheme.

use std::path::{Path, PathBuf};

use tracing::warn;
use uuid::Uuid;

/// `fsync`s the given directory, committing renames and creations within it
/// to permanent storage.
pub(crate) fn sync_dir(path: &Path) -> Result<(), std::io::Error> {
    std::fs::File::open(path)?.sync_all()
}

/// First phase of removal: synchronously renames `path` to a hidden sibling
/// name, freeing the original name for immediate reuse. Returns the hidden
/// path, to be passed to [`spawn_unlink`] once all readers have finished.
pub(crate) fn hide(path: &Path) -> Result<PathBuf, std::io::Error> {
    let parent = path.parent().expect("removal targets are never the fs root");
    let hidden = parent.join(format!(".hidden-{}", Uuid::now_v7()));
    std::fs::rename(path, &hidden)?;
    sync_dir(parent)?;
    Ok(hidden)
}

/// Second phase of removal: recursively unlinks a hidden directory in the
/// background. Open file descriptors within it remain readable.
pub(crate) fn spawn_unlink(path: PathBuf) {
    let spawned = std::thread::Builder::new()
        .name("unlink".to_owned())
        .spawn(move || {
            if let Err(err) = std::fs::remove_dir_all(&path) {
                warn!(%err, "unable to unlink {}", path.display());
            }
        });
    if let Err(err) = spawned {
        warn!(%err, "unable to spawn unlink thread");
    }
}
