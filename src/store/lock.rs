// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Crash-safe file replacement.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use log::{debug, warn};

/// A scoped write of a file.
///
/// Everything is written to a hidden temporary (`.<name>`) next to the target,
/// while a marker (`.<name>.lock`) says a write is in progress. [`commit`]
/// renames the temporary onto the target. If the guard is dropped without
/// being committed (an error or a panic), the marker is removed and the
/// temporary is either kept for inspection (`preserve`) or deleted. The target
/// therefore either doesn't exist or is complete.
///
/// [`commit`]: LockedFile::commit
#[derive(Debug)]
pub struct LockedFile {
    target: PathBuf,
    temp: PathBuf,
    lock: PathBuf,
    preserve: bool,
    committed: bool,
}

fn sibling(target: &Path, prefix: &str, suffix: &str) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!("{prefix}{name}{suffix}"))
}

impl LockedFile {
    /// Start a locked write of `target`. A temporary left over from an earlier
    /// crashed write is removed.
    pub fn acquire<P: Into<PathBuf>>(target: P, preserve: bool) -> io::Result<LockedFile> {
        let target = target.into();
        let temp = sibling(&target, ".", "");
        let lock = sibling(&target, ".", ".lock");

        if temp.exists() {
            warn!(
                "Removing {}, left over from an earlier unfinished write",
                temp.display()
            );
            fs::remove_file(&temp)?;
        }
        if lock.exists() {
            warn!("Removing stale lock {}", lock.display());
            fs::remove_file(&lock)?;
        }
        fs::File::create(&lock)?;

        Ok(LockedFile {
            target,
            temp,
            lock,
            preserve,
            committed: false,
        })
    }

    /// The path to write to.
    pub fn path(&self) -> &Path {
        &self.temp
    }

    /// The path that will exist once the write is committed.
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Move the temporary onto the target and release the lock.
    pub fn commit(mut self) -> io::Result<()> {
        fs::rename(&self.temp, &self.target)?;
        self.committed = true;
        fs::remove_file(&self.lock)?;
        debug!("Committed {}", self.target.display());
        Ok(())
    }
}

impl Drop for LockedFile {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        // Nothing useful can be done with errors here.
        let _ = fs::remove_file(&self.lock);
        if !self.temp.exists() {
            return;
        }
        if self.preserve {
            warn!(
                "Write of {} did not finish; keeping {} for inspection",
                self.target.display(),
                self.temp.display()
            );
        } else {
            let _ = fs::remove_file(&self.temp);
        }
    }
}
