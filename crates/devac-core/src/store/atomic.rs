//! Temp-then-rename file replacement with directory fsync.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::errors::DevacResult;
use crate::store::paths::{is_temp_file, temp_path_for};

/// A table export written to a hidden temp file, waiting to replace its
/// target. Dropping an uncommitted `StagedFile` discards the temp file, so
/// the committed target is untouched on every failure path.
#[derive(Debug)]
pub struct StagedFile {
    temp: PathBuf,
    target: PathBuf,
    committed: bool,
}

impl StagedFile {
    pub fn new(target: &Path) -> Self {
        Self {
            temp: temp_path_for(target),
            target: target.to_path_buf(),
            committed: false,
        }
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Flush the temp file, rename it over the target and make the rename
    /// durable.
    pub fn commit(mut self) -> DevacResult<()> {
        File::open(&self.temp)?.sync_all()?;
        fs::rename(&self.temp, &self.target)?;
        self.committed = true;
        if let Some(parent) = self.target.parent() {
            fsync_dir(parent)?;
        }
        debug!(target = %self.target.display(), "committed staged file");
        Ok(())
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if !self.committed && self.temp.exists() {
            if let Err(e) = fs::remove_file(&self.temp) {
                warn!("Failed to discard staged file {}: {}", self.temp.display(), e);
            }
        }
    }
}

/// fsync a directory so renames and unlinks inside it survive a crash.
pub fn fsync_dir(dir: &Path) -> DevacResult<()> {
    #[cfg(unix)]
    {
        File::open(dir)?.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}

/// Remove a committed file and make the unlink durable. Missing files are
/// not an error.
pub fn remove_durably(path: &Path) -> DevacResult<bool> {
    match fs::remove_file(path) {
        Ok(()) => {
            if let Some(parent) = path.parent() {
                fsync_dir(parent)?;
            }
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Delete temp files a crashed writer left in `dir`. Callers must hold the
/// directory lock.
pub fn clean_temp_files(dir: &Path) -> DevacResult<usize> {
    if !dir.is_dir() {
        return Ok(0);
    }
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && is_temp_file(&path) {
            fs::remove_file(&path)?;
            removed += 1;
        }
    }
    if removed > 0 {
        debug!(dir = %dir.display(), removed, "removed stale temp files");
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_replaces_target() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nodes.db");
        fs::write(&target, b"old").unwrap();

        let staged = StagedFile::new(&target);
        fs::write(staged.temp_path(), b"new").unwrap();
        staged.commit().unwrap();

        assert_eq!(fs::read(&target).unwrap(), b"new");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn dropped_stage_leaves_target_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nodes.db");
        fs::write(&target, b"old").unwrap();

        {
            let staged = StagedFile::new(&target);
            fs::write(staged.temp_path(), b"half-written").unwrap();
        }

        assert_eq!(fs::read(&target).unwrap(), b"old");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn stale_temp_files_are_swept() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("edges.db");
        let leftover = temp_path_for(&target);
        fs::write(&leftover, b"junk").unwrap();
        fs::write(&target, b"keep").unwrap();

        assert_eq!(clean_temp_files(dir.path()).unwrap(), 1);
        assert!(target.exists());
        assert!(!leftover.exists());
    }
}
