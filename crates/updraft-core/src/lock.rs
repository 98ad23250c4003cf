use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::UpdateError;

/// Exclusive per-unit lock held while an update is prepared or a backup is
/// restored. Released when dropped.
#[derive(Debug)]
pub struct UnitLock {
    _file: File,
    path: PathBuf,
}

impl UnitLock {
    /// Take the lock file `.{unit_id}.lock` in `dir` without waiting.
    ///
    /// # Errors
    /// Returns [`UpdateError::Busy`] when another process holds the lock, or
    /// [`UpdateError::Lock`] when the lock file cannot be opened.
    pub fn acquire(dir: &Path, unit_id: &str) -> Result<Self, UpdateError> {
        let path = dir.join(format!(".{unit_id}.lock"));
        let lock_error = |source| UpdateError::Lock {
            path: path.clone(),
            source,
        };

        std::fs::create_dir_all(dir).map_err(lock_error)?;
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(lock_error)?;

        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(error) if error.kind() == fs2::lock_contended_error().kind() => {
                return Err(UpdateError::Busy(unit_id.to_string()));
            }
            Err(error) => return Err(lock_error(error)),
        }

        file.set_len(0)
            .and_then(|()| file.seek(SeekFrom::Start(0)).map(|_| ()))
            .and_then(|()| writeln!(file, "{}", std::process::id()))
            .map_err(lock_error)?;

        Ok(Self { _file: file, path })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}
