use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use thiserror::Error;

use crate::clock::Clock;

const ARCHIVE_EXTENSION: &str = "zip";
const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("install directory {0} does not exist")]
    MissingSource(PathBuf),
    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("{context}: {source}")]
    Zip {
        context: &'static str,
        #[source]
        source: zip::result::ZipError,
    },
    #[error("{0}")]
    Invalid(String),
}

impl BackupError {
    fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }

    fn zip(context: &'static str, source: zip::result::ZipError) -> Self {
        Self::Zip { context, source }
    }

    fn io_with_path(context: &'static str, path: &Path, source: &std::io::Error) -> Self {
        Self::io(
            context,
            std::io::Error::new(source.kind(), format!("{}: {source}", path.display())),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupInfo {
    pub path: PathBuf,
    pub size: u64,
    pub created: DateTime<Utc>,
}

/// Snapshots a unit's install directory into timestamped zip archives and
/// restores them.
///
/// Archives live in a subdirectory named after the unit, so units sharing a
/// backup root never see each other's backups. Old archives are never pruned.
#[derive(Clone)]
pub struct BackupManager {
    unit_id: String,
    version: String,
    source_dir: PathBuf,
    backup_dir: PathBuf,
    clock: Arc<dyn Clock>,
}

impl BackupManager {
    pub fn new(
        unit_id: &str,
        version: &str,
        source_dir: impl Into<PathBuf>,
        backup_root: impl AsRef<Path>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            unit_id: unit_id.to_string(),
            version: version.to_string(),
            source_dir: source_dir.into(),
            backup_dir: backup_root.as_ref().join(unit_id),
            clock,
        }
    }

    /// The unit's own directory under the backup root.
    #[must_use]
    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Archive the whole install directory, returning the archive path.
    ///
    /// Symlinks are stored as symlink entries. The archive is written under a
    /// temporary name and renamed into place once complete, so a failed
    /// backup never leaves a truncated `.zip`.
    ///
    /// # Errors
    /// Returns [`BackupError::MissingSource`] if the install directory is
    /// absent, [`BackupError::Invalid`] for entries a zip archive cannot
    /// represent faithfully (non UTF-8 names or link targets), or an I/O or
    /// zip error if the archive cannot be written.
    pub fn backup_current(&self) -> Result<PathBuf, BackupError> {
        if !self.source_dir.is_dir() {
            return Err(BackupError::MissingSource(self.source_dir.clone()));
        }
        std::fs::create_dir_all(&self.backup_dir).map_err(|error| {
            BackupError::io_with_path("failed to create backup directory", &self.backup_dir, &error)
        })?;

        let archive = self.next_archive_path();
        let partial = archive.with_extension(format!("{ARCHIVE_EXTENSION}.partial"));

        let entries = match self.write_archive(&partial) {
            Ok(entries) => entries,
            Err(error) => {
                let _ = std::fs::remove_file(&partial);
                return Err(error);
            }
        };
        std::fs::rename(&partial, &archive).map_err(|error| {
            let _ = std::fs::remove_file(&partial);
            BackupError::io_with_path("failed to finalize backup archive", &archive, &error)
        })?;

        info!(
            "[{}] backed up {entries} entries of {} to {}",
            self.unit_id,
            self.source_dir.display(),
            archive.display()
        );
        Ok(archive)
    }

    fn next_archive_path(&self) -> PathBuf {
        let stem = format!(
            "{}-{}-{}",
            self.unit_id,
            self.version,
            self.clock.now().format(TIMESTAMP_FORMAT)
        );
        let mut candidate = self.backup_dir.join(format!("{stem}.{ARCHIVE_EXTENSION}"));
        let mut suffix = 1;
        while candidate.exists() {
            candidate = self
                .backup_dir
                .join(format!("{stem}-{suffix}.{ARCHIVE_EXTENSION}"));
            suffix += 1;
        }
        candidate
    }

    fn write_archive(&self, dest: &Path) -> Result<usize, BackupError> {
        let file = std::fs::File::create(dest).map_err(|error| {
            BackupError::io_with_path("failed to create backup archive", dest, &error)
        })?;
        let mut writer = zip::ZipWriter::new(file);
        let mut entries = 0_usize;
        self.add_directory(&mut writer, &self.source_dir, "", &mut entries)?;
        let mut file = writer
            .finish()
            .map_err(|error| BackupError::zip("failed to finalize backup archive", error))?;
        file.flush()
            .map_err(|error| BackupError::io_with_path("failed to flush backup archive", dest, &error))?;
        file.sync_all()
            .map_err(|error| BackupError::io_with_path("failed to sync backup archive", dest, &error))?;
        Ok(entries)
    }

    fn add_directory(
        &self,
        writer: &mut zip::ZipWriter<std::fs::File>,
        dir: &Path,
        prefix: &str,
        entries: &mut usize,
    ) -> Result<(), BackupError> {
        let mut children = std::fs::read_dir(dir)
            .map_err(|error| BackupError::io_with_path("failed to read directory", dir, &error))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|error| BackupError::io_with_path("failed to read directory entry", dir, &error))?;
        children.sort_by_key(std::fs::DirEntry::file_name);

        for child in children {
            let path = child.path();
            if path.starts_with(&self.backup_dir) {
                continue;
            }
            let name = child.file_name().into_string().map_err(|_| {
                BackupError::Invalid(format!(
                    "cannot back up {}: file name is not valid UTF-8",
                    path.display()
                ))
            })?;
            let metadata = std::fs::symlink_metadata(&path).map_err(|error| {
                BackupError::io_with_path("failed to read file metadata", &path, &error)
            })?;
            let archive_name = format!("{prefix}{name}");

            if metadata.file_type().is_symlink() {
                let target = std::fs::read_link(&path).map_err(|error| {
                    BackupError::io_with_path("failed to read symlink", &path, &error)
                })?;
                let target = target.to_str().ok_or_else(|| {
                    BackupError::Invalid(format!(
                        "cannot back up {}: link target is not valid UTF-8",
                        path.display()
                    ))
                })?;
                writer
                    .add_symlink(archive_name, target, zip::write::SimpleFileOptions::default())
                    .map_err(|error| BackupError::zip("failed to add symlink to backup", error))?;
                *entries += 1;
            } else if metadata.is_dir() {
                writer
                    .add_directory(format!("{archive_name}/"), entry_options(&metadata))
                    .map_err(|error| BackupError::zip("failed to add directory to backup", error))?;
                self.add_directory(writer, &path, &format!("{archive_name}/"), entries)?;
            } else {
                writer
                    .start_file(archive_name, entry_options(&metadata))
                    .map_err(|error| BackupError::zip("failed to add file to backup", error))?;
                let mut source = std::fs::File::open(&path).map_err(|error| {
                    BackupError::io_with_path("failed to open file for backup", &path, &error)
                })?;
                std::io::copy(&mut source, writer).map_err(|error| {
                    BackupError::io_with_path("failed to write file to backup", &path, &error)
                })?;
                *entries += 1;
            }
        }
        Ok(())
    }

    /// Replace the install directory with the contents of `archive`.
    ///
    /// The archive is extracted next to the install directory first; the
    /// current install is only moved aside once extraction succeeded, and is
    /// moved back if the swap fails. Returns the number of files and symlinks
    /// restored.
    ///
    /// # Errors
    /// Returns an error if the archive cannot be read or the swap fails.
    pub fn restore(&self, archive: &Path) -> Result<usize, BackupError> {
        if !archive.is_file() {
            return Err(BackupError::Invalid(format!(
                "backup archive {} does not exist",
                archive.display()
            )));
        }
        let (parent, name) = match (self.source_dir.parent(), self.source_dir.file_name()) {
            (Some(parent), Some(name)) => (parent, name.to_string_lossy().into_owned()),
            _ => {
                return Err(BackupError::Invalid(format!(
                    "cannot restore into {}",
                    self.source_dir.display()
                )));
            }
        };

        let staging = parent.join(format!(".{name}.updraft-restore"));
        let aside = parent.join(format!(".{name}.updraft-old"));
        remove_dir_if_exists(&staging)?;
        remove_dir_if_exists(&aside)?;

        let restored = match extract_zip(archive, &staging) {
            Ok(restored) => restored,
            Err(error) => {
                let _ = std::fs::remove_dir_all(&staging);
                return Err(error);
            }
        };

        let had_install = self.source_dir.exists();
        if had_install {
            std::fs::rename(&self.source_dir, &aside).map_err(|error| {
                let _ = std::fs::remove_dir_all(&staging);
                BackupError::io_with_path(
                    "failed to move current install aside",
                    &self.source_dir,
                    &error,
                )
            })?;
        }

        if let Err(error) = std::fs::rename(&staging, &self.source_dir) {
            warn!("Restore failed, putting current install back: {error}");
            if had_install {
                let _ = std::fs::rename(&aside, &self.source_dir);
            }
            let _ = std::fs::remove_dir_all(&staging);
            return Err(BackupError::io_with_path(
                "failed to move restored files into place",
                &self.source_dir,
                &error,
            ));
        }

        if had_install && let Err(error) = std::fs::remove_dir_all(&aside) {
            warn!("Failed to remove previous install {}: {error}", aside.display());
        }

        info!(
            "[{}] restored {restored} entries from {}",
            self.unit_id,
            archive.display()
        );
        Ok(restored)
    }

    /// Backups of this unit, newest first.
    ///
    /// # Errors
    /// Returns an error if the backup directory exists but cannot be read.
    pub fn list(&self) -> Result<Vec<BackupInfo>, BackupError> {
        let entries = match std::fs::read_dir(&self.backup_dir) {
            Ok(entries) => entries,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => {
                return Err(BackupError::io_with_path(
                    "failed to read backup directory",
                    &self.backup_dir,
                    &error,
                ));
            }
        };

        let mut backups = Vec::new();
        for entry in entries {
            let entry = entry
                .map_err(|error| BackupError::io("failed to read backup directory entry", error))?;
            if !entry
                .file_name()
                .to_str()
                .is_some_and(|name| self.is_own_archive(name))
            {
                continue;
            }
            let metadata = entry.metadata().map_err(|error| {
                BackupError::io_with_path("failed to read backup metadata", &entry.path(), &error)
            })?;
            if !metadata.is_file() {
                continue;
            }
            let created = metadata
                .modified()
                .map_or_else(|_| self.clock.now(), DateTime::<Utc>::from);
            backups.push(BackupInfo {
                path: entry.path(),
                size: metadata.len(),
                created,
            });
        }

        backups.sort_by(|left, right| {
            right
                .created
                .cmp(&left.created)
                .then_with(|| right.path.cmp(&left.path))
        });
        Ok(backups)
    }

    /// `{unit}-{version}-{timestamp}[-n].zip` with a parseable timestamp.
    fn is_own_archive(&self, file_name: &str) -> bool {
        let Some(stem) = file_name
            .strip_prefix(self.unit_id.as_str())
            .and_then(|rest| rest.strip_prefix('-'))
            .and_then(|rest| rest.strip_suffix(&format!(".{ARCHIVE_EXTENSION}")))
        else {
            return false;
        };
        stem.split('-').any(|part| {
            chrono::NaiveDateTime::parse_from_str(part, TIMESTAMP_FORMAT).is_ok()
        })
    }
}

fn entry_options(metadata: &std::fs::Metadata) -> zip::write::SimpleFileOptions {
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        options.unix_permissions(metadata.permissions().mode())
    }
    #[cfg(not(unix))]
    {
        let _ = metadata;
        options
    }
}

fn remove_dir_if_exists(path: &Path) -> Result<(), BackupError> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(BackupError::io_with_path(
            "failed to remove stale directory",
            path,
            &error,
        )),
    }
}

#[cfg(unix)]
fn create_symlink(target: &str, link: &Path) -> Result<(), BackupError> {
    std::os::unix::fs::symlink(target, link)
        .map_err(|error| BackupError::io_with_path("failed to recreate symlink", link, &error))
}

#[cfg(not(unix))]
fn create_symlink(_target: &str, link: &Path) -> Result<(), BackupError> {
    Err(BackupError::Invalid(format!(
        "cannot recreate symlink {} on this platform",
        link.display()
    )))
}

/// Extract `zip_path` into `dest`, skipping entries that would escape it.
/// Symlinks are created after every regular file is written, so no write
/// ever goes through a link from the archive. Returns the number of files
/// and symlinks created.
pub(crate) fn extract_zip(zip_path: &Path, dest: &Path) -> Result<usize, BackupError> {
    let file = std::fs::File::open(zip_path).map_err(|error| {
        BackupError::io_with_path("failed to open zip file", zip_path, &error)
    })?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|error| BackupError::zip("failed to read zip archive", error))?;
    std::fs::create_dir_all(dest).map_err(|error| {
        BackupError::io_with_path("failed to create extraction directory", dest, &error)
    })?;

    let mut links = Vec::new();
    let mut created = 0;
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|error| BackupError::zip("failed to read zip entry", error))?;
        let Some(relative) = entry.enclosed_name() else {
            warn!("Skipping zip entry with unsafe path {}", entry.name());
            continue;
        };
        let out_path = dest.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path).map_err(|error| {
                BackupError::io_with_path("failed to create extraction directory", &out_path, &error)
            })?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent).map_err(|error| {
                BackupError::io_with_path("failed to create extraction directory", parent, &error)
            })?;
        }

        if entry.is_symlink() {
            let mut target = String::new();
            entry.read_to_string(&mut target).map_err(|error| {
                BackupError::io_with_path("failed to read symlink entry", &out_path, &error)
            })?;
            links.push((out_path, target));
            continue;
        }

        let mut outfile = std::fs::File::create(&out_path).map_err(|error| {
            BackupError::io_with_path("failed to create extracted file", &out_path, &error)
        })?;
        std::io::copy(&mut entry, &mut outfile).map_err(|error| {
            BackupError::io_with_path("failed to extract archive entry", &out_path, &error)
        })?;
        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            let _ = outfile.set_permissions(std::fs::Permissions::from_mode(mode & 0o7777));
        }
        created += 1;
    }

    for (link, target) in &links {
        create_symlink(target, link)?;
        created += 1;
    }

    debug!(
        "Extracted {created} entries ({} symlinks) to {}",
        links.len(),
        dest.display()
    );
    Ok(created)
}
