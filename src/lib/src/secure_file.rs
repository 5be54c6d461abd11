//! File writes for key material and signed artifacts
//!
//! Two concerns live here:
//!
//! - Sensitive files (keystore seeds, identity records) are created with mode
//!   0600 on Unix before any byte is written, and reads warn when a file has
//!   drifted to a more permissive mode.
//! - Artifact writes (embedded assets, sidecars, caches) are atomic: data goes
//!   to a temporary sibling which is renamed over the destination only after
//!   it is fully flushed. An aborted write never leaves a half-written file
//!   behind, because the temporary file is removed when its guard drops.
//!
//! # Example
//!
//! ```no_run
//! use provsign::secure_file;
//! use std::path::Path;
//!
//! secure_file::write_secure(Path::new("/var/lib/provsign/keys/seed"), b"secret")?;
//! secure_file::write_atomic(Path::new("photo.jpg.c2pa"), b"{...}")?;
//! # Ok::<(), provsign::PSError>(())
//! ```

use crate::error::PSError;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// The restrictive permission mode for sensitive files (owner read/write only)
#[cfg(unix)]
pub const SECURE_FILE_MODE: u32 = 0o600;

/// Check if file permissions are secure (Unix only)
///
/// Logs a warning when group or others have any access; never fails on
/// permissions alone.
#[cfg(unix)]
pub fn check_permissions(path: &Path) -> Result<(), PSError> {
    use std::os::unix::fs::PermissionsExt;

    let mode = fs::metadata(path)?.permissions().mode();
    let perm_bits = mode & 0o777;

    if perm_bits & 0o077 != 0 {
        log::warn!(
            "SECURITY WARNING: File '{}' has overly permissive permissions (mode {:o}). \
             Sensitive files should have mode 0600. Consider running: chmod 600 '{}'",
            path.display(),
            perm_bits,
            path.display()
        );
    }

    Ok(())
}

#[cfg(not(unix))]
pub fn check_permissions(path: &Path) -> Result<(), PSError> {
    log::debug!(
        "Permission check skipped for '{}': not supported on this platform",
        path.display()
    );
    Ok(())
}

/// Create a file with secure permissions from the start (Unix only)
#[cfg(unix)]
pub fn create_secure_file(path: &Path) -> Result<File, PSError> {
    use std::os::unix::fs::OpenOptionsExt;

    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(SECURE_FILE_MODE)
        .open(path)?;

    Ok(file)
}

#[cfg(not(unix))]
pub fn create_secure_file(path: &Path) -> Result<File, PSError> {
    log::warn!(
        "Creating file '{}' without restrictive permissions: not supported on this platform",
        path.display()
    );

    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;

    Ok(file)
}

/// Write sensitive data atomically with owner-only permissions.
pub fn write_secure(path: &Path, data: &[u8]) -> Result<(), PSError> {
    let guard = TempFileGuard::new_for(path)?;
    {
        let mut file = create_secure_file(guard.path())?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    guard.commit()
}

/// Read a sensitive file, warning if its permissions are too open.
pub fn read_secure(path: &Path) -> Result<Vec<u8>, PSError> {
    check_permissions(path)?;

    let mut file = File::open(path)?;
    let mut contents = Vec::new();
    file.read_to_end(&mut contents)?;

    Ok(contents)
}

/// Write an artifact atomically (temporary sibling, then rename).
///
/// Missing parent directories are created.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<(), PSError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let guard = TempFileGuard::new_for(path)?;
    {
        let mut file = File::create(guard.path())?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    guard.commit()
}

/// Temporary sibling of a destination file.
///
/// The temporary file is deleted on drop unless [`commit`](Self::commit)
/// renamed it over the destination.
#[derive(Debug)]
pub struct TempFileGuard {
    temp_path: PathBuf,
    destination: PathBuf,
    committed: bool,
}

impl TempFileGuard {
    /// Reserve a temporary path next to `destination`.
    pub fn new_for(destination: &Path) -> Result<Self, PSError> {
        let file_name = destination
            .file_name()
            .ok_or(PSError::UsageError("Destination has no file name"))?
            .to_string_lossy()
            .into_owned();
        let temp_name = format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4().simple());
        let temp_path = match destination.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.join(temp_name),
            _ => PathBuf::from(temp_name),
        };
        Ok(Self {
            temp_path,
            destination: destination.to_path_buf(),
            committed: false,
        })
    }

    /// Path of the temporary file
    pub fn path(&self) -> &Path {
        &self.temp_path
    }

    /// Final destination
    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Rename the temporary file over the destination.
    pub fn commit(mut self) -> Result<(), PSError> {
        fs::rename(&self.temp_path, &self.destination)?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if !self.committed && self.temp_path.exists() {
            if let Err(e) = fs::remove_file(&self.temp_path) {
                log::warn!(
                    "Failed to remove temporary file '{}': {}",
                    self.temp_path.display(),
                    e
                );
            }
        }
    }
}
