//! Uniquely named temporary file that is deleted on release.

use std::fs::{self, OpenOptions};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use uuid::Uuid;

/// A private on-disk file owned by exactly one holder.
///
/// Deleted by [`release`](Self::release) or, failing that, on drop.
/// Deletion is best effort: errors are logged and never returned.
#[derive(Debug)]
pub struct ScopedTempFile {
    path: PathBuf,
    released: bool,
}

impl ScopedTempFile {
    /// Create an empty file named `<prefix>-<uuid>[.<extension>]` in `dir`.
    ///
    /// `dir` is created if missing.
    pub fn create(dir: &Path, prefix: &str, extension: Option<&str>) -> io::Result<Self> {
        fs::create_dir_all(dir)?;

        let mut name = format!("{}-{}", prefix, Uuid::new_v4().simple());
        if let Some(ext) = extension.filter(|e| !e.is_empty()) {
            name.push('.');
            name.push_str(ext);
        }
        let path = dir.join(name);

        OpenOptions::new().write(true).create_new(true).open(&path)?;

        Ok(Self {
            path,
            released: false,
        })
    }

    /// Create the file and copy all of `source` into it.
    ///
    /// `source` is consumed and closed. On a failed copy the partial file is
    /// removed before the error is returned.
    pub fn create_from(
        dir: &Path,
        prefix: &str,
        extension: Option<&str>,
        mut source: impl Read,
    ) -> io::Result<Self> {
        let file = Self::create(dir, prefix, extension)?;

        let mut dest = OpenOptions::new().write(true).truncate(true).open(&file.path)?;
        io::copy(&mut source, &mut dest)?;
        dest.sync_all()?;
        // Close the write handle now; exec on Linux fails with ETXTBSY while
        // one is open.
        drop(dest);

        Ok(file)
    }

    /// Location of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether `release` has run.
    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Set mode 0755 so the file can be executed.
    #[cfg(unix)]
    pub fn make_executable(&self) -> io::Result<()> {
        use std::os::unix::fs::PermissionsExt;

        fs::set_permissions(&self.path, fs::Permissions::from_mode(0o755))
    }

    #[cfg(not(unix))]
    pub fn make_executable(&self) -> io::Result<()> {
        Ok(())
    }

    /// Delete the file. Idempotent; failures are logged only.
    pub fn release(&mut self) {
        if let Err(e) = self.try_release() {
            tracing::warn!("Failed to delete temp file {}: {}", self.path.display(), e);
        }
    }

    /// Delete the file, reporting failure to the caller.
    ///
    /// A file that is already gone counts as deleted. After a failure the
    /// next call tries again.
    pub(crate) fn try_release(&mut self) -> io::Result<()> {
        if self.released {
            return Ok(());
        }

        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        self.released = true;
        tracing::trace!("Deleted temp file {}", self.path.display());
        Ok(())
    }
}

impl Drop for ScopedTempFile {
    fn drop(&mut self) {
        self.release();
    }
}
