//! Filesystem helpers for identity material

use crate::IdentityError;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Permission class of a persisted file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    /// Certificates: world readable
    Public,
    /// Private keys: owner only
    Private,
}

/// Resolve a configured path against the working directory when relative
pub fn resolve_path(path: impl AsRef<Path>) -> Result<PathBuf, IdentityError> {
    let path = path.as_ref();
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().map_err(IdentityError::WorkingDirectory)?;
    Ok(cwd.join(path))
}

/// Create a directory and its parents; succeeds if it already exists
pub fn ensure_dir(dir: &Path) -> Result<(), IdentityError> {
    std::fs::create_dir_all(dir).map_err(|e| IdentityError::io(dir, e))
}

/// Read a PEM file, returning `None` when it is absent or not valid text
pub fn read_optional(path: &Path) -> Result<Option<String>, IdentityError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) if e.kind() == ErrorKind::InvalidData => {
            warn!(path = %path.display(), "Ignoring unreadable identity file");
            Ok(None)
        }
        Err(e) => Err(IdentityError::io(path, e)),
    }
}

/// Read a PEM file that must exist
pub fn read_required(path: &Path) -> Result<String, IdentityError> {
    std::fs::read_to_string(path).map_err(|e| IdentityError::io(path, e))
}

/// Write `contents` to `path` so that readers see either the old file or the
/// complete new one, never a partial write
///
/// The data goes to a temporary file in the same directory, is synced and
/// checked to be non-empty, then renamed over the target.
pub fn write_atomic(path: &Path, contents: &[u8], mode: FileMode) -> Result<(), IdentityError> {
    if contents.is_empty() {
        return Err(IdentityError::EmptyWrite(path.to_path_buf()));
    }

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    ensure_dir(&dir)?;

    let mut tmp = NamedTempFile::new_in(&dir).map_err(|e| IdentityError::io(&dir, e))?;
    tmp.write_all(contents)
        .map_err(|e| IdentityError::io(tmp.path(), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| IdentityError::io(tmp.path(), e))?;

    let written = tmp
        .as_file()
        .metadata()
        .map_err(|e| IdentityError::io(tmp.path(), e))?
        .len();
    if written == 0 {
        return Err(IdentityError::EmptyWrite(path.to_path_buf()));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let bits = match mode {
            FileMode::Public => 0o644,
            FileMode::Private => 0o600,
        };
        std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(bits))
            .map_err(|e| IdentityError::io(tmp.path(), e))?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    tmp.persist(path)
        .map_err(|e| IdentityError::io(path, e.error))?;

    debug!(path = %path.display(), bytes = written, "Wrote identity file");
    Ok(())
}
