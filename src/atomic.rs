//! Atomic file writes.
//!
//! The wanted-marker protocol depends on a reader seeing either the old or
//! the new content of a marker file, never a partial write. The sequence is
//! temp file in the same directory, write, fsync, rename, fsync the
//! directory so the rename survives power loss.

use crate::error::Result;
use std::fs::{File, Permissions};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tempfile::NamedTempFile;

/// Atomically replaces `path` with `data`, created with `mode`.
///
/// Atomicity is only guaranteed when the temp file and the target share a
/// filesystem, which holds because the temp file is created in the target's
/// directory. The temp file is removed on any failure.
pub fn write_file_atomic(path: &Path, data: &[u8], mode: u32) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.as_file()
        .set_permissions(Permissions::from_mode(mode))?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;

    // fsync the directory so the rename itself is durable.
    File::open(dir)?.sync_all()?;
    Ok(())
}
