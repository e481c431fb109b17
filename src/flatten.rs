//! # Layer Flattening
//!
//! Merges an ordered sequence of compressed tar layers into a single rootfs
//! directory, honoring OCI whiteout conventions. This is the security
//! boundary of the pipeline: a malicious image can attempt to escape the
//! rootfs through crafted entry names or link targets during extraction.
//!
//! ## Whiteout Conventions
//!
//! - `.wh.<name>` in directory `<D>` removes `<D>/<name>` from the
//!   accumulated state of all lower layers.
//! - `.wh..wh..opaque` in directory `<D>` removes everything inside `<D>`
//!   while keeping `<D>` itself.
//!
//! Whiteouts apply in tar order within a layer; across layers the already
//! applied state of lower layers is the substrate the current layer mutates.
//!
//! ## Path Containment
//!
//! Every entry name is cleaned lexically (collapsing `.`, `..`, and leading
//! separators) and must land inside the target directory. Host symlinks are
//! never resolved during that check. Violations abort the build with
//! [`Error::PathEscape`].
//!
//! ## Entry Application
//!
//! | Tar type | Action |
//! |----------|--------|
//! | Directory | created recursively with the header mode |
//! | Regular file | parents created 0755, content copied, header mode |
//! | Symlink | existing entry removed, link target taken verbatim |
//! | Hard link | linked within the rootfs, or degraded to an empty file if the target escapes |
//! | Char/block/FIFO | skipped (the guest init materializes device nodes) |
//! | Anything else | skipped |
//!
//! Ownership from headers is restored best-effort and ignored when the
//! process lacks the privilege.

use crate::constants::MAX_ROOTFS_SIZE;
use crate::error::{Error, Result};
use crate::source::Layer;
use flate2::read::GzDecoder;
use std::fs;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Component, Path, PathBuf};
use tar::{Archive, Entry};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Builds a rootfs tree from ordered layers.
pub trait FsBuilder {
    /// Extracts all layers into `target_dir`, applying whiteouts.
    fn build_fs(
        &self,
        cancel: &CancellationToken,
        layers: &[Layer],
        target_dir: &Path,
    ) -> Result<()>;
}

/// The real flattener: gzip, then tar, then per-entry application.
#[derive(Debug, Default)]
pub struct LayerFlattener;

impl LayerFlattener {
    pub fn new() -> Self {
        Self
    }

    fn extract_layer(
        &self,
        cancel: &CancellationToken,
        layer: &Layer,
        target_dir: &Path,
        total_size: &mut u64,
    ) -> Result<()> {
        let stream = layer.open_compressed(cancel)?;
        let mut reader = BufReader::new(stream);

        // Check the gzip magic up front so a corrupt blob is reported as
        // such instead of as a tar failure.
        let head = reader.fill_buf().map_err(|e| Error::LayerStream {
            digest: layer.digest().to_string(),
            reason: e.to_string(),
        })?;
        if head.len() < 2 || head[0] != 0x1f || head[1] != 0x8b {
            return Err(Error::GzipCorrupt {
                digest: layer.digest().to_string(),
                reason: "missing gzip magic".to_string(),
            });
        }

        let mut archive = Archive::new(GzDecoder::new(reader));

        let entries = archive
            .entries()
            .map_err(|e| classify_stream_error(layer, e))?;

        for entry in entries {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let mut entry = entry.map_err(|e| classify_stream_error(layer, e))?;
            let raw_path = entry
                .path()
                .map_err(|e| classify_stream_error(layer, e))?
                .into_owned();

            // SECURITY: Containment is decided on the lexically cleaned path
            // before anything touches the filesystem.
            let rel = clean_entry_path(&raw_path).ok_or_else(|| Error::PathEscape {
                path: raw_path.display().to_string(),
            })?;

            if let Some(name) = rel.file_name().and_then(|n| n.to_str())
                && name.starts_with(".wh.")
            {
                apply_whiteout(target_dir, &rel, name)?;
                continue;
            }

            *total_size += entry.size();
            if *total_size > MAX_ROOTFS_SIZE {
                return Err(Error::ImageTooLarge {
                    size: *total_size,
                    limit: MAX_ROOTFS_SIZE,
                });
            }

            apply_entry(&mut entry, target_dir, &rel)?;
        }

        Ok(())
    }
}

impl FsBuilder for LayerFlattener {
    fn build_fs(
        &self,
        cancel: &CancellationToken,
        layers: &[Layer],
        target_dir: &Path,
    ) -> Result<()> {
        fs::create_dir_all(target_dir)?;

        let mut total_size = 0u64;
        for (i, layer) in layers.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            debug!("extracting layer {} ({})", i, layer.digest());
            self.extract_layer(cancel, layer, target_dir, &mut total_size)?;
        }

        Ok(())
    }
}

/// No-op flattener for wiring tests.
#[derive(Debug, Default)]
pub struct NoOpFsBuilder;

impl NoOpFsBuilder {
    pub fn new() -> Self {
        Self
    }
}

impl FsBuilder for NoOpFsBuilder {
    fn build_fs(
        &self,
        _cancel: &CancellationToken,
        _layers: &[Layer],
        _target_dir: &Path,
    ) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Entry Application
// =============================================================================

fn apply_entry<R: Read>(entry: &mut Entry<'_, R>, target_dir: &Path, rel: &Path) -> io::Result<()> {
    let target_path = target_dir.join(rel);
    let header = entry.header();
    let entry_type = header.entry_type();
    let mode = header.mode().unwrap_or(0o644) & 0o7777;
    let uid = header.uid().ok().map(|v| v as u32);
    let gid = header.gid().ok().map(|v| v as u32);

    if entry_type.is_dir() {
        create_dir_with_mode(&target_path, mode)?;
        let _ = std::os::unix::fs::chown(&target_path, uid, gid);
    } else if entry_type.is_file() {
        if let Some(parent) = target_path.parent() {
            create_dir_with_mode(parent, 0o755)?;
        }
        let mut file = open_with_mode(&target_path, mode)?;
        io::copy(entry, &mut file)?;
        let _ = std::os::unix::fs::chown(&target_path, uid, gid);
    } else if entry_type.is_symlink() {
        let link = entry
            .link_name()?
            .ok_or_else(|| io::Error::other("symlink entry without link name"))?;
        remove_existing(&target_path)?;
        // Link targets are preserved verbatim; they only have meaning inside
        // the guest and must never be resolved against the host.
        std::os::unix::fs::symlink(&link, &target_path)?;
        let _ = std::os::unix::fs::lchown(&target_path, uid, gid);
    } else if entry_type.is_hard_link() {
        let link = entry
            .link_name()?
            .ok_or_else(|| io::Error::other("hard link entry without link name"))?;
        match clean_entry_path(&link) {
            Some(rel_link) => {
                fs::hard_link(target_dir.join(rel_link), &target_path)?;
            }
            None => {
                // The link target escapes the rootfs; keep the entry but
                // drop the content.
                if let Some(parent) = target_path.parent() {
                    create_dir_with_mode(parent, 0o755)?;
                }
                open_with_mode(&target_path, mode)?;
            }
        }
    }
    // Char, block, FIFO, and unknown types are skipped.

    Ok(())
}

fn create_dir_with_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new()
        .recursive(true)
        .mode(mode)
        .create(path)
}

fn open_with_mode(path: &Path, mode: u32) -> io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(mode)
        .open(path)
}

/// Removes whatever sits at `path` without following symlinks.
fn remove_existing(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

// =============================================================================
// Whiteouts
// =============================================================================

fn apply_whiteout(target_dir: &Path, rel: &Path, marker: &str) -> Result<()> {
    let dir = match rel.parent() {
        Some(parent) => target_dir.join(parent),
        None => target_dir.to_path_buf(),
    };

    let victim_name = marker.strip_prefix(".wh.").unwrap_or(marker);

    if victim_name == ".wh..opaque" {
        // Opaque whiteout: empty the directory but keep it.
        if dir.is_dir() {
            for child in fs::read_dir(&dir)? {
                remove_existing(&child?.path())?;
            }
        } else {
            fs::create_dir_all(&dir)?;
        }
        return Ok(());
    }

    remove_existing(&dir.join(victim_name))?;
    Ok(())
}

// =============================================================================
// Path Cleaning
// =============================================================================

/// Lexically cleans a tar entry path relative to the rootfs.
///
/// Leading separators are dropped (absolute entries apply relative to the
/// rootfs), `.` components are skipped, and `..` pops. Returns `None` when
/// a pop would climb above the rootfs. Host symlinks are never consulted.
fn clean_entry_path(path: &Path) -> Option<PathBuf> {
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir | Component::CurDir => {}
            Component::ParentDir => {
                if !cleaned.pop() {
                    return None;
                }
            }
            Component::Normal(part) => cleaned.push(part),
        }
    }
    Some(cleaned)
}

fn classify_stream_error(layer: &Layer, err: io::Error) -> Error {
    let reason = err.to_string();
    let lowered = reason.to_lowercase();
    if lowered.contains("gzip") || lowered.contains("deflate") {
        Error::GzipCorrupt {
            digest: layer.digest().to_string(),
            reason,
        }
    } else {
        Error::TarCorrupt {
            digest: layer.digest().to_string(),
            reason,
        }
    }
}
