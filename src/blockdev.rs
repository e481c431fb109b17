//! # Block-Device Assembly
//!
//! Turns a prepared directory into an ext4 file suitable to attach to a
//! Firecracker microVM: size, sparse-allocate, format, loop-mount, copy,
//! unmount. Formatting and mounting shell out to the host's `mkfs.ext4`,
//! `mount`, `umount`, and `cp -a`; the external contract is only that the
//! produced file is a valid ext4 image.
//!
//! ## Sizing
//!
//! An explicit size request is clamped to the minimum a journaled ext4 fits
//! in (7 MiB). Without a request, the apparent size of all regular files in
//! the source directory is measured (rounded to 4 KiB blocks, the same
//! arithmetic as `du -sb` on a 4 KiB filesystem), then 15% headroom is
//! added before clamping.
//!
//! ## Privileges
//!
//! Loopback mounting and ownership preservation need elevated privileges.
//! The builder does not try to work around that: a mount rejected for
//! permission reasons surfaces as [`Error::InsufficientPrivilege`].

use crate::constants::{
    DEFAULT_APP_LABEL, EXT4_BLOCK_SIZE, MIN_DEVICE_SIZE, SIZE_HEADROOM_PERCENT,
};
use crate::error::{Error, Result};
use std::fs;
use std::future::Future;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How to create a block device.
#[derive(Debug, Clone, Default)]
pub struct BlockDeviceOptions {
    /// Prepared rootfs directory to copy in. `None` produces an empty device.
    pub source_dir: Option<PathBuf>,
    /// Build directory used for the transient mount point. Required when
    /// `source_dir` is set.
    pub build_dir: Option<PathBuf>,
    /// Path of the device file to create, including the filename.
    pub output_file_path: PathBuf,
    /// Requested device size; measured from `source_dir` when absent.
    pub size_bytes: Option<u64>,
    /// Filesystem label. Populated devices default to `"APP"`; empty devices
    /// stay unlabeled.
    pub label: Option<String>,
}

/// A created block device.
#[derive(Debug, Clone)]
pub struct BlockDevice {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub label: Option<String>,
}

/// Creates ext4 block-device files.
pub trait BlockDeviceBuilder {
    /// Creates an ext4 image sized for the content and, when a source
    /// directory is given, populated with it.
    fn new_device(
        &self,
        cancel: &CancellationToken,
        opts: BlockDeviceOptions,
    ) -> impl Future<Output = Result<BlockDevice>> + Send;
}

/// The real builder, shelling out for filesystem operations.
#[derive(Debug, Default)]
pub struct Ext4Builder;

impl Ext4Builder {
    pub fn new() -> Self {
        Self
    }

    async fn format(&self, path: &Path, label: Option<&str>) -> Result<()> {
        let mut cmd = Command::new("mkfs.ext4");
        cmd.arg("-F");
        if let Some(label) = label {
            cmd.args(["-L", label]);
        }
        cmd.arg(path);

        let output = cmd
            .output()
            .await
            .map_err(|e| Error::FormatFailed(format!("spawn mkfs.ext4: {}", e)))?;
        if !output.status.success() {
            return Err(Error::FormatFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }

    async fn mount(&self, device: &Path, mount_point: &Path) -> Result<()> {
        let output = Command::new("mount")
            .args(["-t", "ext4", "-o", "loop"])
            .arg(device)
            .arg(mount_point)
            .output()
            .await
            .map_err(|e| Error::MountFailed(format!("spawn mount: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let lowered = stderr.to_lowercase();
            if lowered.contains("permission denied")
                || lowered.contains("only root")
                || lowered.contains("must be superuser")
                || lowered.contains("operation not permitted")
            {
                return Err(Error::InsufficientPrivilege(format!(
                    "loop mount of {}: {}",
                    device.display(),
                    stderr
                )));
            }
            return Err(Error::MountFailed(stderr));
        }
        Ok(())
    }

    async fn unmount(&self, mount_point: &Path) -> Result<()> {
        let output = Command::new("umount")
            .arg(mount_point)
            .output()
            .await
            .map_err(|e| Error::UnmountFailed(format!("spawn umount: {}", e)))?;
        if !output.status.success() {
            return Err(Error::UnmountFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }

    /// Copies the source tree into the mount point, preserving modes,
    /// owners, symlinks, and hard links.
    async fn copy_tree(&self, source: &Path, mount_point: &Path) -> Result<()> {
        let output = Command::new("cp")
            .args(["-a", "--"])
            .arg(format!("{}/.", source.display()))
            .arg(format!("{}/.", mount_point.display()))
            .output()
            .await
            .map_err(|e| Error::CopyFailed(format!("spawn cp: {}", e)))?;
        if !output.status.success() {
            return Err(Error::CopyFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }
}

impl BlockDeviceBuilder for Ext4Builder {
    async fn new_device(
        &self,
        cancel: &CancellationToken,
        opts: BlockDeviceOptions,
    ) -> Result<BlockDevice> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let size = resolve_size(&opts)?;
        create_sparse_file(&opts.output_file_path, size)?;

        let label = match (&opts.label, &opts.source_dir) {
            (Some(label), _) => Some(label.clone()),
            (None, Some(_)) => Some(DEFAULT_APP_LABEL.to_string()),
            (None, None) => None,
        };

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.format(&opts.output_file_path, label.as_deref()).await?;

        if let Some(source_dir) = &opts.source_dir {
            let build_dir = opts.build_dir.as_ref().ok_or_else(|| {
                Error::InvalidOptions("build_dir is required when populating a device".to_string())
            })?;

            let mount_point = build_dir.join("mnt");
            fs::create_dir_all(&mount_point)?;

            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            self.mount(&opts.output_file_path, &mount_point).await?;

            // The device stays mounted from here on; unmount on every path.
            let populate = async {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                self.copy_tree(source_dir, &mount_point).await
            }
            .await;

            let unmount = self.unmount(&mount_point).await;
            if let Err(e) = &unmount {
                warn!("unmount of {} failed: {}", mount_point.display(), e);
            }
            populate?;
            unmount?;
        }

        debug!(
            "created block device {} ({} bytes)",
            opts.output_file_path.display(),
            size
        );

        Ok(BlockDevice {
            path: opts.output_file_path,
            size_bytes: size,
            label,
        })
    }
}

/// Builder that allocates the device file but skips formatting and
/// population; for wiring tests on hosts without mkfs or mount privileges.
#[derive(Debug, Default)]
pub struct NoOpBlockDeviceBuilder;

impl NoOpBlockDeviceBuilder {
    pub fn new() -> Self {
        Self
    }
}

impl BlockDeviceBuilder for NoOpBlockDeviceBuilder {
    async fn new_device(
        &self,
        cancel: &CancellationToken,
        opts: BlockDeviceOptions,
    ) -> Result<BlockDevice> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let size = resolve_size(&opts)?;
        create_sparse_file(&opts.output_file_path, size)?;
        Ok(BlockDevice {
            path: opts.output_file_path,
            size_bytes: size,
            label: opts.label,
        })
    }
}

// =============================================================================
// Sizing
// =============================================================================

fn resolve_size(opts: &BlockDeviceOptions) -> Result<u64> {
    let size = match opts.size_bytes {
        Some(size) => size,
        None => {
            let source = opts.source_dir.as_ref().ok_or_else(|| {
                Error::InvalidOptions(
                    "either size_bytes or source_dir must be given".to_string(),
                )
            })?;
            disk_usage(source)? * (100 + SIZE_HEADROOM_PERCENT) / 100
        }
    };
    Ok(size.max(MIN_DEVICE_SIZE))
}

/// Apparent size of all regular files under `dir`, each rounded up to block
/// granularity. Mirrors `du -sb` on a 4 KiB-block filesystem.
pub fn disk_usage(dir: &Path) -> Result<u64> {
    let mut total = 0u64;
    for entry in walkdir::WalkDir::new(dir) {
        let entry = entry.map_err(|e| Error::Io(e.into()))?;
        if entry.file_type().is_file() {
            let len = entry.metadata().map_err(|e| Error::Io(e.into()))?.len();
            total += len.div_ceil(EXT4_BLOCK_SIZE) * EXT4_BLOCK_SIZE;
        }
    }
    Ok(total)
}

/// Creates a file of the given logical size occupying almost no physical
/// blocks: seek to the last byte and write a single zero.
fn create_sparse_file(path: &Path, size_bytes: u64) -> Result<()> {
    let mut file = fs::File::create(path).map_err(|e| Error::OutputCreate {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    file.seek(SeekFrom::Start(size_bytes - 1))
        .and_then(|_| file.write_all(&[0]))
        .map_err(|e| Error::OutputCreate {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}
