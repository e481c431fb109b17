//! # App-Disk Build Orchestration
//!
//! Wires image fetching, layer flattening, guest metadata injection, and
//! block-device assembly into an end-to-end build with publication safety.
//!
//! ## Publication Protocol
//!
//! Concurrent builds of the same digest, even across processes, converge on
//! a single winner without in-process locks:
//!
//! 1. Atomically write `<digest>.wanted` containing this build's start
//!    timestamp, claiming the build as the intended one.
//! 2. Do all work against a per-attempt build directory and a temp device
//!    named `<digest>-<ts>.ext4` in the output directory (same filesystem
//!    as the final name, so the publish rename is atomic).
//! 3. Before publishing, re-read the wanted marker. A newer timestamp means
//!    another build claimed the slot while this one ran: abort with
//!    [`Error::Superseded`] and delete the temp device.
//! 4. Otherwise rename the temp device to `<digest>.ext4`.
//!
//! A reader that observes `<digest>.ext4` therefore always sees a complete
//! artifact for exactly that digest; a partially built file never bears the
//! final name.
//!
//! ## Cache Policy
//!
//! Builds are *inhibiting*: when `<digest>.ext4` already exists after image
//! resolution, the build returns `cached: true` without doing work. The
//! digest is content-addressed, so a rebuild could only reproduce the same
//! bytes.
//!
//! ## Cleanup
//!
//! The per-attempt build directory and the temp device are removed on every
//! exit path. The wanted marker is deliberately left behind; its timestamp
//! is monotonic and harmless.

use crate::atomic::write_file_atomic;
use crate::blockdev::{BlockDeviceBuilder, BlockDeviceOptions};
use crate::constants::BUILD_SUBDIR;
use crate::digest::ImageDigest;
use crate::error::{Error, Result};
use crate::flatten::FsBuilder;
use crate::guestfiles::ConfigWriter;
use crate::source::{ImageConfig, ImageSource};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Where a build places its outputs and scratch space.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Directory for the published `.ext4` files and wanted markers.
    pub output_dir: PathBuf,
    /// Scratch root; per-attempt directories are created underneath.
    pub work_dir: PathBuf,
}

/// The result of a successful App-disk build.
#[derive(Debug, Clone)]
pub struct BuildResult {
    /// Final published path (`<output_dir>/<hex>.ext4`).
    pub block_device_path: PathBuf,
    /// Digest of the source image.
    pub source_digest: ImageDigest,
    /// Runtime config from the image.
    pub image_config: ImageConfig,
    /// Wall-clock duration of this build call.
    pub build_time: Duration,
    /// True if an equivalent prior artifact was observed instead of building.
    pub cached: bool,
}

/// End-to-end App-disk builder.
///
/// Depends on the capability traits, not concretions, so tests can wire in
/// no-op implementations.
pub struct Builder<F, C, B> {
    fs_builder: F,
    config_writer: C,
    device_builder: B,
}

impl<F, C, B> Builder<F, C, B>
where
    F: FsBuilder,
    C: ConfigWriter,
    B: BlockDeviceBuilder,
{
    pub fn new(fs_builder: F, config_writer: C, device_builder: B) -> Self {
        Self {
            fs_builder,
            config_writer,
            device_builder,
        }
    }

    /// Builds and publishes the App disk for the source's image.
    pub async fn build<S: ImageSource>(
        &self,
        cancel: &CancellationToken,
        source: &S,
        opts: &BuildOptions,
    ) -> Result<BuildResult> {
        let started = Instant::now();
        let start_ts = unix_timestamp();

        info!("starting build for {}", source.info());
        fs::create_dir_all(&opts.output_dir)?;

        let image = source.get_image(cancel).await?;
        let digest_hex = image.digest.hex().to_string();
        info!(
            "image fetched: digest={} layers={}",
            digest_hex,
            image.layers.len()
        );

        let final_path = opts.output_dir.join(format!("{}.ext4", digest_hex));
        if final_path.exists() {
            debug!("artifact already published, skipping build");
            return Ok(BuildResult {
                block_device_path: final_path,
                source_digest: image.digest,
                image_config: image.config,
                build_time: started.elapsed(),
                cached: true,
            });
        }

        // Claim this build as the intended one for the digest.
        let wanted_path = opts.output_dir.join(format!("{}.wanted", digest_hex));
        write_file_atomic(&wanted_path, start_ts.to_string().as_bytes(), 0o644)?;

        let build_run = format!("{}-{}", digest_hex, start_ts);
        let build_dir = opts.work_dir.join(BUILD_SUBDIR).join(&build_run);
        debug!("creating build directory {}", build_dir.display());
        fs::create_dir_all(&build_dir)?;
        let _build_dir_cleanup = RemoveDirOnDrop(build_dir.clone());

        let rootfs_dir = build_dir.join("rootfs");
        fs::create_dir_all(&rootfs_dir)?;

        info!("flattening {} layers", image.layers.len());
        self.fs_builder.build_fs(cancel, &image.layers, &rootfs_dir)?;

        info!("injecting guest metadata into rootfs");
        self.config_writer.write_config(&rootfs_dir, &image.config)?;

        // The temp device lives in the output directory so the publish
        // rename stays on one filesystem.
        let temp_device_path = opts.output_dir.join(format!("{}.ext4", build_run));
        info!("creating block device {}", temp_device_path.display());
        let _temp_cleanup = RemoveFileOnDrop(temp_device_path.clone());

        let device = self
            .device_builder
            .new_device(
                cancel,
                BlockDeviceOptions {
                    source_dir: Some(rootfs_dir),
                    build_dir: Some(build_dir.clone()),
                    output_file_path: temp_device_path,
                    size_bytes: None,
                    label: None,
                },
            )
            .await?;

        // Publication guard: a newer build may have claimed the wanted slot
        // while this one ran.
        if !is_newest_build(&wanted_path, start_ts) {
            return Err(Error::Superseded {
                digest: image.digest.to_string(),
            });
        }

        fs::rename(&device.path, &final_path)?;

        info!(
            "build completed: path={} size_mb={} duration={:?}",
            final_path.display(),
            device.size_bytes / 1024 / 1024,
            started.elapsed()
        );

        Ok(BuildResult {
            block_device_path: final_path,
            source_digest: image.digest,
            image_config: image.config,
            build_time: started.elapsed(),
            cached: false,
        })
    }
}

/// True if no newer build has claimed the wanted slot since `timestamp`.
///
/// An unreadable or unparseable marker counts as "still newest": the marker
/// is advisory and must never block publication of real work.
fn is_newest_build(wanted_path: &Path, timestamp: i64) -> bool {
    let Ok(data) = fs::read_to_string(wanted_path) else {
        return true;
    };
    let Ok(wanted_ts) = data.trim().parse::<i64>() else {
        return true;
    };
    wanted_ts <= timestamp
}

fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

struct RemoveDirOnDrop(PathBuf);

impl Drop for RemoveDirOnDrop {
    fn drop(&mut self) {
        debug!("cleaning up build directory {}", self.0.display());
        if let Err(e) = fs::remove_dir_all(&self.0)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!("failed to clean up build directory {}: {}", self.0.display(), e);
        }
    }
}

struct RemoveFileOnDrop(PathBuf);

impl Drop for RemoveFileOnDrop {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.0)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!("failed to remove temp device {}: {}", self.0.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn newest_when_marker_missing() {
        let dir = TempDir::new().unwrap();
        assert!(is_newest_build(&dir.path().join("nope.wanted"), 100));
    }

    #[test]
    fn newest_when_marker_unparseable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x.wanted");
        fs::write(&path, "not a number").unwrap();
        assert!(is_newest_build(&path, 100));
    }

    #[test]
    fn newest_when_marker_is_own_or_older() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x.wanted");
        fs::write(&path, "100").unwrap();
        assert!(is_newest_build(&path, 100));
        assert!(is_newest_build(&path, 101));
    }

    #[test]
    fn superseded_when_marker_is_newer() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x.wanted");
        fs::write(&path, "200").unwrap();
        assert!(!is_newest_build(&path, 100));
    }
}
