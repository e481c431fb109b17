//! State-disk provisioning.
//!
//! Every VM instance gets an empty writable ext4 device, named after its
//! app and a fresh UUIDv7 so concurrent instances of the same app never
//! collide. No population, no metadata injection.

use crate::blockdev::{BlockDeviceBuilder, BlockDeviceOptions};
use crate::error::Result;
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// How to provision a State disk.
#[derive(Debug, Clone)]
pub struct StateDiskOptions {
    /// App this disk belongs to; becomes the filename prefix.
    pub app_id: String,
    /// Requested size; clamped up to the minimum viable ext4 size.
    pub size_bytes: u64,
    /// Directory the device file is created in.
    pub output_dir: PathBuf,
}

/// A provisioned State disk.
#[derive(Debug, Clone)]
pub struct StateDisk {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub build_time: Duration,
}

/// Allocates and formats an empty ext4 device at
/// `<output_dir>/<app_id>_<uuid>.ext4`.
pub async fn build_state_device<B: BlockDeviceBuilder>(
    cancel: &CancellationToken,
    device_builder: &B,
    opts: &StateDiskOptions,
) -> Result<StateDisk> {
    let started = Instant::now();

    fs::create_dir_all(&opts.output_dir)?;

    let instance_id = uuid::Uuid::now_v7();
    let device_path = opts
        .output_dir
        .join(format!("{}_{}.ext4", opts.app_id, instance_id));

    let device = device_builder
        .new_device(
            cancel,
            BlockDeviceOptions {
                source_dir: None,
                build_dir: None,
                output_file_path: device_path,
                size_bytes: Some(opts.size_bytes),
                label: None,
            },
        )
        .await?;

    info!(
        "state disk created: path={} size_mb={}",
        device.path.display(),
        device.size_bytes / 1024 / 1024
    );

    Ok(StateDisk {
        path: device.path,
        size_bytes: device.size_bytes,
        build_time: started.elapsed(),
    })
}
