//! Firecracker machine configuration.
//!
//! The JSON document handed to Firecracker is a contract with the guest
//! init: drive order is significant (rootfs = vda, app = vdb, state = vdc)
//! and the boot arguments name the init binary inside the App rootfs.

use crate::constants::{DEFAULT_VCPUS, DEFAULT_VM_MEMORY_MIB, WALKIO_BASE};
use crate::error::Result;
use serde::Serialize;
use std::path::{Path, PathBuf};

pub use crate::constants::{BOOT_ARGS, SOCKET_WAIT_TIMEOUT};

/// Essential configuration for one microVM.
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// App this VM runs.
    pub app_id: String,
    /// Path to the published App disk.
    pub app_fs_path: PathBuf,
    /// Base bundle version selecting kernel, system rootfs, and VMM binary.
    pub base_version: String,
    /// Number of vCPUs; zero falls back to the default.
    pub vcpu: u32,
    /// Memory in MiB; zero falls back to the default.
    pub memory_mib: u32,
}

impl VmConfig {
    /// Pre-built read-only system rootfs for this base version.
    pub fn rootfs_path(&self) -> PathBuf {
        self.base_path().join("rootfs.ext4")
    }

    /// Kernel image for this base version.
    pub fn kernel_path(&self) -> PathBuf {
        self.base_path().join("vmlinux")
    }

    /// Firecracker binary for this base version.
    pub fn firecracker_path(&self) -> PathBuf {
        self.base_path().join("firecracker")
    }

    fn base_path(&self) -> PathBuf {
        Path::new(WALKIO_BASE).join("base").join(&self.base_version)
    }
}

/// The Firecracker `--config-file` document.
#[derive(Debug, Clone, Serialize)]
pub struct FirecrackerConfig {
    #[serde(rename = "boot-source")]
    pub boot_source: BootSource,
    #[serde(rename = "machine-config")]
    pub machine_config: MachineConfig,
    pub drives: Vec<Drive>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BootSource {
    pub kernel_image_path: String,
    pub boot_args: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MachineConfig {
    pub vcpu_count: u32,
    pub mem_size_mib: u32,
    pub smt: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Drive {
    pub drive_id: String,
    pub path_on_host: String,
    pub is_root_device: bool,
    pub is_read_only: bool,
}

/// Builds the Firecracker config for a VM and its State disk.
pub fn firecracker_config(config: &VmConfig, state_dev_path: &Path) -> FirecrackerConfig {
    let vcpu = if config.vcpu == 0 {
        DEFAULT_VCPUS
    } else {
        config.vcpu
    };
    let memory = if config.memory_mib == 0 {
        DEFAULT_VM_MEMORY_MIB
    } else {
        config.memory_mib
    };

    FirecrackerConfig {
        boot_source: BootSource {
            kernel_image_path: config.kernel_path().display().to_string(),
            boot_args: BOOT_ARGS.to_string(),
        },
        machine_config: MachineConfig {
            vcpu_count: vcpu,
            mem_size_mib: memory,
            smt: false,
        },
        drives: vec![
            // Drive order is the guest's device order: vda, vdb, vdc.
            Drive {
                drive_id: "rootfs".to_string(),
                path_on_host: config.rootfs_path().display().to_string(),
                is_root_device: true,
                is_read_only: true,
            },
            Drive {
                drive_id: "app".to_string(),
                path_on_host: config.app_fs_path.display().to_string(),
                is_root_device: false,
                is_read_only: true,
            },
            Drive {
                drive_id: "state".to_string(),
                path_on_host: state_dev_path.display().to_string(),
                is_root_device: false,
                is_read_only: false,
            },
        ],
    }
}

/// Serializes and writes the config document for `firecracker --config-file`.
pub fn write_firecracker_config(path: &Path, config: &FirecrackerConfig) -> Result<()> {
    let data = serde_json::to_vec(config).map_err(std::io::Error::other)?;
    std::fs::write(path, data)?;
    Ok(())
}
