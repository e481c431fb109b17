//! Constants for the image-to-disk pipeline.
//!
//! All limits, timeouts, and host paths are defined here to ensure
//! consistency and prevent magic numbers throughout the codebase.

use std::time::Duration;

// =============================================================================
// Host Filesystem Layout
// =============================================================================

/// Root of the walkio host directory tree.
pub const WALKIO_BASE: &str = "/var/lib/walkio/";

/// Default directory for published App disks (`<digest>.ext4`).
pub const DEFAULT_APP_DIR: &str = "/var/lib/walkio/app";

/// Default directory for per-instance State disks.
pub const DEFAULT_STATE_DIR: &str = "/var/lib/walkio/state";

/// Environment variable overriding the App disk output directory.
pub const OUT_DIR_ENV: &str = "WALKIO_OUT_DIR";

/// Subdirectory under the work dir holding per-attempt build directories.
pub const BUILD_SUBDIR: &str = "walkio/build";

/// Subdirectory for OCI blob storage.
pub const BLOB_STORE_DIR: &str = "blobs";

// =============================================================================
// Guest ABI
// =============================================================================

/// Directory inside the App disk holding the guest-init metadata files.
pub const GUEST_CONFIG_DIR: &str = "walkio";

/// Environment file consumed by the guest init (`/walkio/env`).
pub const GUEST_ENV_FILE: &str = "env";

/// Argument-vector file consumed by the guest init (`/walkio/argv`).
pub const GUEST_ARGV_FILE: &str = "argv";

/// Kernel boot arguments handed to Firecracker.
pub const BOOT_ARGS: &str = "console=ttyS0 reboot=k panic=1 init=/walkio/init";

// =============================================================================
// Device Sizing
// =============================================================================

/// Smallest device an ext4 filesystem with a journal will fit in (7 MiB).
pub const MIN_DEVICE_SIZE: u64 = 7 * 1024 * 1024;

/// Extra headroom applied on top of measured content size, in percent.
pub const SIZE_HEADROOM_PERCENT: u64 = 15;

/// Block granularity used when estimating on-disk content size.
pub const EXT4_BLOCK_SIZE: u64 = 4096;

/// Filesystem label applied to App disks when none is requested.
pub const DEFAULT_APP_LABEL: &str = "APP";

// =============================================================================
// Image Limits
// =============================================================================

/// Maximum OCI image reference length (bytes).
/// Prevents injection attacks via overly long image names.
pub const MAX_IMAGE_REF_LEN: usize = 512;

/// Maximum size of a single compressed layer (512 MiB).
/// Prevents disk exhaustion from malicious images.
pub const MAX_LAYER_SIZE: u64 = 512 * 1024 * 1024;

/// Maximum total flattened rootfs size (4 GiB).
pub const MAX_ROOTFS_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// Maximum number of layers in an OCI image.
pub const MAX_LAYERS: usize = 128;

/// Maximum manifest size (1 MiB).
pub const MAX_MANIFEST_SIZE: u64 = 1024 * 1024;

/// Maximum config blob size (1 MiB).
pub const MAX_CONFIG_SIZE: u64 = 1024 * 1024;

/// Valid characters for image references.
pub const IMAGE_REF_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_./:@";

// =============================================================================
// Timeouts
// =============================================================================

/// Timeout for registry network operations (manifest and blob fetches).
pub const IMAGE_PULL_TIMEOUT: Duration = Duration::from_secs(300);

/// How long collaborators wait for the Firecracker API socket to appear.
pub const SOCKET_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// VM Defaults
// =============================================================================

/// Default vCPUs for a microVM.
pub const DEFAULT_VCPUS: u32 = 1;

/// Default microVM memory (MiB).
pub const DEFAULT_VM_MEMORY_MIB: u32 = 128;

// =============================================================================
// Resource Pools
// =============================================================================

/// First host port handed out to VM port mappings.
pub const HOST_PORT_POOL_START: u16 = 40000;

/// Last host port handed out to VM port mappings.
pub const HOST_PORT_POOL_END: u16 = 50000;

// =============================================================================
// OCI Media Types
// =============================================================================

/// OCI layer media type (gzip compressed).
pub const OCI_LAYER_MEDIA_TYPE_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// Docker layer media type (gzip compressed).
pub const DOCKER_LAYER_MEDIA_TYPE_GZIP: &str =
    "application/vnd.docker.image.rootfs.diff.tar.gzip";
