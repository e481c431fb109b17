//! # Disk Facade - Image-to-Disk Pipeline
//!
//! The public surface for building block devices: the orchestrator, the
//! three capability traits it depends on, and the state-disk variant.
//!
//! | Capability | Real | No-op |
//! |------------|------|-------|
//! | Layer flattening | [`LayerFlattener`] | [`NoOpFsBuilder`] |
//! | Guest metadata | [`AppConfigWriter`] | [`NoOpConfigWriter`] |
//! | Device assembly | [`Ext4Builder`] | [`NoOpBlockDeviceBuilder`] |
//!
//! The orchestrator depends on the traits, not the concretions, so any
//! combination can be wired for tests.

// Error types
pub use crate::error::{Error, Result};

// Orchestration
pub use crate::builder::{BuildOptions, BuildResult, Builder};

// Layer flattening
pub use crate::flatten::{FsBuilder, LayerFlattener, NoOpFsBuilder};

// Guest metadata injection
pub use crate::guestfiles::{AppConfigWriter, ConfigWriter, NoOpConfigWriter};

// Block-device assembly
pub use crate::blockdev::{
    BlockDevice, BlockDeviceBuilder, BlockDeviceOptions, Ext4Builder, NoOpBlockDeviceBuilder,
    disk_usage,
};

// State disks
pub use crate::statedisk::{StateDisk, StateDiskOptions, build_state_device};

// Atomic writes (the wanted-marker primitive)
pub use crate::atomic::write_file_atomic;

// Layout and sizing constants callers may want to reference
pub use crate::constants::{
    BUILD_SUBDIR, DEFAULT_APP_DIR, DEFAULT_APP_LABEL, DEFAULT_STATE_DIR, EXT4_BLOCK_SIZE,
    MIN_DEVICE_SIZE, OUT_DIR_ENV, SIZE_HEADROOM_PERCENT,
};
