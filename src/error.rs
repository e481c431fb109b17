//! Error types for the image-to-disk pipeline.
//!
//! Variants group into the kinds callers are expected to react to:
//! invalid input, network, corrupt image data, security violations during
//! extraction, host command failures, missing privileges, supersession,
//! and cooperative cancellation.

use std::path::PathBuf;
use std::time::Duration;

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building block devices from images.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Image Source Errors
    // =========================================================================
    /// Image reference failed validation or parsing.
    #[error("invalid image reference '{reference}': {reason}")]
    InvalidReference { reference: String, reason: String },

    /// Registry could not be reached or answered with a transport error.
    #[error("registry unreachable for '{reference}': {reason}")]
    RegistryUnreachable { reference: String, reason: String },

    /// The referenced image (or the host platform variant of it) does not exist.
    #[error("image unavailable for '{reference}': {reason}")]
    ImageUnavailable { reference: String, reason: String },

    /// Manifest or config blob could not be interpreted.
    #[error("manifest corrupt for '{reference}': {reason}")]
    ManifestCorrupt { reference: String, reason: String },

    /// Content digest failed validation.
    #[error("invalid digest '{digest}': {reason}")]
    InvalidDigest { digest: String, reason: String },

    /// Image, layer, or blob exceeds a configured size limit.
    #[error("image exceeds size limit: {size} > {limit} bytes")]
    ImageTooLarge { size: u64, limit: u64 },

    // =========================================================================
    // Layer Flattening Errors
    // =========================================================================
    /// Opening a layer's compressed stream failed.
    #[error("layer stream failed for {digest}: {reason}")]
    LayerStream { digest: String, reason: String },

    /// The gzip stream of a layer is malformed.
    #[error("gzip stream corrupt in layer {digest}: {reason}")]
    GzipCorrupt { digest: String, reason: String },

    /// The tar archive of a layer is malformed.
    #[error("tar archive corrupt in layer {digest}: {reason}")]
    TarCorrupt { digest: String, reason: String },

    /// A tar entry resolved to a path outside the rootfs.
    #[error("path escapes rootfs: {path}")]
    PathEscape { path: String },

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// Blob store directory could not be created.
    #[error("failed to initialize storage at {path}: {reason}")]
    StorageInit { path: PathBuf, reason: String },

    /// Blob not found in storage.
    #[error("blob not found: {digest}")]
    BlobNotFound { digest: String },

    /// Storage write failed.
    #[error("failed to write to storage: {0}")]
    StorageWrite(String),

    // =========================================================================
    // Block Device Errors
    // =========================================================================
    /// Bad build options (missing source dir, zero-size request, ...).
    #[error("invalid build options: {0}")]
    InvalidOptions(String),

    /// Device file could not be created or sized.
    #[error("failed to create device file {path}: {reason}")]
    OutputCreate { path: PathBuf, reason: String },

    /// The ext4 formatter exited non-zero.
    #[error("ext4 format failed: {0}")]
    FormatFailed(String),

    /// Loopback mount failed.
    #[error("mount failed: {0}")]
    MountFailed(String),

    /// Unmount failed; the device file may still be busy.
    #[error("unmount failed: {0}")]
    UnmountFailed(String),

    /// Copying the rootfs into the mounted device failed.
    #[error("copy to device failed: {0}")]
    CopyFailed(String),

    /// The operation needs capabilities this process does not have.
    #[error("operation requires elevated privileges: {0}")]
    InsufficientPrivilege(String),

    // =========================================================================
    // Publication Errors
    // =========================================================================
    /// A newer build of the same digest claimed the wanted slot; this build
    /// finished its work but lost the right to publish.
    #[error("superseded by a newer build of {digest}")]
    Superseded { digest: String },

    // =========================================================================
    // Resource Pool Errors
    // =========================================================================
    /// No free slot left in a resource pool.
    #[error("{resource} pool exhausted")]
    PoolExhausted { resource: &'static str },

    /// Release of a pooled resource was denied.
    #[error("cannot release {resource}: {reason}")]
    PoolRelease { resource: &'static str, reason: String },

    // =========================================================================
    // Cancellation / Timeout / I/O
    // =========================================================================
    /// Cooperative cancellation fired.
    #[error("operation cancelled")]
    Cancelled,

    /// Operation timed out.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True if this error means the build lost the publication race rather
    /// than failing its work. Callers typically report it as a warning with
    /// a distinct exit status.
    pub fn is_superseded(&self) -> bool {
        matches!(self, Error::Superseded { .. })
    }

    /// True if this error was caused by cooperative cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}
