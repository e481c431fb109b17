//! # walkio
//!
//! **OCI Image to Firecracker Block Device Pipeline**
//!
//! This crate materializes an OCI container image into an ext4 block-device
//! file suitable to attach read-only to a Firecracker microVM, and
//! provisions empty writable State devices per VM instance.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                             walkio                                   │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────────────────────────────────────────────────────┐    │
//! │  │                     Builder (orchestrator)                   │    │
//! │  │  reference → Image → rootfs → ext4 → atomic publish          │    │
//! │  │  wanted-marker arbitration │ temp-name │ RAII cleanup        │    │
//! │  └──────────────────────────────┬───────────────────────────────┘    │
//! │                                 │                                    │
//! │  ┌──────────────┐  ┌────────────┴───┐  ┌───────────────────────┐     │
//! │  │ ImageSource  │  │  LayerFlattener │  │  BlockDeviceBuilder  │     │
//! │  │ Registry/Fake│  │  whiteouts      │  │  size/format/mount   │     │
//! │  │ + BlobStore  │  │  path safety    │  │  populate/unmount    │     │
//! │  └──────────────┘  └────────────────┘  └───────────────────────┘     │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  Collaborator contracts: Firecracker config JSON, IP/port pools      │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Publication Safety
//!
//! Concurrent builds of the same image digest never corrupt the published
//! artifact: every build claims a `<digest>.wanted` marker (atomic write),
//! assembles against a temp-named device in the output directory, and only
//! renames to `<digest>.ext4` if no newer build claimed the marker in the
//! meantime. The last-started build wins; losers abort with `Superseded`.
//!
//! # Key Security Properties
//!
//! - **Path containment**: every tar entry is lexically cleaned and must
//!   resolve inside the rootfs; host symlinks are never followed.
//! - **Digest verification**: layer bytes are hashed before entering the
//!   blob store, so flattening only reads verified content.
//! - **Bounded inputs**: reference length, layer count, layer size,
//!   manifest and config sizes, and total rootfs size are all limited.
//! - **Bounded network**: registry operations carry a timeout and honor the
//!   build's cancellation token.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use walkio::disk::{AppConfigWriter, BuildOptions, Builder, Ext4Builder, LayerFlattener};
//! use walkio::image::{BlobStore, RegistrySource};
//!
//! #[tokio::main]
//! async fn main() -> walkio::disk::Result<()> {
//!     let storage = Arc::new(BlobStore::new()?);
//!     let source = RegistrySource::new("nginx:latest", storage)?;
//!
//!     let builder = Builder::new(LayerFlattener::new(), AppConfigWriter::new(), Ext4Builder::new());
//!     let result = builder
//!         .build(&CancellationToken::new(), &source, &BuildOptions {
//!             output_dir: "/var/lib/walkio/app".into(),
//!             work_dir: std::env::temp_dir(),
//!         })
//!         .await?;
//!
//!     println!("published {}", result.block_device_path.display());
//!     Ok(())
//! }
//! ```

// =============================================================================
// Internal Modules
// =============================================================================

mod atomic;
mod blockdev;
mod builder;
mod constants;
mod digest;
mod error;
mod flatten;
mod guestfiles;
mod source;
mod statedisk;
mod storage;

// =============================================================================
// Facade Modules
// =============================================================================

/// Image facade - acquisition of OCI images.
///
/// Provides: `ImageSource`, `RegistrySource`, `FakeImageSource`, `Image`,
/// `ImageConfig`, `Layer`, `ImageDigest`, `BlobStore`, `Error`, `Result`
pub mod image;

/// Disk facade - the image-to-disk build pipeline.
///
/// Provides: `Builder`, `BuildOptions`, `BuildResult`, the capability traits
/// (`FsBuilder`, `ConfigWriter`, `BlockDeviceBuilder`) with their real and
/// no-op implementations, state-disk provisioning, and `write_file_atomic`.
pub mod disk;

/// Firecracker machine-config contract (kernel, boot args, drive order).
pub mod vmconfig;

/// Host resource pools for VM networking (collaborators of the pipeline).
pub mod netpool;
