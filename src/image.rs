//! # Image Facade - OCI Image Acquisition
//!
//! The public surface for resolving an image reference into a concrete
//! [`Image`]: digest, runtime config, and ordered layer handles.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     Image Facade                        │
//! │                                                         │
//! │  RegistrySource ── get_image() ──► Image                │
//! │  FakeImageSource ─ get_image() ──► Image                │
//! ├─────────────────────────────────────────────────────────┤
//! │                       Internal                          │
//! │  ┌─────────────────┐   ┌─────────────────┐              │
//! │  │ oci-distribution│   │    BlobStore    │              │
//! │  │ (registry proto)│   │  (layer cache)  │              │
//! │  └─────────────────┘   └─────────────────┘              │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use walkio::image::{BlobStore, ImageSource, RegistrySource};
//!
//! let storage = Arc::new(BlobStore::new()?);
//! let source = RegistrySource::new("nginx:latest", storage)?;
//! let image = source.get_image(&CancellationToken::new()).await?;
//! println!("{} has {} layers", image.digest, image.layers.len());
//! ```

// Error types
pub use crate::error::{Error, Result};

// Digest handling (cache keys and artifact names)
pub use crate::digest::ImageDigest;

// Image data model and sources
pub use crate::source::{
    FakeImageSource, Image, ImageConfig, ImageSource, Layer, RegistrySource, normalize_reference,
};

// Layer blob storage
pub use crate::storage::BlobStore;

// Limits and media types callers may want to reference
pub use crate::constants::{
    DOCKER_LAYER_MEDIA_TYPE_GZIP, IMAGE_PULL_TIMEOUT, IMAGE_REF_VALID_CHARS, MAX_CONFIG_SIZE,
    MAX_IMAGE_REF_LEN, MAX_LAYER_SIZE, MAX_LAYERS, MAX_MANIFEST_SIZE, MAX_ROOTFS_SIZE,
    OCI_LAYER_MEDIA_TYPE_GZIP,
};
