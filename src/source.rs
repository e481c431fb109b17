//! # Image Source - OCI Registry Resolution
//!
//! Resolves an image reference to a concrete [`Image`]: its manifest digest,
//! runtime config, and ordered layer handles. Two implementations exist:
//!
//! - [`RegistrySource`] talks to a real OCI registry.
//! - [`FakeImageSource`] serves a pre-assembled image for tests and wiring.
//!
//! ## Reference Normalization
//!
//! Short references are expanded before parsing:
//!
//! | Input | Normalized |
//! |-------|-----------|
//! | `nginx` | `docker.io/library/nginx` |
//! | `nginx:1.25` | `docker.io/library/nginx:1.25` |
//! | `user/app:tag` | `docker.io/user/app:tag` |
//! | `ghcr.io/owner/repo:tag` | unchanged (first component has `.` or `:`) |
//!
//! ## Platform Resolution
//!
//! Only `linux/<host-arch>` is fetched. If the reference points at a manifest
//! list without a matching entry, the pull fails with
//! [`Error::ImageUnavailable`] listing the available platforms. Cross-arch
//! builds are intentionally unsupported.
//!
//! ## Security Model
//!
//! - Reference length bounded by [`MAX_IMAGE_REF_LEN`] with a character
//!   allowlist, preventing injection via crafted references.
//! - Manifest, config, and layer descriptor sizes validated before fetching.
//! - Layer count bounded by [`MAX_LAYERS`].
//! - Every network operation is bounded by [`IMAGE_PULL_TIMEOUT`] and
//!   cancellable through the build's [`CancellationToken`].
//! - Layer bytes are verified against their digest on the way into the
//!   [`BlobStore`], so later flattening only ever reads verified content.
//!
//! [`MAX_IMAGE_REF_LEN`]: crate::constants::MAX_IMAGE_REF_LEN
//! [`MAX_LAYERS`]: crate::constants::MAX_LAYERS
//! [`IMAGE_PULL_TIMEOUT`]: crate::constants::IMAGE_PULL_TIMEOUT

use crate::constants::{
    DOCKER_LAYER_MEDIA_TYPE_GZIP, IMAGE_PULL_TIMEOUT, IMAGE_REF_VALID_CHARS, MAX_CONFIG_SIZE,
    MAX_IMAGE_REF_LEN, MAX_LAYER_SIZE, MAX_LAYERS, MAX_MANIFEST_SIZE,
};
use crate::digest::ImageDigest;
use crate::error::{Error, Result};
use crate::storage::BlobStore;
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::{OciImageManifest, OciManifest};
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client, Reference};
use serde::Deserialize;
use std::fs::File;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

// =============================================================================
// Data Model
// =============================================================================

/// Runtime configuration extracted from an image's config blob.
#[derive(Debug, Clone, Default)]
pub struct ImageConfig {
    /// Entrypoint elements, in order.
    pub entrypoint: Vec<String>,
    /// Cmd elements, in order.
    pub cmd: Vec<String>,
    /// Environment entries as `KEY=VALUE` strings, in order.
    pub env: Vec<String>,
    /// Working directory; empty means `/`.
    pub working_dir: String,
    /// User the image wants to run as. Unused by the disk pipeline.
    pub user: String,
}

/// An immutable descriptor of a fetched image.
///
/// `layers[0]` is the base layer; the last index is the topmost override.
/// The digest is the manifest digest and serves as the build's cache key
/// and the published artifact's filename stem.
#[derive(Debug, Clone)]
pub struct Image {
    /// Manifest digest.
    pub digest: ImageDigest,
    /// Runtime configuration.
    pub config: ImageConfig,
    /// Ordered layer handles, base first.
    pub layers: Vec<Layer>,
    /// Sum of config and layer descriptor sizes; a size hint only.
    pub manifest_size: u64,
}

/// A lazy handle to a single compressed layer.
///
/// The compressed bytes live in the [`BlobStore`], verified against the
/// layer digest on the way in. [`Layer::open_compressed`] therefore yields
/// a fresh stream on every call without network access.
#[derive(Debug, Clone)]
pub struct Layer {
    digest: ImageDigest,
    size: u64,
    media_type: String,
    store: Arc<BlobStore>,
}

impl Layer {
    pub(crate) fn new(
        digest: ImageDigest,
        size: u64,
        media_type: String,
        store: Arc<BlobStore>,
    ) -> Self {
        Self {
            digest,
            size,
            media_type,
            store,
        }
    }

    /// Layer digest as advertised by the registry.
    pub fn digest(&self) -> &ImageDigest {
        &self.digest
    }

    /// Compressed size in bytes. Trusted for sizing, not for security.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Layer media type.
    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    /// Opens a fresh single-use stream of the gzip-compressed tar bytes.
    pub fn open_compressed(&self, cancel: &CancellationToken) -> Result<File> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.store
            .open_blob(&self.digest)
            .map_err(|e| Error::LayerStream {
                digest: self.digest.to_string(),
                reason: e.to_string(),
            })
    }
}

/// Where images come from.
///
/// The orchestrator depends on this abstraction, not on a concrete registry
/// client, so tests can swap in [`FakeImageSource`].
pub trait ImageSource {
    /// Human-readable reference, e.g. `docker.io/library/nginx:latest`.
    fn info(&self) -> String;

    /// Resolves the reference and fetches manifest, config, and layer
    /// handles for `linux/<host-arch>`.
    fn get_image(&self, cancel: &CancellationToken) -> impl Future<Output = Result<Image>> + Send;
}

// =============================================================================
// Reference Normalization
// =============================================================================

/// Expands a short image reference to a fully qualified one.
///
/// Rules: no `/` at all means a Docker Hub library image; a first path
/// component without `.` or `:` means a Docker Hub user image; anything
/// else already carries a registry host.
pub fn normalize_reference(image_ref: &str) -> String {
    if !image_ref.contains('/') {
        return format!("docker.io/library/{}", image_ref);
    }
    let first = image_ref.split('/').next().unwrap_or("");
    if !first.contains('.') && !first.contains(':') {
        return format!("docker.io/{}", image_ref);
    }
    image_ref.to_string()
}

fn validate_reference(image_ref: &str) -> Result<()> {
    if image_ref.is_empty() {
        return Err(Error::InvalidReference {
            reference: image_ref.to_string(),
            reason: "empty image reference".to_string(),
        });
    }
    if image_ref.len() > MAX_IMAGE_REF_LEN {
        return Err(Error::InvalidReference {
            reference: image_ref.chars().take(50).collect::<String>() + "...",
            reason: format!("exceeds {} bytes", MAX_IMAGE_REF_LEN),
        });
    }
    if !image_ref.chars().all(|c| IMAGE_REF_VALID_CHARS.contains(c)) {
        return Err(Error::InvalidReference {
            reference: image_ref.to_string(),
            reason: "contains invalid characters".to_string(),
        });
    }
    Ok(())
}

/// OCI architecture name for the host CPU.
fn host_oci_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "arm" => "arm",
        other => other,
    }
}

// =============================================================================
// Registry Source
// =============================================================================

/// Fetches OCI images from a container registry.
///
/// Manifest and config are fetched eagerly by [`get_image`]; layer blobs are
/// downloaded into the [`BlobStore`] (skipping any already cached by digest)
/// so the returned [`Layer`] handles stream from verified local content.
///
/// [`get_image`]: ImageSource::get_image
pub struct RegistrySource {
    reference: Reference,
    storage: Arc<BlobStore>,
}

impl RegistrySource {
    /// Creates a source for the given reference, applying normalization.
    pub fn new(image_ref: &str, storage: Arc<BlobStore>) -> Result<Self> {
        validate_reference(image_ref)?;

        let normalized = normalize_reference(image_ref);
        let reference: Reference =
            normalized.parse().map_err(|e| Error::InvalidReference {
                reference: image_ref.to_string(),
                reason: format!("{}", e),
            })?;

        Ok(Self { reference, storage })
    }

    async fn fetch_manifest(
        &self,
        client: &Client,
        auth: &RegistryAuth,
        reference: &Reference,
        cancel: &CancellationToken,
    ) -> Result<(OciManifest, String)> {
        bounded(cancel, "pull manifest", client.pull_manifest(reference, auth))
            .await?
            .map_err(|e| self.classify_pull_error(e))
    }

    /// Maps a registry error onto the caller-visible kinds. A missing image
    /// or tag is `ImageUnavailable`; transport problems are
    /// `RegistryUnreachable`.
    fn classify_pull_error(&self, err: oci_distribution::errors::OciDistributionError) -> Error {
        let reason = err.to_string();
        let lowered = reason.to_lowercase();
        if lowered.contains("not found")
            || lowered.contains("manifest unknown")
            || lowered.contains("name unknown")
            || lowered.contains("404")
        {
            Error::ImageUnavailable {
                reference: self.reference.whole(),
                reason,
            }
        } else {
            Error::RegistryUnreachable {
                reference: self.reference.whole(),
                reason,
            }
        }
    }

    /// Resolves a manifest list to the `linux/<host-arch>` entry.
    async fn resolve_index(
        &self,
        client: &Client,
        auth: &RegistryAuth,
        index: oci_distribution::manifest::OciImageIndex,
        cancel: &CancellationToken,
    ) -> Result<(OciImageManifest, String)> {
        let target_arch = host_oci_arch();

        let matching = index.manifests.iter().find(|m| {
            m.platform
                .as_ref()
                .is_some_and(|p| p.os == "linux" && p.architecture == target_arch)
        });

        let manifest_desc = matching.ok_or_else(|| {
            let available: Vec<String> = index
                .manifests
                .iter()
                .filter_map(|m| m.platform.as_ref())
                .map(|p| format!("{}/{}", p.os, p.architecture))
                .collect();

            Error::ImageUnavailable {
                reference: self.reference.whole(),
                reason: format!(
                    "no manifest for linux/{}. available: {}",
                    target_arch,
                    available.join(", ")
                ),
            }
        })?;

        if manifest_desc.size as u64 > MAX_MANIFEST_SIZE {
            return Err(Error::ImageTooLarge {
                size: manifest_desc.size as u64,
                limit: MAX_MANIFEST_SIZE,
            });
        }

        // Pull the platform manifest by digest; its digest becomes the
        // image's cache key.
        let digest_ref: Reference = format!(
            "{}/{}@{}",
            self.reference.registry(),
            self.reference.repository(),
            manifest_desc.digest
        )
        .parse()
        .map_err(|e| Error::ManifestCorrupt {
            reference: self.reference.whole(),
            reason: format!("failed to build digest reference: {}", e),
        })?;

        let (platform_manifest, digest) =
            self.fetch_manifest(client, auth, &digest_ref, cancel).await?;

        match platform_manifest {
            OciManifest::Image(img) => Ok((img, digest)),
            OciManifest::ImageIndex(_) => Err(Error::ManifestCorrupt {
                reference: self.reference.whole(),
                reason: "nested image index not supported".to_string(),
            }),
        }
    }

    async fn fetch_config(
        &self,
        client: &Client,
        img: &OciImageManifest,
        cancel: &CancellationToken,
    ) -> Result<ImageConfig> {
        if img.config.size as u64 > MAX_CONFIG_SIZE {
            return Err(Error::ImageTooLarge {
                size: img.config.size as u64,
                limit: MAX_CONFIG_SIZE,
            });
        }

        let mut data = Vec::new();
        bounded(
            cancel,
            "pull config blob",
            client.pull_blob(&self.reference, &img.config, &mut data),
        )
        .await?
        .map_err(|e| self.classify_pull_error(e))?;

        let file: ConfigFile =
            serde_json::from_slice(&data).map_err(|e| Error::ManifestCorrupt {
                reference: self.reference.whole(),
                reason: format!("parse config blob: {}", e),
            })?;

        let cfg = file.config.unwrap_or_default();
        Ok(ImageConfig {
            entrypoint: cfg.entrypoint.unwrap_or_default(),
            cmd: cfg.cmd.unwrap_or_default(),
            env: cfg.env.unwrap_or_default(),
            working_dir: cfg.working_dir.unwrap_or_default(),
            user: cfg.user.unwrap_or_default(),
        })
    }

    /// Downloads missing layer blobs into the store and builds handles.
    async fn fetch_layers(
        &self,
        client: &Client,
        img: &OciImageManifest,
        cancel: &CancellationToken,
    ) -> Result<Vec<Layer>> {
        if img.layers.len() > MAX_LAYERS {
            return Err(Error::ManifestCorrupt {
                reference: self.reference.whole(),
                reason: format!("too many layers: {} > {}", img.layers.len(), MAX_LAYERS),
            });
        }

        let mut layers = Vec::with_capacity(img.layers.len());
        for desc in &img.layers {
            let digest = ImageDigest::parse(&desc.digest)?;

            if desc.size as u64 > MAX_LAYER_SIZE {
                return Err(Error::ImageTooLarge {
                    size: desc.size as u64,
                    limit: MAX_LAYER_SIZE,
                });
            }

            if self.storage.has_blob(&digest) {
                debug!("layer {} already cached", digest);
            } else {
                debug!("pulling layer {} ({} bytes)", digest, desc.size);
                let mut data = Vec::new();
                bounded(
                    cancel,
                    "pull layer blob",
                    client.pull_blob(&self.reference, desc, &mut data),
                )
                .await?
                .map_err(|e| self.classify_pull_error(e))?;

                // put_blob re-hashes the bytes, so a lying registry fails here.
                self.storage.put_blob(&digest, &data)?;
            }

            layers.push(Layer::new(
                digest,
                desc.size as u64,
                desc.media_type.clone(),
                self.storage.clone(),
            ));
        }

        Ok(layers)
    }
}

impl ImageSource for RegistrySource {
    fn info(&self) -> String {
        self.reference.whole()
    }

    async fn get_image(&self, cancel: &CancellationToken) -> Result<Image> {
        info!("fetching image {}", self.reference.whole());

        let client = Client::new(ClientConfig {
            protocol: ClientProtocol::Https,
            ..Default::default()
        });
        let auth = RegistryAuth::Anonymous;

        let (manifest, digest) = self
            .fetch_manifest(&client, &auth, &self.reference, cancel)
            .await?;

        let (img, digest) = match manifest {
            OciManifest::Image(img) => (img, digest),
            OciManifest::ImageIndex(index) => {
                self.resolve_index(&client, &auth, index, cancel).await?
            }
        };

        let config = self.fetch_config(&client, &img, cancel).await?;
        let layers = self.fetch_layers(&client, &img, cancel).await?;

        let manifest_size = img.config.size as u64
            + img.layers.iter().map(|l| l.size as u64).sum::<u64>();

        Ok(Image {
            digest: ImageDigest::parse(&digest)?,
            config,
            layers,
            manifest_size,
        })
    }
}

/// Runs a registry future under the pull timeout and the build's
/// cancellation token.
async fn bounded<T>(
    cancel: &CancellationToken,
    operation: &str,
    fut: impl Future<Output = T>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        res = tokio::time::timeout(IMAGE_PULL_TIMEOUT, fut) => {
            res.map_err(|_| Error::Timeout {
                operation: operation.to_string(),
                duration: IMAGE_PULL_TIMEOUT,
            })
        }
    }
}

/// Image config blob as stored in the registry. Only the runtime `config`
/// object matters here.
#[derive(Debug, Deserialize)]
struct ConfigFile {
    config: Option<RuntimeConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct RuntimeConfig {
    #[serde(rename = "Entrypoint")]
    entrypoint: Option<Vec<String>>,
    #[serde(rename = "Cmd")]
    cmd: Option<Vec<String>>,
    #[serde(rename = "Env")]
    env: Option<Vec<String>>,
    #[serde(rename = "WorkingDir")]
    working_dir: Option<String>,
    #[serde(rename = "User")]
    user: Option<String>,
}

// =============================================================================
// Fake Source
// =============================================================================

/// An [`ImageSource`] serving a pre-assembled image.
///
/// Layer blobs are installed into the given [`BlobStore`] at construction,
/// so the returned handles behave exactly like registry-backed ones. The
/// image digest is derived from the layer digests and config, making two
/// fakes with the same content interchangeable.
pub struct FakeImageSource {
    image: Image,
}

impl FakeImageSource {
    /// Builds a fake image from gzip-compressed tar layer blobs, base first.
    pub fn new(
        store: &Arc<BlobStore>,
        config: ImageConfig,
        layer_blobs: &[Vec<u8>],
    ) -> Result<Self> {
        let mut layers = Vec::with_capacity(layer_blobs.len());
        let mut manifest_size = 0u64;
        let mut identity = String::new();

        for blob in layer_blobs {
            let digest = ImageDigest::sha256(blob);
            store.put_blob(&digest, blob)?;
            identity.push_str(digest.as_str());
            manifest_size += blob.len() as u64;
            layers.push(Layer::new(
                digest,
                blob.len() as u64,
                DOCKER_LAYER_MEDIA_TYPE_GZIP.to_string(),
                store.clone(),
            ));
        }

        identity.push_str(&config.entrypoint.join("\u{0}"));
        identity.push_str(&config.cmd.join("\u{0}"));

        Ok(Self {
            image: Image {
                digest: ImageDigest::sha256(identity.as_bytes()),
                config,
                layers,
                manifest_size,
            },
        })
    }

    /// The image this source will serve, for direct use in sync tests.
    pub fn image(&self) -> &Image {
        &self.image
    }
}

impl ImageSource for FakeImageSource {
    fn info(&self) -> String {
        format!("fake.registry/walkio:{}", self.image.digest.hex())
    }

    async fn get_image(&self, cancel: &CancellationToken) -> Result<Image> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(self.image.clone())
    }
}
