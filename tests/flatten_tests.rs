//! Tests for layer flattening.
//!
//! Builds gzip-compressed tar layers in memory and validates merge
//! semantics per the OCI image spec:
//! - Layer ordering and file overwrites
//! - Whiteout markers (`.wh.*`) and opaque whiteouts (`.wh..wh..opaque`)
//! - Path traversal defense (crafted `..` entry names)
//! - Symlink targets preserved verbatim
//! - Hard-link escape degradation
//! - Cooperative cancellation

use flate2::Compression;
use flate2::write::GzEncoder;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use tar::{EntryType, Header};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use walkio::disk::{AppConfigWriter, ConfigWriter, Error, FsBuilder, LayerFlattener};
use walkio::image::{BlobStore, FakeImageSource, Image, ImageConfig};

// =============================================================================
// Mock Layer Construction
// =============================================================================

enum TarEntry {
    Dir { name: &'static str, mode: u32 },
    File { name: &'static str, content: &'static [u8], mode: u32 },
    Symlink { name: &'static str, target: &'static str },
    HardLink { name: &'static str, target: &'static str },
    /// Entry with a raw name written straight into the header, bypassing the
    /// tar crate's path validation. Used to craft hostile archives.
    RawFile { name: &'static [u8] },
}

fn build_layer(entries: &[TarEntry]) -> Vec<u8> {
    let mut tar = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));

    for entry in entries {
        match entry {
            TarEntry::Dir { name, mode } => {
                let mut header = Header::new_gnu();
                header.set_entry_type(EntryType::Directory);
                header.set_size(0);
                header.set_mode(*mode);
                tar.append_data(&mut header, name, io::empty()).unwrap();
            }
            TarEntry::File { name, content, mode } => {
                let mut header = Header::new_gnu();
                header.set_entry_type(EntryType::Regular);
                header.set_size(content.len() as u64);
                header.set_mode(*mode);
                tar.append_data(&mut header, name, *content).unwrap();
            }
            TarEntry::Symlink { name, target } => {
                let mut header = Header::new_gnu();
                header.set_entry_type(EntryType::Symlink);
                header.set_size(0);
                header.set_mode(0o777);
                tar.append_link(&mut header, name, target).unwrap();
            }
            TarEntry::HardLink { name, target } => {
                let mut header = Header::new_gnu();
                header.set_entry_type(EntryType::Link);
                header.set_size(0);
                header.set_mode(0o644);
                tar.append_link(&mut header, name, target).unwrap();
            }
            TarEntry::RawFile { name } => {
                let mut header = Header::new_gnu();
                {
                    let gnu = header.as_gnu_mut().unwrap();
                    gnu.name[..name.len()].copy_from_slice(name);
                }
                header.set_entry_type(EntryType::Regular);
                header.set_size(0);
                header.set_mode(0o644);
                header.set_cksum();
                tar.append(&header, io::empty()).unwrap();
            }
        }
    }

    tar.into_inner().unwrap().finish().unwrap()
}

/// Assembles layers into an image backed by a scratch blob store.
fn fake_image(store_dir: &Path, layers: &[Vec<u8>]) -> Image {
    let store = Arc::new(BlobStore::with_path(store_dir.to_path_buf()).unwrap());
    FakeImageSource::new(&store, ImageConfig::default(), layers)
        .unwrap()
        .image()
        .clone()
}

fn flatten(image: &Image, target: &Path) -> walkio::disk::Result<()> {
    LayerFlattener::new().build_fs(&CancellationToken::new(), &image.layers, target)
}

// =============================================================================
// Basic Extraction
// =============================================================================

#[test]
fn test_basic_extraction() {
    let temp = TempDir::new().unwrap();
    let target = temp.path().join("rootfs");

    let layer = build_layer(&[
        TarEntry::File { name: "file.txt", content: b"hello", mode: 0o644 },
        TarEntry::Dir { name: "dir", mode: 0o755 },
        TarEntry::File { name: "dir/nested.txt", content: b"world", mode: 0o644 },
    ]);
    let image = fake_image(&temp.path().join("store"), &[layer]);

    flatten(&image, &target).unwrap();

    assert_eq!(fs::read(target.join("file.txt")).unwrap(), b"hello");
    assert!(target.join("dir").is_dir());
    assert_eq!(fs::read(target.join("dir/nested.txt")).unwrap(), b"world");
}

#[test]
fn test_file_modes_preserved() {
    let temp = TempDir::new().unwrap();
    let target = temp.path().join("rootfs");

    let layer = build_layer(&[TarEntry::File {
        name: "hello",
        content: b"hello\n",
        mode: 0o755,
    }]);
    let image = fake_image(&temp.path().join("store"), &[layer]);

    flatten(&image, &target).unwrap();

    let mode = fs::metadata(target.join("hello")).unwrap().permissions().mode();
    assert_eq!(mode & 0o7777, 0o755);
}

#[test]
fn test_later_layer_overwrites_earlier() {
    let temp = TempDir::new().unwrap();
    let target = temp.path().join("rootfs");

    let layer1 = build_layer(&[TarEntry::File {
        name: "file.txt",
        content: b"original",
        mode: 0o644,
    }]);
    let layer2 = build_layer(&[TarEntry::File {
        name: "file.txt",
        content: b"updated",
        mode: 0o644,
    }]);
    let image = fake_image(&temp.path().join("store"), &[layer1, layer2]);

    flatten(&image, &target).unwrap();

    assert_eq!(fs::read(target.join("file.txt")).unwrap(), b"updated");
}

#[test]
fn test_layers_merge_additively() {
    let temp = TempDir::new().unwrap();
    let target = temp.path().join("rootfs");

    let layers: Vec<Vec<u8>> = vec![
        build_layer(&[TarEntry::File { name: "one", content: b"1", mode: 0o644 }]),
        build_layer(&[TarEntry::File { name: "two", content: b"2", mode: 0o644 }]),
        build_layer(&[TarEntry::File { name: "three", content: b"3", mode: 0o644 }]),
    ];
    let image = fake_image(&temp.path().join("store"), &layers);

    flatten(&image, &target).unwrap();

    for name in ["one", "two", "three"] {
        assert!(target.join(name).exists(), "{} should exist", name);
    }
}

// =============================================================================
// Whiteouts
// =============================================================================

#[test]
fn test_whiteout_removes_file() {
    let temp = TempDir::new().unwrap();
    let target = temp.path().join("rootfs");

    let layer1 = build_layer(&[TarEntry::File {
        name: "file.txt",
        content: b"bye",
        mode: 0o644,
    }]);
    let layer2 = build_layer(&[TarEntry::File {
        name: ".wh.file.txt",
        content: b"",
        mode: 0o644,
    }]);
    let image = fake_image(&temp.path().join("store"), &[layer1, layer2]);

    flatten(&image, &target).unwrap();

    assert!(!target.join("file.txt").exists());
}

#[test]
fn test_whiteout_removes_directory_recursively() {
    let temp = TempDir::new().unwrap();
    let target = temp.path().join("rootfs");

    let layer1 = build_layer(&[
        TarEntry::Dir { name: "doomed", mode: 0o755 },
        TarEntry::File { name: "doomed/inner.txt", content: b"x", mode: 0o644 },
    ]);
    let layer2 = build_layer(&[TarEntry::File {
        name: ".wh.doomed",
        content: b"",
        mode: 0o644,
    }]);
    let image = fake_image(&temp.path().join("store"), &[layer1, layer2]);

    flatten(&image, &target).unwrap();

    assert!(!target.join("doomed").exists());
}

#[test]
fn test_opaque_whiteout_clears_directory_but_keeps_it() {
    let temp = TempDir::new().unwrap();
    let target = temp.path().join("rootfs");

    let layer1 = build_layer(&[
        TarEntry::Dir { name: "dir", mode: 0o755 },
        TarEntry::File { name: "dir/a", content: b"a", mode: 0o644 },
        TarEntry::File { name: "dir/b", content: b"b", mode: 0o644 },
    ]);
    let layer2 = build_layer(&[
        TarEntry::File { name: "dir/.wh..wh..opaque", content: b"", mode: 0o644 },
        TarEntry::File { name: "dir/c", content: b"c", mode: 0o644 },
    ]);
    let image = fake_image(&temp.path().join("store"), &[layer1, layer2]);

    flatten(&image, &target).unwrap();

    assert!(!target.join("dir/a").exists());
    assert!(!target.join("dir/b").exists());
    assert!(target.join("dir/c").exists());
    assert!(target.join("dir").is_dir());
}

// =============================================================================
// Security
// =============================================================================

#[test]
fn test_path_traversal_fails_the_build() {
    let temp = TempDir::new().unwrap();
    let target = temp.path().join("rootfs");

    let layer = build_layer(&[TarEntry::RawFile { name: b"../etc/passwd" }]);
    let image = fake_image(&temp.path().join("store"), &[layer]);

    let result = flatten(&image, &target);
    assert!(matches!(result, Err(Error::PathEscape { .. })));
    assert!(
        !temp.path().join("etc").exists(),
        "nothing may be written outside the rootfs"
    );
}

#[test]
fn test_symlink_target_is_preserved_verbatim() {
    let temp = TempDir::new().unwrap();
    let target = temp.path().join("rootfs");

    let layer = build_layer(&[TarEntry::Symlink {
        name: "passwd-link",
        target: "/etc/passwd",
    }]);
    let image = fake_image(&temp.path().join("store"), &[layer]);

    flatten(&image, &target).unwrap();

    // The target only has meaning inside the guest; it must not be resolved
    // or rewritten against the host.
    let link = fs::read_link(target.join("passwd-link")).unwrap();
    assert_eq!(link, Path::new("/etc/passwd"));
}

#[test]
fn test_symlink_replaces_existing_file() {
    let temp = TempDir::new().unwrap();
    let target = temp.path().join("rootfs");

    let layer1 = build_layer(&[TarEntry::File {
        name: "entry",
        content: b"plain file",
        mode: 0o644,
    }]);
    let layer2 = build_layer(&[TarEntry::Symlink { name: "entry", target: "elsewhere" }]);
    let image = fake_image(&temp.path().join("store"), &[layer1, layer2]);

    flatten(&image, &target).unwrap();

    assert!(target.join("entry").symlink_metadata().unwrap().is_symlink());
}

#[test]
fn test_hard_link_within_rootfs() {
    let temp = TempDir::new().unwrap();
    let target = temp.path().join("rootfs");

    let layer = build_layer(&[
        TarEntry::File { name: "data.txt", content: b"shared", mode: 0o644 },
        TarEntry::HardLink { name: "copy.txt", target: "data.txt" },
    ]);
    let image = fake_image(&temp.path().join("store"), &[layer]);

    flatten(&image, &target).unwrap();

    use std::os::unix::fs::MetadataExt;
    let original = fs::metadata(target.join("data.txt")).unwrap();
    let copy = fs::metadata(target.join("copy.txt")).unwrap();
    assert_eq!(original.ino(), copy.ino(), "hard link should share the inode");
}

#[test]
fn test_hard_link_escape_degrades_to_empty_file() {
    let temp = TempDir::new().unwrap();
    let target = temp.path().join("rootfs");

    let layer = build_layer(&[TarEntry::HardLink {
        name: "sneaky",
        target: "../../etc/passwd",
    }]);
    let image = fake_image(&temp.path().join("store"), &[layer]);

    flatten(&image, &target).unwrap();

    let meta = fs::metadata(target.join("sneaky")).unwrap();
    assert!(meta.is_file());
    assert_eq!(meta.len(), 0, "escaping hard link must carry no content");
}

// =============================================================================
// Corrupt Input and Cancellation
// =============================================================================

#[test]
fn test_corrupt_gzip_is_reported() {
    let temp = TempDir::new().unwrap();
    let target = temp.path().join("rootfs");

    let image = fake_image(&temp.path().join("store"), &[b"definitely not gzip".to_vec()]);

    let result = flatten(&image, &target);
    assert!(matches!(result, Err(Error::GzipCorrupt { .. })));
}

#[test]
fn test_cancelled_token_aborts_flattening() {
    let temp = TempDir::new().unwrap();
    let target = temp.path().join("rootfs");

    let layer = build_layer(&[TarEntry::File { name: "f", content: b"x", mode: 0o644 }]);
    let image = fake_image(&temp.path().join("store"), &[layer]);

    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = LayerFlattener::new().build_fs(&cancel, &image.layers, &target);
    assert!(matches!(result, Err(Error::Cancelled)));
}

// =============================================================================
// End-to-End Rootfs Scenario
// =============================================================================

/// A one-layer hello-world image produces the full guest-visible contract:
/// the binary with its mode, `/walkio/argv`, and `/walkio/env`.
#[test]
fn test_hello_world_rootfs() {
    let temp = TempDir::new().unwrap();
    let target = temp.path().join("rootfs");

    let layer = build_layer(&[TarEntry::File {
        name: "hello",
        content: b"hello\n",
        mode: 0o755,
    }]);
    let store = Arc::new(BlobStore::with_path(temp.path().join("store")).unwrap());
    let config = ImageConfig {
        entrypoint: vec!["/hello".to_string()],
        ..Default::default()
    };
    let source = FakeImageSource::new(&store, config, &[layer]).unwrap();
    let image = source.image();

    LayerFlattener::new()
        .build_fs(&CancellationToken::new(), &image.layers, &target)
        .unwrap();
    AppConfigWriter::new().write_config(&target, &image.config).unwrap();

    assert_eq!(fs::read(target.join("hello")).unwrap(), b"hello\n");
    let mode = fs::metadata(target.join("hello")).unwrap().permissions().mode();
    assert_eq!(mode & 0o7777, 0o755);

    assert_eq!(fs::read(target.join("walkio/argv")).unwrap(), b"/hello\n");
    assert_eq!(fs::read(target.join("walkio/env")).unwrap(), b"WORKDIR=/");
}
