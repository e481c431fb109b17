//! Tests for State-disk provisioning.

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use walkio::disk::{
    MIN_DEVICE_SIZE, NoOpBlockDeviceBuilder, StateDiskOptions, build_state_device,
};

#[tokio::test]
async fn test_state_disk_naming_and_size() {
    let temp = TempDir::new().unwrap();

    let disk = build_state_device(
        &CancellationToken::new(),
        &NoOpBlockDeviceBuilder::new(),
        &StateDiskOptions {
            app_id: "app-1".to_string(),
            size_bytes: 0,
            output_dir: temp.path().to_path_buf(),
        },
    )
    .await
    .unwrap();

    let name = disk.path.file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with("app-1_"), "name: {name}");
    assert!(name.ends_with(".ext4"), "name: {name}");

    // A zero-size request is clamped up to the journal-viable minimum.
    assert_eq!(disk.size_bytes, MIN_DEVICE_SIZE);
    assert_eq!(
        std::fs::metadata(&disk.path).unwrap().len(),
        MIN_DEVICE_SIZE
    );
}

#[tokio::test]
async fn test_state_disks_never_collide() {
    let temp = TempDir::new().unwrap();
    let builder = NoOpBlockDeviceBuilder::new();
    let cancel = CancellationToken::new();
    let opts = StateDiskOptions {
        app_id: "app-1".to_string(),
        size_bytes: 8 * 1024 * 1024,
        output_dir: temp.path().to_path_buf(),
    };

    let first = build_state_device(&cancel, &builder, &opts).await.unwrap();
    let second = build_state_device(&cancel, &builder, &opts).await.unwrap();

    assert_ne!(first.path, second.path, "per-instance UUIDs must differ");
    assert!(first.path.exists());
    assert!(second.path.exists());
}

#[tokio::test]
async fn test_requested_size_is_honored() {
    let temp = TempDir::new().unwrap();

    let disk = build_state_device(
        &CancellationToken::new(),
        &NoOpBlockDeviceBuilder::new(),
        &StateDiskOptions {
            app_id: "app-2".to_string(),
            size_bytes: 64 * 1024 * 1024,
            output_dir: temp.path().to_path_buf(),
        },
    )
    .await
    .unwrap();

    assert_eq!(disk.size_bytes, 64 * 1024 * 1024);
}
