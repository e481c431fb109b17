//! Tests for atomic file writes.
//!
//! The wanted-marker protocol requires that a concurrent reader of the
//! marker observes either the old or the new content, never a partial
//! write.

use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use tempfile::TempDir;
use walkio::disk::write_file_atomic;

#[test]
fn test_replaces_content_atomically_under_concurrent_reads() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("digest.wanted");
    write_file_atomic(&path, b"0", 0o644).unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let writer_done = done.clone();
    let writer_path = path.clone();

    let writer = thread::spawn(move || {
        for i in 1..=200i64 {
            write_file_atomic(&writer_path, i.to_string().as_bytes(), 0o644).unwrap();
        }
        writer_done.store(true, Ordering::Release);
    });

    // Every observation must parse as an integer at every instant.
    let mut observations = 0u32;
    while !done.load(Ordering::Acquire) {
        let content = fs::read_to_string(&path).unwrap();
        content
            .trim()
            .parse::<i64>()
            .unwrap_or_else(|_| panic!("partial marker content observed: {content:?}"));
        observations += 1;
    }
    writer.join().unwrap();
    assert!(observations > 0);

    assert_eq!(fs::read_to_string(&path).unwrap(), "200");
}

#[test]
fn test_marker_timestamps_are_monotonic_per_writer() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("digest.wanted");

    for ts in [100i64, 150, 200] {
        write_file_atomic(&path, ts.to_string().as_bytes(), 0o644).unwrap();
        let seen: i64 = fs::read_to_string(&path).unwrap().trim().parse().unwrap();
        assert_eq!(seen, ts);
    }
}

#[test]
fn test_write_into_missing_directory_fails_cleanly() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("no-such-dir").join("marker");

    assert!(write_file_atomic(&path, b"1", 0o644).is_err());
    assert!(!path.exists());
}
