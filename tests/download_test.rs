//! Download into a staged file, resume, and verification

mod common;

use common::{random_bytes, CountingHook, FailOnPart, Instrumented};
use partwise::core::checkpoint::Checkpoint;
use partwise::transfer::staging_path;
use partwise::{
    crc64, CheckpointConfig, LocalObjectStore, TransferConfig, TransferError, TransferManager,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tempfile::TempDir;

fn setup(size: usize, seed: u64) -> (TempDir, LocalObjectStore, Vec<u8>) {
    let dir = TempDir::new().unwrap();
    let store = LocalObjectStore::open(dir.path().join("store")).unwrap();
    let data = random_bytes(size, seed);
    store.put_object("remote/object.bin", &data).unwrap();
    (dir, store, data)
}

#[test]
fn test_download_by_part_size() {
    let (dir, store, data) = setup(300_001, 11);
    let dest = dir.path().join("out.bin");
    let manager = TransferManager::new(
        store,
        TransferConfig::default().with_part_size(64 * 1024).with_routines(4),
    )
    .unwrap();

    let stats = manager.download("remote/object.bin", &dest).unwrap();
    assert_eq!(stats.parts_total, 5);
    assert_eq!(stats.bytes_transferred, 300_001);
    assert_eq!(stats.crc64, Some(crc64(&data)));
    assert_eq!(std::fs::read(&dest).unwrap(), data);
    assert!(!staging_path(&dest).exists());
}

#[test]
fn test_download_resumes_staged_file() {
    let (dir, store, data) = setup(250_000, 12);
    let dest = dir.path().join("out.bin");
    let cp_path = dir.path().join("download.cp");
    let config = TransferConfig::default()
        .with_part_count(6)
        .with_routines(2)
        .with_checkpoint(CheckpointConfig::at(&cp_path));

    let first = TransferManager::new(store.clone(), config.clone())
        .unwrap()
        .with_hook(Arc::new(FailOnPart::new(4)));
    assert!(first.download("remote/object.bin", &dest).is_err());
    assert!(!dest.exists());
    assert!(staging_path(&dest).exists());

    let checkpoint = Checkpoint::load(&cp_path).unwrap();
    let pending = checkpoint.pending_count();
    assert!(pending >= 1);
    assert!(!checkpoint.is_done(4));

    let counter = Arc::new(CountingHook::default());
    let second = TransferManager::new(store, config)
        .unwrap()
        .with_hook(counter.clone());
    let stats = second.download("remote/object.bin", &dest).unwrap();
    assert!(stats.resumed);
    assert_eq!(counter.count(), pending);
    assert_eq!(std::fs::read(&dest).unwrap(), data);
    assert!(!cp_path.exists());
    assert!(!staging_path(&dest).exists());
}

#[test]
fn test_tampered_staged_range_is_not_resumed() {
    let (dir, store, data) = setup(200_000, 17);
    let dest = dir.path().join("out.bin");
    let cp_path = dir.path().join("download.cp");
    let config = TransferConfig::default()
        .with_part_count(4)
        .with_routines(1)
        .with_checkpoint(CheckpointConfig::at(&cp_path));

    let first = TransferManager::new(store.clone(), config.clone())
        .unwrap()
        .with_hook(Arc::new(FailOnPart::new(4)));
    assert!(first.download("remote/object.bin", &dest).is_err());
    assert!(Checkpoint::load(&cp_path).unwrap().is_done(1));

    // Truncate and regrow: the length matches again but part 1 is zeroed
    let staged = staging_path(&dest);
    let file = std::fs::OpenOptions::new().write(true).open(&staged).unwrap();
    file.set_len(0).unwrap();
    file.set_len(data.len() as u64).unwrap();
    drop(file);

    let counter = Arc::new(CountingHook::default());
    let second = TransferManager::new(store, config)
        .unwrap()
        .with_hook(counter.clone());
    let stats = second.download("remote/object.bin", &dest).unwrap();
    assert!(!stats.resumed);
    assert_eq!(counter.count(), 4);
    assert_eq!(std::fs::read(&dest).unwrap(), data);
}

#[test]
fn test_changed_object_restarts_download() {
    let (dir, store, _) = setup(200_000, 13);
    let dest = dir.path().join("out.bin");
    let config = TransferConfig::default()
        .with_part_count(4)
        .with_checkpoint(CheckpointConfig::in_dir(dir.path().join("cps")));

    let first = TransferManager::new(store.clone(), config.clone())
        .unwrap()
        .with_hook(Arc::new(FailOnPart::new(2)));
    assert!(first.download("remote/object.bin", &dest).is_err());

    let replacement = random_bytes(200_000, 99);
    store.put_object("remote/object.bin", &replacement).unwrap();

    let counter = Arc::new(CountingHook::default());
    let second = TransferManager::new(store, config)
        .unwrap()
        .with_hook(counter.clone());
    let stats = second.download("remote/object.bin", &dest).unwrap();
    assert!(!stats.resumed);
    assert_eq!(counter.count(), 4);
    assert_eq!(std::fs::read(&dest).unwrap(), replacement);
}

#[test]
fn test_crc_mismatch_discards_download() {
    let (dir, store, _) = setup(100_000, 14);
    let dest = dir.path().join("out.bin");
    let cp_path = dir.path().join("download.cp");
    let manager = TransferManager::new(
        Instrumented::corrupting(store),
        TransferConfig::default()
            .with_part_count(3)
            .with_checkpoint(CheckpointConfig::at(&cp_path)),
    )
    .unwrap();

    let err = manager.download("remote/object.bin", &dest).unwrap_err();
    assert!(matches!(err, TransferError::ChecksumMismatch { .. }));
    assert!(!dest.exists());
    assert!(!staging_path(&dest).exists());
    assert!(!cp_path.exists());
}

#[test]
fn test_verification_can_be_disabled() {
    let (dir, store, data) = setup(100_000, 15);
    let dest = dir.path().join("out.bin");
    let mut config = TransferConfig::default().with_part_count(3);
    config.verify_checksum = false;
    let manager = TransferManager::new(Instrumented::corrupting(store), config).unwrap();

    manager.download("remote/object.bin", &dest).unwrap();
    assert_eq!(std::fs::read(&dest).unwrap(), data);
}

#[test]
fn test_bad_destination_fails_before_network() {
    let (dir, store, _) = setup(10, 16);
    let manager =
        TransferManager::new(Instrumented::new(store), TransferConfig::default()).unwrap();

    let err = manager.download("remote/object.bin", dir.path()).unwrap_err();
    assert!(matches!(err, TransferError::InvalidArgument(_)));

    let orphan = dir.path().join("missing-dir").join("out.bin");
    let err = manager.download("remote/object.bin", &orphan).unwrap_err();
    assert!(matches!(err, TransferError::InvalidArgument(_)));

    assert_eq!(manager.service().heads.load(Ordering::SeqCst), 0);
}

#[test]
fn test_missing_object_leaves_no_staged_file() {
    let (dir, store, _) = setup(10, 17);
    let dest = dir.path().join("out.bin");
    let manager = TransferManager::new(store, TransferConfig::default()).unwrap();

    let err = manager.download("no/such/key", &dest).unwrap_err();
    assert_eq!(err.service_code(), Some("NoSuchKey"));
    assert!(!staging_path(&dest).exists());
}

#[test]
fn test_empty_object_download() {
    let (dir, store, _) = setup(0, 18);
    let dest = dir.path().join("empty.bin");
    let manager = TransferManager::new(store, TransferConfig::default()).unwrap();

    let stats = manager.download("remote/object.bin", &dest).unwrap();
    assert_eq!(stats.total_bytes, 0);
    assert_eq!(std::fs::metadata(&dest).unwrap().len(), 0);
}
