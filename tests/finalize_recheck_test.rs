//! Changes that land while parts are running are caught before commit

mod common;

use common::{random_bytes, random_file, OnPart};
use filetime::{set_file_mtime, FileTime};
use partwise::protocol::ObjectService;
use partwise::transfer::staging_path;
use partwise::{CheckpointConfig, LocalObjectStore, TransferConfig, TransferManager};
use std::sync::Arc;
use tempfile::TempDir;

fn store(dir: &TempDir) -> LocalObjectStore {
    LocalObjectStore::open(dir.path().join("store")).unwrap()
}

#[test]
fn test_source_touched_mid_upload_is_stale() {
    let dir = TempDir::new().unwrap();
    let (source, _) = random_file(dir.path(), "in.bin", 200_000, 51);
    let cp_path = dir.path().join("upload.cp");
    let store = store(&dir);

    let touched = source.clone();
    let manager = TransferManager::new(
        store.clone(),
        TransferConfig::default()
            .with_part_count(4)
            .with_routines(3)
            .with_checkpoint(CheckpointConfig::at(&cp_path)),
    )
    .unwrap()
    .with_hook(Arc::new(OnPart::new(2, move || {
        set_file_mtime(&touched, FileTime::from_unix_time(1_000_000_000, 0)).unwrap();
    })));

    let err = manager.upload(&source, "k").unwrap_err();
    assert!(err.is_stale_checkpoint(), "unexpected error: {}", err);
    assert!(store.head_object("k").is_err(), "nothing committed");
    assert!(!cp_path.exists());
    assert!(store.open_sessions().unwrap().is_empty());
}

#[test]
fn test_session_gone_before_commit_is_stale() {
    let dir = TempDir::new().unwrap();
    let (source, data) = random_file(dir.path(), "in.bin", 150_000, 52);
    let cp_path = dir.path().join("upload.cp");
    let store = store(&dir);
    let config = TransferConfig::default()
        .with_part_count(3)
        .with_routines(1)
        .with_checkpoint(CheckpointConfig::at(&cp_path));

    let remote = store.clone();
    let manager = TransferManager::new(store.clone(), config.clone())
        .unwrap()
        .with_hook(Arc::new(OnPart::new(3, move || {
            for session_id in remote.open_sessions().unwrap() {
                remote.abort_session("k", &session_id).unwrap();
            }
        })));

    let err = manager.upload(&source, "k").unwrap_err();
    assert!(err.is_stale_checkpoint(), "unexpected error: {}", err);
    assert!(store.head_object("k").is_err());
    assert!(!cp_path.exists());

    // The next call starts over and succeeds
    let retry = TransferManager::new(store.clone(), config).unwrap();
    let stats = retry.upload(&source, "k").unwrap();
    assert!(!stats.resumed);
    assert_eq!(store.get_object("k").unwrap(), data);
}

#[test]
fn test_object_replaced_mid_download_is_stale() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir);
    store.put_object("remote.bin", &random_bytes(120_000, 53)).unwrap();
    let replacement = random_bytes(120_000, 54);
    let dest = dir.path().join("out.bin");
    let cp_path = dir.path().join("download.cp");
    let config = TransferConfig::default()
        .with_part_count(4)
        .with_routines(1)
        .with_checkpoint(CheckpointConfig::at(&cp_path));

    let remote = store.clone();
    let swapped = replacement.clone();
    let manager = TransferManager::new(store.clone(), config.clone())
        .unwrap()
        .with_hook(Arc::new(OnPart::new(2, move || {
            remote.put_object("remote.bin", &swapped).unwrap();
        })));

    let err = manager.download("remote.bin", &dest).unwrap_err();
    assert!(err.is_stale_checkpoint(), "unexpected error: {}", err);
    assert!(!dest.exists());
    assert!(!staging_path(&dest).exists());
    assert!(!cp_path.exists());

    let retry = TransferManager::new(store, config).unwrap();
    retry.download("remote.bin", &dest).unwrap();
    assert_eq!(std::fs::read(&dest).unwrap(), replacement);
}

#[test]
fn test_source_replaced_mid_copy_is_stale() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir);
    store.put_object("src.bin", &random_bytes(90_000, 55)).unwrap();

    let remote = store.clone();
    let manager = TransferManager::new(
        store.clone(),
        TransferConfig::default()
            .with_part_count(3)
            .with_routines(1)
            .with_checkpoint(CheckpointConfig::in_dir(dir.path().join("cps"))),
    )
    .unwrap()
    .with_hook(Arc::new(OnPart::new(1, move || {
        remote.put_object("src.bin", &random_bytes(90_000, 56)).unwrap();
    })));

    let err = manager.copy("src.bin", "dst.bin").unwrap_err();
    assert!(err.is_stale_checkpoint(), "unexpected error: {}", err);
    assert!(store.head_object("dst.bin").is_err());
    assert!(store.open_sessions().unwrap().is_empty());
    assert_eq!(std::fs::read_dir(dir.path().join("cps")).unwrap().count(), 0);
}
