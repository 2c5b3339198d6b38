//! Round-trips through the file-backed workers over temporary files.

mod support;

use std::sync::Arc;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use blockcast::{
    EngineConfig, FileBlockReader, FileBlockWriter, HashAlgorithm, TransferCoordinator,
};
use support::pattern_bytes;

const BLOCK: usize = 16384;

fn write_source(dir: &TempDir, len: u64) -> std::path::PathBuf {
    let path = dir.path().join("source.bin");
    std::fs::write(&path, pattern_bytes(len)).unwrap();
    path
}

async fn run_file_transfer(len: u64, verify: bool, fan_out: usize) {
    let dir = TempDir::new().unwrap();
    let source = write_source(&dir, len);

    let mut config = EngineConfig::new()
        .with_block_size(BLOCK)
        .with_pool_capacity(16);
    if verify {
        config = config
            .with_verify_hash(true)
            .with_hash_algorithm(HashAlgorithm::Sha256);
    }

    let mut coordinator = TransferCoordinator::from_config(config).unwrap();
    coordinator.set_producer(Arc::new(
        FileBlockReader::new(&source).with_concurrency(4),
    ));

    let mut targets = Vec::new();
    for i in 0..fan_out {
        let path = dir.path().join(format!("copy-{i}.bin"));
        let concurrency = if i % 2 == 0 { 1 } else { 4 };
        coordinator.add_consumer(Arc::new(
            FileBlockWriter::new(&path).with_concurrency(concurrency),
        ));
        targets.push(path);
    }

    let report = coordinator.execute(CancellationToken::new()).await.unwrap();
    assert_eq!(report.bytes_transferred, len);

    let expected = std::fs::read(&source).unwrap();
    for target in &targets {
        let copied = std::fs::read(target).unwrap();
        assert_eq!(copied.len() as u64, len);
        assert_eq!(copied, expected, "mismatch for {}", target.display());
    }

    if verify {
        let reference = coordinator.reference_hash().expect("reference digest");
        for completion in coordinator.completions() {
            assert!(completion.outcome.is_success());
            assert_eq!(completion.digest.as_ref(), Some(&reference));
        }
    }
    coordinator.pool().assert_idle().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_file_roundtrip_block_aligned() {
    run_file_transfer(8 * BLOCK as u64, false, 2).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_file_roundtrip_short_last_block() {
    run_file_transfer(5 * BLOCK as u64 + 1, true, 2).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_file_roundtrip_single_byte() {
    run_file_transfer(1, true, 1).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_file_roundtrip_empty_file() {
    run_file_transfer(0, true, 2).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_file_roundtrip_wide_fan_out() {
    run_file_transfer(12 * BLOCK as u64 + 4321, true, 5).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_file_transfer_repeats_identically() {
    let dir = TempDir::new().unwrap();
    let len = 6 * BLOCK as u64 + 99;
    let source = write_source(&dir, len);
    let target = dir.path().join("copy.bin");

    let config = EngineConfig::new()
        .with_block_size(BLOCK)
        .with_pool_capacity(8)
        .with_verify_hash(true);
    let mut coordinator = TransferCoordinator::from_config(config).unwrap();
    coordinator.set_producer(Arc::new(FileBlockReader::new(&source)));
    coordinator.add_consumer(Arc::new(FileBlockWriter::new(&target)));

    coordinator.execute(CancellationToken::new()).await.unwrap();
    let first_digest = coordinator.reference_hash().unwrap();
    let first_copy = std::fs::read(&target).unwrap();

    coordinator.execute(CancellationToken::new()).await.unwrap();
    let second_digest = coordinator.reference_hash().unwrap();
    let second_copy = std::fs::read(&target).unwrap();

    assert_eq!(first_digest, second_digest);
    assert_eq!(first_copy, second_copy);
    coordinator.pool().assert_idle().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_missing_source_surfaces_worker_error() {
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("copy.bin");

    let mut coordinator = TransferCoordinator::new(BLOCK, 8).unwrap();
    coordinator.set_producer(Arc::new(FileBlockReader::new(
        dir.path().join("does-not-exist.bin"),
    )));
    coordinator.add_consumer(Arc::new(FileBlockWriter::new(&target)));

    let err = coordinator
        .execute(CancellationToken::new())
        .await
        .unwrap_err();
    assert!(
        matches!(err, blockcast::EngineError::Worker { .. }),
        "unexpected error: {err}"
    );
    coordinator.pool().assert_idle().unwrap();
}
