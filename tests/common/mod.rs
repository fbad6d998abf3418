//! Test helpers for engine integration tests.
//!
//! Provides a storage engine wired to an in-memory transport with small
//! tier ceilings, so multi-chunk files stay a few hundred bytes.

#![allow(dead_code)]

use std::sync::Arc;

use chandrive::config::{RetryConfig, StorageConfig, TierConfig};
use chandrive::{Database, MemoryTransport, StorageEngine};

/// Owner used by single-user tests.
pub const OWNER: i64 = 1;

/// Bot tier ceiling in test units.
pub const BOT_CEILING: u64 = 50;

/// Client tier ceiling in test units.
pub const CLIENT_CEILING: u64 = 2000;

/// Storage configuration with tiny ceilings and near-instant retries.
pub fn test_storage_config() -> StorageConfig {
    StorageConfig {
        tiers: vec![
            TierConfig {
                name: "bot".to_string(),
                ceiling_bytes: BOT_CEILING,
            },
            TierConfig {
                name: "client".to_string(),
                ceiling_bytes: CLIENT_CEILING,
            },
        ],
        max_chunks_per_blob: 8,
        upload_concurrency: 2,
        download_concurrency: 3,
        retry: RetryConfig {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
        },
    }
}

/// Engine and the transport behind it.
pub struct TestDrive {
    pub engine: StorageEngine,
    pub transport: Arc<MemoryTransport>,
}

/// Build an engine over the given catalog.
pub fn drive_with(db: Database) -> TestDrive {
    let config = test_storage_config();
    let transport = Arc::new(MemoryTransport::new(&config.tiers));
    let engine = StorageEngine::from_config(&config, db, transport.clone()).unwrap();
    TestDrive { engine, transport }
}

/// Build an engine over a fresh in-memory catalog.
pub async fn setup_drive() -> TestDrive {
    drive_with(Database::open_in_memory().await.unwrap())
}

/// Deterministic test payload.
pub fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

/// Reference count of the blob behind a file node.
pub async fn ref_count_of(engine: &StorageEngine, blob_id: i64) -> i64 {
    chandrive::BlobStore::new(engine.database().pool())
        .get_by_id(blob_id)
        .await
        .unwrap()
        .unwrap()
        .ref_count
}
