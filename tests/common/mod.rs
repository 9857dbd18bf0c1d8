//! Test helpers for integration tests.
//!
//! Provides a TestEnv wiring a TransferService over a temporary blob
//! directory and an in-memory database.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::io::AsyncReadExt;

use sealdrop::transfer::{DownloadHandle, TransferRepository};
use sealdrop::{
    BlobStore, Config, Database, Envelope, StaticDirectory, TransferNotifier, TransferService,
    UploadRequest, UserId,
};

/// Account id of "alice", who accepts anonymous transfers.
pub const ALICE: UserId = 1;
/// Account id of "bob", who refuses anonymous transfers.
pub const BOB: UserId = 2;
/// Account id of "carol", who has no notifications enabled.
pub const CAROL: UserId = 3;

/// Notifier that records every notified user.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    notified: Mutex<Vec<UserId>>,
}

impl RecordingNotifier {
    /// Users notified so far.
    pub fn notified(&self) -> Vec<UserId> {
        self.notified.lock().unwrap().clone()
    }
}

#[async_trait]
impl TransferNotifier for RecordingNotifier {
    async fn notify(&self, user_id: UserId) -> sealdrop::Result<()> {
        self.notified.lock().unwrap().push(user_id);
        Ok(())
    }
}

/// A running service with its backing stores.
pub struct TestEnv {
    pub temp_dir: TempDir,
    pub config: Config,
    pub db: Database,
    pub store: BlobStore,
    pub notifier: Arc<RecordingNotifier>,
    pub service: TransferService,
}

impl TestEnv {
    /// Environment with a 1 MB quota.
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    /// Environment with the given configuration.
    pub async fn with_config(config: Config) -> Self {
        let db = Database::open_in_memory().await.unwrap();
        Self::assemble(TempDir::new().unwrap(), config, db)
    }

    /// Environment backed by a database file with a pool of connections.
    pub async fn with_file_db() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::open(temp_dir.path().join("sealdrop.db"))
            .await
            .unwrap();
        Self::assemble(temp_dir, test_config(), db)
    }

    fn assemble(temp_dir: TempDir, mut config: Config, db: Database) -> Self {
        config.storage.path = temp_dir.path().join("blobs").to_string_lossy().into_owned();

        let store = BlobStore::new(&config.storage.path).unwrap();

        let directory = StaticDirectory::new();
        directory.add_user("alice", ALICE, true, true);
        directory.add_user("bob", BOB, false, true);
        directory.add_user("carol", CAROL, true, false);

        let notifier = Arc::new(RecordingNotifier::default());
        let service = TransferService::new(
            &config,
            db.clone(),
            store.clone(),
            Arc::new(directory),
            notifier.clone(),
        );

        Self {
            temp_dir,
            config,
            db,
            store,
            notifier,
            service,
        }
    }

    /// Number of transfer records.
    pub async fn record_count(&self) -> i64 {
        TransferRepository::new(self.db.pool()).count().await.unwrap()
    }

    /// Number of blobs on disk.
    pub async fn blob_count(&self) -> usize {
        self.store.list_blobs().await.unwrap().len()
    }

    /// Assert that no blob lacks a record and no record lacks a deletion job.
    pub async fn assert_consistent(&self) {
        let repo = TransferRepository::new(self.db.pool());
        for blob in self.store.list_blobs().await.unwrap() {
            assert!(
                repo.exists(blob.id).await.unwrap(),
                "blob {} has no record",
                blob.id
            );
        }

        let unscheduled: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM transfers t
             WHERE NOT EXISTS (SELECT 1 FROM deletion_jobs j WHERE j.transfer_id = t.id)",
        )
        .fetch_one(self.db.pool())
        .await
        .unwrap();
        assert_eq!(unscheduled, 0, "transfer records without a deletion job");
    }
}

/// Configuration used by most tests.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.storage.quota_mb = 1;
    config.ids.salt = "integration-test-salt".to_string();
    config.scheduler.poll_interval_secs = 1;
    config.scheduler.retry_backoff_secs = 0;
    config
}

/// Message upload request over an in-memory body.
pub fn message_request(body: &[u8], proof: &[u8]) -> UploadRequest<&'static [u8]> {
    let body: &'static [u8] = Box::leak(body.to_vec().into_boxed_slice());
    UploadRequest::new(
        Envelope::message("subject", vec![0x42; 32]).with_proof(proof.to_vec()),
        body.len() as u64,
        body,
    )
}

/// File upload request over an in-memory body.
pub fn file_request(body: &[u8], proof: &[u8]) -> UploadRequest<&'static [u8]> {
    let body: &'static [u8] = Box::leak(body.to_vec().into_boxed_slice());
    UploadRequest::new(
        Envelope::file("payload.bin", "application/octet-stream", vec![0x42; 32])
            .with_proof(proof.to_vec()),
        body.len() as u64,
        body,
    )
}

/// Read a download to the end.
pub async fn read_to_end(handle: DownloadHandle) -> Vec<u8> {
    let mut reader = handle.reader;
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await.unwrap();
    buf
}

/// Poll `check` until it returns true or the timeout elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
