//! Transfer deletion scheduling.
//!
//! Every deletion, whether triggered by expiry or by a read-once download, is
//! a row in `deletion_jobs` so that a restart never loses one. The
//! [`DeletionWorker`] polls for due rows and runs [`delete_transfer`], which
//! is idempotent: a job firing for a transfer that is already gone succeeds
//! silently. Jobs that fail for other reasons are retried with linear
//! backoff until `max_attempts`, after which they are parked for operators.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{Executor, Sqlite};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::repository::{insert_transfer, TransferRepository};
use super::storage::BlobStore;
use super::types::{OwnershipClass, Transfer, TransferId, TransferKind};
use crate::config::SchedulerConfig;
use crate::datetime::{now_millis, to_millis};
use crate::db::{Database, DbPool};
use crate::{Result, SealdropError};

/// What a deletion actually removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeletionOutcome {
    pub record_removed: bool,
    pub blob_removed: bool,
}

/// Remove a transfer's metadata record and blob.
///
/// Either part being already absent is not an error.
pub async fn delete_transfer(
    db: &Database,
    store: &BlobStore,
    id: TransferId,
    kind: TransferKind,
    class: OwnershipClass,
) -> Result<DeletionOutcome> {
    let record_removed = TransferRepository::new(db.pool()).delete(id).await?;
    let blob_removed = store.delete(id, kind, class).await?;

    Ok(DeletionOutcome {
        record_removed,
        blob_removed,
    })
}

/// A persisted deletion job.
#[derive(Debug, Clone)]
pub struct DeletionJob {
    pub id: i64,
    pub transfer_id: TransferId,
    pub kind: TransferKind,
    pub ownership: OwnershipClass,
    pub run_at: i64,
    pub attempts: i64,
    pub last_error: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct DeletionJobRow {
    id: i64,
    transfer_id: String,
    kind: String,
    ownership: String,
    run_at: i64,
    attempts: i64,
    last_error: Option<String>,
}

impl DeletionJobRow {
    fn into_job(self) -> Result<DeletionJob> {
        let kind = TransferKind::from_str(&self.kind).ok_or_else(|| {
            SealdropError::Scheduler(format!("job {} has unknown kind {:?}", self.id, self.kind))
        })?;
        let ownership = OwnershipClass::from_str(&self.ownership).ok_or_else(|| {
            SealdropError::Scheduler(format!(
                "job {} has unknown ownership {:?}",
                self.id, self.ownership
            ))
        })?;

        Ok(DeletionJob {
            id: self.id,
            transfer_id: self.transfer_id.parse()?,
            kind,
            ownership,
            run_at: self.run_at,
            attempts: self.attempts,
            last_error: self.last_error,
        })
    }
}

/// Repository for the `deletion_jobs` queue.
pub struct DeletionJobRepository<'a> {
    pool: &'a DbPool,
}

impl<'a> DeletionJobRepository<'a> {
    /// Create a new DeletionJobRepository with the given database pool reference.
    pub fn new(pool: &'a DbPool) -> Self {
        Self { pool }
    }

    /// Persist a job due at `run_at` (unix millis). Returns the job id.
    pub async fn enqueue(
        &self,
        transfer_id: TransferId,
        kind: TransferKind,
        ownership: OwnershipClass,
        run_at: i64,
    ) -> Result<i64> {
        enqueue_job(self.pool, transfer_id, kind, ownership, run_at).await
    }

    /// Jobs due at `now` that have not exhausted their attempts, oldest first.
    ///
    /// Rows that cannot be decoded are parked on the spot so they neither
    /// block the queue nor come back on the next poll.
    pub async fn list_due(&self, now: i64, max_attempts: i64, limit: i64) -> Result<Vec<DeletionJob>> {
        let rows: Vec<DeletionJobRow> = sqlx::query_as(
            "SELECT id, transfer_id, kind, ownership, run_at, attempts, last_error
             FROM deletion_jobs
             WHERE run_at <= $1 AND attempts < $2
             ORDER BY run_at, id
             LIMIT $3",
        )
        .bind(now)
        .bind(max_attempts)
        .bind(limit)
        .fetch_all(self.pool)
        .await?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            let job_id = row.id;
            match row.into_job() {
                Ok(job) => jobs.push(job),
                Err(e) => {
                    error!("Parking malformed deletion job {}: {}", job_id, e);
                    self.park(job_id, &e.to_string(), max_attempts).await?;
                }
            }
        }

        Ok(jobs)
    }

    /// Mark a job as exhausted so the worker no longer picks it up.
    pub async fn park(&self, job_id: i64, error: &str, max_attempts: i64) -> Result<()> {
        sqlx::query("UPDATE deletion_jobs SET attempts = $1, last_error = $2 WHERE id = $3")
            .bind(max_attempts)
            .bind(error)
            .bind(job_id)
            .execute(self.pool)
            .await?;
        Ok(())
    }

    /// Jobs targeting one transfer.
    pub async fn list_for_transfer(&self, transfer_id: TransferId) -> Result<Vec<DeletionJob>> {
        let rows: Vec<DeletionJobRow> = sqlx::query_as(
            "SELECT id, transfer_id, kind, ownership, run_at, attempts, last_error
             FROM deletion_jobs WHERE transfer_id = $1 ORDER BY run_at, id",
        )
        .bind(transfer_id.to_string())
        .fetch_all(self.pool)
        .await?;

        rows.into_iter().map(DeletionJobRow::into_job).collect()
    }

    /// Remove a finished job.
    pub async fn complete(&self, job_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM deletion_jobs WHERE id = $1")
            .bind(job_id)
            .execute(self.pool)
            .await?;
        Ok(())
    }

    /// Record a failed attempt and push the job to `next_run_at`.
    pub async fn record_failure(&self, job_id: i64, error: &str, next_run_at: i64) -> Result<()> {
        sqlx::query(
            "UPDATE deletion_jobs
             SET attempts = attempts + 1, last_error = $1, run_at = $2
             WHERE id = $3",
        )
        .bind(error)
        .bind(next_run_at)
        .bind(job_id)
        .execute(self.pool)
        .await?;
        Ok(())
    }

    /// Number of jobs still queued, parked ones included.
    pub async fn count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM deletion_jobs")
            .fetch_one(self.pool)
            .await?;
        Ok(count)
    }

    /// Jobs that exhausted their attempts.
    pub async fn count_parked(&self, max_attempts: i64) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM deletion_jobs WHERE attempts >= $1")
                .bind(max_attempts)
                .fetch_one(self.pool)
                .await?;
        Ok(count)
    }
}

/// Insert a deletion job on any executor, such as an open transaction.
async fn enqueue_job<'e, E>(
    executor: E,
    transfer_id: TransferId,
    kind: TransferKind,
    ownership: OwnershipClass,
    run_at: i64,
) -> Result<i64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO deletion_jobs (transfer_id, kind, ownership, run_at, created_at)
         VALUES ($1, $2, $3, $4, $5) RETURNING id",
    )
    .bind(transfer_id.to_string())
    .bind(kind.as_str())
    .bind(ownership.as_str())
    .bind(run_at)
    .bind(now_millis())
    .fetch_one(executor)
    .await?;

    Ok(id)
}

/// Entry point for scheduling deletions.
#[derive(Debug, Clone)]
pub struct TransferScheduler {
    db: Database,
    store: BlobStore,
    wake: Arc<Notify>,
}

impl TransferScheduler {
    /// Create a scheduler over the given database and blob store.
    pub fn new(db: Database, store: BlobStore) -> Self {
        Self {
            db,
            store,
            wake: Arc::new(Notify::new()),
        }
    }

    /// Write a new transfer's record together with its expiry job.
    ///
    /// Both rows commit in one transaction, so a record never exists without
    /// the job that deletes it.
    pub async fn record_transfer(&self, transfer: &Transfer) -> Result<()> {
        let mut tx = self.db.pool().begin().await?;

        insert_transfer(&mut *tx, transfer).await?;
        let job_id = enqueue_job(
            &mut *tx,
            transfer.id,
            transfer.kind,
            transfer.ownership_class(),
            to_millis(&transfer.expires_at),
        )
        .await?;

        tx.commit().await?;
        debug!(
            "Recorded transfer {} with deletion job {} at {}",
            transfer.id, job_id, transfer.expires_at
        );
        Ok(())
    }

    /// Persist a deletion job firing at `at`.
    pub async fn schedule_expiration(
        &self,
        id: TransferId,
        kind: TransferKind,
        class: OwnershipClass,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let job_id = DeletionJobRepository::new(self.db.pool())
            .enqueue(id, kind, class, to_millis(&at))
            .await?;
        debug!("Scheduled deletion job {} for transfer {} at {}", job_id, id, at);
        Ok(())
    }

    /// Persist a deletion job due immediately and wake the worker.
    pub async fn delete_now(
        &self,
        id: TransferId,
        kind: TransferKind,
        class: OwnershipClass,
    ) -> Result<()> {
        let job_id = DeletionJobRepository::new(self.db.pool())
            .enqueue(id, kind, class, now_millis())
            .await?;
        debug!("Queued immediate deletion job {} for transfer {}", job_id, id);
        self.wake.notify_one();
        Ok(())
    }

    /// Run the deletion routine inline, bypassing the queue.
    pub async fn delete_inline(
        &self,
        id: TransferId,
        kind: TransferKind,
        class: OwnershipClass,
    ) -> Result<DeletionOutcome> {
        delete_transfer(&self.db, &self.store, id, kind, class).await
    }

    /// Build a worker draining this scheduler's queue.
    pub fn worker(&self, config: &SchedulerConfig) -> DeletionWorker {
        DeletionWorker {
            db: self.db.clone(),
            store: self.store.clone(),
            wake: Arc::clone(&self.wake),
            poll_interval: Duration::from_secs(config.poll_interval_secs.max(1)),
            retry_backoff_millis: (config.retry_backoff_secs as i64).saturating_mul(1000),
            max_attempts: config.max_attempts,
            batch_size: config.batch_size,
        }
    }
}

/// Background worker running due deletion jobs.
pub struct DeletionWorker {
    db: Database,
    store: BlobStore,
    wake: Arc<Notify>,
    poll_interval: Duration,
    retry_backoff_millis: i64,
    max_attempts: i64,
    batch_size: i64,
}

impl DeletionWorker {
    /// Run the worker loop forever.
    ///
    /// Wakes on the poll interval or when an immediate deletion is queued.
    pub async fn run(&self) {
        info!(
            "Deletion worker started (poll interval: {} seconds)",
            self.poll_interval.as_secs()
        );

        let mut timer = interval(self.poll_interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = timer.tick() => {}
                _ = self.wake.notified() => {}
            }

            // Drain full batches before sleeping again.
            loop {
                match self.run_due_jobs().await {
                    Ok(processed) if processed as i64 >= self.batch_size => continue,
                    Ok(_) => break,
                    Err(e) => {
                        error!("Failed to poll deletion jobs: {}", e);
                        break;
                    }
                }
            }
        }
    }

    /// Run every job due now, up to one batch. Returns the number processed.
    pub async fn run_due_jobs(&self) -> Result<usize> {
        let jobs = DeletionJobRepository::new(self.db.pool())
            .list_due(now_millis(), self.max_attempts, self.batch_size)
            .await?;

        if jobs.is_empty() {
            debug!("No deletion jobs due");
            return Ok(0);
        }

        debug!("Running {} deletion job(s)", jobs.len());
        for job in &jobs {
            self.run_job(job).await;
        }

        Ok(jobs.len())
    }

    async fn run_job(&self, job: &DeletionJob) {
        let repo = DeletionJobRepository::new(self.db.pool());

        match delete_transfer(&self.db, &self.store, job.transfer_id, job.kind, job.ownership).await
        {
            Ok(outcome) => {
                if outcome.record_removed || outcome.blob_removed {
                    info!(
                        "Deleted transfer {} (record: {}, blob: {})",
                        job.transfer_id, outcome.record_removed, outcome.blob_removed
                    );
                } else {
                    debug!("Transfer {} already deleted", job.transfer_id);
                }
                if let Err(e) = repo.complete(job.id).await {
                    // The job will run again; deletion is idempotent.
                    error!("Failed to complete deletion job {}: {}", job.id, e);
                }
            }
            Err(e) => {
                let attempts = job.attempts + 1;
                let next_run_at = now_millis() + self.retry_backoff_millis.saturating_mul(attempts);

                if attempts >= self.max_attempts {
                    error!(
                        "Deletion job {} for transfer {} parked after {} attempts: {}",
                        job.id, job.transfer_id, attempts, e
                    );
                } else {
                    warn!(
                        "Deletion job {} for transfer {} failed (attempt {}): {}",
                        job.id, job.transfer_id, attempts, e
                    );
                }

                if let Err(err) = repo.record_failure(job.id, &e.to_string(), next_run_at).await {
                    error!("Failed to record failure for deletion job {}: {}", job.id, err);
                }
            }
        }
    }
}

/// Spawn the deletion worker on the current runtime.
pub fn start_deletion_worker(worker: DeletionWorker) -> JoinHandle<()> {
    tokio::spawn(async move {
        worker.run().await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datetime::expiration_after;
    use crate::transfer::Proof;
    use chrono::Duration as ChronoDuration;
    use tempfile::TempDir;

    struct Fixture {
        _temp_dir: TempDir,
        db: Database,
        store: BlobStore,
        scheduler: TransferScheduler,
    }

    async fn setup() -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::open_in_memory().await.unwrap();
        let store = BlobStore::new(temp_dir.path()).unwrap();
        let scheduler = TransferScheduler::new(db.clone(), store.clone());
        Fixture {
            _temp_dir: temp_dir,
            db,
            store,
            scheduler,
        }
    }

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            poll_interval_secs: 1,
            retry_backoff_secs: 0,
            max_attempts: 2,
            batch_size: 10,
        }
    }

    async fn stored_transfer(fx: &Fixture) -> Transfer {
        let created_at = Utc::now();
        let transfer = Transfer {
            id: TransferId::generate(),
            kind: TransferKind::Message,
            sender_id: None,
            recipient_id: None,
            size_bytes: 4,
            filename: None,
            content_type: None,
            subject: Some("s".into()),
            public_key: vec![1],
            key_exchange_nonce: None,
            proof: Proof::generate(),
            created_at,
            expires_at: expiration_after(&created_at, 1),
        };
        fx.store
            .save(
                transfer.id,
                transfer.kind,
                transfer.ownership_class(),
                &b"data"[..],
                4,
            )
            .await
            .unwrap();
        TransferRepository::new(fx.db.pool())
            .insert(&transfer)
            .await
            .unwrap();
        transfer
    }

    #[tokio::test]
    async fn test_delete_transfer_is_idempotent() {
        let fx = setup().await;
        let t = stored_transfer(&fx).await;

        let first = delete_transfer(&fx.db, &fx.store, t.id, t.kind, t.ownership_class())
            .await
            .unwrap();
        assert_eq!(
            first,
            DeletionOutcome {
                record_removed: true,
                blob_removed: true
            }
        );

        let second = delete_transfer(&fx.db, &fx.store, t.id, t.kind, t.ownership_class())
            .await
            .unwrap();
        assert_eq!(second, DeletionOutcome::default());
    }

    #[tokio::test]
    async fn test_future_job_not_run_early() {
        let fx = setup().await;
        let t = stored_transfer(&fx).await;
        fx.scheduler
            .schedule_expiration(t.id, t.kind, t.ownership_class(), t.expires_at)
            .await
            .unwrap();

        let worker = fx.scheduler.worker(&config());
        assert_eq!(worker.run_due_jobs().await.unwrap(), 0);

        let repo = TransferRepository::new(fx.db.pool());
        assert!(repo.exists(t.id).await.unwrap());
        assert_eq!(DeletionJobRepository::new(fx.db.pool()).count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_due_expiration_job_deletes() {
        let fx = setup().await;
        let t = stored_transfer(&fx).await;
        fx.scheduler
            .schedule_expiration(
                t.id,
                t.kind,
                t.ownership_class(),
                Utc::now() - ChronoDuration::seconds(1),
            )
            .await
            .unwrap();

        let worker = fx.scheduler.worker(&config());
        assert_eq!(worker.run_due_jobs().await.unwrap(), 1);

        assert!(!TransferRepository::new(fx.db.pool()).exists(t.id).await.unwrap());
        assert!(!fx.store.exists(t.id, t.kind, t.ownership_class()).await);
        assert_eq!(DeletionJobRepository::new(fx.db.pool()).count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_jobs_are_harmless() {
        let fx = setup().await;
        let t = stored_transfer(&fx).await;
        fx.scheduler
            .delete_now(t.id, t.kind, t.ownership_class())
            .await
            .unwrap();
        fx.scheduler
            .schedule_expiration(
                t.id,
                t.kind,
                t.ownership_class(),
                Utc::now() - ChronoDuration::seconds(1),
            )
            .await
            .unwrap();

        let worker = fx.scheduler.worker(&config());
        assert_eq!(worker.run_due_jobs().await.unwrap(), 2);

        let jobs = DeletionJobRepository::new(fx.db.pool());
        assert_eq!(jobs.count().await.unwrap(), 0);
        assert!(jobs.list_for_transfer(t.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failing_job_is_retried_then_parked() {
        let fx = setup().await;
        let t = stored_transfer(&fx).await;

        // Replace the blob with a non-empty directory so removal fails.
        let path = fx.store.blob_path(t.id, t.kind, t.ownership_class());
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir_all(path.join("stuck")).unwrap();

        fx.scheduler
            .delete_now(t.id, t.kind, t.ownership_class())
            .await
            .unwrap();
        let worker = fx.scheduler.worker(&config());
        let jobs = DeletionJobRepository::new(fx.db.pool());

        assert_eq!(worker.run_due_jobs().await.unwrap(), 1);
        let pending = jobs.list_for_transfer(t.id).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts, 1);
        assert!(pending[0].last_error.is_some());

        assert_eq!(worker.run_due_jobs().await.unwrap(), 1);
        // max_attempts reached: parked, not picked up again
        assert_eq!(worker.run_due_jobs().await.unwrap(), 0);
        assert_eq!(jobs.count_parked(2).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_jobs_survive_restart() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("sealdrop.db");
        let store = BlobStore::new(temp_dir.path().join("blobs")).unwrap();
        let id = TransferId::generate();

        {
            let db = Database::open(&db_path).await.unwrap();
            TransferScheduler::new(db.clone(), store.clone())
                .schedule_expiration(id, TransferKind::File, OwnershipClass::User, Utc::now())
                .await
                .unwrap();
            db.close().await;
        }

        let db = Database::open(&db_path).await.unwrap();
        let jobs = DeletionJobRepository::new(db.pool())
            .list_for_transfer(id)
            .await
            .unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].kind, TransferKind::File);
        assert_eq!(jobs[0].ownership, OwnershipClass::User);

        let worker = TransferScheduler::new(db.clone(), store).worker(&config());
        assert_eq!(worker.run_due_jobs().await.unwrap(), 1);
        db.close().await;
    }

    #[tokio::test]
    async fn test_running_worker_wakes_on_delete_now() {
        let fx = setup().await;
        let t = stored_transfer(&fx).await;
        let mut cfg = config();
        cfg.poll_interval_secs = 3600;
        let handle = start_deletion_worker(fx.scheduler.worker(&cfg));

        fx.scheduler
            .delete_now(t.id, t.kind, t.ownership_class())
            .await
            .unwrap();

        let repo = TransferRepository::new(fx.db.pool());
        let mut deleted = false;
        for _ in 0..50 {
            if !repo.exists(t.id).await.unwrap() {
                deleted = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        handle.abort();

        assert!(deleted);
    }

    fn unsaved_transfer() -> Transfer {
        let created_at = Utc::now();
        Transfer {
            id: TransferId::generate(),
            kind: TransferKind::File,
            sender_id: Some(1),
            recipient_id: Some(2),
            size_bytes: 1,
            filename: Some("f.bin".into()),
            content_type: Some("application/octet-stream".into()),
            subject: None,
            public_key: vec![1],
            key_exchange_nonce: None,
            proof: Proof::generate(),
            created_at,
            expires_at: expiration_after(&created_at, 2),
        }
    }

    #[tokio::test]
    async fn test_record_transfer_writes_record_and_job() {
        let fx = setup().await;
        let t = unsaved_transfer();

        fx.scheduler.record_transfer(&t).await.unwrap();

        assert!(TransferRepository::new(fx.db.pool()).exists(t.id).await.unwrap());
        let jobs = DeletionJobRepository::new(fx.db.pool())
            .list_for_transfer(t.id)
            .await
            .unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].run_at, to_millis(&t.expires_at));
        assert_eq!(jobs[0].ownership, OwnershipClass::User);
    }

    #[tokio::test]
    async fn test_record_transfer_is_atomic() {
        let fx = setup().await;
        sqlx::query("DROP TABLE deletion_jobs")
            .execute(fx.db.pool())
            .await
            .unwrap();
        let t = unsaved_transfer();

        assert!(fx.scheduler.record_transfer(&t).await.is_err());
        assert!(!TransferRepository::new(fx.db.pool()).exists(t.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_malformed_job_is_parked_without_blocking_queue() {
        let fx = setup().await;
        let t = stored_transfer(&fx).await;
        sqlx::query(
            "INSERT INTO deletion_jobs (transfer_id, kind, ownership, run_at, created_at)
             VALUES ('not-a-uuid', 'bogus', 'user', 0, 0)",
        )
        .execute(fx.db.pool())
        .await
        .unwrap();
        fx.scheduler
            .delete_now(t.id, t.kind, t.ownership_class())
            .await
            .unwrap();

        let worker = fx.scheduler.worker(&config());
        assert_eq!(worker.run_due_jobs().await.unwrap(), 1);
        assert!(!TransferRepository::new(fx.db.pool()).exists(t.id).await.unwrap());

        let jobs = DeletionJobRepository::new(fx.db.pool());
        assert_eq!(jobs.count_parked(config().max_attempts).await.unwrap(), 1);
        assert_eq!(worker.run_due_jobs().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_inline() {
        let fx = setup().await;
        let t = stored_transfer(&fx).await;

        let outcome = fx
            .scheduler
            .delete_inline(t.id, t.kind, t.ownership_class())
            .await
            .unwrap();

        assert!(outcome.record_removed);
        assert!(outcome.blob_removed);
    }
}
