//! Transfer service for Sealdrop.
//!
//! This module provides the transfer operations:
//! - Upload with recipient resolution, quota admission and rollback
//! - Proof-gated download with read-once deletion
//! - Bulk purge of an account's transfers
//! - Reconciliation of orphaned blobs and overdue records, once or periodically

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::admission::{Admission, AdmissionController, DiskMetrics};
use super::external::{Recipient, RecipientDirectory, TransferNotifier};
use super::repository::TransferRepository;
use super::scheduler::TransferScheduler;
use super::storage::{BlobReader, BlobStore};
use super::types::{
    Envelope, EnvelopeContent, Ownership, OwnershipClass, Proof, Transfer, TransferId,
    TransferKind, UserId,
};
use crate::config::Config;
use crate::datetime::{expiration_after, now_millis};
use crate::db::Database;
use crate::hashid::IdCodec;
use crate::Result;

/// Maximum overdue records removed per reconciliation pass.
const RECONCILE_BATCH: i64 = 500;

/// Upload failures visible to callers.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum UploadError {
    /// No such account, or its policy refuses this sender.
    #[error("recipient not found")]
    RecipientNotFound,
    /// Lifetime outside the allowed range.
    #[error("invalid requested lifetime hours")]
    InvalidRequestedLifetimeHours,
    /// Storage quota exhausted.
    #[error("out of space")]
    OutOfSpace,
    /// Malformed envelope or infrastructure failure; details are only logged.
    #[error("unknown error")]
    UnknownError,
}

/// Download failures visible to callers.
///
/// `NotFound` deliberately covers malformed ids, missing records, missing
/// blobs and recipient mismatches alike.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DownloadError {
    /// Nothing downloadable under this id for this requestor.
    #[error("not found")]
    NotFound,
    /// The presented proof does not match.
    #[error("invalid recipient proof")]
    InvalidRecipientProof,
    /// Infrastructure failure; details are only logged.
    #[error("unknown error")]
    UnknownError,
}

/// An upload in flight.
pub struct UploadRequest<R> {
    /// Sending account, if signed in.
    pub sender: Option<UserId>,
    /// Username of a fixed recipient, if any.
    pub recipient_username: Option<String>,
    /// Unencrypted envelope.
    pub envelope: Envelope,
    /// Declared ciphertext length.
    pub ciphertext_len: u64,
    /// Ciphertext stream.
    pub ciphertext: R,
}

impl<R> UploadRequest<R> {
    /// Create an anonymous request with no fixed recipient.
    pub fn new(envelope: Envelope, ciphertext_len: u64, ciphertext: R) -> Self {
        Self {
            sender: None,
            recipient_username: None,
            envelope,
            ciphertext_len,
            ciphertext,
        }
    }

    /// Set the sending account.
    pub fn from_user(mut self, sender: UserId) -> Self {
        self.sender = Some(sender);
        self
    }

    /// Address the transfer to a recipient username.
    pub fn to_recipient(mut self, username: impl Into<String>) -> Self {
        self.recipient_username = Some(username.into());
        self
    }
}

/// Successful upload result.
#[derive(Debug, Clone)]
pub struct UploadReceipt {
    /// Encoded transfer id.
    pub id: String,
    /// Scheduled deletion time.
    pub expiration: DateTime<Utc>,
    /// Ownership classification.
    pub ownership: OwnershipClass,
    /// Proof the downloader must present (echoes a caller-chosen proof).
    pub proof: Proof,
}

/// Envelope data of a transfer, as returned to an authorized viewer.
#[derive(Debug, Clone)]
pub struct TransferInfo {
    pub kind: TransferKind,
    pub size_bytes: i64,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub subject: Option<String>,
    pub public_key: Vec<u8>,
    pub key_exchange_nonce: Option<Vec<u8>>,
    pub expiration: DateTime<Utc>,
    pub ownership: OwnershipClass,
}

impl TransferInfo {
    fn from_transfer(transfer: &Transfer) -> Self {
        Self {
            kind: transfer.kind,
            size_bytes: transfer.size_bytes,
            filename: transfer.filename.clone(),
            content_type: transfer.content_type.clone(),
            subject: transfer.subject.clone(),
            public_key: transfer.public_key.clone(),
            key_exchange_nonce: transfer.key_exchange_nonce.clone(),
            expiration: transfer.expires_at,
            ownership: transfer.ownership_class(),
        }
    }
}

/// Ciphertext stream handed back by a successful download.
#[derive(Debug)]
pub struct DownloadHandle {
    /// Ciphertext reader. For read-once transfers the blob is already gone
    /// from the store by the time this is returned.
    pub reader: BlobReader,
    /// Envelope of the transfer being read.
    pub info: TransferInfo,
    /// Whether this read consumed the transfer.
    pub delete_on_read_completion: bool,
}

/// Result of a reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReconcileReport {
    /// Blobs without a metadata record that were removed.
    pub orphaned_blobs_removed: usize,
    /// Expired records whose deletion job never ran.
    pub expired_transfers_removed: usize,
}

/// Transfer lifecycle service.
#[derive(Clone)]
pub struct TransferService {
    db: Database,
    store: BlobStore,
    codec: IdCodec,
    admission: AdmissionController,
    scheduler: TransferScheduler,
    directory: Arc<dyn RecipientDirectory>,
    notifier: Arc<dyn TransferNotifier>,
    min_lifetime_hours: i64,
    max_lifetime_hours: i64,
    orphan_grace: Duration,
}

impl TransferService {
    /// Create a service from configuration.
    pub fn new(
        config: &Config,
        db: Database,
        store: BlobStore,
        directory: Arc<dyn RecipientDirectory>,
        notifier: Arc<dyn TransferNotifier>,
    ) -> Self {
        let admission = AdmissionController::new(db.clone(), config.storage.quota_bytes());
        let scheduler = TransferScheduler::new(db.clone(), store.clone());

        Self {
            db,
            store,
            codec: IdCodec::new(&config.ids.salt),
            admission,
            scheduler,
            directory,
            notifier,
            min_lifetime_hours: config.transfers.min_lifetime_hours,
            max_lifetime_hours: config.transfers.max_lifetime_hours,
            orphan_grace: Duration::from_secs(config.reaper.orphan_grace_secs),
        }
    }

    /// The id codec in use.
    pub fn codec(&self) -> &IdCodec {
        &self.codec
    }

    /// The deletion scheduler in use.
    pub fn scheduler(&self) -> &TransferScheduler {
        &self.scheduler
    }

    /// Upload an encrypted file.
    pub async fn upload_file<R>(
        &self,
        request: UploadRequest<R>,
    ) -> std::result::Result<UploadReceipt, UploadError>
    where
        R: AsyncRead + Unpin,
    {
        if request.envelope.kind() != TransferKind::File {
            debug!("Rejected file upload carrying a message envelope");
            return Err(UploadError::UnknownError);
        }
        self.upload(request).await
    }

    /// Upload an encrypted message.
    pub async fn upload_message<R>(
        &self,
        request: UploadRequest<R>,
    ) -> std::result::Result<UploadReceipt, UploadError>
    where
        R: AsyncRead + Unpin,
    {
        if request.envelope.kind() != TransferKind::Message {
            debug!("Rejected message upload carrying a file envelope");
            return Err(UploadError::UnknownError);
        }
        self.upload(request).await
    }

    /// Upload a transfer of the kind given by its envelope.
    ///
    /// Steps run strictly in order: recipient resolution, lifetime check,
    /// admission, blob write, then the metadata record and its expiry job in
    /// one transaction, then notification. Until that transaction commits the
    /// blob is removed on failure or when the future is dropped.
    pub async fn upload<R>(
        &self,
        request: UploadRequest<R>,
    ) -> std::result::Result<UploadReceipt, UploadError>
    where
        R: AsyncRead + Unpin,
    {
        let UploadRequest {
            sender,
            recipient_username,
            envelope,
            ciphertext_len,
            ciphertext,
        } = request;

        let recipient = match recipient_username {
            Some(username) => Some(self.resolve_recipient(sender, &username).await?),
            None => None,
        };

        let hours = envelope.lifetime_hours;
        if hours < self.min_lifetime_hours || hours > self.max_lifetime_hours {
            debug!("Rejected upload with lifetime {} hours", hours);
            return Err(UploadError::InvalidRequestedLifetimeHours);
        }

        if let Err(e) = envelope.validate() {
            warn!("Rejected malformed upload envelope: {}", e);
            return Err(UploadError::UnknownError);
        }

        let size_bytes = i64::try_from(ciphertext_len).map_err(|_| UploadError::OutOfSpace)?;
        match self.admission.reserve(size_bytes).await {
            Ok(Admission::Accepted(_)) => {}
            Ok(Admission::Rejected { requested, free }) => {
                info!(
                    "Rejected upload of {} bytes: only {} bytes free",
                    requested, free
                );
                return Err(UploadError::OutOfSpace);
            }
            Err(e) => {
                error!("Admission check failed: {}", e);
                return Err(UploadError::UnknownError);
            }
        }

        let recipient_id = recipient.map(|r| r.user_id);
        let id = TransferId::generate();
        let kind = envelope.kind();
        let ownership = Ownership::from_parties(sender, recipient_id);
        let class = ownership.class();
        let encoded = self.codec.encode(id);

        let blob = match self
            .store
            .save_pending(id, kind, class, ciphertext, ciphertext_len)
            .await
        {
            Ok(blob) => blob,
            Err(e) => {
                error!("Failed to store ciphertext for transfer {}: {}", encoded, e);
                return Err(UploadError::UnknownError);
            }
        };

        let created_at = Utc::now();
        let transfer = build_transfer(id, sender, recipient_id, size_bytes, envelope, created_at);

        if let Err(e) = self.scheduler.record_transfer(&transfer).await {
            error!("Failed to record transfer {}: {}", encoded, e);
            if let Err(e) = blob.discard().await {
                error!(
                    "Rollback failed: blob of transfer {} left without a record ({}); \
                     it will be removed by the next reconciliation pass",
                    encoded, e
                );
            }
            return Err(UploadError::UnknownError);
        }
        blob.commit();

        if let Some(Recipient {
            user_id,
            notify_on_transfer: true,
        }) = recipient
        {
            self.spawn_notification(user_id);
        }

        info!(
            "Stored {} transfer {} ({} bytes, {:?}, expires {})",
            kind.as_str(),
            encoded,
            size_bytes,
            ownership,
            transfer.expires_at
        );

        Ok(UploadReceipt {
            id: encoded,
            expiration: transfer.expires_at,
            ownership: class,
            proof: transfer.proof,
        })
    }

    async fn resolve_recipient(
        &self,
        sender: Option<UserId>,
        username: &str,
    ) -> std::result::Result<Recipient, UploadError> {
        match self.directory.resolve_recipient(sender, username).await {
            Ok(Some(recipient)) => Ok(recipient),
            Ok(None) => {
                debug!("Recipient could not be resolved");
                Err(UploadError::RecipientNotFound)
            }
            Err(e) => {
                error!("Recipient lookup failed: {}", e);
                Err(UploadError::UnknownError)
            }
        }
    }

    fn spawn_notification(&self, user_id: UserId) {
        let notifier = Arc::clone(&self.notifier);
        tokio::spawn(async move {
            if let Err(e) = notifier.notify(user_id).await {
                warn!("Failed to notify user {} of new transfer: {}", user_id, e);
            }
        });
    }

    /// Download a transfer's ciphertext.
    ///
    /// The proof is checked before the blob is opened. A transfer without a
    /// fixed recipient is consumed by the first successful download.
    pub async fn download(
        &self,
        encoded_id: &str,
        proof: &[u8],
        requestor: Option<UserId>,
    ) -> std::result::Result<DownloadHandle, DownloadError> {
        let transfer = self.find_visible(encoded_id, requestor).await?;
        let class = transfer.ownership_class();

        if !self.store.exists(transfer.id, transfer.kind, class).await {
            warn!("Transfer {} has a record but no blob", encoded_id);
            return Err(DownloadError::NotFound);
        }

        if !transfer.proof.matches(proof) {
            info!("Rejected download of transfer {}: proof mismatch", encoded_id);
            return Err(DownloadError::InvalidRecipientProof);
        }

        let delete_on_read_completion = transfer.is_read_once();
        let reader = match self
            .store
            .open(transfer.id, transfer.kind, class, delete_on_read_completion)
            .await
        {
            Ok(Some(reader)) => reader,
            // Lost a race with another read-once download.
            Ok(None) => return Err(DownloadError::NotFound),
            Err(e) => {
                error!("Failed to open blob of transfer {}: {}", encoded_id, e);
                return Err(DownloadError::UnknownError);
            }
        };

        if delete_on_read_completion {
            if let Err(e) = self
                .scheduler
                .delete_now(transfer.id, transfer.kind, class)
                .await
            {
                // The expiry job still removes the record later.
                warn!(
                    "Failed to queue deletion of consumed transfer {}: {}",
                    encoded_id, e
                );
            }
            info!("Transfer {} consumed by download", encoded_id);
        } else {
            debug!("Transfer {} read by its recipient", encoded_id);
        }

        Ok(DownloadHandle {
            reader,
            info: TransferInfo::from_transfer(&transfer),
            delete_on_read_completion,
        })
    }

    /// Envelope of a transfer, under the same visibility rules as download.
    ///
    /// Does not check the proof and never consumes the transfer.
    pub async fn transfer_info(
        &self,
        encoded_id: &str,
        requestor: Option<UserId>,
    ) -> std::result::Result<TransferInfo, DownloadError> {
        let transfer = self.find_visible(encoded_id, requestor).await?;

        if !self
            .store
            .exists(transfer.id, transfer.kind, transfer.ownership_class())
            .await
        {
            return Err(DownloadError::NotFound);
        }

        Ok(TransferInfo::from_transfer(&transfer))
    }

    async fn find_visible(
        &self,
        encoded_id: &str,
        requestor: Option<UserId>,
    ) -> std::result::Result<Transfer, DownloadError> {
        let Ok(id) = self.codec.decode(encoded_id) else {
            debug!("Lookup with undecodable id");
            return Err(DownloadError::NotFound);
        };

        let transfer = match TransferRepository::new(self.db.pool())
            .get_for_requestor(id, requestor)
            .await
        {
            Ok(Some(transfer)) => transfer,
            Ok(None) => return Err(DownloadError::NotFound),
            Err(e) => {
                error!("Failed to look up transfer {}: {}", encoded_id, e);
                return Err(DownloadError::UnknownError);
            }
        };

        if transfer.is_expired_at(&Utc::now()) {
            debug!("Transfer {} is past expiry awaiting deletion", encoded_id);
            return Err(DownloadError::NotFound);
        }

        Ok(transfer)
    }

    /// Quota usage snapshot.
    pub async fn disk_metrics(&self) -> Result<DiskMetrics> {
        self.admission.metrics().await
    }

    /// Delete every transfer sent by or addressed to `user_id`.
    ///
    /// Used by account deletion and recovery. Returns the number of records
    /// removed.
    pub async fn purge_user_transfers(&self, user_id: UserId) -> Result<usize> {
        let transfers = TransferRepository::new(self.db.pool())
            .list_by_user(user_id)
            .await?;

        let mut removed = 0;
        for transfer in &transfers {
            let outcome = self
                .scheduler
                .delete_inline(transfer.id, transfer.kind, transfer.ownership_class())
                .await?;
            if outcome.record_removed {
                removed += 1;
            }
        }

        info!("Purged {} transfer(s) of user {}", removed, user_id);
        Ok(removed)
    }

    /// Remove orphaned blobs and overdue records.
    ///
    /// A blob is orphaned when no record references it and it is older than
    /// the configured grace period, which keeps in-flight uploads safe.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let repo = TransferRepository::new(self.db.pool());

        let cutoff = SystemTime::now()
            .checked_sub(self.orphan_grace)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        for blob in self.store.list_blobs().await? {
            if blob.modified > cutoff || repo.exists(blob.id).await? {
                continue;
            }
            if self.store.delete(blob.id, blob.kind, blob.class).await? {
                warn!("Removed orphaned blob {}", self.codec.encode(blob.id));
                report.orphaned_blobs_removed += 1;
            }
        }

        for transfer in repo.list_expired(now_millis(), RECONCILE_BATCH).await? {
            let outcome = self
                .scheduler
                .delete_inline(transfer.id, transfer.kind, transfer.ownership_class())
                .await?;
            if outcome.record_removed {
                report.expired_transfers_removed += 1;
            }
        }

        self.store.cleanup_empty_dirs(self.orphan_grace).await?;

        if report != ReconcileReport::default() {
            info!(
                "Reconciliation removed {} orphaned blob(s) and {} overdue transfer(s)",
                report.orphaned_blobs_removed, report.expired_transfers_removed
            );
        }
        Ok(report)
    }
}

/// Spawn a task running [`TransferService::reconcile`] every `period`.
///
/// The first pass runs immediately.
pub fn start_reaper(service: TransferService, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Reaper started (interval: {} seconds)", period.as_secs());
        let mut timer = interval(period.max(Duration::from_secs(1)));
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            timer.tick().await;
            if let Err(e) = service.reconcile().await {
                warn!("Reconciliation failed: {}", e);
            }
        }
    })
}

fn build_transfer(
    id: TransferId,
    sender_id: Option<UserId>,
    recipient_id: Option<UserId>,
    size_bytes: i64,
    envelope: Envelope,
    created_at: DateTime<Utc>,
) -> Transfer {
    let kind = envelope.kind();
    let (filename, content_type, subject) = match envelope.content {
        EnvelopeContent::File {
            filename,
            content_type,
        } => (Some(filename), Some(content_type), None),
        EnvelopeContent::Message { subject } => (None, None, Some(subject)),
    };

    Transfer {
        id,
        kind,
        sender_id,
        recipient_id,
        size_bytes,
        filename,
        content_type,
        subject,
        public_key: envelope.public_key,
        key_exchange_nonce: envelope.key_exchange_nonce,
        proof: envelope.proof.unwrap_or_else(Proof::generate),
        created_at,
        expires_at: expiration_after(&created_at, envelope.lifetime_hours),
    }
}
