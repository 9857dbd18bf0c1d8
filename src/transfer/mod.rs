//! Transfer lifecycle for Sealdrop.
//!
//! This module provides:
//! - Ciphertext blob storage with atomic writes and self-deleting reads
//! - Transfer metadata persistence
//! - Quota admission control
//! - Durable deletion scheduling with a background worker
//! - The upload and download service tying these together

mod admission;
mod external;
mod repository;
mod scheduler;
mod service;
mod storage;
mod types;

pub use admission::{Admission, AdmissionController, DiskMetrics};
pub use external::{LogNotifier, Recipient, RecipientDirectory, StaticDirectory, TransferNotifier};
pub use repository::TransferRepository;
pub use scheduler::{
    delete_transfer, start_deletion_worker, DeletionJob, DeletionJobRepository, DeletionOutcome,
    DeletionWorker, TransferScheduler,
};
pub use service::{
    start_reaper, DownloadError, DownloadHandle, ReconcileReport, TransferInfo, TransferService, UploadError,
    UploadReceipt, UploadRequest,
};
pub use storage::{BlobReader, BlobStore, PendingBlob, StoredBlob};
pub use types::{
    Envelope, EnvelopeContent, Ownership, OwnershipClass, Proof, Transfer, TransferId,
    TransferKind, UserId,
};

/// Shortest lifetime a sender may request, in hours.
pub const MIN_LIFETIME_HOURS: i64 = 1;

/// Longest lifetime a sender may request, in hours.
pub const MAX_LIFETIME_HOURS: i64 = 24;

/// Maximum filename length (in characters).
pub const MAX_FILENAME_LENGTH: usize = 255;

/// Maximum content type length (in characters).
pub const MAX_CONTENT_TYPE_LENGTH: usize = 255;

/// Maximum message subject length (in characters).
pub const MAX_SUBJECT_LENGTH: usize = 1000;

/// Length of server-generated proofs, in bytes.
pub const PROOF_LENGTH: usize = 32;
