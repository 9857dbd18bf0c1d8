//! Sealdrop - storage and lifecycle backend for end-to-end encrypted transfers
//!
//! Clients encrypt files and messages before upload. Sealdrop stores the
//! ciphertext with its envelope, hands back an opaque id, gates downloads on
//! a recipient proof and guarantees every transfer is deleted at expiry or
//! on first read.

pub mod config;
pub mod datetime;
pub mod db;
pub mod error;
pub mod hashid;
pub mod logging;
pub mod transfer;

pub use config::Config;
pub use db::{Database, DbPool};
pub use error::{Result, SealdropError};
pub use hashid::{DecodeError, IdCodec};
pub use transfer::{
    BlobReader, BlobStore, DeletionWorker, DiskMetrics, DownloadError, DownloadHandle, Envelope,
    LogNotifier, OwnershipClass, Proof, RecipientDirectory, StaticDirectory, TransferId,
    TransferKind, TransferNotifier, TransferScheduler, TransferService, UploadError,
    UploadReceipt, UploadRequest, UserId,
};
