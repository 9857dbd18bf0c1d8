//! Storage quota admission control.
//!
//! The check runs before any ciphertext is written. It is advisory: two
//! uploads racing past it can briefly push usage over the quota, which is
//! tolerated because the quota is an operational limit and a global upload
//! lock would serialize every upload.

use super::repository::TransferRepository;
use crate::datetime::now_millis;
use crate::db::Database;
use crate::Result;

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The request fits; carries the admitted size.
    Accepted(i64),
    /// The request does not fit in the remaining space.
    Rejected { requested: i64, free: i64 },
}

impl Admission {
    /// Whether the request was accepted.
    pub fn is_accepted(&self) -> bool {
        matches!(self, Admission::Accepted(_))
    }
}

/// Snapshot of quota usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskMetrics {
    /// True when no further byte can be admitted.
    pub is_full: bool,
    /// Configured quota.
    pub quota_bytes: i64,
    /// Bytes held by live transfers.
    pub used_bytes: i64,
    /// Remaining bytes, never negative.
    pub free_bytes: i64,
}

/// Quota check against the aggregate size of live transfers.
#[derive(Debug, Clone)]
pub struct AdmissionController {
    db: Database,
    quota_bytes: i64,
}

impl AdmissionController {
    /// Create a controller enforcing `quota_bytes`.
    pub fn new(db: Database, quota_bytes: i64) -> Self {
        Self { db, quota_bytes }
    }

    /// Bytes held by transfers that have not expired.
    pub async fn current_usage_bytes(&self) -> Result<i64> {
        TransferRepository::new(self.db.pool())
            .live_size_bytes(now_millis())
            .await
    }

    /// Decide whether `requested` bytes fit.
    pub async fn reserve(&self, requested: i64) -> Result<Admission> {
        let free = self.free_bytes(self.current_usage_bytes().await?);

        if requested <= free {
            Ok(Admission::Accepted(requested))
        } else {
            Ok(Admission::Rejected { requested, free })
        }
    }

    /// Current quota usage.
    pub async fn metrics(&self) -> Result<DiskMetrics> {
        let used_bytes = self.current_usage_bytes().await?;
        let free_bytes = self.free_bytes(used_bytes);

        Ok(DiskMetrics {
            is_full: free_bytes == 0,
            quota_bytes: self.quota_bytes,
            used_bytes,
            free_bytes,
        })
    }

    fn free_bytes(&self, used: i64) -> i64 {
        self.quota_bytes.saturating_sub(used).max(0)
    }
}
