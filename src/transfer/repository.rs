//! Transfer metadata repository.
//!
//! This module persists transfer envelopes in the `transfers` table.

use sqlx::{Executor, Sqlite};

use super::types::{Transfer, TransferId, TransferRow, UserId};
use crate::db::DbPool;
use crate::Result;

const TRANSFER_COLUMNS: &str = "id, kind, sender_id, recipient_id, size_bytes, filename, \
     content_type, subject, public_key, key_exchange_nonce, proof, created_at, expires_at";

/// Repository for transfer metadata.
pub struct TransferRepository<'a> {
    pool: &'a DbPool,
}

impl<'a> TransferRepository<'a> {
    /// Create a new TransferRepository with the given database pool reference.
    pub fn new(pool: &'a DbPool) -> Self {
        Self { pool }
    }

    /// Insert a transfer record. The insert commits on return.
    pub async fn insert(&self, transfer: &Transfer) -> Result<()> {
        insert_transfer(self.pool, transfer).await
    }

    /// Get a transfer by ID regardless of recipient.
    pub async fn get_by_id(&self, id: TransferId) -> Result<Option<Transfer>> {
        let row: Option<TransferRow> = sqlx::query_as(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM transfers WHERE id = $1"
        ))
        .bind(id.to_string())
        .fetch_optional(self.pool)
        .await?;

        row.map(TransferRow::into_transfer).transpose()
    }

    /// Get a transfer visible to `requestor`.
    ///
    /// Transfers without a fixed recipient are visible to anyone holding the
    /// id; addressed transfers only to their recipient. Anything else is
    /// indistinguishable from a missing row.
    pub async fn get_for_requestor(
        &self,
        id: TransferId,
        requestor: Option<UserId>,
    ) -> Result<Option<Transfer>> {
        let row: Option<TransferRow> = sqlx::query_as(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM transfers
             WHERE id = $1 AND (recipient_id IS NULL OR recipient_id = $2)"
        ))
        .bind(id.to_string())
        .bind(requestor)
        .fetch_optional(self.pool)
        .await?;

        row.map(TransferRow::into_transfer).transpose()
    }

    /// Delete a transfer record. Returns `false` if it did not exist.
    pub async fn delete(&self, id: TransferId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM transfers WHERE id = $1")
            .bind(id.to_string())
            .execute(self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Sum of `size_bytes` over transfers not yet expired at `now_millis`.
    pub async fn live_size_bytes(&self, now_millis: i64) -> Result<i64> {
        let total: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(size_bytes), 0) FROM transfers WHERE expires_at > $1",
        )
        .bind(now_millis)
        .fetch_one(self.pool)
        .await?;

        Ok(total)
    }

    /// List every transfer sent by or addressed to a user.
    pub async fn list_by_user(&self, user_id: UserId) -> Result<Vec<Transfer>> {
        let rows: Vec<TransferRow> = sqlx::query_as(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM transfers
             WHERE sender_id = $1 OR recipient_id = $1
             ORDER BY created_at, id"
        ))
        .bind(user_id)
        .fetch_all(self.pool)
        .await?;

        rows.into_iter().map(TransferRow::into_transfer).collect()
    }

    /// List transfers whose expiration is at or before `now_millis`.
    pub async fn list_expired(&self, now_millis: i64, limit: i64) -> Result<Vec<Transfer>> {
        let rows: Vec<TransferRow> = sqlx::query_as(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM transfers
             WHERE expires_at <= $1
             ORDER BY expires_at
             LIMIT $2"
        ))
        .bind(now_millis)
        .bind(limit)
        .fetch_all(self.pool)
        .await?;

        rows.into_iter().map(TransferRow::into_transfer).collect()
    }

    /// Check whether a record exists for `id`.
    pub async fn exists(&self, id: TransferId) -> Result<bool> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM transfers WHERE id = $1)")
            .bind(id.to_string())
            .fetch_one(self.pool)
            .await?;

        Ok(exists)
    }

    /// Count all transfer records.
    pub async fn count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM transfers")
            .fetch_one(self.pool)
            .await?;

        Ok(count)
    }
}

/// Insert a transfer record on any executor, such as an open transaction.
pub(crate) async fn insert_transfer<'e, E>(executor: E, transfer: &Transfer) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = TransferRow::from_transfer(transfer);
    sqlx::query(&format!(
        "INSERT INTO transfers ({TRANSFER_COLUMNS})
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"
    ))
    .bind(row.id)
    .bind(row.kind)
    .bind(row.sender_id)
    .bind(row.recipient_id)
    .bind(row.size_bytes)
    .bind(row.filename)
    .bind(row.content_type)
    .bind(row.subject)
    .bind(row.public_key)
    .bind(row.key_exchange_nonce)
    .bind(row.proof)
    .bind(row.created_at)
    .bind(row.expires_at)
    .execute(executor)
    .await?;

    Ok(())
}
