//! Database schema and migrations for Sealdrop.
//!
//! Migrations are applied sequentially when the database is first opened or
//! upgraded; `schema_version` records which ones have run.

/// Database migrations.
pub const MIGRATIONS: &[&str] = &[
    // v1: Transfer envelopes
    r#"
-- One row per live transfer. The ciphertext itself lives in the blob store.
-- sender_id / recipient_id both NULL means an anonymous transfer.
CREATE TABLE transfers (
    id                  TEXT PRIMARY KEY,
    kind                TEXT NOT NULL,          -- 'message' or 'file'
    sender_id           INTEGER,
    recipient_id        INTEGER,
    size_bytes          INTEGER NOT NULL,
    filename            TEXT,                   -- file transfers only
    content_type        TEXT,                   -- file transfers only
    subject             TEXT,                   -- message transfers only
    public_key          BLOB NOT NULL,
    key_exchange_nonce  BLOB,
    proof               BLOB NOT NULL,
    created_at          INTEGER NOT NULL,       -- unix millis
    expires_at          INTEGER NOT NULL        -- unix millis
);

CREATE INDEX idx_transfers_recipient_id ON transfers(recipient_id);
CREATE INDEX idx_transfers_sender_id ON transfers(sender_id);
CREATE INDEX idx_transfers_expires_at ON transfers(expires_at);
"#,
    // v2: Durable deletion job queue
    r#"
-- Pending deletions. A row survives restarts until the deletion succeeds.
CREATE TABLE deletion_jobs (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    transfer_id TEXT NOT NULL,
    kind        TEXT NOT NULL,
    ownership   TEXT NOT NULL,                  -- 'anonymous' or 'user'
    run_at      INTEGER NOT NULL,               -- unix millis
    attempts    INTEGER NOT NULL DEFAULT 0,
    last_error  TEXT,
    created_at  INTEGER NOT NULL
);

CREATE INDEX idx_deletion_jobs_run_at ON deletion_jobs(run_at);
CREATE INDEX idx_deletion_jobs_transfer_id ON deletion_jobs(transfer_id);
"#,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_not_empty() {
        assert!(!MIGRATIONS.is_empty());
    }

    #[test]
    fn test_transfers_migration() {
        let first = MIGRATIONS[0];
        assert!(first.contains("CREATE TABLE transfers"));
        assert!(first.contains("sender_id"));
        assert!(first.contains("recipient_id"));
        assert!(first.contains("proof"));
        assert!(first.contains("expires_at"));
    }

    #[test]
    fn test_deletion_jobs_migration() {
        let second = MIGRATIONS[1];
        assert!(second.contains("CREATE TABLE deletion_jobs"));
        assert!(second.contains("run_at"));
        assert!(second.contains("attempts"));
        assert!(second.contains("last_error"));
    }

    #[test]
    fn test_migrations_are_valid_sql() {
        for migration in MIGRATIONS {
            assert!(!migration.trim().is_empty());
            assert!(migration.contains("CREATE TABLE") || migration.contains("ALTER TABLE"));
        }
    }
}
