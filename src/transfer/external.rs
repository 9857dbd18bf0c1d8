//! Collaborators consumed by the transfer service.
//!
//! Identity, privacy policy and notification delivery live outside this
//! crate. They are reached through these traits.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::info;

use super::types::UserId;
use crate::Result;

/// A resolved recipient account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recipient {
    pub user_id: UserId,
    /// Whether the account wants a notification for new transfers.
    pub notify_on_transfer: bool,
}

/// Resolves recipient usernames while enforcing inbound-transfer policy.
#[async_trait]
pub trait RecipientDirectory: Send + Sync {
    /// Resolve `username` for a transfer from `sender`.
    ///
    /// Returns `None` both when the account does not exist and when its
    /// policy refuses transfers from this sender.
    async fn resolve_recipient(
        &self,
        sender: Option<UserId>,
        username: &str,
    ) -> Result<Option<Recipient>>;
}

/// Delivers "new transfer" notifications.
#[async_trait]
pub trait TransferNotifier: Send + Sync {
    /// Notify `user_id` of a new transfer.
    async fn notify(&self, user_id: UserId) -> Result<()>;
}

#[derive(Debug, Clone)]
struct DirectoryEntry {
    recipient: Recipient,
    accepts_anonymous: bool,
}

/// In-memory directory with a per-account "accept anonymous senders" policy.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    entries: Mutex<HashMap<String, DirectoryEntry>>,
}

impl StaticDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an account.
    pub fn add_user(
        &self,
        username: impl Into<String>,
        user_id: UserId,
        accepts_anonymous: bool,
        notify_on_transfer: bool,
    ) {
        let entry = DirectoryEntry {
            recipient: Recipient {
                user_id,
                notify_on_transfer,
            },
            accepts_anonymous,
        };
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(username.into().to_lowercase(), entry);
    }
}

#[async_trait]
impl RecipientDirectory for StaticDirectory {
    async fn resolve_recipient(
        &self,
        sender: Option<UserId>,
        username: &str,
    ) -> Result<Option<Recipient>> {
        let entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(entry) = entries.get(&username.to_lowercase()) else {
            return Ok(None);
        };

        if sender.is_none() && !entry.accepts_anonymous {
            return Ok(None);
        }

        Ok(Some(entry.recipient))
    }
}

/// Notifier that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl TransferNotifier for LogNotifier {
    async fn notify(&self, user_id: UserId) -> Result<()> {
        info!("New transfer available for user {}", user_id);
        Ok(())
    }
}
