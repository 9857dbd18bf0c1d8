//! Transfer data model.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use super::{
    MAX_CONTENT_TYPE_LENGTH, MAX_FILENAME_LENGTH, MAX_SUBJECT_LENGTH, PROOF_LENGTH,
};
use crate::datetime::{from_millis, to_millis};
use crate::{Result, SealdropError};

/// Account id as issued by the identity collaborator.
pub type UserId = i64;

/// Server-generated 128-bit transfer id. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferId(Uuid);

impl TransferId {
    /// Generate a fresh random id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Build an id from its raw 128-bit value.
    pub fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }

    /// Raw 128-bit value.
    pub fn as_u128(&self) -> u128 {
        self.0.as_u128()
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.as_hyphenated().fmt(f)
    }
}

impl FromStr for TransferId {
    type Err = SealdropError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| SealdropError::Validation(format!("invalid transfer id {s:?}: {e}")))
    }
}

/// What a transfer carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferKind {
    /// An encrypted message with a subject line.
    Message,
    /// An encrypted file with a filename and content type.
    File,
}

impl TransferKind {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferKind::Message => "message",
            TransferKind::File => "file",
        }
    }

    /// Parse from string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "message" => Some(TransferKind::Message),
            "file" => Some(TransferKind::File),
            _ => None,
        }
    }
}

/// Coarse ownership used for storage layout and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OwnershipClass {
    /// Neither sender nor recipient is an account.
    Anonymous,
    /// At least one side is an account.
    User,
}

impl OwnershipClass {
    /// Classify from the nullable sender and recipient ids.
    pub fn classify(sender_id: Option<UserId>, recipient_id: Option<UserId>) -> Self {
        if sender_id.is_none() && recipient_id.is_none() {
            OwnershipClass::Anonymous
        } else {
            OwnershipClass::User
        }
    }

    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            OwnershipClass::Anonymous => "anonymous",
            OwnershipClass::User => "user",
        }
    }

    /// Parse from string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "anonymous" => Some(OwnershipClass::Anonymous),
            "user" => Some(OwnershipClass::User),
            _ => None,
        }
    }
}

/// Full sender/recipient relationship of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Anonymous sender, no fixed recipient.
    Anonymous,
    /// Account sender, no fixed recipient (link-shared).
    FromUserToAnonymous { sender: UserId },
    /// Anonymous sender addressing an account.
    FromAnonymousToUser { recipient: UserId },
    /// Account to account.
    FromUserToUser { sender: UserId, recipient: UserId },
}

impl Ownership {
    /// Build from the nullable sender and recipient columns.
    pub fn from_parties(sender_id: Option<UserId>, recipient_id: Option<UserId>) -> Self {
        match (sender_id, recipient_id) {
            (None, None) => Ownership::Anonymous,
            (Some(sender), None) => Ownership::FromUserToAnonymous { sender },
            (None, Some(recipient)) => Ownership::FromAnonymousToUser { recipient },
            (Some(sender), Some(recipient)) => Ownership::FromUserToUser { sender, recipient },
        }
    }

    /// Storage class of this relationship.
    pub fn class(&self) -> OwnershipClass {
        match self {
            Ownership::Anonymous => OwnershipClass::Anonymous,
            _ => OwnershipClass::User,
        }
    }
}

/// Download authorization value.
///
/// `Debug` never prints the bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct Proof(Vec<u8>);

impl Proof {
    /// Wrap caller-supplied bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Generate a random proof.
    pub fn generate() -> Self {
        let bytes: [u8; PROOF_LENGTH] = rand::random();
        Self(bytes.to_vec())
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Constant-time comparison against a presented value.
    ///
    /// Only the length may leak through timing.
    pub fn matches(&self, presented: &[u8]) -> bool {
        self.0.as_slice().ct_eq(presented).into()
    }
}

impl fmt::Debug for Proof {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Proof(<{} bytes>)", self.0.len())
    }
}

/// Kind-specific unencrypted descriptors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeContent {
    /// File descriptors.
    File {
        filename: String,
        content_type: String,
    },
    /// Message descriptors.
    Message { subject: String },
}

/// Unencrypted envelope accompanying an upload.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Kind-specific descriptors.
    pub content: EnvelopeContent,
    /// Client key-exchange public key, stored verbatim.
    pub public_key: Vec<u8>,
    /// Client key-exchange nonce, stored verbatim.
    pub key_exchange_nonce: Option<Vec<u8>>,
    /// Caller-chosen proof; generated server-side when absent.
    pub proof: Option<Proof>,
    /// Requested lifetime in hours.
    pub lifetime_hours: i64,
}

impl Envelope {
    /// Envelope for a file transfer with the minimum lifetime.
    pub fn file(
        filename: impl Into<String>,
        content_type: impl Into<String>,
        public_key: impl Into<Vec<u8>>,
    ) -> Self {
        Self::with_content(
            EnvelopeContent::File {
                filename: filename.into(),
                content_type: content_type.into(),
            },
            public_key.into(),
        )
    }

    /// Envelope for a message transfer with the minimum lifetime.
    pub fn message(subject: impl Into<String>, public_key: impl Into<Vec<u8>>) -> Self {
        Self::with_content(
            EnvelopeContent::Message {
                subject: subject.into(),
            },
            public_key.into(),
        )
    }

    fn with_content(content: EnvelopeContent, public_key: Vec<u8>) -> Self {
        Self {
            content,
            public_key,
            key_exchange_nonce: None,
            proof: None,
            lifetime_hours: super::MIN_LIFETIME_HOURS,
        }
    }

    /// Set the key-exchange nonce.
    pub fn with_nonce(mut self, nonce: impl Into<Vec<u8>>) -> Self {
        self.key_exchange_nonce = Some(nonce.into());
        self
    }

    /// Set a caller-chosen proof.
    pub fn with_proof(mut self, proof: impl Into<Vec<u8>>) -> Self {
        self.proof = Some(Proof::new(proof));
        self
    }

    /// Set the requested lifetime.
    pub fn with_lifetime_hours(mut self, hours: i64) -> Self {
        self.lifetime_hours = hours;
        self
    }

    /// Transfer kind implied by the descriptors.
    pub fn kind(&self) -> TransferKind {
        match self.content {
            EnvelopeContent::File { .. } => TransferKind::File,
            EnvelopeContent::Message { .. } => TransferKind::Message,
        }
    }

    /// Check the envelope is well formed. Lifetime is checked separately.
    pub fn validate(&self) -> Result<()> {
        if self.public_key.is_empty() {
            return Err(SealdropError::Validation("public key is required".into()));
        }

        if let Some(proof) = &self.proof {
            if proof.as_bytes().is_empty() {
                return Err(SealdropError::Validation("proof must not be empty".into()));
            }
        }

        match &self.content {
            EnvelopeContent::File {
                filename,
                content_type,
            } => {
                if filename.trim().is_empty() {
                    return Err(SealdropError::Validation("filename is required".into()));
                }
                if filename.chars().count() > MAX_FILENAME_LENGTH {
                    return Err(SealdropError::Validation(format!(
                        "filename exceeds {MAX_FILENAME_LENGTH} characters"
                    )));
                }
                if content_type.chars().count() > MAX_CONTENT_TYPE_LENGTH {
                    return Err(SealdropError::Validation(format!(
                        "content type exceeds {MAX_CONTENT_TYPE_LENGTH} characters"
                    )));
                }
            }
            EnvelopeContent::Message { subject } => {
                if subject.chars().count() > MAX_SUBJECT_LENGTH {
                    return Err(SealdropError::Validation(format!(
                        "subject exceeds {MAX_SUBJECT_LENGTH} characters"
                    )));
                }
            }
        }

        Ok(())
    }
}

/// A persisted transfer envelope.
#[derive(Debug, Clone)]
pub struct Transfer {
    pub id: TransferId,
    pub kind: TransferKind,
    pub sender_id: Option<UserId>,
    pub recipient_id: Option<UserId>,
    /// Ciphertext length, counted against the quota.
    pub size_bytes: i64,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub subject: Option<String>,
    pub public_key: Vec<u8>,
    pub key_exchange_nonce: Option<Vec<u8>>,
    pub proof: Proof,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Transfer {
    /// Sender/recipient relationship.
    pub fn ownership(&self) -> Ownership {
        Ownership::from_parties(self.sender_id, self.recipient_id)
    }

    /// Storage class.
    pub fn ownership_class(&self) -> OwnershipClass {
        OwnershipClass::classify(self.sender_id, self.recipient_id)
    }

    /// Whether the first authorized read deletes the transfer.
    pub fn is_read_once(&self) -> bool {
        self.recipient_id.is_none()
    }

    /// Whether the transfer is past its expiration.
    pub fn is_expired_at(&self, now: &DateTime<Utc>) -> bool {
        self.expires_at <= *now
    }
}

/// Raw `transfers` row.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct TransferRow {
    pub id: String,
    pub kind: String,
    pub sender_id: Option<i64>,
    pub recipient_id: Option<i64>,
    pub size_bytes: i64,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub subject: Option<String>,
    pub public_key: Vec<u8>,
    pub key_exchange_nonce: Option<Vec<u8>>,
    pub proof: Vec<u8>,
    pub created_at: i64,
    pub expires_at: i64,
}

impl TransferRow {
    pub(crate) fn into_transfer(self) -> Result<Transfer> {
        let kind = TransferKind::from_str(&self.kind).ok_or_else(|| {
            SealdropError::Database(format!("unknown transfer kind {:?}", self.kind))
        })?;

        Ok(Transfer {
            id: self.id.parse()?,
            kind,
            sender_id: self.sender_id,
            recipient_id: self.recipient_id,
            size_bytes: self.size_bytes,
            filename: self.filename,
            content_type: self.content_type,
            subject: self.subject,
            public_key: self.public_key,
            key_exchange_nonce: self.key_exchange_nonce,
            proof: Proof::new(self.proof),
            created_at: from_millis(self.created_at),
            expires_at: from_millis(self.expires_at),
        })
    }

    pub(crate) fn from_transfer(transfer: &Transfer) -> Self {
        Self {
            id: transfer.id.to_string(),
            kind: transfer.kind.as_str().to_string(),
            sender_id: transfer.sender_id,
            recipient_id: transfer.recipient_id,
            size_bytes: transfer.size_bytes,
            filename: transfer.filename.clone(),
            content_type: transfer.content_type.clone(),
            subject: transfer.subject.clone(),
            public_key: transfer.public_key.clone(),
            key_exchange_nonce: transfer.key_exchange_nonce.clone(),
            proof: transfer.proof.as_bytes().to_vec(),
            created_at: to_millis(&transfer.created_at),
            expires_at: to_millis(&transfer.expires_at),
        }
    }
}
