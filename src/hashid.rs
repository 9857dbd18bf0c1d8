//! Reversible obfuscation of transfer ids for public URLs.
//!
//! The 128-bit id is run through a keyed four-round Feistel permutation and
//! printed as unpadded URL-safe base64. The permutation is a bijection, so
//! every id has exactly one encoding and every canonical 22-character string
//! decodes to exactly one id. This hides the raw UUID; it is not an access
//! control. Downloads are still gated by the proof check.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::transfer::TransferId;

/// Number of Feistel rounds.
const ROUNDS: u8 = 4;

/// Length of an encoded id (16 bytes in unpadded base64).
pub const ENCODED_LEN: usize = 22;

/// Error returned for strings that are not an encoded id.
///
/// Callers at the operation surface must fold this into "not found".
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Wrong number of characters.
    #[error("encoded id must be {ENCODED_LEN} characters, got {0}")]
    Length(usize),
    /// Not canonical URL-safe base64.
    #[error("encoded id is not valid base64url")]
    Alphabet,
}

/// Salted, reversible id codec.
#[derive(Clone)]
pub struct IdCodec {
    /// Hasher with the salt already absorbed; cloned per round.
    seeded: Sha256,
}

impl IdCodec {
    /// Create a codec keyed by `salt`.
    pub fn new(salt: &str) -> Self {
        let mut seeded = Sha256::new();
        seeded.update((salt.len() as u64).to_be_bytes());
        seeded.update(salt.as_bytes());
        Self { seeded }
    }

    /// Encode an id as an opaque URL-safe string.
    pub fn encode(&self, id: TransferId) -> String {
        let value = id.as_u128();
        let mut left = (value >> 64) as u64;
        let mut right = value as u64;

        for round in 0..ROUNDS {
            let next = left ^ self.round_fn(round, right);
            left = right;
            right = next;
        }

        let permuted = ((left as u128) << 64) | right as u128;
        URL_SAFE_NO_PAD.encode(permuted.to_be_bytes())
    }

    /// Decode a string produced by [`IdCodec::encode`].
    pub fn decode(&self, encoded: &str) -> Result<TransferId, DecodeError> {
        if encoded.len() != ENCODED_LEN {
            return Err(DecodeError::Length(encoded.len()));
        }

        let decoded = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|_| DecodeError::Alphabet)?;
        let bytes: [u8; 16] = decoded.try_into().map_err(|_| DecodeError::Alphabet)?;

        let permuted = u128::from_be_bytes(bytes);
        let mut left = (permuted >> 64) as u64;
        let mut right = permuted as u64;

        for round in (0..ROUNDS).rev() {
            let prev = right ^ self.round_fn(round, left);
            right = left;
            left = prev;
        }

        Ok(TransferId::from_u128(((left as u128) << 64) | right as u128))
    }

    fn round_fn(&self, round: u8, half: u64) -> u64 {
        let mut hasher = self.seeded.clone();
        hasher.update([round]);
        hasher.update(half.to_be_bytes());
        let digest = hasher.finalize();

        let mut out = [0u8; 8];
        out.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(out)
    }
}

impl std::fmt::Debug for IdCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdCodec").finish_non_exhaustive()
    }
}
