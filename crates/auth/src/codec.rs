//! Symmetric authenticated-encryption codec for token payloads.
//!
//! Wire format: `v2.local.` followed by unpadded base64url of
//! `nonce (24) || ciphertext || tag (16)`. The cipher is XChaCha20-Poly1305 and
//! the header, nonce and (empty) footer are bound as associated data using the
//! PASETO pre-authentication encoding.
//!
//! Decoding is a single authenticated decrypt: nothing inside the ciphertext is
//! looked at before the tag verifies.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chacha20poly1305::aead::{Aead, KeyInit, Payload as AeadPayload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use rand::RngCore;
use rand::rngs::OsRng;

use crate::{Payload, TokenError};

/// Required symmetric key length in bytes.
pub const KEY_SIZE: usize = 32;

const HEADER: &str = "v2.local.";
const NONCE_SIZE: usize = 24;
const TAG_SIZE: usize = 16;
const FOOTER: &[u8] = b"";

pub struct CredentialCodec {
    cipher: XChaCha20Poly1305,
}

impl core::fmt::Debug for CredentialCodec {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CredentialCodec").finish_non_exhaustive()
    }
}

impl CredentialCodec {
    /// Build a codec from a pre-shared key of exactly [`KEY_SIZE`] bytes.
    pub fn new(key: &[u8]) -> Result<Self, TokenError> {
        let invalid = || TokenError::InvalidKeySize {
            expected: KEY_SIZE,
            actual: key.len(),
        };
        if key.len() != KEY_SIZE {
            return Err(invalid());
        }
        let cipher = XChaCha20Poly1305::new_from_slice(key).map_err(|_| invalid())?;
        Ok(Self { cipher })
    }

    pub fn encode(&self, payload: &Payload) -> Result<String, TokenError> {
        let message =
            serde_json::to_vec(payload).map_err(|e| TokenError::Encoding(e.to_string()))?;

        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        let aad = pre_auth_encode(&[HEADER.as_bytes(), &nonce, FOOTER]);
        let sealed = self
            .cipher
            .encrypt(
                XNonce::from_slice(&nonce),
                AeadPayload {
                    msg: &message,
                    aad: &aad,
                },
            )
            .map_err(|_| TokenError::Encoding("encryption failed".to_string()))?;

        let mut raw = Vec::with_capacity(NONCE_SIZE + sealed.len());
        raw.extend_from_slice(&nonce);
        raw.extend_from_slice(&sealed);

        Ok(format!("{HEADER}{}", URL_SAFE_NO_PAD.encode(raw)))
    }

    pub fn decode(&self, token: &str) -> Result<Payload, TokenError> {
        let body = token
            .strip_prefix(HEADER)
            .ok_or(TokenError::InvalidToken)?;
        let raw = URL_SAFE_NO_PAD
            .decode(body)
            .map_err(|_| TokenError::InvalidToken)?;
        if raw.len() < NONCE_SIZE + TAG_SIZE {
            return Err(TokenError::InvalidToken);
        }

        let (nonce, sealed) = raw.split_at(NONCE_SIZE);
        let aad = pre_auth_encode(&[HEADER.as_bytes(), nonce, FOOTER]);
        let message = self
            .cipher
            .decrypt(
                XNonce::from_slice(nonce),
                AeadPayload {
                    msg: sealed,
                    aad: &aad,
                },
            )
            .map_err(|_| TokenError::InvalidToken)?;

        serde_json::from_slice(&message).map_err(|_| TokenError::InvalidToken)
    }
}

/// PASETO PAE: piece count then each piece, lengths as LE64 with the top bit cleared.
fn pre_auth_encode(pieces: &[&[u8]]) -> Vec<u8> {
    let le64 = |n: usize| ((n as u64) & (u64::MAX >> 1)).to_le_bytes();

    let mut out = Vec::with_capacity(8 + pieces.iter().map(|p| 8 + p.len()).sum::<usize>());
    out.extend_from_slice(&le64(pieces.len()));
    for piece in pieces {
        out.extend_from_slice(&le64(piece.len()));
        out.extend_from_slice(piece);
    }
    out
}
