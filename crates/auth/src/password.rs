//! Password hashing collaborator and its Argon2id implementation.

use argon2::password_hash::SaltString;
use argon2::{Algorithm, Argon2, Params, PasswordHash, Version};
use argon2::{PasswordHasher as _, PasswordVerifier as _};
use rand::RngCore;
use rand::rngs::OsRng;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PasswordError {
    #[error("password does not match")]
    Mismatch,

    #[error("stored hash is malformed: {0}")]
    MalformedHash(String),

    #[error("hashing failed: {0}")]
    Hashing(String),
}

/// Deliberately expensive, synchronous password hashing.
pub trait PasswordHasher: Send + Sync {
    fn hash(&self, plaintext: &str) -> Result<String, PasswordError>;

    /// `Ok(())` only when `plaintext` matches `hash`.
    fn verify(&self, plaintext: &str, hash: &str) -> Result<(), PasswordError>;
}

/// Argon2id producing PHC strings.
#[derive(Debug, Clone)]
pub struct Argon2Hasher {
    params: Params,
}

impl Argon2Hasher {
    pub fn new(memory_kib: u32, iterations: u32, parallelism: u32) -> Result<Self, PasswordError> {
        let params = Params::new(memory_kib, iterations, parallelism, None)
            .map_err(|e| PasswordError::Hashing(e.to_string()))?;
        Ok(Self { params })
    }

    fn argon2(&self) -> Argon2<'static> {
        Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone())
    }
}

impl Default for Argon2Hasher {
    fn default() -> Self {
        Self {
            params: Params::default(),
        }
    }
}

impl PasswordHasher for Argon2Hasher {
    fn hash(&self, plaintext: &str) -> Result<String, PasswordError> {
        let mut salt = [0u8; 16];
        OsRng.fill_bytes(&mut salt);
        let salt = SaltString::encode_b64(&salt).map_err(|e| PasswordError::Hashing(e.to_string()))?;

        self.argon2()
            .hash_password(plaintext.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| PasswordError::Hashing(e.to_string()))
    }

    fn verify(&self, plaintext: &str, hash: &str) -> Result<(), PasswordError> {
        let parsed = PasswordHash::new(hash).map_err(|e| PasswordError::MalformedHash(e.to_string()))?;

        self.argon2()
            .verify_password(plaintext.as_bytes(), &parsed)
            .map_err(|e| match e {
                argon2::password_hash::Error::Password => PasswordError::Mismatch,
                other => PasswordError::Hashing(other.to_string()),
            })
    }
}
