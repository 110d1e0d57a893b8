//! Principal secrets and their argon2 digests.

use crate::error::{StoreError, StoreResult};
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};
use std::fmt;
use std::str::FromStr;

/// A plain-text secret. Never printed: `Debug` is redacted and there is no `Display`.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Secret(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Secret(value)
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Secret(value.to_string())
    }
}

/// Argon2 cost parameters used when hashing new secrets. Verification always uses
/// the parameters recorded in the digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashCost {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl HashCost {
    pub const fn minimal() -> Self {
        HashCost {
            memory_kib: Params::MIN_M_COST,
            iterations: Params::MIN_T_COST,
            parallelism: Params::MIN_P_COST,
        }
    }
}

impl Default for HashCost {
    fn default() -> Self {
        HashCost {
            memory_kib: Params::DEFAULT_M_COST,
            iterations: Params::DEFAULT_T_COST,
            parallelism: Params::DEFAULT_P_COST,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretHasher {
    Argon2,
}

impl FromStr for SecretHasher {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "argon2" => Ok(SecretHasher::Argon2),
            _ => Err(StoreError::Hashing(format!("unknown hasher {}", s))),
        }
    }
}

impl fmt::Display for SecretHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecretHasher::Argon2 => f.write_str("argon2"),
        }
    }
}

impl SecretHasher {
    pub fn generate_salt(&self) -> String {
        match self {
            SecretHasher::Argon2 => SaltString::generate(&mut OsRng).to_string(),
        }
    }

    pub fn hash(&self, secret: &Secret, b64_salt: &str, cost: HashCost) -> StoreResult<String> {
        match self {
            SecretHasher::Argon2 => {
                let params = Params::new(cost.memory_kib, cost.iterations, cost.parallelism, None)
                    .map_err(|err| StoreError::Hashing(err.to_string()))?;
                let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
                let salt = SaltString::from_b64(b64_salt)
                    .map_err(|err| StoreError::Hashing(err.to_string()))?;
                let hash = argon2
                    .hash_password(secret.expose().as_bytes(), &salt)
                    .map_err(|err| StoreError::Hashing(err.to_string()))?;
                Ok(hash.to_string())
            }
        }
    }

    pub fn verify(&self, secret: &Secret, target_hash: &str) -> StoreResult<bool> {
        match self {
            SecretHasher::Argon2 => {
                let parsed = PasswordHash::new(target_hash)
                    .map_err(|err| StoreError::Hashing(err.to_string()))?;
                Ok(Argon2::default()
                    .verify_password(secret.expose().as_bytes(), &parsed)
                    .is_ok())
            }
        }
    }

    /// Salts and hashes `secret` into a storable digest.
    pub fn digest(&self, secret: &Secret, cost: HashCost) -> StoreResult<SecretDigest> {
        let salt = self.generate_salt();
        let hash = self.hash(secret, &salt, cost)?;
        Ok(SecretDigest {
            hasher: *self,
            salt,
            hash,
        })
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct SecretDigest {
    pub hasher: SecretHasher,
    pub salt: String,
    pub hash: String,
}

impl SecretDigest {
    pub fn matches(&self, secret: &Secret) -> StoreResult<bool> {
        self.hasher.verify(secret, &self.hash)
    }
}

impl fmt::Debug for SecretDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretDigest")
            .field("hasher", &self.hasher)
            .finish_non_exhaustive()
    }
}
