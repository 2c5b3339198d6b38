//! Cryptographic hash adapter parameterized by algorithm name.

use digest::DynDigest;
use serde::{Deserialize, Serialize};
use sha2::{Sha256, Sha384, Sha512};

use crate::error::{EngineError, Result};

use super::{BlockHasher, HashDigest, HasherFactory};

/// Supported cryptographic hash algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    /// Canonical lowercase name of the algorithm.
    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha384 => "sha384",
            HashAlgorithm::Sha512 => "sha512",
        }
    }
}

impl std::str::FromStr for HashAlgorithm {
    type Err = EngineError;

    fn from_str(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "sha256" | "sha-256" => Ok(HashAlgorithm::Sha256),
            "sha384" | "sha-384" => Ok(HashAlgorithm::Sha384),
            "sha512" | "sha-512" => Ok(HashAlgorithm::Sha512),
            other => Err(EngineError::config(format!(
                "unsupported hash algorithm '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Incremental cryptographic hash engine.
pub struct CryptoHasher {
    algorithm: HashAlgorithm,
    inner: Box<dyn DynDigest + Send>,
}

impl CryptoHasher {
    /// Create an engine for the given algorithm.
    pub fn new(algorithm: HashAlgorithm) -> Self {
        let inner: Box<dyn DynDigest + Send> = match algorithm {
            HashAlgorithm::Sha256 => Box::new(Sha256::default()),
            HashAlgorithm::Sha384 => Box::new(Sha384::default()),
            HashAlgorithm::Sha512 => Box::new(Sha512::default()),
        };
        Self { algorithm, inner }
    }

    /// The algorithm this engine computes.
    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }
}

impl BlockHasher for CryptoHasher {
    fn append(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    fn finalize_reset(&mut self) -> HashDigest {
        HashDigest::new(self.inner.finalize_reset().into_vec())
    }

    fn fork(&self) -> Box<dyn BlockHasher> {
        Box::new(CryptoHasher::new(self.algorithm))
    }
}

/// Factory producing [`CryptoHasher`] engines for a fixed algorithm.
#[derive(Debug, Clone)]
pub struct CryptoHasherFactory {
    algorithm: HashAlgorithm,
}

impl CryptoHasherFactory {
    /// Create a factory for the given algorithm.
    pub fn new(algorithm: HashAlgorithm) -> Self {
        Self { algorithm }
    }
}

impl HasherFactory for CryptoHasherFactory {
    fn create(&self) -> Box<dyn BlockHasher> {
        Box::new(CryptoHasher::new(self.algorithm))
    }

    fn algorithm(&self) -> &str {
        self.algorithm.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_vector() {
        let mut hasher = CryptoHasher::new(HashAlgorithm::Sha256);
        hasher.append(b"abc");
        let digest = hasher.finalize_reset();
        assert_eq!(
            digest.to_hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_finalize_resets_state() {
        let mut hasher = CryptoHasher::new(HashAlgorithm::Sha256);
        hasher.append(b"abc");
        let first = hasher.finalize_reset();

        hasher.append(b"abc");
        let second = hasher.finalize_reset();
        assert_eq!(first, second);
    }

    #[test]
    fn test_incremental_matches_one_shot() {
        let mut incremental = CryptoHasher::new(HashAlgorithm::Sha512);
        incremental.append(b"hello ");
        incremental.append(b"world");

        let mut one_shot = CryptoHasher::new(HashAlgorithm::Sha512);
        one_shot.append(b"hello world");

        assert_eq!(incremental.finalize_reset(), one_shot.finalize_reset());
    }

    #[test]
    fn test_fork_is_fresh() {
        let mut original = CryptoHasher::new(HashAlgorithm::Sha256);
        original.append(b"already fed");

        let mut forked = original.fork();
        forked.append(b"abc");
        assert_eq!(
            forked.finalize_reset().to_hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_algorithm_parsing() {
        assert_eq!(
            "sha256".parse::<HashAlgorithm>().unwrap(),
            HashAlgorithm::Sha256
        );
        assert_eq!(
            "SHA-512".parse::<HashAlgorithm>().unwrap(),
            HashAlgorithm::Sha512
        );
        assert!("md5".parse::<HashAlgorithm>().is_err());
    }
}
