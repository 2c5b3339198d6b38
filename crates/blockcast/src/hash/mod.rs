//! Resettable incremental hash engines for transfer verification.
//!
//! Two adapters are provided: a cryptographic engine parameterized by
//! algorithm name ([`CryptoHasher`]) and a fast non-cryptographic 64-bit
//! engine ([`FastHasher`]). Both can be reset and reused across streams.

mod crypto;
mod fast;

pub use crypto::{CryptoHasher, CryptoHasherFactory, HashAlgorithm};
pub use fast::{FastHasher, FastHasherFactory};

/// A computed hash value.
#[derive(Clone, PartialEq, Eq)]
pub struct HashDigest(Vec<u8>);

impl HashDigest {
    /// Wrap raw digest bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// The raw digest bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Lowercase hex rendering of the digest.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl std::fmt::Display for HashDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl std::fmt::Debug for HashDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HashDigest({})", self.to_hex())
    }
}

impl From<Vec<u8>> for HashDigest {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

/// A resettable incremental hash engine.
pub trait BlockHasher: Send {
    /// Extend the internal state with `data`.
    fn append(&mut self, data: &[u8]);

    /// Produce the digest of everything appended so far and reset the
    /// engine, making it ready for another stream.
    fn finalize_reset(&mut self) -> HashDigest;

    /// Create a fresh, equivalent engine with empty state.
    fn fork(&self) -> Box<dyn BlockHasher>;
}

/// Creates hash engines for the coordinator and its workers.
///
/// One engine instance is created per verification pass; instances are
/// dropped when the pass completes.
pub trait HasherFactory: Send + Sync {
    /// Create a fresh engine.
    fn create(&self) -> Box<dyn BlockHasher>;

    /// Human-readable algorithm name, for logging.
    fn algorithm(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_hex_rendering() {
        let digest = HashDigest::new(vec![0x00, 0xab, 0xff]);
        assert_eq!(digest.to_hex(), "00abff");
        assert_eq!(format!("{digest}"), "00abff");
    }

    #[test]
    fn test_digest_equality_is_byte_for_byte() {
        let a = HashDigest::new(vec![1, 2, 3]);
        let b = HashDigest::new(vec![1, 2, 3]);
        let c = HashDigest::new(vec![1, 2, 4]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
