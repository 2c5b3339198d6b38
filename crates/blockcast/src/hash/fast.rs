//! Fast non-cryptographic 64-bit hash adapter.

use xxhash_rust::xxh64::Xxh64;

use super::{BlockHasher, HashDigest, HasherFactory};

/// Incremental XXH64 engine producing an 8-byte digest.
pub struct FastHasher {
    inner: Xxh64,
    seed: u64,
}

impl FastHasher {
    /// Create an engine with the given seed.
    pub fn new(seed: u64) -> Self {
        Self {
            inner: Xxh64::new(seed),
            seed,
        }
    }
}

impl Default for FastHasher {
    fn default() -> Self {
        Self::new(0)
    }
}

impl BlockHasher for FastHasher {
    fn append(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    fn finalize_reset(&mut self) -> HashDigest {
        let value = self.inner.digest();
        self.inner = Xxh64::new(self.seed);
        HashDigest::new(value.to_be_bytes().to_vec())
    }

    fn fork(&self) -> Box<dyn BlockHasher> {
        Box::new(FastHasher::new(self.seed))
    }
}

/// Factory producing [`FastHasher`] engines with a fixed seed.
#[derive(Debug, Clone, Default)]
pub struct FastHasherFactory {
    seed: u64,
}

impl FastHasherFactory {
    /// Create a factory with the given seed.
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }
}

impl HasherFactory for FastHasherFactory {
    fn create(&self) -> Box<dyn BlockHasher> {
        Box::new(FastHasher::new(self.seed))
    }

    fn algorithm(&self) -> &str {
        "xxh64"
    }
}
