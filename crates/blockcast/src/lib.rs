//! # blockcast
//!
//! One-to-many block-transfer engine.
//!
//! A [`TransferCoordinator`] streams a single ordered byte sequence from one
//! producer worker to N consumer workers through a fixed pool of
//! sector-aligned blocks, with support for:
//!
//! - **Parallel fill** with strict in-order broadcast (reorder merge)
//! - **Per-consumer fan-out** with reference-counted block recycling
//! - **Two-pass hash verification** (reference digest during transfer,
//!   per-worker re-read afterwards)
//! - **Two-scope cancellation** isolating a failing worker from the rest
//!   of the transfer
//!
//! ## Example
//!
//! ```rust,no_run
//! use blockcast::{EngineConfig, FileBlockReader, FileBlockWriter, TransferCoordinator};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> blockcast::Result<()> {
//!     let mut coordinator =
//!         TransferCoordinator::from_config(EngineConfig::new().with_verify_hash(true))?;
//!     coordinator.set_producer(Arc::new(FileBlockReader::new("source.bin")));
//!     coordinator.add_consumer(Arc::new(FileBlockWriter::new("copy-a.bin")));
//!     coordinator.add_consumer(Arc::new(FileBlockWriter::new("copy-b.bin")));
//!
//!     let report = coordinator.execute(CancellationToken::new()).await?;
//!     println!("{}", report.to_json()?);
//!     Ok(())
//! }
//! ```

pub mod buffer;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod fs;
pub mod hash;
pub mod worker;

mod machine;

// Re-exports for convenient access
pub use buffer::{Block, BufferPool, SECTOR_SIZE};
pub use config::{EngineConfig, DEFAULT_BLOCK_SIZE, DEFAULT_POOL_CAPACITY};
pub use coordinator::{TransferCoordinator, TransferReport, WorkerSummary};
pub use error::{EngineError, Result};
pub use fs::{FileBlockReader, FileBlockWriter};
pub use hash::{
    BlockHasher, CryptoHasher, CryptoHasherFactory, FastHasher, FastHasherFactory, HashAlgorithm,
    HashDigest, HasherFactory,
};
pub use machine::{CompletionOutcome, WorkerCompletion, WorkerRole};
pub use worker::{Consumer, Producer, VerifyContext, Worker, WorkerContext};
