//! Transfer coordinator - owns the pool, builds the state machines and
//! drives one transfer at a time.
//!
//! The coordinator is the single aggregate root: all shared state (the
//! buffer pool, the cancellation scopes, the reference digest) lives on it.
//! It is designed to be reused across many transfers serially; the pool
//! invariant is asserted before and after every run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use async_trait::async_trait;

use crate::buffer::{Block, BufferPool};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::hash::{BlockHasher, CryptoHasherFactory, HashDigest, HasherFactory};
use crate::machine::{
    aggregate_completions, run_worker_lifecycle, CompletionOutcome, ConsumerMachine, Escalation,
    MachineCore, ProducerMachine, StreamProgress, VerifyPlan, WorkerCompletion, WorkerRole,
};
use crate::worker::{Consumer, Producer, VerifyContext, Worker, WorkerContext};

/// Synthetic consumer that computes the reference digest while the stream
/// is broadcast. Runs with concurrency 1, so it observes blocks in strict
/// sequence order.
struct ReferenceHashWorker {
    hasher: Mutex<Box<dyn BlockHasher>>,
}

impl ReferenceHashWorker {
    fn new(hasher: Box<dyn BlockHasher>) -> Self {
        Self {
            hasher: Mutex::new(hasher),
        }
    }
}

#[async_trait]
impl Worker for ReferenceHashWorker {
    fn name(&self) -> &str {
        "reference-hasher"
    }

    async fn initialize(&self, _ctx: WorkerContext) -> Result<()> {
        Ok(())
    }

    async fn finalize(&self, _verify: Option<&mut VerifyContext>) -> Result<Option<HashDigest>> {
        let digest = self
            .hasher
            .lock()
            .expect("reference hasher lock poisoned")
            .finalize_reset();
        Ok(Some(digest))
    }
}

#[async_trait]
impl Consumer for ReferenceHashWorker {
    async fn drain(&self, block: &Arc<Block>) -> Result<()> {
        self.hasher
            .lock()
            .expect("reference hasher lock poisoned")
            .append(block.data());
        Ok(())
    }
}

/// Serializable per-worker summary carried on the report.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSummary {
    /// Worker name as reported in logs and errors.
    pub worker: String,
    /// Role the worker played.
    pub role: WorkerRole,
    /// Final status: "success", "cancelled" or "failed".
    pub status: String,
    /// Error rendering for failed workers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Hex digest returned by finalize, when one was computed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

impl WorkerSummary {
    fn from_completion(completion: &WorkerCompletion) -> Self {
        let (status, error) = match &completion.outcome {
            CompletionOutcome::Success => ("success", None),
            CompletionOutcome::Cancelled => ("cancelled", None),
            CompletionOutcome::Failed(e) => ("failed", Some(e.to_string())),
            CompletionOutcome::AggregateFailed(errors) => (
                "failed",
                Some(
                    errors
                        .iter()
                        .map(|e| e.to_string())
                        .collect::<Vec<_>>()
                        .join("; "),
                ),
            ),
        };
        Self {
            worker: completion.worker.clone(),
            role: completion.role,
            status: status.to_string(),
            error,
            digest: completion.digest.as_ref().map(|d| d.to_hex()),
        }
    }
}

/// Result of a successful transfer run.
#[derive(Debug, Clone, Serialize)]
pub struct TransferReport {
    /// Unique run identifier.
    pub run_id: String,

    /// When the transfer started.
    pub started_at: DateTime<Utc>,

    /// When the transfer completed.
    pub completed_at: DateTime<Utc>,

    /// Total duration in seconds.
    pub duration_seconds: f64,

    /// Blocks broadcast to the consumers.
    pub blocks_transferred: u64,

    /// Bytes broadcast to the consumers.
    pub bytes_transferred: u64,

    /// Average throughput in bytes per second.
    pub bytes_per_second: f64,

    /// Hex reference digest, when verification ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_hash: Option<String>,

    /// Per-worker outcomes.
    pub workers: Vec<WorkerSummary>,
}

impl TransferReport {
    /// Convert to a pretty JSON string.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| EngineError::invariant(format!("report serialization failed: {e}")))
    }
}

/// Clears the run flag and the active cancellation handle on every exit
/// path, including validation failures.
struct RunGuard<'a> {
    coordinator: &'a TransferCoordinator,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        *self
            .coordinator
            .active_cancel
            .lock()
            .expect("coordinator lock poisoned") = None;
        self.coordinator.running.store(false, Ordering::Release);
    }
}

/// Streams a single ordered byte sequence from one producer worker to N
/// consumer workers through a fixed pool of sector-aligned blocks, with
/// optional two-pass hash verification.
///
/// # Example
///
/// ```rust,no_run
/// use blockcast::{EngineConfig, FileBlockReader, FileBlockWriter, TransferCoordinator};
/// use std::sync::Arc;
/// use tokio_util::sync::CancellationToken;
///
/// #[tokio::main]
/// async fn main() -> blockcast::Result<()> {
///     let config = EngineConfig::new().with_verify_hash(true);
///     let mut coordinator = TransferCoordinator::from_config(config)?;
///     coordinator.set_producer(Arc::new(FileBlockReader::new("source.bin")));
///     coordinator.add_consumer(Arc::new(FileBlockWriter::new("copy-a.bin")));
///     coordinator.add_consumer(Arc::new(FileBlockWriter::new("copy-b.bin")));
///
///     let report = coordinator.execute(CancellationToken::new()).await?;
///     println!("transferred {} bytes", report.bytes_transferred);
///     Ok(())
/// }
/// ```
pub struct TransferCoordinator {
    config: EngineConfig,
    pool: Arc<BufferPool>,
    producer: Option<Arc<dyn Producer>>,
    consumers: Vec<Arc<dyn Consumer>>,
    hasher_factory: Option<Arc<dyn HasherFactory>>,
    verify_hash: bool,
    running: AtomicBool,
    active_cancel: Mutex<Option<CancellationToken>>,
    reference_hash: Mutex<Option<HashDigest>>,
    completions: Mutex<Vec<WorkerCompletion>>,
}

impl TransferCoordinator {
    /// Create a coordinator with a preallocated pool of `capacity` blocks of
    /// `block_size` bytes. Block size must be a positive multiple of the
    /// sector size; capacity must be at least 1.
    pub fn new(block_size: usize, capacity: usize) -> Result<Self> {
        Self::from_config(
            EngineConfig::new()
                .with_block_size(block_size)
                .with_pool_capacity(capacity),
        )
    }

    /// Create a coordinator from a full configuration.
    ///
    /// When the configuration requests verification, a cryptographic hasher
    /// factory for the configured algorithm is installed; it can be replaced
    /// with [`set_hasher_factory`](Self::set_hasher_factory).
    pub fn from_config(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let pool = Arc::new(BufferPool::new(config.block_size, config.pool_capacity)?);
        let hasher_factory: Option<Arc<dyn HasherFactory>> = if config.verify_hash {
            Some(Arc::new(CryptoHasherFactory::new(config.hash_algorithm)))
        } else {
            None
        };
        Ok(Self {
            verify_hash: config.verify_hash,
            hasher_factory,
            pool,
            config,
            producer: None,
            consumers: Vec::new(),
            running: AtomicBool::new(false),
            active_cancel: Mutex::new(None),
            reference_hash: Mutex::new(None),
            completions: Mutex::new(Vec::new()),
        })
    }

    /// Set the producer worker. Must be set before `execute`.
    pub fn set_producer(&mut self, producer: Arc<dyn Producer>) -> &mut Self {
        self.producer = Some(producer);
        self
    }

    /// Append a consumer worker. At least one must be set before `execute`.
    pub fn add_consumer(&mut self, consumer: Arc<dyn Consumer>) -> &mut Self {
        self.consumers.push(consumer);
        self
    }

    /// Replace the hasher factory used for verification.
    pub fn set_hasher_factory(&mut self, factory: Arc<dyn HasherFactory>) -> &mut Self {
        self.hasher_factory = Some(factory);
        self
    }

    /// Enable or disable two-pass hash verification.
    pub fn set_verify_hash(&mut self, enabled: bool) -> &mut Self {
        self.verify_hash = enabled;
        self
    }

    /// The configuration this coordinator was built from.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The fixed block size of the pool.
    pub fn block_size(&self) -> usize {
        self.pool.block_size()
    }

    /// The coordinator's buffer pool.
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// The reference digest computed during the most recent verified
    /// transfer; `None` if verification was not requested or the reference
    /// pass failed.
    pub fn reference_hash(&self) -> Option<HashDigest> {
        self.reference_hash
            .lock()
            .expect("coordinator lock poisoned")
            .clone()
    }

    /// Per-worker completions of the most recent transfer, in the order
    /// producer, consumers, reference hasher.
    pub fn completions(&self) -> Vec<WorkerCompletion> {
        self.completions
            .lock()
            .expect("coordinator lock poisoned")
            .clone()
    }

    /// Fire the global cancellation of the running transfer, if any.
    pub fn cancel(&self) {
        if let Some(token) = self
            .active_cancel
            .lock()
            .expect("coordinator lock poisoned")
            .as_ref()
        {
            token.cancel();
        }
    }

    /// Run one transfer. Rejects re-entry; asserts the pool invariant
    /// before and after.
    ///
    /// On failure the aggregated error is returned and the per-worker
    /// completions remain available through [`completions`](Self::completions).
    pub async fn execute(&self, cancel: CancellationToken) -> Result<TransferReport> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(EngineError::config("a transfer is already executing"));
        }
        let _guard = RunGuard { coordinator: self };

        let producer = self
            .producer
            .clone()
            .ok_or_else(|| EngineError::config("producer worker is not set"))?;
        if self.consumers.is_empty() {
            return Err(EngineError::config("at least one consumer must be set"));
        }
        let factory: Option<Arc<dyn HasherFactory>> = if self.verify_hash {
            let factory = self
                .hasher_factory
                .clone()
                .ok_or_else(|| EngineError::config("verify_hash requires a hasher factory"))?;
            // One scratch per verifying worker: the producer plus each
            // consumer. The reference hasher never rents one.
            let required = self.consumers.len() + 1;
            if self.pool.capacity() < required {
                return Err(EngineError::config(format!(
                    "verification with {} consumers requires pool capacity of at least \
                     {required}, got {}",
                    self.consumers.len(),
                    self.pool.capacity()
                )));
            }
            Some(factory)
        } else {
            None
        };

        self.pool.assert_idle()?;
        *self
            .reference_hash
            .lock()
            .expect("coordinator lock poisoned") = None;
        self.completions
            .lock()
            .expect("coordinator lock poisoned")
            .clear();

        let run_id = uuid::Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let start = Instant::now();

        info!(
            run_id = %run_id,
            block_size = self.pool.block_size(),
            pool_capacity = self.pool.capacity(),
            consumers = self.consumers.len(),
            verify = factory.is_some(),
            "starting transfer"
        );

        let global = cancel.child_token();
        *self
            .active_cancel
            .lock()
            .expect("coordinator lock poisoned") = Some(global.clone());

        let escalation = Arc::new(Escalation::new(global.clone(), self.consumers.len()));
        let progress = Arc::new(StreamProgress::default());

        // One unbounded channel per consumer, plus one for the reference
        // hasher when verification is on. The producer is the only writer.
        let mut senders = Vec::with_capacity(self.consumers.len() + 1);
        let mut consumer_machines = Vec::with_capacity(self.consumers.len());
        for (index, worker) in self.consumers.iter().enumerate() {
            let (tx, rx) = async_channel::unbounded();
            senders.push(tx);
            let core = MachineCore::new(
                format!("consumer-{index}:{}", worker.name()),
                WorkerRole::Consumer,
                &global,
                escalation.clone(),
            );
            consumer_machines.push(ConsumerMachine::new(
                core,
                worker.clone(),
                self.pool.clone(),
                rx,
            ));
        }

        let mut reference_rx: Option<
            watch::Receiver<Option<std::result::Result<HashDigest, EngineError>>>,
        > = None;
        let reference_machine = factory.as_ref().map(|f| {
            let (tx, rx) = async_channel::unbounded();
            senders.push(tx);
            let worker: Arc<dyn Consumer> = Arc::new(ReferenceHashWorker::new(f.create()));
            let core = MachineCore::new(
                "reference-hasher".to_string(),
                WorkerRole::ReferenceHasher,
                &global,
                escalation.clone(),
            );
            ConsumerMachine::new(core, worker, self.pool.clone(), rx)
        });

        let producer_core = MachineCore::new(
            format!("producer:{}", producer.name()),
            WorkerRole::Producer,
            &global,
            escalation.clone(),
        );
        let producer_machine = ProducerMachine::new(
            producer_core,
            producer.clone(),
            self.pool.clone(),
            senders,
            progress.clone(),
        );

        let (reference_tx, rx) = watch::channel(None);
        if factory.is_some() {
            reference_rx = Some(rx);
        }

        // Consumers and the reference hasher start first so every broadcast
        // block has a live receiver; the producer starts last. Every machine
        // is moved into its task so that a panicking lifecycle drops its
        // channel ends and the rest of the transfer can wind down.
        let consumer_handles: Vec<JoinHandle<WorkerCompletion>> = consumer_machines
            .into_iter()
            .map(|machine| {
                let pool = self.pool.clone();
                let verify = factory.as_ref().zip(reference_rx.as_ref()).map(
                    |(factory, reference)| VerifyPlan {
                        factory: factory.clone(),
                        reference: reference.clone(),
                    },
                );
                tokio::spawn(async move {
                    let core = machine.core().clone();
                    let worker = machine.worker().clone();
                    let body = machine.body();
                    run_worker_lifecycle(&core, &pool, worker.as_ref(), body, verify).await
                })
            })
            .collect();

        let reference_handle: Option<JoinHandle<WorkerCompletion>> =
            reference_machine.map(|machine| {
                let pool = self.pool.clone();
                tokio::spawn(async move {
                    let core = machine.core().clone();
                    let worker = machine.worker().clone();
                    let body = machine.body();
                    let completion =
                        run_worker_lifecycle(&core, &pool, worker.as_ref(), body, None).await;
                    let result = match (&completion.outcome, &completion.digest) {
                        (CompletionOutcome::Success, Some(digest)) => Ok(digest.clone()),
                        (CompletionOutcome::Success, None) => Err(EngineError::invariant(
                            "reference hasher produced no digest",
                        )),
                        (CompletionOutcome::Cancelled, _) => Err(EngineError::Cancelled),
                        (CompletionOutcome::Failed(e), _) => Err(e.clone()),
                        (CompletionOutcome::AggregateFailed(errors), _) => {
                            Err(EngineError::Aggregate(errors.clone()))
                        }
                    };
                    let _ = reference_tx.send(Some(result));
                    completion
                })
            });

        let producer_handle: JoinHandle<WorkerCompletion> = {
            let machine = producer_machine;
            let pool = self.pool.clone();
            let verify = factory
                .as_ref()
                .zip(reference_rx.as_ref())
                .map(|(factory, reference)| VerifyPlan {
                    factory: factory.clone(),
                    reference: reference.clone(),
                });
            tokio::spawn(async move {
                let core = machine.core().clone();
                let worker = machine.worker().clone();
                let body = machine.body();
                run_worker_lifecycle(&core, &pool, worker.as_ref(), body, verify).await
            })
        };

        // Await every machine; a panicked lifecycle task becomes an
        // invariant failure for that worker.
        let mut completions = Vec::with_capacity(self.consumers.len() + 2);
        completions.push(join_completion(producer_handle, "producer", WorkerRole::Producer).await);
        for (index, handle) in consumer_handles.into_iter().enumerate() {
            completions.push(
                join_completion(handle, &format!("consumer-{index}"), WorkerRole::Consumer).await,
            );
        }
        if let Some(handle) = reference_handle {
            let completion =
                join_completion(handle, "reference-hasher", WorkerRole::ReferenceHasher).await;
            if completion.outcome.is_success() {
                *self
                    .reference_hash
                    .lock()
                    .expect("coordinator lock poisoned") = completion.digest.clone();
            }
            completions.push(completion);
        }

        let completed_at = Utc::now();
        let elapsed = start.elapsed();
        let bytes = progress.bytes();
        let bytes_per_second = if elapsed.as_secs_f64() > 0.0 {
            bytes as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        let pool_check = self.pool.assert_idle();

        let report = TransferReport {
            run_id: run_id.clone(),
            started_at,
            completed_at,
            duration_seconds: elapsed.as_secs_f64(),
            blocks_transferred: progress.blocks(),
            bytes_transferred: bytes,
            bytes_per_second,
            reference_hash: self.reference_hash().map(|d| d.to_hex()),
            workers: completions.iter().map(WorkerSummary::from_completion).collect(),
        };

        let mut aggregated = aggregate_completions(&completions);
        if let Err(pool_err) = pool_check {
            aggregated = Some(match aggregated {
                None => pool_err,
                Some(previous) => EngineError::Aggregate(vec![previous, pool_err]),
            });
        }

        *self
            .completions
            .lock()
            .expect("coordinator lock poisoned") = completions;

        match aggregated {
            None => {
                info!(
                    run_id = %run_id,
                    blocks = report.blocks_transferred,
                    bytes = report.bytes_transferred,
                    duration = %format!("{:.3}s", report.duration_seconds),
                    "transfer finished"
                );
                Ok(report)
            }
            Some(error) => {
                warn!(run_id = %run_id, error = %error, "transfer failed");
                Err(error)
            }
        }
    }
}

impl Drop for TransferCoordinator {
    fn drop(&mut self) {
        self.pool.close();
    }
}

async fn join_completion(
    handle: JoinHandle<WorkerCompletion>,
    label: &str,
    role: WorkerRole,
) -> WorkerCompletion {
    match handle.await {
        Ok(completion) => completion,
        Err(join_err) => WorkerCompletion {
            worker: label.to_string(),
            role,
            outcome: CompletionOutcome::Failed(EngineError::invariant(format!(
                "worker lifecycle panicked: {join_err}"
            ))),
            digest: None,
        },
    }
}
