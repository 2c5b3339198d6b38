//! Per-worker state machines and their shared lifecycle.
//!
//! Each worker runs inside a state machine that owns it. The machine records
//! every exception instead of rethrowing through the body loop; the first
//! recorded exception fires the machine's internal cancellation (a child of
//! the coordinator's global scope) and reports the fault to the coordinator
//! for escalation. The machine's completion carries the recorded exceptions.

mod consumer;
mod producer;

pub(crate) use consumer::ConsumerMachine;
pub(crate) use producer::ProducerMachine;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::buffer::BufferPool;
use crate::error::EngineError;
use crate::hash::{HashDigest, HasherFactory};
use crate::worker::{VerifyContext, Worker, WorkerContext};

/// Which role a state machine drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkerRole {
    Producer,
    Consumer,
    ReferenceHasher,
}

impl std::fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerRole::Producer => f.write_str("producer"),
            WorkerRole::Consumer => f.write_str("consumer"),
            WorkerRole::ReferenceHasher => f.write_str("reference-hasher"),
        }
    }
}

/// How a worker's run ended.
#[derive(Debug, Clone)]
pub enum CompletionOutcome {
    /// No exceptions were recorded.
    Success,
    /// Only cancellation exceptions were recorded.
    Cancelled,
    /// A single non-cancellation failure.
    Failed(EngineError),
    /// Multiple independent non-cancellation failures.
    AggregateFailed(Vec<EngineError>),
}

impl CompletionOutcome {
    /// Derive the outcome from a machine's recorded exceptions.
    pub fn from_errors(errors: Vec<EngineError>) -> Self {
        if errors.is_empty() {
            return CompletionOutcome::Success;
        }
        let mut failures: Vec<EngineError> = errors
            .into_iter()
            .filter(|e| !e.is_cancellation())
            .collect();
        match failures.len() {
            0 => CompletionOutcome::Cancelled,
            1 => CompletionOutcome::Failed(failures.remove(0)),
            _ => CompletionOutcome::AggregateFailed(failures),
        }
    }

    /// Whether the worker completed without any exception.
    pub fn is_success(&self) -> bool {
        matches!(self, CompletionOutcome::Success)
    }
}

/// Final state of one worker after a transfer.
#[derive(Debug, Clone)]
pub struct WorkerCompletion {
    /// The worker's name.
    pub worker: String,
    /// The role its machine drove.
    pub role: WorkerRole,
    /// How the run ended.
    pub outcome: CompletionOutcome,
    /// Digest returned by finalize: the verification digest for verified
    /// workers, the reference digest for the reference hasher.
    pub digest: Option<HashDigest>,
}

/// Decides when a worker fault escalates to global cancellation.
///
/// Global cancellation fires when the producer fails, when the reference
/// hasher fails, or when every consumer is faulted. A single failing
/// consumer leaves the transfer running for the rest.
pub(crate) struct Escalation {
    global: CancellationToken,
    consumers_total: usize,
    consumers_faulted: AtomicUsize,
}

impl Escalation {
    pub fn new(global: CancellationToken, consumers_total: usize) -> Self {
        Self {
            global,
            consumers_total,
            consumers_faulted: AtomicUsize::new(0),
        }
    }

    fn worker_faulted(&self, role: WorkerRole) {
        match role {
            WorkerRole::Producer | WorkerRole::ReferenceHasher => self.global.cancel(),
            WorkerRole::Consumer => {
                let faulted = self.consumers_faulted.fetch_add(1, Ordering::AcqRel) + 1;
                if faulted >= self.consumers_total {
                    self.global.cancel();
                }
            }
        }
    }
}

/// State shared by every machine: label, internal cancellation scope and
/// the exception accumulator.
pub(crate) struct MachineCore {
    label: String,
    role: WorkerRole,
    cancel: CancellationToken,
    errors: Mutex<Vec<EngineError>>,
    escalation: Arc<Escalation>,
}

impl MachineCore {
    pub fn new(
        label: String,
        role: WorkerRole,
        global: &CancellationToken,
        escalation: Arc<Escalation>,
    ) -> Arc<Self> {
        Arc::new(Self {
            label,
            role,
            cancel: global.child_token(),
            errors: Mutex::new(Vec::new()),
            escalation,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// The machine's internal cancellation scope.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Record an exception. The first one fires internal cancellation and
    /// reports the fault for escalation.
    pub fn record(&self, error: EngineError) {
        let first = {
            let mut errors = self.errors.lock().expect("machine error lock poisoned");
            let first = errors.is_empty();
            if error.is_cancellation() {
                debug!(machine = %self.label, "recorded cancellation");
            } else {
                warn!(machine = %self.label, error = %error, "recorded failure");
            }
            errors.push(error);
            first
        };
        if first {
            self.cancel.cancel();
            self.escalation.worker_faulted(self.role);
        }
    }

    /// Whether at least one exception has been recorded.
    pub fn is_faulted(&self) -> bool {
        !self
            .errors
            .lock()
            .expect("machine error lock poisoned")
            .is_empty()
    }

    fn take_errors(&self) -> Vec<EngineError> {
        std::mem::take(&mut *self.errors.lock().expect("machine error lock poisoned"))
    }
}

/// Shared progress counters for one transfer.
#[derive(Debug, Default)]
pub(crate) struct StreamProgress {
    blocks: AtomicU64,
    bytes: AtomicU64,
}

impl StreamProgress {
    pub fn add_block(&self, len: usize) {
        self.blocks.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(len as u64, Ordering::Relaxed);
    }

    pub fn blocks(&self) -> u64 {
        self.blocks.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

/// Inputs for a worker's verification pass.
pub(crate) struct VerifyPlan {
    pub factory: Arc<dyn HasherFactory>,
    pub reference: watch::Receiver<Option<Result<HashDigest, EngineError>>>,
}

/// Drive one worker through its full lifecycle:
///
/// 1. initialize (failure recorded, lifecycle continues)
/// 2. the machine body, under internal cancellation
/// 3. two-pass verification for non-faulted workers when requested
/// 4. finalize, exactly once on every path
/// 5. scratch block returned and hash engine released unconditionally
pub(crate) async fn run_worker_lifecycle<W>(
    core: &Arc<MachineCore>,
    pool: &Arc<BufferPool>,
    worker: &W,
    body: impl std::future::Future<Output = ()>,
    verify: Option<VerifyPlan>,
) -> WorkerCompletion
where
    W: Worker + ?Sized,
{
    let ctx = WorkerContext::new(
        core.label.clone(),
        pool.block_size(),
        core.cancel.clone(),
    );
    if let Err(e) = worker.initialize(ctx).await {
        core.record(EngineError::worker(core.label.clone(), e));
    }

    body.await;

    // Verification preparation: await the reference digest, then rent the
    // scratch block without observing cancellation so finalize always runs.
    let mut reference_digest: Option<HashDigest> = None;
    let mut verify_ctx: Option<VerifyContext> = None;
    if let Some(plan) = verify {
        if !core.is_faulted() {
            let mut reference = plan.reference;
            let outcome = match reference.wait_for(|v| v.is_some()).await {
                Ok(value) => value
                    .clone()
                    .unwrap_or_else(|| Err(EngineError::invariant("empty reference result"))),
                Err(_) => Err(EngineError::invariant(
                    "reference hasher completed without publishing a result",
                )),
            };
            match outcome {
                Ok(digest) => match pool.rent_uncancellable().await {
                    Ok(scratch) => {
                        reference_digest = Some(digest);
                        verify_ctx = Some(VerifyContext {
                            hasher: plan.factory.create(),
                            scratch,
                        });
                    }
                    Err(e) => core.record(e),
                },
                Err(cause) => {
                    core.record(EngineError::ReferenceHashFailed(Box::new(cause)));
                }
            }
        }
    }

    let mut digest: Option<HashDigest> = None;
    match worker.finalize(verify_ctx.as_mut()).await {
        Ok(d) => digest = d,
        Err(e) => core.record(EngineError::worker(core.label.clone(), e)),
    }

    if let Some(VerifyContext { hasher, scratch }) = verify_ctx.take() {
        drop(hasher);
        if let Err(e) = pool.release(scratch) {
            core.record(e);
        }
    }

    if let Some(reference) = reference_digest {
        match &digest {
            Some(actual) if *actual == reference => {
                debug!(machine = %core.label, digest = %actual, "verification digest matches");
            }
            Some(actual) => {
                core.record(EngineError::HashMismatch {
                    worker: core.label.clone(),
                    expected: reference.to_hex(),
                    actual: actual.to_hex(),
                });
            }
            None => {
                core.record(EngineError::invariant(format!(
                    "worker {} returned no verification digest",
                    core.label
                )));
            }
        }
    }

    WorkerCompletion {
        worker: core.label.clone(),
        role: core.role,
        outcome: CompletionOutcome::from_errors(core.take_errors()),
        digest,
    }
}

/// Fold per-worker completions into the single error `execute` surfaces.
///
/// Only cancellations collapse to a single `Cancelled`; one real failure is
/// surfaced as-is; several are reported together.
pub(crate) fn aggregate_completions(completions: &[WorkerCompletion]) -> Option<EngineError> {
    let mut failures: Vec<EngineError> = Vec::new();
    let mut any_cancelled = false;
    for completion in completions {
        match &completion.outcome {
            CompletionOutcome::Success => {}
            CompletionOutcome::Cancelled => any_cancelled = true,
            CompletionOutcome::Failed(e) => failures.push(e.clone()),
            CompletionOutcome::AggregateFailed(errors) => {
                failures.extend(errors.iter().cloned())
            }
        }
    }
    match failures.len() {
        0 if any_cancelled => Some(EngineError::Cancelled),
        0 => None,
        1 => failures.pop(),
        _ => Some(EngineError::Aggregate(failures)),
    }
}
