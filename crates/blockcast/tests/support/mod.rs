//! In-memory test workers: a deterministic pattern producer, a collecting
//! consumer, fault injection and concurrency probes.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use blockcast::{
    Block, Consumer, EngineError, HashDigest, Producer, Result, VerifyContext, Worker,
    WorkerContext,
};

/// Deterministic content byte for absolute stream position `i`.
pub fn pattern_byte(i: u64) -> u8 {
    (i.wrapping_mul(131).wrapping_add(i >> 9)) as u8
}

/// The full expected stream of length `len`.
pub fn pattern_bytes(len: u64) -> Vec<u8> {
    (0..len).map(pattern_byte).collect()
}

/// Injected fault configuration for a test worker.
#[derive(Debug, Clone, Copy, Default)]
pub struct Faults {
    pub fail_initialize: bool,
    pub fail_at_sequence: Option<u64>,
    pub fail_finalize: bool,
}

fn injected(stage: &str) -> EngineError {
    EngineError::Io(std::io::Error::other(format!("injected {stage} failure")))
}

/// Tracks how many calls overlap.
#[derive(Debug, Default)]
struct ConcurrencyProbe {
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ConcurrencyProbe {
    fn enter(&self) {
        let now = self.active.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak.fetch_max(now, Ordering::AcqRel);
    }

    fn exit(&self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }
}

/// Producer that generates the deterministic pattern stream.
pub struct MemoryProducer {
    label: String,
    total_len: u64,
    concurrency: usize,
    faults: Faults,
    ctx: Mutex<Option<WorkerContext>>,
    probe: ConcurrencyProbe,
    initialize_calls: AtomicUsize,
    finalize_calls: AtomicUsize,
}

impl MemoryProducer {
    pub fn new(total_len: u64) -> Self {
        Self {
            label: "memory-producer".to_string(),
            total_len,
            concurrency: 1,
            faults: Faults::default(),
            ctx: Mutex::new(None),
            probe: ConcurrencyProbe::default(),
            initialize_calls: AtomicUsize::new(0),
            finalize_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_faults(mut self, faults: Faults) -> Self {
        self.faults = faults;
        self
    }

    pub fn peak_concurrency(&self) -> usize {
        self.probe.peak()
    }

    pub fn initialize_calls(&self) -> usize {
        self.initialize_calls.load(Ordering::Acquire)
    }

    pub fn finalize_calls(&self) -> usize {
        self.finalize_calls.load(Ordering::Acquire)
    }

    fn check_cancelled(&self) -> Result<()> {
        let ctx = self.ctx.lock().unwrap();
        match ctx.as_ref() {
            Some(ctx) if ctx.is_cancelled() => Err(EngineError::Cancelled),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Worker for MemoryProducer {
    fn name(&self) -> &str {
        &self.label
    }

    fn max_concurrency(&self) -> usize {
        self.concurrency
    }

    async fn initialize(&self, ctx: WorkerContext) -> Result<()> {
        self.initialize_calls.fetch_add(1, Ordering::AcqRel);
        if self.faults.fail_initialize {
            return Err(injected("initialize"));
        }
        *self.ctx.lock().unwrap() = Some(ctx);
        Ok(())
    }

    async fn finalize(&self, verify: Option<&mut VerifyContext>) -> Result<Option<HashDigest>> {
        self.finalize_calls.fetch_add(1, Ordering::AcqRel);
        *self.ctx.lock().unwrap() = None;
        if self.faults.fail_finalize {
            return Err(injected("finalize"));
        }
        let Some(verify) = verify else {
            return Ok(None);
        };

        // Re-read "our own output": regenerate the pattern stream in
        // scratch-sized strides.
        let stride = verify.scratch().capacity() as u64;
        let mut offset = 0;
        while offset < self.total_len {
            let end = (offset + stride).min(self.total_len);
            let chunk: Vec<u8> = (offset..end).map(pattern_byte).collect();
            verify.append(&chunk);
            offset = end;
        }
        Ok(Some(verify.finish()))
    }
}

#[async_trait]
impl Producer for MemoryProducer {
    async fn fill(&self, block: &Arc<Block>) -> Result<usize> {
        self.check_cancelled()?;

        self.probe.enter();
        tokio::task::yield_now().await;

        let result = (|| {
            let sequence = block.sequence();
            if self.faults.fail_at_sequence == Some(sequence) {
                return Err(injected("fill"));
            }

            let block_size = block.capacity() as u64;
            let offset = sequence * block_size;
            if offset >= self.total_len {
                return Ok(0);
            }
            let n = ((self.total_len - offset).min(block_size)) as usize;
            let memory = block.memory_mut();
            for (i, byte) in memory[..n].iter_mut().enumerate() {
                *byte = pattern_byte(offset + i as u64);
            }
            Ok(n)
        })();

        self.probe.exit();
        result
    }
}

/// Consumer that collects the stream into memory at absolute positions.
pub struct MemoryConsumer {
    label: String,
    concurrency: usize,
    faults: Faults,
    corrupt_output: bool,
    drain_delay: Option<Duration>,
    data: Mutex<Vec<u8>>,
    received: Mutex<Vec<u64>>,
    ctx: Mutex<Option<WorkerContext>>,
    probe: ConcurrencyProbe,
    initialize_calls: AtomicUsize,
    finalize_calls: AtomicUsize,
}

impl MemoryConsumer {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            concurrency: 1,
            faults: Faults::default(),
            corrupt_output: false,
            drain_delay: None,
            data: Mutex::new(Vec::new()),
            received: Mutex::new(Vec::new()),
            ctx: Mutex::new(None),
            probe: ConcurrencyProbe::default(),
            initialize_calls: AtomicUsize::new(0),
            finalize_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_faults(mut self, faults: Faults) -> Self {
        self.faults = faults;
        self
    }

    /// Flip the last collected byte before the verification read-back.
    pub fn with_corrupt_output(mut self) -> Self {
        self.corrupt_output = true;
        self
    }

    pub fn with_drain_delay(mut self, delay: Duration) -> Self {
        self.drain_delay = Some(delay);
        self
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }

    /// Sequence numbers in drain order.
    pub fn received_sequences(&self) -> Vec<u64> {
        self.received.lock().unwrap().clone()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.probe.peak()
    }

    pub fn initialize_calls(&self) -> usize {
        self.initialize_calls.load(Ordering::Acquire)
    }

    pub fn finalize_calls(&self) -> usize {
        self.finalize_calls.load(Ordering::Acquire)
    }

    fn check_cancelled(&self) -> Result<()> {
        let ctx = self.ctx.lock().unwrap();
        match ctx.as_ref() {
            Some(ctx) if ctx.is_cancelled() => Err(EngineError::Cancelled),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Worker for MemoryConsumer {
    fn name(&self) -> &str {
        &self.label
    }

    fn max_concurrency(&self) -> usize {
        self.concurrency
    }

    async fn initialize(&self, ctx: WorkerContext) -> Result<()> {
        self.initialize_calls.fetch_add(1, Ordering::AcqRel);
        if self.faults.fail_initialize {
            return Err(injected("initialize"));
        }
        self.data.lock().unwrap().clear();
        self.received.lock().unwrap().clear();
        *self.ctx.lock().unwrap() = Some(ctx);
        Ok(())
    }

    async fn finalize(&self, verify: Option<&mut VerifyContext>) -> Result<Option<HashDigest>> {
        self.finalize_calls.fetch_add(1, Ordering::AcqRel);
        *self.ctx.lock().unwrap() = None;
        if self.faults.fail_finalize {
            return Err(injected("finalize"));
        }
        let Some(verify) = verify else {
            return Ok(None);
        };

        if self.corrupt_output {
            let mut data = self.data.lock().unwrap();
            if let Some(last) = data.last_mut() {
                *last ^= 0xff;
            }
        }

        let data = self.bytes();
        let stride = verify.scratch().capacity();
        for chunk in data.chunks(stride.max(1)) {
            verify.append(chunk);
        }
        Ok(Some(verify.finish()))
    }
}

#[async_trait]
impl Consumer for MemoryConsumer {
    async fn drain(&self, block: &Arc<Block>) -> Result<()> {
        self.check_cancelled()?;

        self.probe.enter();
        if let Some(delay) = self.drain_delay {
            tokio::time::sleep(delay).await;
        } else {
            tokio::task::yield_now().await;
        }

        let result = (|| {
            let sequence = block.sequence();
            if self.faults.fail_at_sequence == Some(sequence) {
                return Err(injected("drain"));
            }

            let offset = sequence as usize * block.capacity();
            let payload = block.data();
            let mut data = self.data.lock().unwrap();
            if data.len() < offset + payload.len() {
                data.resize(offset + payload.len(), 0);
            }
            data[offset..offset + payload.len()].copy_from_slice(payload);
            drop(data);

            self.received.lock().unwrap().push(sequence);
            Ok(())
        })();

        self.probe.exit();
        result
    }
}
