//! File-backed consumer worker.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::debug;

use crate::buffer::Block;
use crate::error::{EngineError, Result};
use crate::hash::HashDigest;
use crate::worker::{Consumer, VerifyContext, Worker, WorkerContext};

use super::{read_full_at, write_full_at};

#[derive(Default)]
struct WriterState {
    file: Option<Arc<File>>,
    ctx: Option<WorkerContext>,
}

/// Consumer that writes the block stream to a file.
///
/// Each drain writes at `sequence * block_size`, so overlapping drains land
/// at their correct absolute positions. In direct-IO mode a short final
/// block is written out to the full block boundary; finalize truncates the
/// file to the true byte length in every mode.
pub struct FileBlockWriter {
    label: String,
    path: PathBuf,
    concurrency: usize,
    direct_io: bool,
    state: Mutex<WriterState>,
    logical_len: AtomicU64,
}

impl FileBlockWriter {
    /// Create a writer targeting the file at `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        Self {
            label: format!("file-writer:{}", path.display()),
            path,
            concurrency: 1,
            direct_io: false,
            state: Mutex::new(WriterState::default()),
            logical_len: AtomicU64::new(0),
        }
    }

    /// Set the number of concurrent drain calls to allow.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Open the file without OS buffering (Linux `O_DIRECT`).
    pub fn with_direct_io(mut self, enabled: bool) -> Self {
        self.direct_io = enabled;
        self
    }

    /// The destination path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open_options(&self) -> std::fs::OpenOptions {
        let mut options = std::fs::OpenOptions::new();
        options.read(true).write(true).create(true).truncate(true);
        #[cfg(target_os = "linux")]
        if self.direct_io {
            use std::os::unix::fs::OpenOptionsExt;
            options.custom_flags(libc::O_DIRECT);
        }
        options
    }

    fn handle(&self) -> Result<Arc<File>> {
        let state = self.state.lock().expect("writer lock poisoned");
        if let Some(ctx) = &state.ctx {
            if ctx.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
        }
        state
            .file
            .clone()
            .ok_or_else(|| EngineError::invariant("file writer used before initialize"))
    }
}

#[async_trait]
impl Worker for FileBlockWriter {
    fn name(&self) -> &str {
        &self.label
    }

    fn max_concurrency(&self) -> usize {
        self.concurrency
    }

    async fn initialize(&self, ctx: WorkerContext) -> Result<()> {
        let path = self.path.clone();
        let options = self.open_options();
        let file = tokio::task::spawn_blocking(move || options.open(path))
            .await
            .map_err(|e| EngineError::invariant(format!("open task panicked: {e}")))??;

        debug!(worker = %self.label, "opened destination file");

        self.logical_len.store(0, Ordering::Release);
        let mut state = self.state.lock().expect("writer lock poisoned");
        state.file = Some(Arc::new(file));
        state.ctx = Some(ctx);
        Ok(())
    }

    async fn finalize(&self, verify: Option<&mut VerifyContext>) -> Result<Option<HashDigest>> {
        let file = {
            let mut state = self.state.lock().expect("writer lock poisoned");
            state.ctx = None;
            state.file.take()
        };
        let Some(file) = file else {
            return Ok(None);
        };

        // Truncate away any block-boundary overhang and flush to disk.
        let logical_len = self.logical_len.load(Ordering::Acquire);
        {
            let file = file.clone();
            tokio::task::spawn_blocking(move || -> std::io::Result<()> {
                file.set_len(logical_len)?;
                file.sync_all()
            })
            .await
            .map_err(|e| EngineError::invariant(format!("sync task panicked: {e}")))??;
        }

        let Some(verify) = verify else {
            return Ok(None);
        };

        // Verification pass: re-read what was written through the scratch
        // block and feed it into the hash engine.
        let scratch = verify.scratch().clone();
        let mut offset = 0u64;
        while offset < logical_len {
            let file = file.clone();
            let chunk = scratch.clone();
            let n = tokio::task::spawn_blocking(move || {
                read_full_at(&file, chunk.memory_mut(), offset)
            })
            .await
            .map_err(|e| EngineError::invariant(format!("read task panicked: {e}")))??;
            if n == 0 {
                break;
            }
            verify.append(&scratch.memory()[..n]);
            offset += n as u64;
        }

        Ok(Some(verify.finish()))
    }
}

#[async_trait]
impl Consumer for FileBlockWriter {
    async fn drain(&self, block: &Arc<Block>) -> Result<()> {
        let file = self.handle()?;

        let offset = block.sequence() * block.capacity() as u64;
        let len = block.len();

        // Direct IO requires sector-granular writes: a short final block is
        // written out to the block boundary and trimmed back at finalize.
        let write_whole_block = self.direct_io && len < block.capacity();

        let source = block.clone();
        tokio::task::spawn_blocking(move || {
            let buf = if write_whole_block {
                source.memory()
            } else {
                source.data()
            };
            write_full_at(&file, buf, offset)
        })
        .await
        .map_err(|e| EngineError::invariant(format!("write task panicked: {e}")))??;

        self.logical_len
            .fetch_max(offset + len as u64, Ordering::AcqRel);
        Ok(())
    }
}
