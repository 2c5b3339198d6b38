//! File-backed producer worker.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::debug;

use crate::buffer::Block;
use crate::error::{EngineError, Result};
use crate::hash::HashDigest;
use crate::worker::{Producer, VerifyContext, Worker, WorkerContext};

use super::read_full_at;

#[derive(Default)]
struct ReaderState {
    file: Option<Arc<File>>,
    file_len: u64,
    ctx: Option<WorkerContext>,
}

/// Producer that streams a file as sequential fixed-size blocks.
///
/// Fill calls address the file at `sequence * block_size`, so they are
/// position-independent and may run concurrently when configured with a
/// concurrency above 1.
pub struct FileBlockReader {
    label: String,
    path: PathBuf,
    concurrency: usize,
    direct_io: bool,
    state: Mutex<ReaderState>,
}

impl FileBlockReader {
    /// Create a reader for the file at `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        Self {
            label: format!("file-reader:{}", path.display()),
            path,
            concurrency: 1,
            direct_io: false,
            state: Mutex::new(ReaderState::default()),
        }
    }

    /// Set the number of concurrent fill calls to allow.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Open the file without OS buffering (Linux `O_DIRECT`).
    pub fn with_direct_io(mut self, enabled: bool) -> Self {
        self.direct_io = enabled;
        self
    }

    fn open_options(&self) -> std::fs::OpenOptions {
        let mut options = std::fs::OpenOptions::new();
        options.read(true);
        #[cfg(target_os = "linux")]
        if self.direct_io {
            use std::os::unix::fs::OpenOptionsExt;
            options.custom_flags(libc::O_DIRECT);
        }
        options
    }

    fn handle(&self) -> Result<(Arc<File>, u64)> {
        let state = self.state.lock().expect("reader lock poisoned");
        if let Some(ctx) = &state.ctx {
            if ctx.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
        }
        let file = state
            .file
            .clone()
            .ok_or_else(|| EngineError::invariant("file reader used before initialize"))?;
        Ok((file, state.file_len))
    }
}

#[async_trait]
impl Worker for FileBlockReader {
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
        let file_len = file.metadata()?.len();

        debug!(worker = %self.label, file_len, "opened source file");

        let mut state = self.state.lock().expect("reader lock poisoned");
        state.file = Some(Arc::new(file));
        state.file_len = file_len;
        state.ctx = Some(ctx);
        Ok(())
    }

    async fn finalize(&self, verify: Option<&mut VerifyContext>) -> Result<Option<HashDigest>> {
        let (file, file_len) = {
            let mut state = self.state.lock().expect("reader lock poisoned");
            state.ctx = None;
            (state.file.take(), state.file_len)
        };

        let (Some(verify), Some(file)) = (verify, file) else {
            return Ok(None);
        };

        // Verification pass: re-read the whole source through the scratch
        // block and feed it into the hash engine.
        let scratch = verify.scratch().clone();
        let mut offset = 0u64;
        while offset < file_len {
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
impl Producer for FileBlockReader {
    async fn fill(&self, block: &Arc<Block>) -> Result<usize> {
        let (file, file_len) = self.handle()?;

        let block_size = block.capacity() as u64;
        let offset = block.sequence() * block_size;
        if offset >= file_len {
            return Ok(0);
        }
        let want = (file_len - offset).min(block_size) as usize;

        let target = block.clone();
        let read = tokio::task::spawn_blocking(move || {
            read_full_at(&file, target.memory_mut(), offset)
        })
        .await
        .map_err(|e| EngineError::invariant(format!("read task panicked: {e}")))??;

        if read < want {
            return Err(EngineError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("short read at offset {offset}: {read} of {want} bytes"),
            )));
        }
        Ok(want)
    }
}
