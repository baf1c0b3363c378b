//! Rayon pool for batch execution.
//!
//! Batch execution is CPU bound and must never run on a chain's event loop
//! thread. Every chain of a node shares one [`VmPool`]; results come back to
//! the owning chain as [`ChainEvent::VmResult`] through its intake channel.
//!
//! ```no_run
//! use quorumstate_production::{VmPool, VmPoolConfig};
//!
//! let pool = VmPool::new(VmPoolConfig::auto()).unwrap();
//! assert!(pool.threads() >= 1);
//! ```

use crossbeam::channel::Sender;
use quorumstate_consensus::run_batch;
use quorumstate_core::{BlobCache, ChainEvent, VmProcessor, VmTask};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

/// Errors from pool construction.
#[derive(Debug, Error)]
pub enum ThreadPoolError {
    #[error("Failed to build rayon thread pool: {0}")]
    RayonBuildError(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Sizing of the execution pool.
#[derive(Debug, Clone)]
pub struct VmPoolConfig {
    /// Number of execution threads.
    pub threads: usize,

    /// Stack size per execution thread (bytes). Default: 4MB.
    pub stack_size: usize,
}

impl Default for VmPoolConfig {
    fn default() -> Self {
        Self::auto()
    }
}

impl VmPoolConfig {
    /// Half the available cores, at least one.
    pub fn auto() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            threads: (cores / 2).max(1),
            stack_size: 4 * 1024 * 1024,
        }
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn validate(&self) -> Result<(), ThreadPoolError> {
        if self.threads == 0 {
            return Err(ThreadPoolError::InvalidConfig(
                "threads must be at least 1".to_string(),
            ));
        }
        if self.stack_size < 64 * 1024 {
            return Err(ThreadPoolError::InvalidConfig(
                "stack_size must be at least 64KB".to_string(),
            ));
        }
        Ok(())
    }
}

/// Shared execution pool.
pub struct VmPool {
    pool: rayon::ThreadPool,
    pending: Arc<AtomicUsize>,
}

impl std::fmt::Debug for VmPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmPool")
            .field("threads", &self.pool.current_num_threads())
            .field("pending", &self.pending())
            .finish()
    }
}

impl VmPool {
    pub fn new(config: VmPoolConfig) -> Result<Self, ThreadPoolError> {
        config.validate()?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.threads)
            .stack_size(config.stack_size)
            .thread_name(|i| format!("vm-{i}"))
            .build()
            .map_err(|e| ThreadPoolError::RayonBuildError(e.to_string()))?;
        debug!(threads = config.threads, "VM pool started");
        Ok(Self {
            pool,
            pending: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Batches queued or running.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    /// Execute `task` in the background and deliver the result to
    /// `results`. Returns immediately.
    pub fn execute(
        &self,
        vm: Arc<dyn VmProcessor>,
        blobs: Arc<dyn BlobCache>,
        task: VmTask,
        results: Sender<ChainEvent>,
    ) {
        self.pending.fetch_add(1, Ordering::Relaxed);
        let pending = Arc::clone(&self.pending);
        self.pool.spawn(move || {
            let result = run_batch(vm.as_ref(), blobs.as_ref(), &task);
            trace!(
                state_index = task.state_index().0,
                ok = result.is_ok(),
                "Batch executed"
            );
            // The chain may have shut down meanwhile.
            let _ = results.send(ChainEvent::VmResult {
                state_index: task.state_index(),
                batch_hash: task.batch_hash,
                result,
            });
            pending.fetch_sub(1, Ordering::Relaxed);
        });
    }
}
