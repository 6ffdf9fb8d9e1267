//! Worker spawning.
//!
//! [`ForkSpawner`] forks the scheduler process itself; the child runs one
//! round via [`worker_main`] and `_exit`s. The socket pair is created before
//! the fork so both processes share it without any rendezvous.

use std::os::unix::net::UnixStream;
use std::sync::Arc;

use nix::unistd::{ForkResult, Pid, fork, getpid};

use crate::worker::{Extractor, worker_main};

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to create worker channel: {0}")]
    Channel(#[source] std::io::Error),
    #[error("fork failed: {0}")]
    Fork(#[source] nix::Error),
    #[error("cannot fork from a multi-threaded runtime")]
    Unsupported,
}

/// A freshly started worker and the scheduler end of its channel.
#[derive(Debug)]
pub struct SpawnedWorker {
    /// `None` when the worker is not a separate process.
    pub pid: Option<Pid>,
    pub stream: UnixStream,
}

/// Extension point for different worker spawn strategies.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self) -> Result<SpawnedWorker, SpawnError>;
}

/// Forks single-use workers that run `extractor`.
pub struct ForkSpawner {
    extractor: Arc<dyn Extractor>,
}

impl ForkSpawner {
    pub fn new(extractor: Arc<dyn Extractor>) -> Self {
        Self { extractor }
    }
}

impl WorkerSpawner for ForkSpawner {
    fn spawn(&self) -> Result<SpawnedWorker, SpawnError> {
        if let Ok(handle) = tokio::runtime::Handle::try_current()
            && handle.runtime_flavor() != tokio::runtime::RuntimeFlavor::CurrentThread
        {
            return Err(SpawnError::Unsupported);
        }

        // std creates both ends with SOCK_CLOEXEC.
        let (scheduler_end, worker_end) = UnixStream::pair().map_err(SpawnError::Channel)?;
        let parent = getpid();

        // Safety: the scheduler runs on a current-thread runtime (checked
        // above), and the child only runs `worker_main`, which never returns.
        match unsafe { fork() }.map_err(SpawnError::Fork)? {
            ForkResult::Parent { child } => {
                drop(worker_end);
                tracing::debug!(pid = child.as_raw(), "Forked worker");
                Ok(SpawnedWorker {
                    pid: Some(child),
                    stream: scheduler_end,
                })
            }
            ForkResult::Child => {
                drop(scheduler_end);
                worker_main(worker_end, parent, self.extractor.as_ref())
            }
        }
    }
}
