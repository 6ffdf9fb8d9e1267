//! Slot - one fixed pool position.
//!
//! A slot is busy exactly while it holds a request; there is no separate
//! flag to fall out of sync. Workers are single-use, so the worker and the
//! request are bound and released together.

use nix::unistd::Pid;
use tokio_util::sync::CancellationToken;

use super::queue::{PendingRequest, RequestId};

/// Index of a slot in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(usize);

impl SlotId {
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(&self) -> usize {
        self.0
    }
}

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "slot-{}", self.0)
    }
}

/// A forked worker. `pid` is `None` for in-process test doubles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerProcess {
    pub pid: Option<Pid>,
}

/// Handle that stops a running session task.
#[derive(Debug, Clone, Default)]
pub struct SessionControl {
    cancel: CancellationToken,
}

impl SessionControl {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Everything a slot held when it was released.
#[derive(Debug)]
pub struct Released {
    pub request: PendingRequest,
    pub worker: WorkerProcess,
    pub session: Option<SessionControl>,
}

#[derive(Debug)]
pub struct Slot {
    id: SlotId,
    generation: u64,
    worker: Option<WorkerProcess>,
    request: Option<PendingRequest>,
    session: Option<SessionControl>,
}

impl Slot {
    pub fn new(id: SlotId) -> Self {
        Self {
            id,
            generation: 0,
            worker: None,
            request: None,
            session: None,
        }
    }

    pub fn id(&self) -> SlotId {
        self.id
    }

    pub fn is_busy(&self) -> bool {
        self.request.is_some()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn request_id(&self) -> Option<RequestId> {
        self.request.as_ref().map(|r| r.id)
    }

    pub fn worker(&self) -> Option<WorkerProcess> {
        self.worker
    }

    /// Bind a fresh worker and its request. Returns the new generation.
    pub fn begin(&mut self, worker: WorkerProcess, request: PendingRequest) -> u64 {
        debug_assert!(!self.is_busy(), "begin on busy {}", self.id);
        self.generation += 1;
        self.worker = Some(worker);
        self.request = Some(request);
        self.session = None;
        self.generation
    }

    pub fn attach_session(&mut self, session: SessionControl) {
        self.session = Some(session);
    }

    /// Free the slot. `None` if it was idle.
    pub fn release(&mut self) -> Option<Released> {
        let request = self.request.take()?;
        let worker = self.worker.take().unwrap_or(WorkerProcess { pid: None });
        Some(Released {
            request,
            worker,
            session: self.session.take(),
        })
    }
}
