//! Worker pool: slots, request queue and dispatch.
//!
//! The pool is plain state owned by the scheduler task. Nothing here awaits;
//! sessions are started through a [`SessionRunner`] and report back through
//! [`WorkerPool::finish`].
//!
//! ```text
//! enqueue ──► RequestQueue ──dispatch_once──► spawn ──► Slot::begin ──► runner.start
//!                  ▲                                                        │
//!                  └──── retry (spawn failed) ◄─┐           finish/abort ◄──┘
//! ```

pub mod queue;
pub mod reaper;
pub mod slot;
pub mod spawn;

use std::io;
use std::os::unix::net::UnixStream;
use std::sync::Arc;

use serde::Serialize;

use crate::bridge::protocol::ExtractParams;
use crate::bridge::session::{ExtractOutcome, TransferError};
use crate::config::SchedulerConfig;
use crate::error::ExtractError;

pub use queue::{PendingRequest, RequestId, RequestQueue};
pub use reaper::Reaper;
pub use slot::{Released, SessionControl, Slot, SlotId, WorkerProcess};
pub use spawn::{ForkSpawner, SpawnError, SpawnedWorker, WorkerSpawner};

/// Everything a session task needs to run one round.
#[derive(Debug)]
pub struct SessionLaunch {
    pub slot: SlotId,
    pub generation: u64,
    pub stream: UnixStream,
    pub params: ExtractParams,
    pub max_payload_len: u64,
}

/// Result of a session, tagged with the round it belongs to.
#[derive(Debug)]
pub struct SessionReport {
    pub slot: SlotId,
    pub generation: u64,
    pub result: Result<ExtractOutcome, TransferError>,
}

/// Starts the scheduler side of a round.
///
/// Errors mean the channel could not be set up (non-blocking mode or reactor
/// registration); the worker is already running at that point.
pub trait SessionRunner: Send {
    fn start(&mut self, launch: SessionLaunch) -> io::Result<SessionControl>;
}

/// What a single `dispatch_once` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Queue empty.
    Idle,
    /// Work queued but every slot is busy.
    Saturated,
    Started { slot: SlotId, request: RequestId },
    /// Spawn failed; the request is back at the head awaiting a retry.
    Deferred { request: RequestId },
    /// The head request was failed and removed.
    Failed { request: RequestId },
}

impl Dispatch {
    /// True if another dispatch call could make further progress.
    pub fn made_progress(&self) -> bool {
        matches!(self, Self::Started { .. } | Self::Failed { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Dequeued,
    Aborted(SlotId),
    NotFound,
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub total_slots: usize,
    pub busy_slots: usize,
    pub queued: usize,
    pub pending_reap: usize,
}

pub struct WorkerPool {
    slots: Vec<Slot>,
    queue: RequestQueue,
    spawner: Arc<dyn WorkerSpawner>,
    runner: Box<dyn SessionRunner>,
    reaper: Reaper,
    max_spawn_attempts: u32,
    max_payload_len: u64,
}

impl WorkerPool {
    pub fn new(
        config: &SchedulerConfig,
        spawner: Arc<dyn WorkerSpawner>,
        runner: Box<dyn SessionRunner>,
    ) -> Self {
        let size = config.pool_size.max(1);
        Self {
            slots: (0..size).map(|i| Slot::new(SlotId::new(i))).collect(),
            queue: RequestQueue::new(),
            spawner,
            runner,
            reaper: Reaper::new(config.kill_grace),
            max_spawn_attempts: config.max_spawn_attempts.max(1),
            max_payload_len: config.max_payload_len,
        }
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            total_slots: self.slots.len(),
            busy_slots: self.slots.iter().filter(|s| s.is_busy()).count(),
            queued: self.queue.len(),
            pending_reap: self.reaper.len(),
        }
    }

    /// Append to the queue tail. Does not dispatch.
    pub fn enqueue(&mut self, request: PendingRequest) {
        tracing::debug!(request_id = %request.id, queued = self.queue.len() + 1, "Request queued");
        self.queue.push_back(request);
    }

    /// Try to move the queue head onto a free slot. Safe to call at any time.
    pub fn dispatch_once(&mut self) -> Dispatch {
        let Some(index) = self.slots.iter().position(|s| !s.is_busy()) else {
            return if self.queue.is_empty() {
                Dispatch::Idle
            } else {
                Dispatch::Saturated
            };
        };

        let request = loop {
            match self.queue.pop_front() {
                None => return Dispatch::Idle,
                Some(request) if request.is_abandoned() => {
                    tracing::debug!(request_id = %request.id, "Skipping abandoned request");
                }
                Some(request) => break request,
            }
        };
        let request_id = request.id;

        let spawned = match self.spawner.spawn() {
            Ok(spawned) => spawned,
            Err(e) => return self.spawn_failed(request, e),
        };

        let slot = &mut self.slots[index];
        let slot_id = slot.id();
        let params = request.params.clone();
        let worker = WorkerProcess { pid: spawned.pid };
        let generation = slot.begin(worker, request);

        let launch = SessionLaunch {
            slot: slot_id,
            generation,
            stream: spawned.stream,
            params,
            max_payload_len: self.max_payload_len,
        };

        match self.runner.start(launch) {
            Ok(control) => {
                slot.attach_session(control);
                tracing::debug!(
                    %slot_id,
                    request_id = %request_id,
                    pid = worker.pid.map(|p| p.as_raw()),
                    "Request dispatched"
                );
                Dispatch::Started {
                    slot: slot_id,
                    request: request_id,
                }
            }
            Err(e) => {
                tracing::error!(%slot_id, request_id = %request_id, error = %e, "Worker channel setup failed");
                if let Some(released) = slot.release() {
                    self.retire_worker(released.worker, true);
                    released
                        .request
                        .complete(Err(ExtractError::Transport(e.to_string())));
                }
                Dispatch::Failed {
                    request: request_id,
                }
            }
        }
    }

    fn spawn_failed(&mut self, mut request: PendingRequest, err: SpawnError) -> Dispatch {
        request.spawn_failures += 1;
        let request_id = request.id;

        // Retrying cannot help when forking is refused outright.
        if matches!(err, SpawnError::Unsupported)
            || request.spawn_failures >= self.max_spawn_attempts
        {
            tracing::error!(
                request_id = %request_id,
                attempts = request.spawn_failures,
                error = %err,
                "Giving up on worker spawn"
            );
            request.complete(Err(ExtractError::Process(err.to_string())));
            return Dispatch::Failed {
                request: request_id,
            };
        }

        tracing::warn!(
            request_id = %request_id,
            attempt = request.spawn_failures,
            error = %err,
            "Worker spawn failed, will retry"
        );
        self.queue.push_front(request);
        Dispatch::Deferred {
            request: request_id,
        }
    }

    /// Dispatch until no further progress is possible. Returns the final step.
    pub fn pump(&mut self) -> Dispatch {
        loop {
            let step = self.dispatch_once();
            if !step.made_progress() {
                return step;
            }
        }
    }

    /// Apply a session report. Stale reports (aborted rounds) are ignored.
    ///
    /// Returns true if the report completed a request.
    pub fn finish(&mut self, report: SessionReport) -> bool {
        let Some(slot) = self.slots.get_mut(report.slot.index()) else {
            tracing::warn!(slot = %report.slot, "Report for unknown slot");
            return false;
        };
        if !slot.is_busy() || slot.generation() != report.generation {
            tracing::debug!(
                slot = %report.slot,
                generation = report.generation,
                current = slot.generation(),
                "Ignoring stale session report"
            );
            return false;
        }
        let Some(released) = slot.release() else {
            return false;
        };

        let (result, clean) = match report.result {
            Ok(outcome) => (outcome.into_result(), true),
            Err(e) => {
                tracing::warn!(slot = %report.slot, request_id = %released.request.id, error = %e, "Session failed");
                (Err(ExtractError::from(e)), false)
            }
        };

        // A worker that broke the round may still be running.
        self.retire_worker(released.worker, !clean);
        released.request.complete(result);
        true
    }

    /// Kill the slot's worker and fail its request with `Cancelled`.
    ///
    /// Returns the aborted request, or `None` if the slot was idle.
    pub fn force_abort(&mut self, slot_id: SlotId) -> Option<RequestId> {
        let slot = self.slots.get_mut(slot_id.index())?;
        let released = slot.release()?;
        let request_id = released.request.id;

        tracing::info!(slot = %slot_id, request_id = %request_id, "Force-aborting worker");
        self.retire_worker(released.worker, true);
        if let Some(session) = released.session {
            session.cancel();
        }
        released.request.complete(Err(ExtractError::Cancelled));
        Some(request_id)
    }

    /// Cancel a request wherever it is.
    pub fn cancel(&mut self, id: RequestId) -> CancelOutcome {
        if let Some(request) = self.queue.remove(id) {
            tracing::debug!(request_id = %id, "Cancelled queued request");
            request.complete(Err(ExtractError::Cancelled));
            return CancelOutcome::Dequeued;
        }

        let in_flight = self
            .slots
            .iter()
            .find(|s| s.request_id() == Some(id))
            .map(Slot::id);
        match in_flight.and_then(|slot| self.force_abort(slot).map(|_| slot)) {
            Some(slot) => CancelOutcome::Aborted(slot),
            None => CancelOutcome::NotFound,
        }
    }

    /// Collect exited workers.
    pub fn reap(&mut self) {
        self.reaper.poll();
    }

    /// Fail everything queued, abort everything in flight, reap every worker.
    pub fn shutdown(&mut self) {
        let queued = self.queue.drain();
        let busy: Vec<SlotId> = self
            .slots
            .iter()
            .filter(|s| s.is_busy())
            .map(Slot::id)
            .collect();
        tracing::info!(queued = queued.len(), in_flight = busy.len(), "Shutting down worker pool");

        for request in queued {
            request.complete(Err(ExtractError::Cancelled));
        }
        for slot in busy {
            self.force_abort(slot);
        }
        self.reaper.shutdown();
    }

    fn retire_worker(&mut self, worker: WorkerProcess, terminate: bool) {
        let Some(pid) = worker.pid else {
            return;
        };
        if terminate {
            self.reaper.terminate(pid);
        } else {
            self.reaper.adopt(pid);
        }
    }
}
