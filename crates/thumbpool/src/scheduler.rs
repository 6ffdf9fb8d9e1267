//! Scheduler event loop and its handle.
//!
//! The loop task owns the [`WorkerPool`]. Callers talk to it via
//! [`SchedulerHandle`]; session tasks report back over an mpsc channel. After
//! every event the loop pumps dispatch, except while a spawn retry is pending.
//!
//! Must run on a current-thread runtime: workers are forked from this process.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::bridge::channel::ControlChannel;
use crate::bridge::protocol::ExtractParams;
use crate::bridge::session::SchedulerSession;
use crate::bridge::transport::AsyncControlChannel;
use crate::config::SchedulerConfig;
use crate::job::ThumbnailJob;
use crate::pool::{
    CancelOutcome, Dispatch, PendingRequest, PoolStatus, RequestId, SessionControl, SessionLaunch,
    SessionReport, SessionRunner, SlotId, WorkerPool, WorkerSpawner,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    #[error("scheduler has stopped")]
    Stopped,
}

enum Command {
    Submit(PendingRequest),
    Cancel {
        id: RequestId,
        reply: Option<oneshot::Sender<CancelOutcome>>,
    },
    ForceAbort {
        slot: SlotId,
        reply: oneshot::Sender<Option<RequestId>>,
    },
    Status(oneshot::Sender<PoolStatus>),
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable entry point to a running scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl SchedulerHandle {
    /// Queue an extraction. Dropping the returned job cancels it.
    pub fn submit(&self, params: ExtractParams) -> Result<ThumbnailJob, SchedulerError> {
        let (request, completion) = PendingRequest::new(params);
        let id = request.id;
        self.send(Command::Submit(request))?;
        Ok(ThumbnailJob::new(id, completion, self.clone()))
    }

    pub async fn cancel(&self, id: RequestId) -> Result<CancelOutcome, SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Cancel {
            id,
            reply: Some(reply),
        })?;
        rx.await.map_err(|_| SchedulerError::Stopped)
    }

    /// Fire-and-forget cancel for drop paths.
    pub(crate) fn request_cancel(&self, id: RequestId) {
        let _ = self.send(Command::Cancel { id, reply: None });
    }

    /// Kill the worker in `slot` and fail its request. `None` if the slot was idle.
    pub async fn force_abort(&self, slot: SlotId) -> Result<Option<RequestId>, SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ForceAbort { slot, reply })?;
        rx.await.map_err(|_| SchedulerError::Stopped)
    }

    pub async fn status(&self) -> Result<PoolStatus, SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Status(reply))?;
        rx.await.map_err(|_| SchedulerError::Stopped)
    }

    /// Fail all work, kill all workers and stop the loop.
    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Shutdown(reply))?;
        rx.await.map_err(|_| SchedulerError::Stopped)
    }

    pub fn is_stopped(&self) -> bool {
        self.commands.is_closed()
    }

    fn send(&self, command: Command) -> Result<(), SchedulerError> {
        self.commands
            .send(command)
            .map_err(|_| SchedulerError::Stopped)
    }
}

/// Runs each round in its own task on the current runtime.
struct TaskSessionRunner {
    reports: mpsc::UnboundedSender<SessionReport>,
}

impl SessionRunner for TaskSessionRunner {
    fn start(&mut self, launch: SessionLaunch) -> std::io::Result<SessionControl> {
        let SessionLaunch {
            slot,
            generation,
            stream,
            params,
            max_payload_len,
        } = launch;

        let channel = ControlChannel::from_stream(stream)?;
        let mut channel = AsyncControlChannel::register(channel)?;
        let mut session = SchedulerSession::new(&params, max_payload_len);

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let reports = self.reports.clone();

        tokio::spawn(async move {
            tokio::select! {
                biased;

                _ = token.cancelled() => {
                    let discarded = channel.drain();
                    tracing::debug!(%slot, generation, step = %session.step(), discarded, "Session aborted");
                }
                result = channel.run_round(&mut session) => {
                    if reports.send(SessionReport { slot, generation, result }).is_err() {
                        tracing::debug!(%slot, "Scheduler gone before session report");
                    }
                }
            }
        });

        Ok(SessionControl::new(cancel))
    }
}

pub struct Scheduler;

impl Scheduler {
    /// Start the event loop on the current runtime.
    pub fn spawn(config: SchedulerConfig, spawner: Arc<dyn WorkerSpawner>) -> SchedulerHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();

        let runner = TaskSessionRunner {
            reports: reports_tx,
        };
        let pool = WorkerPool::new(&config, spawner, Box::new(runner));

        tracing::info!(pool_size = config.pool_size, "Starting thumbnail scheduler");
        tokio::spawn(run_event_loop(pool, config, commands_rx, reports_rx));

        SchedulerHandle {
            commands: commands_tx,
        }
    }
}

async fn run_event_loop(
    mut pool: WorkerPool,
    config: SchedulerConfig,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut reports: mpsc::UnboundedReceiver<SessionReport>,
) {
    let mut reap = tokio::time::interval(config.reap_interval);
    reap.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut retry_at: Option<Instant> = None;

    loop {
        let retry = async move {
            match retry_at {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;

            Some(report) = reports.recv() => {
                pool.finish(report);
            }

            command = commands.recv() => match command {
                Some(Command::Submit(request)) => pool.enqueue(request),
                Some(Command::Cancel { id, reply }) => {
                    let outcome = pool.cancel(id);
                    tracing::debug!(request_id = %id, ?outcome, "Cancel processed");
                    if let Some(reply) = reply {
                        let _ = reply.send(outcome);
                    }
                }
                Some(Command::ForceAbort { slot, reply }) => {
                    let _ = reply.send(pool.force_abort(slot));
                }
                Some(Command::Status(reply)) => {
                    let _ = reply.send(pool.status());
                }
                Some(Command::Shutdown(reply)) => {
                    pool.shutdown();
                    let _ = reply.send(());
                    break;
                }
                None => {
                    pool.shutdown();
                    break;
                }
            },

            _ = retry => {
                retry_at = None;
            }

            _ = reap.tick() => {
                pool.reap();
            }
        }

        if retry_at.is_none()
            && let Dispatch::Deferred { request } = pool.pump()
        {
            tracing::debug!(request_id = %request, delay_ms = config.spawn_retry_delay.as_millis() as u64, "Spawn retry scheduled");
            retry_at = Some(Instant::now() + config.spawn_retry_delay);
        }
    }

    tracing::info!("Scheduler event loop exiting");
}
