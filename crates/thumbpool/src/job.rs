//! Caller-side completion handle.

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::error::ExtractError;
use crate::pool::RequestId;
use crate::scheduler::SchedulerHandle;

/// Cancels the request on drop unless disarmed.
///
/// When the caller stops waiting (client disconnect, timeout), the job is
/// dropped and the guard asks the scheduler to cancel. Queued requests are
/// removed; in-flight ones are force-aborted.
struct CancelOnDrop {
    id: Option<RequestId>,
    scheduler: SchedulerHandle,
}

impl CancelOnDrop {
    fn disarm(&mut self) {
        self.id = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(id) = self.id {
            tracing::debug!(request_id = %id, "Job dropped before completion, cancelling");
            self.scheduler.request_cancel(id);
        }
    }
}

/// A submitted extraction.
pub struct ThumbnailJob {
    id: RequestId,
    completion: oneshot::Receiver<Result<Bytes, ExtractError>>,
    guard: CancelOnDrop,
}

impl ThumbnailJob {
    pub(crate) fn new(
        id: RequestId,
        completion: oneshot::Receiver<Result<Bytes, ExtractError>>,
        scheduler: SchedulerHandle,
    ) -> Self {
        Self {
            id,
            completion,
            guard: CancelOnDrop {
                id: Some(id),
                scheduler,
            },
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Wait for the thumbnail. A scheduler that stops first yields `Cancelled`.
    pub async fn wait(mut self) -> Result<Bytes, ExtractError> {
        let result = (&mut self.completion).await;
        self.guard.disarm();
        result.unwrap_or(Err(ExtractError::Cancelled))
    }
}

impl std::fmt::Debug for ThumbnailJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThumbnailJob").field("id", &self.id).finish()
    }
}
