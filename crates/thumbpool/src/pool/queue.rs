//! FIFO of requests waiting for a free slot.
//!
//! Order lives in a deque of ids; the requests themselves live in a map.
//! Removing a queued request only touches the map. Its id stays behind as a
//! tombstone that `pop_front` skips.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::bridge::protocol::ExtractParams;
use crate::error::ExtractError;

/// Unique request identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(uuid::Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> uuid::Uuid {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub type Completion = oneshot::Sender<Result<Bytes, ExtractError>>;

/// A submitted request and the means to complete it.
#[derive(Debug)]
pub struct PendingRequest {
    pub id: RequestId,
    pub params: ExtractParams,
    pub spawn_failures: u32,
    pub submitted_at: Instant,
    completion: Completion,
}

impl PendingRequest {
    pub fn new(params: ExtractParams) -> (Self, oneshot::Receiver<Result<Bytes, ExtractError>>) {
        let (completion, rx) = oneshot::channel();
        let request = Self {
            id: RequestId::new(),
            params,
            spawn_failures: 0,
            submitted_at: Instant::now(),
            completion,
        };
        (request, rx)
    }

    /// The caller has gone away; nobody will read the result.
    pub fn is_abandoned(&self) -> bool {
        self.completion.is_closed()
    }

    pub fn complete(self, result: Result<Bytes, ExtractError>) {
        let elapsed_ms = self.submitted_at.elapsed().as_millis() as u64;
        match &result {
            Ok(bytes) => {
                tracing::debug!(request_id = %self.id, bytes = bytes.len(), elapsed_ms, "Request completed")
            }
            Err(e) => {
                tracing::debug!(request_id = %self.id, error = %e, elapsed_ms, "Request failed")
            }
        }
        if self.completion.send(result).is_err() {
            tracing::trace!(request_id = %self.id, "Result receiver dropped");
        }
    }
}

#[derive(Debug, Default)]
pub struct RequestQueue {
    order: VecDeque<RequestId>,
    entries: HashMap<RequestId, PendingRequest>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn push_back(&mut self, request: PendingRequest) {
        self.order.push_back(request.id);
        self.entries.insert(request.id, request);
    }

    /// Return a request to the head, ahead of everything else.
    pub fn push_front(&mut self, request: PendingRequest) {
        self.order.push_front(request.id);
        self.entries.insert(request.id, request);
    }

    pub fn pop_front(&mut self) -> Option<PendingRequest> {
        while let Some(id) = self.order.pop_front() {
            if let Some(request) = self.entries.remove(&id) {
                return Some(request);
            }
        }
        None
    }

    /// Remove a queued request, leaving a tombstone in the order deque.
    pub fn remove(&mut self, id: RequestId) -> Option<PendingRequest> {
        let request = self.entries.remove(&id)?;
        if self.order.len() > 2 * self.entries.len() + 64 {
            self.order.retain(|id| self.entries.contains_key(id));
        }
        Some(request)
    }

    /// Take every queued request in arrival order.
    pub fn drain(&mut self) -> Vec<PendingRequest> {
        let mut drained = Vec::with_capacity(self.entries.len());
        while let Some(request) = self.pop_front() {
            drained.push(request);
        }
        self.order.clear();
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(second: i64) -> PendingRequest {
        PendingRequest::new(ExtractParams::new("/v/a.mp4", second)).0
    }

    fn seconds(queue: &mut RequestQueue) -> Vec<i64> {
        queue.drain().into_iter().map(|r| r.params.second).collect()
    }

    #[test]
    fn fifo_order() {
        let mut queue = RequestQueue::new();
        for s in 0..5 {
            queue.push_back(request(s));
        }
        assert_eq!(queue.len(), 5);
        assert_eq!(seconds(&mut queue), vec![0, 1, 2, 3, 4]);
        assert!(queue.is_empty());
    }

    #[test]
    fn removal_keeps_others_in_order() {
        let mut queue = RequestQueue::new();
        let ids: Vec<_> = (0..5)
            .map(|s| {
                let r = request(s);
                let id = r.id;
                queue.push_back(r);
                id
            })
            .collect();

        assert_eq!(queue.remove(ids[1]).map(|r| r.params.second), Some(1));
        assert_eq!(queue.remove(ids[3]).map(|r| r.params.second), Some(3));
        assert!(queue.remove(ids[3]).is_none());
        assert_eq!(queue.len(), 3);
        assert_eq!(seconds(&mut queue), vec![0, 2, 4]);
    }

    #[test]
    fn push_front_goes_ahead() {
        let mut queue = RequestQueue::new();
        queue.push_back(request(1));
        queue.push_back(request(2));
        let head = queue.pop_front().unwrap();
        queue.push_front(head);
        assert_eq!(seconds(&mut queue), vec![1, 2]);
    }

    #[test]
    fn tombstones_are_compacted() {
        let mut queue = RequestQueue::new();
        let keep = request(-1);
        queue.push_back(keep);
        for s in 0..500 {
            let r = request(s);
            let id = r.id;
            queue.push_back(r);
            queue.remove(id);
        }
        assert_eq!(queue.len(), 1);
        assert!(queue.order.len() <= 2 * queue.len() + 65);
        assert_eq!(seconds(&mut queue), vec![-1]);
    }

    #[test]
    fn completion_reaches_receiver() {
        let (request, mut rx) = PendingRequest::new(ExtractParams::new("/v/a.mp4", 0));
        assert!(!request.is_abandoned());
        request.complete(Err(ExtractError::Cancelled));
        assert_eq!(rx.try_recv().unwrap(), Err(ExtractError::Cancelled));
    }

    #[test]
    fn dropped_receiver_marks_request_abandoned() {
        let (request, rx) = PendingRequest::new(ExtractParams::new("/v/a.mp4", 0));
        drop(rx);
        assert!(request.is_abandoned());
    }
}
