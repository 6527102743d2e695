// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Single FIFO queue of outgoing publish/subscribe/unsubscribe work.
//!
//! Ordering observed by the broker matches submission order because all three
//! operation kinds share one queue drained by one sender task.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;

use crate::control_packet::{PubAck, Publish, SubAck, Subscribe, UnsubAck, Unsubscribe};
use crate::error::{SessionError, SessionErrorKind};

/// Policy applied when a submission arrives while the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Reject the incoming submission.
    #[default]
    DropNew,
    /// Evict the oldest queued item and admit the new one.
    DropOldest,
}

/// The request half of a queued work item.
#[derive(Debug)]
pub(crate) enum WorkRequest {
    Publish(Publish),
    Subscribe(Subscribe),
    Unsubscribe(Unsubscribe),
}

/// The broker acknowledgement completing a work item.
#[derive(Debug)]
pub(crate) enum WorkAck {
    Publish(PubAck),
    Subscribe(SubAck),
    Unsubscribe(UnsubAck),
}

/// A queued unit of outgoing work.
pub(crate) struct WorkItem {
    pub request: WorkRequest,
    /// Set once the sender task has transmitted the request on the current
    /// connection. Reset when a retryable transport failure requeues the item.
    pub sent: bool,
    pub cancel: CancellationToken,
    completion: Option<oneshot::Sender<Result<WorkAck, SessionError>>>,
}

impl WorkItem {
    /// Fulfill the caller's completion. A dropped caller is not an error.
    pub fn complete(&mut self, result: Result<WorkAck, SessionError>) {
        if let Some(completion) = self.completion.take() {
            let _ = completion.send(result);
        }
    }
}

impl Drop for WorkItem {
    fn drop(&mut self) {
        // An item dropped without completion means the queue itself is going away
        self.complete(Err(SessionErrorKind::Disposed.into()));
    }
}

/// Caller-side handle for a queued work item.
///
/// Dropping the handle before completion cancels the item: it is removed from
/// the queue if not yet transmitted. A transmitted request is not rescinded.
#[derive(Debug)]
pub(crate) struct PendingWork {
    rx: Option<oneshot::Receiver<Result<WorkAck, SessionError>>>,
    cancel: CancellationToken,
}

impl PendingWork {
    /// Await the broker acknowledgement or terminal error for this item.
    pub async fn wait(mut self) -> Result<WorkAck, SessionError> {
        let result = match self.rx.as_mut() {
            Some(rx) => match rx.await {
                Ok(result) => result,
                Err(_) => Err(SessionErrorKind::Disposed.into()),
            },
            None => Err(SessionErrorKind::InvalidState(
                "pending work awaited more than once".to_string(),
            )
            .into()),
        };
        // Completion observed; Drop must no longer cancel
        self.rx = None;
        result
    }
}

impl Drop for PendingWork {
    fn drop(&mut self) {
        if self.rx.is_some() {
            self.cancel.cancel();
        }
    }
}

struct Inner {
    items: VecDeque<WorkItem>,
    closed: bool,
}

/// FIFO queue of pending outgoing work shared between submitters and the
/// sender task.
pub(crate) struct WorkQueue {
    inner: Mutex<Inner>,
    enqueued: Notify,
    max_pending: usize,
    overflow: OverflowPolicy,
}

impl WorkQueue {
    pub fn new(max_pending: usize, overflow: OverflowPolicy) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                closed: false,
            }),
            enqueued: Notify::new(),
            max_pending,
            overflow,
        }
    }

    /// Submit a request at the tail of the queue.
    ///
    /// # Errors
    /// [`SessionErrorKind::Disposed`] if the queue has been closed.
    /// [`SessionErrorKind::PurgedFromQueue`] if the queue is full and the
    /// overflow policy is [`OverflowPolicy::DropNew`].
    pub fn enqueue(&self, request: WorkRequest) -> Result<PendingWork, SessionError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(SessionErrorKind::Disposed.into());
        }

        // Cancelled items no longer count against capacity
        inner.items.retain_mut(|item| {
            if item.cancel.is_cancelled() {
                item.complete(Err(SessionErrorKind::Cancelled.into()));
                false
            } else {
                true
            }
        });

        if inner.items.len() >= self.max_pending {
            match self.overflow {
                OverflowPolicy::DropNew => {
                    log::warn!("Work queue full; rejecting new submission");
                    return Err(SessionErrorKind::PurgedFromQueue.into());
                }
                OverflowPolicy::DropOldest => {
                    if let Some(mut oldest) = inner.items.pop_front() {
                        log::warn!("Work queue full; purging oldest queued item");
                        oldest.complete(Err(SessionErrorKind::PurgedFromQueue.into()));
                    }
                }
            }
        }

        let cancel = CancellationToken::new();
        let (tx, rx) = oneshot::channel();
        inner.items.push_back(WorkItem {
            request,
            sent: false,
            cancel: cancel.clone(),
            completion: Some(tx),
        });
        drop(inner);
        self.enqueued.notify_one();

        Ok(PendingWork {
            rx: Some(rx),
            cancel,
        })
    }

    /// Pop the item at the head of the queue, waiting for one to be available.
    ///
    /// Cancelled items encountered at the head are completed with
    /// [`SessionErrorKind::Cancelled`] and skipped. Returns [`None`] once the
    /// queue has been closed and drained.
    pub async fn dequeue(&self) -> Option<WorkItem> {
        loop {
            let notified = self.enqueued.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.inner.lock().unwrap();
                while let Some(mut item) = inner.items.pop_front() {
                    if item.cancel.is_cancelled() {
                        item.complete(Err(SessionErrorKind::Cancelled.into()));
                        continue;
                    }
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Return an in-flight item to the head of the queue after a retryable
    /// transport failure. Bypasses the capacity check: the item already held a
    /// slot when it was dequeued.
    pub fn requeue_front(&self, mut item: WorkItem) {
        item.sent = false;
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            item.complete(Err(SessionErrorKind::Disposed.into()));
            return;
        }
        inner.items.push_front(item);
        drop(inner);
        self.enqueued.notify_one();
    }

    /// Complete every queued item with an error produced by `error`.
    pub fn fail_all(&self, error: impl Fn() -> SessionError) {
        let mut inner = self.inner.lock().unwrap();
        while let Some(mut item) = inner.items.pop_front() {
            item.complete(Err(error()));
        }
    }

    /// Close the queue, rejecting future submissions, and complete every
    /// queued item with an error produced by `error`.
    pub fn close(&self, error: impl Fn() -> SessionError) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.closed = true;
            while let Some(mut item) = inner.items.pop_front() {
                item.complete(Err(error()));
            }
        }
        self.enqueued.notify_one();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }
}
