//! In-flight jobs and the request handles attached to them.
//!
//! A [`Job`] owns the cancel flag of exactly one worker and every request
//! waiting on that worker's result. Requests are delivered in the order they
//! were attached.
//!
//! Each request is split in two halves sharing one slot: the
//! [`RequestHandle`] the caller keeps, and the [`PendingRequest`] the job
//! keeps. The slot moves from `Pending` to either `Delivered` or `Canceled`
//! exactly once.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::time::Instant;

use tracing::error;

use crate::telemetry::{JobId, RequestId};
use crate::types::{RequestKey, VerifyCode, VerifyOutcome};
use crate::worker::CancelFlag;

/// Callback invoked with the result of a pending verification.
pub type VerifyCallback = Box<dyn FnOnce(VerifyOutcome)>;

enum SlotState {
    Pending(VerifyCallback),
    Delivered,
    Canceled,
}

type Slot = Rc<RefCell<SlotState>>;

/// Caller's ticket for a pending verification.
///
/// Pass it to [`CertVerifier::cancel_request`](crate::verifier::CertVerifier::cancel_request)
/// to stop the callback from running. Dropping the handle does not cancel:
/// the callback still runs when the result arrives.
#[must_use = "dropping a RequestHandle does not cancel the request"]
pub struct RequestHandle {
    id: RequestId,
    key: RequestKey,
    slot: Slot,
}

impl RequestHandle {
    /// Identifier of this request.
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Key of the verification this request waits on.
    pub fn key(&self) -> &RequestKey {
        &self.key
    }

    /// Check whether the callback has already run.
    pub fn is_delivered(&self) -> bool {
        matches!(*self.slot.borrow(), SlotState::Delivered)
    }

    /// Neutralise delivery. Returns `true` if the request was still pending.
    pub(crate) fn cancel(self) -> bool {
        let mut state = self.slot.borrow_mut();
        match *state {
            SlotState::Pending(_) => {
                // Dropping the callback here releases whatever it captured.
                *state = SlotState::Canceled;
                true
            },
            SlotState::Delivered | SlotState::Canceled => false,
        }
    }
}

impl fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHandle")
            .field("id", &self.id)
            .field("hostname", &self.key.hostname())
            .field("delivered", &self.is_delivered())
            .finish()
    }
}

/// The job's half of a request.
pub(crate) struct PendingRequest {
    id: RequestId,
    slot: Slot,
}

impl PendingRequest {
    /// Create both halves of a new request.
    pub(crate) fn new(
        id: RequestId,
        key: RequestKey,
        callback: VerifyCallback,
    ) -> (Self, RequestHandle) {
        let slot = Rc::new(RefCell::new(SlotState::Pending(callback)));
        let pending = Self {
            id,
            slot: Rc::clone(&slot),
        };
        (pending, RequestHandle { id, key, slot })
    }

    pub(crate) fn id(&self) -> RequestId {
        self.id
    }

    pub(crate) fn is_canceled(&self) -> bool {
        matches!(*self.slot.borrow(), SlotState::Canceled)
    }

    /// Run the callback unless the request was canceled.
    ///
    /// Returns whether the callback ran.
    fn post(self, outcome: &VerifyOutcome) -> bool {
        let previous = std::mem::replace(&mut *self.slot.borrow_mut(), SlotState::Delivered);
        match previous {
            SlotState::Pending(callback) => {
                // Slot borrow is released: the callback may cancel or inspect
                // other handles, or re-enter the verifier.
                callback(outcome.clone());
                true
            },
            SlotState::Canceled => {
                *self.slot.borrow_mut() = SlotState::Canceled;
                false
            },
            SlotState::Delivered => {
                error!(request = self.id, "Job: request delivered twice");
                debug_assert!(false, "request {} delivered twice", self.id);
                false
            },
        }
    }
}

/// Coordinates one in-flight worker and the requests waiting on it.
pub(crate) struct Job {
    id: JobId,
    key: RequestKey,
    /// Present while the worker is running.
    worker: Option<CancelFlag>,
    requests: Vec<PendingRequest>,
    created_at: Instant,
}

impl Job {
    pub(crate) fn new(id: JobId, key: RequestKey, created_at: Instant) -> Self {
        Self {
            id,
            key,
            worker: None,
            requests: Vec::new(),
            created_at,
        }
    }

    pub(crate) fn id(&self) -> JobId {
        self.id
    }

    pub(crate) fn key(&self) -> &RequestKey {
        &self.key
    }

    pub(crate) fn created_at(&self) -> Instant {
        self.created_at
    }

    pub(crate) fn request_count(&self) -> usize {
        self.requests.len()
    }

    /// Record the cancel flag of the worker started for this job.
    pub(crate) fn set_worker(&mut self, worker: CancelFlag) {
        self.worker = Some(worker);
    }

    /// Cancel the worker without releasing it. Idempotent.
    pub(crate) fn cancel_worker(&self) {
        if let Some(worker) = &self.worker {
            worker.cancel();
        }
    }

    pub(crate) fn add_request(&mut self, request: PendingRequest) {
        self.requests.push(request);
    }

    /// Deliver `outcome` to every request, in attachment order.
    ///
    /// Calls `on_delivered(request, code)` after each request is posted;
    /// `code` is `None` for canceled requests.
    pub(crate) fn handle_result(
        mut self,
        outcome: &VerifyOutcome,
        mut on_delivered: impl FnMut(RequestId, Option<VerifyCode>),
    ) {
        self.worker = None;
        for request in std::mem::take(&mut self.requests) {
            let id = request.id();
            let delivered = request.post(outcome);
            on_delivered(id, delivered.then_some(outcome.code));
        }
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };

        // Torn down while the worker was still running.
        worker.cancel();
        let abandoned = self.requests.iter().filter(|r| !r.is_canceled()).count();
        if abandoned > 0 {
            error!(
                job = self.id,
                hostname = %self.key.hostname(),
                abandoned,
                "Job: torn down with requests that were never canceled"
            );
            debug_assert!(
                std::thread::panicking(),
                "job {} torn down with {} live requests",
                self.id,
                abandoned
            );
        }
    }
}
