//! Background verification worker.
//!
//! A [`Worker`] performs exactly one blocking verification and reports back
//! at most once:
//!
//! ```text
//! Created ──start()──▶ Running ──finish()──▶ Replying ──▶ origin thread
//!                         │                     │
//!                         └──── canceled ───────┴──▶ dropped silently
//! ```
//!
//! The worker is moved into the task it submits, so it is dropped when the
//! task ends. The cancel flag is the only state shared between the origin
//! thread and the background thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, trace};

use crate::certificate::SharedCertificate;
use crate::error::VerifyError;
use crate::revocation::RevocationSet;
use crate::runner::TaskRunner;
use crate::telemetry::JobId;
use crate::types::{CertVerifyResult, RequestKey, VerifyCode};

/// Shared cancellation flag between a job and its worker.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Create an unset flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag. Idempotent.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Check whether the flag is set.
    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Result of one verification, on its way back to the origin thread.
#[derive(Debug)]
pub(crate) struct WorkerReply {
    pub(crate) job: JobId,
    pub(crate) key: RequestKey,
    pub(crate) code: VerifyCode,
    pub(crate) result: CertVerifyResult,
    cancel: CancelFlag,
}

impl WorkerReply {
    /// Check whether the owning job was torn down after the reply was sent.
    pub(crate) fn is_canceled(&self) -> bool {
        self.cancel.is_canceled()
    }
}

/// One blocking verification, run off the origin thread.
pub(crate) struct Worker {
    job: JobId,
    key: RequestKey,
    cert: SharedCertificate,
    revocation: Option<Arc<RevocationSet>>,
    cancel: CancelFlag,
    replies: UnboundedSender<WorkerReply>,
}

impl Worker {
    pub(crate) fn new(
        job: JobId,
        key: RequestKey,
        cert: SharedCertificate,
        revocation: Option<Arc<RevocationSet>>,
        replies: UnboundedSender<WorkerReply>,
    ) -> Self {
        Self {
            job,
            key,
            cert,
            revocation,
            cancel: CancelFlag::new(),
            replies,
        }
    }

    /// Submit the verification to `runner`.
    ///
    /// On success returns the flag that cancels this worker. On failure the
    /// worker has been dropped and will never report.
    pub(crate) fn start(self, runner: &dyn TaskRunner) -> Result<CancelFlag, VerifyError> {
        let cancel = self.cancel.clone();
        runner.submit(Box::new(move || self.run()))?;
        Ok(cancel)
    }

    fn run(self) {
        trace!(job = self.job, hostname = %self.key.hostname(), "Worker: verifying");
        let (code, result) =
            self.cert
                .verify(self.key.hostname(), self.key.flags(), self.revocation.as_deref());
        self.finish(code, result);
    }

    fn finish(self, code: VerifyCode, result: CertVerifyResult) {
        if self.cancel.is_canceled() {
            debug!(job = self.job, "Worker: canceled, discarding result");
            return;
        }

        let reply = WorkerReply {
            job: self.job,
            key: self.key,
            code,
            result,
            cancel: self.cancel,
        };
        if self.replies.send(reply).is_err() {
            // The verifier is gone; its Drop already canceled us.
            debug!(job = self.job, "Worker: origin closed, discarding result");
        }
    }
}
