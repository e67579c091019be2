//! Certificate verifier façade.
//!
//! [`CertVerifier`] is the only type callers interact with. It answers from
//! the cache when it can, coalesces identical concurrent requests onto one
//! in-flight [`Job`], and runs the blocking verification through a
//! [`TaskRunner`].
//!
//! ## Threading
//!
//! The verifier, its jobs and its request handles live on the thread that
//! built the verifier (the *origin* thread) and are `!Send`. Workers send
//! their results back over a channel; the origin thread picks them up with
//! [`process_replies`](CertVerifier::process_replies) or
//! [`wait_for_reply`](CertVerifier::wait_for_reply). Callbacks therefore
//! always run on the origin thread, and they may call back into the verifier.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::cache::{CacheEntry, VerificationCache};
use crate::certificate::{request_key, SharedCertificate};
use crate::clock::{Clock, SystemClock};
use crate::config::VerifierConfig;
use crate::error::VerifyError;
use crate::job::{Job, PendingRequest, RequestHandle};
use crate::revocation::RevocationSet;
use crate::runner::{TaskRunner, ThreadRunner};
use crate::telemetry::{JobId, RequestId, TelemetrySink, TracingTelemetry};
use crate::types::{RequestKey, VerifyFlags, VerifyOutcome};
use crate::worker::{Worker, WorkerReply};

/// Immediate answer to [`CertVerifier::verify`].
#[derive(Debug)]
#[must_use]
pub enum VerifyStatus {
    /// Served from the cache. The callback will not be called.
    Complete(VerifyOutcome),
    /// Verification in progress. The callback runs once the result arrives,
    /// unless the request is canceled first.
    Pending(RequestHandle),
}

impl VerifyStatus {
    /// Check whether the result is still outstanding.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }

    /// The handle of a pending request.
    pub fn into_handle(self) -> Option<RequestHandle> {
        match self {
            Self::Pending(handle) => Some(handle),
            Self::Complete(_) => None,
        }
    }

    /// The cached outcome of a completed request.
    pub fn into_outcome(self) -> Option<VerifyOutcome> {
        match self {
            Self::Complete(outcome) => Some(outcome),
            Self::Pending(_) => None,
        }
    }
}

/// Verifier counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VerifierStats {
    /// Accepted `verify` calls.
    pub requests: u64,
    /// Calls answered from the cache.
    pub cache_hits: u64,
    /// Calls attached to an already running job.
    pub inflight_joins: u64,
}

/// State touched only on the origin thread.
struct VerifierState {
    cache: VerificationCache,
    inflight: BTreeMap<RequestKey, Job>,
    stats: VerifierStats,
}

/// Coalescing, caching certificate verifier.
pub struct CertVerifier {
    /// Configuration.
    config: VerifierConfig,
    /// Cache and in-flight table.
    state: RefCell<VerifierState>,
    /// Background context for workers.
    runner: Arc<dyn TaskRunner>,
    /// Time source for expiry.
    clock: Arc<dyn Clock>,
    /// Lifecycle event sink.
    telemetry: Rc<dyn TelemetrySink>,
    /// Handed to every worker.
    replies_tx: UnboundedSender<WorkerReply>,
    /// Results coming back from workers.
    replies_rx: Mutex<UnboundedReceiver<WorkerReply>>,
    next_request_id: Cell<RequestId>,
    next_job_id: Cell<JobId>,
}

impl CertVerifier {
    /// Create a verifier with default configuration.
    ///
    /// # Errors
    ///
    /// Returns error if initialization fails.
    pub fn new() -> Result<Self, VerifyError> {
        Self::with_config(VerifierConfig::default())
    }

    /// Create a verifier with custom configuration, verifying on OS threads.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the configuration is invalid.
    pub fn with_config(config: VerifierConfig) -> Result<Self, VerifyError> {
        Self::builder().with_config(config).build()
    }

    /// Start building a verifier with injected collaborators.
    pub fn builder() -> CertVerifierBuilder {
        CertVerifierBuilder::default()
    }

    /// Verify `cert` for `hostname`.
    ///
    /// Returns [`VerifyStatus::Complete`] synchronously on a fresh cache hit;
    /// `callback` is then dropped without being called. Otherwise returns
    /// [`VerifyStatus::Pending`] and `callback` runs on this thread once the
    /// result has been received by [`process_replies`](Self::process_replies)
    /// or [`wait_for_reply`](Self::wait_for_reply).
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` if `hostname` is empty.
    /// - `InsufficientResources` if a new verification had to be started and
    ///   the task runner rejected it. Nothing is cached in that case.
    #[instrument(skip_all, fields(hostname = %hostname, flags = flags.bits()))]
    pub fn verify<F>(
        &self,
        cert: SharedCertificate,
        hostname: &str,
        flags: VerifyFlags,
        revocation: Option<Arc<RevocationSet>>,
        callback: F,
    ) -> Result<VerifyStatus, VerifyError>
    where
        F: FnOnce(VerifyOutcome) + 'static,
    {
        if hostname.is_empty() {
            return Err(VerifyError::InvalidArgument {
                reason: "hostname must not be empty".into(),
            });
        }

        let key = request_key(cert.as_ref(), hostname, flags);
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        state.stats.requests += 1;

        if let Some(outcome) = state.cache.get(&key, self.clock.now()) {
            state.stats.cache_hits += 1;
            debug!(code = %outcome.code, "CertVerifier: cache hit");
            return Ok(VerifyStatus::Complete(outcome));
        }

        let request_id = self.next_id(&self.next_request_id);

        if let Some(job) = state.inflight.get_mut(&key) {
            state.stats.inflight_joins += 1;
            let job_id = job.id();
            let (pending, handle) = PendingRequest::new(request_id, key, Box::new(callback));
            job.add_request(pending);
            debug!(
                job = job_id,
                request = request_id,
                waiting = job.request_count(),
                "CertVerifier: joined in-flight job"
            );
            drop(guard);

            self.telemetry.request_begin(request_id, job_id, handle.key());
            return Ok(VerifyStatus::Pending(handle));
        }

        let job_id = self.next_id(&self.next_job_id);
        let worker = Worker::new(
            job_id,
            key.clone(),
            cert,
            revocation,
            self.replies_tx.clone(),
        );
        // A rejected worker is dropped inside start(); no job is recorded.
        let cancel = worker.start(self.runner.as_ref()).map_err(|e| {
            warn!(job = job_id, error = %e, "CertVerifier: could not start worker");
            e
        })?;

        let mut job = Job::new(job_id, key.clone(), self.clock.now());
        job.set_worker(cancel);
        let (pending, handle) = PendingRequest::new(request_id, key.clone(), Box::new(callback));
        job.add_request(pending);
        state.inflight.insert(key.clone(), job);
        drop(guard);

        debug!(job = job_id, request = request_id, "CertVerifier: started job");
        self.telemetry.job_begin(job_id, &key);
        self.telemetry.request_begin(request_id, job_id, &key);
        Ok(VerifyStatus::Pending(handle))
    }

    /// Stop `handle`'s callback from running.
    ///
    /// Only this request is affected: the verification keeps running, other
    /// requests on the same job still receive the result, and the result is
    /// still cached.
    pub fn cancel_request(&self, handle: RequestHandle) {
        let id = handle.id();
        if handle.cancel() {
            debug!(request = id, "CertVerifier: request canceled");
            self.telemetry.request_end(id, None);
        }
    }

    /// Drop every cached result. In-flight jobs are not affected.
    pub fn clear_cache(&self) {
        let mut state = self.state.borrow_mut();
        let dropped = state.cache.len();
        state.cache.clear();
        info!(dropped, "CertVerifier: cache cleared");
    }

    /// Number of cached results, fresh or expired.
    pub fn cache_size(&self) -> usize {
        self.state.borrow().cache.len()
    }

    /// Number of jobs whose worker has not reported back yet.
    pub fn inflight_count(&self) -> usize {
        self.state.borrow().inflight.len()
    }

    /// Counters since creation.
    pub fn stats(&self) -> VerifierStats {
        self.state.borrow().stats
    }

    /// Configuration in use.
    pub fn config(&self) -> &VerifierConfig {
        &self.config
    }

    /// Handle every worker result that has already arrived, without waiting.
    ///
    /// Returns the number of results handled.
    pub fn process_replies(&self) -> usize {
        let replies: Vec<WorkerReply> = match self.replies_rx.try_lock() {
            Ok(mut rx) => std::iter::from_fn(|| rx.try_recv().ok()).collect(),
            // Someone is awaiting in wait_for_reply; they will pick it up.
            Err(_) => return 0,
        };

        let count = replies.len();
        for reply in replies {
            self.do_reply(reply);
        }
        count
    }

    /// Wait for the next worker result and handle it.
    ///
    /// Returns `false` immediately if no job is in flight.
    pub async fn wait_for_reply(&self) -> bool {
        if self.inflight_count() == 0 {
            return false;
        }

        let reply = self.replies_rx.lock().await.recv().await;
        match reply {
            Some(reply) => {
                self.do_reply(reply);
                true
            },
            // Unreachable while we hold a sender ourselves.
            None => false,
        }
    }

    /// Handle worker results until no job is in flight.
    ///
    /// Never returns if a verification never completes.
    pub async fn run_until_idle(&self) {
        while self.wait_for_reply().await {}
    }

    fn do_reply(&self, reply: WorkerReply) {
        if reply.is_canceled() {
            trace!(job = reply.job, "CertVerifier: dropping reply of canceled worker");
            return;
        }
        self.handle_result(reply);
    }

    /// Cache the result, retire the job, then deliver.
    fn handle_result(&self, reply: WorkerReply) {
        let WorkerReply {
            job: job_id,
            key,
            code,
            result,
            ..
        } = reply;
        let outcome = VerifyOutcome { code, result };

        let job = {
            let mut state = self.state.borrow_mut();
            let now = self.clock.now();
            match now.checked_add(self.config.cache_ttl) {
                Some(expires_at) => state.cache.insert(
                    key.clone(),
                    CacheEntry::new(outcome.clone(), expires_at),
                    now,
                ),
                None => warn!(
                    job = job_id,
                    ttl_secs = self.config.cache_ttl.as_secs(),
                    "CertVerifier: expiry out of range, result not cached"
                ),
            }

            match state.inflight.remove(&key) {
                Some(job) => {
                    debug_assert_eq!(job.id(), job_id, "reply routed to the wrong job");
                    job
                },
                None => {
                    error!(
                        job = job_id,
                        hostname = %key.hostname(),
                        "CertVerifier: reply for a job that is not in flight"
                    );
                    debug_assert!(false, "job {} missing from the in-flight table", job_id);
                    return;
                },
            }
        };

        let latency = self.clock.now().saturating_duration_since(job.created_at());
        debug!(
            job = job_id,
            code = %outcome.code,
            waiting = job.request_count(),
            latency_ms = latency.as_millis() as u64,
            "CertVerifier: job finished"
        );
        self.telemetry.job_latency(job_id, latency);
        self.telemetry.job_end(job_id, Some(outcome.code));

        // No borrow is held here: callbacks may re-enter the verifier.
        // Canceled requests already reported their end in cancel_request.
        job.handle_result(&outcome, |request, code| {
            if code.is_some() {
                self.telemetry.request_end(request, code);
            }
        });
    }

    fn next_id(&self, counter: &Cell<u64>) -> u64 {
        let id = counter.get();
        counter.set(id + 1);
        id
    }
}

impl Drop for CertVerifier {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.inflight.is_empty() {
            return;
        }

        info!(
            active_jobs = state.inflight.len(),
            "CertVerifier: shutting down with jobs in flight"
        );

        // Every worker must see its flag before any job is released.
        for job in state.inflight.values() {
            job.cancel_worker();
        }
        for job in std::mem::take(&mut state.inflight).into_values() {
            self.telemetry.job_end(job.id(), None);
            trace!(job = job.id(), hostname = %job.key().hostname(), "CertVerifier: job aborted");
        }
    }
}

/// Builder for [`CertVerifier`] with injectable collaborators.
#[derive(Default)]
pub struct CertVerifierBuilder {
    config: Option<VerifierConfig>,
    runner: Option<Arc<dyn TaskRunner>>,
    clock: Option<Arc<dyn Clock>>,
    telemetry: Option<Rc<dyn TelemetrySink>>,
}

impl CertVerifierBuilder {
    /// Use this configuration (default: [`VerifierConfig::default`]).
    #[must_use]
    pub fn with_config(mut self, config: VerifierConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Run workers on this runner (default: [`ThreadRunner`]).
    #[must_use]
    pub fn with_runner(mut self, runner: Arc<dyn TaskRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Read time from this clock (default: [`SystemClock`]).
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Report lifecycle events to this sink (default: [`TracingTelemetry`]).
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: Rc<dyn TelemetrySink>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Build the verifier.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the configuration is invalid.
    pub fn build(self) -> Result<CertVerifier, VerifyError> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let runner = self
            .runner
            .unwrap_or_else(|| Arc::new(ThreadRunner::from_config(&config)));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let telemetry = self
            .telemetry
            .unwrap_or_else(|| Rc::new(TracingTelemetry));

        info!(
            max_cache_entries = config.max_cache_entries,
            cache_ttl_secs = config.cache_ttl.as_secs(),
            "CertVerifier: initialized"
        );

        let (replies_tx, replies_rx) = mpsc::unbounded_channel();
        Ok(CertVerifier {
            state: RefCell::new(VerifierState {
                cache: VerificationCache::new(config.max_cache_entries),
                inflight: BTreeMap::new(),
                stats: VerifierStats::default(),
            }),
            config,
            runner,
            clock,
            telemetry,
            replies_tx,
            replies_rx: Mutex::new(replies_rx),
            next_request_id: Cell::new(0),
            next_job_id: Cell::new(0),
        })
    }
}
