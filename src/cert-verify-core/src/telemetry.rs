//! Telemetry hooks.
//!
//! The verifier reports request and job lifecycles to a [`TelemetrySink`].
//! Sinks observe only: nothing they do can change what the verifier does, and
//! every method has an empty default so a sink implements what it needs.

use std::time::Duration;

use tracing::{debug, trace};

use crate::types::{RequestKey, VerifyCode};

/// Identifier of one caller's request, unique per verifier.
pub type RequestId = u64;

/// Identifier of one in-flight job, unique per verifier.
pub type JobId = u64;

/// Receiver of verifier lifecycle events.
pub trait TelemetrySink {
    /// A caller's request was attached to a job.
    fn request_begin(&self, _request: RequestId, _job: JobId, _key: &RequestKey) {}

    /// A caller's request finished: delivered (`Some(code)`) or canceled (`None`).
    fn request_end(&self, _request: RequestId, _code: Option<VerifyCode>) {}

    /// A job started its worker.
    fn job_begin(&self, _job: JobId, _key: &RequestKey) {}

    /// A job finished. `code` is `None` when the job was torn down early.
    fn job_end(&self, _job: JobId, _code: Option<VerifyCode>) {}

    /// Time between job creation and the result reaching the origin thread.
    fn job_latency(&self, _job: JobId, _latency: Duration) {}
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTelemetry;

impl TelemetrySink for NoopTelemetry {}

/// Sink that turns events into `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn request_begin(&self, request: RequestId, job: JobId, key: &RequestKey) {
        trace!(request, job, hostname = %key.hostname(), "Telemetry: request begin");
    }

    fn request_end(&self, request: RequestId, code: Option<VerifyCode>) {
        match code {
            Some(code) => trace!(request, code = %code, "Telemetry: request end"),
            None => trace!(request, "Telemetry: request canceled"),
        }
    }

    fn job_begin(&self, job: JobId, key: &RequestKey) {
        trace!(
            job,
            hostname = %key.hostname(),
            cert = %key.cert_fingerprint(),
            "Telemetry: job begin"
        );
    }

    fn job_end(&self, job: JobId, code: Option<VerifyCode>) {
        match code {
            Some(code) => trace!(job, code = %code, "Telemetry: job end"),
            None => trace!(job, "Telemetry: job aborted"),
        }
    }

    fn job_latency(&self, job: JobId, latency: Duration) {
        debug!(
            job,
            latency_ms = latency.as_millis() as u64,
            "Telemetry: verification latency"
        );
    }
}
