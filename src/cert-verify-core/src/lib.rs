//! # cert-verify-core
//!
//! Asynchronous dispatch and caching for blocking certificate verification.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 CertVerifier (origin thread)                │
//! │                                                             │
//! │  verify() ──▶ RequestKey ──▶ VerificationCache ── hit ──▶ Complete
//! │                                   │ miss                    │
//! │                                   ▼                         │
//! │                     in-flight table: RequestKey → Job       │
//! │                      │ existing          │ new              │
//! │                      ▼                   ▼                  │
//! │              attach request       start Worker ─────┐       │
//! │                                                     │       │
//! └─────────────────────────────────────────────────────┼───────┘
//!                                                       ▼
//!                       TaskRunner (background) ── Certificate::verify()
//!                                                       │
//!          reply channel ◀──────────────────────────────┘
//!                │
//!                ▼
//!   cache insert → job removed → callbacks in attachment order
//! ```
//!
//! ## Guarantees
//!
//! - **Single flight**: at most one verification per key is running
//! - **Ordered fan-out**: coalesced requests are answered in attachment order
//! - **Local cancellation**: canceling a request never stops the verification
//!   or affects other requests
//! - **Teardown safety**: dropping the verifier cancels every running worker;
//!   late results are discarded

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)] // Too strict for production code
#![allow(clippy::missing_errors_doc)] // Error documentation not required
#![allow(clippy::module_name_repetitions)] // Allow Type in module::Type
#![allow(clippy::must_use_candidate)] // Not all functions need must_use

pub mod cache;
pub mod certificate;
pub mod clock;
pub mod config;
pub mod error;
pub mod job;
pub mod revocation;
pub mod runner;
pub mod telemetry;
pub mod types;
pub mod verifier;
pub mod worker;

pub use cache::{CacheEntry, VerificationCache};
pub use certificate::{request_key, Certificate, SharedCertificate};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::VerifierConfig;
pub use error::VerifyError;
pub use job::{RequestHandle, VerifyCallback};
pub use revocation::{RevocationResult, RevocationSet};
pub use runner::{ManualRunner, RejectingRunner, Task, TaskRunner, ThreadRunner, TokioBlockingRunner};
pub use telemetry::{JobId, NoopTelemetry, RequestId, TelemetrySink, TracingTelemetry};
pub use types::{
    CertStatus, CertVerifyResult, Fingerprint, RequestKey, VerifyCode, VerifyFlags, VerifyOutcome,
};
pub use verifier::{CertVerifier, CertVerifierBuilder, VerifierStats, VerifyStatus};
pub use worker::CancelFlag;
