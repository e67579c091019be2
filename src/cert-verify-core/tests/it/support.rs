//! Shared fixtures.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use cert_verify_core::{
    CertStatus, CertVerifier, CertVerifyResult, Certificate, Fingerprint, JobId, ManualClock,
    ManualRunner, RequestId, RequestKey, RevocationResult, RevocationSet, TelemetrySink,
    VerifierConfig, VerifyCode, VerifyFlags, VerifyOutcome,
};

/// Certificate with a fixed answer that counts how often it was verified.
pub struct TestCert {
    name: String,
    code: VerifyCode,
    calls: AtomicUsize,
    gate: Option<Gate>,
}

impl TestCert {
    pub fn new(name: &str, code: VerifyCode) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            code,
            calls: AtomicUsize::new(0),
            gate: None,
        })
    }

    /// A certificate whose verification blocks until `gate` is opened.
    pub fn gated(name: &str, code: VerifyCode, gate: Gate) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            code,
            calls: AtomicUsize::new(0),
            gate: Some(gate),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn spki_hash(&self) -> Fingerprint {
        Fingerprint::of_der(format!("spki:{}", self.name).as_bytes())
    }
}

impl Certificate for TestCert {
    fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of_der(self.name.as_bytes())
    }

    fn issuer_fingerprint(&self) -> Fingerprint {
        Fingerprint::of_chain([b"test-intermediate".as_slice()])
    }

    fn verify(
        &self,
        _hostname: &str,
        _flags: VerifyFlags,
        revocation: Option<&RevocationSet>,
    ) -> (VerifyCode, CertVerifyResult) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.wait();
        }

        let mut result = CertVerifyResult {
            public_key_hashes: vec![self.spki_hash()],
            ..CertVerifyResult::default()
        };
        if let Some(set) = revocation {
            if set.check_spki(&self.spki_hash()) == RevocationResult::Revoked {
                result.cert_status.insert(CertStatus::REVOKED);
                return (VerifyCode::CERT_REVOKED, result);
            }
        }
        (self.code, result)
    }
}

/// One-shot latch a background verification can block on.
#[derive(Clone, Default)]
pub struct Gate(Arc<(Mutex<bool>, Condvar)>);

impl Gate {
    pub fn open(&self) {
        let (lock, cvar) = &*self.0;
        *lock.lock().unwrap() = true;
        cvar.notify_all();
    }

    fn wait(&self) {
        let (lock, cvar) = &*self.0;
        let guard = lock.lock().unwrap();
        let _open = cvar
            .wait_timeout_while(guard, Duration::from_secs(10), |open| !*open)
            .unwrap();
    }
}

/// Records callback deliveries in order.
pub type Deliveries = Rc<RefCell<Vec<(&'static str, VerifyCode)>>>;

pub fn recorder(deliveries: &Deliveries, tag: &'static str) -> impl FnOnce(VerifyOutcome) {
    let deliveries = Rc::clone(deliveries);
    move |outcome| deliveries.borrow_mut().push((tag, outcome.code))
}

/// Telemetry sink that keeps every event.
#[derive(Default)]
pub struct RecordingTelemetry {
    pub events: RefCell<Vec<String>>,
}

impl TelemetrySink for RecordingTelemetry {
    fn request_begin(&self, request: RequestId, job: JobId, key: &RequestKey) {
        self.events
            .borrow_mut()
            .push(format!("request_begin {} {} {}", request, job, key.hostname()));
    }

    fn request_end(&self, request: RequestId, code: Option<VerifyCode>) {
        let code = code.map_or_else(|| "canceled".to_string(), |c| c.0.to_string());
        self.events
            .borrow_mut()
            .push(format!("request_end {} {}", request, code));
    }

    fn job_begin(&self, job: JobId, key: &RequestKey) {
        self.events
            .borrow_mut()
            .push(format!("job_begin {} {}", job, key.hostname()));
    }

    fn job_end(&self, job: JobId, code: Option<VerifyCode>) {
        let code = code.map_or_else(|| "aborted".to_string(), |c| c.0.to_string());
        self.events.borrow_mut().push(format!("job_end {} {}", job, code));
    }
}

/// A verifier driven entirely by the test.
pub struct Harness {
    pub verifier: CertVerifier,
    pub runner: Arc<ManualRunner>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(VerifierConfig::default())
    }

    pub fn with_config(config: VerifierConfig) -> Self {
        let runner = Arc::new(ManualRunner::new());
        let clock = Arc::new(ManualClock::new());
        let verifier = CertVerifier::builder()
            .with_config(config)
            .with_runner(runner.clone())
            .with_clock(clock.clone())
            .build()
            .unwrap();
        Self {
            verifier,
            runner,
            clock,
        }
    }

    /// Run every queued worker and deliver its result.
    pub fn complete_all(&self) -> usize {
        self.runner.run_all();
        self.verifier.process_replies()
    }
}
