//! Dropping the verifier with work still in flight.

use std::sync::Arc;
use std::time::Duration;

use cert_verify_core::{CertVerifier, ManualRunner, ThreadRunner, VerifyCode, VerifyFlags};

use crate::support::{Gate, Harness, TestCert};

#[test]
fn test_worker_reports_after_verifier_dropped() {
    let h = Harness::new();
    let cert = TestCert::new("leaf", VerifyCode::OK);

    let handle = h
        .verifier
        .verify(cert.clone(), "example.com", VerifyFlags::NONE, None, |_| {
            panic!("callback after teardown")
        })
        .unwrap()
        .into_handle()
        .unwrap();
    h.verifier.cancel_request(handle);

    let runner = Arc::clone(&h.runner);
    drop(h);

    // The worker still runs but must not touch the verifier.
    assert_eq!(runner.run_all(), 1);
    assert_eq!(cert.calls(), 1);
}

#[test]
fn test_worker_never_runs_after_verifier_dropped() {
    let runner = Arc::new(ManualRunner::new());
    let verifier = CertVerifier::builder()
        .with_runner(runner.clone())
        .build()
        .unwrap();
    let cert = TestCert::new("leaf", VerifyCode::OK);

    let handle = verifier
        .verify(cert.clone(), "example.com", VerifyFlags::NONE, None, |_| {})
        .unwrap()
        .into_handle()
        .unwrap();
    verifier.cancel_request(handle);
    drop(verifier);

    assert_eq!(runner.discard_all(), 1);
    assert_eq!(cert.calls(), 0);
}

#[test]
fn test_reply_in_channel_at_teardown_is_discarded() {
    let h = Harness::new();
    let cert = TestCert::new("leaf", VerifyCode::OK);

    let handle = h
        .verifier
        .verify(cert.clone(), "example.com", VerifyFlags::NONE, None, |_| {
            panic!("callback after teardown")
        })
        .unwrap()
        .into_handle()
        .unwrap();
    h.verifier.cancel_request(handle);

    // The worker finishes, but the origin thread never processes the reply.
    h.runner.run_all();
    drop(h);
}

#[test]
fn test_real_thread_outlives_verifier() {
    let gate = Gate::default();
    let cert = TestCert::gated("leaf", VerifyCode::OK, gate.clone());
    let runner = Arc::new(ThreadRunner::new("it-teardown"));

    {
        let verifier = CertVerifier::builder()
            .with_runner(runner.clone())
            .build()
            .unwrap();
        let handle = verifier
            .verify(cert.clone(), "example.com", VerifyFlags::NONE, None, |_| {
                panic!("callback after teardown")
            })
            .unwrap()
            .into_handle()
            .unwrap();
        verifier.cancel_request(handle);
    }

    gate.open();
    for _ in 0..200 {
        if runner.active() == 0 {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(runner.active(), 0);
    assert_eq!(cert.calls(), 1);
}

#[test]
#[cfg(debug_assertions)]
#[should_panic(expected = "live requests")]
fn test_teardown_with_live_request_is_flagged() {
    let h = Harness::new();
    let cert = TestCert::new("leaf", VerifyCode::OK);

    let _handle = h
        .verifier
        .verify(cert.clone(), "example.com", VerifyFlags::NONE, None, |_| {})
        .unwrap()
        .into_handle()
        .unwrap();

    drop(h);
}
