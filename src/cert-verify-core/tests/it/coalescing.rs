//! Single-flight coalescing, delivery order and cancellation.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use cert_verify_core::{
    CertVerifier, RejectingRunner, RevocationSet, ThreadRunner, TokioBlockingRunner,
    VerifierStats, VerifyCode, VerifyError, VerifyFlags, VerifyStatus,
};

use crate::support::{recorder, Deliveries, Gate, Harness, RecordingTelemetry, TestCert};

#[test]
fn test_identical_requests_share_one_verification() {
    let h = Harness::new();
    let cert = TestCert::new("leaf", VerifyCode::OK);
    let deliveries = Deliveries::default();

    for tag in ["a", "b", "c"] {
        let status = h
            .verifier
            .verify(
                cert.clone(),
                "example.com",
                VerifyFlags::NONE,
                None,
                recorder(&deliveries, tag),
            )
            .unwrap();
        assert!(status.is_pending());
    }

    assert_eq!(h.runner.submitted(), 1);
    assert_eq!(h.verifier.inflight_count(), 1);

    assert_eq!(h.complete_all(), 1);
    assert_eq!(cert.calls(), 1);
    assert_eq!(
        *deliveries.borrow(),
        vec![
            ("a", VerifyCode::OK),
            ("b", VerifyCode::OK),
            ("c", VerifyCode::OK)
        ]
    );

    // A fourth caller is answered synchronously.
    let status = h
        .verifier
        .verify(cert.clone(), "example.com", VerifyFlags::NONE, None, |_| {
            panic!("cache hit must not call back")
        })
        .unwrap();
    assert_eq!(status.into_outcome().unwrap().code, VerifyCode::OK);
    assert_eq!(h.runner.submitted(), 1);
    assert_eq!(
        h.verifier.stats(),
        VerifierStats {
            requests: 4,
            cache_hits: 1,
            inflight_joins: 2,
        }
    );
}

#[test]
fn test_distinct_keys_run_separately() {
    let h = Harness::new();
    let cert = TestCert::new("leaf", VerifyCode::OK);
    let other = TestCert::new("other-leaf", VerifyCode::OK);

    let statuses = [
        h.verifier
            .verify(cert.clone(), "example.com", VerifyFlags::NONE, None, |_| {}),
        h.verifier
            .verify(cert.clone(), "www.example.com", VerifyFlags::NONE, None, |_| {}),
        h.verifier.verify(
            cert.clone(),
            "example.com",
            VerifyFlags::REV_CHECKING_ENABLED,
            None,
            |_| {},
        ),
        h.verifier
            .verify(other.clone(), "example.com", VerifyFlags::NONE, None, |_| {}),
    ];
    assert!(statuses.iter().all(|s| matches!(s, Ok(VerifyStatus::Pending(_)))));

    assert_eq!(h.runner.submitted(), 4);
    assert_eq!(h.verifier.inflight_count(), 4);

    assert_eq!(h.complete_all(), 4);
    assert_eq!(h.verifier.cache_size(), 4);
    assert_eq!(cert.calls(), 3);
    assert_eq!(other.calls(), 1);
}

#[test]
fn test_cancel_affects_only_that_request() {
    let h = Harness::new();
    let cert = TestCert::new("leaf", VerifyCode::CERT_AUTHORITY_INVALID);
    let deliveries = Deliveries::default();

    let mut handles = Vec::new();
    for tag in ["a", "b", "c"] {
        let handle = h
            .verifier
            .verify(
                cert.clone(),
                "example.com",
                VerifyFlags::NONE,
                None,
                recorder(&deliveries, tag),
            )
            .unwrap()
            .into_handle()
            .unwrap();
        handles.push(handle);
    }

    let b = handles.remove(1);
    h.verifier.cancel_request(b);

    assert_eq!(h.complete_all(), 1);
    assert_eq!(
        *deliveries.borrow(),
        vec![
            ("a", VerifyCode::CERT_AUTHORITY_INVALID),
            ("c", VerifyCode::CERT_AUTHORITY_INVALID)
        ]
    );
    assert!(handles.iter().all(|handle| handle.is_delivered()));

    // The canceled request did not stop the result from being cached.
    let status = h
        .verifier
        .verify(cert.clone(), "example.com", VerifyFlags::NONE, None, |_| {})
        .unwrap();
    assert_eq!(
        status.into_outcome().unwrap().code,
        VerifyCode::CERT_AUTHORITY_INVALID
    );
}

#[test]
fn test_cancel_every_request_still_caches() {
    let h = Harness::new();
    let cert = TestCert::new("leaf", VerifyCode::OK);

    let handle = h
        .verifier
        .verify(cert.clone(), "example.com", VerifyFlags::NONE, None, |_| {
            panic!("canceled request must not call back")
        })
        .unwrap()
        .into_handle()
        .unwrap();
    h.verifier.cancel_request(handle);

    assert_eq!(h.complete_all(), 1);
    assert_eq!(h.verifier.inflight_count(), 0);
    assert_eq!(h.verifier.cache_size(), 1);
}

#[test]
fn test_callback_can_reenter_verifier() {
    let h = Harness::new();
    let verifier = Rc::new(h.verifier);
    let cert = TestCert::new("leaf", VerifyCode::OK);
    let seen = Rc::new(RefCell::new(Vec::new()));

    let weak = Rc::downgrade(&verifier);
    let reentrant_cert = cert.clone();
    let sink = Rc::clone(&seen);
    let _ = verifier
        .verify(cert.clone(), "example.com", VerifyFlags::NONE, None, move |outcome| {
            let verifier = weak.upgrade().unwrap();

            // The result is cached before any callback runs.
            let again = verifier
                .verify(
                    reentrant_cert.clone(),
                    "example.com",
                    VerifyFlags::NONE,
                    None,
                    |_| panic!("cache hit must not call back"),
                )
                .unwrap();
            sink.borrow_mut().push(("hit", again.into_outcome().map(|o| o.code)));

            // A new key starts a new job from inside the callback.
            let other = verifier
                .verify(reentrant_cert, "other.example", VerifyFlags::NONE, None, |_| {})
                .unwrap();
            sink.borrow_mut().push(("other", other.into_outcome().map(|o| o.code)));
            sink.borrow_mut().push(("outer", Some(outcome.code)));
        })
        .unwrap();

    h.runner.run_all();
    assert_eq!(verifier.process_replies(), 1);
    assert_eq!(
        *seen.borrow(),
        vec![
            ("hit", Some(VerifyCode::OK)),
            ("other", None),
            ("outer", Some(VerifyCode::OK))
        ]
    );
    assert_eq!(verifier.inflight_count(), 1);

    h.runner.run_all();
    assert_eq!(verifier.process_replies(), 1);
    assert_eq!(verifier.inflight_count(), 0);
    assert_eq!(cert.calls(), 2);
}

#[test]
fn test_callback_can_cancel_sibling() {
    let h = Harness::new();
    let verifier = Rc::new(h.verifier);
    let cert = TestCert::new("leaf", VerifyCode::OK);
    let deliveries = Deliveries::default();
    let sibling = Rc::new(RefCell::new(None));

    let weak = Rc::downgrade(&verifier);
    let slot = Rc::clone(&sibling);
    let first = recorder(&deliveries, "first");
    let _ = verifier
        .verify(cert.clone(), "example.com", VerifyFlags::NONE, None, move |outcome| {
            first(outcome);
            if let Some(handle) = slot.borrow_mut().take() {
                weak.upgrade().unwrap().cancel_request(handle);
            }
        })
        .unwrap();
    let second = verifier
        .verify(
            cert.clone(),
            "example.com",
            VerifyFlags::NONE,
            None,
            recorder(&deliveries, "second"),
        )
        .unwrap()
        .into_handle()
        .unwrap();
    *sibling.borrow_mut() = Some(second);

    h.runner.run_all();
    verifier.process_replies();
    assert_eq!(*deliveries.borrow(), vec![("first", VerifyCode::OK)]);
}

#[test]
fn test_revocation_set_reaches_worker() {
    let h = Harness::new();
    let cert = TestCert::new("leaf", VerifyCode::OK);
    let mut set = RevocationSet::new(7);
    set.revoke_spki(cert.spki_hash());

    let deliveries = Deliveries::default();
    let _ = h
        .verifier
        .verify(
            cert.clone(),
            "example.com",
            VerifyFlags::REV_CHECKING_ENABLED,
            Some(set.into_shared()),
            recorder(&deliveries, "a"),
        )
        .unwrap();
    h.complete_all();

    assert_eq!(*deliveries.borrow(), vec![("a", VerifyCode::CERT_REVOKED)]);
}

#[test]
fn test_entry_expires_after_ttl() {
    let h = Harness::new();
    let cert = TestCert::new("leaf", VerifyCode::OK);
    let ttl = h.verifier.config().cache_ttl;

    let _ = h
        .verifier
        .verify(cert.clone(), "example.com", VerifyFlags::NONE, None, |_| {})
        .unwrap();
    h.complete_all();

    h.clock.advance(ttl - Duration::from_millis(1));
    let status = h
        .verifier
        .verify(cert.clone(), "example.com", VerifyFlags::NONE, None, |_| {})
        .unwrap();
    assert!(!status.is_pending());

    h.clock.advance(Duration::from_millis(1));
    let status = h
        .verifier
        .verify(cert.clone(), "example.com", VerifyFlags::NONE, None, |_| {})
        .unwrap();
    assert!(status.is_pending());
    assert_eq!(h.runner.submitted(), 2);
}

#[test]
fn test_rejected_submission_reports_insufficient_resources() {
    let verifier = CertVerifier::builder()
        .with_runner(Arc::new(RejectingRunner))
        .build()
        .unwrap();
    let cert = TestCert::new("leaf", VerifyCode::OK);

    let err = verifier
        .verify(cert.clone(), "example.com", VerifyFlags::NONE, None, |_| {
            panic!("rejected request must not call back")
        })
        .unwrap_err();

    assert!(matches!(err, VerifyError::InsufficientResources { .. }));
    assert!(err.is_retryable());
    assert_eq!(verifier.inflight_count(), 0);
    assert_eq!(verifier.cache_size(), 0);
    assert_eq!(cert.calls(), 0);
}

#[test]
fn test_telemetry_sees_lifecycle() {
    let telemetry = Rc::new(RecordingTelemetry::default());
    let runner = Arc::new(cert_verify_core::ManualRunner::new());
    let verifier = CertVerifier::builder()
        .with_runner(runner.clone())
        .with_telemetry(telemetry.clone())
        .build()
        .unwrap();
    let cert = TestCert::new("leaf", VerifyCode::OK);

    let mut handles = Vec::new();
    for _ in 0..3 {
        let status = verifier
            .verify(cert.clone(), "example.com", VerifyFlags::NONE, None, |_| {})
            .unwrap();
        handles.extend(status.into_handle());
    }
    verifier.cancel_request(handles.remove(1));

    runner.run_all();
    verifier.process_replies();

    assert_eq!(
        *telemetry.events.borrow(),
        vec![
            "job_begin 0 example.com",
            "request_begin 0 0 example.com",
            "request_begin 1 0 example.com",
            "request_begin 2 0 example.com",
            "request_end 1 canceled",
            "job_end 0 0",
            "request_end 0 0",
            "request_end 2 0",
        ]
    );
}

#[tokio::test]
async fn test_thread_runner_end_to_end() {
    let verifier = CertVerifier::builder()
        .with_runner(Arc::new(ThreadRunner::new("it-verify")))
        .build()
        .unwrap();
    let cert = TestCert::new("leaf", VerifyCode::CERT_DATE_INVALID);
    let deliveries = Deliveries::default();

    for tag in ["a", "b", "c"] {
        let _ = verifier
            .verify(
                cert.clone(),
                "example.com",
                VerifyFlags::NONE,
                None,
                recorder(&deliveries, tag),
            )
            .unwrap();
    }

    verifier.run_until_idle().await;

    assert_eq!(cert.calls(), 1);
    assert_eq!(
        *deliveries.borrow(),
        vec![
            ("a", VerifyCode::CERT_DATE_INVALID),
            ("b", VerifyCode::CERT_DATE_INVALID),
            ("c", VerifyCode::CERT_DATE_INVALID)
        ]
    );
}

#[tokio::test]
async fn test_thread_limit_rejects_new_job_but_not_joins() {
    let gate = Gate::default();
    let verifier = CertVerifier::builder()
        .with_runner(Arc::new(ThreadRunner::new("it-capped").with_max_threads(1)))
        .build()
        .unwrap();
    let cert = TestCert::gated("leaf", VerifyCode::OK, gate.clone());

    let first = verifier
        .verify(cert.clone(), "example.com", VerifyFlags::NONE, None, |_| {})
        .unwrap();
    assert!(first.is_pending());

    // Joining the running job needs no new thread.
    let joined = verifier
        .verify(cert.clone(), "example.com", VerifyFlags::NONE, None, |_| {})
        .unwrap();
    assert!(joined.is_pending());

    let err = verifier
        .verify(cert.clone(), "other.example", VerifyFlags::NONE, None, |_| {})
        .unwrap_err();
    assert!(matches!(err, VerifyError::InsufficientResources { .. }));
    assert_eq!(verifier.inflight_count(), 1);

    gate.open();
    verifier.run_until_idle().await;
    assert_eq!(verifier.cache_size(), 1);
    assert_eq!(verifier.stats().inflight_joins, 1);
}

#[tokio::test]
async fn test_tokio_blocking_runner_end_to_end() {
    let verifier = CertVerifier::builder()
        .with_runner(Arc::new(TokioBlockingRunner::current().unwrap()))
        .build()
        .unwrap();
    let cert = TestCert::new("leaf", VerifyCode::OK);
    let got = Rc::new(RefCell::new(None));

    let sink = Rc::clone(&got);
    let _ = verifier
        .verify(cert.clone(), "example.com", VerifyFlags::EV_CERT, None, move |outcome| {
            *sink.borrow_mut() = Some(outcome.code)
        })
        .unwrap();

    assert!(verifier.wait_for_reply().await);
    assert_eq!(*got.borrow(), Some(VerifyCode::OK));
    assert!(!verifier.wait_for_reply().await);
}
