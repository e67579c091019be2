//! Certificate trait consumed by the verifier.
//!
//! This module defines the [`Certificate`] trait that platform verifiers
//! implement. The trait only describes what the dispatch layer needs: two
//! fingerprints to build a [`RequestKey`] and one blocking call that does the
//! actual chain building and signature checking.

use std::fmt;
use std::sync::Arc;

use crate::revocation::RevocationSet;
use crate::types::{CertVerifyResult, Fingerprint, RequestKey, VerifyCode, VerifyFlags};

/// A certificate (plus its intermediates) that can be verified.
///
/// Implementations must be shareable across threads: the verifier hands an
/// `Arc<dyn Certificate>` to a background worker.
pub trait Certificate: Send + Sync {
    /// Fingerprint of the leaf certificate.
    fn fingerprint(&self) -> Fingerprint;

    /// Fingerprint of the intermediate certificates presented with the leaf.
    fn issuer_fingerprint(&self) -> Fingerprint;

    /// Verify the certificate for `hostname`.
    ///
    /// Blocking. Only ever called on the background context. The returned
    /// code is opaque to the caller and is cached as-is.
    fn verify(
        &self,
        hostname: &str,
        flags: VerifyFlags,
        revocation: Option<&RevocationSet>,
    ) -> (VerifyCode, CertVerifyResult);
}

impl fmt::Debug for dyn Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("fingerprint", &self.fingerprint())
            .field("issuer_fingerprint", &self.issuer_fingerprint())
            .finish()
    }
}

/// Build the request key for verifying `cert` against `hostname`.
pub fn request_key(cert: &dyn Certificate, hostname: &str, flags: VerifyFlags) -> RequestKey {
    RequestKey::new(cert.fingerprint(), cert.issuer_fingerprint(), hostname, flags)
}

/// Shared certificate handle, as passed to the verifier.
pub type SharedCertificate = Arc<dyn Certificate>;
