//! Value types shared by the verifier, its jobs and its callers.

use std::fmt;
use std::ops::BitOr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// SHA-256 digest identifying a certificate (or a chain of them).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Wrap a raw digest.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Fingerprint of a single DER-encoded certificate.
    pub fn of_der(der: &[u8]) -> Self {
        Self(Sha256::digest(der).into())
    }

    /// Fingerprint of an ordered chain of DER-encoded certificates.
    ///
    /// Used for the issuer side of a [`RequestKey`]: two leaves presented
    /// with different intermediates must not share a cache entry.
    pub fn of_chain<'a>(chain: impl IntoIterator<Item = &'a [u8]>) -> Self {
        let mut hasher = Sha256::new();
        for der in chain {
            hasher.update(der);
        }
        Self(hasher.finalize().into())
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex encoding.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form keeps keys readable in logs.
        write!(f, "Fingerprint({}…)", &self.to_hex()[..16])
    }
}

/// Options that change how a certificate is verified.
///
/// Part of the [`RequestKey`]: the same certificate verified with different
/// flags is a different verification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VerifyFlags(u32);

impl VerifyFlags {
    /// No options.
    pub const NONE: Self = Self(0);
    /// Perform online revocation checking.
    pub const REV_CHECKING_ENABLED: Self = Self(1 << 0);
    /// Evaluate the certificate for Extended Validation status.
    pub const EV_CERT: Self = Self(1 << 1);

    /// Build from raw bits.
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw bits.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Check whether every bit of `other` is set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for VerifyFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Result code of a certificate verification.
///
/// The code space belongs to the [`Certificate`](crate::certificate::Certificate)
/// implementation. This layer never interprets it: codes are cached and
/// handed back exactly as received. The constants below cover the common
/// certificate errors for implementations that have no code space of their
/// own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VerifyCode(pub i32);

impl VerifyCode {
    /// Verification succeeded.
    pub const OK: Self = Self(0);
    /// The hostname does not match the certificate.
    pub const CERT_COMMON_NAME_INVALID: Self = Self(-200);
    /// The certificate is expired or not yet valid.
    pub const CERT_DATE_INVALID: Self = Self(-201);
    /// The certificate does not chain to a trusted root.
    pub const CERT_AUTHORITY_INVALID: Self = Self(-202);
    /// The certificate could not be parsed.
    pub const CERT_CONTAINS_ERRORS: Self = Self(-203);
    /// Revocation was requested but the certificate has no revocation mechanism.
    pub const CERT_NO_REVOCATION_MECHANISM: Self = Self(-204);
    /// Revocation information could not be obtained.
    pub const CERT_UNABLE_TO_CHECK_REVOCATION: Self = Self(-205);
    /// The certificate has been revoked.
    pub const CERT_REVOKED: Self = Self(-206);
    /// The certificate is invalid for another reason.
    pub const CERT_INVALID: Self = Self(-207);
    /// The chain uses a weak signature algorithm.
    pub const CERT_WEAK_SIGNATURE_ALGORITHM: Self = Self(-208);
    /// The chain contains a weak key.
    pub const CERT_WEAK_KEY: Self = Self(-211);

    /// Check whether this code means success.
    pub const fn is_ok(self) -> bool {
        self.0 == 0
    }

    /// Check whether this code is one of the certificate errors above.
    pub const fn is_certificate_error(self) -> bool {
        self.0 <= -200 && self.0 > -300
    }
}

impl fmt::Display for VerifyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::OK => "OK",
            Self::CERT_COMMON_NAME_INVALID => "CERT_COMMON_NAME_INVALID",
            Self::CERT_DATE_INVALID => "CERT_DATE_INVALID",
            Self::CERT_AUTHORITY_INVALID => "CERT_AUTHORITY_INVALID",
            Self::CERT_CONTAINS_ERRORS => "CERT_CONTAINS_ERRORS",
            Self::CERT_NO_REVOCATION_MECHANISM => "CERT_NO_REVOCATION_MECHANISM",
            Self::CERT_UNABLE_TO_CHECK_REVOCATION => "CERT_UNABLE_TO_CHECK_REVOCATION",
            Self::CERT_REVOKED => "CERT_REVOKED",
            Self::CERT_INVALID => "CERT_INVALID",
            Self::CERT_WEAK_SIGNATURE_ALGORITHM => "CERT_WEAK_SIGNATURE_ALGORITHM",
            Self::CERT_WEAK_KEY => "CERT_WEAK_KEY",
            other => return write!(f, "code({})", other.0),
        };
        f.write_str(name)
    }
}

/// Bitset describing everything found wrong (or notable) about a certificate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CertStatus(u32);

impl CertStatus {
    /// Hostname mismatch.
    pub const COMMON_NAME_INVALID: Self = Self(1 << 0);
    /// Outside the validity period.
    pub const DATE_INVALID: Self = Self(1 << 1);
    /// Untrusted issuer.
    pub const AUTHORITY_INVALID: Self = Self(1 << 2);
    /// No revocation mechanism.
    pub const NO_REVOCATION_MECHANISM: Self = Self(1 << 4);
    /// Revocation check failed.
    pub const UNABLE_TO_CHECK_REVOCATION: Self = Self(1 << 5);
    /// Revoked.
    pub const REVOKED: Self = Self(1 << 6);
    /// Invalid for another reason.
    pub const INVALID: Self = Self(1 << 7);
    /// Weak signature algorithm somewhere in the chain.
    pub const WEAK_SIGNATURE_ALGORITHM: Self = Self(1 << 8);
    /// Weak key somewhere in the chain.
    pub const WEAK_KEY: Self = Self(1 << 11);
    /// Passed Extended Validation.
    pub const IS_EV: Self = Self(1 << 16);
    /// Revocation checking was performed.
    pub const REV_CHECKING_ENABLED: Self = Self(1 << 17);

    const ERROR_MASK: u32 = 0x0000_FFFF;

    /// Raw bits.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Check whether every bit of `other` is set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set the bits of `other`.
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// Check whether any error bit is set.
    pub const fn is_error(self) -> bool {
        self.0 & Self::ERROR_MASK != 0
    }

    /// Map the most serious error bit to a [`VerifyCode`].
    pub fn to_verify_code(self) -> VerifyCode {
        const PRIORITY: [(CertStatus, VerifyCode); 9] = [
            (CertStatus::INVALID, VerifyCode::CERT_INVALID),
            (CertStatus::REVOKED, VerifyCode::CERT_REVOKED),
            (CertStatus::AUTHORITY_INVALID, VerifyCode::CERT_AUTHORITY_INVALID),
            (
                CertStatus::UNABLE_TO_CHECK_REVOCATION,
                VerifyCode::CERT_UNABLE_TO_CHECK_REVOCATION,
            ),
            (
                CertStatus::NO_REVOCATION_MECHANISM,
                VerifyCode::CERT_NO_REVOCATION_MECHANISM,
            ),
            (CertStatus::COMMON_NAME_INVALID, VerifyCode::CERT_COMMON_NAME_INVALID),
            (CertStatus::WEAK_KEY, VerifyCode::CERT_WEAK_KEY),
            (
                CertStatus::WEAK_SIGNATURE_ALGORITHM,
                VerifyCode::CERT_WEAK_SIGNATURE_ALGORITHM,
            ),
            (CertStatus::DATE_INVALID, VerifyCode::CERT_DATE_INVALID),
        ];

        PRIORITY
            .iter()
            .find(|(status, _)| self.contains(*status))
            .map_or(VerifyCode::OK, |(_, code)| *code)
    }
}

impl BitOr for CertStatus {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Details produced by a certificate verification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertVerifyResult {
    /// Everything found wrong with the certificate.
    pub cert_status: CertStatus,

    /// Whether the chain ends in a root shipped with the platform.
    pub is_issued_by_known_root: bool,

    /// SPKI hashes of every certificate in the verified chain.
    #[serde(default)]
    pub public_key_hashes: Vec<Fingerprint>,
}

/// Code and details of a finished verification, as handed to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyOutcome {
    /// Result code.
    pub code: VerifyCode,
    /// Verification details.
    pub result: CertVerifyResult,
}

impl VerifyOutcome {
    /// Check whether the verification succeeded.
    pub fn is_ok(&self) -> bool {
        self.code.is_ok()
    }
}

/// Uniquely identifies a verification request.
///
/// Two requests with equal keys are the same verification: they share one
/// in-flight job and one cache entry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestKey {
    cert_fingerprint: Fingerprint,
    issuer_fingerprint: Fingerprint,
    hostname: String,
    flags: VerifyFlags,
}

impl RequestKey {
    /// Build a key.
    pub fn new(
        cert_fingerprint: Fingerprint,
        issuer_fingerprint: Fingerprint,
        hostname: impl Into<String>,
        flags: VerifyFlags,
    ) -> Self {
        Self {
            cert_fingerprint,
            issuer_fingerprint,
            hostname: hostname.into(),
            flags,
        }
    }

    /// Fingerprint of the leaf certificate.
    pub fn cert_fingerprint(&self) -> &Fingerprint {
        &self.cert_fingerprint
    }

    /// Fingerprint of the intermediate chain.
    pub fn issuer_fingerprint(&self) -> &Fingerprint {
        &self.issuer_fingerprint
    }

    /// Hostname being verified.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Verification flags.
    pub fn flags(&self) -> VerifyFlags {
        self.flags
    }
}
