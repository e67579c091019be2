//! Revocation sets.
//!
//! A [`RevocationSet`] is a snapshot of certificates known to be revoked,
//! pushed to the process from outside. The verifier never looks inside it:
//! the set is shared by `Arc` and handed unchanged to
//! [`Certificate::verify`](crate::certificate::Certificate::verify), which
//! decides how to use it.
//!
//! ## Checks
//!
//! 1. **SPKI**: a revoked public key revokes every certificate carrying it
//! 2. **Serial**: a serial number is only meaningful together with the SPKI
//!    hash of the issuer that assigned it

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use crate::types::Fingerprint;

/// Outcome of looking a certificate up in a [`RevocationSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevocationResult {
    /// Known to be revoked.
    Revoked,
    /// The set covers this issuer and the certificate is not listed.
    Good,
    /// The set says nothing about this issuer.
    Unknown,
}

/// Snapshot of revoked certificates.
#[derive(Debug, Clone, Default)]
pub struct RevocationSet {
    /// Monotonic sequence number of this snapshot.
    sequence: u64,
    /// SPKI hashes that are revoked outright.
    revoked_spkis: HashSet<Fingerprint>,
    /// Revoked serial numbers, by issuer SPKI hash.
    revoked_serials: HashMap<Fingerprint, HashSet<Vec<u8>>>,
}

impl RevocationSet {
    /// Create an empty set with the given sequence number.
    pub fn new(sequence: u64) -> Self {
        Self {
            sequence,
            ..Self::default()
        }
    }

    /// Wrap the set for sharing with verifications.
    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Sequence number of this snapshot.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Mark a public key as revoked.
    pub fn revoke_spki(&mut self, spki_hash: Fingerprint) {
        debug!(spki = %spki_hash, sequence = self.sequence, "Revocation set: SPKI revoked");
        self.revoked_spkis.insert(spki_hash);
    }

    /// Mark a serial number issued by `issuer_spki_hash` as revoked.
    ///
    /// Also makes the set authoritative for that issuer, so unlisted serials
    /// from it check as [`RevocationResult::Good`].
    pub fn revoke_serial(&mut self, issuer_spki_hash: Fingerprint, serial: impl Into<Vec<u8>>) {
        self.revoked_serials
            .entry(issuer_spki_hash)
            .or_default()
            .insert(serial.into());
    }

    /// Make the set authoritative for an issuer without revoking anything.
    pub fn cover_issuer(&mut self, issuer_spki_hash: Fingerprint) {
        self.revoked_serials.entry(issuer_spki_hash).or_default();
    }

    /// Check a public key.
    pub fn check_spki(&self, spki_hash: &Fingerprint) -> RevocationResult {
        if self.revoked_spkis.contains(spki_hash) {
            RevocationResult::Revoked
        } else {
            RevocationResult::Good
        }
    }

    /// Check a serial number issued by `issuer_spki_hash`.
    pub fn check_serial(&self, issuer_spki_hash: &Fingerprint, serial: &[u8]) -> RevocationResult {
        match self.revoked_serials.get(issuer_spki_hash) {
            Some(serials) if serials.contains(serial) => RevocationResult::Revoked,
            Some(_) => RevocationResult::Good,
            None => RevocationResult::Unknown,
        }
    }

    /// Number of revoked keys and serials.
    pub fn len(&self) -> usize {
        self.revoked_spkis.len() + self.revoked_serials.values().map(HashSet::len).sum::<usize>()
    }

    /// Check if nothing is revoked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
