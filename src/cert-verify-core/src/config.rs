//! Configuration for the certificate verifier.

use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::error::VerifyError;

/// Default number of cached verification results.
pub const DEFAULT_MAX_CACHE_ENTRIES: usize = 256;

/// Default lifetime of a cached verification result (30 minutes).
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(1800);

/// Longest accepted cache TTL (one year).
pub const MAX_CACHE_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Configuration for [`CertVerifier`](crate::verifier::CertVerifier).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    /// Maximum number of cached results.
    pub max_cache_entries: usize,
    /// How long a cached result stays valid.
    #[serde(rename = "cache_ttl_secs", deserialize_with = "duration_from_secs")]
    pub cache_ttl: Duration,
    /// Name prefix for background verification threads.
    pub worker_thread_name: String,
    /// Cap on concurrently running verification threads (`None` = unbounded).
    pub max_worker_threads: Option<usize>,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            max_cache_entries: DEFAULT_MAX_CACHE_ENTRIES,
            cache_ttl: DEFAULT_CACHE_TTL,
            worker_thread_name: "cert-verify-worker".into(),
            max_worker_threads: None,
        }
    }
}

impl VerifierConfig {
    /// Set the cache capacity.
    #[must_use]
    pub fn with_max_cache_entries(mut self, max_cache_entries: usize) -> Self {
        self.max_cache_entries = max_cache_entries;
        self
    }

    /// Set the cache TTL.
    #[must_use]
    pub fn with_cache_ttl(mut self, cache_ttl: Duration) -> Self {
        self.cache_ttl = cache_ttl;
        self
    }

    /// Cap the number of concurrently running verification threads.
    #[must_use]
    pub fn with_max_worker_threads(mut self, max_worker_threads: usize) -> Self {
        self.max_worker_threads = Some(max_worker_threads);
        self
    }

    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, VerifyError> {
        let config: Self = serde_json::from_str(json).map_err(|e| VerifyError::ConfigError {
            message: format!("invalid verifier config: {}", e),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the verifier cannot work with.
    pub fn validate(&self) -> Result<(), VerifyError> {
        if self.max_cache_entries == 0 {
            return Err(VerifyError::ConfigError {
                message: "max_cache_entries must be at least 1".into(),
            });
        }
        if self.cache_ttl.is_zero() {
            return Err(VerifyError::ConfigError {
                message: "cache_ttl must be non-zero".into(),
            });
        }
        if self.cache_ttl > MAX_CACHE_TTL {
            return Err(VerifyError::ConfigError {
                message: format!(
                    "cache_ttl of {}s exceeds the maximum of {}s",
                    self.cache_ttl.as_secs(),
                    MAX_CACHE_TTL.as_secs()
                ),
            });
        }
        if self.max_worker_threads == Some(0) {
            return Err(VerifyError::ConfigError {
                message: "max_worker_threads must be at least 1".into(),
            });
        }
        Ok(())
    }
}

fn duration_from_secs<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_secs)
}
