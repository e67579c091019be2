//! cert-verify CLI - exercise the coalescing certificate verifier.
//!
//! The binary drives a [`CertVerifier`] against a simulated certificate so
//! the dispatch behavior (single flight, cache hits, TTL, revocation
//! pass-through) can be observed without a platform trust store.

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cert_verify_core::{
    CertStatus, CertVerifier, CertVerifyResult, Certificate, Fingerprint, RevocationResult,
    RevocationSet, TokioBlockingRunner, VerifierConfig, VerifyCode, VerifyError, VerifyFlags,
    VerifyStatus,
};
use clap::{Parser, Subcommand};
use tracing::{debug, error};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// cert-verify - coalescing, caching certificate verification.
///
/// Identical verification requests issued while one is already running share
/// its result; finished results are cached for a bounded time.
#[derive(Parser)]
#[command(name = "cert-verify")]
#[command(version = VERSION)]
#[command(about = "Coalescing, caching certificate verification")]
#[command(long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Output format (text, json)
    #[arg(short, long, default_value = "text")]
    format: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify a simulated certificate with several concurrent callers
    Simulate {
        /// Hostname to verify
        #[arg(long, default_value = "example.com")]
        hostname: String,

        /// Names the simulated certificate is valid for
        #[arg(long = "san", default_value = "example.com")]
        sans: Vec<String>,

        /// Number of identical concurrent requests
        #[arg(long, default_value = "3")]
        requests: usize,

        /// Time the simulated verification blocks for, in milliseconds
        #[arg(long, default_value = "100")]
        latency_ms: u64,

        /// Simulate an expired certificate
        #[arg(long)]
        expired: bool,

        /// Put the certificate's key in the revocation set
        #[arg(long)]
        revoked: bool,

        /// Verifier configuration file (JSON)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Show the effective verifier configuration
    Info {
        /// Verifier configuration file (JSON)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

/// Certificate whose verification is computed from a few switches.
struct SimulatedCertificate {
    der: Vec<u8>,
    chain: Vec<Vec<u8>>,
    sans: Vec<String>,
    expired: bool,
    latency: Duration,
}

impl SimulatedCertificate {
    fn new(sans: Vec<String>, expired: bool, latency: Duration) -> Self {
        let der = format!("simulated-leaf:{}:{}", sans.join(","), expired).into_bytes();
        Self {
            der,
            chain: vec![b"simulated-intermediate".to_vec()],
            sans,
            expired,
            latency,
        }
    }

    fn spki_hash(&self) -> Fingerprint {
        Fingerprint::of_chain([b"spki:".as_slice(), self.der.as_slice()])
    }

    fn matches_hostname(&self, hostname: &str) -> bool {
        self.sans.iter().any(|san| match san.strip_prefix("*.") {
            Some(suffix) => hostname
                .split_once('.')
                .is_some_and(|(label, rest)| !label.is_empty() && rest == suffix),
            None => san.eq_ignore_ascii_case(hostname),
        })
    }
}

impl Certificate for SimulatedCertificate {
    fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of_der(&self.der)
    }

    fn issuer_fingerprint(&self) -> Fingerprint {
        Fingerprint::of_chain(self.chain.iter().map(Vec::as_slice))
    }

    fn verify(
        &self,
        hostname: &str,
        flags: VerifyFlags,
        revocation: Option<&RevocationSet>,
    ) -> (VerifyCode, CertVerifyResult) {
        std::thread::sleep(self.latency);

        let mut result = CertVerifyResult {
            public_key_hashes: vec![self.spki_hash()],
            ..CertVerifyResult::default()
        };

        if !self.matches_hostname(hostname) {
            result.cert_status.insert(CertStatus::COMMON_NAME_INVALID);
        }
        if self.expired {
            result.cert_status.insert(CertStatus::DATE_INVALID);
        }
        if flags.contains(VerifyFlags::REV_CHECKING_ENABLED) {
            result.cert_status.insert(CertStatus::REV_CHECKING_ENABLED);
        }
        if let Some(set) = revocation {
            if set.check_spki(&self.spki_hash()) == RevocationResult::Revoked {
                result.cert_status.insert(CertStatus::REVOKED);
            }
        }

        (result.cert_status.to_verify_code(), result)
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<VerifierConfig, VerifyError> {
    match path {
        Some(path) => {
            let json = std::fs::read_to_string(path).map_err(|e| VerifyError::ConfigError {
                message: format!("cannot read {}: {}", path.display(), e),
            })?;
            VerifierConfig::from_json(&json)
        },
        None => Ok(VerifierConfig::default()),
    }
}

struct SimulationReport {
    hostname: String,
    delivered: Vec<(usize, VerifyCode)>,
    follow_up: Option<VerifyCode>,
    elapsed: Duration,
    stats: cert_verify_core::VerifierStats,
    cache_size: usize,
}

async fn run_simulation(
    hostname: String,
    sans: Vec<String>,
    requests: usize,
    latency_ms: u64,
    expired: bool,
    revoked: bool,
    config: VerifierConfig,
) -> Result<SimulationReport, VerifyError> {
    let mut runner = TokioBlockingRunner::current()?;
    if let Some(max) = config.max_worker_threads {
        runner = runner.with_max_tasks(max);
    }
    let verifier = CertVerifier::builder()
        .with_config(config)
        .with_runner(Arc::new(runner))
        .build()?;

    let cert = Arc::new(SimulatedCertificate::new(
        sans,
        expired,
        Duration::from_millis(latency_ms),
    ));
    let mut revocation = RevocationSet::new(1);
    if revoked {
        revocation.revoke_spki(cert.spki_hash());
    }
    let revocation = revocation.into_shared();

    let delivered = Rc::new(RefCell::new(Vec::new()));
    let start = Instant::now();

    for caller in 0..requests.max(1) {
        let sink = Rc::clone(&delivered);
        let status = verifier.verify(
            cert.clone(),
            &hostname,
            VerifyFlags::REV_CHECKING_ENABLED,
            Some(Arc::clone(&revocation)),
            move |outcome| sink.borrow_mut().push((caller, outcome.code)),
        )?;
        debug!(caller, pending = status.is_pending(), "simulate: request issued");
    }

    verifier.run_until_idle().await;
    let elapsed = start.elapsed();

    let follow_up = match verifier.verify(
        cert,
        &hostname,
        VerifyFlags::REV_CHECKING_ENABLED,
        Some(revocation),
        |_| {},
    )? {
        VerifyStatus::Complete(outcome) => Some(outcome.code),
        VerifyStatus::Pending(handle) => {
            verifier.cancel_request(handle);
            None
        },
    };

    let delivered = delivered.borrow().clone();
    Ok(SimulationReport {
        hostname,
        delivered,
        follow_up,
        elapsed,
        stats: verifier.stats(),
        cache_size: verifier.cache_size(),
    })
}

fn print_report(report: &SimulationReport, json: bool) {
    if json {
        let output = serde_json::json!({
            "hostname": report.hostname,
            "delivered": report
                .delivered
                .iter()
                .map(|(caller, code)| serde_json::json!({
                    "caller": caller,
                    "code": code.0,
                    "name": code.to_string(),
                }))
                .collect::<Vec<_>>(),
            "follow_up_cached": report.follow_up.map(|code| code.to_string()),
            "elapsed_ms": report.elapsed.as_millis() as u64,
            "stats": report.stats,
            "cache_size": report.cache_size,
        });
        match serde_json::to_string_pretty(&output) {
            Ok(text) => println!("{}", text),
            Err(e) => error!("Failed to serialize report: {}", e),
        }
        return;
    }

    println!("\nSIMULATION");
    println!("==========\n");
    println!("Hostname: {}", report.hostname);
    println!("Elapsed:  {} ms", report.elapsed.as_millis());
    println!();
    println!("Callbacks (in delivery order):");
    for (caller, code) in &report.delivered {
        let status = if code.is_ok() {
            "\x1b[32mOK\x1b[0m".to_string()
        } else {
            format!("\x1b[31m{}\x1b[0m", code)
        };
        println!("  caller {:>3}: {}", caller, status);
    }
    println!();
    match report.follow_up {
        Some(code) => println!("Follow-up request: served from cache ({})", code),
        None => println!("Follow-up request: cache miss"),
    }
    println!();
    println!("Statistics:");
    println!("  Requests:       {}", report.stats.requests);
    println!("  Cache hits:     {}", report.stats.cache_hits);
    println!("  In-flight joins: {}", report.stats.inflight_joins);
    println!("  Cache size:     {}", report.cache_size);
}

fn show_info(config: &VerifierConfig, json: bool) {
    if json {
        let output = serde_json::json!({
            "version": VERSION,
            "max_cache_entries": config.max_cache_entries,
            "cache_ttl_secs": config.cache_ttl.as_secs(),
            "worker_thread_name": config.worker_thread_name,
            "max_worker_threads": config.max_worker_threads,
        });
        match serde_json::to_string_pretty(&output) {
            Ok(text) => println!("{}", text),
            Err(e) => error!("Failed to serialize info: {}", e),
        }
        return;
    }

    println!("\nCERT-VERIFY {}", VERSION);
    println!("================\n");
    println!("Cache:");
    println!("  Max entries: {}", config.max_cache_entries);
    println!("  TTL:         {}s", config.cache_ttl.as_secs());
    println!();
    println!("Workers:");
    println!("  Thread name: {}", config.worker_thread_name);
    match config.max_worker_threads {
        Some(max) => println!("  Max threads: {}", max),
        None => println!("  Max threads: unbounded"),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    let json_output = cli.format == "json";

    // Initialize logging (suppress for JSON output)
    if json_output {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::ERROR)
            .with_target(false)
            .init();
    } else if cli.verbose {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::WARN)
            .with_target(false)
            .init();
    }

    let result = match cli.command {
        Some(Commands::Simulate {
            hostname,
            sans,
            requests,
            latency_ms,
            expired,
            revoked,
            config,
        }) => match load_config(config.as_ref()) {
            Ok(config) => run_simulation(
                hostname, sans, requests, latency_ms, expired, revoked, config,
            )
            .await
            .map(|report| print_report(&report, json_output)),
            Err(e) => Err(e),
        },
        Some(Commands::Info { config }) => {
            load_config(config.as_ref()).map(|config| show_info(&config, json_output))
        },
        None => {
            show_info(&VerifierConfig::default(), json_output);
            Ok(())
        },
    };

    if let Err(e) = result {
        error!("cert-verify failed: {}", e);
        eprintln!("error: {}", e);
        std::process::exit(if e.is_caller_error() { 2 } else { 1 });
    }
}
