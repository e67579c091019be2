//! Background execution context.
//!
//! The verifier never blocks the thread it lives on. Blocking certificate
//! checks are handed to a [`TaskRunner`] which runs them somewhere else.
//! Submission may fail (thread limit, runtime gone, ...); the verifier
//! turns that into [`VerifyError::InsufficientResources`] for the one
//! request that triggered it.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::VerifierConfig;
use crate::error::VerifyError;

/// A unit of background work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// "Run this on a background worker".
pub trait TaskRunner: Send + Sync {
    /// Submit a task. The task runs at most once; `Err` means it never will.
    fn submit(&self, task: Task) -> Result<(), VerifyError>;
}

/// Runs every task on its own named OS thread.
///
/// Optionally caps the number of concurrently running tasks; submissions
/// beyond the cap are rejected rather than queued.
#[derive(Debug)]
pub struct ThreadRunner {
    name_prefix: String,
    max_threads: Option<usize>,
    active: Arc<AtomicUsize>,
    spawned: AtomicU64,
}

/// Decrements the active-thread count when the task ends, even on panic.
struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl ThreadRunner {
    /// Create an uncapped runner.
    pub fn new(name_prefix: impl Into<String>) -> Self {
        Self {
            name_prefix: name_prefix.into(),
            max_threads: None,
            active: Arc::new(AtomicUsize::new(0)),
            spawned: AtomicU64::new(0),
        }
    }

    /// Create a runner from the verifier configuration.
    pub fn from_config(config: &VerifierConfig) -> Self {
        Self {
            max_threads: config.max_worker_threads,
            ..Self::new(config.worker_thread_name.clone())
        }
    }

    /// Cap the number of concurrently running tasks.
    #[must_use]
    pub fn with_max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = Some(max_threads);
        self
    }

    /// Number of tasks currently running.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

impl TaskRunner for ThreadRunner {
    fn submit(&self, task: Task) -> Result<(), VerifyError> {
        let previous = self.active.fetch_add(1, Ordering::AcqRel);
        let guard = ActiveGuard(Arc::clone(&self.active));

        if let Some(max) = self.max_threads {
            if previous >= max {
                warn!(active = previous, max, "ThreadRunner: thread limit reached");
                return Err(VerifyError::InsufficientResources {
                    reason: format!("worker thread limit of {} reached", max),
                });
            }
        }

        let n = self.spawned.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}-{}", self.name_prefix, n);

        std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let _guard = guard;
                task();
            })
            .map(|_| debug!(thread = %name, "ThreadRunner: task started"))
            .map_err(|e| {
                warn!(thread = %name, error = %e, "ThreadRunner: spawn failed");
                VerifyError::InsufficientResources {
                    reason: format!("failed to spawn worker thread: {}", e),
                }
            })
    }
}

/// Runs tasks on a tokio runtime's blocking pool.
///
/// Submissions fail once the runtime has shut down, when the optional task
/// cap is reached, or when the pool cannot start a thread.
#[derive(Debug, Clone)]
pub struct TokioBlockingRunner {
    handle: tokio::runtime::Handle,
    /// Dead once the runtime has dropped its tasks.
    alive: Weak<()>,
    permits: Option<Arc<Semaphore>>,
}

impl TokioBlockingRunner {
    /// Use the given runtime.
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        // Parked for the life of the runtime; shutdown drops it and the token.
        let token = Arc::new(());
        let alive = Arc::downgrade(&token);
        drop(handle.spawn(async move {
            let _token = token;
            std::future::pending::<()>().await;
        }));

        Self {
            handle,
            alive,
            permits: None,
        }
    }

    /// Use the runtime the caller is running on.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when called outside a tokio runtime.
    pub fn current() -> Result<Self, VerifyError> {
        tokio::runtime::Handle::try_current()
            .map(Self::new)
            .map_err(|e| VerifyError::ConfigError {
                message: format!("no tokio runtime: {}", e),
            })
    }

    /// Cap the number of concurrently running tasks.
    #[must_use]
    pub fn with_max_tasks(mut self, max_tasks: usize) -> Self {
        self.permits = Some(Arc::new(Semaphore::new(max_tasks)));
        self
    }

    /// Check whether the runtime still accepts work.
    pub fn is_running(&self) -> bool {
        self.alive.strong_count() > 0
    }
}

impl TaskRunner for TokioBlockingRunner {
    fn submit(&self, task: Task) -> Result<(), VerifyError> {
        if !self.is_running() {
            warn!("TokioBlockingRunner: runtime has shut down");
            return Err(VerifyError::InsufficientResources {
                reason: "tokio runtime has shut down".into(),
            });
        }

        let permit = match &self.permits {
            Some(permits) => Some(Arc::clone(permits).try_acquire_owned().map_err(|_| {
                warn!("TokioBlockingRunner: task limit reached");
                VerifyError::InsufficientResources {
                    reason: "blocking task limit reached".into(),
                }
            })?),
            None => None,
        };

        // The pool panics when it cannot start a thread.
        let handle = self.handle.clone();
        let spawned = std::panic::catch_unwind(AssertUnwindSafe(move || {
            handle.spawn_blocking(move || {
                let _permit = permit;
                task();
            })
        }));

        match spawned {
            // The JoinHandle is dropped on purpose: the task reports back on its own.
            Ok(join) => {
                drop(join);
                Ok(())
            },
            Err(_) => {
                warn!("TokioBlockingRunner: blocking pool failed to spawn");
                Err(VerifyError::InsufficientResources {
                    reason: "failed to spawn blocking task".into(),
                })
            },
        }
    }
}

/// Holds tasks until they are run explicitly.
///
/// Lets tests and simulations decide exactly when background work happens.
#[derive(Default)]
pub struct ManualRunner {
    queue: Mutex<VecDeque<Task>>,
    submitted: AtomicUsize,
}

impl ManualRunner {
    /// Create an empty runner.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tasks waiting to run.
    pub fn pending(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    /// Total number of tasks ever submitted.
    pub fn submitted(&self) -> usize {
        self.submitted.load(Ordering::Acquire)
    }

    /// Run the oldest waiting task on the calling thread.
    ///
    /// Returns `false` if nothing was waiting.
    pub fn run_next(&self) -> bool {
        // Pop under the lock, run outside it.
        let task = match self.queue.lock() {
            Ok(mut queue) => queue.pop_front(),
            Err(_) => None,
        };
        match task {
            Some(task) => {
                task();
                true
            },
            None => false,
        }
    }

    /// Run every waiting task on the calling thread. Returns how many ran.
    pub fn run_all(&self) -> usize {
        let mut ran = 0;
        while self.run_next() {
            ran += 1;
        }
        ran
    }

    /// Drop every waiting task without running it.
    pub fn discard_all(&self) -> usize {
        self.queue
            .lock()
            .map(|mut q| q.drain(..).count())
            .unwrap_or(0)
    }
}

impl TaskRunner for ManualRunner {
    fn submit(&self, task: Task) -> Result<(), VerifyError> {
        let mut queue = self.queue.lock().map_err(|_| VerifyError::InsufficientResources {
            reason: "manual runner queue poisoned".into(),
        })?;
        queue.push_back(task);
        self.submitted.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

impl std::fmt::Debug for ManualRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualRunner")
            .field("pending", &self.pending())
            .field("submitted", &self.submitted())
            .finish()
    }
}

/// Rejects every task.
#[derive(Debug, Default, Clone, Copy)]
pub struct RejectingRunner;

impl TaskRunner for RejectingRunner {
    fn submit(&self, _task: Task) -> Result<(), VerifyError> {
        Err(VerifyError::InsufficientResources {
            reason: "background context rejected the task".into(),
        })
    }
}
