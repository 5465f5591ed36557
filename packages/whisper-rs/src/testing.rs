//! Testing utilities for whisper services.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! whisper = { version = "0.1", features = ["testing"] }
//! ```
//!
//! # Quick Start
//!
//! ## Using `SpyWorker` for background services
//!
//! ```ignore
//! use whisper::testing::SpyWorker;
//!
//! let spy = SpyWorker::new();
//! runtime.run(Background::new(job, BackgroundOptions::deferred(None), Arc::new(spy.clone())))?;
//!
//! assert!(spy.was_scheduled("digest:send"));
//! ```
//!
//! ## Using `CountingTransactions`
//!
//! ```ignore
//! use whisper::testing::CountingTransactions;
//!
//! let transactions = CountingTransactions::new();
//! let runtime = RuntimeBuilder::new()
//!     .with_transactions(Arc::new(transactions.clone()))
//!     .build()?;
//!
//! runtime.run(CreateUser::new(input))?;
//! assert_eq!(transactions.committed(), 1);
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;

use crate::job::{Job, Worker};
use crate::transaction::TransactionProvider;

// =============================================================================
// Spy Worker
// =============================================================================

/// A job handed to the spy worker.
#[derive(Debug, Clone)]
pub struct ScheduledJob {
    /// The delay the service asked for.
    pub delay: Duration,
    pub job: Job,
}

/// Worker that records jobs instead of performing them.
#[derive(Debug, Clone, Default)]
pub struct SpyWorker {
    scheduled: Arc<Mutex<Vec<ScheduledJob>>>,
}

impl SpyWorker {
    /// Create a new empty spy worker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if a job of the given type was scheduled.
    pub fn was_scheduled(&self, job_type: &str) -> bool {
        self.all_jobs().iter().any(|j| j.job.job_type == job_type)
    }

    /// Get all jobs of a specific type.
    pub fn jobs_of_type(&self, job_type: &str) -> Vec<ScheduledJob> {
        self.all_jobs()
            .into_iter()
            .filter(|j| j.job.job_type == job_type)
            .collect()
    }

    /// Get the most recent job of a given type.
    pub fn last_job_of_type(&self, job_type: &str) -> Option<ScheduledJob> {
        self.jobs_of_type(job_type).pop()
    }

    /// Get all scheduled jobs.
    pub fn all_jobs(&self) -> Vec<ScheduledJob> {
        self.lock().clone()
    }

    pub fn job_count(&self) -> usize {
        self.lock().len()
    }

    /// Clear all recorded jobs.
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ScheduledJob>> {
        // Poisoning is ignored; recorded jobs stay readable.
        self.scheduled
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Worker for SpyWorker {
    fn perform_in(&self, delay: Duration, job: Job) -> Result<()> {
        self.lock().push(ScheduledJob { delay, job });
        Ok(())
    }
}

// =============================================================================
// Counting Transactions
// =============================================================================

/// Transaction provider that runs blocks directly and counts outcomes.
#[derive(Debug, Clone, Default)]
pub struct CountingTransactions {
    committed: Arc<AtomicUsize>,
    rolled_back: Arc<AtomicUsize>,
}

impl CountingTransactions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks that returned `Ok`.
    pub fn committed(&self) -> usize {
        self.committed.load(Ordering::Acquire)
    }

    /// Blocks that returned `Err`.
    pub fn rolled_back(&self) -> usize {
        self.rolled_back.load(Ordering::Acquire)
    }
}

impl TransactionProvider for CountingTransactions {
    fn run_in_transaction(&self, block: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        let outcome = block();
        let counter = if outcome.is_ok() {
            &self.committed
        } else {
            &self.rolled_back
        };
        counter.fetch_add(1, Ordering::AcqRel);
        outcome
    }
}
