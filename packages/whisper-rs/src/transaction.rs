//! Transaction scoping for service operations.
//!
//! whisper does not own persistence. A service that needs several writes to
//! commit together asks its [`Context`](crate::Context) for a transaction;
//! the configured [`TransactionProvider`] decides what that means.

use std::fmt;

use anyhow::Result;

/// Wraps a block in an externally defined transactional boundary.
///
/// # Example
///
/// ```ignore
/// struct PgTransactions {
///     pool: PgPool,
/// }
///
/// impl TransactionProvider for PgTransactions {
///     fn run_in_transaction(&self, block: &mut dyn FnMut() -> Result<()>) -> Result<()> {
///         let tx = self.pool.begin_blocking()?;
///         match block() {
///             Ok(()) => tx.commit_blocking(),
///             Err(e) => {
///                 tx.rollback_blocking()?;
///                 Err(e)
///             }
///         }
///     }
/// }
/// ```
pub trait TransactionProvider: Send + Sync {
    /// Run `block` exactly once inside a transaction and return its outcome.
    fn run_in_transaction(&self, block: &mut dyn FnMut() -> Result<()>) -> Result<()>;
}

/// Provider that runs blocks directly.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTransactions;

impl TransactionProvider for NoTransactions {
    fn run_in_transaction(&self, block: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        block()
    }
}

impl fmt::Debug for dyn TransactionProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TransactionProvider")
    }
}
