//! Structured error types for whisper.
//!
//! `WhisperError` covers the failures the runtime itself can detect.
//! Everything a service, listener or transaction block returns travels as
//! `anyhow::Error` and is never wrapped, so callers can recover their own
//! error types with `downcast_ref`.
//!
//! # Example
//!
//! ```ignore
//! use whisper::WhisperError;
//!
//! match runtime.call(CreateUser::new(input), |_| {}) {
//!     Ok(user) => println!("created {}", user.id),
//!     Err(e) => match e.downcast_ref::<WhisperError>() {
//!         Some(WhisperError::MissingField { service, field }) => {
//!             eprintln!("{service} does not expose '{field}'");
//!         }
//!         Some(other) => eprintln!("runtime error: {other}"),
//!         // A listener's own error, passed through untouched.
//!         None => eprintln!("listener failed: {e}"),
//!     },
//! }
//! ```

use std::borrow::Cow;

use thiserror::Error;

/// Errors raised by the whisper runtime.
#[derive(Debug, Error)]
pub enum WhisperError {
    /// A default `run`/`perform` was invoked without being overridden.
    #[error("{type_name}::{operation} is not implemented")]
    NotImplemented {
        /// The service or listener type.
        type_name: &'static str,
        /// The operation that was left at its default.
        operation: &'static str,
    },

    /// A global binding failed explicit validation.
    #[error("invalid binding {target} on '{event}': {reason}")]
    InvalidBinding {
        /// The listener type the binding targets.
        target: &'static str,
        /// The event the binding responds to.
        event: String,
        reason: Cow<'static, str>,
    },

    /// Argument derivation named a field the emitting service does not expose.
    #[error("service {service} has no field '{field}'")]
    MissingField {
        /// The emitting service type.
        service: &'static str,
        /// The requested field.
        field: String,
    },

    /// A job record names a type no `JobRegistry` entry knows.
    #[error("unknown job type: {0}")]
    UnknownJobType(String),

    /// A transaction provider returned without running the block it was given.
    #[error("transaction provider returned without running the block")]
    TransactionNotRun,
}

impl WhisperError {
    /// Shorthand for [`WhisperError::NotImplemented`].
    pub fn not_implemented<T: ?Sized>(operation: &'static str) -> Self {
        WhisperError::NotImplemented {
            type_name: std::any::type_name::<T>(),
            operation,
        }
    }

    /// Whether this is a [`WhisperError::NotImplemented`].
    pub fn is_not_implemented(&self) -> bool {
        matches!(self, WhisperError::NotImplemented { .. })
    }
}
