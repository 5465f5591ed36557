//! # Whisper
//!
//! An in-process service runtime: services do one thing and report what
//! happened by emitting named events; listeners react.
//!
//! ## Core Concepts
//!
//! - [`Service`] = a unit of work, run once per [`ServiceInstance`]
//! - **Local listeners** = closures attached to one instance with [`ServiceInstance::on`]
//! - **Global listeners** = [`Listener`] types declared once per service type in a
//!   [`RegistrationTable`], optionally gated by a condition and fed named fields
//!
//! ## Architecture
//!
//! ```text
//! RuntimeBuilder ── declare / inherit ──► Registry (read-only, Arc)
//!                                              │
//! runtime.call(service, setup)                 │ BindingLookup
//!     │                                        ▼
//!     ├─► construct (fields captured)     Dispatcher
//!     ├─► setup: svc.on("done", ..)            ▲
//!     └─► Service::run(ctx)                    │
//!             │                                │
//!             └─► ctx.emit("done", args) ──────┘
//!                     ├─► first local listener for "done"
//!                     ├─► own table:    condition? → derive args → L::construct → method
//!                     └─► parent table: (one generation only)
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Dispatch is synchronous** - listeners run on the caller's stack, in order
//! 2. **First local listener wins** - one local listener per event fires
//! 3. **Own bindings before inherited** - then the immediate parent's, never further
//! 4. **No deduplication** - declaring a listener twice fires it twice
//! 5. **Errors pass through** - a listener error aborts the rest of the dispatch
//!    and reaches the caller unchanged
//!
//! ## Example
//!
//! ```ignore
//! use whisper::{args, Args, Context, Fields, Listener, ListenerOptions, RuntimeBuilder, Service};
//!
//! struct Greet {
//!     name: String,
//! }
//!
//! impl Service for Greet {
//!     type Output = ();
//!
//!     fn fields(&self) -> Fields {
//!         Fields::new().with("name", self.name.clone())
//!     }
//!
//!     fn run(&mut self, ctx: &mut Context<'_>) -> anyhow::Result<()> {
//!         ctx.emit("greeted", args![])?;
//!         Ok(())
//!     }
//! }
//!
//! struct Audit(Args);
//!
//! impl Listener for Audit {
//!     fn construct(args: Args) -> anyhow::Result<Self> {
//!         Ok(Self(args))
//!     }
//!
//!     fn run(&mut self) -> anyhow::Result<()> {
//!         tracing::info!(args = ?self.0, "greeted");
//!         Ok(())
//!     }
//! }
//!
//! let runtime = RuntimeBuilder::new()
//!     .declare::<Greet>(|table| {
//!         table.listen::<Audit>("greeted", ListenerOptions::new().args(["name"]));
//!     })
//!     .build()?;
//!
//! runtime.call(Greet { name: "ada".into() }, |svc| {
//!     svc.on("greeted", |_| {
//!         println!("done");
//!         Ok(())
//!     });
//! })?;
//! ```
//!
//! ## What This Is Not
//!
//! Whisper is **not** a message broker: no queue, no persistence, no
//! cross-process delivery. The only deferred path is a [`Background`] service
//! handed to a [`Worker`] before it starts running.

// Core modules
mod binding;
mod config;
mod core;
mod dispatch;
mod error;
mod registry;
mod runtime;
mod service;
mod transaction;

// Background services
pub mod job;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;



// Re-export core types
pub use crate::core::{Args, Emitter, Fields, ServiceKey, Value};

// Re-export binding types
pub use binding::{
    Condition, GlobalBinding, Listener, ListenerOptions, LocalAction, LocalBinding, LocalBindings,
    Method,
};

// Re-export registry types
pub use registry::{BindingLookup, Registry, RegistrationTable, RegistryBuilder};

// Re-export dispatcher
pub use dispatch::Dispatcher;

// Re-export service types
pub use service::{Context, Service, ServiceInstance};

// Re-export runtime types (primary entry point)
pub use runtime::{Runtime, RuntimeBuilder};

// Re-export transaction types
pub use transaction::{NoTransactions, TransactionProvider};

// Re-export background types
pub use job::{Background, BackgroundJob, BackgroundOptions, BackgroundOutcome, Job, JobRegistry, TokioWorker, Worker};

// Re-export configuration
pub use config::{Config, DEFAULT_BACKGROUND_DELAY};

// Re-export error types
pub use error::WhisperError;

// Re-export commonly used external types
pub use serde_json::json;
