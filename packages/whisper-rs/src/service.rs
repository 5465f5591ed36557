//! Services, their instances, and the context a running service emits through.
//!
//! # Lifecycle
//!
//! ```text
//! construct ─► configure (attach local listeners) ─► run ─► drop
//!                                                      │
//!                                                      └─► ctx.emit(...) ─► Dispatcher
//! ```
//!
//! Constructing an instance never emits. Events are raised only from inside
//! [`Service::run`], through the [`Context`] it receives.

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use tracing::debug;

use crate::binding::{LocalBinding, LocalBindings};
use crate::config::Config;
use crate::core::{Args, Emitter, Fields, ServiceKey, Value};
use crate::dispatch::Dispatcher;
use crate::error::WhisperError;
use crate::registry::BindingLookup;
use crate::transaction::TransactionProvider;

/// A unit of work that reports through events.
///
/// # Example
///
/// ```ignore
/// struct CreateUser {
///     email: String,
/// }
///
/// impl Service for CreateUser {
///     type Output = ();
///
///     fn fields(&self) -> Fields {
///         Fields::new().with("email", self.email.clone())
///     }
///
///     fn run(&mut self, ctx: &mut Context<'_>) -> Result<()> {
///         if !self.email.contains('@') {
///             ctx.emit("fail", args![self.email])?;
///             return Ok(());
///         }
///         let id = ctx.transaction(|_| users::insert(&self.email))?;
///         ctx.set_field("id", id);
///         ctx.emit("created", args![id])?;
///         Ok(())
///     }
/// }
/// ```
pub trait Service: Sized + 'static {
    /// What `run` returns to the caller.
    type Output;

    /// Registry key for this service's global bindings.
    fn key() -> ServiceKey {
        ServiceKey::of::<Self>()
    }

    /// Fields exposed to conditions and argument derivation, captured when
    /// the instance is constructed.
    fn fields(&self) -> Fields {
        Fields::new()
    }

    /// The service operation. Every concrete service overrides this.
    fn run(&mut self, _ctx: &mut Context<'_>) -> Result<Self::Output> {
        Err(WhisperError::not_implemented::<Self>("run").into())
    }
}

// =============================================================================
// Context
// =============================================================================

/// What a running service can do besides its own work: emit events, update
/// the fields listeners read, and scope work in a transaction.
pub struct Context<'a> {
    service: ServiceKey,
    fields: &'a mut Fields,
    locals: &'a mut LocalBindings,
    dispatcher: Dispatcher<'a>,
    transactions: Option<Arc<dyn TransactionProvider>>,
    config: &'a Config,
}

impl<'a> Context<'a> {
    /// Raise `event` with positional `args`.
    ///
    /// Returns the context so emits can be chained. Any listener error is
    /// returned unchanged.
    pub fn emit(&mut self, event: &str, args: Args) -> Result<&mut Self> {
        let emitter = Emitter::new(self.service, &*self.fields);
        self.dispatcher
            .dispatch(&emitter, &mut *self.locals, event, &args)?;
        Ok(self)
    }

    /// The emitting service type.
    pub fn service(&self) -> ServiceKey {
        self.service
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Update a field; later emits see the new value.
    pub fn set_field(&mut self, name: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.fields.set(name, value);
        self
    }

    pub fn fields(&self) -> &Fields {
        self.fields
    }

    pub fn config(&self) -> &Config {
        self.config
    }

    /// Run `block` inside the configured transaction provider, or directly
    /// when none is configured.
    pub fn transaction<T>(&mut self, block: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let Some(provider) = self.transactions.clone() else {
            return block(self);
        };

        let mut block = Some(block);
        let mut output = None;
        provider.run_in_transaction(&mut || -> Result<()> {
            if let Some(block) = block.take() {
                output = Some(block(&mut *self)?);
            }
            Ok(())
        })?;

        output.ok_or_else(|| WhisperError::TransactionNotRun.into())
    }
}

impl fmt::Debug for Context<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("service", &self.service)
            .field("fields", &self.fields)
            .field("local_bindings", &self.locals.len())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Service Instance
// =============================================================================

/// A constructed service with its fields and local listeners.
///
/// Built by [`Runtime::instance`](crate::Runtime::instance) or directly from
/// a binding lookup.
pub struct ServiceInstance<S: Service> {
    service: S,
    fields: Fields,
    locals: LocalBindings,
    lookup: Arc<dyn BindingLookup>,
    transactions: Option<Arc<dyn TransactionProvider>>,
    config: Config,
}

impl<S: Service> ServiceInstance<S> {
    /// Wrap a constructed service. Captures its fields; emits nothing.
    pub fn new(service: S, lookup: Arc<dyn BindingLookup>) -> Self {
        let fields = service.fields();
        Self {
            service,
            fields,
            locals: LocalBindings::new(),
            lookup,
            transactions: None,
            config: Config::default(),
        }
    }

    pub fn with_transactions(mut self, provider: Arc<dyn TransactionProvider>) -> Self {
        self.transactions = Some(provider);
        self
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Hand the instance to a setup callback before it runs.
    pub fn configure(mut self, setup: impl FnOnce(&mut Self)) -> Self {
        setup(&mut self);
        self
    }

    /// Attach a local listener for `event`.
    ///
    /// Only the first listener attached for a given event fires.
    pub fn on<F>(&mut self, event: impl Into<Cow<'static, str>>, action: F) -> &mut Self
    where
        F: FnMut(&[Value]) -> Result<()> + 'static,
    {
        self.locals.push(LocalBinding::new(event, action));
        self
    }

    /// Execute the service operation.
    pub fn run(&mut self) -> Result<S::Output> {
        debug!(service = %S::key(), "running service");

        let mut ctx = Context {
            service: S::key(),
            fields: &mut self.fields,
            locals: &mut self.locals,
            dispatcher: Dispatcher::new(self.lookup.as_ref()),
            transactions: self.transactions.clone(),
            config: &self.config,
        };
        self.service.run(&mut ctx)
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    pub fn local_bindings(&self) -> &LocalBindings {
        &self.locals
    }

    pub fn into_inner(self) -> S {
        self.service
    }
}

impl<S: Service> fmt::Debug for ServiceInstance<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceInstance")
            .field("service", &S::key())
            .field("fields", &self.fields)
            .field("local_bindings", &self.locals.len())
            .field("transactions", &self.transactions.is_some())
            .finish_non_exhaustive()
    }
}
