//! Runtime - the entry point wiring registry, transactions and config.
//!
//! # Usage
//!
//! ```ignore
//! use whisper::{ListenerOptions, RuntimeBuilder};
//!
//! let runtime = RuntimeBuilder::from_config(Config::from_env()?)
//!     .declare::<CreateUser>(|table| {
//!         table.listen::<SendWelcome>("created", ListenerOptions::new().args(["email"]));
//!     })
//!     .with_transactions(Arc::new(PgTransactions::new(pool)))
//!     .build()?;
//!
//! // construct → configure → run
//! let user = runtime.call(CreateUser::new(input), |svc| {
//!     svc.on("fail", |args| {
//!         warn!(?args, "signup rejected");
//!         Ok(())
//!     });
//! })?;
//! ```

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::config::Config;
use crate::registry::{BindingLookup, Registry, RegistrationTable, RegistryBuilder};
use crate::service::{Service, ServiceInstance};
use crate::transaction::TransactionProvider;

/// Shared handle for constructing and running services.
///
/// Cheap to clone; the registry is read-only after `build()`.
#[derive(Clone, Debug)]
pub struct Runtime {
    registry: Arc<Registry>,
    transactions: Option<Arc<dyn TransactionProvider>>,
    config: Config,
}

impl Runtime {
    /// Construct an instance of `service` without running it.
    pub fn instance<S: Service>(&self, service: S) -> ServiceInstance<S> {
        let lookup: Arc<dyn BindingLookup> = self.registry.clone();
        let instance = ServiceInstance::new(service, lookup).with_config(self.config.clone());

        match &self.transactions {
            Some(provider) => instance.with_transactions(provider.clone()),
            None => instance,
        }
    }

    /// Construct `service`, hand it to `setup`, then run it.
    pub fn call<S: Service>(
        &self,
        service: S,
        setup: impl FnOnce(&mut ServiceInstance<S>),
    ) -> Result<S::Output> {
        self.instance(service).configure(setup).run()
    }

    /// Construct and run `service` with no local listeners.
    pub fn run<S: Service>(&self, service: S) -> Result<S::Output> {
        self.instance(service).run()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

/// Builder for [`Runtime`].
#[derive(Debug, Default)]
pub struct RuntimeBuilder {
    registry: RegistryBuilder,
    transactions: Option<Arc<dyn TransactionProvider>>,
    config: Config,
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a loaded [`Config`].
    pub fn from_config(config: Config) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Declare global listeners for service `S`.
    pub fn declare<S: Service>(mut self, declare: impl FnOnce(&mut RegistrationTable)) -> Self {
        self.registry = self.registry.declare::<S>(declare);
        self
    }

    /// Record that `Child` extends `Parent`.
    pub fn inherit<Child: Service, Parent: Service>(mut self) -> Self {
        self.registry = self.registry.inherit::<Child, Parent>();
        self
    }

    pub fn with_transactions(mut self, provider: Arc<dyn TransactionProvider>) -> Self {
        self.transactions = Some(provider);
        self
    }

    /// Validate every binding at build time.
    pub fn validate_bindings(mut self, validate: bool) -> Self {
        self.config.validate_bindings = validate;
        self
    }

    /// Freeze the registry.
    ///
    /// Fails only when binding validation is enabled and a binding is invalid.
    pub fn build(self) -> Result<Runtime> {
        let registry = self.registry.build();
        if self.config.validate_bindings {
            registry.validate()?;
        }

        info!(
            services = registry.len(),
            transactions = self.transactions.is_some(),
            "whisper runtime built"
        );

        Ok(Runtime {
            registry: Arc::new(registry),
            transactions: self.transactions,
            config: self.config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    use serde_json::json;

    use crate::args;
    use crate::binding::{Listener, ListenerOptions};
    use crate::core::{Args, Fields};
    use crate::error::WhisperError;
    use crate::service::Context;
    use crate::testing::CountingTransactions;

    thread_local! {
        static WELCOMED: RefCell<Vec<Args>> = const { RefCell::new(Vec::new()) };
    }

    struct Welcome(Args);

    impl Listener for Welcome {
        fn construct(args: Args) -> Result<Self> {
            Ok(Self(args))
        }

        fn run(&mut self) -> Result<()> {
            WELCOMED.with(|w| w.borrow_mut().push(self.0.clone()));
            Ok(())
        }
    }

    struct Signup {
        email: &'static str,
    }

    impl Service for Signup {
        type Output = &'static str;

        fn fields(&self) -> Fields {
            Fields::new().with("email", self.email)
        }

        fn run(&mut self, ctx: &mut Context<'_>) -> Result<&'static str> {
            if self.email.contains('@') {
                ctx.transaction(|ctx| ctx.emit("ok", args![]).map(|_| ()))?;
                Ok("ok")
            } else {
                ctx.emit("fail", args![self.email])?;
                Ok("fail")
            }
        }
    }

    fn runtime() -> Runtime {
        RuntimeBuilder::new()
            .declare::<Signup>(|t| {
                t.listen::<Welcome>("ok", ListenerOptions::new().args(["email"]));
            })
            .build()
            .unwrap()
    }

    #[test]
    fn test_call_runs_setup_then_service() {
        let runtime = runtime();
        let failures = Rc::new(RefCell::new(Vec::new()));
        let sink = failures.clone();

        let outcome = runtime
            .call(Signup { email: "nope" }, |svc| {
                svc.on("fail", move |args| {
                    sink.borrow_mut().push(args.to_vec());
                    Ok(())
                });
            })
            .unwrap();

        assert_eq!(outcome, "fail");
        assert_eq!(*failures.borrow(), vec![vec![json!("nope")]]);
        WELCOMED.with(|w| assert!(w.borrow().is_empty()));
    }

    #[test]
    fn test_run_fires_global_listeners() {
        let runtime = runtime();

        assert_eq!(runtime.run(Signup { email: "a@b.c" }).unwrap(), "ok");
        WELCOMED.with(|w| assert_eq!(*w.borrow(), vec![vec![json!("a@b.c")]]));
    }

    #[test]
    fn test_transactions_are_injected_into_instances() {
        let transactions = CountingTransactions::new();
        let runtime = RuntimeBuilder::new()
            .with_transactions(Arc::new(transactions.clone()))
            .build()
            .unwrap();

        runtime.run(Signup { email: "a@b.c" }).unwrap();
        assert_eq!(transactions.committed(), 1);
    }

    #[test]
    fn test_build_validates_when_enabled() {
        let builder = || {
            RuntimeBuilder::new().declare::<Signup>(|t| {
                t.listen::<Welcome>("ok", ListenerOptions::new().args(["e-mail"]));
            })
        };

        assert!(builder().build().is_ok());

        let err = builder().validate_bindings(true).build().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<WhisperError>(),
            Some(WhisperError::InvalidBinding { .. })
        ));
    }

    #[test]
    fn test_from_config_carries_settings() {
        let config = Config {
            default_delay: std::time::Duration::from_secs(9),
            validate_bindings: false,
        };
        let runtime = RuntimeBuilder::from_config(config.clone()).build().unwrap();

        assert_eq!(runtime.config(), &config);
        assert!(runtime.registry().is_empty());
        assert_eq!(runtime.instance(Signup { email: "x" }).fields().len(), 1);
    }
}
