//! Registration tables and the registry that owns them.
//!
//! Global listeners are declared during an explicit initialization step:
//!
//! ```ignore
//! let registry = RegistryBuilder::new()
//!     .declare::<CreateUser>(|table| {
//!         table
//!             .listen::<SendWelcome>("created", ListenerOptions::new())
//!             .listen::<AuditLog>("created", ListenerOptions::new().args(["email"]));
//!     })
//!     .inherit::<CreateAdmin, CreateUser>()
//!     .build();
//! ```
//!
//! After `build()` the registry is read-only and shared behind an `Arc`. The
//! dispatcher only sees it through [`BindingLookup`].

use std::borrow::Cow;
use std::collections::HashMap;

use crate::binding::{GlobalBinding, Listener, ListenerOptions};
use crate::core::ServiceKey;
use crate::error::WhisperError;
use crate::service::Service;

/// The global bindings declared on one service type.
#[derive(Debug, Clone)]
pub struct RegistrationTable {
    owner: ServiceKey,
    parent: Option<ServiceKey>,
    bindings: Vec<GlobalBinding>,
}

impl RegistrationTable {
    /// Create an empty table owned by `owner`.
    pub fn new(owner: ServiceKey) -> Self {
        Self {
            owner,
            parent: None,
            bindings: Vec::new(),
        }
    }

    /// Declare listener `L` for `event`.
    ///
    /// Pure append: duplicates are kept and fire independently.
    pub fn listen<L: Listener>(
        &mut self,
        event: impl Into<Cow<'static, str>>,
        options: ListenerOptions<L>,
    ) -> &mut Self {
        self.push(GlobalBinding::new(event, options))
    }

    /// Append a prepared binding, stamping this table's owner as its origin.
    pub fn push(&mut self, binding: GlobalBinding) -> &mut Self {
        self.bindings.push(binding.with_origin(self.owner));
        self
    }

    pub fn owner(&self) -> ServiceKey {
        self.owner
    }

    /// The service type this one extends, if any.
    pub fn parent(&self) -> Option<ServiceKey> {
        self.parent
    }

    pub(crate) fn set_parent(&mut self, parent: ServiceKey) {
        self.parent = Some(parent);
    }

    /// All bindings in declaration order.
    pub fn bindings(&self) -> &[GlobalBinding] {
        &self.bindings
    }

    /// Bindings responding to `event`, in declaration order.
    pub fn matching<'a>(&'a self, event: &'a str) -> impl Iterator<Item = &'a GlobalBinding> + 'a {
        self.bindings.iter().filter(move |binding| binding.matches(event))
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Validate every binding, failing on the first invalid one.
    pub fn validate(&self) -> Result<(), WhisperError> {
        self.bindings.iter().try_for_each(GlobalBinding::validate)
    }
}

/// Read access to registration tables, injected into the dispatcher.
pub trait BindingLookup: Send + Sync {
    /// The table declared for `service`, if any.
    fn table(&self, service: ServiceKey) -> Option<&RegistrationTable>;

    /// The tables consulted when `service` emits: its own table followed by
    /// its immediate parent's table.
    ///
    /// Lookup stops at one generation; a grandparent's table is never
    /// returned.
    fn lineage(&self, service: ServiceKey) -> Vec<&RegistrationTable> {
        let Some(own) = self.table(service) else {
            return Vec::new();
        };

        let mut tables = vec![own];
        if let Some(parent) = own.parent().and_then(|parent| self.table(parent)) {
            tables.push(parent);
        }
        tables
    }
}

/// Process-wide registry of registration tables keyed by service type.
#[derive(Debug, Default)]
pub struct Registry {
    tables: HashMap<ServiceKey, RegistrationTable>,
}

impl Registry {
    /// A registry with no declarations.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Number of service types with a table.
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Validate every table.
    pub fn validate(&self) -> Result<(), WhisperError> {
        self.tables.values().try_for_each(RegistrationTable::validate)
    }
}

impl BindingLookup for Registry {
    fn table(&self, service: ServiceKey) -> Option<&RegistrationTable> {
        self.tables.get(&service)
    }
}

/// Builder populating a [`Registry`] during initialization.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    tables: HashMap<ServiceKey, RegistrationTable>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare global listeners for service `S`.
    ///
    /// Calling this again for the same service appends to its table.
    pub fn declare<S: Service>(mut self, declare: impl FnOnce(&mut RegistrationTable)) -> Self {
        declare(self.table_mut(S::key()));
        self
    }

    /// Record that `Child` extends `Parent`: bindings declared on `Parent`
    /// also fire for `Child`'s events.
    pub fn inherit<Child: Service, Parent: Service>(mut self) -> Self {
        self.table_mut(Child::key()).set_parent(Parent::key());
        self
    }

    /// Freeze the declarations.
    pub fn build(self) -> Registry {
        Registry {
            tables: self.tables,
        }
    }

    fn table_mut(&mut self, key: ServiceKey) -> &mut RegistrationTable {
        self.tables
            .entry(key)
            .or_insert_with(|| RegistrationTable::new(key))
    }
}
