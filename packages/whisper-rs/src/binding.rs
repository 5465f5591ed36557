//! Listener bindings: local closures and declared global listeners.
//!
//! A [`LocalBinding`] is attached to one service instance during setup and
//! dies with it. A [`GlobalBinding`] is declared once per service type in a
//! [`RegistrationTable`](crate::RegistrationTable) and fires for every
//! instance of that type (and of types extending it).
//!
//! # Global listener lifecycle
//!
//! ```text
//! emit("ok", args)
//!   → condition(emitter)?           skip when false
//!   → derive args                   named fields, or the positional args
//!   → L::construct(args)            fresh listener per firing
//!   → attach_origin(declaring type)
//!   → method(&mut listener)         default: Listener::run
//! ```

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;

use crate::core::{Args, Emitter, ServiceKey, Value};
use crate::error::WhisperError;

// =============================================================================
// Listener
// =============================================================================

/// A type that global bindings construct and invoke when an event fires.
///
/// Each firing constructs a new listener from the derived arguments, so a
/// listener holds no state between events.
///
/// # Example
///
/// ```ignore
/// struct SendWelcome {
///     email: String,
/// }
///
/// impl Listener for SendWelcome {
///     fn construct(args: Args) -> Result<Self> {
///         let email = args.first().and_then(Value::as_str).unwrap_or_default();
///         Ok(Self { email: email.to_string() })
///     }
///
///     fn run(&mut self) -> Result<()> {
///         mailer::send_welcome(&self.email)
///     }
/// }
/// ```
pub trait Listener: Sized + 'static {
    /// Build the listener from the derived event arguments.
    fn construct(args: Args) -> Result<Self>;

    /// Receive the service type the firing binding was declared on.
    ///
    /// Called after construction and before the bound method.
    fn attach_origin(&mut self, _origin: ServiceKey) {}

    /// The default entry point bound when no method is named.
    fn run(&mut self) -> Result<()> {
        Err(WhisperError::not_implemented::<Self>("run").into())
    }
}

/// Predicate over the emitting instance gating a global binding.
pub type Condition = Arc<dyn Fn(&Emitter<'_>) -> bool + Send + Sync>;

/// Method of a listener type a binding invokes.
pub type Method<L> = fn(&mut L) -> Result<()>;

type Invoker = Arc<dyn Fn(Args, Option<ServiceKey>) -> Result<()> + Send + Sync>;

/// Options for declaring a global listener.
///
/// Defaults to the listener's `run` method, no condition, and the event's
/// positional arguments.
pub struct ListenerOptions<L> {
    method_name: &'static str,
    method: Method<L>,
    condition: Option<Condition>,
    argument_names: Option<Vec<String>>,
}

impl<L: Listener> ListenerOptions<L> {
    pub fn new() -> Self {
        Self {
            method_name: "run",
            method: L::run,
            condition: None,
            argument_names: None,
        }
    }

    /// Invoke `method` instead of `run`. The name labels the binding in logs
    /// and is what `validate()` checks.
    pub fn method(mut self, name: &'static str, method: Method<L>) -> Self {
        self.method_name = name;
        self.method = method;
        self
    }

    /// Fire only when `condition` holds for the emitting instance.
    pub fn when<F>(mut self, condition: F) -> Self
    where
        F: Fn(&Emitter<'_>) -> bool + Send + Sync + 'static,
    {
        self.condition = Some(Arc::new(condition));
        self
    }

    /// Construct the listener from these emitter fields, in order, instead
    /// of the event's positional arguments.
    pub fn args<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.argument_names = Some(names.into_iter().map(Into::into).collect());
        self
    }
}

impl<L: Listener> Default for ListenerOptions<L> {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Global Binding
// =============================================================================

/// A declared listener: which type to build, which method to call, and when.
#[derive(Clone)]
pub struct GlobalBinding {
    target: &'static str,
    event: Cow<'static, str>,
    method_name: &'static str,
    condition: Option<Condition>,
    argument_names: Option<Vec<String>>,
    origin: Option<ServiceKey>,
    invoke: Invoker,
}

impl GlobalBinding {
    /// Create a binding for listener type `L` responding to `event`.
    ///
    /// The binding carries no origin until it is pushed onto a table.
    pub fn new<L: Listener>(event: impl Into<Cow<'static, str>>, options: ListenerOptions<L>) -> Self {
        let method = options.method;
        let invoke: Invoker = Arc::new(move |args: Args, origin: Option<ServiceKey>| {
            let mut listener = L::construct(args)?;
            if let Some(origin) = origin {
                listener.attach_origin(origin);
            }
            method(&mut listener)
        });

        Self {
            target: std::any::type_name::<L>(),
            event: event.into(),
            method_name: options.method_name,
            condition: options.condition,
            argument_names: options.argument_names,
            origin: None,
            invoke,
        }
    }

    /// Record the service type this binding was declared on.
    pub fn with_origin(mut self, origin: ServiceKey) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn target(&self) -> &'static str {
        self.target
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn method_name(&self) -> &'static str {
        self.method_name
    }

    pub fn argument_names(&self) -> Option<&[String]> {
        self.argument_names.as_deref()
    }

    pub fn origin(&self) -> Option<ServiceKey> {
        self.origin
    }

    pub fn has_condition(&self) -> bool {
        self.condition.is_some()
    }

    /// Whether this binding responds to `event`.
    pub fn matches(&self, event: &str) -> bool {
        self.event == event
    }

    /// Evaluate the condition against the emitter. Absent conditions pass.
    pub fn applies_to(&self, emitter: &Emitter<'_>) -> bool {
        self.condition.as_ref().map_or(true, |condition| condition(emitter))
    }

    /// Compute the listener's constructor arguments.
    ///
    /// Named fields are read off the emitter in declaration order; without
    /// names the positional arguments are passed through verbatim.
    pub fn derive_args(&self, emitter: &Emitter<'_>, positional: &[Value]) -> Result<Args> {
        let Some(names) = &self.argument_names else {
            return Ok(positional.to_vec());
        };

        names
            .iter()
            .map(|name| {
                emitter.field(name).cloned().ok_or_else(|| {
                    WhisperError::MissingField {
                        service: emitter.service().name(),
                        field: name.clone(),
                    }
                    .into()
                })
            })
            .collect()
    }

    /// Construct the listener with `args` and invoke the bound method.
    pub fn fire(&self, args: Args) -> Result<()> {
        (self.invoke)(args, self.origin)
    }

    /// Check the binding's labels.
    ///
    /// Method references and conditions are checked by the compiler; what
    /// remains is that the method label and argument names are identifiers.
    pub fn validate(&self) -> Result<(), WhisperError> {
        if !is_identifier(self.method_name) {
            return Err(self.invalid(format!(
                "method name '{}' is not an identifier",
                self.method_name
            )));
        }

        if let Some(names) = &self.argument_names {
            if let Some(bad) = names.iter().find(|name| !is_identifier(name)) {
                return Err(self.invalid(format!("argument name '{}' is not an identifier", bad)));
            }
        }

        Ok(())
    }

    fn invalid(&self, reason: String) -> WhisperError {
        WhisperError::InvalidBinding {
            target: self.target,
            event: self.event.to_string(),
            reason: reason.into(),
        }
    }
}

impl fmt::Debug for GlobalBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalBinding")
            .field("target", &self.target)
            .field("event", &self.event)
            .field("method", &self.method_name)
            .field("has_condition", &self.condition.is_some())
            .field("argument_names", &self.argument_names)
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_ascii_alphabetic() => {
            chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
        }
        _ => false,
    }
}

// =============================================================================
// Local Bindings
// =============================================================================

/// Closure attached to a single service instance.
pub type LocalAction = Box<dyn FnMut(&[Value]) -> Result<()>>;

/// A listener attached to one instance during setup.
pub struct LocalBinding {
    event: Cow<'static, str>,
    action: LocalAction,
}

impl LocalBinding {
    pub fn new<F>(event: impl Into<Cow<'static, str>>, action: F) -> Self
    where
        F: FnMut(&[Value]) -> Result<()> + 'static,
    {
        Self {
            event: event.into(),
            action: Box::new(action),
        }
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    /// Invoke the captured action with the event's positional arguments.
    pub fn fire(&mut self, args: &[Value]) -> Result<()> {
        (self.action)(args)
    }
}

impl fmt::Debug for LocalBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalBinding")
            .field("event", &self.event)
            .finish_non_exhaustive()
    }
}

/// The local bindings owned by one service instance, in registration order.
#[derive(Debug, Default)]
pub struct LocalBindings {
    bindings: Vec<LocalBinding>,
}

impl LocalBindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, binding: LocalBinding) {
        self.bindings.push(binding);
    }

    /// The first binding registered for `event`.
    ///
    /// Later bindings for the same event are never returned.
    // TODO: decide whether every local binding for an event should fire;
    // callers currently rely on the first registration winning.
    pub fn first_mut(&mut self, event: &str) -> Option<&mut LocalBinding> {
        self.bindings.iter_mut().find(|binding| binding.event() == event)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Fields;
    use serde_json::json;
    use std::cell::RefCell;

    thread_local! {
        static BUILT: RefCell<Vec<(Args, Option<ServiceKey>)>> = const { RefCell::new(Vec::new()) };
        static CALLS: RefCell<Vec<&'static str>> = const { RefCell::new(Vec::new()) };
    }

    struct Origin;

    struct Probe {
        args: Args,
        origin: Option<ServiceKey>,
    }

    impl Probe {
        fn on_ok(&mut self) -> Result<()> {
            CALLS.with(|c| c.borrow_mut().push("on_ok"));
            BUILT.with(|b| b.borrow_mut().push((self.args.clone(), self.origin)));
            Ok(())
        }
    }

    impl Listener for Probe {
        fn construct(args: Args) -> Result<Self> {
            Ok(Self { args, origin: None })
        }

        fn attach_origin(&mut self, origin: ServiceKey) {
            self.origin = Some(origin);
        }

        fn run(&mut self) -> Result<()> {
            CALLS.with(|c| c.borrow_mut().push("run"));
            BUILT.with(|b| b.borrow_mut().push((self.args.clone(), self.origin)));
            Ok(())
        }
    }

    struct Bare;

    impl Listener for Bare {
        fn construct(_args: Args) -> Result<Self> {
            Ok(Bare)
        }
    }

    fn emitter_fields() -> Fields {
        Fields::new().with("name", "q").with("flag", false)
    }

    #[test]
    fn test_default_options_invoke_run() {
        let binding = GlobalBinding::new("ping", ListenerOptions::<Probe>::new());
        assert_eq!(binding.method_name(), "run");

        binding.fire(vec![json!("x")]).unwrap();

        CALLS.with(|c| assert_eq!(*c.borrow(), vec!["run"]));
        BUILT.with(|b| assert_eq!(b.borrow()[0], (vec![json!("x")], None)));
    }

    #[test]
    fn test_named_method_and_origin() {
        let origin = ServiceKey::of::<Origin>();
        let binding = GlobalBinding::new(
            "ping",
            ListenerOptions::<Probe>::new().method("on_ok", Probe::on_ok),
        )
        .with_origin(origin);

        binding.fire(vec![]).unwrap();

        CALLS.with(|c| assert_eq!(*c.borrow(), vec!["on_ok"]));
        BUILT.with(|b| assert_eq!(b.borrow()[0].1, Some(origin)));
    }

    #[test]
    fn test_default_run_is_not_implemented() {
        let binding = GlobalBinding::new("ping", ListenerOptions::<Bare>::new());
        let err = binding.fire(vec![]).unwrap_err();

        let whisper = err.downcast_ref::<WhisperError>().unwrap();
        assert!(whisper.is_not_implemented());
    }

    #[test]
    fn test_derive_args_prefers_named_fields() {
        let fields = emitter_fields();
        let emitter = Emitter::new(ServiceKey::of::<Origin>(), &fields);

        let positional = GlobalBinding::new("ping", ListenerOptions::<Probe>::new());
        assert_eq!(
            positional.derive_args(&emitter, &[json!(1), json!(2)]).unwrap(),
            vec![json!(1), json!(2)]
        );

        let named = GlobalBinding::new("ping", ListenerOptions::<Probe>::new().args(["flag", "name"]));
        assert_eq!(
            named.derive_args(&emitter, &[json!(1)]).unwrap(),
            vec![json!(false), json!("q")]
        );
    }

    #[test]
    fn test_derive_args_missing_field() {
        let fields = emitter_fields();
        let emitter = Emitter::new(ServiceKey::of::<Origin>(), &fields);
        let binding = GlobalBinding::new("ping", ListenerOptions::<Probe>::new().args(["nope"]));

        let err = binding.derive_args(&emitter, &[]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<WhisperError>(),
            Some(WhisperError::MissingField { field, .. }) if field == "nope"
        ));
    }

    #[test]
    fn test_condition_gates_binding() {
        let fields = emitter_fields();
        let emitter = Emitter::new(ServiceKey::of::<Origin>(), &fields);

        let always = GlobalBinding::new("ping", ListenerOptions::<Probe>::new());
        let flagged = GlobalBinding::new("ping", ListenerOptions::<Probe>::new().when(|e| e.flag("flag")));

        assert!(always.applies_to(&emitter));
        assert!(!flagged.applies_to(&emitter));
        assert!(flagged.has_condition());
    }

    #[test]
    fn test_validate_checks_labels() {
        let ok = GlobalBinding::new(
            "ping",
            ListenerOptions::<Probe>::new().method("on_ok", Probe::on_ok).args(["name"]),
        );
        assert!(ok.validate().is_ok());

        let bad_method = GlobalBinding::new("ping", ListenerOptions::<Probe>::new().method("on ok", Probe::on_ok));
        assert!(matches!(bad_method.validate(), Err(WhisperError::InvalidBinding { .. })));

        let bad_arg = GlobalBinding::new("ping", ListenerOptions::<Probe>::new().args(["1st"]));
        let err = bad_arg.validate().unwrap_err();
        assert!(err.to_string().contains("argument name '1st'"));
    }

    #[test]
    fn test_local_bindings_first_match() {
        let seen = std::rc::Rc::new(RefCell::new(Vec::new()));
        let mut locals = LocalBindings::new();

        let first = seen.clone();
        locals.push(LocalBinding::new("done", move |_| {
            first.borrow_mut().push("first");
            Ok(())
        }));
        let second = seen.clone();
        locals.push(LocalBinding::new("done", move |_| {
            second.borrow_mut().push("second");
            Ok(())
        }));

        locals.first_mut("done").unwrap().fire(&[]).unwrap();

        assert_eq!(*seen.borrow(), vec!["first"]);
        assert!(locals.first_mut("other").is_none());
        assert_eq!(locals.len(), 2);
    }
}
