//! Core value types shared by services, bindings and the dispatcher.
//!
//! # Overview
//!
//! - [`ServiceKey`] identifies a service type in the registry
//! - [`Fields`] is the named state a service exposes to listeners
//! - [`Emitter`] is the read-only view of an emitting instance handed to
//!   conditions and argument derivation
//!
//! Event arguments are plain [`Value`]s so that a listener can be declared
//! against any service without sharing types with it.

use std::any::TypeId;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

pub use serde_json::Value;

/// Positional arguments carried by an event.
pub type Args = Vec<Value>;

/// Builds an [`Args`] vector from anything `serde_json::json!` accepts.
///
/// ```ignore
/// ctx.emit("ok", args!["test", 42])?;
/// ```
#[macro_export]
macro_rules! args {
    () => {
        ::std::vec::Vec::<$crate::Value>::new()
    };
    ($($value:expr),+ $(,)?) => {
        ::std::vec![$($crate::json!($value)),+]
    };
}

/// Identity of a service type.
///
/// Equality and hashing use the `TypeId`; the name is carried for logs,
/// errors and job records.
#[derive(Clone, Copy)]
pub struct ServiceKey {
    id: TypeId,
    name: &'static str,
}

impl ServiceKey {
    /// Key for the type `T`.
    pub fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    /// The fully qualified type name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The type name with every path shortened to its last segment,
    /// including paths inside generic arguments: `app::Gen<app::Tag>` is
    /// `Gen<Tag>`.
    pub fn short_name(&self) -> String {
        self.to_string()
    }

    /// Whether this key identifies `T`.
    pub fn is<T: 'static>(&self) -> bool {
        self.id == TypeId::of::<T>()
    }
}

impl PartialEq for ServiceKey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ServiceKey {}

impl Hash for ServiceKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ServiceKey").field(&self.name).finish()
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut rest = self.name;
        while !rest.is_empty() {
            let end = rest.find(is_delimiter).unwrap_or(rest.len());
            let (path, tail) = rest.split_at(end);
            f.write_str(path.rsplit("::").next().unwrap_or(path))?;

            let delimiters = tail.find(|c: char| !is_delimiter(c)).unwrap_or(tail.len());
            let (punct, tail) = tail.split_at(delimiters);
            f.write_str(punct)?;
            rest = tail;
        }
        Ok(())
    }
}

// Anything that can end a path in a type name: generics, tuples, slices,
// references, pointers and `dyn` bounds.
fn is_delimiter(c: char) -> bool {
    matches!(c, '<' | '>' | ',' | ' ' | '(' | ')' | '[' | ']' | ';' | '&' | '*' | '+')
}

/// Named state a service exposes for argument derivation and conditions.
///
/// Populated from [`Service::fields`](crate::Service::fields) when the
/// instance is constructed and updated by the running operation through
/// [`Context::set_field`](crate::Context::set_field).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fields {
    values: BTreeMap<String, Value>,
}

impl Fields {
    /// Create an empty field map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    /// Insert or replace a field.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(name.into(), value.into());
    }

    /// Read a field.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Whether a field with this name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterate fields in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Fields {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut fields = Fields::new();
        for (name, value) in iter {
            fields.set(name, value);
        }
        fields
    }
}

/// Read-only view of the service instance that raised an event.
#[derive(Debug, Clone, Copy)]
pub struct Emitter<'a> {
    service: ServiceKey,
    fields: &'a Fields,
}

impl<'a> Emitter<'a> {
    pub fn new(service: ServiceKey, fields: &'a Fields) -> Self {
        Self { service, fields }
    }

    /// The emitting service type.
    pub fn service(&self) -> ServiceKey {
        self.service
    }

    /// Read one of the emitter's fields.
    pub fn field(&self, name: &str) -> Option<&'a Value> {
        self.fields.get(name)
    }

    /// True only when the field exists and is the boolean `true`.
    pub fn flag(&self, name: &str) -> bool {
        matches!(self.fields.get(name), Some(Value::Bool(true)))
    }

    pub fn fields(&self) -> &'a Fields {
        self.fields
    }
}
