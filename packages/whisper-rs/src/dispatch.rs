//! Event dispatcher resolving emitted events to listener invocations.
//!
//! The `Dispatcher` is responsible for:
//! 1. Firing the first local binding registered for the event
//! 2. Collecting global bindings from the emitter's own table and its parent's
//! 3. Gating each global binding on its condition
//! 4. Deriving arguments and invoking the listener
//!
//! Dispatch is synchronous and runs on the caller's stack. Errors from a
//! listener are returned unchanged and stop the remaining global bindings;
//! listeners that already ran are not rolled back.

use anyhow::Result;
use tracing::{debug, trace};

use crate::binding::{GlobalBinding, LocalBindings};
use crate::core::{Emitter, ServiceKey, Value};
use crate::registry::BindingLookup;

/// Resolves `(emitter, event, args)` into listener invocations.
#[derive(Clone, Copy)]
pub struct Dispatcher<'a> {
    lookup: &'a dyn BindingLookup,
}

impl<'a> Dispatcher<'a> {
    pub fn new(lookup: &'a dyn BindingLookup) -> Self {
        Self { lookup }
    }

    /// Global bindings for `event` in firing order: the service's own
    /// declarations first, then its parent's.
    pub fn candidates(&self, service: ServiceKey, event: &str) -> Vec<&'a GlobalBinding> {
        self.lookup
            .lineage(service)
            .into_iter()
            .flat_map(|table| table.bindings().iter().filter(|b| b.matches(event)))
            .collect()
    }

    /// Dispatch `event` raised by `emitter`.
    ///
    /// Finding no listener is not an error.
    pub fn dispatch(
        &self,
        emitter: &Emitter<'_>,
        locals: &mut LocalBindings,
        event: &str,
        args: &[Value],
    ) -> Result<()> {
        if let Some(local) = locals.first_mut(event) {
            trace!(service = %emitter.service(), event, "firing local listener");
            local.fire(args)?;
        }

        let candidates = self.candidates(emitter.service(), event);
        debug!(
            service = %emitter.service(),
            event,
            candidates = candidates.len(),
            "dispatching event"
        );

        for binding in candidates {
            if !binding.applies_to(emitter) {
                trace!(
                    service = %emitter.service(),
                    event,
                    target = binding.target(),
                    "condition not met, skipping listener"
                );
                continue;
            }

            let derived = binding.derive_args(emitter, args)?;
            binding.fire(derived)?;
        }

        Ok(())
    }
}

impl std::fmt::Debug for Dispatcher<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}
