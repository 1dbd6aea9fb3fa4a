//! # Named Values
//!
//! A process-wide table of values registered by name, used to find the
//! exception constructors the runtime raises on behalf of the interpreter.
//!
//! Each registered name owns a leaked cell, so re-registering a name updates
//! what every cached [`NamedException`] sees. A [`NamedException`] caches the
//! cell pointer after the first successful lookup (load-acquire on the fast
//! path, store-release when filling the cache).

use std::collections::HashMap;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::OnceLock;

use parking_lot::RwLock;

use crate::value::Value;

static REGISTRY: OnceLock<RwLock<HashMap<String, &'static AtomicUsize>>> = OnceLock::new();

fn registry() -> &'static RwLock<HashMap<String, &'static AtomicUsize>> {
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

fn cell(name: &str) -> Option<&'static AtomicUsize> {
    registry().read().get(name).copied()
}

/// Register `value` under `name`, replacing any earlier registration.
pub fn register_named_value(name: &str, value: Value) {
    let mut table = registry().write();
    match table.get(name) {
        Some(cell) => cell.store(value.raw(), Ordering::Release),
        None => {
            let cell: &'static AtomicUsize = Box::leak(Box::new(AtomicUsize::new(value.raw())));
            table.insert(name.to_string(), cell);
        }
    }
}

/// Look up a registered value.
pub fn named_value(name: &str) -> Option<Value> {
    cell(name).map(|c| Value(c.load(Ordering::Acquire)))
}

/// An exception constructor resolved by name on first use.
#[derive(Debug)]
pub struct NamedException {
    name: &'static str,
    cache: AtomicPtr<AtomicUsize>,
}

impl NamedException {
    /// Declare an exception looked up under `name`.
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            cache: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    /// The registration name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Resolve the constructor, or `None` if nothing is registered yet.
    pub fn try_resolve(&self) -> Option<Value> {
        let cached = self.cache.load(Ordering::Acquire);
        let cell: &AtomicUsize = if cached.is_null() {
            let found = cell(self.name)?;
            self.cache
                .store(found as *const AtomicUsize as *mut AtomicUsize, Ordering::Release);
            found
        } else {
            // SAFETY: cached pointers come from leaked registry cells.
            unsafe { &*cached }
        };
        Some(Value(cell.load(Ordering::Acquire)))
    }

    /// Resolve the constructor, exiting with status 2 when it is missing.
    pub fn resolve(&self) -> Value {
        match self.try_resolve() {
            Some(v) => v,
            None => {
                eprintln!("Fatal error: exception {}", self.name);
                std::process::exit(2)
            }
        }
    }
}

/// Raised when a continuation is resumed twice.
pub static CONTINUATION_ALREADY_RESUMED: NamedException = NamedException::new("Effect.Continuation_already_resumed");
/// Raised when an effect reaches the outermost handler.
pub static UNHANDLED: NamedException = NamedException::new("Effect.Unhandled");
/// Raised when a segment cannot grow.
pub static STACK_OVERFLOW: NamedException = NamedException::new("Stack_overflow");
/// Raised when segment memory cannot be obtained.
pub static OUT_OF_MEMORY: NamedException = NamedException::new("Out_of_memory");

/// Resolve every runtime exception now instead of at first raise.
pub fn check_named_exceptions() {
    for exn in [&CONTINUATION_ALREADY_RESUMED, &UNHANDLED, &STACK_OVERFLOW, &OUT_OF_MEMORY] {
        exn.resolve();
    }
}

/// An effect that found no handler, paired with the exception constructor.
///
/// Building the exception block from the pair is the interpreter's job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnhandledEffect {
    /// The `Effect.Unhandled` constructor.
    pub exn: Value,
    /// The effect that was performed.
    pub effect: Value,
}

impl UnhandledEffect {
    /// Pair `effect` with the resolved constructor.
    pub fn new(effect: Value) -> Self {
        Self {
            exn: UNHANDLED.resolve(),
            effect,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        register_named_value("test.named.lookup", Value::from_int(7));
        assert_eq!(named_value("test.named.lookup"), Some(Value::from_int(7)));
        assert_eq!(named_value("test.named.missing"), None);
    }

    #[test]
    fn test_cache_sees_reregistration() {
        static EXN: NamedException = NamedException::new("test.named.rereg");
        assert_eq!(EXN.try_resolve(), None);

        register_named_value("test.named.rereg", Value::from_int(1));
        assert_eq!(EXN.try_resolve(), Some(Value::from_int(1)));

        register_named_value("test.named.rereg", Value::from_int(2));
        assert_eq!(EXN.try_resolve(), Some(Value::from_int(2)));
    }

    #[test]
    fn test_unhandled_effect_pairs_constructor() {
        register_named_value("Effect.Unhandled", Value::from_int(99));
        let unhandled = UnhandledEffect::new(Value::from_int(5));
        assert_eq!(unhandled.exn, Value::from_int(99));
        assert_eq!(unhandled.effect, Value::from_int(5));
    }
}
