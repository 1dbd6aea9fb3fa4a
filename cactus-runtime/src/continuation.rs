//! # One-Shot Continuations
//!
//! A continuation holds a suspended chain of segments. It moves from
//! populated to empty exactly once; every later use fails with
//! [`RuntimeError::ContinuationAlreadyResumed`].
//!
//! ## Design
//!
//! The chain is held as an `AtomicPtr<Segment>` obtained from
//! `Box::into_raw`. Taking it is a single atomic swap with null, so when
//! two threads race to resume the same continuation exactly one receives
//! the chain.
//!
//! `replace` performs the reverse transition (null to populated) and treats
//! a populated slot as corrupted runtime state.
//!
//! ## Technical References
//!
//! - [Retrofitting Effect Handlers onto OCaml](https://dl.acm.org/doi/10.1145/3453483.3454039) (PLDI'21)

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use crate::domain::Domain;
use crate::error::{fatal_error, InvariantViolation, RuntimeError, RuntimeResult};
use crate::fiber::FiberId;
use crate::log::{LogLevel, LogTarget};
use crate::runtime_log;
use crate::segment::{Handlers, Segment};

const NO_FIBER: u64 = u64::MAX;

/// A suspended segment chain that can be resumed once.
#[derive(Debug)]
pub struct Continuation {
    stack: AtomicPtr<Segment>,
    fiber: AtomicU64,
}

// SAFETY: the chain is only reachable through atomic ownership transfer.
unsafe impl Send for Continuation {}
// SAFETY: every shared access to the slot is a single atomic operation,
// and only the thread that swaps a non-null pointer out owns the chain.
unsafe impl Sync for Continuation {}

impl Continuation {
    /// A populated continuation holding `chain`.
    pub fn new(chain: Box<Segment>) -> Self {
        let fiber = chain.id().0;
        Self {
            stack: AtomicPtr::new(Box::into_raw(chain)),
            fiber: AtomicU64::new(fiber),
        }
    }

    /// An empty continuation, to be filled by [`replace`](Self::replace).
    pub const fn empty() -> Self {
        Self {
            stack: AtomicPtr::new(ptr::null_mut()),
            fiber: AtomicU64::new(NO_FIBER),
        }
    }

    /// Whether the chain has been taken.
    pub fn is_empty(&self) -> bool {
        self.stack.load(Ordering::Acquire).is_null()
    }

    /// Fiber id of the chain most recently stored here.
    pub fn fiber_id(&self) -> Option<FiberId> {
        match self.fiber.load(Ordering::Relaxed) {
            NO_FIBER => None,
            id => Some(FiberId(id)),
        }
    }

    /// Take the chain, or `None` if it was already taken.
    pub fn take_noexc(&self) -> Option<Box<Segment>> {
        let taken = self.stack.swap(ptr::null_mut(), Ordering::AcqRel);
        if taken.is_null() {
            return None;
        }
        // SAFETY: the pointer came from Box::into_raw and this swap removed
        // it from the slot, so no one else holds it.
        Some(unsafe { Box::from_raw(taken) })
    }

    /// Take the chain.
    pub fn take(&self) -> RuntimeResult<Box<Segment>> {
        self.take_noexc().ok_or_else(|| {
            runtime_log!(LogLevel::Debug, LogTarget::Continuation, "continuation already resumed");
            RuntimeError::ContinuationAlreadyResumed
        })
    }

    /// Take the chain and install `handlers` on its outermost segment.
    pub fn take_and_rebind_handlers(&self, handlers: Handlers) -> RuntimeResult<Box<Segment>> {
        let mut chain = self.take()?;
        chain.outermost_mut().set_handlers(handlers);
        Ok(chain)
    }

    /// Store a chain into an empty continuation.
    ///
    /// Aborts the process if the continuation is populated.
    pub fn replace(&self, chain: Box<Segment>) {
        if let Err((violation, chain)) = self.try_replace(chain) {
            std::mem::forget(chain);
            fatal_error(violation);
        }
    }

    pub(crate) fn try_replace(&self, chain: Box<Segment>) -> Result<(), (InvariantViolation, Box<Segment>)> {
        let id = chain.id().0;
        let raw = Box::into_raw(chain);
        match self
            .stack
            .compare_exchange(ptr::null_mut(), raw, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                self.fiber.store(id, Ordering::Relaxed);
                Ok(())
            }
            // SAFETY: raw was not published, so it is still uniquely ours.
            Err(_) => Err((InvariantViolation::ContinuationNotEmpty, unsafe { Box::from_raw(raw) })),
        }
    }
}

impl Drop for Continuation {
    fn drop(&mut self) {
        let raw = std::mem::replace(self.stack.get_mut(), ptr::null_mut());
        if !raw.is_null() {
            // SAFETY: a populated slot owns the chain.
            drop(unsafe { Box::from_raw(raw) });
        }
    }
}

/// Discard a continuation without resuming it, returning its segments to
/// `domain`'s cache. Fails without touching memory if it was already used.
pub fn drop_continuation(domain: &mut Domain, cont: &Continuation) -> RuntimeResult<()> {
    let chain = cont.take()?;
    domain.free_stack(chain);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::value::Value;

    fn domain() -> Domain {
        let config = RuntimeConfig::builder().debug_wipe(false).build().unwrap();
        Domain::with_config(&config)
    }

    fn handlers(n: isize) -> Handlers {
        Handlers::new(Value::from_int(n), Value::from_int(n), Value::from_int(n))
    }

    #[test]
    fn test_take_once() {
        let mut domain = domain();
        let seg = domain.alloc_stack(handlers(1)).unwrap();
        let id = seg.id();
        let cont = Continuation::new(seg);
        assert!(!cont.is_empty());
        assert_eq!(cont.fiber_id(), Some(id));

        let chain = cont.take().unwrap();
        assert_eq!(chain.id(), id);
        assert!(cont.is_empty());
        assert_eq!(cont.take().unwrap_err(), RuntimeError::ContinuationAlreadyResumed);
        assert!(cont.take_noexc().is_none());
        domain.free_stack(chain);
    }

    #[test]
    fn test_racing_takes_hand_out_one_chain() {
        use std::sync::atomic::AtomicUsize;
        use std::sync::{Arc, Barrier};

        let conts: Arc<Vec<Continuation>> = {
            let mut domain = domain();
            Arc::new((0..64).map(|i| Continuation::new(domain.alloc_stack(handlers(i)).unwrap())).collect())
        };
        let won = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(2));
        let racers: Vec<_> = (0..2)
            .map(|_| {
                let (conts, won, barrier) = (Arc::clone(&conts), Arc::clone(&won), Arc::clone(&barrier));
                std::thread::spawn(move || {
                    barrier.wait();
                    for cont in conts.iter() {
                        if cont.take_noexc().is_some() {
                            won.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                })
            })
            .collect();
        for racer in racers {
            racer.join().unwrap();
        }
        assert_eq!(won.load(Ordering::Relaxed), 64);
    }

    #[test]
    fn test_rebind_targets_outermost_segment() {
        let mut domain = domain();
        let outer = domain.alloc_stack(handlers(1)).unwrap();
        let mut inner = domain.alloc_stack(handlers(2)).unwrap();
        inner.set_parent(Some(outer));
        let cont = Continuation::new(inner);

        let chain = cont.take_and_rebind_handlers(handlers(9)).unwrap();
        assert_eq!(chain.handlers(), handlers(2));
        assert_eq!(chain.parent().unwrap().handlers(), handlers(9));
        domain.free_stack(chain);
    }

    #[test]
    fn test_replace_refills_empty_continuation() {
        let mut domain = domain();
        let cont = Continuation::empty();
        assert!(cont.is_empty());
        assert_eq!(cont.fiber_id(), None);

        let seg = domain.alloc_stack(handlers(1)).unwrap();
        let id = seg.id();
        cont.replace(seg);
        assert!(!cont.is_empty());
        assert_eq!(cont.fiber_id(), Some(id));
    }

    #[test]
    fn test_replace_on_populated_is_a_violation() {
        let mut domain = domain();
        let cont = Continuation::new(domain.alloc_stack(handlers(1)).unwrap());
        let other = domain.alloc_stack(handlers(2)).unwrap();
        let other_id = other.id();
        match cont.try_replace(other) {
            Err((InvariantViolation::ContinuationNotEmpty, returned)) => assert_eq!(returned.id(), other_id),
            other => panic!("unexpected result: {:?}", other.map_err(|(v, _)| v)),
        }
    }

    #[test]
    fn test_drop_continuation_recycles_every_segment() {
        let mut domain = domain();
        let outer = domain.alloc_stack(handlers(1)).unwrap();
        let mut inner = domain.alloc_stack(handlers(2)).unwrap();
        inner.set_parent(Some(outer));
        let cont = Continuation::new(inner);

        drop_continuation(&mut domain, &cont).unwrap();
        assert!(cont.is_empty());
        assert_eq!(domain.cache().total_cached(), 2);

        let cached_before = domain.cache().stats();
        assert_eq!(
            drop_continuation(&mut domain, &cont),
            Err(RuntimeError::ContinuationAlreadyResumed)
        );
        assert_eq!(domain.cache().stats(), cached_before);
    }

    #[test]
    fn test_dropping_populated_continuation_releases_chain() {
        let mut domain = domain();
        let cont = Continuation::new(domain.alloc_stack(handlers(1)).unwrap());
        drop(cont);
        assert_eq!(domain.cache().total_cached(), 0);
    }
}
