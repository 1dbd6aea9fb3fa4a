//! # Execution Domains
//!
//! A domain is one OS thread's worth of runtime state: its segment cache,
//! the chain of segments it is currently running, and the registers the
//! compiled code keeps pointing into that chain.
//!
//! ## Design
//!
//! The current chain is owned through `current`; its head is the running
//! segment and each `parent` link leads outward to the main segment.
//! Switching fibers saves the exception handler pointer into the segment
//! being left and restores the one of the segment being entered, so the
//! domain's `exn_handler` always points into the running segment.
//!
//! Native calls out of the runtime leave a [`CStackLink`] behind. Stack
//! growth retargets links that refer to the segment being replaced.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::cache::{Disposition, SegmentCache};
use crate::config::{RuntimeConfig, ScanMode};
use crate::continuation::Continuation;
use crate::error::{fatal_error, InvariantViolation, RuntimeError, RuntimeResult};
use crate::fiber::{next_fiber_id, FiberId};
use crate::log::{LogBuilder, LogLevel, LogTarget};
use crate::platform::AllocPolicy;
use crate::runtime_log;
use crate::segment::{Handlers, Segment, STACK_THRESHOLD_WORDS};
use crate::value::{Value, WORD_SIZE};

// ============================================================================
// Domain Identity
// ============================================================================

/// Unique identifier for a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DomainId(pub u64);

impl DomainId {
    /// Wrap a raw id.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// The raw id.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Domain({})", self.0)
    }
}

static NEXT_DOMAIN_ID: AtomicU64 = AtomicU64::new(1);

/// A native call's saved view of the segment it left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CStackLink {
    /// `high` of the segment that was running.
    pub stack_high: usize,
    /// Its stack pointer at the call.
    pub sp: usize,
    /// Async exception handler at the call.
    pub async_exn_handler: usize,
}

// ============================================================================
// Domain
// ============================================================================

/// Per-domain runtime state.
pub struct Domain {
    pub(crate) id: DomainId,
    pub(crate) cache: SegmentCache,
    pub(crate) current: Option<Box<Segment>>,
    pub(crate) exn_handler: usize,
    pub(crate) async_exn_handler: usize,
    pub(crate) frame_pointer: usize,
    pub(crate) frame_pointers: bool,
    pub(crate) c_stack: Vec<CStackLink>,
    pub(crate) fiber_wsize: usize,
    pub(crate) init_main_wsize: usize,
    pub(crate) init_thread_wsize: usize,
    pub(crate) max_stack_wsize: usize,
    pub(crate) policy: AllocPolicy,
    pub(crate) scan_mode: ScanMode,
}

impl Domain {
    /// Create a domain from the installed configuration, or the defaults.
    pub fn new() -> Self {
        match crate::runtime_config() {
            Some(config) => Self::with_config(config),
            None => Self::with_config(&RuntimeConfig::default()),
        }
    }

    /// Create a domain from `config`. No segment is allocated yet.
    pub fn with_config(config: &RuntimeConfig) -> Self {
        let id = DomainId(NEXT_DOMAIN_ID.fetch_add(1, Ordering::Relaxed));
        let policy = config.stack.alloc_policy();
        LogBuilder::new(LogLevel::Debug, LogTarget::Domain)
            .message("domain created")
            .field_int("id", id.0 as i64)
            .field_str("policy", policy.as_str())
            .emit();
        Self {
            id,
            cache: SegmentCache::new(id, config.stack.fiber_wsize, config.debug.wipe),
            current: None,
            exn_handler: 0,
            async_exn_handler: 0,
            frame_pointer: 0,
            frame_pointers: config.debug.frame_pointers,
            c_stack: Vec::new(),
            fiber_wsize: config.stack.fiber_wsize,
            init_main_wsize: config.stack.init_main_wsize,
            init_thread_wsize: config.stack.init_thread_wsize,
            max_stack_wsize: config.stack.max_wsize,
            policy,
            scan_mode: config.scan_mode,
        }
    }

    /// Allocate the main segment and make it current.
    pub fn start_main_stack(&mut self) -> RuntimeResult<()> {
        let wsize = self.init_stack_wsize(None);
        let main = self
            .alloc_main_stack(wsize)
            .ok_or(RuntimeError::OutOfMemory { words: wsize })?;
        self.current = Some(main);
        self.exn_handler = 0;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    /// Domain id.
    pub fn id(&self) -> DomainId {
        self.id
    }

    /// The segment cache.
    pub fn cache(&self) -> &SegmentCache {
        &self.cache
    }

    /// The running segment.
    pub fn current(&self) -> Option<&Segment> {
        self.current.as_deref()
    }

    /// The running segment, mutably.
    pub fn current_mut(&mut self) -> Option<&mut Segment> {
        self.current.as_deref_mut()
    }

    /// Root scanner of this domain.
    pub fn scan_mode(&self) -> ScanMode {
        self.scan_mode
    }

    /// Words of a fresh fiber segment.
    pub fn fiber_wsize(&self) -> usize {
        self.fiber_wsize
    }

    /// Maximum body words of any segment.
    pub fn max_stack_wsize(&self) -> usize {
        self.max_stack_wsize
    }

    /// Head of the exception handler chain.
    pub fn exn_handler(&self) -> usize {
        self.exn_handler
    }

    /// Point the exception handler chain at a trap frame.
    pub fn set_exn_handler(&mut self, addr: usize) {
        self.exn_handler = addr;
    }

    /// Async exception handler.
    pub fn async_exn_handler(&self) -> usize {
        self.async_exn_handler
    }

    /// Set the async exception handler.
    pub fn set_async_exn_handler(&mut self, addr: usize) {
        self.async_exn_handler = addr;
    }

    /// Enable saved base-pointer rewriting on growth.
    pub fn set_frame_pointer_walking(&mut self, enabled: bool) {
        self.frame_pointers = enabled;
    }

    /// Head of the saved base-pointer chain.
    pub fn frame_pointer(&self) -> usize {
        self.frame_pointer
    }

    /// Set the head of the saved base-pointer chain.
    ///
    /// # Safety
    /// `addr` must be 0 or the address of a two-word frame record
    /// `[saved base pointer, return address]` whose chain ends in 0, and every
    /// record outside the running segment must stay writable while the chain
    /// is installed.
    pub unsafe fn set_frame_pointer(&mut self, addr: usize) {
        self.frame_pointer = addr;
    }

    /// Record a native call leaving the running segment.
    pub fn push_c_stack_link(&mut self, link: CStackLink) {
        self.c_stack.push(link);
    }

    /// Forget the most recent native call link.
    pub fn pop_c_stack_link(&mut self) -> Option<CStackLink> {
        self.c_stack.pop()
    }

    /// Native call links, oldest first.
    pub fn c_stack_links(&self) -> &[CStackLink] {
        &self.c_stack
    }

    // ------------------------------------------------------------------------
    // Sizing
    // ------------------------------------------------------------------------

    /// Initial words for a main segment (`None`) or a thread stack.
    pub fn init_stack_wsize(&self, thread_stack_wsize: Option<usize>) -> usize {
        let init = match thread_stack_wsize {
            None => self.init_main_wsize,
            Some(_) if self.init_thread_wsize > 0 => self.init_thread_wsize,
            Some(requested) => requested,
        };
        init.min(self.max_stack_wsize)
    }

    /// Change the maximum segment size, never below live usage plus the
    /// interpreter threshold.
    pub fn change_max_stack_size(&mut self, new_max_wsize: usize) {
        let used = self.current.as_ref().map_or(0, |s| s.used_words());
        let new_max_wsize = new_max_wsize.max(used + STACK_THRESHOLD_WORDS);
        if new_max_wsize != self.max_stack_wsize {
            runtime_log!(
                LogLevel::Info,
                LogTarget::Domain,
                "Changing stack limit to {}k bytes",
                new_max_wsize * WORD_SIZE / 1024
            );
        }
        self.max_stack_wsize = new_max_wsize;
    }

    // ------------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------------

    /// Allocate a segment of `wsize` body words, reusing a cached one when
    /// the size is pooled.
    pub fn alloc_stack_noexc(&mut self, wsize: usize, handlers: Handlers, id: FiberId) -> Option<Box<Segment>> {
        let class = self.cache.class_for(wsize);
        if let Some(mut seg) = class.and_then(|c| self.cache.take(c)) {
            seg.reinit(handlers, id);
            return Some(seg);
        }
        match Segment::allocate(self.policy, wsize, class, self.id, handlers, id) {
            Ok(seg) => {
                LogBuilder::new(LogLevel::Debug, LogTarget::Stack)
                    .message("segment allocated")
                    .field_int("wsize", wsize as i64)
                    .field_int("fiber", id.0 as i64)
                    .field_bool("pooled", class.is_some())
                    .emit();
                Some(Box::new(seg))
            }
            Err(err) => {
                runtime_log!(LogLevel::Debug, LogTarget::Stack, "segment allocation of {} words failed: {}", wsize, err);
                None
            }
        }
    }

    /// Allocate a fiber segment with a fresh id.
    pub fn alloc_stack(&mut self, handlers: Handlers) -> RuntimeResult<Box<Segment>> {
        let wsize = self.fiber_wsize;
        self.alloc_stack_noexc(wsize, handlers, next_fiber_id())
            .ok_or(RuntimeError::OutOfMemory { words: wsize })
    }

    /// Allocate a main segment with unit handlers.
    pub fn alloc_main_stack(&mut self, init_wsize: usize) -> Option<Box<Segment>> {
        self.alloc_stack_noexc(init_wsize, Handlers::UNIT, FiberId::MAIN)
    }

    /// Free a segment and any parents it still owns.
    ///
    /// Aborts the process on a segment with a bad magic number.
    pub fn free_stack(&mut self, seg: Box<Segment>) {
        if let Err((violation, seg)) = self.try_free_stack(seg) {
            std::mem::forget(seg);
            fatal_error(violation);
        }
    }

    pub(crate) fn try_free_stack(&mut self, seg: Box<Segment>) -> Result<(), (InvariantViolation, Box<Segment>)> {
        let mut next = Some(seg);
        while let Some(mut seg) = next {
            if let Err(violation) = seg.check_magic() {
                return Err((violation, seg));
            }
            next = seg.take_parent();
            let id = seg.id();
            match self.cache.give_back(seg) {
                Disposition::Recycled(class) => {
                    runtime_log!(LogLevel::Trace, LogTarget::Cache, "{} segment cached in class {}", id, class.index());
                }
                Disposition::Released => {
                    runtime_log!(LogLevel::Debug, LogTarget::Stack, "{} segment released", id);
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Fiber Switching
    // ------------------------------------------------------------------------

    fn save_current_exn_handler(&mut self) {
        let exn = self.exn_handler;
        if let Some(cur) = self.current.as_mut() {
            cur.save_exn_handler(exn);
        }
    }

    /// Run `seg` on top of the current chain.
    pub fn run_fiber(&mut self, mut seg: Box<Segment>) {
        self.save_current_exn_handler();
        let previous = self.current.take();
        seg.set_parent(previous);
        self.exn_handler = seg.saved_exn_handler();
        self.current = Some(seg);
    }

    /// Finish the running fiber: free its segment and resume its parent.
    ///
    /// Returns the finished fiber's handlers, or `None` when the running
    /// segment has no parent to return to.
    pub fn return_from_fiber(&mut self) -> Option<Handlers> {
        let mut finished = self.current.take()?;
        let parent = match finished.take_parent() {
            Some(parent) => parent,
            None => {
                self.current = Some(finished);
                return None;
            }
        };
        let handlers = finished.handlers();
        self.exn_handler = parent.saved_exn_handler();
        self.current = Some(parent);
        self.free_stack(finished);
        Some(handlers)
    }

    /// Detach the innermost `depth` segments of the running chain as a
    /// continuation and resume the next segment outward.
    ///
    /// Returns `None` unless at least one segment would remain running.
    pub fn capture_continuation(&mut self, depth: usize) -> Option<Continuation> {
        if depth == 0 || self.current.as_ref().map_or(0, |s| s.chain_len()) <= depth {
            return None;
        }
        self.save_current_exn_handler();
        let mut captured = self.current.take()?;
        let rest = captured.split_after(depth);
        self.exn_handler = rest.as_ref().map_or(0, |s| s.saved_exn_handler());
        self.current = rest;
        runtime_log!(LogLevel::Trace, LogTarget::Continuation, "captured {} at depth {}", captured.id(), depth);
        Some(Continuation::new(captured))
    }

    /// Consume `cont`, install `handlers` on its outermost segment and run
    /// it on top of the current chain.
    pub fn resume(&mut self, cont: &Continuation, handlers: Handlers) -> RuntimeResult<()> {
        let mut chain = cont.take_and_rebind_handlers(handlers)?;
        self.save_current_exn_handler();
        let previous = self.current.take();
        chain.outermost_mut().set_parent(previous);
        self.exn_handler = chain.saved_exn_handler();
        self.current = Some(chain);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Interpreter Access
    // ------------------------------------------------------------------------

    /// Push onto the running segment, growing it when full.
    pub fn push(&mut self, value: Value) -> RuntimeResult<()> {
        self.ensure_stack_capacity(1)?;
        match self.current.as_mut() {
            Some(seg) => seg.push(value),
            None => Err(RuntimeError::StackOverflow {
                requested_words: 1,
                max_words: self.max_stack_wsize,
            }),
        }
    }

    /// Pop from the running segment.
    pub fn pop(&mut self) -> Option<Value> {
        self.current.as_mut()?.pop()
    }

    /// The `n`-th live word of the running segment.
    pub fn peek(&self, n: usize) -> Option<Value> {
        self.current.as_ref()?.peek(n)
    }
}

impl Default for Domain {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Domain {
    fn drop(&mut self) {
        self.current = None;
        self.cache.clear();
    }
}

impl fmt::Debug for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Domain")
            .field("id", &self.id)
            .field("current", &self.current)
            .field("exn_handler", &format_args!("{:#x}", self.exn_handler))
            .field("c_stack", &self.c_stack.len())
            .field("max_stack_wsize", &self.max_stack_wsize)
            .field("scan_mode", &self.scan_mode)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RuntimeConfig {
        RuntimeConfig::builder()
            .init_main_wsize(256)
            .max_stack_wsize(4096)
            .debug_wipe(false)
            .build()
            .unwrap()
    }

    fn handlers(n: isize) -> Handlers {
        Handlers::new(Value::from_int(n), Value::from_int(n + 1), Value::from_int(n + 2))
    }

    #[test]
    fn test_main_stack() {
        let mut domain = Domain::with_config(&config());
        domain.start_main_stack().unwrap();
        let main = domain.current().unwrap();
        assert_eq!(main.id(), FiberId::MAIN);
        assert_eq!(main.handlers(), Handlers::UNIT);
        assert!(main.parent().is_none());
        assert_eq!(main.body_wsize(), 256);
    }

    #[test]
    fn test_fiber_segments_are_recycled() {
        let mut domain = Domain::with_config(&config());
        let seg = domain.alloc_stack(handlers(1)).unwrap();
        let base = seg.base();
        let first_id = seg.id();
        assert_eq!(seg.pool_class().map(|c| c.index()), Some(0));
        domain.free_stack(seg);

        let again = domain.alloc_stack(handlers(7)).unwrap();
        assert_eq!(again.base(), base);
        assert_ne!(again.id(), first_id);
        assert_eq!(again.handlers(), handlers(7));
        assert_eq!(again.used_words(), 0);
        assert!(again.parent().is_none());
        assert_eq!(domain.cache().stats().hits, 1);
    }

    #[test]
    fn test_unpooled_size_is_not_cached() {
        let mut domain = Domain::with_config(&config());
        let seg = domain.alloc_stack_noexc(100, Handlers::UNIT, next_fiber_id()).unwrap();
        assert!(seg.pool_class().is_none());
        domain.free_stack(seg);
        assert_eq!(domain.cache().total_cached(), 0);
    }

    #[test]
    fn test_bad_magic_is_reported_without_freeing() {
        let mut domain = Domain::with_config(&config());
        let mut seg = domain.alloc_stack(Handlers::UNIT).unwrap();
        seg.corrupt_magic();
        let result = domain.try_free_stack(seg);
        assert!(matches!(result, Err((InvariantViolation::BadSegmentMagic { found: 0 }, _))));
        assert_eq!(domain.cache().total_cached(), 0);
    }

    #[test]
    fn test_init_stack_wsize() {
        let mut domain = Domain::with_config(&config());
        assert_eq!(domain.init_stack_wsize(None), 256);
        assert_eq!(domain.init_stack_wsize(Some(512)), 512);
        assert_eq!(domain.init_stack_wsize(Some(1 << 20)), 4096);
        domain.init_thread_wsize = 128;
        assert_eq!(domain.init_stack_wsize(Some(512)), 128);
    }

    #[test]
    fn test_change_max_stack_size_respects_usage() {
        let mut domain = Domain::with_config(&config());
        domain.start_main_stack().unwrap();
        for i in 0..100 {
            domain.push(Value::from_int(i)).unwrap();
        }
        let guard = crate::log::capture();
        domain.change_max_stack_size(10);
        assert_eq!(domain.max_stack_wsize(), 100 + STACK_THRESHOLD_WORDS);
        assert!(guard.contains("Changing stack limit to"));

        domain.change_max_stack_size(8192);
        assert_eq!(domain.max_stack_wsize(), 8192);
    }

    #[test]
    fn test_run_and_return_from_fiber() {
        let mut domain = Domain::with_config(&config());
        domain.start_main_stack().unwrap();
        domain.set_exn_handler(0x1234);

        let fiber = domain.alloc_stack(handlers(10)).unwrap();
        let fiber_id = fiber.id();
        domain.run_fiber(fiber);
        assert_eq!(domain.current().unwrap().id(), fiber_id);
        assert_eq!(domain.exn_handler(), 0);
        domain.push(Value::from_int(3)).unwrap();

        let finished = domain.return_from_fiber().unwrap();
        assert_eq!(finished, handlers(10));
        assert_eq!(domain.current().unwrap().id(), FiberId::MAIN);
        assert_eq!(domain.exn_handler(), 0x1234);
        assert_eq!(domain.cache().total_cached(), 1);

        assert!(domain.return_from_fiber().is_none());
        assert!(domain.current().is_some());
    }

    #[test]
    fn test_capture_and_resume() {
        let mut domain = Domain::with_config(&config());
        domain.start_main_stack().unwrap();
        let outer = domain.alloc_stack(handlers(1)).unwrap();
        let inner = domain.alloc_stack(handlers(4)).unwrap();
        let (outer_id, inner_id) = (outer.id(), inner.id());
        domain.run_fiber(outer);
        domain.run_fiber(inner);
        domain.push(Value::from_int(99)).unwrap();

        assert!(domain.capture_continuation(3).is_none());
        let cont = domain.capture_continuation(2).unwrap();
        assert_eq!(domain.current().unwrap().id(), FiberId::MAIN);
        assert!(!cont.is_empty());
        assert_eq!(cont.fiber_id(), Some(inner_id));

        domain.resume(&cont, handlers(20)).unwrap();
        assert!(cont.is_empty());
        assert_eq!(domain.current().unwrap().id(), inner_id);
        assert_eq!(domain.peek(0), Some(Value::from_int(99)));
        let outer_seg = domain.current().unwrap().parent().unwrap();
        assert_eq!(outer_seg.id(), outer_id);
        assert_eq!(outer_seg.handlers(), handlers(20));
        assert_eq!(outer_seg.parent().unwrap().id(), FiberId::MAIN);

        assert_eq!(
            domain.resume(&cont, handlers(20)),
            Err(RuntimeError::ContinuationAlreadyResumed)
        );
    }

    #[test]
    fn test_push_grows_running_segment() {
        let mut domain = Domain::with_config(&config());
        let fiber = domain.alloc_stack(Handlers::UNIT).unwrap();
        domain.run_fiber(fiber);
        for i in 0..200 {
            domain.push(Value::from_int(i)).unwrap();
        }
        let seg = domain.current().unwrap();
        assert!(seg.body_wsize() >= 200);
        assert_eq!(seg.peek(0), Some(Value::from_int(199)));
        assert_eq!(seg.peek(199), Some(Value::from_int(0)));
    }
}
