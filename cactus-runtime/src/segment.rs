//! # Stack Segments
//!
//! A segment is one contiguous stack: a body of words growing downward from
//! a 16-byte aligned handler block, with an optional guard page below.
//!
//! ```text
//!  low                                                         high
//!  ┌───────┬──────────────────────┬──────────────────┬─────┬─────────┐
//!  │ guard │      free words      │    live words    │ pad │ handler │
//!  └───────┴──────────────────────┴──────────────────┴─────┴─────────┘
//!          ^ base                 ^ sp               ^ high = handler block
//! ```
//!
//! ## Design
//!
//! `base <= sp <= high` holds at all times; `high - sp` is the live portion
//! and `sp - base` is free. The handler block records the value, exception
//! and effect handlers installed when the fiber was created, plus the
//! address of the parent segment's handler block for diagnostics. Segments
//! of a chain are linked through `parent`, which owns the next segment
//! outward. Dropping a segment releases its whole parent chain without
//! recursion.

use std::fmt;
use std::io;
use std::ops::Range;
use std::ptr::{self, NonNull};

use crate::domain::DomainId;
use crate::error::InvariantViolation;
use crate::fiber::FiberId;
use crate::platform::{AllocPolicy, RawBlock, BLOCK_ALIGN};
use crate::value::{Value, WORD_SIZE};

/// Free words the interpreter may use between two stack checks.
pub const STACK_THRESHOLD_WORDS: usize = 32;

/// Number of pooled segment size classes.
pub const NUM_STACK_SIZE_CLASSES: usize = 5;

/// Tag stored in every live segment.
pub const SEGMENT_MAGIC: u32 = 42;

/// Byte written over freed segment bodies when wiping is enabled.
pub const WIPE_BYTE: u8 = 0x42;

// ============================================================================
// Pool Classes
// ============================================================================

/// Size class of a pooled segment: class `k` holds `base << k` words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolClass(u8);

impl PoolClass {
    /// Class for an exact word size, or `None` when the size is not pooled.
    pub fn for_wsize(wsize: usize, base_wsize: usize) -> Option<Self> {
        let mut class_size = base_wsize;
        for k in 0..NUM_STACK_SIZE_CLASSES {
            if wsize == class_size {
                return Some(PoolClass(k as u8));
            }
            class_size = class_size.checked_mul(2)?;
        }
        None
    }

    /// Class by index.
    pub fn from_index(index: usize) -> Option<Self> {
        (index < NUM_STACK_SIZE_CLASSES).then_some(PoolClass(index as u8))
    }

    /// Index into per-class tables.
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Body words of segments in this class.
    pub fn wsize(self, base_wsize: usize) -> usize {
        base_wsize << self.0
    }
}

// ============================================================================
// Handler Block
// ============================================================================

/// The three handlers of a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handlers {
    /// Called with the fiber's result.
    pub value: Value,
    /// Called with an escaping exception.
    pub exn: Value,
    /// Called with a performed effect.
    pub effect: Value,
}

impl Handlers {
    /// Unit handlers, as installed on main segments.
    pub const UNIT: Handlers = Handlers {
        value: Value::UNIT,
        exn: Value::UNIT,
        effect: Value::UNIT,
    };

    /// Bundle three handlers.
    pub fn new(value: Value, exn: Value, effect: Value) -> Self {
        Self { value, exn, effect }
    }
}

/// In-memory layout of the block at the top of every segment.
#[repr(C, align(16))]
#[derive(Debug)]
pub struct HandlerBlock {
    /// Value handler.
    pub handle_value: Value,
    /// Exception handler.
    pub handle_exn: Value,
    /// Effect handler.
    pub handle_effect: Value,
    /// Address of the parent segment's handler block, or 0.
    pub parent: usize,
}

// ============================================================================
// Segment
// ============================================================================

/// One stack segment.
pub struct Segment {
    memory: RawBlock,
    base: usize,
    high: usize,
    sp: usize,
    pool_class: Option<PoolClass>,
    id: FiberId,
    owner: DomainId,
    parent: Option<Box<Segment>>,
    exception_ptr: usize,
    magic: u32,
}

// SAFETY: a segment exclusively owns its memory and its parent chain.
unsafe impl Send for Segment {}

impl Segment {
    /// Allocate a segment with `wsize` body words and install `handlers`.
    pub fn allocate(
        policy: AllocPolicy,
        wsize: usize,
        pool_class: Option<PoolClass>,
        owner: DomainId,
        handlers: Handlers,
        id: FiberId,
    ) -> io::Result<Self> {
        let body_bytes = wsize
            .checked_mul(WORD_SIZE)
            .ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))?;
        let total = body_bytes + WORD_SIZE + std::mem::size_of::<HandlerBlock>();
        let memory = RawBlock::allocate(policy, total)?;
        let base = memory.usable_start() as usize;
        let high = (base + body_bytes + WORD_SIZE) & !(BLOCK_ALIGN - 1);
        let mut segment = Self {
            memory,
            base,
            high,
            sp: high,
            pool_class,
            id,
            owner,
            parent: None,
            exception_ptr: 0,
            magic: SEGMENT_MAGIC,
        };
        segment.reinit(handlers, id);
        Ok(segment)
    }

    /// Reset a segment for a new fiber: empty body, fresh handlers, no parent.
    pub fn reinit(&mut self, handlers: Handlers, id: FiberId) {
        self.parent = None;
        self.sp = self.high;
        self.exception_ptr = 0;
        self.id = id;
        self.magic = SEGMENT_MAGIC;
        let block = self.handler_block_ptr();
        // SAFETY: the handler block lies inside this segment's memory.
        unsafe {
            block.write(HandlerBlock {
                handle_value: handlers.value,
                handle_exn: handlers.exn,
                handle_effect: handlers.effect,
                parent: 0,
            });
        }
    }

    // ------------------------------------------------------------------------
    // Identity
    // ------------------------------------------------------------------------

    /// Fiber id.
    pub fn id(&self) -> FiberId {
        self.id
    }

    /// Domain that allocated this segment.
    pub fn owner(&self) -> DomainId {
        self.owner
    }

    /// Pool class, or `None` for unpooled sizes.
    pub fn pool_class(&self) -> Option<PoolClass> {
        self.pool_class
    }

    /// Memory policy of the backing block.
    pub fn policy(&self) -> AllocPolicy {
        self.memory.policy()
    }

    /// Check the magic tag.
    pub fn check_magic(&self) -> Result<(), InvariantViolation> {
        if self.magic == SEGMENT_MAGIC {
            Ok(())
        } else {
            Err(InvariantViolation::BadSegmentMagic { found: self.magic })
        }
    }

    #[cfg(test)]
    pub(crate) fn corrupt_magic(&mut self) {
        self.magic = 0;
    }

    // ------------------------------------------------------------------------
    // Geometry
    // ------------------------------------------------------------------------

    /// Lowest body address.
    pub fn base(&self) -> usize {
        self.base
    }

    /// Address of the handler block; one past the highest body word.
    pub fn high(&self) -> usize {
        self.high
    }

    /// Current stack pointer.
    pub fn sp(&self) -> usize {
        self.sp
    }

    /// Move the stack pointer.
    ///
    /// # Panics
    /// If `sp` is outside `base..=high` or not word aligned.
    pub fn set_sp(&mut self, sp: usize) {
        assert!(
            self.base <= sp && sp <= self.high && sp % WORD_SIZE == 0,
            "stack pointer {:#x} outside segment {:#x}..={:#x}",
            sp,
            self.base,
            self.high
        );
        self.sp = sp;
    }

    /// Body size in words.
    pub fn body_wsize(&self) -> usize {
        (self.high - self.base) / WORD_SIZE
    }

    /// Live words (`high - sp`).
    pub fn used_words(&self) -> usize {
        (self.high - self.sp) / WORD_SIZE
    }

    /// Free words (`sp - base`).
    pub fn available_words(&self) -> usize {
        (self.sp - self.base) / WORD_SIZE
    }

    /// Whether `addr` is a body word address.
    pub fn contains(&self, addr: usize) -> bool {
        self.base <= addr && addr < self.high
    }

    /// Address `words` below the top.
    pub fn from_top(&self, words: usize) -> usize {
        self.high - words * WORD_SIZE
    }

    /// Guard page range, if the policy installed one.
    pub fn guard_page(&self) -> Option<Range<usize>> {
        self.memory.guard_range()
    }

    /// Whether a faulting address hit this segment's guard page.
    pub fn is_guard_fault(&self, addr: usize) -> bool {
        self.guard_page().is_some_and(|g| g.contains(&addr))
    }

    /// Bytes reserved for this segment, guard included.
    pub fn reserved_bytes(&self) -> usize {
        self.memory.reserved_len()
    }

    // ------------------------------------------------------------------------
    // Words
    // ------------------------------------------------------------------------

    fn check_word(&self, addr: usize) {
        assert!(
            self.contains(addr) && addr % WORD_SIZE == 0,
            "word address {:#x} outside segment {:#x}..{:#x}",
            addr,
            self.base,
            self.high
        );
    }

    /// Read the word at `addr`.
    pub fn read(&self, addr: usize) -> Value {
        self.check_word(addr);
        // SAFETY: bounds and alignment checked above.
        unsafe { *(addr as *const Value) }
    }

    /// Write the word at `addr`.
    pub fn write(&mut self, addr: usize, value: Value) {
        self.check_word(addr);
        // SAFETY: bounds and alignment checked above.
        unsafe { *(addr as *mut Value) = value }
    }

    /// Push a word. Fails when the body is full.
    pub fn push(&mut self, value: Value) -> Result<(), crate::error::RuntimeError> {
        if self.sp - self.base < WORD_SIZE {
            return Err(crate::error::RuntimeError::StackOverflow {
                requested_words: 1,
                max_words: self.body_wsize(),
            });
        }
        self.sp -= WORD_SIZE;
        // SAFETY: sp is inside the body after the check.
        unsafe { *(self.sp as *mut Value) = value };
        Ok(())
    }

    /// Pop a word, or `None` if the segment is empty.
    pub fn pop(&mut self) -> Option<Value> {
        if self.sp == self.high {
            return None;
        }
        // SAFETY: sp < high, so sp addresses a live word.
        let value = unsafe { *(self.sp as *const Value) };
        self.sp += WORD_SIZE;
        Some(value)
    }

    /// The `n`-th live word from the stack pointer.
    pub fn peek(&self, n: usize) -> Option<Value> {
        let addr = self.sp.checked_add(n.checked_mul(WORD_SIZE)?)?;
        (addr < self.high).then(|| self.read(addr))
    }

    /// Live words, lowest address first.
    pub fn live_words(&self) -> &[Value] {
        // SAFETY: [sp, high) is initialized body memory owned by self.
        unsafe { std::slice::from_raw_parts(self.sp as *const Value, self.used_words()) }
    }

    /// Mutable live words, lowest address first.
    pub fn live_words_mut(&mut self) -> &mut [Value] {
        // SAFETY: as in live_words, with exclusive access through &mut self.
        unsafe { std::slice::from_raw_parts_mut(self.sp as *mut Value, self.used_words()) }
    }

    /// Copy `words` onto the top of an empty segment.
    pub(crate) fn load_live(&mut self, words: &[Value]) {
        let bytes = words.len() * WORD_SIZE;
        assert!(bytes <= self.high - self.base, "live words exceed segment body");
        self.sp = self.high - bytes;
        // SAFETY: destination range checked above; source is a distinct segment.
        unsafe { ptr::copy_nonoverlapping(words.as_ptr(), self.sp as *mut Value, words.len()) };
    }

    /// Saved stack pointer and return address of the innermost native frame.
    ///
    /// With `frame_pointers`, the saved frame pointer on top is skipped first.
    pub fn sp_pc(&self, frame_pointers: bool) -> Option<(usize, usize)> {
        let depth = usize::from(frame_pointers);
        let retaddr = self.peek(depth)?;
        Some((self.sp + (depth + 1) * WORD_SIZE, retaddr.raw()))
    }

    /// Overwrite the whole body with [`WIPE_BYTE`].
    pub fn wipe(&mut self) {
        // SAFETY: [base, high) is the body owned by self.
        unsafe { ptr::write_bytes(self.base as *mut u8, WIPE_BYTE, self.high - self.base) };
    }

    /// Exception handler pointer saved when this segment stopped running.
    pub fn saved_exn_handler(&self) -> usize {
        self.exception_ptr
    }

    /// Save the exception handler pointer of a segment being switched away from.
    pub fn save_exn_handler(&mut self, addr: usize) {
        self.exception_ptr = addr;
    }

    // ------------------------------------------------------------------------
    // Handlers
    // ------------------------------------------------------------------------

    fn handler_block_ptr(&self) -> *mut HandlerBlock {
        self.high as *mut HandlerBlock
    }

    /// Installed handlers.
    pub fn handlers(&self) -> Handlers {
        // SAFETY: the handler block is initialized by reinit.
        let block = unsafe { &*self.handler_block_ptr() };
        Handlers::new(block.handle_value, block.handle_exn, block.handle_effect)
    }

    /// Replace the handlers.
    pub fn set_handlers(&mut self, handlers: Handlers) {
        // SAFETY: the handler block is inside this segment, accessed through &mut self.
        let block = unsafe { &mut *self.handler_block_ptr() };
        block.handle_value = handlers.value;
        block.handle_exn = handlers.exn;
        block.handle_effect = handlers.effect;
    }

    /// Pointers to the three handler slots, for root scanning.
    pub(crate) fn handler_slots(&mut self) -> [NonNull<Value>; 3] {
        let block = self.handler_block_ptr();
        // SAFETY: block is non-null and points into this segment.
        unsafe {
            [
                NonNull::new_unchecked(ptr::addr_of_mut!((*block).handle_value)),
                NonNull::new_unchecked(ptr::addr_of_mut!((*block).handle_exn)),
                NonNull::new_unchecked(ptr::addr_of_mut!((*block).handle_effect)),
            ]
        }
    }

    /// Handler block address recorded for the parent, or 0.
    pub fn handler_parent(&self) -> usize {
        // SAFETY: the handler block is initialized by reinit.
        unsafe { (*self.handler_block_ptr()).parent }
    }

    // ------------------------------------------------------------------------
    // Chain
    // ------------------------------------------------------------------------

    /// The next segment outward.
    pub fn parent(&self) -> Option<&Segment> {
        self.parent.as_deref()
    }

    /// The next segment outward, mutably.
    pub fn parent_mut(&mut self) -> Option<&mut Segment> {
        self.parent.as_deref_mut()
    }

    /// Link a parent, replacing (and returning) any previous one.
    pub fn set_parent(&mut self, parent: Option<Box<Segment>>) -> Option<Box<Segment>> {
        let link = parent.as_ref().map_or(0, |p| p.high);
        // SAFETY: the handler block is inside this segment.
        unsafe { (*self.handler_block_ptr()).parent = link };
        std::mem::replace(&mut self.parent, parent)
    }

    /// Unlink the parent.
    pub fn take_parent(&mut self) -> Option<Box<Segment>> {
        self.set_parent(None)
    }

    /// Number of segments in the chain starting here.
    pub fn chain_len(&self) -> usize {
        let mut len = 1;
        let mut cursor = self.parent();
        while let Some(seg) = cursor {
            len += 1;
            cursor = seg.parent();
        }
        len
    }

    /// Detach everything after the first `depth` segments of the chain.
    pub fn split_after(&mut self, depth: usize) -> Option<Box<Segment>> {
        if depth == 0 {
            return None;
        }
        let mut cursor = self;
        for _ in 1..depth {
            cursor = match cursor.parent.as_deref_mut() {
                Some(next) => next,
                None => return None,
            };
        }
        cursor.take_parent()
    }

    /// The last segment of the chain.
    pub fn outermost_mut(&mut self) -> &mut Segment {
        let mut cursor = self;
        loop {
            match cursor.parent {
                Some(ref mut next) => cursor = &mut **next,
                None => return cursor,
            }
        }
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        let mut next = self.parent.take();
        while let Some(mut seg) = next {
            next = seg.parent.take();
        }
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("id", &self.id)
            .field("base", &format_args!("{:#x}", self.base))
            .field("high", &format_args!("{:#x}", self.high))
            .field("used_words", &self.used_words())
            .field("pool_class", &self.pool_class)
            .field("owner", &self.owner)
            .field("has_parent", &self.parent.is_some())
            .finish()
    }
}
