//! # Root Scanning
//!
//! Reports every live reference held by a segment chain to a collector
//! supplied [`RootVisitor`], exactly once per location.
//!
//! ## Design
//!
//! Two layouts are supported, chosen by [`ScanMode`]:
//!
//! - **Native**: compiled frames are walked with [`FrameDescriptors`]. Each
//!   call site names its live stack slots and register-save slots. A
//!   descriptor that returns to native code ends a chunk of compiled frames;
//!   the chunk header above it holds the register save area of the next
//!   chunk. Live values are classified before the visitor sees them: young
//!   and major-heap blocks are visited, local blocks are marked with the
//!   collector's garbage color and scanned later by the local-allocation
//!   pass, external blocks are skipped.
//! - **Flat**: the live region `[sp, high)` is one array of tagged words.
//!   Words that alias a code fragment are skipped unless only young values
//!   are being scanned.
//!
//! Both modes visit the three handler slots of every segment and then move
//! to the parent segment.
//!
//! ## Local Allocation Pass
//!
//! Marked local blocks are rescanned newest to oldest, starting at the
//! arena's saved offset. A block may only reference blocks allocated before
//! it, so each mark found during the pass lies ahead of the cursor. A field
//! that points behind the cursor is a fatal violation. The pass clears every
//! mark it finds, leaving no state behind between scans. Unreached blocks
//! and free arena space are poisoned when poisoning is enabled.
//!
//! The marking colors are carried by [`ScanContext`], so two scans with
//! different color assignments never share state.
//!
//! ## Technical References
//!
//! - [Retrofitting Effect Handlers onto OCaml](https://dl.acm.org/doi/10.1145/3453483.3454039) (PLDI'21)

use std::ops::Range;
use std::ptr::NonNull;

use crate::domain::Domain;
use crate::error::{fatal_error, InvariantViolation};
use crate::frame::{FrameDescriptors, LiveSlot};
use crate::locals::{LocalArena, LocalArenas};
use crate::log::{LogLevel, LogTarget};
use crate::runtime_log;
use crate::segment::Segment;
use crate::value::{
    start_env_closinfo, Color, HeapColors, Value, CLOSURE_TAG, DEBUG_FREE_LOCAL, LOCAL_UNINIT_HD, NO_SCAN_TAG,
    WORD_SIZE,
};

pub use crate::config::ScanMode;

/// Words between a native boundary return address and the saved register
/// area pointer: trap frame and unwind pointer.
const CHUNK_HEADER_WORDS: usize = 3;

// ============================================================================
// Flags and Slots
// ============================================================================

/// Options of a scan requested by the collector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanFlags(u32);

impl ScanFlags {
    /// No options.
    pub const NONE: ScanFlags = ScanFlags(0);
    /// The visitor ignores everything outside the minor heap.
    pub const ONLY_YOUNG_VALUES: ScanFlags = ScanFlags(1);

    /// Whether every flag of `other` is set.
    pub fn contains(self, other: ScanFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for ScanFlags {
    type Output = ScanFlags;

    fn bitor(self, rhs: ScanFlags) -> ScanFlags {
        ScanFlags(self.0 | rhs.0)
    }
}

/// A location holding a live value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootSlot(NonNull<Value>);

impl RootSlot {
    /// Wrap a location.
    ///
    /// # Safety
    /// `ptr` must be valid for reads and writes for the duration of the scan.
    pub unsafe fn new(ptr: NonNull<Value>) -> Self {
        RootSlot(ptr)
    }

    /// Address of the location.
    pub fn address(&self) -> usize {
        self.0.as_ptr() as usize
    }

    /// Current value.
    pub fn get(&self) -> Value {
        // SAFETY: guaranteed by the constructor.
        unsafe { *self.0.as_ptr() }
    }

    /// Overwrite the value, for moving collectors.
    pub fn set(&self, value: Value) {
        // SAFETY: guaranteed by the constructor.
        unsafe { *self.0.as_ptr() = value }
    }
}

/// The collector's scanning action.
pub trait RootVisitor {
    /// Called once per live location.
    fn visit(&mut self, value: Value, slot: RootSlot);
}

impl<F: FnMut(Value, RootSlot)> RootVisitor for F {
    fn visit(&mut self, value: Value, slot: RootSlot) {
        self(value, slot)
    }
}

// ============================================================================
// Collector Seams
// ============================================================================

/// Generational classification of heap blocks.
pub trait HeapInfo {
    /// Whether `value` lives in the minor heap.
    fn is_young(&self, value: Value) -> bool;
}

/// A heap with no minor generation.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoYoungGeneration;

impl HeapInfo for NoYoungGeneration {
    fn is_young(&self, _value: Value) -> bool {
        false
    }
}

/// A minor heap occupying one address range.
impl HeapInfo for Range<usize> {
    fn is_young(&self, value: Value) -> bool {
        value.is_block() && self.contains(&value.addr())
    }
}

/// Known code regions.
pub trait CodeFragments {
    /// Whether `addr` lies in a registered code fragment.
    fn contains_pc(&self, addr: usize) -> bool;
}

/// No code is registered.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCode;

impl CodeFragments for NoCode {
    fn contains_pc(&self, _addr: usize) -> bool {
        false
    }
}

impl CodeFragments for [Range<usize>] {
    fn contains_pc(&self, addr: usize) -> bool {
        self.iter().any(|r| r.contains(&addr))
    }
}

impl CodeFragments for Vec<Range<usize>> {
    fn contains_pc(&self, addr: usize) -> bool {
        self.as_slice().contains_pc(addr)
    }
}

/// No frame descriptors are registered.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoFrames;

impl FrameDescriptors for NoFrames {
    fn find(&self, _return_address: usize) -> Option<&crate::frame::FrameDescriptor> {
        None
    }
}

// ============================================================================
// Scan Context
// ============================================================================

/// Everything a scan reads besides the chain itself.
#[derive(Clone, Copy)]
pub struct ScanContext<'a> {
    mode: ScanMode,
    colors: HeapColors,
    frames: &'a dyn FrameDescriptors,
    heap: &'a dyn HeapInfo,
    code: &'a dyn CodeFragments,
    frame_pointers: bool,
    poison: bool,
}

impl<'a> ScanContext<'a> {
    /// A native-mode context using `frames`.
    pub fn native(frames: &'a dyn FrameDescriptors) -> Self {
        Self {
            mode: ScanMode::Native,
            colors: HeapColors::default(),
            frames,
            heap: &NoYoungGeneration,
            code: &NoCode,
            frame_pointers: false,
            poison: cfg!(debug_assertions),
        }
    }

    /// A flat-mode context filtering out addresses in `code`.
    pub fn flat(code: &'a dyn CodeFragments) -> Self {
        Self {
            mode: ScanMode::Flat,
            code,
            ..Self::native(&NoFrames)
        }
    }

    /// A context in `domain`'s scan mode.
    pub fn for_domain(domain: &Domain, frames: &'a dyn FrameDescriptors, code: &'a dyn CodeFragments) -> Self {
        Self {
            mode: domain.scan_mode(),
            frame_pointers: domain.frame_pointers,
            code,
            ..Self::native(frames)
        }
    }

    /// Use the collector's current color assignment.
    pub fn with_colors(mut self, colors: HeapColors) -> Self {
        self.colors = colors;
        self
    }

    /// Classify young values with `heap`.
    pub fn with_heap(mut self, heap: &'a dyn HeapInfo) -> Self {
        self.heap = heap;
        self
    }

    /// Skip a saved frame pointer at the top of every native chunk.
    pub fn with_frame_pointers(mut self, enabled: bool) -> Self {
        self.frame_pointers = enabled;
        self
    }

    /// Poison unreached local memory.
    pub fn with_poison(mut self, enabled: bool) -> Self {
        self.poison = enabled;
        self
    }

    /// Scan mode.
    pub fn mode(&self) -> ScanMode {
        self.mode
    }

    /// Color assignment.
    pub fn colors(&self) -> HeapColors {
        self.colors
    }
}

impl std::fmt::Debug for ScanContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanContext")
            .field("mode", &self.mode)
            .field("colors", &self.colors)
            .field("frame_pointers", &self.frame_pointers)
            .field("poison", &self.poison)
            .finish()
    }
}

// ============================================================================
// Entry Points
// ============================================================================

/// Scan a segment chain, then run the local-allocation pass.
///
/// Local arenas only exist under native code; a flat scan given any is a
/// violation.
///
/// `gc_regs` is the register save area of the innermost native chunk.
/// Aborts the process on corrupted stacks or local arenas.
pub fn scan_roots<V: RootVisitor + ?Sized>(
    ctx: &ScanContext<'_>,
    visitor: &mut V,
    flags: ScanFlags,
    chain: &mut Segment,
    gc_regs: Option<NonNull<Value>>,
    locals: Option<&LocalArenas>,
) {
    let mut scanner = Scanner::new(ctx, visitor, flags, locals);
    let result = scanner
        .scan_chain(chain, gc_regs)
        .and_then(|()| scanner.scan_local_allocations());
    if let Err(violation) = result {
        fatal_error(violation);
    }
}

/// Scan registered local root tables, then the chain, then the local
/// allocations.
///
/// Zero entries in `local_roots` are unused and skipped.
pub fn do_local_roots<V: RootVisitor + ?Sized>(
    ctx: &ScanContext<'_>,
    visitor: &mut V,
    flags: ScanFlags,
    local_roots: &mut [&mut [Value]],
    chain: &mut Segment,
    gc_regs: Option<NonNull<Value>>,
    locals: Option<&LocalArenas>,
) {
    if let Err(violation) = try_do_local_roots(ctx, visitor, flags, local_roots, chain, gc_regs, locals) {
        fatal_error(violation);
    }
}

pub(crate) fn try_do_local_roots<V: RootVisitor + ?Sized>(
    ctx: &ScanContext<'_>,
    visitor: &mut V,
    flags: ScanFlags,
    local_roots: &mut [&mut [Value]],
    chain: &mut Segment,
    gc_regs: Option<NonNull<Value>>,
    locals: Option<&LocalArenas>,
) -> Result<(), InvariantViolation> {
    let mut scanner = Scanner::new(ctx, visitor, flags, locals);
    for table in local_roots.iter_mut() {
        for entry in table.iter_mut() {
            if *entry == Value::NULL {
                continue;
            }
            let slot = RootSlot(NonNull::from(entry));
            match ctx.mode {
                ScanMode::Native => {
                    // SAFETY: the slot is a live element of a borrowed table.
                    unsafe { scanner.visit(slot) };
                }
                ScanMode::Flat => scanner.visitor.visit(slot.get(), slot),
            }
        }
    }
    scanner.scan_chain(chain, gc_regs)?;
    scanner.scan_local_allocations()
}

impl Domain {
    /// Scan the domain's current chain.
    pub fn scan_roots<V: RootVisitor + ?Sized>(
        &mut self,
        ctx: &ScanContext<'_>,
        visitor: &mut V,
        flags: ScanFlags,
        gc_regs: Option<NonNull<Value>>,
        locals: Option<&LocalArenas>,
    ) {
        if let Some(chain) = self.current_mut() {
            scan_roots(ctx, visitor, flags, chain, gc_regs, locals);
        }
    }
}

// ============================================================================
// Scanner
// ============================================================================

struct Scanner<'s, 'a, V: ?Sized> {
    ctx: &'s ScanContext<'a>,
    visitor: &'s mut V,
    flags: ScanFlags,
    locals: Option<&'s LocalArenas>,
}

/// Read a word of stack or arena memory.
///
/// # Safety
/// `addr` must be a readable, aligned word.
unsafe fn read_word(addr: usize) -> usize {
    *(addr as *const usize)
}

impl<'s, 'a, V: RootVisitor + ?Sized> Scanner<'s, 'a, V> {
    fn new(
        ctx: &'s ScanContext<'a>,
        visitor: &'s mut V,
        flags: ScanFlags,
        locals: Option<&'s LocalArenas>,
    ) -> Self {
        Self {
            ctx,
            visitor,
            flags,
            locals: locals.filter(|l| !l.is_empty()),
        }
    }

    fn scan_chain(&mut self, chain: &mut Segment, gc_regs: Option<NonNull<Value>>) -> Result<(), InvariantViolation> {
        let mut cursor = Some(chain);
        let mut segments = 0usize;
        while let Some(seg) = cursor {
            match self.ctx.mode {
                ScanMode::Native => {
                    self.scan_frames(seg, gc_regs)?;
                    for slot in seg.handler_slots() {
                        let slot = RootSlot(slot);
                        self.visitor.visit(slot.get(), slot);
                    }
                }
                ScanMode::Flat => {
                    for word in seg.live_words_mut() {
                        self.visit_if_scannable(RootSlot(NonNull::from(word)));
                    }
                    for slot in seg.handler_slots() {
                        self.visit_if_scannable(RootSlot(slot));
                    }
                }
            }
            segments += 1;
            cursor = seg.parent_mut();
        }
        runtime_log!(LogLevel::Trace, LogTarget::Scan, "scanned {} segments", segments);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Flat mode
    // ------------------------------------------------------------------------

    fn is_scannable(&self, value: Value) -> bool {
        self.flags.contains(ScanFlags::ONLY_YOUNG_VALUES)
            || (value.is_block() && !self.ctx.code.contains_pc(value.addr()))
    }

    fn visit_if_scannable(&mut self, slot: RootSlot) {
        let value = slot.get();
        if self.is_scannable(value) {
            self.visitor.visit(value, slot);
        }
    }

    // ------------------------------------------------------------------------
    // Native mode
    // ------------------------------------------------------------------------

    fn scan_frames(&mut self, seg: &Segment, gc_regs: Option<NonNull<Value>>) -> Result<(), InvariantViolation> {
        let high = seg.high();
        let mut sp = seg.sp();
        let mut regs = gc_regs;

        'chunks: loop {
            if self.ctx.frame_pointers && sp < high {
                sp += WORD_SIZE;
            }
            if sp == high {
                return Ok(());
            }
            if sp > high {
                return Err(InvariantViolation::FrameOutOfBounds { sp });
            }
            // SAFETY: seg.sp() <= sp < high, inside the segment body.
            let mut retaddr = unsafe { read_word(sp) };
            sp += WORD_SIZE;

            loop {
                let descriptor = self
                    .ctx
                    .frames
                    .find(retaddr)
                    .ok_or(InvariantViolation::MissingFrameDescriptor { return_address: retaddr })?;

                if descriptor.returns_to_native {
                    sp += CHUNK_HEADER_WORDS * WORD_SIZE;
                    if sp >= high {
                        return Err(InvariantViolation::FrameOutOfBounds { sp });
                    }
                    // SAFETY: sp < high, inside the segment body.
                    regs = NonNull::new(unsafe { read_word(sp) } as *mut Value);
                    sp += WORD_SIZE;
                    continue 'chunks;
                }

                for live in descriptor.live_slots() {
                    let location = match live {
                        LiveSlot::Register(index) => {
                            let area = regs.ok_or(InvariantViolation::MissingRegisterArea)?;
                            // SAFETY: the register save area holds every slot
                            // the descriptor names.
                            unsafe { NonNull::new_unchecked(area.as_ptr().add(index)) }
                        }
                        LiveSlot::Stack(offset) => {
                            let addr = sp + offset;
                            if addr >= high {
                                return Err(InvariantViolation::FrameOutOfBounds { sp: addr });
                            }
                            // SAFETY: addr lies in [sp, high).
                            unsafe { NonNull::new_unchecked(addr as *mut Value) }
                        }
                    };
                    // SAFETY: location was validated above.
                    unsafe { self.visit(RootSlot(location)) };
                }

                if descriptor.frame_size == 0 {
                    return Err(InvariantViolation::FrameOutOfBounds { sp });
                }
                sp += descriptor.frame_size;
                if sp > high {
                    return Err(InvariantViolation::FrameOutOfBounds { sp });
                }
                // SAFETY: the word below sp lies in the segment body.
                retaddr = unsafe { read_word(sp - WORD_SIZE) };
            }
        }
    }

    /// Classify and possibly visit the value at `slot`.
    ///
    /// Returns the arena index of a local block this call marked.
    ///
    /// # Safety
    /// Every block reachable from `slot` must have a readable header.
    unsafe fn visit(&mut self, slot: RootSlot) -> Option<usize> {
        let value = slot.get();
        if !value.is_block() {
            return None;
        }
        if self.ctx.heap.is_young(value) {
            self.visitor.visit(value, slot);
            return None;
        }

        let block = value.enclosing_block();
        let hd = block.header();
        let color = hd.color();
        if color == self.ctx.colors.garbage {
            None
        } else if color == Color::NOT_MARKABLE {
            let locals = self.locals?;
            let index = locals.arena_index_of(block.addr())?;
            block.set_header(hd.with_color(self.ctx.colors.garbage));
            Some(index)
        } else {
            self.visitor.visit(value, slot);
            None
        }
    }

    // ------------------------------------------------------------------------
    // Local allocation pass
    // ------------------------------------------------------------------------

    fn poison_free(&self, arena: LocalArena, sp: isize) {
        if !self.ctx.poison {
            return;
        }
        let mut addr = arena.base;
        while addr < arena.at(sp) {
            // SAFETY: [base, end + sp) is the free part of the arena.
            unsafe { *(addr as *mut usize) = DEBUG_FREE_LOCAL };
            addr += WORD_SIZE;
        }
    }

    fn scan_local_allocations(&mut self) -> Result<(), InvariantViolation> {
        let locals = match self.locals {
            Some(locals) if !locals.is_empty() => locals,
            _ => return Ok(()),
        };
        if self.ctx.mode == ScanMode::Flat {
            return Err(InvariantViolation::LocalsInFlatMode);
        }
        let arenas = locals.arenas();
        let mut sp = locals.saved_sp();
        let mut arena_ix = arenas.len() - 1;
        let mut arena = arenas[arena_ix];
        self.poison_free(arena, sp);

        while sp < 0 {
            if (arena.length as isize) + sp < 0 {
                return Err(InvariantViolation::CorruptLocalArena { sp });
            }
            let hp = arena.at(sp);
            let block = Value::from_addr(hp + WORD_SIZE);
            // SAFETY: hp lies in [base, end) of the current arena.
            let hd = unsafe { block.header() };

            if hd == LOCAL_UNINIT_HD {
                if arena_ix == 0 {
                    return Err(InvariantViolation::CorruptLocalArena { sp });
                }
                arena_ix -= 1;
                arena = arenas[arena_ix];
                self.poison_free(arena, sp);
                continue;
            }

            if hd.color() == Color::NOT_MARKABLE {
                if self.ctx.poison {
                    for i in 0..hd.wosize() {
                        // SAFETY: the block's fields follow its header in the arena.
                        unsafe { *block.field_ptr(i) = Value(DEBUG_FREE_LOCAL) };
                    }
                }
                sp += hd.bhsize() as isize;
                continue;
            }
            if hd.color() != self.ctx.colors.garbage {
                return Err(InvariantViolation::CorruptLocalArena { sp });
            }

            let hd = hd.with_color(Color::NOT_MARKABLE);
            // SAFETY: as above.
            unsafe { block.set_header(hd) };
            if hd.tag() >= NO_SCAN_TAG {
                sp += hd.bhsize() as isize;
                continue;
            }

            let start = if hd.tag() == CLOSURE_TAG && hd.wosize() > 1 {
                // SAFETY: a closure has its info word in field 1.
                start_env_closinfo(unsafe { block.field(1) })
            } else {
                0
            };
            for i in start..hd.wosize() {
                // SAFETY: i < wosize.
                let field = unsafe { NonNull::new_unchecked(block.field_ptr(i)) };
                let slot = RootSlot(field);
                // SAFETY: fields of a live local block hold valid values.
                if let Some(marked_ix) = unsafe { self.visit(slot) } {
                    let target_arena = arenas[marked_ix];
                    let target = slot.get().addr() as isize - target_arena.end() as isize;
                    if target < sp {
                        return Err(InvariantViolation::BackwardsLocalPointer {
                            field: slot.address(),
                            sp,
                            target,
                        });
                    }
                }
            }
            sp += hd.bhsize() as isize;
        }
        Ok(())
    }
}
