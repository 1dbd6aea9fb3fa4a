//! # Local Arenas
//!
//! Region-allocated blocks whose lifetime is tied to a stack extent. They
//! live outside the managed heap, carry the not-markable color, and are
//! reached only through stack slots, registers and other local blocks.
//!
//! ## Layout
//!
//! Allocation moves a single negative byte offset `sp` downward from the end
//! of the newest arena. When an allocation does not fit, a larger arena is
//! added and the offsets already in use are filled with
//! [`LOCAL_UNINIT_HD`](crate::value::LOCAL_UNINIT_HD), so a walk starting
//! at `sp` in the newest arena knows where to continue in the previous one:
//!
//! ```text
//!   arena 1 (newest)           arena 0
//!   ┌────────┬──────┬──────┐   ┌────────┬──────┬──────┐
//!   │  free  │ new  │uninit│   │  free  │ old  │ old  │
//!   └────────┴──────┴──────┘   └────────┴──────┴──────┘
//!            ^ sp   ^ switch           ^ switch      end
//! ```
//!
//! A block only points at blocks allocated before it (higher offsets), so
//! one upward walk visits every reachable block after its referrers.

use crate::error::{RuntimeError, RuntimeResult};
use crate::log::{LogLevel, LogTarget};
use crate::runtime_log;
use crate::value::{Color, Header, Value, LOCAL_UNINIT_HD, WORD_SIZE};

/// Bytes in the first arena.
pub const INIT_LOCAL_ARENA_BSIZE: usize = 4096;

/// Most arenas a region may hold.
pub const MAX_LOCAL_ARENAS: usize = 64;

/// One arena, by address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalArena {
    /// Lowest address.
    pub base: usize,
    /// Length in bytes.
    pub length: usize,
}

impl LocalArena {
    /// One past the highest address.
    pub fn end(&self) -> usize {
        self.base + self.length
    }

    /// Whether `addr` lies in this arena.
    pub fn contains(&self, addr: usize) -> bool {
        self.base <= addr && addr < self.end()
    }

    /// Address at offset `sp` from the end.
    pub fn at(&self, sp: isize) -> usize {
        self.end().wrapping_add_signed(sp)
    }
}

/// The arenas of a domain together with the allocation offset, as seen by
/// the root scanner.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalArenas {
    arenas: Vec<LocalArena>,
    saved_sp: isize,
}

impl LocalArenas {
    /// Describe existing arenas, oldest first.
    pub fn new(arenas: Vec<LocalArena>, saved_sp: isize) -> Self {
        Self { arenas, saved_sp }
    }

    /// Arenas, oldest first.
    pub fn arenas(&self) -> &[LocalArena] {
        &self.arenas
    }

    /// Allocation offset (zero or negative).
    pub fn saved_sp(&self) -> isize {
        self.saved_sp
    }

    /// Whether no arena exists.
    pub fn is_empty(&self) -> bool {
        self.arenas.is_empty()
    }

    /// Index of the arena holding `addr`, searching newest first.
    pub fn arena_index_of(&self, addr: usize) -> Option<usize> {
        self.arenas.iter().rposition(|a| a.contains(addr))
    }
}

/// An owning local allocator.
#[derive(Debug, Default)]
pub struct LocalRegion {
    arenas: Vec<Box<[usize]>>,
    sp: isize,
    next_length: usize,
}

impl LocalRegion {
    /// An empty region. The first allocation creates the first arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current allocation offset.
    pub fn sp(&self) -> isize {
        self.sp
    }

    fn limit(&self) -> isize {
        -(self.arenas.last().map_or(0, |a| a.len() * WORD_SIZE) as isize)
    }

    fn arena(&mut self, index: usize) -> LocalArena {
        let words = &mut self.arenas[index];
        LocalArena {
            length: words.len() * WORD_SIZE,
            base: words.as_mut_ptr() as usize,
        }
    }

    /// Allocate a block of `wosize` fields, initialized to unit.
    pub fn alloc(&mut self, wosize: usize, tag: u8) -> RuntimeResult<Value> {
        let bytes = (wosize + 1) * WORD_SIZE;
        let new_sp = self.sp - bytes as isize;
        if new_sp < self.limit() {
            self.add_arena(new_sp)?;
        }
        self.sp = new_sp;
        let hp = self.arena(self.arenas.len() - 1).at(new_sp);
        let block = Value::from_addr(hp + WORD_SIZE);
        // SAFETY: [hp, hp + bytes) lies in the newest arena by construction.
        unsafe {
            block.set_header(Header::new(wosize, Color::NOT_MARKABLE, tag));
            for i in 0..wosize {
                *block.field_ptr(i) = Value::UNIT;
            }
        }
        Ok(block)
    }

    fn add_arena(&mut self, required_sp: isize) -> RuntimeResult<()> {
        if self.arenas.len() == MAX_LOCAL_ARENAS {
            return Err(RuntimeError::OutOfMemory {
                words: required_sp.unsigned_abs() / WORD_SIZE,
            });
        }
        loop {
            self.next_length = if self.next_length == 0 {
                INIT_LOCAL_ARENA_BSIZE
            } else {
                self.next_length * 2
            };
            if required_sp + self.next_length as isize >= 0 {
                break;
            }
        }
        let words = self.next_length / WORD_SIZE;
        let mut arena = vec![0usize; words].into_boxed_slice();
        let used_words = (self.sp.unsigned_abs()) / WORD_SIZE;
        for slot in arena[words - used_words..].iter_mut() {
            *slot = LOCAL_UNINIT_HD.0;
        }
        runtime_log!(LogLevel::Debug, LogTarget::Stack, "Growing local stack to {} kB", self.next_length / 1024);
        self.arenas.push(arena);
        Ok(())
    }

    /// Offset to restore with [`end_region`](Self::end_region).
    pub fn begin_region(&self) -> isize {
        self.sp
    }

    /// Release every block allocated since `saved`.
    ///
    /// # Panics
    /// If `saved` is below the current offset.
    pub fn end_region(&mut self, saved: isize) {
        assert!(saved >= self.sp && saved <= 0, "region end {} above allocation offset {}", saved, self.sp);
        self.sp = saved;
    }

    /// Scanner view of the arenas. Scanning writes marks through it.
    pub fn arenas(&mut self) -> LocalArenas {
        let arenas = (0..self.arenas.len()).map(|i| self.arena(i)).collect();
        LocalArenas::new(arenas, self.sp)
    }
}
