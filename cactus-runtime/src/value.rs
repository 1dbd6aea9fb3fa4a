//! # Tagged Words and Block Headers
//!
//! Every stack slot, handler reference and object field is a machine word.
//! Immediates carry a set low bit; anything else with a clear low bit is the
//! address of a block's first field, preceded by a one-word header.
//!
//! ## Header Layout
//!
//! ```text
//! ┌──────────────────────────────┬────────┬──────────┐
//! │        wosize (54 bits)      │ color  │   tag    │
//! │                              │ 2 bits │  8 bits  │
//! └──────────────────────────────┴────────┴──────────┘
//! ```

use std::fmt;

/// Size of one stack or heap word in bytes.
pub const WORD_SIZE: usize = std::mem::size_of::<usize>();

/// Tag of continuation blocks.
pub const CONT_TAG: u8 = 245;
/// Tag of closure blocks.
pub const CLOSURE_TAG: u8 = 247;
/// Tag of infix pointers into a closure block.
pub const INFIX_TAG: u8 = 249;
/// First tag whose fields are never scanned.
pub const NO_SCAN_TAG: u8 = 251;

/// Tag written in the header that separates two local arenas.
pub const LOCAL_UNINIT_TAG: u8 = 0x42;

/// Header marking the part of a fresh local arena that corresponds to
/// allocations living in the previous arena.
pub const LOCAL_UNINIT_HD: Header = Header::new(0, Color::NOT_MARKABLE, LOCAL_UNINIT_TAG);

/// Pattern written over reclaimed local blocks when poisoning is enabled.
pub const DEBUG_FREE_LOCAL: usize = 0xD700_D6D7_00D6_D700_u64 as usize;

/// A runtime word.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct Value(pub usize);

impl Value {
    /// The null word. Never a live reference.
    pub const NULL: Value = Value(0);
    /// The unit immediate.
    pub const UNIT: Value = Value::from_int(0);

    /// Encode an immediate integer.
    pub const fn from_int(n: isize) -> Self {
        Value(((n << 1) | 1) as usize)
    }

    /// Wrap the address of a block's first field.
    pub const fn from_addr(addr: usize) -> Self {
        Value(addr)
    }

    /// Raw bits.
    pub const fn raw(self) -> usize {
        self.0
    }

    /// Whether this word is an immediate.
    pub const fn is_int(self) -> bool {
        self.0 & 1 == 1
    }

    /// Whether this word is a (non-null) block address.
    pub const fn is_block(self) -> bool {
        self.0 & 1 == 0 && self.0 != 0
    }

    /// Decode an immediate integer.
    pub const fn to_int(self) -> isize {
        (self.0 as isize) >> 1
    }

    /// Address of the block's first field.
    pub const fn addr(self) -> usize {
        self.0
    }

    /// Address of the block's header word.
    pub const fn header_addr(self) -> usize {
        self.0 - WORD_SIZE
    }

    /// Read the block header.
    ///
    /// # Safety
    /// `self` must be a block whose header word is readable.
    pub unsafe fn header(self) -> Header {
        Header(*(self.header_addr() as *const usize))
    }

    /// Overwrite the block header.
    ///
    /// # Safety
    /// `self` must be a block whose header word is writable.
    pub unsafe fn set_header(self, hd: Header) {
        *(self.header_addr() as *mut usize) = hd.0;
    }

    /// Pointer to field `i`.
    ///
    /// # Safety
    /// `self` must be a block with more than `i` fields.
    pub unsafe fn field_ptr(self, i: usize) -> *mut Value {
        (self.0 as *mut Value).add(i)
    }

    /// Read field `i`.
    ///
    /// # Safety
    /// `self` must be a block with more than `i` fields.
    pub unsafe fn field(self, i: usize) -> Value {
        *self.field_ptr(i)
    }

    /// Rebase an infix pointer onto its enclosing closure block.
    ///
    /// # Safety
    /// `self` must be a readable block.
    pub unsafe fn enclosing_block(self) -> Value {
        let hd = self.header();
        if hd.tag() == INFIX_TAG {
            Value(self.0 - hd.wosize() * WORD_SIZE)
        } else {
            self
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_int() {
            write!(f, "Int({})", self.to_int())
        } else {
            write!(f, "Block({:#x})", self.0)
        }
    }
}

/// Mark color stored in a block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Color(pub u8);

impl Color {
    /// Color of local blocks and blocks outside the managed heap.
    pub const NOT_MARKABLE: Color = Color(3);
}

/// The rotating color assignment of the major collector.
///
/// Scanning borrows the `garbage` color as a transient "visited" mark on
/// local blocks, since no reachable block carries it during marking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapColors {
    /// Unmarked major-heap blocks.
    pub unmarked: Color,
    /// Marked major-heap blocks.
    pub marked: Color,
    /// Dead major-heap blocks awaiting sweep.
    pub garbage: Color,
}

impl Default for HeapColors {
    fn default() -> Self {
        Self {
            unmarked: Color(0),
            marked: Color(1),
            garbage: Color(2),
        }
    }
}

/// A block header word.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Header(pub usize);

impl Header {
    const COLOR_SHIFT: u32 = 8;
    const WOSIZE_SHIFT: u32 = 10;

    /// Build a header.
    pub const fn new(wosize: usize, color: Color, tag: u8) -> Self {
        Header((wosize << Self::WOSIZE_SHIFT) | ((color.0 as usize & 3) << Self::COLOR_SHIFT) | tag as usize)
    }

    /// Size of the block in words, header excluded.
    pub const fn wosize(self) -> usize {
        self.0 >> Self::WOSIZE_SHIFT
    }

    /// Size of the block in bytes, header included.
    pub const fn bhsize(self) -> usize {
        (self.wosize() + 1) * WORD_SIZE
    }

    /// Block tag.
    pub const fn tag(self) -> u8 {
        (self.0 & 0xff) as u8
    }

    /// Block color.
    pub const fn color(self) -> Color {
        Color(((self.0 >> Self::COLOR_SHIFT) & 3) as u8)
    }

    /// Same header with a different color.
    pub const fn with_color(self, color: Color) -> Self {
        Header((self.0 & !(3 << Self::COLOR_SHIFT)) | ((color.0 as usize & 3) << Self::COLOR_SHIFT))
    }
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Header")
            .field("wosize", &self.wosize())
            .field("color", &self.color().0)
            .field("tag", &self.tag())
            .finish()
    }
}

/// Index of the first environment field of a closure, from its info word.
///
/// The info word keeps the arity in the top byte and the environment start
/// shifted left by one, with the low bit set.
pub const fn start_env_closinfo(info: Value) -> usize {
    (info.0 << 8) >> 9
}

/// Build a closure info word.
pub const fn make_closinfo(arity: u8, start_env: usize) -> Value {
    Value(((arity as usize) << (usize::BITS - 8)) | (start_env << 1) | 1)
}
