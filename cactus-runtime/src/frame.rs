//! # Frame Descriptors
//!
//! Compiled code publishes one descriptor per call site, keyed by the return
//! address pushed by the call. A descriptor gives the frame size and the
//! locations of live values at that call site.
//!
//! A live location is encoded as a single offset: odd values name slot
//! `offset >> 1` of the register save area, even values are byte offsets
//! from the frame's stack pointer. A descriptor flagged as returning to
//! native code marks the boundary between two runs of compiled frames.

use std::collections::HashMap;

use crate::value::WORD_SIZE;

/// Where a live value is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveSlot {
    /// Byte offset from the frame's stack pointer.
    Stack(usize),
    /// Index into the register save area.
    Register(usize),
}

impl LiveSlot {
    /// Decode a packed offset.
    pub fn decode(offset: u32) -> Self {
        if offset & 1 == 1 {
            LiveSlot::Register((offset >> 1) as usize)
        } else {
            LiveSlot::Stack(offset as usize)
        }
    }

    /// Encode as a packed offset.
    pub fn encode(self) -> u32 {
        match self {
            LiveSlot::Stack(bytes) => bytes as u32,
            LiveSlot::Register(index) => ((index as u32) << 1) | 1,
        }
    }
}

/// Layout of one compiled frame at one call site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameDescriptor {
    /// Frame size in bytes, including the return address word.
    pub frame_size: usize,
    /// Packed live locations.
    pub live_offsets: Vec<u32>,
    /// Whether this call site returns into native code.
    pub returns_to_native: bool,
}

impl FrameDescriptor {
    /// A compiled frame.
    pub fn new(frame_size: usize, live: impl IntoIterator<Item = LiveSlot>) -> Self {
        Self {
            frame_size,
            live_offsets: live.into_iter().map(LiveSlot::encode).collect(),
            returns_to_native: false,
        }
    }

    /// The boundary descriptor of a call from native code into compiled code.
    pub fn native_boundary() -> Self {
        Self {
            frame_size: 0,
            live_offsets: Vec::new(),
            returns_to_native: true,
        }
    }

    /// Frame size in words.
    pub fn frame_words(&self) -> usize {
        self.frame_size / WORD_SIZE
    }

    /// Decoded live locations.
    pub fn live_slots(&self) -> impl Iterator<Item = LiveSlot> + '_ {
        self.live_offsets.iter().map(|&o| LiveSlot::decode(o))
    }
}

/// Lookup of descriptors by return address.
pub trait FrameDescriptors {
    /// The descriptor of the call site returning to `return_address`.
    fn find(&self, return_address: usize) -> Option<&FrameDescriptor>;
}

/// A [`FrameDescriptors`] backed by a hash table.
#[derive(Debug, Clone, Default)]
pub struct FrameTable {
    descriptors: HashMap<usize, FrameDescriptor>,
}

impl FrameTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the descriptor for `return_address`, returning the one it replaced.
    pub fn insert(&mut self, return_address: usize, descriptor: FrameDescriptor) -> Option<FrameDescriptor> {
        self.descriptors.insert(return_address, descriptor)
    }

    /// Remove the descriptor for `return_address`.
    pub fn remove(&mut self, return_address: usize) -> Option<FrameDescriptor> {
        self.descriptors.remove(&return_address)
    }

    /// Number of registered call sites.
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Whether no call site is registered.
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

impl FrameDescriptors for FrameTable {
    fn find(&self, return_address: usize) -> Option<&FrameDescriptor> {
        self.descriptors.get(&return_address)
    }
}
