//! # Segment Cache
//!
//! Per-domain free lists of segments, one LIFO list per pool class.
//!
//! Only segments whose body size is exactly `base << k` words for
//! `k < NUM_STACK_SIZE_CLASSES` are pooled. A segment returned to a domain
//! other than the one that allocated it is released to the OS instead of
//! being cached, which keeps each free list private to its domain.

use crate::domain::DomainId;
use crate::log::{LogLevel, LogTarget};
use crate::runtime_log;
use crate::segment::{PoolClass, Segment, NUM_STACK_SIZE_CLASSES};

/// Counters kept by a [`SegmentCache`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Requests served from a free list.
    pub hits: u64,
    /// Requests for a pooled class with an empty free list.
    pub misses: u64,
    /// Segments pushed onto a free list.
    pub recycled: u64,
    /// Segments released to the OS.
    pub released: u64,
}

/// What happened to a segment handed to [`SegmentCache::give_back`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Kept on the free list of this class.
    Recycled(PoolClass),
    /// Memory returned to the OS.
    Released,
}

/// Free lists of one domain.
#[derive(Debug)]
pub struct SegmentCache {
    owner: DomainId,
    base_wsize: usize,
    free: [Vec<Box<Segment>>; NUM_STACK_SIZE_CLASSES],
    wipe: bool,
    stats: CacheStats,
}

impl SegmentCache {
    /// Empty cache for `owner` with class 0 holding `base_wsize` words.
    pub fn new(owner: DomainId, base_wsize: usize, wipe: bool) -> Self {
        Self {
            owner,
            base_wsize,
            free: Default::default(),
            wipe,
            stats: CacheStats::default(),
        }
    }

    /// Words of class 0.
    pub fn base_wsize(&self) -> usize {
        self.base_wsize
    }

    /// Pool class for an exact body size.
    pub fn class_for(&self, wsize: usize) -> Option<PoolClass> {
        PoolClass::for_wsize(wsize, self.base_wsize)
    }

    /// Pop the most recently freed segment of `class`.
    pub fn take(&mut self, class: PoolClass) -> Option<Box<Segment>> {
        match self.free[class.index()].pop() {
            Some(seg) => {
                self.stats.hits += 1;
                runtime_log!(LogLevel::Trace, LogTarget::Cache, "reusing class {} segment at {:#x}", class.index(), seg.base());
                Some(seg)
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Return a segment with no parent. Pooled segments owned by this
    /// domain are cached; everything else is released.
    pub fn give_back(&mut self, mut seg: Box<Segment>) -> Disposition {
        debug_assert!(seg.parent().is_none(), "cached segment still owns a parent");
        match seg.pool_class() {
            Some(class) if seg.owner() == self.owner => {
                if self.wipe {
                    seg.wipe();
                }
                self.free[class.index()].push(seg);
                self.stats.recycled += 1;
                Disposition::Recycled(class)
            }
            _ => {
                self.stats.released += 1;
                drop(seg);
                Disposition::Released
            }
        }
    }

    /// Segments cached in `class`.
    pub fn cached(&self, class: PoolClass) -> usize {
        self.free[class.index()].len()
    }

    /// Segments cached across all classes.
    pub fn total_cached(&self) -> usize {
        self.free.iter().map(Vec::len).sum()
    }

    /// Counters.
    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Release every cached segment, returning how many were released.
    pub fn clear(&mut self) -> usize {
        let mut released = 0;
        for list in self.free.iter_mut() {
            released += list.len();
            list.clear();
        }
        self.stats.released += released as u64;
        released
    }
}
