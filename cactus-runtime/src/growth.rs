//! # Stack Growth
//!
//! Replacing the running segment with a larger copy, and repairing every
//! pointer that referred to the old copy.
//!
//! ## Design
//!
//! The live suffix of the old segment is copied to the top of the new one,
//! so an address `p` in the old live region moves to
//! `new.high - (old.high - p)`. Pointers that must follow the move:
//!
//! - the domain's exception handler chain: each trap frame stores the
//!   address of the next one in its first word;
//! - the async exception handler when it aliases a trap frame on that chain;
//! - saved base pointers, when frame-pointer walking is enabled. Records
//!   inside the old segment are fixed in their copied location; records
//!   elsewhere are fixed in place;
//! - native call links that named the old segment.
//!
//! The new segment keeps the fiber id, the handlers and the parent of the
//! old one. Growth fails only on hitting the domain maximum or running out
//! of memory; nothing is modified in that case.

use crate::domain::Domain;
use crate::error::{RuntimeError, RuntimeResult};
use crate::log::{LogLevel, LogTarget};
use crate::runtime_log;
use crate::segment::{Segment, STACK_THRESHOLD_WORDS};
use crate::value::{Value, WORD_SIZE};

/// Extra words native code needs beyond the interpreter threshold.
pub const NATIVE_STACK_SLACK_WORDS: usize = 10;

/// Words between a frame record and `high` for the outermost frame of a
/// fiber: the record, the return address, a trap frame, and the DWARF and
/// register-area words.
const FIBER_TOP_RECORD_WORDS: usize = 6;

/// Address translation from an old segment to its replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    old_base: usize,
    old_high: usize,
    new_high: usize,
}

impl Relocation {
    /// Translation between two segments.
    pub fn between(old: &Segment, new: &Segment) -> Self {
        Self {
            old_base: old.base(),
            old_high: old.high(),
            new_high: new.high(),
        }
    }

    /// Whether `addr` is a body address of the old segment.
    pub fn in_old(&self, addr: usize) -> bool {
        self.old_base <= addr && addr < self.old_high
    }

    /// Where an old body address lives after the copy.
    pub fn translate(&self, addr: usize) -> usize {
        self.new_high - (self.old_high - addr)
    }
}

impl Domain {
    /// Replace the running segment with one that has at least `required`
    /// free words. Returns `false` if the maximum would be exceeded or
    /// memory is exhausted.
    pub fn try_realloc_stack(&mut self, required: usize) -> bool {
        let Some(old) = self.current.as_ref() else {
            return false;
        };
        let Some(needed) = old.used_words().checked_add(required) else {
            return false;
        };
        let mut wsize = old.body_wsize();
        loop {
            if wsize >= self.max_stack_wsize {
                return false;
            }
            wsize = match wsize.checked_mul(2) {
                Some(doubled) => doubled,
                None => return false,
            };
            if wsize >= needed {
                break;
            }
        }

        if wsize > 4096 / WORD_SIZE {
            runtime_log!(LogLevel::Info, LogTarget::Stack, "Growing stack to {}k bytes", wsize * WORD_SIZE / 1024);
        } else {
            runtime_log!(LogLevel::Info, LogTarget::Stack, "Growing stack to {} bytes", wsize * WORD_SIZE);
        }

        let (id, handlers) = (old.id(), old.handlers());
        let Some(mut new) = self.alloc_stack_noexc(wsize, handlers, id) else {
            return false;
        };
        let Some(mut old) = self.current.take() else {
            return false;
        };

        new.load_live(old.live_words());
        new.save_exn_handler(old.saved_exn_handler());
        new.set_parent(old.take_parent());

        let reloc = Relocation::between(&old, &new);
        self.rewrite_exception_stack(&reloc, &mut new);
        if self.frame_pointers {
            // SAFETY: set_frame_pointer's contract covers every record on the chain.
            unsafe { self.rewrite_frame_pointers(&reloc, &old, &mut new) };
        }
        self.rewrite_c_stack_links(&reloc);

        self.free_stack(old);
        self.current = Some(new);
        true
    }

    /// Entry check of native code: make room for the threshold plus slack.
    pub fn maybe_expand_stack(&mut self) -> RuntimeResult<()> {
        self.ensure_stack_capacity(STACK_THRESHOLD_WORDS + NATIVE_STACK_SLACK_WORDS)
    }

    /// Entry check of interpreted code: make room for `required` words.
    pub fn ensure_stack_capacity(&mut self, required: usize) -> RuntimeResult<()> {
        let available = self.current.as_ref().map_or(0, |s| s.available_words());
        if available >= required || self.try_realloc_stack(required) {
            Ok(())
        } else {
            Err(RuntimeError::StackOverflow {
                requested_words: required,
                max_words: self.max_stack_wsize,
            })
        }
    }

    fn rewrite_exception_stack(&mut self, reloc: &Relocation, new: &mut Segment) {
        let mut link = self.exn_handler;
        let mut cell: Option<usize> = None;
        while reloc.in_old(link) {
            let moved = reloc.translate(link);
            if link == self.async_exn_handler {
                self.async_exn_handler = moved;
            }
            match cell {
                None => self.exn_handler = moved,
                Some(addr) => new.write(addr, Value(moved)),
            }
            cell = Some(moved);
            link = new.read(moved).raw();
        }
    }

    /// # Safety
    /// Every frame record on the domain's chain outside `old` must be a
    /// readable and writable pair of words.
    unsafe fn rewrite_frame_pointers(&mut self, reloc: &Relocation, old: &Segment, new: &mut Segment) {
        let mut record = self.frame_pointer;
        if reloc.in_old(record) {
            self.frame_pointer = reloc.translate(record);
        }
        while record != 0 {
            let inside = reloc.in_old(record);
            if inside && record + FIBER_TOP_RECORD_WORDS * WORD_SIZE == reloc.old_high {
                break;
            }
            let saved = if inside {
                old.read(record).raw()
            } else {
                *(record as *const usize)
            };
            if reloc.in_old(saved) {
                let fixed = reloc.translate(saved);
                if inside {
                    new.write(reloc.translate(record), Value(fixed));
                } else {
                    *(record as *mut usize) = fixed;
                }
            }
            record = saved;
        }
    }

    fn rewrite_c_stack_links(&mut self, reloc: &Relocation) {
        for link in self.c_stack.iter_mut() {
            if link.stack_high == reloc.old_high {
                link.stack_high = reloc.new_high;
                link.sp = reloc.translate(link.sp);
            }
            if reloc.in_old(link.async_exn_handler) {
                link.async_exn_handler = reloc.translate(link.async_exn_handler);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::domain::CStackLink;
    use crate::segment::Handlers;

    fn domain(max: usize) -> Domain {
        let config = RuntimeConfig::builder()
            .init_main_wsize(64)
            .max_stack_wsize(max)
            .debug_wipe(false)
            .build()
            .unwrap();
        let mut domain = Domain::with_config(&config);
        let fiber = domain.alloc_stack(Handlers::UNIT).unwrap();
        domain.run_fiber(fiber);
        domain
    }

    fn fill(domain: &mut Domain, words: usize) {
        let seg = domain.current_mut().unwrap();
        for i in 0..words {
            seg.push(Value::from_int(i as isize)).unwrap();
        }
    }

    #[test]
    fn test_growth_preserves_live_words() {
        let mut domain = domain(4096);
        fill(&mut domain, 40);
        let before: Vec<Value> = domain.current().unwrap().live_words().to_vec();
        let id = domain.current().unwrap().id();

        assert!(domain.try_realloc_stack(100));
        let seg = domain.current().unwrap();
        assert_eq!(seg.body_wsize(), 256);
        assert_eq!(seg.live_words(), &before[..]);
        assert_eq!(seg.id(), id);
        assert!(seg.available_words() >= 100);
        assert!(seg.parent().is_none());
    }

    #[test]
    fn test_growth_keeps_handlers_and_parent() {
        let config = RuntimeConfig::builder().init_main_wsize(64).build().unwrap();
        let mut domain = Domain::with_config(&config);
        domain.start_main_stack().unwrap();
        let h = Handlers::new(Value::from_int(1), Value::from_int(2), Value::from_int(3));
        let fiber = domain.alloc_stack(h).unwrap();
        domain.run_fiber(fiber);

        assert!(domain.try_realloc_stack(64));
        let seg = domain.current().unwrap();
        assert_eq!(seg.handlers(), h);
        assert_eq!(seg.parent().unwrap().id(), crate::fiber::FiberId::MAIN);
    }

    #[test]
    fn test_growth_at_max_fails_without_change() {
        let mut domain = domain(64);
        fill(&mut domain, 10);
        let base = domain.current().unwrap().base();
        assert!(!domain.try_realloc_stack(100));
        assert_eq!(domain.current().unwrap().base(), base);
        assert_eq!(
            domain.ensure_stack_capacity(100),
            Err(RuntimeError::StackOverflow {
                requested_words: 100,
                max_words: 64
            })
        );
    }

    #[test]
    fn test_huge_request_overflows_instead_of_panicking() {
        let mut domain = domain(4096);
        fill(&mut domain, 1);
        let base = domain.current().unwrap().base();
        assert!(!domain.try_realloc_stack(usize::MAX));
        assert_eq!(
            domain.ensure_stack_capacity(usize::MAX),
            Err(RuntimeError::StackOverflow {
                requested_words: usize::MAX,
                max_words: 4096
            })
        );
        assert_eq!(domain.current().unwrap().base(), base);
        assert_eq!(domain.current().unwrap().peek(0), Some(Value::from_int(0)));
    }

    #[test]
    fn test_growth_logs_size() {
        let mut domain = domain(1 << 20);
        let guard = crate::log::capture();
        assert!(domain.try_realloc_stack(1000));
        assert!(guard.contains("Growing stack to 8k bytes"));

        let mut small = self::domain(4096);
        let guard = crate::log::capture();
        assert!(small.try_realloc_stack(10));
        assert!(guard.contains("Growing stack to 1024 bytes"));
    }

    #[test]
    fn test_exception_chain_is_relocated() {
        let mut domain = domain(4096);
        fill(&mut domain, 20);
        let seg = domain.current_mut().unwrap();
        // Two trap frames: outer at 4 words below high, inner at 12.
        let outer = seg.from_top(4);
        let inner = seg.from_top(12);
        let external = 0xdead_0000;
        seg.write(outer, Value(external));
        seg.write(inner, Value(outer));
        let old_high = seg.high();
        domain.set_exn_handler(inner);
        domain.set_async_exn_handler(outer);

        assert!(domain.try_realloc_stack(200));
        let seg = domain.current().unwrap();
        let new_inner = seg.high() - (old_high - inner);
        let new_outer = seg.high() - (old_high - outer);
        assert_eq!(domain.exn_handler(), new_inner);
        assert_eq!(seg.read(new_inner), Value(new_outer));
        assert_eq!(seg.read(new_outer), Value(external));
        assert_eq!(domain.async_exn_handler(), new_outer);
    }

    #[test]
    fn test_c_stack_links_are_retargeted() {
        let mut domain = domain(4096);
        fill(&mut domain, 8);
        let (old_high, sp) = {
            let seg = domain.current().unwrap();
            (seg.high(), seg.sp())
        };
        domain.push_c_stack_link(CStackLink {
            stack_high: old_high,
            sp,
            async_exn_handler: old_high - 2 * WORD_SIZE,
        });
        domain.push_c_stack_link(CStackLink {
            stack_high: 0x1000,
            sp: 0x800,
            async_exn_handler: 0,
        });

        assert!(domain.try_realloc_stack(100));
        let new_high = domain.current().unwrap().high();
        let links = domain.c_stack_links();
        assert_eq!(links[0].stack_high, new_high);
        assert_eq!(links[0].sp, new_high - 8 * WORD_SIZE);
        assert_eq!(links[0].async_exn_handler, new_high - 2 * WORD_SIZE);
        assert_eq!(links[1].stack_high, 0x1000);
        assert_eq!(links[1].sp, 0x800);
    }

    #[test]
    fn test_frame_pointers_are_relocated() {
        let mut domain = domain(4096);
        domain.set_frame_pointer_walking(true);
        fill(&mut domain, 30);
        let seg = domain.current_mut().unwrap();
        let old_high = seg.high();
        // A record inside the segment pointing at another record inside it.
        let inner_record = seg.from_top(20);
        let outer_record = seg.from_top(10);
        seg.write(inner_record, Value(outer_record));
        seg.write(outer_record, Value(0));

        // An external record (register save area) pointing into the segment.
        let mut external = Box::new([inner_record, 0usize]);
        let external_addr = external.as_mut_ptr() as usize;
        unsafe { domain.set_frame_pointer(external_addr) };

        assert!(domain.try_realloc_stack(200));
        let seg = domain.current().unwrap();
        let moved = |addr: usize| seg.high() - (old_high - addr);
        assert_eq!(external[0], moved(inner_record));
        assert_eq!(seg.read(moved(inner_record)), Value(moved(outer_record)));
        assert_eq!(seg.read(moved(outer_record)), Value(0));
        assert_eq!(domain.frame_pointer(), external_addr);
    }

    #[test]
    fn test_maybe_expand_stack() {
        let mut domain = domain(4096);
        fill(&mut domain, 30);
        domain.maybe_expand_stack().unwrap();
        assert!(domain.current().unwrap().available_words() >= STACK_THRESHOLD_WORDS + NATIVE_STACK_SLACK_WORDS);
    }

    #[test]
    fn test_old_segment_returns_to_cache() {
        let mut domain = domain(4096);
        let old_base = domain.current().unwrap().base();
        assert!(domain.try_realloc_stack(100));
        assert_eq!(domain.cache().total_cached(), 1);
        let reused = domain.alloc_stack(Handlers::UNIT).unwrap();
        assert_eq!(reused.base(), old_base);
    }
}
