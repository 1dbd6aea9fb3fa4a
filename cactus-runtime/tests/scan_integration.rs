//! Root scanning across whole segment chains.

use std::collections::HashMap;
use std::process::Command;

use cactus_runtime::scan::NoCode;
use cactus_runtime::value::{Color, Header, WORD_SIZE};
use cactus_runtime::{
    scan_roots, Domain, FrameDescriptor, FrameTable, Handlers, LiveSlot, LocalRegion, RootSlot, RuntimeConfig,
    ScanContext, ScanFlags, ScanMode, Segment, Value,
};

const RET_FRAME: usize = 0x7000;
const RET_BOUNDARY: usize = 0x8000;

/// Major-heap stand-ins: a header word followed by one field each.
struct Heap {
    words: Vec<usize>,
}

impl Heap {
    fn new(blocks: usize) -> Self {
        let mut words = Vec::with_capacity(blocks * 2);
        for _ in 0..blocks {
            words.push(Header::new(1, Color(0), 0).0);
            words.push(Value::UNIT.0);
        }
        Self { words }
    }

    fn block(&self, i: usize) -> Value {
        Value::from_addr(&self.words[2 * i + 1] as *const usize as usize)
    }
}

fn domain(mode: ScanMode) -> Domain {
    let config = RuntimeConfig::builder().debug_wipe(false).scan_mode(mode).build().unwrap();
    Domain::with_config(&config)
}

/// Push one compiled frame holding `live`, closed by a native boundary.
fn push_frame(seg: &mut Segment, live: &[Value]) {
    let mut words = vec![Value(RET_FRAME)];
    words.extend_from_slice(live);
    words.push(Value(RET_BOUNDARY));
    words.extend([Value::UNIT, Value::UNIT, Value::UNIT, Value(0)]);
    for &w in words.iter().rev() {
        seg.push(w).unwrap();
    }
}

fn frame_table(live: usize) -> FrameTable {
    let mut table = FrameTable::new();
    table.insert(
        RET_FRAME,
        FrameDescriptor::new((live + 1) * WORD_SIZE, (0..live).map(|i| LiveSlot::Stack(i * WORD_SIZE))),
    );
    table.insert(RET_BOUNDARY, FrameDescriptor::native_boundary());
    table
}

/// Three chained segments, each with `k` live slots and its own handlers.
fn three_segment_chain(domain: &mut Domain, heap: &Heap, k: usize) -> Box<Segment> {
    let mut chain: Option<Box<Segment>> = None;
    for s in 0..3 {
        let h = heap.block(3 * k + s);
        let mut seg = domain.alloc_stack(Handlers::new(h, h, h)).unwrap();
        let live: Vec<Value> = (0..k).map(|i| heap.block(s * k + i)).collect();
        push_frame(&mut seg, &live);
        seg.set_parent(chain.take());
        chain = Some(seg);
    }
    chain.unwrap()
}

#[test]
fn native_scan_visits_every_location_once() {
    const K: usize = 4;
    let heap = Heap::new(3 * K + 3);
    let mut domain = domain(ScanMode::Native);
    let mut chain = three_segment_chain(&mut domain, &heap, K);

    let table = frame_table(K);
    let ctx = ScanContext::native(&table).with_poison(false);
    let mut seen: HashMap<usize, Value> = HashMap::new();
    let mut visits = 0;
    let mut visitor = |v: Value, slot: RootSlot| {
        visits += 1;
        seen.insert(slot.address(), v);
    };
    scan_roots(&ctx, &mut visitor, ScanFlags::NONE, &mut chain, None, None);

    assert_eq!(visits, 3 * K + 9);
    assert_eq!(seen.len(), 3 * K + 9, "no location is visited twice");
    for i in 0..3 * K + 3 {
        assert!(seen.values().any(|v| *v == heap.block(i)), "block {} was not reported", i);
    }
    domain.free_stack(chain);
}

#[test]
fn flat_scan_visits_every_word_once() {
    let heap = Heap::new(9);
    let mut domain = domain(ScanMode::Flat);
    let mut chain: Option<Box<Segment>> = None;
    for s in 0..3 {
        let h = heap.block(6 + s);
        let mut seg = domain.alloc_stack(Handlers::new(h, h, h)).unwrap();
        seg.push(heap.block(2 * s)).unwrap();
        seg.push(Value::from_int(s as isize)).unwrap();
        seg.push(heap.block(2 * s + 1)).unwrap();
        seg.set_parent(chain.take());
        chain = Some(seg);
    }
    let mut chain = chain.unwrap();

    let ctx = ScanContext::for_domain(&domain, &cactus_runtime::scan::NoFrames, &NoCode);
    assert_eq!(ctx.mode(), ScanMode::Flat);
    let mut addresses = Vec::new();
    let mut visitor = |_: Value, slot: RootSlot| addresses.push(slot.address());
    scan_roots(&ctx, &mut visitor, ScanFlags::NONE, &mut chain, None, None);

    assert_eq!(addresses.len(), 3 * 2 + 9);
    addresses.sort_unstable();
    addresses.dedup();
    assert_eq!(addresses.len(), 3 * 2 + 9);
    domain.free_stack(chain);
}

#[test]
fn domain_scan_uses_running_chain() {
    let heap = Heap::new(2);
    let mut domain = domain(ScanMode::Flat);
    domain.start_main_stack().unwrap();
    domain.push(heap.block(0)).unwrap();
    let fiber = domain.alloc_stack(Handlers::UNIT).unwrap();
    domain.run_fiber(fiber);
    domain.push(heap.block(1)).unwrap();

    let ctx = ScanContext::for_domain(&domain, &cactus_runtime::scan::NoFrames, &NoCode);
    let mut seen = Vec::new();
    let mut visitor = |v: Value, _: RootSlot| seen.push(v);
    domain.scan_roots(&ctx, &mut visitor, ScanFlags::NONE, None, None);
    assert_eq!(seen, vec![heap.block(1), heap.block(0)]);
}

/// Scan a chain whose only root reaches an older local block that points
/// at a newer one. Aborts the process.
fn scan_backwards_local_pointer() {
    let mut region = LocalRegion::new();
    let older = region.alloc(1, 0).unwrap();
    let newer = region.alloc(1, 0).unwrap();
    unsafe { *older.field_ptr(0) = newer };
    let locals = region.arenas();

    let mut domain = domain(ScanMode::Native);
    let mut seg = domain.alloc_stack(Handlers::UNIT).unwrap();
    push_frame(&mut seg, &[older]);
    let table = frame_table(1);
    let ctx = ScanContext::native(&table).with_poison(false);
    let mut visitor = |_: Value, _: RootSlot| {};
    scan_roots(&ctx, &mut visitor, ScanFlags::NONE, &mut seg, None, Some(&locals));
}

#[test]
fn backwards_local_pointer_aborts() {
    if std::env::var_os("CACTUS_SCAN_ABORT_CHILD").is_some() {
        scan_backwards_local_pointer();
        return;
    }
    let exe = std::env::current_exe().unwrap();
    let output = Command::new(exe)
        .args(["backwards_local_pointer_aborts", "--exact", "--nocapture", "--test-threads=1"])
        .env("CACTUS_SCAN_ABORT_CHILD", "1")
        .output()
        .unwrap();
    assert!(!output.status.success(), "scan must not complete");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("backwards local pointer"), "stderr was: {}", stderr);
}
