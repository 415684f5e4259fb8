// Allocation tracking tests for deep-copy messages
//
// Note: Tests using dhat are marked with #[serial_test::serial] because
// dhat only allows one profiler to run at a time, and heap counts must not see
// other tests' allocations. Every test here runs sequentially.
//
// # Run all allocation tracking tests
// cargo test --test allocation_tracking -- --nocapture

use dmxp_deepcopy::Core::alloc::AllocationTracker;
use dmxp_deepcopy::Core::fabric::{Endpoint, LocalFabric};
use dmxp_deepcopy::Deep::{Message, MessageState};
use memoffset::offset_of;
use std::ptr;

#[global_allocator]
static ALLOC: dhat::Alloc = dhat::Alloc;

const K: usize = 3;

/// Record with K independent array indirections.
#[repr(C)]
struct Triple {
    tag: u32,
    xs: *mut u32,
    ys: *mut u64,
    zs: *mut u8,
}

impl Triple {
    fn empty() -> Self {
        Triple {
            tag: 0,
            xs: ptr::null_mut(),
            ys: ptr::null_mut(),
            zs: ptr::null_mut(),
        }
    }
}

fn describe<'a>(msg: &mut Message<'a>, record: &'a mut Triple) {
    msg.add_root(record)
        .unwrap()
        .add_inline_of::<u32>(offset_of!(Triple, tag), 1)
        .unwrap()
        .add_indirection_of::<u32>(offset_of!(Triple, xs), 4)
        .unwrap()
        .add_indirection_of::<u64>(offset_of!(Triple, ys), 2)
        .unwrap()
        .add_indirection_of::<u8>(offset_of!(Triple, zs), 16)
        .unwrap();
}

/// One send/receive cycle; returns the receiving message's allocation count.
fn cycle(tx: &Endpoint, rx: &Endpoint, tag: u32) -> usize {
    let mut xs = [tag; 4];
    let mut ys = [u64::from(tag); 2];
    let mut zs = [tag as u8; 16];
    let mut source = Triple {
        tag,
        xs: xs.as_mut_ptr(),
        ys: ys.as_mut_ptr(),
        zs: zs.as_mut_ptr(),
    };
    let mut tx_msg = Message::new();
    describe(&mut tx_msg, &mut source);
    tx_msg.send(tx, 1, 0).unwrap();
    drop(tx_msg);

    let mut dest = Triple::empty();
    let mut rx_msg = Message::new();
    describe(&mut rx_msg, &mut dest);
    rx_msg.receive(rx, 0, 0).unwrap();
    let recorded = rx_msg.tracker().stats().recorded;
    assert_eq!(rx_msg.tracker().len(), K);
    assert_eq!(rx_msg.release(), K);
    drop(rx_msg);

    assert_eq!(dest.tag, tag);
    assert!(dest.xs.is_null() && dest.ys.is_null() && dest.zs.is_null());
    recorded
}

#[test]
#[serial_test::serial]
fn test_no_leak_with_dhat() {
    println!("\n--- Running deep-copy cycles with dhat ---");
    let _dhat = dhat::Profiler::new_heap();

    let fabric = LocalFabric::new(2);
    let tx = fabric.endpoint(0).unwrap();
    let rx = fabric.endpoint(1).unwrap();

    // Warm-up so lazily grown fabric tables are part of the baseline.
    cycle(&tx, &rx, 0);
    let baseline = dhat::HeapStats::get();

    const N: usize = 50;
    let mut freed = 0;
    for i in 1..=N {
        freed += cycle(&tx, &rx, i as u32);
    }

    let after = dhat::HeapStats::get();
    println!("Baseline: {} blocks, {} bytes", baseline.curr_blocks, baseline.curr_bytes);
    println!(
        "After {N} cycles: {} blocks, {} bytes ({} allocations freed by trackers)",
        after.curr_blocks, after.curr_bytes, freed
    );
    assert_eq!(freed, N * K);
    assert_eq!(after.curr_blocks, baseline.curr_blocks);
    assert_eq!(after.curr_bytes, baseline.curr_bytes);
    assert!(after.total_blocks >= baseline.total_blocks + (N * K) as u64);
}

#[test]
#[serial_test::serial]
fn test_drop_releases_with_dhat() {
    let _dhat = dhat::Profiler::new_heap();

    let fabric = LocalFabric::new(2);
    let tx = fabric.endpoint(0).unwrap();
    let rx = fabric.endpoint(1).unwrap();
    cycle(&tx, &rx, 1);
    let baseline = dhat::HeapStats::get();

    let mut xs = [1u32; 4];
    let mut ys = [2u64; 2];
    let mut zs = [3u8; 16];
    let mut source = Triple {
        tag: 9,
        xs: xs.as_mut_ptr(),
        ys: ys.as_mut_ptr(),
        zs: zs.as_mut_ptr(),
    };
    let mut tx_msg = Message::new();
    describe(&mut tx_msg, &mut source);
    tx_msg.send(&tx, 1, 0).unwrap();
    drop(tx_msg);

    let mut dest = Triple::empty();
    {
        let mut rx_msg = Message::new();
        describe(&mut rx_msg, &mut dest);
        rx_msg.receive(&rx, 0, 0).unwrap();
        assert_eq!(rx_msg.tracker().live_bytes(), 4 * 4 + 2 * 8 + 16);
        // No explicit release: drop frees everything.
    }
    assert!(dest.xs.is_null());
    assert_eq!(dhat::HeapStats::get().curr_blocks, baseline.curr_blocks);
}

#[test]
#[serial_test::serial]
fn test_release_is_idempotent() {
    let fabric = LocalFabric::new(2);
    let tx = fabric.endpoint(0).unwrap();
    let rx = fabric.endpoint(1).unwrap();

    let mut xs = [5u32; 4];
    let mut ys = [6u64; 2];
    let mut zs = [7u8; 16];
    let mut source = Triple {
        tag: 1,
        xs: xs.as_mut_ptr(),
        ys: ys.as_mut_ptr(),
        zs: zs.as_mut_ptr(),
    };
    let mut tx_msg = Message::new();
    describe(&mut tx_msg, &mut source);
    tx_msg.send(&tx, 1, 0).unwrap();
    // Senders own nothing.
    assert_eq!(tx_msg.release(), 0);

    let mut dest = Triple::empty();
    let mut rx_msg = Message::new();
    describe(&mut rx_msg, &mut dest);
    rx_msg.receive(&rx, 0, 0).unwrap();
    println!("{:?}", rx_msg);

    assert_eq!(rx_msg.release(), K);
    assert_eq!(rx_msg.state(), MessageState::Released);
    assert_eq!(rx_msg.release(), 0);
    let stats = rx_msg.tracker().stats();
    assert_eq!(stats.recorded, K);
    assert_eq!(stats.released, K);
    assert_eq!(stats.live_bytes, 0);
}

#[test]
#[serial_test::serial]
fn test_tracker_direct() {
    let mut tracker = AllocationTracker::new();
    assert!(tracker.allocate(0, 8, 0).is_none());
    assert!(tracker.allocate(8, 3, 0).is_none());

    let pending = tracker.allocate(64, 16, 2).unwrap();
    assert_eq!(pending.as_ptr() as usize % 16, 0);
    drop(pending); // never recorded
    assert!(tracker.is_empty());

    let a = tracker.record(tracker.allocate(32, 8, 0).unwrap());
    let b = tracker.record(tracker.allocate(10, 1, 1).unwrap());
    assert_eq!(tracker.len(), 2);
    assert!(tracker.owns(a) && tracker.owns(b));
    assert_eq!(tracker.live_bytes(), 42);
    let ordinals: Vec<usize> = tracker.iter().map(|entry| entry.ordinal()).collect();
    assert_eq!(ordinals, vec![0, 1]);
    println!("{:?}", tracker);

    assert_eq!(tracker.release_all(), 2);
    assert_eq!(tracker.release_all(), 0);
    assert!(!tracker.owns(a));
}

#[test]
#[serial_test::serial]
fn test_repeated_cycles_with_memory_stats() {
    println!("\n--- Running deep-copy cycles with memory-stats ---");
    use memory_stats::memory_stats;

    let fabric = LocalFabric::new(2);
    let tx = fabric.endpoint(0).unwrap();
    let rx = fabric.endpoint(1).unwrap();
    cycle(&tx, &rx, 0);

    let before = memory_stats();
    println!("Memory before: {:?}", before);
    for i in 0..1000 {
        cycle(&tx, &rx, i);
    }
    let after = memory_stats();
    println!("Memory after: {:?}", after);

    if let (Some(b), Some(a)) = (before, after) {
        let delta = a.physical_mem as i64 - b.physical_mem as i64;
        println!("Memory delta: {} bytes ({:.2} KB)", delta, delta as f64 / 1024.0);
    }
    assert_eq!(fabric.pending_messages(), 0);
}
