//! End-to-end scenarios exercising the public API as an embedder would,
//! rather than any particular module's internals.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use coro_rt::{stack_drop_count, Runtime, RuntimeConfig};

unsafe fn read_u64(blob: *const u8, offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(std::slice::from_raw_parts(blob.add(offset), 8));
    u64::from_ne_bytes(bytes)
}

extern "C" fn counting_loop(blob: *const u8) -> *mut u8 {
    unsafe {
        let counter = &*(read_u64(blob, 0) as *const AtomicU64);
        let stop = &*(read_u64(blob, 8) as *const AtomicBool);
        while !stop.load(Ordering::SeqCst) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }
    std::ptr::null_mut()
}

#[test]
fn fairness_across_three_coroutines_on_one_worker() {
    let rt = Runtime::init(RuntimeConfig::new().with_worker_count(1));
    let counters: Vec<Box<AtomicU64>> = (0..3).map(|_| Box::new(AtomicU64::new(0))).collect();
    let stop = Box::new(AtomicBool::new(false));

    for counter in &counters {
        let args = [
            (counter.as_ref() as *const AtomicU64 as u64, 8),
            (stop.as_ref() as *const AtomicBool as u64, 8),
        ];
        rt.submit("fairness:loop", counting_loop, &args).unwrap();
    }

    std::thread::sleep(Duration::from_secs(1));
    stop.store(true, Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(50));

    let counts: Vec<u64> = counters.iter().map(|c| c.load(Ordering::SeqCst)).collect();
    let max = *counts.iter().max().unwrap();
    let min = *counts.iter().min().unwrap();
    assert!(min > 0, "every coroutine should have made progress: {counts:?}");
    assert!(
        (max as f64) <= (min as f64) * 1.2,
        "counts should stay within +/-20% of one another: {counts:?}"
    );

    rt.shutdown();
}

extern "C" fn fibonacci_loop(blob: *const u8) -> *mut u8 {
    unsafe {
        let iterations = &*(read_u64(blob, 0) as *const AtomicU64);
        let (mut a, mut b) = (0u64, 1u64);
        loop {
            let next = a.wrapping_add(b);
            a = b;
            b = next;
            iterations.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[test]
fn fibonacci_coroutine_progresses_past_ten_iterations_quickly() {
    let rt = Runtime::init(RuntimeConfig::new().with_worker_count(1));
    let iterations = Box::new(AtomicU64::new(0));
    let args = [(iterations.as_ref() as *const AtomicU64 as u64, 8)];
    rt.submit("progress:fibonacci", fibonacci_loop, &args).unwrap();

    std::thread::sleep(Duration::from_millis(250));
    assert!(
        iterations.load(Ordering::SeqCst) >= 10,
        "expected at least 10 iterations, saw {}",
        iterations.load(Ordering::SeqCst)
    );

    rt.shutdown();
}

static ARG_CHECK_OK: AtomicBool = AtomicBool::new(false);

extern "C" fn arg_check(blob: *const u8) -> *mut u8 {
    unsafe {
        let a = *blob as u64;
        let mut two = [0u8; 2];
        two.copy_from_slice(std::slice::from_raw_parts(blob.add(1), 2));
        let b = u16::from_ne_bytes(two) as u64;
        let mut four = [0u8; 4];
        four.copy_from_slice(std::slice::from_raw_parts(blob.add(3), 4));
        let c = u32::from_ne_bytes(four) as u64;
        let d = read_u64(blob, 7);
        if a == 0x11 && b == 0x2222 && c == 0x33333333 && d == 0x4444444444444444 {
            ARG_CHECK_OK.store(true, Ordering::SeqCst);
        }
    }
    std::ptr::null_mut()
}

#[test]
fn argument_blob_round_trips_literal_values_zero_extended() {
    let rt = Runtime::init(RuntimeConfig::new().with_worker_count(1));
    let args = [
        (0x11, 1),
        (0x2222, 2),
        (0x33333333, 4),
        (0x4444444444444444, 8),
    ];
    rt.submit("args:check", arg_check, &args).unwrap();

    std::thread::sleep(Duration::from_millis(50));
    assert!(ARG_CHECK_OK.load(Ordering::SeqCst));

    rt.shutdown();
}

extern "C" fn short_loop(_: *const u8) -> *mut u8 {
    let mut acc = 0u64;
    for i in 0..10_000u64 {
        acc = acc.wrapping_add(i);
    }
    std::hint::black_box(acc);
    std::ptr::null_mut()
}

#[test]
fn shutdown_after_short_lived_coroutine_does_not_deadlock() {
    let rt = Runtime::init(RuntimeConfig::new().with_worker_count(1));
    rt.submit("shutdown:short", short_loop, &[]).unwrap();
    std::thread::sleep(Duration::from_millis(50));
    assert!(rt.shutdown());
}

extern "C" fn tight_loop(_: *const u8) -> *mut u8 {
    loop {
        std::hint::black_box(0);
    }
}

#[test]
fn long_running_coroutine_is_preempted_repeatedly() {
    let baseline = coro_rt::preemption_count();
    let rt = Runtime::init(RuntimeConfig::new().with_worker_count(1));
    rt.submit("preempt:tight-a", tight_loop, &[]).unwrap();
    rt.submit("preempt:tight-b", tight_loop, &[]).unwrap();

    std::thread::sleep(Duration::from_millis(150));
    let observed = coro_rt::preemption_count() - baseline;
    assert!(
        observed >= 3,
        "expected at least 3 preemptions within 150ms, saw {observed}"
    );

    rt.shutdown();
}

#[test]
fn shorter_configured_quantum_yields_more_preemptions() {
    let baseline = coro_rt::preemption_count();
    let rt = Runtime::init(
        RuntimeConfig::new()
            .with_worker_count(1)
            .with_quantum(Duration::from_millis(2)),
    );
    rt.submit("preempt:quick-a", tight_loop, &[]).unwrap();
    rt.submit("preempt:quick-b", tight_loop, &[]).unwrap();

    std::thread::sleep(Duration::from_millis(150));
    let observed = coro_rt::preemption_count() - baseline;
    assert!(
        observed >= 20,
        "a 2ms quantum over 150ms should preempt far more than the 20ms default, saw {observed}"
    );

    rt.shutdown();
}

extern "C" fn immediate_done(_: *const u8) -> *mut u8 {
    std::ptr::null_mut()
}

#[test]
fn done_coroutines_are_reclaimed_without_leaking() {
    const BATCH: u64 = 1000;
    let before = stack_drop_count();
    let rt = Runtime::init(RuntimeConfig::new().with_worker_count(2));
    for i in 0..BATCH {
        rt.submit(format!("done:{i}"), immediate_done, &[]).unwrap();
    }

    std::thread::sleep(Duration::from_millis(200));
    let dropped = stack_drop_count() - before;
    assert_eq!(
        dropped, BATCH,
        "expected all {BATCH} done coroutines' stacks to be freed, saw {dropped}"
    );

    rt.shutdown();
}
