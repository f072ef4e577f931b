//! A single coroutine computing Fibonacci numbers, printing each one as it
//! goes, running alongside the runtime's own worker and monitor threads.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use coro_rt::{Runtime, RuntimeConfig};

extern "C" fn fibonacci(blob: *const u8) -> *mut u8 {
    let count = unsafe {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(std::slice::from_raw_parts(blob, 8));
        u64::from_ne_bytes(bytes) as *const AtomicU64
    };
    let count = unsafe { &*count };

    let (mut a, mut b) = (0u64, 1u64);
    for _ in 0..30 {
        println!("fib = {a}");
        let next = a.wrapping_add(b);
        a = b;
        b = next;
        count.fetch_add(1, Ordering::Relaxed);
    }
    std::ptr::null_mut()
}

fn main() {
    env_logger::init();

    let runtime = Runtime::init(RuntimeConfig::new().with_worker_count(1));
    let printed = Box::new(AtomicU64::new(0));
    let args = [(printed.as_ref() as *const AtomicU64 as u64, 8)];
    runtime
        .submit("demo:fibonacci", fibonacci, &args)
        .expect("fibonacci coroutine has only well-sized arguments");

    std::thread::sleep(Duration::from_millis(200));
    println!("printed {} fibonacci numbers", printed.load(Ordering::Relaxed));

    runtime.shutdown();
}
