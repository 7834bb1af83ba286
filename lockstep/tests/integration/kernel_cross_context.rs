//! Events injected from other threads.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use lockstep::kernel::{ContextId, Kernel};
use lockstep::time::VirtualTime;

/// An injected event is merged at the kernel time of the merge, plus its
/// delay.
#[test]
fn kernel_injected_event_timing() {
    let mut kernel = Kernel::new();
    let injector = kernel.injector();
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));

    let s = seen.clone();
    kernel.schedule(10, move |_| {
        let s = s.clone();
        thread::spawn(move || {
            injector
                .schedule_with_context(ContextId::new(5), 5, move |k: &mut Kernel| {
                    s.lock()
                        .unwrap()
                        .push((k.now().as_ticks(), k.current_context()));
                })
                .unwrap();
        })
        .join()
        .unwrap();
    });
    kernel.run().unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![(15, ContextId::new(5))]);
}

#[test]
fn kernel_injection_from_many_threads() {
    const THREADS: usize = 4;
    const EVENTS_PER_THREAD: usize = 250;

    let mut kernel = Kernel::new();
    let counter = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..THREADS)
        .map(|i| {
            let injector = kernel.injector();
            let counter = counter.clone();
            thread::spawn(move || {
                for j in 0..EVENTS_PER_THREAD {
                    let counter = counter.clone();
                    injector
                        .schedule_with_context(ContextId::new(i as u32), j as u64, move |_| {
                            counter.fetch_add(1, Ordering::Relaxed);
                        })
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(!kernel.is_finished());
    kernel.run().unwrap();

    assert_eq!(counter.load(Ordering::Relaxed), THREADS * EVENTS_PER_THREAD);
    assert_eq!(kernel.now(), VirtualTime::from_ticks(EVENTS_PER_THREAD as u64 - 1));
}

#[test]
fn kernel_injection_refused_after_teardown() {
    let mut kernel = Kernel::new();
    let injector = kernel.injector();

    kernel.teardown();

    assert!(injector
        .schedule_with_context(ContextId::NONE, 0, |_| {})
        .is_err());
}
