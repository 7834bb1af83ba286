//! Event ordering and cancellation with both queue backends.

use std::cell::RefCell;
use std::rc::Rc;

use lockstep::kernel::{ContextId, Kernel, KernelInit};
use lockstep::queue::{BucketOrder, QueueKind};
use lockstep::time::VirtualTime;

fn kernels() -> Vec<Kernel> {
    vec![
        Kernel::new(),
        KernelInit::new()
            .queue(QueueKind::Calendar {
                order: BucketOrder::Descending,
            })
            .init(),
        KernelInit::new()
            .calendar_layout(64, 3)
            .init(),
        KernelInit::new().queue(QueueKind::Heap).init(),
    ]
}

/// A chain of self-rescheduling events, some of which cancel their
/// successor.
#[test]
fn kernel_periodic_chain_with_cancellation() {
    for mut kernel in kernels() {
        let log = Rc::new(RefCell::new(Vec::new()));

        fn tick(kernel: &mut Kernel, log: Rc<RefCell<Vec<u64>>>) {
            let now = kernel.now().as_ticks();
            log.borrow_mut().push(now);
            if now >= 100 {
                return;
            }

            let l = log.clone();
            let next = kernel.schedule(7, move |k| tick(k, l));
            if now % 3 == 0 {
                // Replaced by an event one tick later.
                kernel.cancel(&next);
                kernel.schedule(8, move |k| tick(k, log));
            }
        }

        let l = log.clone();
        kernel.schedule_now(move |k| tick(k, l));
        kernel.run().unwrap();

        let mut expected = vec![0];
        let mut t = 0;
        while t < 100 {
            t += if t % 3 == 0 { 8 } else { 7 };
            expected.push(t);
        }
        assert_eq!(*log.borrow(), expected);
        assert_eq!(kernel.event_count(), expected.len() as u64);
        assert_eq!(kernel.pending(), 0);
    }
}

/// Many events scheduled at random times come out sorted, with ties in
/// submission order.
#[test]
fn kernel_many_events_sorted() {
    for mut kernel in kernels() {
        let log = Rc::new(RefCell::new(Vec::new()));

        // A simple LCG is enough to spread timestamps.
        let mut state: u64 = 0x2545_f491_4f6c_dd1d;
        for id in 0..2000u64 {
            state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
            let delay = (state >> 33) % 500;
            let log = log.clone();
            kernel.schedule(delay, move |k| log.borrow_mut().push((k.now().as_ticks(), id)));
        }
        kernel.run().unwrap();

        let log = log.borrow();
        assert_eq!(log.len(), 2000);
        assert!(log.windows(2).all(|w| w[0] < w[1]));
    }
}

#[test]
fn kernel_step_and_peek() {
    let mut kernel = Kernel::new();

    let cancelled = kernel.schedule(1, |_| {});
    kernel.schedule_with_context(ContextId::new(2), 4, |_| {});
    kernel.cancel(&cancelled);

    assert_eq!(kernel.peek_next_time(), Some(VirtualTime::from_ticks(4)));
    assert_eq!(kernel.pending(), 1);
    assert!(kernel.step().unwrap());
    assert_eq!(kernel.now().as_ticks(), 4);
    assert!(!kernel.step().unwrap());
    assert_eq!(kernel.peek_next_time(), None);
}

#[test]
fn kernel_maximum_time() {
    let mut kernel = Kernel::new();
    let max = kernel.maximum_time();

    let handle = kernel.schedule(max.as_ticks(), |k| k.stop());
    assert_eq!(handle.time(), VirtualTime::MAX);
    kernel.run().unwrap();
    assert_eq!(kernel.now(), VirtualTime::MAX);
}
