//! Teardown events and kernel lifecycle.

use std::cell::RefCell;
use std::rc::Rc;

use lockstep::kernel::{ContextId, Kernel, KernelState};

#[test]
fn kernel_teardown_events_in_registration_order() {
    let mut kernel = Kernel::new();
    let log = Rc::new(RefCell::new(Vec::new()));

    let l = log.clone();
    kernel.schedule_with_context(ContextId::new(1), 5, move |k| {
        let l = l.clone();
        k.schedule_at_teardown(move |k| l.borrow_mut().push(("a", k.current_context())));
    });
    let l = log.clone();
    let cancelled = kernel.schedule_at_teardown(move |_| l.borrow_mut().push(("b", ContextId::NONE)));
    let l = log.clone();
    let removed = kernel.schedule_at_teardown(move |_| l.borrow_mut().push(("c", ContextId::NONE)));
    let l = log.clone();
    kernel.schedule_at_teardown(move |k| l.borrow_mut().push(("d", k.current_context())));
    // Never reached.
    kernel.schedule(100, |_| panic!("event invoked after stop"));
    kernel.stop_after(10);

    assert!(cancelled.is_teardown());
    assert_eq!(kernel.delay_left(&cancelled), 0);
    kernel.cancel(&cancelled);
    assert!(kernel.remove(&removed));

    kernel.run().unwrap();
    assert!(log.borrow().is_empty());
    assert_eq!(kernel.pending(), 1);

    kernel.teardown();

    assert_eq!(
        *log.borrow(),
        vec![("d", ContextId::NONE), ("a", ContextId::new(1))]
    );
    assert_eq!(kernel.state(), KernelState::TornDown);
    assert_eq!(kernel.pending(), 0);
}

#[test]
#[should_panic]
fn kernel_run_after_teardown() {
    let mut kernel = Kernel::new();

    kernel.teardown();
    let _ = kernel.run();
}

#[test]
fn kernel_handles_expire_at_teardown() {
    let mut kernel = Kernel::new();

    let timed = kernel.schedule(3, |_| {});
    let teardown = kernel.schedule_at_teardown(|_| {});
    assert!(!kernel.is_expired(&timed));
    assert!(!kernel.is_expired(&teardown));

    kernel.teardown();

    assert!(kernel.is_expired(&timed));
    assert!(kernel.is_expired(&teardown));
}
