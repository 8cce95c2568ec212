//! Scheduler behavior: priority discipline, FIFO ordering, round-robin,
//! suspension, and the idle state.
use super::harness::*;
use crate::{
    error::WaitAbort,
    task::TaskSt,
    wait::WaitPayload,
    EventCb, Kernel, TaskAttr, TaskCb,
};

#[test]
fn boots_idle_without_tasks() {
    define_system!();

    start_kernel::<SystemTraits>();
    assert!(current::<SystemTraits>().is_none());
}

#[test]
fn highest_priority_task_runs() {
    define_system!();

    static TASK_L: TaskCb<SystemTraits> = TaskCb::new(&TaskAttr::new(noop_entry, 0, NULL_STACK, 5));
    static TASK_H: TaskCb<SystemTraits> = TaskCb::new(&TaskAttr::new(noop_entry, 0, NULL_STACK, 2));

    TASK_L.activate().unwrap();
    start_kernel::<SystemTraits>();
    assert_current(&TASK_L);

    // Activating a more urgent task preempts the running one
    TASK_H.activate().unwrap();
    assert_current(&TASK_H);

    // The preempted task went back to Ready
    with_lock::<SystemTraits, _>(|lock| {
        assert_eq!(*TASK_L.st.read(&**lock), TaskSt::Ready);
    });
}

#[test]
fn equal_priority_does_not_preempt() {
    define_system!();

    static TASK_A: TaskCb<SystemTraits> = TaskCb::new(&TaskAttr::new(noop_entry, 0, NULL_STACK, 5));
    static TASK_B: TaskCb<SystemTraits> = TaskCb::new(&TaskAttr::new(noop_entry, 0, NULL_STACK, 5));

    TASK_A.activate().unwrap();
    start_kernel::<SystemTraits>();
    TASK_B.activate().unwrap();

    // Same priority: B waits for A to yield
    assert_current(&TASK_A);

    SystemTraits::yield_now().unwrap();
    assert_current(&TASK_B);

    SystemTraits::yield_now().unwrap();
    assert_current(&TASK_A);
}

#[test]
fn wakeup_is_fifo_within_priority() {
    define_system!();

    static TASKS: [TaskCb<SystemTraits>; 5] = [
        TaskCb::new(&TaskAttr::new(noop_entry, 0, NULL_STACK, 4)),
        TaskCb::new(&TaskAttr::new(noop_entry, 1, NULL_STACK, 4)),
        TaskCb::new(&TaskAttr::new(noop_entry, 2, NULL_STACK, 4)),
        TaskCb::new(&TaskAttr::new(noop_entry, 3, NULL_STACK, 4)),
        TaskCb::new(&TaskAttr::new(noop_entry, 4, NULL_STACK, 4)),
    ];
    static EVT: EventCb<SystemTraits> = EventCb::new();
    static EVT2: EventCb<SystemTraits> = EventCb::new();

    for task in &TASKS {
        task.activate().unwrap();
    }
    start_kernel::<SystemTraits>();

    // Each task runs in activation order and blocks on the event
    for task in &TASKS {
        assert_current(task);
        block_current_on_queue(&EVT.wait_queue, WaitPayload::Event, None);
    }
    assert!(current::<SystemTraits>().is_none());

    // A broadcast wakes all of them, delivering the event word
    EVT.give(42).unwrap();
    for task in &TASKS {
        assert_eq!(wait_result(task), Ok(42));
    }

    // They become ready - and thus run - in their original order
    for task in &TASKS {
        assert_current(task);
        block_current_on_queue(&EVT2.wait_queue, WaitPayload::Event, None);
    }
}

#[test]
fn round_robin_time_slicing() {
    define_system!(TIME_SLICE = 4);

    static TASK_X: TaskCb<SystemTraits> = TaskCb::new(&TaskAttr::new(noop_entry, 0, NULL_STACK, 3));
    static TASK_Y: TaskCb<SystemTraits> = TaskCb::new(&TaskAttr::new(noop_entry, 0, NULL_STACK, 3));

    TASK_X.activate().unwrap();
    TASK_Y.activate().unwrap();
    start_kernel::<SystemTraits>();

    let mut runtime = [0u32; 2];
    for _ in 0..40 {
        let running = current::<SystemTraits>().unwrap();
        if core::ptr::eq(running, &TASK_X) {
            runtime[0] += 1;
        } else {
            assert!(core::ptr::eq(running, &TASK_Y));
            runtime[1] += 1;
        }

        advance_time(1);
    }

    // Two equal-priority CPU-bound tasks share the processor evenly in
    // 4-tick quanta
    assert_eq!(runtime, [20, 20]);
}

#[test]
fn slice_exhaustion_does_not_cross_priority_levels() {
    define_system!(TIME_SLICE = 2);

    static TASK_H: TaskCb<SystemTraits> = TaskCb::new(&TaskAttr::new(noop_entry, 0, NULL_STACK, 1));
    static TASK_L: TaskCb<SystemTraits> = TaskCb::new(&TaskAttr::new(noop_entry, 0, NULL_STACK, 5));

    TASK_H.activate().unwrap();
    TASK_L.activate().unwrap();
    start_kernel::<SystemTraits>();

    // The more urgent task keeps running no matter how many slices expire
    for _ in 0..10 {
        assert_current(&TASK_H);
        advance_time(1);
    }
}

#[test]
fn suspend_and_resume_ready_task() {
    define_system!();

    static TASK_R: TaskCb<SystemTraits> = TaskCb::new(&TaskAttr::new(noop_entry, 0, NULL_STACK, 3));
    static TASK_B: TaskCb<SystemTraits> = TaskCb::new(&TaskAttr::new(noop_entry, 0, NULL_STACK, 5));

    TASK_R.activate().unwrap();
    TASK_B.activate().unwrap();
    start_kernel::<SystemTraits>();
    assert_current(&TASK_R);

    TASK_B.suspend().unwrap();
    with_lock::<SystemTraits, _>(|lock| {
        assert_eq!(*TASK_B.st.read(&**lock), TaskSt::Waiting);
    });

    // Suspending it again is not possible
    assert!(TASK_B.suspend().is_err());

    TASK_B.resume().unwrap();
    with_lock::<SystemTraits, _>(|lock| {
        assert_eq!(*TASK_B.st.read(&**lock), TaskSt::Ready);
    });

    // The resumed task was less urgent, so the running task is unchanged
    assert_current(&TASK_R);
}

#[test]
fn suspend_rejects_blocked_task() {
    define_system!();

    static TASK_A: TaskCb<SystemTraits> = TaskCb::new(&TaskAttr::new(noop_entry, 0, NULL_STACK, 3));
    static TASK_B: TaskCb<SystemTraits> = TaskCb::new(&TaskAttr::new(noop_entry, 0, NULL_STACK, 4));
    static EVT: EventCb<SystemTraits> = EventCb::new();

    TASK_A.activate().unwrap();
    TASK_B.activate().unwrap();
    start_kernel::<SystemTraits>();

    assert_current(&TASK_A);
    block_current_on_queue(&EVT.wait_queue, WaitPayload::Event, None);
    assert_current(&TASK_B);

    // A task blocked on an object cannot be suspended
    assert!(TASK_A.suspend().is_err());
}

#[test]
fn terminate_wakes_joiners_with_stopped() {
    define_system!();

    static TASK_A: TaskCb<SystemTraits> = TaskCb::new(&TaskAttr::new(noop_entry, 0, NULL_STACK, 4));
    static TASK_T: TaskCb<SystemTraits> = TaskCb::new(&TaskAttr::new(noop_entry, 0, NULL_STACK, 3));

    TASK_A.activate().unwrap();
    TASK_T.activate().unwrap();
    start_kernel::<SystemTraits>();

    // T (more urgent) runs first and joins A
    assert_current(&TASK_T);
    block_current_on_queue(&TASK_A.join_queue, WaitPayload::Join(&TASK_A), None);
    assert_current(&TASK_A);

    TASK_A.terminate().unwrap();

    assert_eq!(wait_result(&TASK_T), Err(WaitAbort::Stopped));
    with_lock::<SystemTraits, _>(|lock| {
        assert_eq!(*TASK_A.st.read(&**lock), TaskSt::Dormant);
    });

    // Joining a dormant task completes right away
    assert_current(&TASK_T);
    assert_eq!(TASK_A.join(), Ok(()));
}

#[test]
fn exit_wakes_joiners_with_success() {
    define_system!();

    static TASK_A: TaskCb<SystemTraits> = TaskCb::new(&TaskAttr::new(noop_entry, 0, NULL_STACK, 4));
    static TASK_T: TaskCb<SystemTraits> = TaskCb::new(&TaskAttr::new(noop_entry, 0, NULL_STACK, 3));

    TASK_A.activate().unwrap();
    TASK_T.activate().unwrap();
    start_kernel::<SystemTraits>();

    assert_current(&TASK_T);
    block_current_on_queue(&TASK_A.join_queue, WaitPayload::Join(&TASK_A), None);
    assert_current(&TASK_A);

    // The mock port's `exit_and_dispatch` panics; the kernel state is
    // already consistent by then
    let _ = std::panic::catch_unwind(|| -> () {
        unsafe { SystemTraits::exit_task() };
    });

    assert_eq!(wait_result(&TASK_T), Ok(0));
    with_lock::<SystemTraits, _>(|lock| {
        assert_eq!(*TASK_A.st.read(&**lock), TaskSt::Dormant);
    });
}

#[test]
fn restart_after_terminate() {
    define_system!();

    static TASK_A: TaskCb<SystemTraits> = TaskCb::new(&TaskAttr::new(noop_entry, 0, NULL_STACK, 4));
    static TASK_B: TaskCb<SystemTraits> = TaskCb::new(&TaskAttr::new(noop_entry, 0, NULL_STACK, 5));

    TASK_A.activate().unwrap();
    TASK_B.activate().unwrap();
    start_kernel::<SystemTraits>();
    assert_current(&TASK_A);

    // Activating a non-dormant task is an error
    assert!(TASK_A.activate().is_err());

    // Lower its priority, then kill and restart it: the priority resets
    TASK_A.set_priority(9).unwrap();
    assert_current(&TASK_B);

    TASK_A.terminate().unwrap();
    TASK_A.activate().unwrap();
    assert_eq!(TASK_A.priority(), Ok(4));
    assert_current(&TASK_A);
}

#[test]
fn task_flag_rendezvous() {
    define_system!();

    static TASK_A: TaskCb<SystemTraits> = TaskCb::new(&TaskAttr::new(noop_entry, 0, NULL_STACK, 3));
    static TASK_B: TaskCb<SystemTraits> = TaskCb::new(&TaskAttr::new(noop_entry, 0, NULL_STACK, 5));

    TASK_A.activate().unwrap();
    TASK_B.activate().unwrap();
    start_kernel::<SystemTraits>();
    assert_current(&TASK_A);

    // Flags can only be given to a task parked in the flag wait
    assert!(TASK_A.give_flags(0b1).is_err());

    // A parks, waiting for three flags
    with_lock::<SystemTraits, _>(|lock| {
        crate::wait::start_wait_no_queue(
            lock.borrow_mut(),
            WaitPayload::TaskFlags {
                wanted: 0b111,
                missing: 0b111,
            },
        );
    });
    dispatch::<SystemTraits>();
    assert_current(&TASK_B);

    // Partial deliveries keep it parked
    TASK_B.give_flags(0b1).err().unwrap();
    TASK_A.give_flags(0b1).unwrap();
    assert_current(&TASK_B);
    TASK_A.give_flags(0b10).unwrap();
    assert_current(&TASK_B);

    // The last flag completes the rendezvous; A preempts B
    TASK_A.give_flags(0b100).unwrap();
    assert_eq!(wait_result(&TASK_A), Ok(0b111));
    assert_current(&TASK_A);
}
