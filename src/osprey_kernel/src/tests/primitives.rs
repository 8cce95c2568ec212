//! Semaphores, flag groups, fast mutexes, and memory pools.
use super::harness::*;
use crate::{
    error::{PollError, SignalSemaphoreError, TryLockMutexError, UnlockMutexError, WaitAbort},
    wait::WaitPayload,
    FastMutexCb, FlagCb, FlagWaitMode, MemPoolCb, SemaphoreCb, TaskAttr, TaskCb,
};

#[test]
fn semaphore_counting() {
    define_system!();

    static TASK: TaskCb<SystemTraits> = TaskCb::new(&TaskAttr::new(noop_entry, 0, NULL_STACK, 3));
    static SEM: SemaphoreCb<SystemTraits> = SemaphoreCb::new(2, 3);

    TASK.activate().unwrap();
    start_kernel::<SystemTraits>();

    SEM.poll_one().unwrap();
    SEM.poll_one().unwrap();
    assert_eq!(SEM.poll_one(), Err(PollError::Timeout));

    SEM.signal(3).unwrap();
    assert_eq!(SEM.get(), Ok(3));

    // The counter is bounded
    assert_eq!(SEM.signal(1), Err(SignalSemaphoreError::QueueOverflow));
}

#[test]
fn semaphore_hands_permit_to_waiter() {
    define_system!();

    static TASK_A: TaskCb<SystemTraits> = TaskCb::new(&TaskAttr::new(noop_entry, 0, NULL_STACK, 3));
    static TASK_B: TaskCb<SystemTraits> = TaskCb::new(&TaskAttr::new(noop_entry, 0, NULL_STACK, 4));
    static SEM: SemaphoreCb<SystemTraits> = SemaphoreCb::binary(false);

    TASK_A.activate().unwrap();
    TASK_B.activate().unwrap();
    start_kernel::<SystemTraits>();

    assert_current(&TASK_A);
    block_current_on_queue(&SEM.wait_queue, WaitPayload::Semaphore, None);
    assert_current(&TASK_B);

    SEM.signal_one().unwrap();

    // The permit went straight to the waiter; the counter never moved
    assert_eq!(wait_result(&TASK_A), Ok(0));
    assert_eq!(SEM.get(), Ok(0));
    assert_current(&TASK_A);
}

#[test]
fn semaphore_kill_drains_all_waiters() {
    define_system!();

    static TASKS: [TaskCb<SystemTraits>; 3] = [
        TaskCb::new(&TaskAttr::new(noop_entry, 0, NULL_STACK, 4)),
        TaskCb::new(&TaskAttr::new(noop_entry, 1, NULL_STACK, 4)),
        TaskCb::new(&TaskAttr::new(noop_entry, 2, NULL_STACK, 4)),
    ];
    static SEM: SemaphoreCb<SystemTraits> = SemaphoreCb::new(0, 8);

    for task in &TASKS {
        task.activate().unwrap();
    }
    start_kernel::<SystemTraits>();

    for task in &TASKS {
        assert_current(task);
        block_current_on_queue(&SEM.wait_queue, WaitPayload::Semaphore, None);
    }
    assert!(current::<SystemTraits>().is_none());

    SEM.kill().unwrap();

    // Every waiter was woken with `Stopped` and the queue is empty
    for task in &TASKS {
        assert_eq!(wait_result(task), Err(WaitAbort::Stopped));
    }
    with_lock::<SystemTraits, _>(|lock| {
        assert!(SEM.wait_queue.is_empty(lock.borrow_mut()));
    });
}

#[test]
fn flag_poll_modes() {
    define_system!();

    static TASK: TaskCb<SystemTraits> = TaskCb::new(&TaskAttr::new(noop_entry, 0, NULL_STACK, 3));
    static FLAG: FlagCb<SystemTraits> = FlagCb::new();

    TASK.activate().unwrap();
    start_kernel::<SystemTraits>();

    FLAG.set(0b0101).unwrap();

    // ANY is satisfied by a single bit
    assert_eq!(FLAG.poll(0b0001, FlagWaitMode::empty()), Ok(0b0101));

    // ALL requires every requested bit
    assert_eq!(
        FLAG.poll(0b0111, FlagWaitMode::ALL),
        Err(PollError::Timeout)
    );
    FLAG.set(0b0010).unwrap();
    assert_eq!(FLAG.poll(0b0111, FlagWaitMode::ALL), Ok(0b0111));

    // CLEAR consumes the bits it matched
    assert_eq!(
        FLAG.poll(0b0100, FlagWaitMode::CLEAR),
        Ok(0b0111)
    );
    assert_eq!(FLAG.get(), Ok(0b0011));

    FLAG.clear(0b0001).unwrap();
    assert_eq!(FLAG.get(), Ok(0b0010));
}

#[test]
fn flag_wakes_satisfied_waiters() {
    define_system!();

    static TASK_A: TaskCb<SystemTraits> = TaskCb::new(&TaskAttr::new(noop_entry, 0, NULL_STACK, 3));
    static TASK_B: TaskCb<SystemTraits> = TaskCb::new(&TaskAttr::new(noop_entry, 0, NULL_STACK, 4));
    static TASK_C: TaskCb<SystemTraits> = TaskCb::new(&TaskAttr::new(noop_entry, 0, NULL_STACK, 5));
    static FLAG: FlagCb<SystemTraits> = FlagCb::new();

    TASK_A.activate().unwrap();
    TASK_B.activate().unwrap();
    TASK_C.activate().unwrap();
    start_kernel::<SystemTraits>();

    // A waits for both of 0b11; B waits for any of 0b10
    assert_current(&TASK_A);
    block_current_on_queue(
        &FLAG.wait_queue,
        WaitPayload::Flags {
            bits: 0b11,
            mode: FlagWaitMode::ALL,
        },
        None,
    );
    assert_current(&TASK_B);
    block_current_on_queue(
        &FLAG.wait_queue,
        WaitPayload::Flags {
            bits: 0b10,
            mode: FlagWaitMode::empty(),
        },
        None,
    );
    assert_current(&TASK_C);

    // 0b01 satisfies neither waiter
    FLAG.set(0b01).unwrap();
    assert_current(&TASK_C);

    // 0b10 satisfies both; each sees the full pre-clear pattern
    FLAG.set(0b10).unwrap();
    assert_eq!(wait_result(&TASK_A), Ok(0b11));
    assert_eq!(wait_result(&TASK_B), Ok(0b11));
    assert_current(&TASK_A);
}

#[test]
fn fast_mutex_basics() {
    define_system!();

    static TASK: TaskCb<SystemTraits> = TaskCb::new(&TaskAttr::new(noop_entry, 0, NULL_STACK, 3));
    static MUT: FastMutexCb<SystemTraits> = FastMutexCb::new();

    TASK.activate().unwrap();
    start_kernel::<SystemTraits>();

    assert_eq!(MUT.unlock(), Err(UnlockMutexError::NotOwner));

    MUT.try_lock().unwrap();
    assert_eq!(MUT.is_locked(), Ok(true));

    // No recursion on a fast mutex
    assert_eq!(MUT.try_lock(), Err(TryLockMutexError::WouldDeadlock));

    MUT.unlock().unwrap();
    assert_eq!(MUT.is_locked(), Ok(false));
}

#[test]
fn fast_mutex_passes_ownership_in_fifo_order() {
    define_system!();

    static TASK_A: TaskCb<SystemTraits> = TaskCb::new(&TaskAttr::new(noop_entry, 0, NULL_STACK, 3));
    static TASK_B: TaskCb<SystemTraits> = TaskCb::new(&TaskAttr::new(noop_entry, 0, NULL_STACK, 4));
    static TASK_C: TaskCb<SystemTraits> = TaskCb::new(&TaskAttr::new(noop_entry, 0, NULL_STACK, 4));
    static MUT: FastMutexCb<SystemTraits> = FastMutexCb::new();

    TASK_A.activate().unwrap();
    TASK_B.activate().unwrap();
    TASK_C.activate().unwrap();
    start_kernel::<SystemTraits>();

    assert_current(&TASK_A);
    MUT.try_lock().unwrap();

    // B and then C block on the mutex
    TASK_A.set_priority(6).unwrap();
    assert_current(&TASK_B);
    block_current_on_queue(&MUT.wait_queue, WaitPayload::FastMutex, None);
    assert_current(&TASK_C);
    block_current_on_queue(&MUT.wait_queue, WaitPayload::FastMutex, None);
    assert_current(&TASK_A);

    // Ownership passes to the longest-waiting task, not the counterless
    // free state
    MUT.unlock().unwrap();
    assert_eq!(wait_result(&TASK_B), Ok(0));
    with_lock::<SystemTraits, _>(|lock| {
        assert!(core::ptr::eq(
            MUT.owning_task.get(&**lock).unwrap(),
            &TASK_B
        ));
    });
    assert_current(&TASK_B);

    MUT.unlock().unwrap();
    assert_eq!(wait_result(&TASK_C), Ok(0));
    assert_current(&TASK_C);

    MUT.unlock().unwrap();
    assert_eq!(MUT.is_locked(), Ok(false));
}

#[test]
fn mempool_take_and_give() {
    define_system!();

    static TASK: TaskCb<SystemTraits> = TaskCb::new(&TaskAttr::new(noop_entry, 0, NULL_STACK, 3));
    static POOL: MemPoolCb<SystemTraits> = MemPoolCb::new(12);
    static STORAGE: crate::utils::RawCell<[core::mem::MaybeUninit<usize>; 8]> =
        crate::utils::RawCell::new([core::mem::MaybeUninit::new(0); 8]);

    TASK.activate().unwrap();
    start_kernel::<SystemTraits>();

    // 12 bytes round up to two words; 8 words of storage make 4 blocks
    // (on a 64-bit host)
    let blocks_per_chunk = POOL.block_size() / core::mem::size_of::<usize>();
    let expect = 8 / blocks_per_chunk;

    // Safety: The cell is handed to the pool once and never touched again
    let storage: &'static mut [core::mem::MaybeUninit<usize>; 8] = unsafe { &mut *STORAGE.get() };
    assert_eq!(POOL.bind(storage), Ok(expect));

    let a = POOL.poll().unwrap();
    let b = POOL.poll().unwrap();
    assert_ne!(a, b);

    // Safety: `a` and `b` came from this pool
    unsafe {
        POOL.give(a).unwrap();
        POOL.give(b).unwrap();
    }

    for _ in 0..expect {
        POOL.poll().unwrap();
    }
    assert_eq!(POOL.poll(), Err(PollError::Timeout));
}

#[test]
fn mempool_donates_block_to_waiter() {
    define_system!();

    static TASK_A: TaskCb<SystemTraits> = TaskCb::new(&TaskAttr::new(noop_entry, 0, NULL_STACK, 3));
    static TASK_B: TaskCb<SystemTraits> = TaskCb::new(&TaskAttr::new(noop_entry, 0, NULL_STACK, 4));
    static POOL: MemPoolCb<SystemTraits> = MemPoolCb::new(8);
    static STORAGE: crate::utils::RawCell<[core::mem::MaybeUninit<usize>; 1]> =
        crate::utils::RawCell::new([core::mem::MaybeUninit::new(0); 1]);

    TASK_A.activate().unwrap();
    TASK_B.activate().unwrap();
    start_kernel::<SystemTraits>();

    // Safety: The cell is handed to the pool once and never touched again
    let storage: &'static mut [core::mem::MaybeUninit<usize>; 1] = unsafe { &mut *STORAGE.get() };
    POOL.bind(storage).unwrap();

    let block = POOL.poll().unwrap();

    // A blocks waiting for a block
    assert_current(&TASK_A);
    block_current_on_queue(
        &POOL.wait_queue,
        WaitPayload::MemPool { block: None },
        None,
    );
    assert_current(&TASK_B);

    // Returning the block hands it straight to A
    // Safety: `block` came from this pool
    unsafe { POOL.give(block).unwrap() };
    assert_eq!(wait_result(&TASK_A), Ok(0));
    with_lock::<SystemTraits, _>(|lock| {
        match crate::wait::current_payload(&**lock, &TASK_A) {
            WaitPayload::MemPool { block: Some(b) } => {
                assert_eq!(b, crate::mempool::block_ref_for_test(block));
            }
            payload => panic!("unexpected payload: {payload:?}"),
        }
    });

    // The free list stayed empty - the block bypassed it
    assert_eq!(POOL.poll(), Err(PollError::Timeout));
}
