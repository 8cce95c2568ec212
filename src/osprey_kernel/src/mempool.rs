//! Fixed-block memory pools
//!
//! A memory pool hands out fixed-size blocks carved from caller-provided
//! storage. Free blocks are threaded into an intrusive free list (the first
//! word of a free block stores the link). A task that finds the pool empty
//! may block; a returned block is then handed directly to the first waiter
//! through its wait payload, without ever touching the free list.
use core::{fmt, mem::MaybeUninit, ptr::NonNull};

use crate::{
    error::{PollError, UpdateError, WaitError, WaitTimeoutError},
    klock, object, state, task, timeout,
    wait::{self, QueueOrder, WaitPayload, WaitQueue},
    KernelTraits, UTicks,
};

#[cfg(feature = "alloc")]
use crate::error::CreateError;

/// A reference to a memory block managed by a [`MemPoolCb`].
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockRef(NonNull<u8>);

// Safety: The pointee is plain storage owned by the pool
unsafe impl Send for BlockRef {}
unsafe impl Sync for BlockRef {}

impl fmt::Debug for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("BlockRef").field(&self.0).finish()
    }
}

const WORD: usize = core::mem::size_of::<usize>();

/// *Memory pool control block* - the state data of a memory pool.
pub struct MemPoolCb<Traits: KernelTraits> {
    /// The head of the intrusive free list.
    pub(super) free: klock::CpuLockCell<Traits, Option<BlockRef>>,

    /// The size of each block, in words.
    block_words: usize,

    pub(super) wait_queue: WaitQueue<Traits>,

    /// The backing storage, if it was allocated by `create`.
    #[cfg(feature = "alloc")]
    owned_storage: klock::CpuLockCell<Traits, Option<(BlockRef, usize)>>,

    res: object::ObjectRes<Traits>,
}

impl<Traits: KernelTraits> MemPoolCb<Traits> {
    /// Construct a `MemPoolCb` for blocks of (at least) `block_size` bytes.
    /// The pool is initially empty; use [`Self::bind`] to donate storage.
    pub const fn new(block_size: usize) -> Self {
        assert!(block_size > 0);

        // Round the block size up to a whole number of words; a free block
        // must be able to store the free-list link
        let block_words = (block_size + WORD - 1) / WORD;

        Self {
            free: klock::CpuLockCell::new(None),
            block_words,
            wait_queue: WaitQueue::new(QueueOrder::TaskPriority),
            #[cfg(feature = "alloc")]
            owned_storage: klock::CpuLockCell::new(None),
            res: object::ObjectRes::new(),
        }
    }

    /// The size of each block, in bytes.
    pub const fn block_size(&self) -> usize {
        self.block_words * WORD
    }

    /// Carve `storage` into blocks and donate them all to the pool. Returns
    /// the number of blocks gained.
    pub fn bind(
        &'static self,
        storage: &'static mut [MaybeUninit<usize>],
    ) -> Result<usize, UpdateError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.res.expect_live(&lock);

        let mut count = 0;
        for chunk in storage.chunks_exact_mut(self.block_words) {
            // Safety: A slice pointer is non-null
            let block = BlockRef(unsafe {
                NonNull::new_unchecked(chunk.as_mut_ptr() as *mut u8)
            });
            give_core(self, lock.borrow_mut(), block);
            count += 1;
        }

        if count != 0 {
            task::unlock_cpu_and_check_preemption(lock);
        }

        Ok(count)
    }

    /// Take a block, blocking until one is available.
    pub fn take(&'static self) -> Result<NonNull<u8>, WaitError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;
        self.res.expect_live(&lock);

        if let Some(block) = pop_free(self, lock.borrow_mut()) {
            return Ok(block.0);
        }

        self.wait_queue
            .wait(lock.borrow_mut(), WaitPayload::MemPool { block: None })?;

        Ok(delivered_block::<Traits>(lock.borrow_mut()))
    }

    /// Take a block, giving up after the specified number of ticks.
    pub fn take_timeout(&'static self, delay: UTicks) -> Result<NonNull<u8>, WaitTimeoutError> {
        let time32 = timeout::checked_delay(delay)?;
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;
        self.res.expect_live(&lock);

        if let Some(block) = pop_free(self, lock.borrow_mut()) {
            return Ok(block.0);
        }

        self.wait_queue.wait_timeout(
            lock.borrow_mut(),
            WaitPayload::MemPool { block: None },
            time32,
        )?;

        Ok(delivered_block::<Traits>(lock.borrow_mut()))
    }

    /// Take a block only if one is available now.
    pub fn poll(&'static self) -> Result<NonNull<u8>, PollError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.res.expect_live(&lock);

        pop_free(self, lock.borrow_mut())
            .map(|block| block.0)
            .ok_or(PollError::Timeout)
    }

    /// Return a block to the pool, or hand it directly to the first waiting
    /// task.
    ///
    /// This service is interrupt-safe.
    ///
    /// # Safety
    ///
    /// `block` must have been obtained from this pool (through
    /// [`Self::take`] and friends) and must not be used after this call.
    pub unsafe fn give(&'static self, block: NonNull<u8>) -> Result<(), UpdateError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.res.expect_live(&lock);

        if give_core(self, lock.borrow_mut(), BlockRef(block)) {
            task::unlock_cpu_and_check_preemption(lock);
        }
        Ok(())
    }

    /// Wake up all waiting tasks with `Stopped`.
    pub fn kill(&'static self) -> Result<(), UpdateError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.res.expect_live(&lock);

        if self.wait_queue.wake_up_all_stopped(lock.borrow_mut()) {
            task::unlock_cpu_and_check_preemption(lock);
        }
        Ok(())
    }
}

#[cfg(feature = "alloc")]
impl<Traits: KernelTraits> MemPoolCb<Traits> {
    /// Allocate and construct a memory pool holding `block_count` blocks of
    /// `block_size` bytes.
    pub fn create(block_count: usize, block_size: usize) -> Result<&'static Self, CreateError> {
        let mut lock = klock::lock_cpu::<Traits>()?;

        let pool: &'static Self =
            object::allocate_value(Self::new(block_size)).ok_or(CreateError::NoMemory)?;

        let storage_size = pool.block_words * WORD * block_count;
        let storage = match object::allocate_bytes(storage_size, WORD) {
            Some(storage) => storage,
            None => {
                // Safety: `pool` was just allocated above
                unsafe { object::deallocate_value(pool) };
                return Err(CreateError::NoMemory);
            }
        };

        pool.res.mark_owned(&mut lock);
        pool.owned_storage
            .replace(&mut *lock, Some((BlockRef(storage), storage_size)));

        for i in 0..block_count {
            // Safety: `i * block_size()` is within the allocation
            let block = BlockRef(unsafe {
                NonNull::new_unchecked(storage.as_ptr().add(i * pool.block_size()))
            });
            give_core(pool, lock.borrow_mut(), block);
        }

        Ok(pool)
    }

    /// Kill the pool and release its storage.
    ///
    /// # Safety
    ///
    /// There must be no other references to the pool in use, and no blocks
    /// taken from the pool may be in use.
    pub unsafe fn delete(&'static self) -> Result<(), UpdateError> {
        self.kill()?;

        let mut lock = klock::lock_cpu::<Traits>()?;
        self.res.release(&mut lock);
        let owned_storage = self.owned_storage.replace(&mut *lock, None);
        drop(lock);

        // Safety: The object was allocated by `create` (checked by
        // `release`), and the caller vouches for the absence of other users
        unsafe {
            if let Some((storage, storage_size)) = owned_storage {
                object::deallocate_bytes(storage.0, storage_size, WORD);
            }
            object::deallocate_value(self);
        }

        Ok(())
    }
}

impl<Traits: KernelTraits> fmt::Debug for MemPoolCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MemPoolCb")
            .field("self", &(self as *const _))
            .field("free", &self.free)
            .field("block_words", &self.block_words)
            .field("wait_queue", &self.wait_queue)
            .finish()
    }
}

/// Push a block onto the free list.
fn push_free<Traits: KernelTraits>(
    pool: &'static MemPoolCb<Traits>,
    mut lock: klock::CpuLockGuardBorrowMut<'_, Traits>,
    block: BlockRef,
) {
    let head = pool.free.replace(&mut *lock, Some(block));
    // Safety: A block is at least one word large and suitably aligned, and
    // the kernel has exclusive access to it while it's free
    unsafe { (block.0.as_ptr() as *mut Option<BlockRef>).write(head) };
}

/// Pop a block off the free list.
fn pop_free<Traits: KernelTraits>(
    pool: &'static MemPoolCb<Traits>,
    mut lock: klock::CpuLockGuardBorrowMut<'_, Traits>,
) -> Option<BlockRef> {
    let head = pool.free.get(&*lock)?;
    // Safety: See `push_free`
    let next = unsafe { (head.0.as_ptr() as *const Option<BlockRef>).read() };
    pool.free.replace(&mut *lock, next);
    Some(head)
}

/// Donate a block: hand it to the first waiting task, or push it onto the
/// free list. Returns `true` if a task was woken up.
fn give_core<Traits: KernelTraits>(
    pool: &'static MemPoolCb<Traits>,
    mut lock: klock::CpuLockGuardBorrowMut<'_, Traits>,
    block: BlockRef,
) -> bool {
    if let Some(waiter) = pool.wait_queue.dequeue_first(lock.borrow_mut()) {
        wait::set_payload(
            &mut lock,
            waiter,
            WaitPayload::MemPool { block: Some(block) },
        );
        wait::finish_dequeued(lock, waiter, Ok(0));
        true
    } else {
        push_free(pool, lock, block);
        false
    }
}

/// Fetch the block a donor deposited into the running task's wait payload.
fn delivered_block<Traits: KernelTraits>(
    mut lock: klock::CpuLockGuardBorrowMut<'_, Traits>,
) -> NonNull<u8> {
    let task = Traits::state().running_task(&lock).unwrap();
    match wait::current_payload(&lock, task) {
        WaitPayload::MemPool { block: Some(block) } => block.0,
        // The wake-upper always deposits a block before waking us
        _ => unreachable!(),
    }
}

#[cfg(test)]
pub(crate) fn block_ref_for_test(ptr: NonNull<u8>) -> BlockRef {
    BlockRef(ptr)
}
