//! Task ready queue implementation (internal use only).
//!
//! **This module is exempt from the API stability guarantee.**
use core::{fmt, ops::RangeTo};

use crate::{
    klock::{CpuLockCell, CpuLockGuardBorrowMut},
    task::TaskCb,
    utils::{
        intrusive_list::{Ident, ListAccessorCell, Static, StaticLink, StaticListHead},
        Init, PrioBitmap,
    },
    KernelCfg, KernelTraits, PortThreading, PortTimer,
};

/// Represents a task ready queue, which tracks the list of Ready tasks,
/// sorted by effective priority.
///
/// This trait is not intended to be implemented on custom types.
pub trait Queue<Traits>: Send + Sync + fmt::Debug + Init + 'static + private::Sealed {
    type PerTaskData: Send + Sync + fmt::Debug + Init + 'static;

    /// Return a flag indicating whether there's a task in the Ready state
    /// whose priority is in the specified range.
    fn has_ready_task_in_priority_range(&self, ctx: Ctx<'_, Traits>, range: RangeTo<usize>) -> bool
    where
        Traits: KernelTraits;

    /// Insert the specified task `task_cb` to the ready queue.
    ///
    /// `task_cb` will be inserted as close to the back as possible without
    /// violating the priority ordering. I.e., if there are one or more tasks
    /// having effective priorities identical to that of `task_cb`, `task_cb`
    /// will be inserted after such tasks.
    ///
    /// # Safety
    ///
    /// This method will cause an undefined behavior if `task_cb` is already
    /// included in the queue.
    unsafe fn push_back_task(&self, ctx: Ctx<'_, Traits>, task_cb: &'static TaskCb<Traits>)
    where
        Traits: KernelTraits;

    /// Choose the next task to schedule based on `prev_task_priority`, the
    /// priority of the current task (more precisely, the task that would run
    /// after the ongoing scheduling decision if preemption was not requested
    /// by this decision). If there's no such current task,
    /// `prev_task_priority` should be `usize::MAX`, in which case this
    /// method will return `SwitchTo(_)`.
    ///
    /// If this method returns `SwitchTo(Some(task))`, `task` is removed from
    /// the queue.
    fn pop_front_task(
        &self,
        ctx: Ctx<'_, Traits>,
        prev_task_priority: usize,
    ) -> ScheduleDecision<&'static TaskCb<Traits>>
    where
        Traits: KernelTraits;

    /// Reposition the specified task within the ready queue after a change
    /// in its effective priority from `old_effective_priority` to
    /// `effective_priority`.
    ///
    /// `task_cb` will be re-inserted as close to the back as possible
    /// without violating the priority ordering.
    ///
    /// # Safety
    ///
    /// This method will cause an undefined behavior if `task_cb` is not
    /// included in the queue or was lastly inserted to the queue with an
    /// effective priority that is not identical to `old_effective_priority`.
    unsafe fn reorder_task(
        &self,
        ctx: Ctx<'_, Traits>,
        task_cb: &'static TaskCb<Traits>,
        effective_priority: usize,
        old_effective_priority: usize,
    ) where
        Traits: KernelTraits;

    /// Remove the specified task from the ready queue.
    ///
    /// # Safety
    ///
    /// This method will cause an undefined behavior if `task_cb` is not
    /// included in the queue or was lastly inserted to the queue with an
    /// effective priority that is not identical to `effective_priority`.
    unsafe fn remove_task(
        &self,
        ctx: Ctx<'_, Traits>,
        task_cb: &'static TaskCb<Traits>,
        effective_priority: usize,
    ) where
        Traits: KernelTraits;
}

/// Implements the sealed trait pattern, which protects [`Queue`] against
/// downstream implementations.
mod private {
    pub trait Sealed {}
}

/// The result type of [`Queue::pop_front_task`].
pub enum ScheduleDecision<T> {
    /// The kernel should not perform a context switch and should continue to
    /// schedule the current task.
    Keep,
    /// The kernel should perform a context switch to the specified task.
    SwitchTo(Option<T>),
}

/// The context type for [`Queue`]'s methods.
pub struct Ctx<'a, Traits: KernelTraits> {
    pub(super) lock: CpuLockGuardBorrowMut<'a, Traits>,
}

impl<'a, Traits: KernelTraits> From<CpuLockGuardBorrowMut<'a, Traits>> for Ctx<'a, Traits> {
    #[inline]
    fn from(lock: CpuLockGuardBorrowMut<'a, Traits>) -> Self {
        Self { lock }
    }
}

/// The ready queue implementation that uses a set of queues segregated by
/// the priorities of contained tasks, with a bitmap indicating which of the
/// queues are non-empty.
pub struct BitmapQueue<Traits: PortThreading + PortTimer, Bitmap: 'static, const LEN: usize> {
    /// The set of segregated task ready queues, in which each queue stores
    /// the list of Ready tasks at the corresponding priority.
    ///
    /// Invariant: `queues[i].first.is_some() == bitmap.get(i)`
    queues: [CpuLockCell<Traits, StaticListHead<TaskCb<Traits>>>; LEN],

    /// The task ready bitmap, in which each bit indicates whether the
    /// segregated queue corresponding to that bit contains a task or not.
    bitmap: CpuLockCell<Traits, Bitmap>,
}

impl<Traits: PortThreading + PortTimer, Bitmap: 'static + Init, const LEN: usize> Init
    for BitmapQueue<Traits, Bitmap, LEN>
{
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        queues: Init::INIT,
        bitmap: Init::INIT,
    };
}

impl<Traits: KernelTraits, Bitmap: PrioBitmap, const LEN: usize> fmt::Debug
    for BitmapQueue<Traits, Bitmap, LEN>
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BitmapQueue")
            .field("bitmap", &self.bitmap)
            .finish_non_exhaustive()
    }
}

/// The per-task data of [`BitmapQueue`], embedded in each task control
/// block.
pub struct BitmapQueuePerTaskData<Traits: PortThreading + PortTimer> {
    link: CpuLockCell<Traits, Option<StaticLink<TaskCb<Traits>>>>,
}

impl<Traits: PortThreading + PortTimer> Init for BitmapQueuePerTaskData<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self { link: Init::INIT };
}

impl<Traits: KernelTraits> fmt::Debug for BitmapQueuePerTaskData<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BitmapQueuePerTaskData")
            .field("link", &self.link)
            .finish()
    }
}

/// Get a `ListAccessorCell` used to access a task ready queue.
macro_rules! list_accessor {
    ($head:expr, $key:expr) => {
        ListAccessorCell::new(
            $head,
            &Static,
            |task_cb: &TaskCb<Traits>| &task_cb.ready_queue_data.link,
            $key,
        )
    };
}

impl<Traits: KernelTraits, Bitmap: PrioBitmap, const LEN: usize> Queue<Traits>
    for BitmapQueue<Traits, Bitmap, LEN>
where
    Traits: KernelCfg<TaskReadyQueue = Self>,
{
    type PerTaskData = BitmapQueuePerTaskData<Traits>;

    #[inline]
    fn has_ready_task_in_priority_range(
        &self,
        Ctx { lock }: Ctx<'_, Traits>,
        range: RangeTo<usize>,
    ) -> bool {
        let highest_task_priority = self.bitmap.read(&*lock).find_set().unwrap_or(usize::MAX);
        highest_task_priority < range.end
    }

    #[inline]
    unsafe fn push_back_task(
        &self,
        Ctx { mut lock }: Ctx<'_, Traits>,
        task_cb: &'static TaskCb<Traits>,
    ) {
        // Insert the task to the ready queue for its effective priority
        //
        // Safety: `task_cb` is unlinked, so it shouldn't return
        //         `InsertError::AlreadyLinked`.
        let pri = task_cb.effective_priority.get(&*lock);
        debug_assert!(pri < LEN);
        unsafe {
            list_accessor!(&self.queues[pri], lock.borrow_mut())
                .push_back(Ident(task_cb))
                .unwrap_unchecked();
        }

        // Update `bitmap` accordingly
        self.bitmap.write(&mut *lock).set(pri);
    }

    #[inline]
    fn pop_front_task(
        &self,
        Ctx { mut lock }: Ctx<'_, Traits>,
        prev_task_priority: usize,
    ) -> ScheduleDecision<&'static TaskCb<Traits>> {
        // The priority of the next task to run.
        //
        // The default value (the value given to `unwrap_or`) must compare
        // less than `usize::MAX` so that this method returns
        // `SwitchTo(None)` - not `Keep` - when there's no current task and
        // no schedulable task. It never collides with an actual task
        // priority because of the priority range restriction imposed by
        // `KernelCfg::NUM_TASK_PRIORITY_LEVELS`.
        let next_task_priority = self.bitmap.read(&*lock).find_set().unwrap_or(usize::MAX - 1);

        if prev_task_priority <= next_task_priority {
            // Return if there's no task willing to take over the current
            // one, and the current one can still run.
            ScheduleDecision::Keep
        } else if next_task_priority < LEN {
            // Take the first task from the ready queue corresponding to
            // `next_task_priority`
            let mut accessor = list_accessor!(&self.queues[next_task_priority], lock.borrow_mut());
            // Safety: This linked list is structurally sound
            let task = unsafe { accessor.pop_front().unwrap_unchecked() };
            // There must be at least one element because the bitmap
            // indicated so
            let task = task.unwrap().0;

            // Update `bitmap` accordingly
            if accessor.is_empty() {
                self.bitmap.write(&mut *lock).clear(next_task_priority);
            }

            ScheduleDecision::SwitchTo(Some(task))
        } else {
            ScheduleDecision::SwitchTo(None)
        }
    }

    #[inline]
    unsafe fn reorder_task(
        &self,
        Ctx { mut lock }: Ctx<'_, Traits>,
        task_cb: &'static TaskCb<Traits>,
        effective_priority: usize,
        old_effective_priority: usize,
    ) {
        debug_assert_ne!(effective_priority, old_effective_priority);

        // Move the task between the segregated queues
        let old_pri_empty = {
            let mut accessor =
                list_accessor!(&self.queues[old_effective_priority], lock.borrow_mut());
            // Safety: `task_cb` is definitely linked to this list, so
            //         `remove` shouldn't return `ItemError::NotLinked`.
            unsafe { accessor.remove(Ident(task_cb)).unwrap_unchecked() };
            accessor.is_empty()
        };

        // Safety: `task_cb` is not affiliated with any of `self.queues[..]`
        //         at this point, so `push_back` shouldn't return
        //         `AlreadyLinked`.
        unsafe {
            list_accessor!(&self.queues[effective_priority], lock.borrow_mut())
                .push_back(Ident(task_cb))
                .unwrap_unchecked();
        }

        // Update `bitmap` accordingly
        // (This code assumes `effective_priority != old_effective_priority`.)
        let bitmap = self.bitmap.write(&mut *lock);
        bitmap.set(effective_priority);
        if old_pri_empty {
            bitmap.clear(old_effective_priority);
        }
    }

    #[inline]
    unsafe fn remove_task(
        &self,
        Ctx { mut lock }: Ctx<'_, Traits>,
        task_cb: &'static TaskCb<Traits>,
        effective_priority: usize,
    ) {
        let empty = {
            let mut accessor = list_accessor!(&self.queues[effective_priority], lock.borrow_mut());
            // Safety: `task_cb` is definitely linked to this list, so
            //         `remove` shouldn't return `ItemError::NotLinked`.
            unsafe { accessor.remove(Ident(task_cb)).unwrap_unchecked() };
            accessor.is_empty()
        };

        if empty {
            self.bitmap.write(&mut *lock).clear(effective_priority);
        }
    }
}

impl<Traits: KernelTraits, Bitmap: PrioBitmap, const LEN: usize> private::Sealed
    for BitmapQueue<Traits, Bitmap, LEN>
where
    Traits: KernelCfg<TaskReadyQueue = Self>,
{
}
