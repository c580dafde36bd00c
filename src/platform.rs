/*
 * Platform Interface
 *
 * Everything hardware-specific that the scheduler consumes arrives through
 * the Platform trait: interrupt control, the timer, the page allocator, the
 * low-level context switch, and user address-space activation.
 *
 * The kernel proper implements this trait once per architecture and hands a
 * 'static reference to init(). The test suite implements it with a simulated
 * machine, which is what lets the whole scheduler run hosted.
 */

use core::ptr::NonNull;

use crate::types::AddrSpace;

/// Interrupt state of the CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntrLevel {
    /// Maskable interrupts are disabled.
    Off,
    /// Maskable interrupts are enabled.
    On,
}

/// Body of a kernel thread.
pub type ThreadFunc = fn(usize);

/// The bootstrap function a freshly built stack enters on its first switch.
pub type KernelEntry = extern "C" fn(ThreadFunc, usize);

/// External collaborators of the scheduler.
///
/// All scheduler state is protected by disabling interrupts through this
/// trait, never by blocking locks; locks are built on top of the scheduler
/// and using them inside it would be circular.
pub trait Platform: Sync {
    // ---- interrupt controller -------------------------------------------

    /// Disable interrupts and return the previous level.
    fn intr_disable(&self) -> IntrLevel;

    /// Restore a previously saved interrupt level.
    fn intr_set_level(&self, level: IntrLevel);

    /// The current interrupt level.
    fn intr_get_level(&self) -> IntrLevel;

    /// Enable interrupts.
    fn intr_enable(&self) {
        self.intr_set_level(IntrLevel::On);
    }

    /// Whether we are running inside an interrupt handler.
    fn in_intr_context(&self) -> bool;

    /// Request that the interrupt frame being serviced yields the CPU on
    /// return, instead of resuming the interrupted thread. The mechanism
    /// that defers preemption out of interrupt context to a safe point.
    fn yield_on_return(&self);

    // ---- timer ----------------------------------------------------------

    /// Monotonic tick counter since boot.
    fn timer_ticks(&self) -> i64;

    /// Timer ticks per second.
    fn timer_freq(&self) -> i64;

    // ---- page allocator -------------------------------------------------

    /// Allocate one zero-filled, page-aligned page, or None when memory is
    /// exhausted.
    fn alloc_zeroed_page(&self) -> Option<NonNull<u8>>;

    /// Return a page to the allocator.
    ///
    /// # Safety
    ///
    /// `page` must have come from `alloc_zeroed_page` on this platform and
    /// must no longer be in use; in particular no thread may be running on
    /// a stack inside it.
    unsafe fn free_page(&self, page: NonNull<u8>);

    // ---- context switch -------------------------------------------------

    /// Lay out a fresh kernel stack ending at `stack_top` so that the first
    /// switch onto it calls `bootstrap(entry, aux)`. Returns the initial
    /// saved stack pointer.
    ///
    /// The frame construction is calling-convention specific, which is why
    /// it lives with the platform and not in the scheduler.
    ///
    /// # Safety
    ///
    /// `stack_top` must be the upper end of an unused stack region at least
    /// one page in size.
    unsafe fn init_stack(
        &self,
        stack_top: *mut u8,
        bootstrap: KernelEntry,
        entry: ThreadFunc,
        aux: usize,
    ) -> usize;

    /// Save the live stack pointer through `prev_sp`, adopt `next_sp`, and
    /// resume whatever execution context is frozen there. Returns in the
    /// context of the next thread; the call appears to return to the caller
    /// only when this thread is later switched back in.
    ///
    /// # Safety
    ///
    /// Interrupts must be off, `prev_sp` must point at the saved-sp slot of
    /// the running thread, and `next_sp` must have been produced by
    /// `init_stack` or a previous `switch_stacks` save.
    unsafe fn switch_stacks(&self, prev_sp: *mut usize, next_sp: usize);

    // ---- address spaces -------------------------------------------------

    /// Install a user address space on the CPU.
    fn activate(&self, space: AddrSpace);

    // ---- idle -----------------------------------------------------------

    /// Re-enable interrupts and wait for the next one, atomically (the
    /// `sti; hlt` pair on x86). Called only by the idle thread.
    fn idle_wait(&self);
}
