/*
 * Simulated Platform
 *
 * Test-only implementation of the Platform trait: an interrupt flag, a
 * monotonic tick counter, a leak-checked page allocator, and a context
 * switch that simply falls through. Nothing ever executes on a simulated
 * stack; the tests drive the scheduler as a state machine, acting as
 * whichever thread the dispatcher last made current.
 *
 * The scheduler's globals are process-wide, so every test boots a fresh
 * world under a shared serialization lock.
 */

use core::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use heapless::String;

use crate::platform::{IntrLevel, KernelEntry, Platform, ThreadFunc};
use crate::sched;
use crate::thread::ThreadState;
use crate::types::{AddrSpace, Priority, Tid, NAME_CAP, PAGE_SIZE};

#[repr(align(4096))]
struct SimPage([u8; PAGE_SIZE]);

pub(crate) struct SimPlatform {
    intr_on: AtomicBool,
    in_irq: AtomicBool,
    ticks: AtomicI64,
    yield_pending: AtomicBool,
    live_pages: AtomicUsize,
    page_alloc_fails: AtomicBool,
}

impl SimPlatform {
    fn new() -> Self {
        SimPlatform {
            intr_on: AtomicBool::new(false),
            in_irq: AtomicBool::new(false),
            ticks: AtomicI64::new(0),
            yield_pending: AtomicBool::new(false),
            live_pages: AtomicUsize::new(0),
            page_alloc_fails: AtomicBool::new(false),
        }
    }

    /// Pages handed out and not yet freed.
    pub(crate) fn live_pages(&self) -> usize {
        self.live_pages.load(Ordering::SeqCst)
    }

    /// Make the page allocator report exhaustion.
    pub(crate) fn fail_page_alloc(&self, fail: bool) {
        self.page_alloc_fails.store(fail, Ordering::SeqCst);
    }

    fn take_yield_pending(&self) -> bool {
        self.yield_pending.swap(false, Ordering::SeqCst)
    }
}

impl Platform for SimPlatform {
    fn intr_disable(&self) -> IntrLevel {
        if self.intr_on.swap(false, Ordering::SeqCst) {
            IntrLevel::On
        } else {
            IntrLevel::Off
        }
    }

    fn intr_set_level(&self, level: IntrLevel) {
        self.intr_on.store(level == IntrLevel::On, Ordering::SeqCst);
    }

    fn intr_get_level(&self) -> IntrLevel {
        if self.intr_on.load(Ordering::SeqCst) {
            IntrLevel::On
        } else {
            IntrLevel::Off
        }
    }

    fn in_intr_context(&self) -> bool {
        self.in_irq.load(Ordering::SeqCst)
    }

    fn yield_on_return(&self) {
        self.yield_pending.store(true, Ordering::SeqCst);
    }

    fn timer_ticks(&self) -> i64 {
        self.ticks.load(Ordering::SeqCst)
    }

    fn timer_freq(&self) -> i64 {
        100
    }

    fn alloc_zeroed_page(&self) -> Option<NonNull<u8>> {
        if self.page_alloc_fails.load(Ordering::SeqCst) {
            return None;
        }
        let page = Box::leak(Box::new(SimPage([0; PAGE_SIZE])));
        self.live_pages.fetch_add(1, Ordering::SeqCst);
        NonNull::new(page.0.as_mut_ptr())
    }

    unsafe fn free_page(&self, page: NonNull<u8>) {
        self.live_pages.fetch_sub(1, Ordering::SeqCst);
        unsafe { drop(Box::from_raw(page.as_ptr() as *mut SimPage)) };
    }

    unsafe fn init_stack(
        &self,
        stack_top: *mut u8,
        _bootstrap: KernelEntry,
        _entry: ThreadFunc,
        _aux: usize,
    ) -> usize {
        // nothing ever runs on a simulated stack, so no frames to build
        stack_top as usize
    }

    unsafe fn switch_stacks(&self, _prev_sp: *mut usize, _next_sp: usize) {
        // falling through "resumes" the next thread: the test keeps
        // executing, now acting as whatever the dispatcher made current
    }

    fn activate(&self, _space: AddrSpace) {}

    fn idle_wait(&self) {
        self.intr_enable();
    }
}

/// Scheduler tests share one set of process-wide globals.
static SERIAL: Mutex<()> = Mutex::new(());

/// Boot a fresh scheduler world on a fresh simulated machine. Holds the
/// serialization lock for the life of the test.
pub(crate) fn boot(mlfqs: bool) -> (MutexGuard<'static, ()>, &'static SimPlatform) {
    let guard = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);
    let p: &'static SimPlatform = Box::leak(Box::new(SimPlatform::new()));
    p.intr_disable();
    sched::init(p, mlfqs);
    sched::start();
    (guard, p)
}

/// Deliver one timer interrupt: advance time, run the tick handler in
/// interrupt context, and honor a pending yield-on-return where the real
/// interrupt frame would, just before resuming the interrupted thread.
pub(crate) fn interrupt_tick(p: &SimPlatform) {
    p.ticks.fetch_add(1, Ordering::SeqCst);
    let old = p.intr_disable();
    p.in_irq.store(true, Ordering::SeqCst);
    sched::tick();
    p.in_irq.store(false, Ordering::SeqCst);
    p.intr_set_level(old);
    if p.take_yield_pending() {
        sched::yield_now();
    }
}

pub(crate) fn run_ticks(p: &SimPlatform, n: u32) {
    for _ in 0..n {
        interrupt_tick(p);
    }
}

/// Read another thread's effective priority.
pub(crate) fn priority_of(p: &SimPlatform, tid: Tid) -> Priority {
    let mut found = None;
    let old = p.intr_disable();
    sched::foreach(|t| {
        if t.tid == tid {
            found = Some(t.priority);
        }
    });
    p.intr_set_level(old);
    found.expect("no such thread")
}

/// Read another thread's state.
pub(crate) fn status_of(p: &SimPlatform, tid: Tid) -> ThreadState {
    let mut found = None;
    let old = p.intr_disable();
    sched::foreach(|t| {
        if t.tid == tid {
            found = Some(t.status);
        }
    });
    p.intr_set_level(old);
    found.expect("no such thread")
}

/// Read another thread's name.
pub(crate) fn name_of(p: &SimPlatform, tid: Tid) -> String<NAME_CAP> {
    let mut found = None;
    let old = p.intr_disable();
    sched::foreach(|t| {
        if t.tid == tid {
            found = Some(t.name.clone());
        }
    });
    p.intr_set_level(old);
    found.expect("no such thread")
}
