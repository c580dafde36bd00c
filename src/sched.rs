/*
 * Ready Queue and Dispatcher
 *
 * The mechanism layer of the scheduler: global state, thread lifecycle
 * operations, the dispatcher that drives context switches, and the timer
 * tick handler that enforces preemption.
 *
 * All of it is guarded by disabling interrupts, not by blocking locks; locks
 * are built on top of this module. The spin mutex around the global state is
 * uncontended on the single CPU and only exists so safe Rust can hold the
 * state at all; every mutation still happens with interrupts off, which is
 * the real exclusion discipline.
 *
 * Thread records are stored by value in a fixed-capacity table and named by
 * Tid from everywhere else. Raw pointers into the table exist only for the
 * instant of the context switch, where switch_stacks consumes them before
 * any other code can run.
 */

use heapless::String;
use heapless::Vec;
use spin::Mutex;

use crate::donation;
use crate::fixed_point::Fp;
use crate::mlfqs;
use crate::platform::{IntrLevel, Platform, ThreadFunc};
use crate::sleep;
use crate::thread::{PagePtr, Thread, ThreadState};
use crate::types::{
    AddrSpace, LockId, Priority, Tid, MAX_LOCKS, MAX_THREADS, NAME_CAP, TID_ERROR, TIME_SLICE,
};

/// Tick accounting, split by what the CPU was doing when the tick landed.
#[derive(Debug, Default, Clone, Copy)]
pub struct SchedStats {
    pub idle_ticks: u64,
    pub kernel_ticks: u64,
    pub user_ticks: u64,
}

/// Everything the scheduler owns.
pub(crate) struct SchedState {
    /// All live threads, in creation order.
    pub(crate) threads: Vec<Thread, MAX_THREADS>,
    /// READY threads, sorted by descending effective priority.
    pub(crate) ready: Vec<Tid, MAX_THREADS>,
    /// Sleeping threads, sorted by ascending wake tick.
    pub(crate) sleepers: Vec<Tid, MAX_THREADS>,
    /// Which thread holds which lock, maintained for priority donation.
    pub(crate) lock_holders: Vec<(LockId, Tid), MAX_LOCKS>,

    /// The one RUNNING thread.
    pub(crate) current: Tid,
    /// The thread we most recently switched away from, consumed by the
    /// dispatch tail.
    pub(crate) prev: Option<Tid>,
    /// The idle thread; runs when the ready queue is empty, never queued.
    pub(crate) idle: Option<Tid>,
    /// The bootstrap thread; its record owns no page.
    pub(crate) initial: Tid,

    /// Boot-time policy flag, immutable after init.
    pub(crate) mlfqs: bool,
    /// System load average, mlfqs only.
    pub(crate) load_avg: Fp,
    /// Ticks since the last dispatch, for time-slice enforcement.
    pub(crate) slice_ticks: u32,

    pub(crate) stats: SchedStats,
}

impl SchedState {
    fn new(mlfqs: bool, initial: Tid) -> Self {
        SchedState {
            threads: Vec::new(),
            ready: Vec::new(),
            sleepers: Vec::new(),
            lock_holders: Vec::new(),
            current: initial,
            prev: None,
            idle: None,
            initial,
            mlfqs,
            load_avg: Fp::ZERO,
            slice_ticks: 0,
            stats: SchedStats::default(),
        }
    }

    pub(crate) fn try_thread(&self, tid: Tid) -> Option<&Thread> {
        self.threads.iter().find(|t| t.tid == tid)
    }

    pub(crate) fn thread(&self, tid: Tid) -> &Thread {
        self.try_thread(tid).expect("not a live thread")
    }

    pub(crate) fn thread_mut(&mut self, tid: Tid) -> &mut Thread {
        self.threads
            .iter_mut()
            .find(|t| t.tid == tid)
            .expect("not a live thread")
    }

    pub(crate) fn priority_of(&self, tid: Tid) -> Priority {
        self.thread(tid).priority
    }

    pub(crate) fn is_idle(&self, tid: Tid) -> bool {
        self.idle == Some(tid)
    }

    /// Insert into the ready queue, keeping it sorted by descending
    /// effective priority. Equal priorities queue behind their peers.
    pub(crate) fn insert_ready(&mut self, tid: Tid) {
        let pri = self.priority_of(tid);
        let pos = self
            .ready
            .iter()
            .position(|&t| self.priority_of(t) < pri)
            .unwrap_or(self.ready.len());
        self.ready.insert(pos, tid).ok().expect("ready queue overflow");
    }

    /// Re-sort one thread after its effective priority changed.
    pub(crate) fn reposition_ready(&mut self, tid: Tid) {
        if self.thread(tid).status == ThreadState::Ready && !self.is_idle(tid) {
            self.ready.retain(|&t| t != tid);
            self.insert_ready(tid);
        }
    }

    /// Pop the highest-priority ready thread, falling back to idle.
    pub(crate) fn pick_next(&mut self) -> Tid {
        if self.ready.is_empty() {
            self.idle.expect("ready queue empty and no idle thread")
        } else {
            self.ready.remove(0)
        }
    }

    pub(crate) fn ready_head_priority(&self) -> Option<Priority> {
        self.ready.first().map(|&t| self.priority_of(t))
    }

    pub(crate) fn lock_holder(&self, lock: LockId) -> Option<Tid> {
        self.lock_holders
            .iter()
            .find(|&&(l, _)| l == lock)
            .map(|&(_, holder)| holder)
    }

    pub(crate) fn set_lock_holder(&mut self, lock: LockId, holder: Tid) {
        if let Some(entry) = self.lock_holders.iter_mut().find(|e| e.0 == lock) {
            entry.1 = holder;
        } else {
            self.lock_holders
                .push((lock, holder))
                .ok()
                .expect("lock registry overflow");
        }
    }

    pub(crate) fn clear_lock_holder(&mut self, lock: LockId) {
        self.lock_holders.retain(|&(l, _)| l != lock);
    }

    fn remove_record(&mut self, tid: Tid) -> Thread {
        let pos = self
            .threads
            .iter()
            .position(|t| t.tid == tid)
            .expect("not a live thread");
        self.threads.remove(pos)
    }
}

/// Global scheduler instance.
static SCHED: Mutex<Option<SchedState>> = Mutex::new(None);

/// The platform this kernel runs on, installed by init().
static PLATFORM: Mutex<Option<&'static dyn Platform>> = Mutex::new(None);

/// Lock used by allocate_tid().
static TID_LOCK: Mutex<i32> = Mutex::new(1);

pub(crate) fn platform() -> &'static dyn Platform {
    (*PLATFORM.lock()).expect("thread system is not initialized")
}

pub(crate) fn with_sched<R>(f: impl FnOnce(&mut SchedState) -> R) -> R {
    let mut guard = SCHED.lock();
    f(guard.as_mut().expect("thread system is not initialized"))
}

/// Monotonically allocate a tid, never reusing one.
fn allocate_tid() -> Tid {
    let mut next = TID_LOCK.lock();
    let tid = Tid(*next);
    *next += 1;
    tid
}

/// Initialize the threading system by adopting the code that is currently
/// running as the first thread.
///
/// Must be called with interrupts off, before any other entry point. The
/// `mlfqs` flag selects the multi-level feedback queue scheduler instead of
/// the priority scheduler; it cannot be changed after boot.
pub fn init(platform: &'static dyn Platform, mlfqs: bool) {
    assert_eq!(
        platform.intr_get_level(),
        IntrLevel::Off,
        "init requires interrupts off"
    );
    *PLATFORM.lock() = Some(platform);

    let tid = allocate_tid();
    let mut main = Thread::new(tid, "main", Priority::DEFAULT, None);
    main.status = ThreadState::Running;

    let mut state = SchedState::new(mlfqs, tid);
    state.threads.push(main).ok().expect("thread table overflow");
    *SCHED.lock() = Some(state);

    log::info!("thread system initialized, mlfqs={}", mlfqs);
}

/// Start preemptive scheduling: create the idle thread and enable
/// interrupts.
pub fn start() {
    let p = platform();
    let tid = allocate_tid();
    let t = new_kernel_thread(p, tid, "idle", Priority::MIN, idle_main, 0)
        .expect("no page for the idle thread");
    with_sched(|s| {
        s.threads.push(t).ok().expect("thread table overflow");
        s.idle = Some(tid);
    });
    log::info!("idle thread is tid {}; preemptive scheduling enabled", tid);
    p.intr_enable();
}

/// Build a thread record with a fresh stack page, ready for its first
/// switch. None when the page allocator is out of memory.
fn new_kernel_thread(
    p: &'static dyn Platform,
    tid: Tid,
    name: &str,
    priority: Priority,
    entry: ThreadFunc,
    aux: usize,
) -> Option<Thread> {
    let page = PagePtr::new(p.alloc_zeroed_page()?);
    page.write_canary();
    let mut t = Thread::new(tid, name, priority, Some(page));
    t.saved_sp = unsafe { p.init_stack(page.top(), kernel_thread, entry, aux) };
    Some(t)
}

/// First frame of every kernel thread. The dispatcher switches threads in
/// with interrupts off, so turn them back on before running the body; a body
/// that returns exits its thread.
extern "C" fn kernel_thread(entry: ThreadFunc, aux: usize) {
    platform().intr_enable();
    entry(aux);
    exit();
}

/// Body of the idle thread: block, and whenever the dispatcher hands us the
/// CPU with nothing else to run, wait for an interrupt and block again.
fn idle_main(_aux: usize) {
    let p = platform();
    loop {
        p.intr_disable();
        block();
        p.idle_wait();
    }
}

/// Create a new kernel thread and make it runnable.
///
/// Returns `TID_ERROR` when no page can be allocated for its stack or the
/// thread table is full. If the new thread outranks the caller, the caller
/// yields before this returns.
pub fn create(name: &str, priority: Priority, entry: ThreadFunc, aux: usize) -> Tid {
    let p = platform();
    let tid = allocate_tid();
    let Some(t) = new_kernel_thread(p, tid, name, priority, entry, aux) else {
        return TID_ERROR;
    };

    let old = p.intr_disable();
    let installed = with_sched(|s| match s.threads.push(t) {
        Ok(()) => true,
        Err(t) => {
            if let Some(page) = t.stack_page {
                unsafe { p.free_page(page.base()) };
            }
            false
        }
    });
    p.intr_set_level(old);

    if !installed {
        log::warn!("thread table full, create of '{}' failed", name);
        return TID_ERROR;
    }
    log::debug!("created thread {} '{}' priority {}", tid, name, priority);

    unblock(tid);
    yield_if_higher();
    tid
}

/// The running thread's tid, with integrity checks. A corrupted record or
/// trampled stack canary halts here.
pub fn current() -> Tid {
    with_sched(|s| {
        let t = s.thread(s.current);
        t.check_integrity();
        assert_eq!(
            t.status,
            ThreadState::Running,
            "current thread is not running"
        );
        t.tid
    })
}

/// The running thread's name.
pub fn name() -> String<NAME_CAP> {
    with_sched(|s| s.thread(s.current).name.clone())
}

/// Put the current thread to sleep until unblock() wakes it.
///
/// Must be called with interrupts off and outside interrupt context. Most
/// code wants the synchronization primitives layered above instead.
pub fn block() {
    let p = platform();
    assert!(!p.in_intr_context(), "block from interrupt context");
    assert_eq!(
        p.intr_get_level(),
        IntrLevel::Off,
        "block requires interrupts off"
    );
    with_sched(|s| {
        let cur = s.current;
        s.thread_mut(cur).status = ThreadState::Blocked;
    });
    schedule();
}

/// Transition a blocked thread to READY and queue it.
///
/// Does not preempt the running thread, so a caller that disabled
/// interrupts can atomically unblock and update its own state; callers that
/// want preemption follow up with yield_if_higher().
pub fn unblock(tid: Tid) {
    let p = platform();
    let old = p.intr_disable();
    with_sched(|s| unblock_locked(s, tid));
    p.intr_set_level(old);
}

pub(crate) fn unblock_locked(s: &mut SchedState, tid: Tid) {
    {
        let t = s.thread(tid);
        t.check_integrity();
        assert_eq!(
            t.status,
            ThreadState::Blocked,
            "unblock of a thread that is not blocked"
        );
    }
    s.insert_ready(tid);
    s.thread_mut(tid).status = ThreadState::Ready;
}

/// Yield the CPU. The current thread stays runnable and may be scheduled
/// again immediately.
pub fn yield_now() {
    let p = platform();
    assert!(!p.in_intr_context(), "yield from interrupt context");
    let old = p.intr_disable();
    with_sched(|s| {
        let cur = s.current;
        if !s.is_idle(cur) {
            s.insert_ready(cur);
        }
        s.thread_mut(cur).status = ThreadState::Ready;
    });
    schedule();
    p.intr_set_level(old);
}

/// Yield only if the head of the ready queue outranks the current thread.
/// Safe to call from interrupt context, where the yield is deferred to
/// interrupt return.
pub fn yield_if_higher() {
    let p = platform();
    let old = p.intr_disable();
    let outranked = with_sched(|s| match s.ready_head_priority() {
        Some(head) => head > s.thread(s.current).priority,
        None => false,
    });
    p.intr_set_level(old);
    if outranked {
        if p.in_intr_context() {
            p.yield_on_return();
        } else {
            yield_now();
        }
    }
}

/// Deschedule the current thread and mark it for destruction. The next
/// thread to run reaps the record and frees the stack page; nothing can
/// free the stack it is still standing on.
///
/// Never returns on hardware. The simulated platform's switch falls
/// through, which is what lets the hosted tests keep driving the state
/// machine after an exit.
pub fn exit() {
    let p = platform();
    assert!(!p.in_intr_context(), "exit from interrupt context");
    p.intr_disable();
    with_sched(|s| {
        let cur = s.current;
        assert!(
            !s.lock_holders.iter().any(|&(_, holder)| holder == cur),
            "thread exits while holding a lock"
        );
        log::debug!("thread {} '{}' exiting", cur, s.thread(cur).name.as_str());
        s.thread_mut(cur).status = ThreadState::Dying;
    });
    schedule();
}

/// Apply `f` to every live thread. Interrupts must be off.
pub fn foreach(mut f: impl FnMut(&Thread)) {
    assert_eq!(
        platform().intr_get_level(),
        IntrLevel::Off,
        "foreach requires interrupts off"
    );
    with_sched(|s| {
        for t in s.threads.iter() {
            f(t);
        }
    })
}

/// The current thread's effective priority.
pub fn get_priority() -> Priority {
    with_sched(|s| s.thread(s.current).priority)
}

/// Set the current thread's base priority, recompute its effective priority
/// under any active donations, and yield if it no longer ranks highest.
/// Forbidden under mlfqs, where priorities are computed, not set.
pub fn set_priority(new: Priority) {
    let p = platform();
    let old = p.intr_disable();
    with_sched(|s| {
        assert!(!s.mlfqs, "set_priority is not allowed under mlfqs");
        let cur = s.current;
        s.thread_mut(cur).initial_priority = new;
        donation::recompute(s, cur);
    });
    p.intr_set_level(old);
    yield_if_higher();
}

/// Record the address space of a thread; the dispatcher installs it
/// whenever the thread is switched in.
pub fn set_address_space(tid: Tid, space: AddrSpace) {
    let p = platform();
    let old = p.intr_disable();
    with_sched(|s| s.thread_mut(tid).addr_space = Some(space));
    p.intr_set_level(old);
}

/// Install a thread's address space right now (used by the user-program
/// loader after it builds one).
pub fn activate(tid: Tid) {
    let space = with_sched(|s| s.thread(tid).addr_space);
    if let Some(space) = space {
        platform().activate(space);
    }
}

/// Timer interrupt hook, called once per tick from interrupt context.
///
/// Buckets the tick into the statistics, runs the mlfqs per-tick and
/// per-second accounting, and requests a yield at interrupt return once the
/// time slice is spent. Never walks the donation graph and never frees
/// memory.
pub fn tick() {
    let p = platform();
    let slice_spent = with_sched(|s| {
        let cur = s.current;
        if s.is_idle(cur) {
            s.stats.idle_ticks += 1;
        } else if s.thread(cur).addr_space.is_some() {
            s.stats.user_ticks += 1;
        } else {
            s.stats.kernel_ticks += 1;
        }

        if s.mlfqs {
            // idle never accrues recent_cpu
            if !s.is_idle(cur) {
                mlfqs::charge_tick(s, cur);
            }
            if p.timer_ticks() % p.timer_freq() == 0 {
                mlfqs::refresh_second(s);
            }
        }

        s.slice_ticks += 1;
        s.slice_ticks >= TIME_SLICE
    });
    if slice_spent {
        p.yield_on_return();
    }
}

/// Tick statistics since boot.
pub fn stats() -> SchedStats {
    with_sched(|s| s.stats)
}

/// Log the tick statistics.
pub fn print_stats() {
    let st = stats();
    log::info!(
        "thread: {} idle ticks, {} kernel ticks, {} user ticks",
        st.idle_ticks,
        st.kernel_ticks,
        st.user_ticks
    );
}

/// Dispatch: find the next thread to run and switch to it.
///
/// At entry interrupts are off and the running thread's status has already
/// been changed away from Running. Under mlfqs every dispatch first
/// recomputes all priorities, because they move continuously with
/// recent_cpu and the ready queue must reflect the latest values before we
/// pick. Then due sleepers wake, and the head of the ready queue (or idle)
/// gets the CPU.
pub(crate) fn schedule() {
    let p = platform();
    assert_eq!(
        p.intr_get_level(),
        IntrLevel::Off,
        "dispatch requires interrupts off"
    );
    let now = p.timer_ticks();

    let (prev, next, prev_sp, next_sp) = with_sched(|s| {
        if s.mlfqs {
            mlfqs::refresh_priorities(s);
        }
        sleep::advance(s, now);

        let prev = s.current;
        assert!(
            s.thread(prev).status != ThreadState::Running,
            "dispatch entered with the current thread still running"
        );
        let next = s.pick_next();
        s.thread(next).check_integrity();
        s.current = next;
        s.prev = Some(prev);

        let prev_sp = &mut s.thread_mut(prev).saved_sp as *mut usize;
        let next_sp = s.thread(next).saved_sp;
        (prev, next, prev_sp, next_sp)
    });

    if prev != next {
        // prev_sp is consumed inside switch_stacks before any other code
        // can touch the thread table again.
        unsafe { p.switch_stacks(prev_sp, next_sp) };
    }
    schedule_tail();
}

/// Completes a dispatch in the context of the newly running thread: mark it
/// Running, start its time slice, install its address space, and destroy
/// the thread we switched away from if it was dying. Freeing must happen
/// here, on the far side of the switch, so exit() never pulls the stack out
/// from under itself.
fn schedule_tail() {
    let p = platform();
    assert_eq!(
        p.intr_get_level(),
        IntrLevel::Off,
        "dispatch tail requires interrupts off"
    );
    let (space, reaped) = with_sched(|s| {
        let cur = s.current;
        {
            let t = s.thread_mut(cur);
            t.status = ThreadState::Running;
            t.check_integrity();
        }
        s.slice_ticks = 0;
        let space = s.thread(cur).addr_space;

        let mut reaped = None;
        if let Some(prev) = s.prev.take() {
            if prev != cur && s.thread(prev).status == ThreadState::Dying {
                let t = s.remove_record(prev);
                // the bootstrap thread runs on the boot stack, not on an
                // allocator page, so there must be nothing to hand back
                assert!(
                    t.tid != s.initial || t.stack_page.is_none(),
                    "the bootstrap thread's stack must not be reclaimed"
                );
                reaped = Some(t);
            }
        }
        (space, reaped)
    });

    if let Some(space) = space {
        p.activate(space);
    }
    if let Some(t) = reaped {
        log::debug!("reaped dying thread {}", t.tid);
        // the bootstrap thread has no page of its own, so its stack (the
        // boot stack) is naturally never handed back to the allocator
        if let Some(page) = t.stack_page {
            unsafe { p.free_page(page.base()) };
        }
    }
}
