/*
 * Priority Donation Engine
 *
 * Prevents priority inversion in the priority scheduler: a thread blocked on
 * a lock lends its effective priority to the holder, transitively down the
 * chain of holders. Everything here works on Tid handles and a small
 * LockId -> holder registry, so the scheduler never dereferences a lock and
 * the donation graph carries no ownership.
 *
 * The lock implementation drives this module around its block/unblock:
 *
 *   acquire, holder present:  wait_on_lock(l); <block>; lock_acquired(l)
 *   acquire, lock free:       lock_acquired(l)
 *   release:                  lock_released(l); <unblock highest waiter>
 *
 * A thread donates to at most one holder at a time. Reordering after a
 * priority change is always remove-then-reinsert of the donation token, and
 * a thread without an active token has nothing to remove, which is what
 * makes the walk safe to repeat.
 *
 * The whole engine is inert under mlfqs.
 */

use heapless::Vec;

use crate::sched::{self, SchedState};
use crate::types::{LockId, Tid, MAX_THREADS};

/// Record that the current thread is about to block acquiring `lock`, and
/// push its priority down the chain of holders. Called by the lock
/// implementation, with the lock known to be held, before it blocks.
pub fn wait_on_lock(lock: LockId) {
    let p = sched::platform();
    let old = p.intr_disable();
    sched::with_sched(|s| {
        if s.mlfqs {
            return;
        }
        let cur = s.current;
        s.thread_mut(cur).waiting_on = Some(lock);
        donate(s, cur);
    });
    p.intr_set_level(old);
}

/// The current thread now holds `lock`: clear its wait edge, register it as
/// holder, and recompute its effective priority (it may have inherited
/// donors that came with the lock's wait queue).
pub fn lock_acquired(lock: LockId) {
    let p = sched::platform();
    let old = p.intr_disable();
    sched::with_sched(|s| {
        if s.mlfqs {
            return;
        }
        let cur = s.current;
        s.thread_mut(cur).waiting_on = None;
        s.set_lock_holder(lock, cur);
        recompute(s, cur);
    });
    p.intr_set_level(old);
}

/// The current thread is releasing `lock`: every donation that was tied to
/// this lock is recalled and the releaser's priority recomputed, usually
/// dropping back toward its base.
pub fn lock_released(lock: LockId) {
    let p = sched::platform();
    let old = p.intr_disable();
    sched::with_sched(|s| {
        if s.mlfqs {
            return;
        }
        let cur = s.current;
        assert_eq!(
            s.lock_holder(lock),
            Some(cur),
            "lock released by a thread that does not hold it"
        );
        let mut tied: Vec<Tid, MAX_THREADS> = Vec::new();
        for &d in s.thread(cur).donors.iter() {
            if s.thread(d).waiting_on == Some(lock) {
                tied.push(d).ok().expect("donor list overflow");
            }
        }
        for d in tied {
            recall(s, d);
        }
        recompute(s, cur);
        s.clear_lock_holder(lock);
    });
    p.intr_set_level(old);
}

/// Walk the donation chain starting at `tid`. Inert under mlfqs.
pub fn donate_priority(tid: Tid) {
    let p = sched::platform();
    let old = p.intr_disable();
    sched::with_sched(|s| {
        if !s.mlfqs {
            donate(s, tid);
        }
    });
    p.intr_set_level(old);
}

/// Withdraw `tid`'s outstanding donation, if it has one. Inert under mlfqs.
pub fn recall_donation(tid: Tid) {
    let p = sched::platform();
    let old = p.intr_disable();
    sched::with_sched(|s| {
        if !s.mlfqs {
            recall(s, tid);
        }
    });
    p.intr_set_level(old);
}

/// Recompute `tid`'s effective priority from its base and donors. Inert
/// under mlfqs.
pub fn recompute_priority(tid: Tid) {
    let p = sched::platform();
    let old = p.intr_disable();
    sched::with_sched(|s| {
        if !s.mlfqs {
            recompute(s, tid);
        }
    });
    p.intr_set_level(old);
}

/// The chain walk. From `start`, follow waiting_on -> holder edges, moving
/// each thread's donation token into its holder's donor list and refreshing
/// effective priorities as we go. Ends at a thread that is not waiting, or
/// at a lock nobody holds.
pub(crate) fn donate(s: &mut SchedState, start: Tid) {
    let mut t = start;
    // Depth is bounded by the number of live threads; a longer walk means
    // the wait-for graph has a cycle, i.e. deadlock.
    for _ in 0..MAX_THREADS {
        recompute(s, t);
        let Some(lock) = s.thread(t).waiting_on else {
            return;
        };
        let Some(holder) = s.lock_holder(lock) else {
            return;
        };
        assert_ne!(holder, t, "thread waits on a lock it holds");
        recall(s, t);
        insert_donor(s, holder, t);
        recompute(s, holder);
        t = holder;
    }
    panic!("donation chain longer than the thread table (deadlock?)");
}

/// Remove `tid`'s donation token from wherever it sits. A thread with no
/// outstanding donation is left alone.
pub(crate) fn recall(s: &mut SchedState, tid: Tid) {
    let Some(holder) = s.thread(tid).donating_to else {
        return;
    };
    s.thread_mut(holder).donors.retain(|&d| d != tid);
    s.thread_mut(tid).donating_to = None;
}

/// effective = max(base, highest donor); reposition in the ready queue if
/// the thread is queued there.
pub(crate) fn recompute(s: &mut SchedState, tid: Tid) {
    let base = s.thread(tid).initial_priority;
    let donated = s.thread(tid).donors.first().map(|&d| s.priority_of(d));
    let effective = match donated {
        Some(d) if d > base => d,
        _ => base,
    };
    s.thread_mut(tid).priority = effective;
    s.reposition_ready(tid);
}

/// File `donor` into `holder`'s donor list, ordered by descending priority.
fn insert_donor(s: &mut SchedState, holder: Tid, donor: Tid) {
    let pri = s.priority_of(donor);
    let pos = {
        let donors = &s.thread(holder).donors;
        donors
            .iter()
            .position(|&d| s.priority_of(d) < pri)
            .unwrap_or(donors.len())
    };
    s.thread_mut(holder)
        .donors
        .insert(pos, donor)
        .ok()
        .expect("donor list overflow");
    s.thread_mut(donor).donating_to = Some(holder);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::{block, create, current, exit, get_priority, set_priority, unblock, yield_if_higher};
    use crate::sim;
    use crate::types::Priority;
    use crate::platform::Platform;

    fn noop(_aux: usize) {}

    const X: LockId = LockId(1);
    const Y: LockId = LockId(2);

    /// As the current thread, block acquiring `lock` the way the lock
    /// implementation would: donate, then block with interrupts off.
    fn acquire_blocking(p: &'static sim::SimPlatform, lock: LockId) {
        let old = p.intr_disable();
        wait_on_lock(lock);
        block();
        p.intr_set_level(old);
    }

    /// As the releasing thread, hand `lock` to `waiter`.
    fn release_to(lock: LockId, waiter: Tid) {
        lock_released(lock);
        unblock(waiter);
        yield_if_higher();
    }

    #[test]
    fn simple_donation_boosts_and_release_restores() {
        let (_g, p) = sim::boot(false);
        let l = current(); // plays the low-priority lock holder
        lock_acquired(X);

        let h = create("H", Priority::new(63), noop, 0);
        assert_eq!(current(), h);
        acquire_blocking(p, X); // as H; blocks, L runs boosted

        assert_eq!(current(), l);
        assert_eq!(get_priority(), Priority::new(63));

        release_to(X, h);
        // H took over the instant the lock came free
        assert_eq!(current(), h);
        lock_acquired(X);
        assert_eq!(get_priority(), Priority::new(63));
        assert_eq!(sim::priority_of(p, l), Priority::DEFAULT);
        crate::sched::with_sched(|s| {
            assert!(s.thread(l).donors.is_empty());
            assert_eq!(s.thread(h).waiting_on, None);
        });
    }

    #[test]
    fn nested_donation_propagates_down_the_chain() {
        let (_g, p) = sim::boot(false);
        set_priority(Priority::MIN);

        let l = create("L", Priority::new(10), noop, 0);
        assert_eq!(current(), l);
        lock_acquired(X); // as L

        let m = create("M", Priority::new(20), noop, 0);
        assert_eq!(current(), m);
        lock_acquired(Y); // as M
        acquire_blocking(p, X); // M waits on X; back to L, boosted to 20

        assert_eq!(current(), l);
        let h = create("H", Priority::new(40), noop, 0);
        assert_eq!(current(), h);
        acquire_blocking(p, Y); // H waits on Y; chain H -> M -> L

        assert_eq!(current(), l);
        assert_eq!(sim::priority_of(p, l), Priority::new(40));
        assert_eq!(sim::priority_of(p, m), Priority::new(40));

        release_to(X, m); // as L
        assert_eq!(current(), m);
        lock_acquired(X); // as M, still donated to by H
        assert_eq!(sim::priority_of(p, l), Priority::new(10));
        assert_eq!(sim::priority_of(p, m), Priority::new(40));

        release_to(Y, h); // as M
        assert_eq!(current(), h);
        lock_acquired(Y);
        assert_eq!(sim::priority_of(p, m), Priority::new(20));
    }

    #[test]
    fn donation_chain_of_eight_terminates() {
        let (_g, p) = sim::boot(false);
        set_priority(Priority::MIN);

        // t[0] holds lock 0; t[i] holds lock i and waits on lock i-1
        let mut tids = std::vec::Vec::new();
        let first = create("t0", Priority::new(5), noop, 0);
        assert_eq!(current(), first);
        lock_acquired(LockId(100));
        tids.push(first);

        for i in 1..9i32 {
            // each link outranks the last, so it runs at once, then blocks
            // on its predecessor's lock and control returns to t0
            let t = create("link", Priority::new(5 + 5 * i), noop, 0);
            assert_eq!(current(), t);
            lock_acquired(LockId(100 + i as usize));
            acquire_blocking(p, LockId(100 + i as usize - 1));
            assert_eq!(current(), first);
            tids.push(t);
        }

        // the top donor's priority reached every link
        for &t in tids.iter() {
            assert_eq!(sim::priority_of(p, t), Priority::new(45));
        }
    }

    #[test]
    fn donate_then_recall_is_a_round_trip() {
        let (_g, p) = sim::boot(false);
        let l = current();
        lock_acquired(X);

        let h = create("H", Priority::new(50), noop, 0);
        assert_eq!(current(), h);
        acquire_blocking(p, X);

        // as L: withdraw H's donation directly, as if its wait timed out
        assert_eq!(current(), l);
        assert_eq!(get_priority(), Priority::new(50));
        recall_donation(h);
        recompute_priority(l);
        assert_eq!(get_priority(), Priority::DEFAULT);
        crate::sched::with_sched(|s| {
            assert!(s.thread(l).donors.is_empty());
            assert_eq!(s.thread(h).donating_to, None);
        });
    }

    #[test]
    fn redonation_reorders_the_donor_list() {
        let (_g, p) = sim::boot(false);
        let l = current();
        lock_acquired(X);

        let a = create("A", Priority::new(40), noop, 0);
        assert_eq!(current(), a);
        acquire_blocking(p, X);
        let b = create("B", Priority::new(50), noop, 0);
        assert_eq!(current(), b);
        acquire_blocking(p, X);

        // as L, donors are [B(50), A(40)]
        assert_eq!(current(), l);
        assert_eq!(get_priority(), Priority::new(50));
        crate::sched::with_sched(|s| {
            assert_eq!(s.thread(l).donors.as_slice(), &[b, a]);
        });

        // A's setter raises it above B while it waits; the token must move
        crate::sched::with_sched(|s| {
            s.thread_mut(a).initial_priority = Priority::new(60);
        });
        donate_priority(a);
        assert_eq!(get_priority(), Priority::new(60));
        crate::sched::with_sched(|s| {
            assert_eq!(s.thread(l).donors.as_slice(), &[a, b]);
        });
    }

    #[test]
    fn donation_is_inert_under_mlfqs() {
        let (_g, _p) = sim::boot(true);
        let main = current();
        lock_acquired(X);
        wait_on_lock(Y);
        donate_priority(main);
        crate::sched::with_sched(|s| {
            assert!(s.lock_holders.is_empty());
            assert_eq!(s.thread(main).waiting_on, None);
            assert!(s.thread(main).donors.is_empty());
        });
    }

    #[test]
    #[should_panic(expected = "not allowed under mlfqs")]
    fn set_priority_halts_under_mlfqs() {
        let (_g, _p) = sim::boot(true);
        set_priority(Priority::new(10));
    }

    #[test]
    #[should_panic(expected = "does not hold")]
    fn releasing_an_unheld_lock_halts() {
        let (_g, _p) = sim::boot(false);
        lock_released(X);
    }

    #[test]
    fn donors_are_cleaned_up_when_waiters_win_the_lock() {
        let (_g, p) = sim::boot(false);
        let l = current();
        lock_acquired(X);
        let h = create("H", Priority::new(45), noop, 0);
        assert_eq!(current(), h);
        acquire_blocking(p, X);

        assert_eq!(current(), l);
        release_to(X, h);
        assert_eq!(current(), h);
        lock_acquired(X);
        lock_released(X);
        exit(); // H done; back to L with everything restored
        assert_eq!(current(), l);
        assert_eq!(get_priority(), Priority::DEFAULT);
        crate::sched::with_sched(|s| {
            assert_eq!(s.lock_holder(X), None);
            assert!(s.thread(l).donors.is_empty());
        });
    }
}
