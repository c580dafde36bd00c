/*
 * Sleep Queue (Alarm Clock)
 *
 * Threads that sleep are blocked and parked on a queue ordered by ascending
 * wakeup tick; nobody busy-waits. The dispatcher advances the queue on every
 * dispatch, and because preemption forces a dispatch at least every
 * TIME_SLICE ticks, a due sleeper is never left waiting for long. The queue
 * being ordered means the first still-sleeping head ends the scan.
 *
 * Deadlines are absolute values of the raw timer counter, compared directly,
 * so arithmetic stays correct across the counter's full range.
 */

use crate::sched::{self, SchedState};
use crate::types::Tid;

/// Block the current thread until the timer reaches `wake_tick`.
///
/// A deadline at or before the current tick still blocks; the very next
/// dispatch wakes the thread again.
pub fn sleep_until(wake_tick: i64) {
    let p = sched::platform();
    assert!(!p.in_intr_context(), "sleep from interrupt context");
    let old = p.intr_disable();
    sched::with_sched(|s| {
        let cur = s.current;
        assert!(!s.is_idle(cur), "the idle thread cannot sleep");
        s.thread_mut(cur).wake_tick = wake_tick;
        insert_sleeper(s, cur);
    });
    sched::block();
    p.intr_set_level(old);
}

/// Block the current thread for `ticks` timer ticks from now.
pub fn sleep_for(ticks: i64) {
    let p = sched::platform();
    sleep_until(p.timer_ticks() + ticks);
}

/// Keep the queue sorted by ascending wake tick; equal deadlines wake in
/// the order they went to sleep.
fn insert_sleeper(s: &mut SchedState, tid: Tid) {
    let wake = s.thread(tid).wake_tick;
    let pos = s
        .sleepers
        .iter()
        .position(|&t| s.thread(t).wake_tick > wake)
        .unwrap_or(s.sleepers.len());
    s.sleepers.insert(pos, tid).ok().expect("sleep queue overflow");
}

/// Wake every sleeper whose deadline has passed. Called by the dispatcher
/// with interrupts off.
pub(crate) fn advance(s: &mut SchedState, now: i64) {
    while let Some(&head) = s.sleepers.first() {
        if s.thread(head).wake_tick > now {
            break;
        }
        s.sleepers.remove(0);
        sched::unblock_locked(s, head);
    }
}
