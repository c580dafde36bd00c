/*
 * Multi-Level Feedback Queue Scheduler (BSD style)
 *
 * When the kernel boots with mlfqs enabled, priorities are not set by
 * threads but computed from how much CPU they have been using:
 *
 *   priority = PRI_MAX - recent_cpu/4 (rounded) - 2*nice, clamped
 *
 * recent_cpu is a decaying average of CPU time, charged one tick at a time
 * to the running thread and decayed once per second by a factor derived
 * from the system load average:
 *
 *   load_avg   = (59/60)*load_avg + (1/60)*ready_threads     (per second)
 *   recent_cpu = (2*load_avg)/(2*load_avg + 1)*recent_cpu + nice
 *
 * All of it in 17.14 fixed point. Priorities are recomputed for every
 * thread at every dispatch; preemption bounds that to at least once per
 * TIME_SLICE ticks, so the recompute keeps up with the 4-tick cadence of
 * the classic BSD design while always feeding the ready queue the latest
 * values. Priority donation is disabled in this mode.
 */

use crate::fixed_point::Fp;
use crate::sched::{self, SchedState};
use crate::types::{Nice, Priority, Tid};

/// Charge one tick of CPU to the running thread. The idle thread never
/// accrues recent_cpu.
pub(crate) fn charge_tick(s: &mut SchedState, cur: Tid) {
    let t = s.thread_mut(cur);
    t.recent_cpu = t.recent_cpu + 1;
}

/// The once-per-second refresh: fold the current ready-thread count into
/// the load average, then decay every thread's recent_cpu.
pub(crate) fn refresh_second(s: &mut SchedState) {
    let running = if s.is_idle(s.current) { 0 } else { 1 };
    let ready_threads = s.ready.len() as i32 + running;

    s.load_avg = Fp::from_ratio(59, 60) * s.load_avg + Fp::from_ratio(1, 60) * ready_threads;

    let coeff = (s.load_avg * 2) / (s.load_avg * 2 + 1);
    for t in s.threads.iter_mut() {
        t.recent_cpu = coeff * t.recent_cpu + t.nice.get();
    }
}

/// The priority formula, clamped into [PRI_MIN, PRI_MAX].
pub(crate) fn priority_for(recent_cpu: Fp, nice: Nice) -> Priority {
    Priority::new(Priority::MAX.get() - (recent_cpu / 4).round() - 2 * nice.get())
}

/// Recompute every thread's priority and restore the ready queue's order.
/// Runs at every dispatch in mlfqs mode.
pub(crate) fn refresh_priorities(s: &mut SchedState) {
    for t in s.threads.iter_mut() {
        t.priority = priority_for(t.recent_cpu, t.nice);
    }
    sort_ready(s);
}

/// Stable insertion sort by descending priority, so threads of equal
/// priority keep their round-robin order.
fn sort_ready(s: &mut SchedState) {
    let SchedState { threads, ready, .. } = s;
    let pri = |tid: Tid| {
        threads
            .iter()
            .find(|t| t.tid == tid)
            .expect("not a live thread")
            .priority
    };
    for i in 1..ready.len() {
        let mut j = i;
        while j > 0 && pri(ready[j - 1]) < pri(ready[j]) {
            ready.swap(j - 1, j);
            j -= 1;
        }
    }
}

/// Set the current thread's niceness, recompute its priority, and yield if
/// it no longer ranks highest. Only meaningful under mlfqs.
pub fn set_nice(nice: Nice) {
    let p = sched::platform();
    let old = p.intr_disable();
    sched::with_sched(|s| {
        assert!(s.mlfqs, "set_nice requires the mlfqs scheduler");
        let cur = s.current;
        s.thread_mut(cur).nice = nice;
        let t = s.thread(cur);
        let new = priority_for(t.recent_cpu, t.nice);
        s.thread_mut(cur).priority = new;
        s.reposition_ready(cur);
    });
    p.intr_set_level(old);
    sched::yield_if_higher();
}

/// The current thread's niceness.
pub fn get_nice() -> Nice {
    sched::with_sched(|s| {
        assert!(s.mlfqs, "niceness is tracked only under mlfqs");
        s.thread(s.current).nice
    })
}

/// 100 times the system load average, rounded to the nearest integer.
pub fn get_load_avg() -> i32 {
    sched::with_sched(|s| {
        assert!(s.mlfqs, "load average is tracked only under mlfqs");
        100 * s.load_avg.round()
    })
}

/// 100 times the current thread's recent_cpu, rounded to the nearest
/// integer.
pub fn get_recent_cpu() -> i32 {
    sched::with_sched(|s| {
        assert!(s.mlfqs, "recent_cpu is tracked only under mlfqs");
        100 * s.thread(s.current).recent_cpu.round()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim;
    use crate::types::TIME_SLICE;

    fn noop(_aux: usize) {}

    #[test]
    fn priority_formula_clamps_at_both_ends() {
        // nice -20 pushes past PRI_MAX, heavy recent_cpu pushes below PRI_MIN
        assert_eq!(priority_for(Fp::ZERO, Nice::new(-20)), Priority::MAX);
        assert_eq!(priority_for(Fp::from_int(400), Nice::new(20)), Priority::MIN);
        assert_eq!(priority_for(Fp::ZERO, Nice::DEFAULT), Priority::MAX);
        assert_eq!(
            priority_for(Fp::from_int(40), Nice::new(2)),
            Priority::new(63 - 10 - 4)
        );
    }

    #[test]
    fn cpu_bound_thread_drifts_down_in_priority() {
        let (_g, p) = sim::boot(true);
        // run for just under a second so no decay has happened yet
        let freq = 100;
        sim::run_ticks(p, (freq - 1) as u32);

        // recent_cpu grew one full tick per tick
        assert_eq!(get_recent_cpu(), 100 * (freq - 1));
        assert_eq!(get_load_avg(), 0);

        // the last dispatch saw recent_cpu at the preceding slice boundary
        let at_dispatch = (freq - 1) / TIME_SLICE as i32 * TIME_SLICE as i32;
        let expect = priority_for(Fp::from_int(at_dispatch), Nice::DEFAULT);
        assert_eq!(crate::sched::get_priority(), expect);
        assert!(expect < Priority::MAX);
    }

    #[test]
    fn second_boundary_decays_recent_cpu_and_moves_load_avg() {
        let (_g, p) = sim::boot(true);
        let freq = 100u32;
        sim::run_ticks(p, freq);

        // one thread was runnable all second long
        let load = Fp::from_ratio(1, 60);
        assert_eq!(get_load_avg(), 100 * load.round());

        // recent_cpu reached freq, then decayed by (2L)/(2L + 1)
        let coeff = (load * 2) / (load * 2 + 1);
        let expect = coeff * Fp::from_int(freq as i32);
        assert_eq!(get_recent_cpu(), 100 * expect.round());
    }

    #[test]
    fn nicer_threads_compute_lower_priorities() {
        let (_g, _p) = sim::boot(true);
        set_nice(Nice::new(5));
        assert_eq!(get_nice(), Nice::new(5));
        assert_eq!(
            crate::sched::get_priority(),
            Priority::new(Priority::MAX.get() - 10)
        );

        set_nice(Nice::new(-5));
        assert_eq!(crate::sched::get_priority(), Priority::MAX);
    }

    #[test]
    fn dispatch_resorts_ready_queue_by_computed_priority() {
        let (_g, p) = sim::boot(true);
        // two CPU-bound peers; the one that has run less ranks higher
        let a = crate::sched::create("A", Priority::MIN, noop, 0);
        sim::run_ticks(p, 2 * TIME_SLICE);
        // main accrued recent_cpu while A sat ready at zero, so the slice
        // expiry handed the CPU to A
        assert_eq!(crate::sched::current(), a);
    }

    #[test]
    fn load_avg_counts_ready_threads() {
        let (_g, p) = sim::boot(true);
        // park several compute threads on the ready queue
        for i in 0..4 {
            crate::sched::create("spin", Priority::MIN, noop, i);
        }
        sim::run_ticks(p, 100);
        // five runnable threads all second: load_avg = 5/60
        let expect = Fp::from_ratio(5, 60);
        assert_eq!(get_load_avg(), 100 * expect.round());
        crate::sched::with_sched(|s| assert_eq!(s.load_avg, expect));
    }

    #[test]
    #[should_panic(expected = "requires the mlfqs scheduler")]
    fn set_nice_halts_under_priority_scheduling() {
        let (_g, _p) = sim::boot(false);
        set_nice(Nice::new(1));
    }
}
