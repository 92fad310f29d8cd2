// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The sleep device: a delta queue of sleeping processes.
//!
//! Entries are ordered by wake time but store only the *difference* in ticks
//! from their predecessor, so the timer handler touches nothing but the
//! head. A process sleeping 30 ticks behind one sleeping 10 carries a delta
//! of 20; when the head's delta reaches zero it wakes, along with every
//! successor whose delta is also zero (they share the same wake tick).

use crate::proc::{ProcState, ProcTable};
use crate::time;

/// Inserts the current process into the delta queue, `slices` ticks from
/// now. The caller has verified `slices > 0`.
pub fn enqueue(t: &mut ProcTable, idx: usize, slices: u32) {
    uassert!(slices > 0);

    let mut remaining = slices;
    let mut prev: Option<usize> = None;
    let mut cur = t.sleep_q;
    // Ties insert after, so equal wake times retain arrival order.
    while let Some(c) = cur {
        if remaining < t[c].delta_slice {
            break;
        }
        remaining -= t[c].delta_slice;
        prev = cur;
        cur = t[c].next;
    }

    t[idx].delta_slice = remaining;
    t[idx].next = cur;
    if let Some(c) = cur {
        t[c].delta_slice -= remaining;
    }
    match prev {
        Some(p) => t[p].next = Some(idx),
        None => t.sleep_q = Some(idx),
    }
    t[idx].state = ProcState::Sleeping;
}

/// Number of sleeping processes.
pub fn sleepers(t: &ProcTable) -> usize {
    let mut n = 0;
    let mut cur = t.sleep_q;
    while let Some(c) = cur {
        n += 1;
        cur = t[c].next;
    }
    n
}

/// Advances the sleep queue by one timer tick: decrements the head's delta
/// and wakes everything whose time has come.
pub fn tick(t: &mut ProcTable) {
    let Some(head) = t.sleep_q else {
        return;
    };
    t[head].delta_slice = t[head].delta_slice.saturating_sub(1);
    if t[head].delta_slice == 0 {
        wake(t);
    }
}

/// Pops every head entry whose cumulative delta has reached zero, making
/// each ready with rc 0 (a clean, full sleep).
fn wake(t: &mut ProcTable) {
    while let Some(head) = t.sleep_q {
        if t[head].delta_slice != 0 {
            break;
        }
        t.sleep_q = t[head].next;
        t[head].next = None;
        t[head].rc = 0;
        t.ready(head);
    }
}

/// Removes a sleeping process from the queue early (a signal is waking it)
/// and returns the milliseconds it had left. The removed entry's delta is
/// folded into its successor so everyone else's wake time is unchanged.
pub fn remove(t: &mut ProcTable, idx: usize) -> u32 {
    uassert_eq!(t[idx].state, ProcState::Sleeping);

    let mut left = 0;
    let mut prev: Option<usize> = None;
    let mut cur = t.sleep_q;
    while let Some(c) = cur {
        left += t[c].delta_slice;
        if c == idx {
            let after = t[c].next;
            let folded = t[c].delta_slice;
            if let Some(a) = after {
                t[a].delta_slice += folded;
            }
            match prev {
                Some(p) => t[p].next = after,
                None => t.sleep_q = after,
            }
            t[c].next = None;
            t[c].delta_slice = 0;
            return time::ms_for_ticks(left);
        }
        prev = cur;
        cur = t[c].next;
    }
    panic!("sleeping process not on sleep queue");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc::PROC_SZ;
    use crate::testutil::{run, spawn};

    fn table_with(n: usize) -> (ProcTable, alloc::vec::Vec<usize>) {
        spawn(n)
    }

    /// Pulls a process out of the ready queue and into the sleep queue, the
    /// way the dispatcher's SLEEP handler does.
    fn sleep_ms(t: &mut ProcTable, idx: usize, ms: u32) {
        run(t, idx);
        enqueue(t, idx, time::ticks_for_ms(ms));
    }

    #[test]
    fn delta_encoding_orders_by_wake_time() {
        let (mut t, ps) = table_with(3);
        sleep_ms(&mut t, ps[0], 30);
        sleep_ms(&mut t, ps[1], 10);
        sleep_ms(&mut t, ps[2], 20);

        // Queue should be p1(1 tick), p2(+1), p0(+1).
        assert_eq!(t.sleep_q, Some(ps[1]));
        assert_eq!(t[ps[1]].delta_slice, 1);
        assert_eq!(t[ps[1]].next, Some(ps[2]));
        assert_eq!(t[ps[2]].delta_slice, 1);
        assert_eq!(t[ps[2]].next, Some(ps[0]));
        assert_eq!(t[ps[0]].delta_slice, 1);
        assert_eq!(sleepers(&t), 3);
        t.check_invariants(None);
    }

    #[test]
    fn wakes_no_earlier_than_requested() {
        let (mut t, ps) = table_with(1);
        sleep_ms(&mut t, ps[0], 100);

        let ticks = 100 / time::TICK_MS;
        for _ in 0..ticks - 1 {
            tick(&mut t);
        }
        assert_eq!(t[ps[0]].state(), ProcState::Sleeping);
        tick(&mut t);
        assert_eq!(t[ps[0]].state(), ProcState::Ready);
        assert_eq!(t[ps[0]].rc, 0);
        assert_eq!(sleepers(&t), 0);
        t.check_invariants(None);
    }

    #[test]
    fn simultaneous_wakers_all_pop() {
        let (mut t, ps) = table_with(2);
        sleep_ms(&mut t, ps[0], 10);
        sleep_ms(&mut t, ps[1], 10);

        tick(&mut t);
        assert_eq!(t[ps[0]].state(), ProcState::Ready);
        assert_eq!(t[ps[1]].state(), ProcState::Ready);
        // Arrival order is preserved through the wake.
        assert_eq!(t.next_ready(), ps[0]);
    }

    #[test]
    fn early_removal_reports_residue_and_preserves_others() {
        let (mut t, ps) = table_with(2);
        sleep_ms(&mut t, ps[0], 20);
        sleep_ms(&mut t, ps[1], 50);

        tick(&mut t); // one tick down
        let left = remove(&mut t, ps[1]);
        assert_eq!(left, 40);

        // p0 still wakes on schedule.
        assert_eq!(t[ps[0]].state(), ProcState::Sleeping);
        tick(&mut t);
        assert_eq!(t[ps[0]].state(), ProcState::Ready);
    }

    #[test]
    fn removal_of_middle_entry_extends_successor() {
        let (mut t, ps) = table_with(3);
        sleep_ms(&mut t, ps[0], 10);
        sleep_ms(&mut t, ps[1], 20);
        sleep_ms(&mut t, ps[2], 30);

        let left = remove(&mut t, ps[1]);
        assert_eq!(left, 20);
        // p2's cumulative wake time is unchanged: 1 + 2 deltas.
        assert_eq!(t[ps[0]].delta_slice, 1);
        assert_eq!(t[ps[0]].next, Some(ps[2]));
        assert_eq!(t[ps[2]].delta_slice, 2);
    }

    #[test]
    fn table_stays_partitioned() {
        let (mut t, ps) = table_with(4);
        sleep_ms(&mut t, ps[0], 10);
        sleep_ms(&mut t, ps[1], 30);
        assert_eq!(sleepers(&t) + t.ready_len() + t.stop_len(), PROC_SZ);
        t.check_invariants(None);
    }
}
