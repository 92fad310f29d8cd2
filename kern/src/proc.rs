// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implementation of processes.
//!
//! Every process control block lives in a fixed arena, [`ProcTable`], and
//! all of the kernel's queues (ready, stop, sleep, and the per-process wait
//! lists) are singly-linked lists of slot *indices* threaded through the
//! arena. The table owns the PCBs; queues only borrow membership. That makes
//! the central structural invariant -- each PCB is in at most one queue at a
//! time -- a checkable property rather than a convention, and
//! [`ProcTable::check_invariants`] checks it.
//!
//! State transitions are coupled to queue membership in this module so the
//! rest of the kernel can't produce a PCB whose state disagrees with where
//! it's linked: `BlockedSend`/`BlockedRecv` are only set by the enqueue
//! helpers, `Ready` only by [`ProcTable::ready`], and so on.

use alloc::boxed::Box;
use alloc::vec;

use abi::{ANY_PID, ERR_IPC, IDLE_PID, INVALID_PID};

use crate::arch;

/// Number of PCB slots in the table.
pub const PROC_SZ: usize = 16;

/// Smallest stack the kernel will give a process, in machine words.
pub const MIN_STACK_WORDS: usize = 1024;

/// File descriptor table size.
pub const FDT_SZ: usize = 4;

/// Cells in a resume frame: eight general registers, eip, cs, eflags, and
/// the return slot that catches a process falling off its entry function.
const INIT_FRAME_WORDS: usize = 12;

const WORD: usize = core::mem::size_of::<usize>();

/// Where a process stands with the scheduler.
///
/// Blocking states name peer *slots*, not pids; a slot index stays valid for
/// as long as the peer is live, which is exactly as long as the block lasts
/// (stopping a process releases everyone blocked on it).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ProcState {
    /// Slot is unused; PCB is on the stop queue.
    Stopped,
    /// On the ready queue, waiting for the dispatcher.
    Ready,
    /// Selected by the dispatcher; at most one process at a time.
    Running,
    /// On the sleep delta queue.
    Sleeping,
    /// Waiting to deliver a message to the named slot.
    BlockedSend(usize),
    /// Waiting for a message, either from the named slot or (`None`) from
    /// anyone.
    BlockedRecv(Option<usize>),
    /// Waiting in SIG_WAIT for any signal.
    BlockedSig,
    /// Waiting for a device driver to complete a read; the driver owns the
    /// wakeup.
    BlockedDev,
}

/// An open file descriptor: an index into the device switch table.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Fd {
    pub dev: usize,
}

/// Head and tail of a FIFO of PCB slots, linked through `Process::next`.
#[derive(Copy, Clone, Debug, Default)]
pub struct List {
    head: Option<usize>,
    tail: Option<usize>,
}

impl List {
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }
}

/// A process control block.
#[derive(Debug)]
pub struct Process {
    /// Stable identity; `INVALID_PID` while stopped.
    pid: u32,
    pub(crate) state: ProcState,
    /// Saved user stack pointer. Stale while the process is running; valid
    /// in every other state.
    pub esp: usize,
    /// Value delivered into the process's return register on next resume.
    pub rc: i32,
    /// Pointer into the user stack to the current request's argument record.
    pub args: usize,
    /// The process stack. Owning it here means STOP frees it by dropping.
    mem: Option<Box<[usize]>>,
    /// Link for whichever queue currently holds this slot.
    pub(crate) next: Option<usize>,
    /// Processes blocked sending to this one, in arrival order.
    pub(crate) blocked_senders: List,
    /// Processes blocked receiving from this one, in arrival order. A
    /// receive-from-anyone parks on its own list.
    pub(crate) blocked_receivers: List,
    /// Ticks after the predecessor in the sleep queue at which to wake.
    pub(crate) delta_slice: u32,
    /// Bit i set: signal i delivered but not yet serviced.
    pub sig_pend_mask: u32,
    /// Bit i *clear*: signal i is masked. All-ones on create.
    pub sig_ignore_mask: u32,
    /// Installed handler addresses; 0 = uninstalled. Slot 0 reserved, 31
    /// highest priority.
    pub sig_handlers: [usize; abi::SIG_SLOTS as usize],
    /// Open devices.
    pub fdt: [Option<Fd>; FDT_SZ],
}

impl Process {
    fn new() -> Self {
        Process {
            pid: INVALID_PID,
            state: ProcState::Stopped,
            esp: 0,
            rc: 0,
            args: 0,
            mem: None,
            next: None,
            blocked_senders: List::default(),
            blocked_receivers: List::default(),
            delta_slice: 0,
            sig_pend_mask: 0,
            sig_ignore_mask: !0,
            sig_handlers: [0; abi::SIG_SLOTS as usize],
            fdt: [None; FDT_SZ],
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn state(&self) -> ProcState {
        self.state
    }

    /// Base address of the process stack, for bounds reasoning and tests.
    pub fn stack_base(&self) -> Option<usize> {
        self.mem.as_ref().map(|m| m.as_ptr() as usize)
    }
}

fn list_push(procs: &mut [Process], q: &mut List, idx: usize) {
    procs[idx].next = None;
    match q.tail {
        Some(t) => procs[t].next = Some(idx),
        None => q.head = Some(idx),
    }
    q.tail = Some(idx);
}

fn list_pop(procs: &mut [Process], q: &mut List) -> Option<usize> {
    let head = q.head?;
    q.head = procs[head].next;
    if q.head.is_none() {
        q.tail = None;
    }
    procs[head].next = None;
    Some(head)
}

fn list_unlink(procs: &mut [Process], q: &mut List, idx: usize) -> bool {
    let mut prev: Option<usize> = None;
    let mut cur = q.head;
    while let Some(c) = cur {
        if c == idx {
            let after = procs[c].next;
            match prev {
                Some(p) => procs[p].next = after,
                None => q.head = after,
            }
            if q.tail == Some(c) {
                q.tail = prev;
            }
            procs[c].next = None;
            return true;
        }
        prev = cur;
        cur = procs[c].next;
    }
    false
}

fn list_iter<'a>(procs: &'a [Process], q: &List) -> ListIter<'a> {
    ListIter {
        procs,
        cur: q.head,
    }
}

struct ListIter<'a> {
    procs: &'a [Process],
    cur: Option<usize>,
}

impl Iterator for ListIter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let c = self.cur?;
        self.cur = self.procs[c].next;
        Some(c)
    }
}

/// The process table: the arena of PCB slots plus every kernel-global queue
/// head.
pub struct ProcTable {
    procs: [Process; PROC_SZ],
    ready_q: List,
    stop_q: List,
    /// Head of the sleep delta queue, linked through `Process::next`.
    pub(crate) sleep_q: Option<usize>,
    next_pid: u32,
}

impl ProcTable {
    /// Builds a table of stopped slots, all parked on the stop queue.
    pub fn new() -> Self {
        let mut t = ProcTable {
            procs: core::array::from_fn(|_| Process::new()),
            ready_q: List::default(),
            stop_q: List::default(),
            sleep_q: None,
            next_pid: 1,
        };
        for i in 0..PROC_SZ {
            let mut q = t.stop_q;
            list_push(&mut t.procs, &mut q, i);
            t.stop_q = q;
        }
        t
    }

    /// Makes `idx` ready: appends it to the ready queue tail. The caller
    /// must have already detached it from wherever it was.
    pub fn ready(&mut self, idx: usize) {
        uassert!(self.procs[idx].state != ProcState::Stopped);
        self.procs[idx].state = ProcState::Ready;
        list_push(&mut self.procs, &mut self.ready_q, idx);
    }

    /// Detaches the next process to run from the ready queue head. The idle
    /// process runs only when nothing else is ready: if it surfaces while
    /// the queue is non-empty it is re-enqueued and the next head taken.
    ///
    /// # Panics
    ///
    /// If the ready queue is empty, which cannot happen once the idle
    /// process exists: idle never blocks, so it is always either ready or
    /// the process being dispatched.
    pub fn next_ready(&mut self) -> usize {
        let first = list_pop(&mut self.procs, &mut self.ready_q)
            .unwrap_or_else(|| panic!("ready queue empty"));
        if self.procs[first].pid == IDLE_PID && !self.ready_q.is_empty() {
            list_push(&mut self.procs, &mut self.ready_q, first);
            // Unwrap is fine: we just pushed, the queue is non-empty.
            list_pop(&mut self.procs, &mut self.ready_q).unwrap()
        } else {
            first
        }
    }

    /// Marks a freshly selected process as the running one.
    pub fn set_running(&mut self, idx: usize) {
        uassert_eq!(self.procs[idx].state, ProcState::Ready);
        self.procs[idx].state = ProcState::Running;
    }

    /// Ready-queue length.
    pub fn ready_len(&self) -> usize {
        list_iter(&self.procs, &self.ready_q).count()
    }

    /// Stop-queue length, computed directly by walking the stop queue.
    pub fn stop_len(&self) -> usize {
        list_iter(&self.procs, &self.stop_q).count()
    }

    /// Looks up a live process by pid.
    pub fn find(&self, pid: u32) -> Option<usize> {
        if pid == INVALID_PID || pid == ANY_PID {
            return None;
        }
        self.procs
            .iter()
            .position(|p| p.state != ProcState::Stopped && p.pid == pid)
    }

    fn alloc_pid(&mut self) -> u32 {
        loop {
            let candidate = self.next_pid;
            self.next_pid = self.next_pid.wrapping_add(1);
            if candidate == ANY_PID || candidate == INVALID_PID {
                continue;
            }
            if self.find(candidate).is_none() {
                return candidate;
            }
        }
    }

    /// Creates a process: reserves a PCB slot from the stop queue, allocates
    /// its stack, writes the initial resume frame, and enqueues it ready.
    ///
    /// Returns the new pid, or 0 if no PCB slot is free.
    pub fn create(&mut self, entry: usize, stack_size: usize) -> u32 {
        let Some(slot) = list_pop(&mut self.procs, &mut self.stop_q) else {
            return 0;
        };

        let words = stack_size.div_ceil(WORD).max(MIN_STACK_WORDS);
        let mut mem = vec![0usize; words].into_boxed_slice();

        // Initial frame at the stack top, in resume order: eight zeroed
        // registers, then the iret image, then the landing slot for a return
        // from the entry function.
        let f = words - INIT_FRAME_WORDS;
        mem[f + 8] = entry;
        mem[f + 9] = arch::CODE_SELECTOR;
        mem[f + 10] = arch::INITIAL_EFLAGS;
        mem[f + 11] = arch::exit_entry();

        let pid = self.alloc_pid();
        let p = &mut self.procs[slot];
        p.pid = pid;
        p.esp = mem.as_ptr() as usize + f * WORD;
        p.rc = 0;
        p.args = 0;
        p.mem = Some(mem);
        p.delta_slice = 0;
        p.sig_pend_mask = 0;
        p.sig_ignore_mask = !0;
        p.sig_handlers = [0; abi::SIG_SLOTS as usize];
        p.fdt = [None; FDT_SZ];
        self.ready(slot);
        pid
    }

    /// Stops the running process: releases everyone blocked on it with
    /// `ERR_IPC`, invalidates its pid, frees its stack, and returns the slot
    /// to the stop queue.
    pub fn stop_proc(&mut self, idx: usize) {
        uassert_eq!(self.procs[idx].state, ProcState::Running);
        self.release_senders(idx);
        self.release_receivers(idx);
        let p = &mut self.procs[idx];
        p.pid = INVALID_PID;
        p.state = ProcState::Stopped;
        p.mem = None;
        list_push(&mut self.procs, &mut self.stop_q, idx);
    }

    /// Unblocks every process waiting to send to `host`, with `ERR_IPC`.
    pub(crate) fn release_senders(&mut self, host: usize) {
        let mut q = self.procs[host].blocked_senders;
        while let Some(i) = list_pop(&mut self.procs, &mut q) {
            self.procs[i].rc = ERR_IPC;
            self.ready(i);
        }
        self.procs[host].blocked_senders = q;
    }

    /// Unblocks every process waiting to receive from `host`, with
    /// `ERR_IPC`.
    pub(crate) fn release_receivers(&mut self, host: usize) {
        let mut q = self.procs[host].blocked_receivers;
        while let Some(i) = list_pop(&mut self.procs, &mut q) {
            self.procs[i].rc = ERR_IPC;
            self.ready(i);
        }
        self.procs[host].blocked_receivers = q;
    }

    /// Parks `idx` on `host`'s sender wait queue.
    pub(crate) fn enqueue_sender(&mut self, host: usize, idx: usize) {
        self.procs[idx].state = ProcState::BlockedSend(host);
        let mut q = self.procs[host].blocked_senders;
        list_push(&mut self.procs, &mut q, idx);
        self.procs[host].blocked_senders = q;
    }

    /// Parks `idx` on `host`'s receiver wait queue. A receive-from-anyone
    /// passes `from = None` and `host = idx` (it parks on its own list).
    pub(crate) fn enqueue_receiver(
        &mut self,
        host: usize,
        idx: usize,
        from: Option<usize>,
    ) {
        uassert!(from.map(|f| f == host).unwrap_or(host == idx));
        self.procs[idx].state = ProcState::BlockedRecv(from);
        let mut q = self.procs[host].blocked_receivers;
        list_push(&mut self.procs, &mut q, idx);
        self.procs[host].blocked_receivers = q;
    }

    /// Head of `host`'s sender wait queue, detached, if any.
    pub(crate) fn dequeue_sender(&mut self, host: usize) -> Option<usize> {
        let mut q = self.procs[host].blocked_senders;
        let popped = list_pop(&mut self.procs, &mut q);
        self.procs[host].blocked_senders = q;
        popped
    }

    /// Detaches a specific sender from `host`'s wait queue.
    pub(crate) fn unlink_sender(&mut self, host: usize, idx: usize) -> bool {
        let mut q = self.procs[host].blocked_senders;
        let found = list_unlink(&mut self.procs, &mut q, idx);
        self.procs[host].blocked_senders = q;
        found
    }

    /// Detaches a specific receiver from `host`'s wait queue.
    pub(crate) fn unlink_receiver(&mut self, host: usize, idx: usize) -> bool {
        let mut q = self.procs[host].blocked_receivers;
        let found = list_unlink(&mut self.procs, &mut q, idx);
        self.procs[host].blocked_receivers = q;
        found
    }

    /// Completes a driver-owned wakeup: delivers `rc` to a process blocked
    /// on a device and makes it ready.
    pub fn unblock_dev(&mut self, idx: usize, rc: i32) {
        uassert_eq!(self.procs[idx].state, ProcState::BlockedDev);
        self.procs[idx].rc = rc;
        self.ready(idx);
    }

    /// Verifies the structural invariants: every PCB slot is accounted for
    /// exactly once across the ready queue, stop queue, sleep queue, and
    /// wait lists -- or is in one of the queue-less states (`Running`,
    /// `BlockedSig`, `BlockedDev`) -- and each queue member's state matches
    /// the queue holding it.
    ///
    /// `running` names the slot the dispatcher currently has detached, if
    /// any.
    ///
    /// # Panics
    ///
    /// On any violation. This is for tests and debugging; a failure here is
    /// a kernel bug, which the error model says is unrecoverable.
    pub fn check_invariants(&self, running: Option<usize>) {
        let mut seen = [false; PROC_SZ];
        let mut mark = |seen: &mut [bool; PROC_SZ], i: usize| {
            uassert!(!seen[i]);
            seen[i] = true;
        };

        for i in list_iter(&self.procs, &self.ready_q) {
            uassert_eq!(self.procs[i].state, ProcState::Ready);
            mark(&mut seen, i);
        }
        for i in list_iter(&self.procs, &self.stop_q) {
            uassert_eq!(self.procs[i].state, ProcState::Stopped);
            uassert_eq!(self.procs[i].pid, INVALID_PID);
            uassert!(self.procs[i].mem.is_none());
            mark(&mut seen, i);
        }
        let mut cur = self.sleep_q;
        while let Some(i) = cur {
            uassert_eq!(self.procs[i].state, ProcState::Sleeping);
            mark(&mut seen, i);
            cur = self.procs[i].next;
        }
        for host in 0..PROC_SZ {
            for i in list_iter(&self.procs, &self.procs[host].blocked_senders)
            {
                uassert_eq!(self.procs[i].state, ProcState::BlockedSend(host));
                mark(&mut seen, i);
            }
            for i in
                list_iter(&self.procs, &self.procs[host].blocked_receivers)
            {
                match self.procs[i].state {
                    ProcState::BlockedRecv(Some(s)) => uassert_eq!(s, host),
                    ProcState::BlockedRecv(None) => uassert_eq!(i, host),
                    _ => panic!("receiver queue holds non-receiver"),
                }
                mark(&mut seen, i);
            }
        }
        for i in 0..PROC_SZ {
            if seen[i] {
                continue;
            }
            match self.procs[i].state {
                ProcState::Running => uassert_eq!(running, Some(i)),
                ProcState::BlockedSig | ProcState::BlockedDev => (),
                other => panic!("slot {i} unaccounted for in {other:?}"),
            }
            seen[i] = true;
        }

        // The idle process never blocks: it is only ever ready or running.
        if let Some(i) = self.find(IDLE_PID) {
            uassert!(matches!(
                self.procs[i].state,
                ProcState::Ready | ProcState::Running
            ));
        }
    }
}

impl core::ops::Index<usize> for ProcTable {
    type Output = Process;

    fn index(&self, idx: usize) -> &Process {
        &self.procs[idx]
    }
}

impl core::ops::IndexMut<usize> for ProcTable {
    fn index_mut(&mut self, idx: usize) -> &mut Process {
        &mut self.procs[idx]
    }
}

impl Default for ProcTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_table_is_all_stopped() {
        let t = ProcTable::new();
        assert_eq!(t.stop_len(), PROC_SZ);
        assert_eq!(t.ready_len(), 0);
        t.check_invariants(None);
    }

    #[test]
    fn create_assigns_increasing_pids() {
        let mut t = ProcTable::new();
        assert_eq!(t.create(0x1000, 0), IDLE_PID);
        assert_eq!(t.create(0x2000, 0), 2);
        assert_eq!(t.create(0x3000, 0), 3);
        assert_eq!(t.ready_len(), 3);
        assert_eq!(t.stop_len(), PROC_SZ - 3);
        t.check_invariants(None);
    }

    #[test]
    fn create_fails_when_table_full() {
        let mut t = ProcTable::new();
        for _ in 0..PROC_SZ {
            assert_ne!(t.create(0x1000, 0), 0);
        }
        assert_eq!(t.create(0x1000, 0), 0);
        t.check_invariants(None);
    }

    #[test]
    fn initial_frame_layout() {
        let mut t = ProcTable::new();
        let pid = t.create(0xabcd, 64 * 1024);
        let idx = t.find(pid).unwrap();
        let p = &t[idx];
        let base = p.stack_base().unwrap();
        // Frame sits at the stack top.
        let words = (64 * 1024) / WORD;
        assert_eq!(p.esp, base + (words - INIT_FRAME_WORDS) * WORD);
        let frame = unsafe {
            core::slice::from_raw_parts(p.esp as *const usize, INIT_FRAME_WORDS)
        };
        assert_eq!(&frame[..8], &[0; 8]);
        assert_eq!(frame[8], 0xabcd);
        assert_eq!(frame[9], arch::CODE_SELECTOR);
        assert_eq!(frame[10], arch::INITIAL_EFLAGS);
        assert_eq!(frame[11], arch::exit_entry());
    }

    #[test]
    fn ready_queue_is_fifo() {
        let mut t = ProcTable::new();
        t.create(0, 0); // idle
        let b_pid = t.create(0, 0);
        let b = t.find(b_pid).unwrap();
        let c_pid = t.create(0, 0);
        let c = t.find(c_pid).unwrap();
        assert_eq!(t.next_ready(), b);
        t.set_running(b);
        t.ready(b);
        assert_eq!(t.next_ready(), c);
        t.set_running(c);
        t.ready(c);
        assert_eq!(t.next_ready(), b);
    }

    #[test]
    fn idle_runs_only_when_alone() {
        let mut t = ProcTable::new();
        t.create(0, 0); // idle, at the queue head
        let other_pid = t.create(0, 0);
        let other = t.find(other_pid).unwrap();
        let idle = t.find(IDLE_PID).unwrap();

        // Idle is skipped while another process is ready.
        assert_eq!(t.next_ready(), other);
        t.set_running(other);

        // With only idle remaining, it is selected.
        assert_eq!(t.next_ready(), idle);
        t.set_running(idle);
        t.ready(idle);
        t.ready(other);
        t.check_invariants(None);
    }

    #[test]
    fn stop_returns_slot_and_frees_stack() {
        let mut t = ProcTable::new();
        let pid = t.create(0x1000, 0);
        let idx = t.find(pid).unwrap();
        assert_eq!(t.next_ready(), idx);
        t.set_running(idx);
        t.stop_proc(idx);
        assert_eq!(t[idx].pid(), INVALID_PID);
        assert!(t[idx].stack_base().is_none());
        assert_eq!(t.stop_len(), PROC_SZ);
        assert_eq!(t.find(pid), None);
        t.check_invariants(None);
    }

    #[test]
    fn stop_releases_blocked_peers() {
        let mut t = ProcTable::new();
        t.create(0, 0); // idle
        let a_pid = t.create(0, 0);
        let a = t.find(a_pid).unwrap();
        let b_pid = t.create(0, 0);
        let b = t.find(b_pid).unwrap();
        let c_pid = t.create(0, 0);
        let c = t.find(c_pid).unwrap();

        // b sends to a, c receives from a; both block.
        assert_eq!(t.next_ready(), a);
        t.set_running(a);
        t.unlink_ready_for_test(b);
        t.enqueue_sender(a, b);
        t.unlink_ready_for_test(c);
        t.enqueue_receiver(a, c, Some(a));
        t.check_invariants(Some(a));

        t.stop_proc(a);
        assert_eq!(t[b].state(), ProcState::Ready);
        assert_eq!(t[b].rc, ERR_IPC);
        assert_eq!(t[c].state(), ProcState::Ready);
        assert_eq!(t[c].rc, ERR_IPC);
        assert!(t[a].blocked_senders.is_empty());
        assert!(t[a].blocked_receivers.is_empty());
        t.check_invariants(None);
    }

    #[test]
    fn pids_are_not_reused_while_live() {
        let mut t = ProcTable::new();
        let first = t.create(0, 0);
        let idx = t.find(first).unwrap();
        assert_eq!(t.next_ready(), idx);
        t.set_running(idx);
        t.stop_proc(idx);
        let second = t.create(0, 0);
        assert_ne!(first, second);
    }

    impl ProcTable {
        /// Test-only: pull a process out of the ready queue so it can be
        /// re-parked somewhere else, the way the dispatcher does by
        /// selecting it.
        fn unlink_ready_for_test(&mut self, idx: usize) {
            let mut q = self.ready_q;
            assert!(list_unlink(&mut self.procs, &mut q, idx));
            self.ready_q = q;
        }
    }
}
