// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Signals: per-process pending/ignore masks, installable handlers, and
//! stacked delivery through a user-stack trampoline.
//!
//! Each process has 32 signal slots; slot 0 is reserved and slot 31 is the
//! most important. A pending bit is set by SIG_KILL (or kernel code) and
//! serviced at the head of the dispatch loop: the highest unmasked pending
//! signal gets a fresh resume frame pushed on the target's user stack, so
//! the process "returns" into its handler. The frame's tail holds the
//! pre-delivery stack pointer, rc, and ignore mask, and the handler's own
//! return flows into a stub that hands exactly that triple back to the
//! kernel as a SIG_RETURN request. Delivery never bypasses that syscall:
//! a handler for signal 9 can itself be interrupted by signal 20, stacking
//! a second frame on the first, and each SIG_RETURN peels one layer.
//!
//! While a handler runs, the delivered signal and everything at or below
//! its priority is masked (the ignore mask has those bits *cleared*);
//! SIG_RETURN restores the saved mask, which is what re-admits them.

use abi::{
    SigHandlerArgs, SigKillArgs, SigReturnArgs, ERR_SIGKILL_PROC_NO,
    ERR_SIGKILL_SIG_NO, ERR_SIGNAL_PROC_NO, ERR_SIGNAL_SIG_NO, SIG_MAX,
};

use crate::arch;
use crate::err::{Sched, UserError};
use crate::proc::{ProcState, ProcTable, Process};
use crate::sleep;
use crate::umem;

const WORD: usize = core::mem::size_of::<usize>();

/// Cells in a delivery frame: a full resume frame (eight registers plus the
/// iret image) aimed at the handler, the trampoline return slot, and the
/// saved (esp, rc, ignore mask) triple.
const DELIVERY_FRAME_WORDS: usize = 15;

/// Word offset of the saved triple within a delivery frame; the trampoline
/// stub's stack pointer lands here, which is what makes the triple its
/// argument record.
pub const DELIVERY_CONTEXT_OFFSET: usize = 12;

/// Implementation of the SIG_HANDLER request: swaps the caller's handler
/// slot, writing the previous address back through the caller's pointer.
pub fn install(t: &mut ProcTable, caller: usize) -> Result<Sched, UserError> {
    let a: SigHandlerArgs = umem::read_args(t[caller].args)
        .map_err(|_| UserError(ERR_SIGNAL_SIG_NO))?;
    if a.sig_no == 0 || a.sig_no > SIG_MAX {
        return Err(UserError(ERR_SIGNAL_SIG_NO));
    }
    let old = t[caller].sig_handlers[a.sig_no as usize];
    umem::write_words(a.old_handler_ptr, &[old])
        .map_err(|_| UserError(ERR_SIGNAL_SIG_NO))?;
    t[caller].sig_handlers[a.sig_no as usize] = a.handler;
    t[caller].rc = 0;
    Ok(Sched::Ready)
}

/// Implementation of the SIG_KILL request. The target-validation errors are
/// remapped to their `ERR_SIGKILL_*` twins for user consumption.
pub fn kill(t: &mut ProcTable, caller: usize) -> Result<Sched, UserError> {
    let a: SigKillArgs = umem::read_args(t[caller].args)
        .map_err(|_| UserError(ERR_SIGKILL_SIG_NO))?;
    match signal(t, a.pid, a.sig_no) {
        Ok(()) => {
            t[caller].rc = 0;
            Ok(Sched::Ready)
        }
        Err(ERR_SIGNAL_PROC_NO) => Err(UserError(ERR_SIGKILL_PROC_NO)),
        Err(_) => Err(UserError(ERR_SIGKILL_SIG_NO)),
    }
}

/// Posts signal `sig` to the process with pid `pid`.
///
/// The pending bit is always set; whether the target also wakes depends on
/// its state. A SIG_WAIT target becomes ready with the signal number as its
/// rc. A sleeping target is pulled off the delta queue with its residual
/// milliseconds as its rc. Targets blocked in IPC or on a device hold the
/// bit pending until their blocking call completes on its own.
pub fn signal(t: &mut ProcTable, pid: u32, sig: u32) -> Result<(), i32> {
    if sig == 0 || sig > SIG_MAX {
        return Err(ERR_SIGNAL_SIG_NO);
    }
    let idx = t.find(pid).ok_or(ERR_SIGNAL_PROC_NO)?;
    t[idx].sig_pend_mask |= 1 << sig;
    match t[idx].state() {
        ProcState::BlockedSig => {
            t[idx].rc = sig as i32;
            t.ready(idx);
        }
        ProcState::Sleeping => {
            let left_ms = sleep::remove(t, idx);
            t[idx].rc = left_ms as i32;
            t.ready(idx);
        }
        _ => (),
    }
    Ok(())
}

/// Delivers at most one pending unmasked signal to `idx`, called once per
/// dispatch entry just before the context switch.
///
/// The highest-numbered deliverable signal wins. Pending signals whose slot
/// has no installed handler are discarded. On delivery the process's rc
/// becomes the signal number (which is how a woken SIG_WAIT learns what
/// fired even through a handler's save/restore).
pub fn deliver_pending(t: &mut ProcTable, idx: usize) {
    loop {
        let firing = t[idx].sig_pend_mask & t[idx].sig_ignore_mask;
        if firing == 0 {
            return;
        }
        let sig = 31 - firing.leading_zeros();
        t[idx].sig_pend_mask &= !(1 << sig);
        let handler = t[idx].sig_handlers[sig as usize];
        if handler == 0 {
            continue;
        }
        push_delivery_frame(t, idx, sig, handler);
        return;
    }
}

fn push_delivery_frame(
    t: &mut ProcTable,
    idx: usize,
    sig: u32,
    handler: usize,
) {
    let old_esp = t[idx].esp;
    let old_rc = t[idx].rc;
    let old_mask = t[idx].sig_ignore_mask;

    let mut frame = [0usize; DELIVERY_FRAME_WORDS];
    frame[8] = handler;
    frame[9] = arch::CODE_SELECTOR;
    frame[10] = arch::INITIAL_EFLAGS;
    frame[11] = arch::sigret_entry();
    frame[12] = old_esp;
    frame[13] = old_rc as isize as usize;
    frame[14] = old_mask as usize;

    // A stack too deep to take the frame means the process has already
    // overflowed; there is no value to deliver failure through, so this is
    // one of the halting conditions.
    let new_esp = old_esp
        .checked_sub(DELIVERY_FRAME_WORDS * WORD)
        .unwrap_or_else(|| panic!("stack exhausted delivering signal"));
    let wrote = umem::write_words(new_esp, &frame);
    uassert!(wrote.is_ok());

    t[idx].esp = new_esp;
    // Mask the delivered signal and everything below it until SIG_RETURN
    // restores the saved mask.
    let masked = u32::MAX >> (31 - sig);
    t[idx].sig_ignore_mask &= !masked;
    t[idx].rc = sig as i32;
}

/// Implementation of the SIG_RETURN request, issued only by the trampoline
/// stub: restores the saved stack pointer and rc, and re-enables the masked
/// signals. The restored stack may itself be another delivery frame.
pub fn sigreturn(t: &mut ProcTable, caller: usize) -> Sched {
    // The argument record is the tail of a frame this kernel built; failing
    // to read it back means kernel state is corrupt, not user error.
    let a: SigReturnArgs = umem::read_args(t[caller].args)
        .unwrap_or_else(|_| panic!("corrupt signal delivery frame"));
    t[caller].esp = a.old_esp;
    t[caller].rc = a.old_rc as i32;
    sigcease(&mut t[caller], a.old_mask as u32);
    Sched::Ready
}

/// Re-enables signals by restoring a previously saved ignore mask.
pub fn sigcease(p: &mut Process, mask: u32) {
    p.sig_ignore_mask = mask;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{run, set_args, spawn};

    fn install_handler(
        t: &mut ProcTable,
        idx: usize,
        sig: u32,
        handler: usize,
    ) -> (Result<Sched, UserError>, usize) {
        let mut old: usize = 0;
        set_args(
            t,
            idx,
            SigHandlerArgs {
                handler,
                old_handler_ptr: core::ptr::addr_of_mut!(old) as usize,
                sig_no: sig,
            },
        );
        let r = install(t, idx);
        (r, old)
    }

    #[test]
    fn install_swaps_handlers() {
        let (mut t, ps) = spawn(1);
        let p = ps[0];
        run(&mut t, p);

        let (r, old) = install_handler(&mut t, p, 5, 0x1111);
        assert_eq!(r, Ok(Sched::Ready));
        assert_eq!(old, 0);
        assert_eq!(t[p].rc, 0);
        t.ready(p);

        run(&mut t, p);
        let (r, old) = install_handler(&mut t, p, 5, 0x2222);
        assert_eq!(r, Ok(Sched::Ready));
        assert_eq!(old, 0x1111);
        assert_eq!(t[p].sig_handlers[5], 0x2222);
    }

    #[test]
    fn install_rejects_bad_signal_numbers() {
        let (mut t, ps) = spawn(1);
        let p = ps[0];
        run(&mut t, p);
        let (r, _) = install_handler(&mut t, p, 0, 0x1111);
        assert_eq!(r, Err(UserError(ERR_SIGNAL_SIG_NO)));
        let (r, _) = install_handler(&mut t, p, 32, 0x1111);
        assert_eq!(r, Err(UserError(ERR_SIGNAL_SIG_NO)));
    }

    #[test]
    fn kill_remaps_errors() {
        let (mut t, ps) = spawn(1);
        let p = ps[0];
        run(&mut t, p);
        set_args(&mut t, p, SigKillArgs { pid: 999, sig_no: 4 });
        assert_eq!(kill(&mut t, p), Err(UserError(ERR_SIGKILL_PROC_NO)));

        let pid = t[p].pid();
        set_args(&mut t, p, SigKillArgs { pid, sig_no: 0 });
        assert_eq!(kill(&mut t, p), Err(UserError(ERR_SIGKILL_SIG_NO)));
    }

    #[test]
    fn delivery_builds_trampoline_frame() {
        let (mut t, ps) = spawn(1);
        let p = ps[0];
        t[p].sig_handlers[9] = 0xbeef;
        t[p].rc = 42;
        let old_esp = t[p].esp;

        let pid = t[p].pid();
        signal(&mut t, pid, 9).unwrap();
        assert_eq!(t[p].sig_pend_mask, 1 << 9);
        deliver_pending(&mut t, p);

        assert_eq!(t[p].sig_pend_mask, 0);
        assert_eq!(t[p].esp, old_esp - DELIVERY_FRAME_WORDS * WORD);
        assert_eq!(t[p].rc, 9);
        // Signals 0..=9 are masked for the handler's duration.
        assert_eq!(t[p].sig_ignore_mask, !0u32 << 10);

        let frame = unsafe {
            core::slice::from_raw_parts(
                t[p].esp as *const usize,
                DELIVERY_FRAME_WORDS,
            )
        };
        assert_eq!(&frame[..8], &[0; 8]);
        assert_eq!(frame[8], 0xbeef);
        assert_eq!(frame[9], arch::CODE_SELECTOR);
        assert_eq!(frame[10], arch::INITIAL_EFLAGS);
        assert_eq!(frame[11], arch::sigret_entry());
        assert_eq!(frame[12], old_esp);
        assert_eq!(frame[13], 42);
        assert_eq!(frame[14], !0usize & u32::MAX as usize);
    }

    #[test]
    fn sigreturn_unwinds_delivery() {
        let (mut t, ps) = spawn(1);
        let p = ps[0];
        t[p].sig_handlers[3] = 0x3333;
        t[p].rc = 7;
        let old_esp = t[p].esp;

        let pid = t[p].pid();
        signal(&mut t, pid, 3).unwrap();
        deliver_pending(&mut t, p);

        // The stub presents the frame tail as the SIG_RETURN record.
        run(&mut t, p);
        t[p].args = t[p].esp + DELIVERY_CONTEXT_OFFSET * WORD;
        assert_eq!(sigreturn(&mut t, p), Sched::Ready);

        assert_eq!(t[p].esp, old_esp);
        assert_eq!(t[p].rc, 7);
        assert_eq!(t[p].sig_ignore_mask, !0);
    }

    #[test]
    fn higher_signal_delivers_first_then_lower_on_return() {
        let (mut t, ps) = spawn(1);
        let p = ps[0];
        t[p].sig_handlers[1] = 0x1111;
        t[p].sig_handlers[3] = 0x3333;

        let pid = t[p].pid();
        signal(&mut t, pid, 1).unwrap();
        signal(&mut t, pid, 3).unwrap();
        assert_eq!(t[p].sig_pend_mask, 0b1010);

        deliver_pending(&mut t, p);
        assert_eq!(t[p].rc, 3);
        let frame_eip = unsafe { *((t[p].esp as *const usize).add(8)) };
        assert_eq!(frame_eip, 0x3333);
        // Signal 1 is now masked; nothing further delivers yet.
        let before = t[p].esp;
        deliver_pending(&mut t, p);
        assert_eq!(t[p].esp, before);
        assert_eq!(t[p].sig_pend_mask, 0b0010);

        // Handler 3 returns; the saved mask re-admits signal 1.
        run(&mut t, p);
        t[p].args = t[p].esp + DELIVERY_CONTEXT_OFFSET * WORD;
        assert_eq!(sigreturn(&mut t, p), Sched::Ready);

        deliver_pending(&mut t, p);
        assert_eq!(t[p].rc, 1);
        let frame_eip = unsafe { *((t[p].esp as *const usize).add(8)) };
        assert_eq!(frame_eip, 0x1111);
        assert_eq!(t[p].sig_pend_mask, 0);
    }

    #[test]
    fn unhandled_signals_are_discarded() {
        let (mut t, ps) = spawn(1);
        let p = ps[0];
        let esp = t[p].esp;
        let pid = t[p].pid();
        signal(&mut t, pid, 12).unwrap();
        deliver_pending(&mut t, p);
        assert_eq!(t[p].sig_pend_mask, 0);
        assert_eq!(t[p].esp, esp);
    }

    #[test]
    fn signal_wakes_sigwait_with_signal_number() {
        let (mut t, ps) = spawn(1);
        let p = ps[0];
        run(&mut t, p);
        t[p].state = ProcState::BlockedSig;
        t.check_invariants(None);

        let pid = t[p].pid();
        signal(&mut t, pid, 17).unwrap();
        assert_eq!(t[p].state(), ProcState::Ready);
        assert_eq!(t[p].rc, 17);
        t.check_invariants(None);
    }

    #[test]
    fn signal_wakes_sleeper_with_residue() {
        let (mut t, ps) = spawn(1);
        let p = ps[0];
        run(&mut t, p);
        sleep::enqueue(&mut t, p, 5);

        let pid = t[p].pid();
        signal(&mut t, pid, 2).unwrap();
        assert_eq!(t[p].state(), ProcState::Ready);
        assert_eq!(t[p].rc, (5 * crate::time::TICK_MS) as i32);
        assert_eq!(sleep::sleepers(&t), 0);
    }
}
