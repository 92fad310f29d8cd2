// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Synchronous rendezvous message passing.
//!
//! SEND and RECV meet in the middle: whichever party arrives first blocks
//! on the other's wait queue, and when the match arrives the kernel copies
//! `min(sender_len, receiver_len)` bytes between the two buffers and makes
//! both ready with the transferred byte count as their rc.
//!
//! A receive can name a specific sender or pass [`ANY_PID`] to take
//! whichever blocked sender arrived first. A specific receiver parks on the
//! *sender's* receiver wait queue (so the sender's STOP can release it); an
//! any-receiver has no one to park on and sits on its own list, where only
//! a matching SEND -- or its own STOP -- will find it.
//!
//! Argument records are re-read from a blocked peer's saved `args` pointer
//! at match time, so nothing about the transfer needs to be copied into the
//! kernel while a party waits.

use abi::{RecvArgs, SendArgs, ANY_PID, ERR_IPC, ERR_IPC_PROC_NO};

use crate::err::{Sched, UsageError, UserError};
use crate::proc::{ProcState, ProcTable};
use crate::umem;

/// Implementation of the SEND request.
pub fn send(t: &mut ProcTable, caller: usize) -> Result<Sched, UserError> {
    let args: SendArgs = umem::read_args(t[caller].args)
        .map_err(|_| UserError(ERR_IPC_PROC_NO))?;

    // Send to a nonexistent or stopped pid, or to yourself, fails without
    // blocking.
    let dst = t.find(args.dst_pid).ok_or(UserError(ERR_IPC_PROC_NO))?;
    if dst == caller {
        return Err(UserError(ERR_IPC_PROC_NO));
    }

    match t[dst].state() {
        ProcState::BlockedRecv(Some(src)) if src == caller => {
            // Closed receive naming us; it is parked on our receiver list.
            let found = t.unlink_receiver(caller, dst);
            uassert!(found);
            deliver(t, caller, dst);
            t.ready(dst);
            Ok(Sched::Ready)
        }
        ProcState::BlockedRecv(None) => {
            // Open receive, parked on its own list.
            let found = t.unlink_receiver(dst, dst);
            uassert!(found);
            deliver(t, caller, dst);
            t.ready(dst);
            Ok(Sched::Ready)
        }
        _ => {
            // Callee is off doing something else; wait our turn.
            t.enqueue_sender(dst, caller);
            Ok(Sched::Blocked)
        }
    }
}

/// Implementation of the RECV request.
pub fn recv(t: &mut ProcTable, caller: usize) -> Result<Sched, UserError> {
    let args: RecvArgs = umem::read_args(t[caller].args)
        .map_err(|_| UserError(ERR_IPC_PROC_NO))?;
    let want = umem::read_u32(args.src_pid_ptr)
        .map_err(|_| UserError(ERR_IPC_PROC_NO))?;

    if want == ANY_PID {
        if let Some(sender) = t.dequeue_sender(caller) {
            deliver(t, sender, caller);
            t.ready(sender);
            Ok(Sched::Ready)
        } else {
            t.enqueue_receiver(caller, caller, None);
            Ok(Sched::Blocked)
        }
    } else {
        let src = t.find(want).ok_or(UserError(ERR_IPC_PROC_NO))?;
        if src == caller {
            return Err(UserError(ERR_IPC_PROC_NO));
        }
        if t[src].state() == ProcState::BlockedSend(caller) {
            let found = t.unlink_sender(caller, src);
            uassert!(found);
            deliver(t, src, caller);
            t.ready(src);
            Ok(Sched::Ready)
        } else {
            t.enqueue_receiver(src, caller, Some(src));
            Ok(Sched::Blocked)
        }
    }
}

/// Completes a rendezvous: copies the message, overwrites the receiver's
/// source-pid word with the matched sender, and sets both parties' rc to
/// the byte count.
///
/// Neither party is enqueued here; exactly one of them is the current
/// process (the dispatcher re-enqueues it) and the caller readies the
/// other.
///
/// A structurally bad buffer discovered at this point fails the rendezvous
/// for both parties with [`ERR_IPC`]: the transfer is dead and neither side
/// can be left blocked on it.
fn deliver(t: &mut ProcTable, sender: usize, receiver: usize) {
    match transfer(t, sender, receiver) {
        Ok(n) => {
            t[sender].rc = n as i32;
            t[receiver].rc = n as i32;
        }
        Err(UsageError) => {
            t[sender].rc = ERR_IPC;
            t[receiver].rc = ERR_IPC;
        }
    }
}

fn transfer(
    t: &mut ProcTable,
    sender: usize,
    receiver: usize,
) -> Result<usize, UsageError> {
    let sa: SendArgs = umem::read_args(t[sender].args)?;
    let ra: RecvArgs = umem::read_args(t[receiver].args)?;
    let n = umem::copy_bytes(
        sa.buf,
        sa.len.max(0) as usize,
        ra.buf,
        ra.len.max(0) as usize,
    )?;
    umem::write_u32(ra.src_pid_ptr, t[sender].pid())?;
    Ok(n)
}
