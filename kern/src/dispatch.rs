// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The dispatcher: the kernel's single loop.
//!
//! Each iteration selects the ready-queue head (skipping the idle process
//! whenever anything else is runnable), delivers at most one pending signal,
//! context-switches into the process, and routes whatever request it comes
//! back with through [`service`]. Requests are serviced by functions with
//! the signature
//!
//! ```ignore
//! fn handler(t: &mut ProcTable, current: usize) -> Result<Sched, UserError>;
//! ```
//!
//! On success the [`Sched`] says whether the current process goes back on
//! the ready queue or has been parked somewhere; a [`UserError`] carries the
//! rc code to deliver before re-readying it. A common wrapper takes care of
//! those final side effects, keeping the handlers small.

use abi::{
    CreateArgs, DevCloseArgs, DevIoctlArgs, DevOpenArgs, DevRwArgs, PutsArgs,
    Request, SleepArgs, BLOCKED_SLEEP,
};

use crate::arch;
use crate::dev;
use crate::err::{Sched, UserError};
use crate::ipc;
use crate::kbd;
use crate::proc::{ProcState, ProcTable};
use crate::sig;
use crate::sleep;
use crate::time;
use crate::umem;

/// Runs the dispatcher forever. Only callable on the real target, where
/// [`arch::context_switch`] can enter user frames.
pub fn dispatch(t: &mut ProcTable) -> ! {
    loop {
        let current = t.next_ready();
        sig::deliver_pending(t, current);
        t.set_running(current);
        let request = arch::context_switch(&mut t[current]);
        service(t, current, request);
    }
}

/// Routes one returned request code and applies the scheduling outcome.
pub fn service(t: &mut ProcTable, current: usize, request: u32) {
    let result = match Request::try_from(request) {
        Ok(Request::TimerInt) => timer_int(t),
        Ok(Request::KbdInt) => kbd_int(t),
        Ok(Request::Create) => create(t, current),
        Ok(Request::Yield) => Ok(Sched::Ready),
        Ok(Request::Stop) => stop(t, current),
        Ok(Request::GetPid) => {
            let pid = t[current].pid();
            t[current].rc = pid as i32;
            Ok(Sched::Ready)
        }
        Ok(Request::Puts) => puts(t, current),
        Ok(Request::Sleep) => sleep_req(t, current),
        Ok(Request::Send) => ipc::send(t, current),
        Ok(Request::Recv) => ipc::recv(t, current),
        Ok(Request::SigHandler) => sig::install(t, current),
        Ok(Request::SigReturn) => Ok(sig::sigreturn(t, current)),
        Ok(Request::SigKill) => sig::kill(t, current),
        Ok(Request::SigWait) => {
            t[current].state = ProcState::BlockedSig;
            Ok(Sched::Blocked)
        }
        Ok(Request::DevOpen) => dev_open(t, current),
        Ok(Request::DevClose) => dev_close(t, current),
        Ok(Request::DevRead) => dev_read(t, current),
        Ok(Request::DevWrite) => dev_write(t, current),
        Ok(Request::DevIoctl) => dev_ioctl(t, current),
        Err(()) => {
            klog!(
                "pid {} made bogus request {}",
                t[current].pid(),
                request
            );
            t[current].rc = 0;
            Ok(Sched::Ready)
        }
    };

    match result {
        Ok(Sched::Ready) => t.ready(current),
        Ok(Sched::Blocked) | Ok(Sched::Stopped) => (),
        Err(UserError(code)) => {
            t[current].rc = code;
            t.ready(current);
        }
    }
}

fn timer_int(t: &mut ProcTable) -> Result<Sched, UserError> {
    sleep::tick(t);
    arch::end_of_intr();
    Ok(Sched::Ready)
}

fn kbd_int(t: &mut ProcTable) -> Result<Sched, UserError> {
    kbd::isr(t, arch::kbd_scan());
    arch::end_of_intr();
    Ok(Sched::Ready)
}

fn create(t: &mut ProcTable, current: usize) -> Result<Sched, UserError> {
    // Parameter problems surface exactly like a full table: pid 0.
    let rc = match umem::read_args::<CreateArgs>(t[current].args) {
        Ok(a) => t.create(a.entry, a.stack_size) as i32,
        Err(_) => 0,
    };
    t[current].rc = rc;
    Ok(Sched::Ready)
}

fn stop(t: &mut ProcTable, current: usize) -> Result<Sched, UserError> {
    dev::close_all(t, current);
    t.stop_proc(current);
    Ok(Sched::Stopped)
}

fn puts(t: &mut ProcTable, current: usize) -> Result<Sched, UserError> {
    let mut buf = [0u8; 256];
    let read = umem::read_args::<PutsArgs>(t[current].args)
        .and_then(|a| umem::read_cstr(a.str_ptr, &mut buf));
    if let Ok(n) = read {
        match core::str::from_utf8(&buf[..n]) {
            Ok(s) => klog!("{}", s),
            Err(_) => klog!("(unprintable)"),
        }
    }
    t[current].rc = 0;
    Ok(Sched::Ready)
}

fn sleep_req(t: &mut ProcTable, current: usize) -> Result<Sched, UserError> {
    let a: SleepArgs = umem::read_args(t[current].args)
        .map_err(|_| UserError(BLOCKED_SLEEP))?;
    let slices = time::ticks_for_ms(a.ms);
    if slices == 0 {
        return Err(UserError(BLOCKED_SLEEP));
    }
    sleep::enqueue(t, current, slices);
    Ok(Sched::Blocked)
}

fn dev_open(t: &mut ProcTable, current: usize) -> Result<Sched, UserError> {
    let a: DevOpenArgs =
        umem::read_args(t[current].args).map_err(|_| UserError(-1))?;
    let rc = dev::di_open(t, current, a.dev_no);
    t[current].rc = rc;
    Ok(Sched::Ready)
}

fn dev_close(t: &mut ProcTable, current: usize) -> Result<Sched, UserError> {
    let a: DevCloseArgs =
        umem::read_args(t[current].args).map_err(|_| UserError(-1))?;
    let rc = dev::di_close(t, current, a.fd);
    t[current].rc = rc;
    Ok(Sched::Ready)
}

fn dev_read(t: &mut ProcTable, current: usize) -> Result<Sched, UserError> {
    let a: DevRwArgs =
        umem::read_args(t[current].args).map_err(|_| UserError(-1))?;
    let rc = dev::di_read(t, current, a.fd, a.buf, a.len.max(0) as usize);
    if rc == -1 {
        // Would block: the driver has recorded the read and owns the
        // wakeup. The process vanishes from the dispatcher's view until
        // `unblock_dev`.
        t[current].state = ProcState::BlockedDev;
        Ok(Sched::Blocked)
    } else {
        t[current].rc = rc;
        Ok(Sched::Ready)
    }
}

fn dev_write(t: &mut ProcTable, current: usize) -> Result<Sched, UserError> {
    let a: DevRwArgs =
        umem::read_args(t[current].args).map_err(|_| UserError(-1))?;
    let rc = dev::di_write(t, current, a.fd, a.buf, a.len.max(0) as usize);
    t[current].rc = rc;
    Ok(Sched::Ready)
}

fn dev_ioctl(t: &mut ProcTable, current: usize) -> Result<Sched, UserError> {
    let a: DevIoctlArgs =
        umem::read_args(t[current].args).map_err(|_| UserError(-1))?;
    let rc = dev::di_ioctl(t, current, a.fd, a.cmd, a.arg);
    t[current].rc = rc;
    Ok(Sched::Ready)
}
