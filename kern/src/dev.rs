// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The device request gateway.
//!
//! Device requests delegate to a device-independent switch table: one
//! [`DevSw`] of function pointers per device, indexed by device number.
//! The per-process file descriptor table maps small fds onto switch table
//! entries. Drivers speak in `i32` result codes that the gateway forwards
//! to the caller unchanged, with one piece of core policy layered on top by
//! the dispatcher: a read returning -1 means "would block", and the process
//! transitions to a driver-owned blocked state instead of seeing the -1.

use crate::proc::{Fd, ProcTable, FDT_SZ};

/// Device switch: the driver entry points behind the `di_*` layer. `open`,
/// `close`, and `ioctl` are synchronous; `read` may answer -1 to request
/// blocking, in which case the driver must eventually call
/// [`ProcTable::unblock_dev`] on the caller.
pub struct DevSw {
    pub open: fn(&mut ProcTable, usize) -> i32,
    pub close: fn(&mut ProcTable, usize) -> i32,
    pub read: fn(&mut ProcTable, usize, usize, usize) -> i32,
    pub write: fn(&mut ProcTable, usize, usize, usize) -> i32,
    pub ioctl: fn(&mut ProcTable, usize, u32, u32) -> i32,
}

/// The device table. Device numbers in `abi` are indices here.
static DEVTAB: [DevSw; 1] = [crate::kbd::DEVSW];

fn lookup(t: &ProcTable, caller: usize, fd: u32) -> Option<Fd> {
    *t[caller].fdt.get(fd as usize)?
}

/// Opens device `dev_no` for the caller, returning a new fd or -1.
pub fn di_open(t: &mut ProcTable, caller: usize, dev_no: u32) -> i32 {
    if dev_no as usize >= DEVTAB.len() {
        return -1;
    }
    let Some(fd) = t[caller].fdt.iter().position(|f| f.is_none()) else {
        return -1;
    };
    let rc = (DEVTAB[dev_no as usize].open)(t, caller);
    if rc < 0 {
        return rc;
    }
    t[caller].fdt[fd] = Some(Fd {
        dev: dev_no as usize,
    });
    fd as i32
}

/// Closes an fd, returning the driver's result or -1 for a bad fd.
pub fn di_close(t: &mut ProcTable, caller: usize, fd: u32) -> i32 {
    let Some(f) = lookup(t, caller, fd) else {
        return -1;
    };
    let rc = (DEVTAB[f.dev].close)(t, caller);
    t[caller].fdt[fd as usize] = None;
    rc
}

/// Reads through an fd. A -1 from the driver means "would block"; the
/// dispatcher, not this layer, acts on that. A bad fd therefore reports -2:
/// -1 would strand the caller in a blocked state no driver knows to wake.
pub fn di_read(
    t: &mut ProcTable,
    caller: usize,
    fd: u32,
    buf: usize,
    len: usize,
) -> i32 {
    let Some(f) = lookup(t, caller, fd) else {
        return -2;
    };
    (DEVTAB[f.dev].read)(t, caller, buf, len)
}

/// Writes through an fd.
pub fn di_write(
    t: &mut ProcTable,
    caller: usize,
    fd: u32,
    buf: usize,
    len: usize,
) -> i32 {
    let Some(f) = lookup(t, caller, fd) else {
        return -1;
    };
    (DEVTAB[f.dev].write)(t, caller, buf, len)
}

/// Driver-specific control through an fd.
pub fn di_ioctl(
    t: &mut ProcTable,
    caller: usize,
    fd: u32,
    cmd: u32,
    arg: u32,
) -> i32 {
    let Some(f) = lookup(t, caller, fd) else {
        return -1;
    };
    (DEVTAB[f.dev].ioctl)(t, caller, cmd, arg)
}

/// Closes everything a stopping process still has open.
pub fn close_all(t: &mut ProcTable, idx: usize) {
    for fd in 0..FDT_SZ as u32 {
        if lookup(t, idx, fd).is_some() {
            di_close(t, idx, fd);
        }
    }
}
