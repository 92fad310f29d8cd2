// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared scaffolding for the host unit tests.
//!
//! Tests drive the kernel exactly the way the dispatcher does: select a
//! process, plant an argument record in its (real, heap-backed) stack, and
//! hand the request to the service table. Only the context switch itself is
//! missing on a host.

use alloc::vec::Vec;

use crate::arch;
use crate::proc::ProcTable;

/// Builds a table containing the idle process plus `n` ordinary processes,
/// returning the ordinary ones' slot indices.
pub fn spawn(n: usize) -> (ProcTable, Vec<usize>) {
    let mut t = ProcTable::new();
    let idle = t.create(arch::idle_entry(), 0);
    assert_eq!(idle, abi::IDLE_PID);
    let idxs = (0..n)
        .map(|_| {
            let pid = t.create(0x1000, 0);
            assert_ne!(pid, 0);
            t.find(pid).unwrap()
        })
        .collect();
    (t, idxs)
}

/// Lets the scheduler cycle until it selects `idx`, then marks it running.
/// Processes selected along the way are yielded straight back.
pub fn run(t: &mut ProcTable, idx: usize) {
    loop {
        let i = t.next_ready();
        if i == idx {
            t.set_running(idx);
            return;
        }
        t.ready(i);
    }
}

/// Plants an argument record in `idx`'s stack and aims its args pointer at
/// it, as the syscall shim would have.
pub fn set_args<T>(t: &mut ProcTable, idx: usize, args: T) {
    let base = t[idx].stack_base().expect("process has no stack");
    // Low end of the stack, far below any frame; word alignment of the
    // stack covers any argument record.
    let addr = base + 64;
    assert_eq!(addr % core::mem::align_of::<T>(), 0);
    // Safety: the address is inside this process's live stack allocation
    // and nothing else points at its low end.
    unsafe {
        (addr as *mut T).write(args);
    }
    t[idx].args = addr;
}
