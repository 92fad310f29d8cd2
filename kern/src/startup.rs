// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel startup.
//!
//! The boot shim (loader glue, not part of this crate) establishes a flat
//! GDT and a kernel stack, then calls [`start_kernel`] with the bounds of
//! the memory the kernel may carve process stacks out of and the entry
//! point of the first real process.

use core::mem::MaybeUninit;

use crate::arch;
use crate::dispatch;
use crate::proc::ProcTable;

/// Process stacks come out of this heap on the real target.
#[cfg(target_os = "none")]
#[global_allocator]
static KERNEL_HEAP: linked_list_allocator::LockedHeap =
    linked_list_allocator::LockedHeap::empty();

/// Backing store for the process table. Static because the table outlives
/// every stack frame and the dispatcher never returns.
static mut PROC_TABLE_SPACE: MaybeUninit<ProcTable> = MaybeUninit::uninit();

/// Stack handed to the root process, in bytes.
const ROOT_STACK: usize = 32 * 1024;

/// The idle process gets the minimum; it only ever spins in `hlt`.
const IDLE_STACK: usize = 0;

/// The main kernel entry point: initializes the heap and trap vectors,
/// creates the idle and root processes, and enters the dispatcher.
///
/// # Safety
///
/// This can be called exactly once per boot, with `heap_base..+heap_size`
/// naming usable RAM that nothing else owns and `root_entry` naming the
/// first instruction of the initial process.
pub unsafe fn start_kernel(
    heap_base: usize,
    heap_size: usize,
    root_entry: usize,
) -> ! {
    #[cfg(target_os = "none")]
    // Safety: the caller vouches for the heap range.
    unsafe {
        KERNEL_HEAP.lock().init(heap_base as *mut u8, heap_size);
    }
    #[cfg(not(target_os = "none"))]
    let _ = (heap_base, heap_size);

    arch::init_traps();
    klog!("starting: traps installed");

    // Safety: single call per boot; nothing else names this static.
    let table = unsafe {
        let space = &mut *core::ptr::addr_of_mut!(PROC_TABLE_SPACE);
        space.write(ProcTable::new())
    };

    let idle = table.create(arch::idle_entry(), IDLE_STACK);
    uassert_eq!(idle, abi::IDLE_PID);
    let root = table.create(root_entry, ROOT_STACK);
    uassert!(root != 0);

    klog!("starting: dispatcher");
    dispatch::dispatch(table)
}
