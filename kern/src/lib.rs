// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Preemptive microkernel core for 32-bit protected mode x86.
//!
//! The kernel is organized around a single dispatcher loop: a process runs
//! until a trap (system call, timer, keyboard) forces entry, the context
//! switch primitive normalizes the trap into a request code, and the
//! dispatcher routes the request to a handler that mutates process state and
//! queues before the next switch. There is exactly one kernel thread of
//! control and interrupts are disabled for its whole extent, so everything
//! outside `arch` is ordinary single-threaded code.
//!
//! # Design principles
//!
//! 1. Naive algorithms on a small fixed process table. The table has
//!    [`proc::PROC_SZ`] slots and every queue is an index-linked list through
//!    it, so ownership stays with the table and membership is checkable.
//! 2. Safe code wherever the problem allows it. The unavoidable unsafety
//!    (trap trampolines, user stack access under the flat ring-0 memory
//!    model) is fenced into `arch` and `umem`.
//! 3. Everything but the trampolines builds and unit-tests on a host target;
//!    the `arch` module swaps in a stand-in for that case.

#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

#[macro_use]
pub mod arch;

pub mod dev;
pub mod dispatch;
pub mod err;
pub mod ipc;
pub mod kbd;
pub mod proc;
pub mod sig;
pub mod sleep;
pub mod startup;
pub mod time;
pub mod umem;

#[cfg(test)]
mod testutil;
