// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Stand-in architecture for building and testing the kernel on a host.
//!
//! Process stacks are ordinary heap allocations, so all of the frame
//! construction and user-memory traffic in the portable modules operates on
//! real memory and can be asserted on. The one thing a host cannot do is
//! enter a user context, so [`context_switch`] panics; tests drive the
//! dispatcher's service table directly instead.

use crate::proc::Process;

/// Log things from kernel context. On a host this is plain standard output.
macro_rules! klog {
    ($s:expr) => { std::println!($s) };
    ($s:expr, $($tt:tt)*) => { std::println!($s, $($tt)*) };
}

/// Code segment selector stored in manufactured frames.
pub const CODE_SELECTOR: usize = 0x08;

/// EFLAGS for a fresh user frame: just the interrupt-enable bit.
pub const INITIAL_EFLAGS: usize = 0x200;

/// Recognizable stand-ins for the trampoline stub addresses. Tests compare
/// frame cells against these; nothing ever jumps to them.
pub fn sigret_entry() -> usize {
    0x5160_7281
}

pub fn exit_entry() -> usize {
    0xe817_0000
}

pub fn idle_entry() -> usize {
    0x1d1e_0000
}

pub fn init_traps() {}

pub fn end_of_intr() {}

/// There is no scan-code port on a host; tests feed bytes to the keyboard
/// module directly.
pub fn kbd_scan() -> u8 {
    0
}

pub fn context_switch(_p: &mut Process) -> u32 {
    panic!("context switch requires a bare-metal x86 target");
}
