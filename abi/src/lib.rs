// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ABI definitions, shared between the kernel and user-level code.
//!
//! Everything in here is part of the contract between the kernel's request
//! dispatcher and the system-call shims: request numbers, error codes, and
//! the argument records that a shim deposits on its stack before trapping.
//! On the real (32-bit protected mode x86) target, `usize` fields are exactly
//! the 32-bit machine words the trap path shuffles around; building for a
//! wider host changes the in-memory layout but not the meaning, which is what
//! lets the kernel's logic be unit-tested off-target.

#![no_std]

use serde::{Deserialize, Serialize};
use zerocopy::{FromBytes, Immutable, KnownLayout};

/// Software interrupt vector used for system calls.
pub const SYSCALL_VECTOR: u8 = 0x80;

/// Pid of a stopped PCB slot. Never matches a live process.
pub const INVALID_PID: u32 = !0;

/// Receive-from-anyone sentinel. Live pids are never zero, so a receive
/// naming pid 0 matches whichever sender arrived first.
pub const ANY_PID: u32 = 0;

/// The idle process is created first at boot and therefore always holds the
/// first pid handed out.
pub const IDLE_PID: u32 = 1;

/// Number of signal slots per process. Slot 0 is reserved; slot 31 is the
/// highest priority.
pub const SIG_SLOTS: u32 = 32;

/// Highest usable signal number.
pub const SIG_MAX: u32 = SIG_SLOTS - 1;

/// Device number of the keyboard.
pub const DEV_KBD: u32 = 0;

/// `ioctl` command: set the keyboard's end-of-input character from the
/// argument word.
pub const DEV_IOCTL_SET_EOF: u32 = 0x35;

/// Peer terminated mid-rendezvous.
pub const ERR_IPC: i32 = -1;
/// IPC target pid invalid (nonexistent, stopped, or self).
pub const ERR_IPC_PROC_NO: i32 = -2;
/// Signal target missing.
pub const ERR_SIGNAL_PROC_NO: i32 = -3;
/// Signal number out of range.
pub const ERR_SIGNAL_SIG_NO: i32 = -4;
/// `SIG_KILL` flavor of [`ERR_SIGNAL_PROC_NO`].
pub const ERR_SIGKILL_PROC_NO: i32 = -5;
/// `SIG_KILL` flavor of [`ERR_SIGNAL_SIG_NO`].
pub const ERR_SIGKILL_SIG_NO: i32 = -6;
/// Zero or otherwise unusable sleep duration.
pub const BLOCKED_SLEEP: i32 = -7;

/// Enumeration of request codes.
///
/// Values 1 and 2 are reserved for the hardware entry points: the timer and
/// keyboard trampolines force these as the request instead of reading the
/// caller's request register, so no system call may use them.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u32)]
pub enum Request {
    TimerInt = 1,
    KbdInt = 2,
    Create = 3,
    Yield = 4,
    Stop = 5,
    GetPid = 6,
    Puts = 7,
    Sleep = 8,
    Send = 9,
    Recv = 10,
    SigHandler = 11,
    SigReturn = 12,
    SigKill = 13,
    SigWait = 14,
    DevOpen = 15,
    DevClose = 16,
    DevRead = 17,
    DevWrite = 18,
    DevIoctl = 19,
}

/// Request numbers arrive from user registers as raw words; this is the one
/// place they get vetted. Spelled out by hand rather than pulling in a
/// derive crate for a single match.
impl core::convert::TryFrom<u32> for Request {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            1 => Ok(Self::TimerInt),
            2 => Ok(Self::KbdInt),
            3 => Ok(Self::Create),
            4 => Ok(Self::Yield),
            5 => Ok(Self::Stop),
            6 => Ok(Self::GetPid),
            7 => Ok(Self::Puts),
            8 => Ok(Self::Sleep),
            9 => Ok(Self::Send),
            10 => Ok(Self::Recv),
            11 => Ok(Self::SigHandler),
            12 => Ok(Self::SigReturn),
            13 => Ok(Self::SigKill),
            14 => Ok(Self::SigWait),
            15 => Ok(Self::DevOpen),
            16 => Ok(Self::DevClose),
            17 => Ok(Self::DevRead),
            18 => Ok(Self::DevWrite),
            19 => Ok(Self::DevIoctl),
            _ => Err(()),
        }
    }
}

/// Argument record for CREATE.
#[derive(Copy, Clone, Debug, FromBytes, Immutable, KnownLayout, Serialize, Deserialize)]
#[repr(C)]
pub struct CreateArgs {
    /// Entry point of the new process.
    pub entry: usize,
    /// Requested stack size in bytes. The kernel clamps this up to its
    /// minimum; it is not an error to pass zero.
    pub stack_size: usize,
}

/// Argument record for PUTS.
#[derive(Copy, Clone, Debug, FromBytes, Immutable, KnownLayout, Serialize, Deserialize)]
#[repr(C)]
pub struct PutsArgs {
    /// NUL-terminated string to print.
    pub str_ptr: usize,
}

/// Argument record for SLEEP.
#[derive(Copy, Clone, Debug, FromBytes, Immutable, KnownLayout, Serialize, Deserialize)]
#[repr(C)]
pub struct SleepArgs {
    /// Requested duration in milliseconds.
    pub ms: u32,
}

/// Argument record for SEND.
#[derive(Copy, Clone, Debug, FromBytes, Immutable, KnownLayout, Serialize, Deserialize)]
#[repr(C)]
pub struct SendArgs {
    /// Message bytes to transfer.
    pub buf: usize,
    /// Destination pid.
    pub dst_pid: u32,
    /// Message length in bytes; negative lengths transfer nothing.
    pub len: i32,
}

/// Argument record for RECV.
#[derive(Copy, Clone, Debug, FromBytes, Immutable, KnownLayout, Serialize, Deserialize)]
#[repr(C)]
pub struct RecvArgs {
    /// In: pid to receive from, or [`ANY_PID`]. Out: the matched sender.
    pub src_pid_ptr: usize,
    /// Receive buffer.
    pub buf: usize,
    /// Receive capacity in bytes; negative lengths transfer nothing.
    pub len: i32,
}

/// Argument record for SIG_HANDLER.
#[derive(Copy, Clone, Debug, FromBytes, Immutable, KnownLayout, Serialize, Deserialize)]
#[repr(C)]
pub struct SigHandlerArgs {
    /// New handler address, or 0 to uninstall.
    pub handler: usize,
    /// Where the previous handler address is written back.
    pub old_handler_ptr: usize,
    /// Signal slot to install into.
    pub sig_no: u32,
}

/// Argument record for SIG_RETURN.
///
/// This record is never built by a shim: it is the tail of the delivery frame
/// the kernel pushed onto the user stack, re-presented to the kernel by the
/// signal-return stub. All three fields are machine words so that the record
/// maps directly onto the frame cells.
#[derive(Copy, Clone, Debug, FromBytes, Immutable, KnownLayout, Serialize, Deserialize)]
#[repr(C)]
pub struct SigReturnArgs {
    /// Stack pointer at the moment of delivery.
    pub old_esp: usize,
    /// Return value the interrupted request had produced.
    pub old_rc: isize,
    /// Ignore mask at the moment of delivery.
    pub old_mask: usize,
}

/// Argument record for SIG_KILL.
#[derive(Copy, Clone, Debug, FromBytes, Immutable, KnownLayout, Serialize, Deserialize)]
#[repr(C)]
pub struct SigKillArgs {
    /// Target pid.
    pub pid: u32,
    /// Signal to post.
    pub sig_no: u32,
}

/// Argument record for DEV_OPEN.
#[derive(Copy, Clone, Debug, FromBytes, Immutable, KnownLayout, Serialize, Deserialize)]
#[repr(C)]
pub struct DevOpenArgs {
    /// Device number, e.g. [`DEV_KBD`].
    pub dev_no: u32,
}

/// Argument record for DEV_CLOSE.
#[derive(Copy, Clone, Debug, FromBytes, Immutable, KnownLayout, Serialize, Deserialize)]
#[repr(C)]
pub struct DevCloseArgs {
    /// File descriptor returned by DEV_OPEN.
    pub fd: u32,
}

/// Argument record for DEV_READ and DEV_WRITE.
#[derive(Copy, Clone, Debug, FromBytes, Immutable, KnownLayout, Serialize, Deserialize)]
#[repr(C)]
pub struct DevRwArgs {
    /// Transfer buffer.
    pub buf: usize,
    /// File descriptor returned by DEV_OPEN.
    pub fd: u32,
    /// Transfer length in bytes; negative lengths transfer nothing.
    pub len: i32,
}

/// Argument record for DEV_IOCTL.
#[derive(Copy, Clone, Debug, FromBytes, Immutable, KnownLayout, Serialize, Deserialize)]
#[repr(C)]
pub struct DevIoctlArgs {
    /// File descriptor returned by DEV_OPEN.
    pub fd: u32,
    /// Driver-defined command, e.g. [`DEV_IOCTL_SET_EOF`].
    pub cmd: u32,
    /// Command argument word.
    pub arg: u32,
}
