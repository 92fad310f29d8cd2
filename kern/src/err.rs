// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! How the kernel talks about failure.
//!
//! Every kernel-visible failure is a value: user errors surface as small
//! negative integers delivered through the faulting process's rc, never as
//! panics. The types here let request handlers say that with `Result` and
//! `?` instead of hand-threading codes, with a common wrapper in `dispatch`
//! taking care of the final side effects.

/// What the dispatcher should do with the current process after its request
/// has been serviced. Marked `must_use` because dropping one of these means
/// a process silently falls out of every queue.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[must_use]
pub enum Sched {
    /// Re-enqueue on the ready queue; rc has already been set.
    Ready,
    /// The handler parked the process in a blocked state; leave it there.
    Blocked,
    /// The process stopped; its slot is already on the stop queue.
    Stopped,
}

/// A recoverable error committed by user code when interacting with a
/// request. The payload is the rc code (one of the negative `abi::ERR_*`
/// values, or a request-specific failure value) that the dispatcher will
/// deliver before making the process ready again.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct UserError(pub i32);

/// A structurally invalid user slice: misaligned, null, or wrapping the end
/// of the address space. Handlers map this to whatever failure value their
/// request defines.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct UsageError;
