// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hardware-facing support, selected per build target.
//!
//! Exactly one of the nested modules below is compiled in, and its contents
//! are re-exported here, so the rest of the kernel just says `arch::foo`
//! and gets whatever the build target calls for. Both modules therefore
//! expose the same surface: the trap/context-switch entry points, the
//! constants describing initial user frames, the hardware glue
//! (`init_traps`, `end_of_intr`, `kbd_scan`), and the `klog!` macro.
//!
//! The `host` module stands in on anything that isn't bare-metal 32-bit x86,
//! so that the rest of the kernel can be built and unit-tested on a
//! development machine. Its "user" frames are real memory writes into
//! process stacks; only actually *running* a user process is out of reach.

macro_rules! uassert {
    ($cond:expr) => {
        if !$cond {
            panic!("kernel invariant violated");
        }
    };
}

macro_rules! uassert_eq {
    ($cond1:expr, $cond2:expr) => {
        if !($cond1 == $cond2) {
            panic!("kernel invariant violated");
        }
    };
}

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "x86", target_os = "none"))] {
        #[macro_use]
        pub mod x86;
        pub use x86::*;
    } else {
        #[macro_use]
        pub mod host;
        pub use host::*;
    }
}
