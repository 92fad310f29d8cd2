// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture support for 32-bit protected mode x86.
//!
//! # Trap scheme
//!
//! Three IDT vectors funnel into the kernel:
//!
//! - `syscall_entry` implements the software interrupt used to make system
//!   calls (vector [`abi::SYSCALL_VECTOR`]).
//! - `timer_entry` handles IRQ 0 from the PIT, which drives preemption and
//!   the sleep queue.
//! - `kbd_entry` handles IRQ 1 from the keyboard controller.
//!
//! Each entry point is a distinct naked function that disables interrupts,
//! saves the user register file on the user stack, loads its interrupt code
//! (0 for system calls, 1 for the timer, 2 for the keyboard), and jumps to a
//! shared `trap_common` tail. The tail swaps back onto the saved kernel
//! stack and returns into [`context_switch`], publishing the request code,
//! interrupt code, and argument pointer through the spill slots below.
//!
//! The kernel is non-reentrant: interrupts are cleared at every trap entry
//! (both by the interrupt gate and by an explicit `cli`, matching the
//! hardware's behavior for software interrupts), and re-enabled only when
//! `iretd` restores a user EFLAGS image. There is therefore never more than
//! one live kernel frame, and the spill slots can be plain globals.
//!
//! # Spill slots
//!
//! The trampolines communicate with `context_switch` through `#[no_mangle]`
//! atomics referenced from the assembly by symbol. Atomic stores/loads with
//! relaxed ordering are how we spell "volatile at a fixed address" without
//! giving the optimizer license to cache them across the asm boundary; there
//! is no cross-processor traffic to order.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::proc::Process;

/// Log things from kernel context, through the COM1 UART. The serial console
/// is polled and never blocks on a reader, so this is safe to use from any
/// point in the dispatcher.
#[cfg(feature = "klog-serial")]
macro_rules! klog {
    ($s:expr) => {
        $crate::arch::serial_log(format_args!($s))
    };
    ($s:expr, $($tt:tt)*) => {
        $crate::arch::serial_log(format_args!($s, $($tt)*))
    };
}

#[cfg(not(feature = "klog-serial"))]
macro_rules! klog {
    ($s:expr) => {};
    ($s:expr, $($tt:tt)*) => {};
}

/// User stack pointer of the process being entered/exited.
#[no_mangle]
static USER_ESP: AtomicUsize = AtomicUsize::new(0);

/// Kernel stack pointer, captured on the way out to user code and restored
/// by the trap tail on the way back in.
#[no_mangle]
static KERNEL_ESP: AtomicUsize = AtomicUsize::new(0);

/// Request code: written with the outgoing rc before entering user code,
/// overwritten with the user's EAX (the request register) by the trap tail.
#[no_mangle]
static SYSCALL_RC: AtomicUsize = AtomicUsize::new(0);

/// Interrupt code deposited by the entry points: 0 system call, 1 timer,
/// 2 keyboard.
#[no_mangle]
static INT_CODE: AtomicUsize = AtomicUsize::new(0);

/// User EDX at trap time, which the syscall shims load with the address of
/// the argument record on their stack.
#[no_mangle]
static SYSCALL_ARGS: AtomicUsize = AtomicUsize::new(0);

/// Code segment selector stored in manufactured frames. The boot loader's
/// flat GDT is assumed; entry 1 is the ring-0 code segment.
pub const CODE_SELECTOR: usize = 0x08;

/// EFLAGS for a fresh user frame: just the interrupt-enable bit, so the
/// first `iretd` into the process starts the preemption clock.
pub const INITIAL_EFLAGS: usize = 0x200;

/// PIC-remapped vector of the PIT interrupt.
const TIMER_VECTOR: u8 = 0x20;

/// PIC-remapped vector of the keyboard interrupt.
const KBD_VECTOR: u8 = 0x21;

const SIGRET_REQUEST: u32 = abi::Request::SigReturn as u32;
const STOP_REQUEST: u32 = abi::Request::Stop as u32;

/// Enters `p` and returns with its next request code.
///
/// This publishes `p`'s saved stack pointer and pending rc through the spill
/// slots, drops into `resume_user`, and picks the pieces back up when the
/// process next traps. For hardware interrupts the process's in-flight rc is
/// preserved on the PCB (the interrupted request's return value must not be
/// clobbered) and the interrupt code is yielded as the request; the argument
/// pointer is only meaningful for system calls.
pub fn context_switch(p: &mut Process) -> u32 {
    USER_ESP.store(p.esp, Ordering::Relaxed);
    SYSCALL_RC.store(p.rc as u32 as usize, Ordering::Relaxed);
    INT_CODE.store(0, Ordering::Relaxed);
    SYSCALL_ARGS.store(0, Ordering::Relaxed);

    // Safety: the trampolines maintain the invariant that this call returns
    // exactly once, after the next trap, with the kernel stack intact.
    unsafe { resume_user() }

    p.esp = USER_ESP.load(Ordering::Relaxed);
    let rc = SYSCALL_RC.load(Ordering::Relaxed) as u32;
    let int_code = INT_CODE.load(Ordering::Relaxed) as u32;
    if int_code != 0 {
        p.rc = rc as i32;
        int_code
    } else {
        p.args = SYSCALL_ARGS.load(Ordering::Relaxed);
        rc
    }
}

/// Leaves the kernel: saves the kernel callee frame, installs the user
/// stack, deposits the rc in the register slot that pops into EAX, and
/// `iretd`s into the user PC. "Returns" only via `trap_common`.
#[unsafe(naked)]
unsafe extern "C" fn resume_user() {
    core::arch::naked_asm!(
        "pushf",
        "pusha",
        "mov eax, [{rc}]",
        "mov edx, [{user_esp}]",
        "mov [{kernel_esp}], esp",
        "mov esp, edx",
        "mov [esp + 28], eax", // rc into the frame's EAX slot
        "popa",
        "iretd",
        rc = sym SYSCALL_RC,
        user_esp = sym USER_ESP,
        kernel_esp = sym KERNEL_ESP,
    );
}

/// System call entry point: interrupt code 0, request in user EAX.
#[unsafe(naked)]
pub unsafe extern "C" fn syscall_entry() {
    core::arch::naked_asm!(
        "cli",
        "pusha",
        "mov ecx, 0",
        "jmp {common}",
        common = sym trap_common,
    );
}

/// PIT entry point: interrupt code 1 forces the TIMER_INT request.
#[unsafe(naked)]
pub unsafe extern "C" fn timer_entry() {
    core::arch::naked_asm!(
        "cli",
        "pusha",
        "mov ecx, 1",
        "jmp {common}",
        common = sym trap_common,
    );
}

/// Keyboard entry point: interrupt code 2 forces the KBD_INT request.
#[unsafe(naked)]
pub unsafe extern "C" fn kbd_entry() {
    core::arch::naked_asm!(
        "cli",
        "pusha",
        "mov ecx, 2",
        "jmp {common}",
        common = sym trap_common,
    );
}

/// Shared trap tail. On entry the user register file is on the user stack
/// and ECX holds the interrupt code.
///
/// Pokes EAX/ECX/EDX into the corresponding slots of the *kernel* register
/// frame saved by `resume_user`, so that after `popa` those three registers
/// carry the user's values across the restore and can be stored to the spill
/// slots. The final `ret` resumes `context_switch`.
#[unsafe(naked)]
unsafe extern "C" fn trap_common() {
    core::arch::naked_asm!(
        "mov [{user_esp}], esp",
        "mov esp, [{kernel_esp}]",
        "mov [esp + 28], eax",
        "mov [esp + 24], ecx",
        "mov [esp + 20], edx",
        "popa",
        "popf",
        "mov [{rc}], eax",
        "mov [{int}], ecx",
        "mov [{args}], edx",
        "ret",
        user_esp = sym USER_ESP,
        kernel_esp = sym KERNEL_ESP,
        rc = sym SYSCALL_RC,
        int = sym INT_CODE,
        args = sym SYSCALL_ARGS,
    );
}

/// Lands a returning signal handler. The delivery frame leaves the stack
/// pointer aimed at the saved (old esp, old rc, old ignore mask) triple, so
/// this just names it as the argument record and traps.
#[unsafe(naked)]
unsafe extern "C" fn sigret_stub() {
    core::arch::naked_asm!(
        "mov eax, {req}",
        "mov edx, esp",
        "int 0x80",
        "ud2",
        req = const SIGRET_REQUEST,
    );
}

/// Lands a process that returns from its entry function: issues STOP.
#[unsafe(naked)]
unsafe extern "C" fn exit_stub() {
    core::arch::naked_asm!(
        "mov eax, {req}",
        "mov edx, 0",
        "int 0x80",
        "ud2",
        req = const STOP_REQUEST,
    );
}

/// The idle process: halt until the next interrupt, forever.
pub extern "C" fn idle_main() -> ! {
    loop {
        // Safety: `hlt` with interrupts enabled (the idle frame's EFLAGS has
        // IF set) just waits for the next timer tick.
        unsafe {
            core::arch::asm!("hlt", options(nomem, nostack, preserves_flags));
        }
    }
}

pub fn sigret_entry() -> usize {
    sigret_stub as usize
}

pub fn exit_entry() -> usize {
    exit_stub as usize
}

pub fn idle_entry() -> usize {
    idle_main as usize
}

/// A single 32-bit interrupt gate.
#[derive(Copy, Clone)]
#[repr(C)]
struct IdtEntry {
    offset_lo: u16,
    selector: u16,
    zero: u8,
    attrs: u8,
    offset_hi: u16,
}

impl IdtEntry {
    const MISSING: Self = IdtEntry {
        offset_lo: 0,
        selector: 0,
        zero: 0,
        attrs: 0,
        offset_hi: 0,
    };
}

#[repr(C, packed)]
struct IdtPointer {
    limit: u16,
    base: u32,
}

static mut IDT: [IdtEntry; 256] = [IdtEntry::MISSING; 256];

/// Installs `entry` as the handler for interrupt `vector`, as a ring-0
/// interrupt gate (interrupts auto-cleared on entry).
///
/// # Safety
///
/// Must only be called during boot, before the first context switch.
pub unsafe fn set_evec(vector: u8, entry: unsafe extern "C" fn()) {
    let offset = entry as usize as u32;
    let gate = IdtEntry {
        offset_lo: offset as u16,
        selector: CODE_SELECTOR as u16,
        zero: 0,
        attrs: 0x8E,
        offset_hi: (offset >> 16) as u16,
    };
    // Safety: boot is single-threaded and interrupts are off; nothing else
    // aliases the IDT.
    unsafe {
        (*core::ptr::addr_of_mut!(IDT))[vector as usize] = gate;
    }
}

unsafe fn lidt() {
    let pointer = IdtPointer {
        limit: (core::mem::size_of::<IdtEntry>() * 256 - 1) as u16,
        base: core::ptr::addr_of!(IDT) as u32,
    };
    unsafe {
        core::arch::asm!(
            "lidt [{0}]",
            in(reg) &pointer,
            options(readonly, nostack, preserves_flags),
        );
    }
}

/// Programs the PIT for rate generation at the given divisor, establishing
/// the preemption quantum.
unsafe fn init_pit(divisor: u32) {
    unsafe {
        outb(0x43, 0x34);
        outb(0x40, divisor as u8);
        outb(0x40, (divisor >> 8) as u8);
    }
}

/// Remaps the 8259A pair onto vectors 0x20..0x30 and unmasks only the timer
/// and keyboard lines.
unsafe fn init_pic() {
    unsafe {
        outb(0x20, 0x11); // ICW1: initialize, expect ICW4
        outb(0xA0, 0x11);
        outb(0x21, TIMER_VECTOR); // ICW2: vector offsets
        outb(0xA1, 0x28);
        outb(0x21, 0x04); // ICW3: secondary on line 2
        outb(0xA1, 0x02);
        outb(0x21, 0x01); // ICW4: 8086 mode
        outb(0xA1, 0x01);
        outb(0x21, !0b0000_0011); // mask all but IRQ0/IRQ1
        outb(0xA1, 0xFF);
    }
}

/// Acknowledges the interrupt controller after an IRQ has been serviced.
pub fn end_of_intr() {
    // Safety: writing EOI to the primary PIC's command port has no memory
    // effects.
    unsafe {
        outb(0x20, 0x20);
    }
}

/// Reads the pending scan code from the keyboard controller.
pub fn kbd_scan() -> u8 {
    // Safety: port 0x60 is the 8042 output buffer; reading it has no memory
    // effects.
    unsafe { inb(0x60) }
}

/// Installs the kernel's three interrupt vectors and programs the timer.
/// Interrupts stay disabled; the first `iretd` into a user frame enables
/// them.
pub fn init_traps() {
    // Safety: boot is single-threaded with interrupts off, which is all the
    // individual pieces require.
    unsafe {
        serial_init();
        init_pic();
        init_pit(crate::time::CLOCK_DIVISOR);
        set_evec(abi::SYSCALL_VECTOR, syscall_entry);
        set_evec(TIMER_VECTOR, timer_entry);
        set_evec(KBD_VECTOR, kbd_entry);
        lidt();
    }
}

unsafe fn outb(port: u16, value: u8) {
    unsafe {
        core::arch::asm!(
            "out dx, al",
            in("dx") port,
            in("al") value,
            options(nomem, nostack, preserves_flags),
        );
    }
}

unsafe fn inb(port: u16) -> u8 {
    let value: u8;
    unsafe {
        core::arch::asm!(
            "in al, dx",
            in("dx") port,
            out("al") value,
            options(nomem, nostack, preserves_flags),
        );
    }
    value
}

const COM1: u16 = 0x3F8;

unsafe fn serial_init() {
    unsafe {
        outb(COM1 + 1, 0x00); // no interrupts; we poll
        outb(COM1 + 3, 0x80); // divisor latch
        outb(COM1 + 0, 0x01); // 115200 baud
        outb(COM1 + 1, 0x00);
        outb(COM1 + 3, 0x03); // 8N1
        outb(COM1 + 2, 0xC7); // FIFO on, cleared
    }
}

struct Com1;

impl core::fmt::Write for Com1 {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        for b in s.bytes() {
            // Safety: polling the line status register and writing the data
            // register have no memory effects.
            unsafe {
                while inb(COM1 + 5) & 0x20 == 0 {}
                outb(COM1, b);
            }
        }
        Ok(())
    }
}

#[doc(hidden)]
pub fn serial_log(args: core::fmt::Arguments<'_>) {
    use core::fmt::Write;
    let mut port = Com1;
    let _ = port.write_fmt(args);
    let _ = port.write_str("\r\n");
}
