// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The keyboard: scan-code transducer and device driver.
//!
//! [`kbtoa`] is a pure transducer from set-1 scan codes to bytes,
//! maintaining shift/caps-lock/ctl/meta/extended state. State-only events
//! (modifier presses, all key releases) yield [`NOCHAR`]. Ctl combinations
//! map into the 1..31 control range, meta sets the high bit, and extended
//! (0xE0-prefixed) sequences are swallowed: the prefix sets a flag and the
//! byte that follows is consumed as NOCHAR.
//!
//! On top of the transducer sits the keyboard's device switch entry. Typed
//! bytes accumulate in a small ring until somebody reads; a read that finds
//! the ring empty answers "would block" and records the reader, which the
//! interrupt path completes on a newline, on the end-of-input character, or
//! when the reader's buffer fills. The end-of-input character (settable via
//! `ioctl`, EOT by default) makes every later read return 0.

use bitflags::bitflags;

use crate::dev::DevSw;
use crate::proc::ProcTable;
use crate::umem;

/// Sentinel for scan events that alter state but produce no character.
pub const NOCHAR: u32 = 0x100;

/// Default end-of-input character: EOT (ctl-d).
const DEFAULT_EOF: u8 = 0x04;

const LSHIFT: u8 = 0x2A;
const RSHIFT: u8 = 0x36;
const CAPSL: u8 = 0x3A;
const LCTL: u8 = 0x1D;
const LMETA: u8 = 0x38;
const EXTESC: u8 = 0xE0;
const KEY_UP: u8 = 0x80;

bitflags! {
    /// Keyboard modifier state carried between scan codes.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct Modifiers: u32 {
        const INSHIFT = 1 << 0;
        const CAPSLOCK = 1 << 1;
        const INCTL = 1 << 2;
        const INMETA = 1 << 3;
        const EXTENDED = 1 << 4;
    }
}

/// Normal translation table.
#[rustfmt::skip]
const KBCODE: [u8; 58] = [
       0,
      27, b'1', b'2', b'3', b'4', b'5', b'6', b'7', b'8', b'9',
    b'0', b'-', b'=', 0x08, b'\t', b'q', b'w', b'e', b'r', b't',
    b'y', b'u', b'i', b'o', b'p', b'[', b']', b'\n',   0, b'a',
    b's', b'd', b'f', b'g', b'h', b'j', b'k', b'l', b';', b'\'',
    b'`',    0, b'\\', b'z', b'x', b'c', b'v', b'b', b'n', b'm',
    b',', b'.', b'/',    0,    0,    0, b' ',
];

/// Capitalized translation table.
#[rustfmt::skip]
const KBSHIFT: [u8; 58] = [
       0,
       0, b'!', b'@', b'#', b'$', b'%', b'^', b'&', b'*', b'(',
    b')', b'_', b'+', 0x08, b'\t', b'Q', b'W', b'E', b'R', b'T',
    b'Y', b'U', b'I', b'O', b'P', b'{', b'}', b'\n',   0, b'A',
    b'S', b'D', b'F', b'G', b'H', b'J', b'K', b'L', b':', b'"',
    b'~',    0, b'|', b'Z', b'X', b'C', b'V', b'B', b'N', b'M',
    b'<', b'>', b'?',    0,    0,    0, b' ',
];

/// Control translation table.
#[rustfmt::skip]
const KBCTL: [u8; 51] = [
       0,
       0,    0,    0,    0,    0,    0,    0,    0,    0,    0,
       0,   31,    0, 0x08, b'\t',  17,   23,    5,   18,   20,
      25,   21,    9,   15,   16,   27,   29, b'\n',   0,    1,
      19,    4,    6,    7,    8,   10,   11,   12,    0,    0,
       0,    0,   28,   26,   24,    3,   22,    2,   14,   13,
];

/// Translates one scan code, updating `state`. Returns the produced byte,
/// or [`NOCHAR`] for state-only events.
pub fn kbtoa(state: &mut Modifiers, code: u8) -> u32 {
    if state.contains(Modifiers::EXTENDED) {
        // The byte after an 0xE0 prefix completes an extended sequence;
        // none of those produce characters here.
        state.remove(Modifiers::EXTENDED);
        return NOCHAR;
    }

    if code & KEY_UP != 0 {
        match code & 0x7f {
            LSHIFT | RSHIFT => state.remove(Modifiers::INSHIFT),
            CAPSL => state.remove(Modifiers::CAPSLOCK),
            LCTL => state.remove(Modifiers::INCTL),
            LMETA => state.remove(Modifiers::INMETA),
            _ => (),
        }
        return NOCHAR;
    }

    match code {
        LSHIFT | RSHIFT => {
            state.insert(Modifiers::INSHIFT);
            return NOCHAR;
        }
        CAPSL => {
            state.insert(Modifiers::CAPSLOCK);
            return NOCHAR;
        }
        LCTL => {
            state.insert(Modifiers::INCTL);
            return NOCHAR;
        }
        LMETA => {
            state.insert(Modifiers::INMETA);
            return NOCHAR;
        }
        EXTESC => {
            state.insert(Modifiers::EXTENDED);
            return NOCHAR;
        }
        _ => (),
    }

    let mut ch = NOCHAR;

    if (code as usize) < KBCODE.len() {
        ch = if state.contains(Modifiers::CAPSLOCK) {
            KBSHIFT[code as usize] as u32
        } else {
            KBCODE[code as usize] as u32
        };
    }

    if state.contains(Modifiers::INSHIFT) {
        if code as usize >= KBSHIFT.len() {
            return NOCHAR;
        }
        // Shift undoes caps lock for the letter rows.
        ch = if state.contains(Modifiers::CAPSLOCK) {
            KBCODE[code as usize] as u32
        } else {
            KBSHIFT[code as usize] as u32
        };
    }

    if state.contains(Modifiers::INCTL) {
        if code as usize >= KBCTL.len() {
            return NOCHAR;
        }
        ch = KBCTL[code as usize] as u32;
    }

    if state.contains(Modifiers::INMETA) {
        ch += 0x80;
    }

    ch
}

/// A read the driver has promised to complete.
#[derive(Copy, Clone, Debug)]
struct Pending {
    idx: usize,
    buf: usize,
    cap: usize,
    count: usize,
}

/// Keyboard driver state: transducer modifiers, the typed-ahead ring, and
/// the blocked reader, if any.
pub struct KbdState {
    mods: Modifiers,
    ring: [u8; 32],
    ring_len: usize,
    eof_char: u8,
    eof_seen: bool,
    opened: bool,
    pending: Option<Pending>,
}

impl KbdState {
    pub const fn new() -> Self {
        KbdState {
            mods: Modifiers::empty(),
            ring: [0; 32],
            ring_len: 0,
            eof_char: DEFAULT_EOF,
            eof_seen: false,
            opened: false,
            pending: None,
        }
    }

    fn open(&mut self) -> i32 {
        if self.opened {
            return -1;
        }
        self.opened = true;
        self.eof_seen = false;
        self.ring_len = 0;
        0
    }

    fn close(&mut self) -> i32 {
        self.opened = false;
        self.pending = None;
        0
    }

    fn read(
        &mut self,
        t: &mut ProcTable,
        caller: usize,
        buf: usize,
        len: usize,
    ) -> i32 {
        if self.ring_len > 0 {
            let n = self.ring_len.min(len);
            // -1 is reserved for "would block"; a bad buffer is a plain
            // error.
            if umem::copy_bytes(self.ring.as_ptr() as usize, n, buf, len)
                .is_err()
            {
                return -2;
            }
            self.ring.copy_within(n.., 0);
            self.ring_len -= n;
            return n as i32;
        }
        if self.eof_seen {
            return 0;
        }
        if len == 0 {
            return 0;
        }
        if self.pending.is_some() {
            // Somebody is already blocked on the keyboard; only one read
            // can be outstanding.
            return -2;
        }
        self.pending = Some(Pending {
            idx: caller,
            buf,
            cap: len,
            count: 0,
        });
        let _ = t; // the wakeup happens from the interrupt path
        -1
    }

    fn ioctl(&mut self, cmd: u32, arg: u32) -> i32 {
        match cmd {
            abi::DEV_IOCTL_SET_EOF => {
                self.eof_char = arg as u8;
                0
            }
            _ => -1,
        }
    }

    /// Feeds one scan code from the interrupt path, completing a blocked
    /// read when a line, the end-of-input character, or a full buffer
    /// arrives.
    pub fn input(&mut self, t: &mut ProcTable, scan: u8) {
        let ch = kbtoa(&mut self.mods, scan);
        if ch == NOCHAR {
            return;
        }
        let byte = ch as u8;

        if byte == self.eof_char {
            self.eof_seen = true;
            if let Some(pend) = self.pending.take() {
                t.unblock_dev(pend.idx, pend.count as i32);
            }
            return;
        }

        if let Some(mut pend) = self.pending {
            if umem::copy_bytes(
                core::ptr::addr_of!(byte) as usize,
                1,
                pend.buf + pend.count,
                1,
            )
            .is_err()
            {
                return;
            }
            pend.count += 1;
            if byte == b'\n' || pend.count == pend.cap {
                self.pending = None;
                t.unblock_dev(pend.idx, pend.count as i32);
            } else {
                self.pending = Some(pend);
            }
        } else if self.ring_len < self.ring.len() {
            self.ring[self.ring_len] = byte;
            self.ring_len += 1;
        }
    }
}

impl Default for KbdState {
    fn default() -> Self {
        Self::new()
    }
}

static mut KBD: KbdState = KbdState::new();

/// Grants access to the keyboard driver state.
///
/// Safety argument: the kernel is single-threaded and non-reentrant, so at
/// most one mutable reference exists at a time. (Host unit tests that touch
/// this global are confined to a single test; the rest construct their own
/// `KbdState`.)
fn with_state<R>(body: impl FnOnce(&mut KbdState) -> R) -> R {
    // Safety: see above.
    body(unsafe { &mut *core::ptr::addr_of_mut!(KBD) })
}

/// The keyboard interrupt lower half, invoked by the dispatcher for each
/// KBD_INT request with the scan code read from the controller.
pub fn isr(t: &mut ProcTable, scan: u8) {
    with_state(|k| k.input(t, scan));
}

/// The keyboard's device switch entry.
pub const DEVSW: DevSw = DevSw {
    open: |_t, _caller| with_state(|k| k.open()),
    close: |_t, _caller| with_state(|k| k.close()),
    read: |t, caller, buf, len| with_state(|k| k.read(t, caller, buf, len)),
    write: |_t, _caller, _buf, _len| -1,
    ioctl: |_t, _caller, cmd, arg| with_state(|k| k.ioctl(cmd, arg)),
};

#[cfg(test)]
mod tests {
    use super::*;

    const A_KEY: u8 = 0x1E;
    const C_KEY: u8 = 0x2E;
    const ONE_KEY: u8 = 0x02;

    fn press(state: &mut Modifiers, codes: &[u8]) -> alloc::vec::Vec<u32> {
        codes.iter().map(|&c| kbtoa(state, c)).collect()
    }

    #[test]
    fn plain_keys_translate() {
        let mut st = Modifiers::empty();
        assert_eq!(kbtoa(&mut st, A_KEY), u32::from(b'a'));
        assert_eq!(kbtoa(&mut st, ONE_KEY), u32::from(b'1'));
    }

    #[test]
    fn key_release_is_state_only() {
        let mut st = Modifiers::empty();
        assert_eq!(kbtoa(&mut st, A_KEY | KEY_UP), NOCHAR);
    }

    #[test]
    fn shift_capitalizes_until_released() {
        let mut st = Modifiers::empty();
        let out = press(&mut st, &[LSHIFT, A_KEY, LSHIFT | KEY_UP, A_KEY]);
        assert_eq!(
            out,
            [NOCHAR, u32::from(b'A'), NOCHAR, u32::from(b'a')]
        );
    }

    #[test]
    fn caps_lock_and_shift_cancel() {
        let mut st = Modifiers::empty();
        assert_eq!(kbtoa(&mut st, CAPSL), NOCHAR);
        assert_eq!(kbtoa(&mut st, A_KEY), u32::from(b'A'));
        assert_eq!(kbtoa(&mut st, RSHIFT), NOCHAR);
        assert_eq!(kbtoa(&mut st, A_KEY), u32::from(b'a'));
    }

    #[test]
    fn ctl_maps_into_control_range() {
        let mut st = Modifiers::empty();
        assert_eq!(kbtoa(&mut st, LCTL), NOCHAR);
        assert_eq!(kbtoa(&mut st, C_KEY), 3); // ctl-c
    }

    #[test]
    fn meta_sets_high_bit() {
        let mut st = Modifiers::empty();
        assert_eq!(kbtoa(&mut st, LMETA), NOCHAR);
        assert_eq!(kbtoa(&mut st, A_KEY), u32::from(b'a') + 0x80);
    }

    #[test]
    fn extended_sequences_are_swallowed() {
        let mut st = Modifiers::empty();
        assert_eq!(kbtoa(&mut st, EXTESC), NOCHAR);
        // The follow-up byte of the sequence produces nothing either.
        assert_eq!(kbtoa(&mut st, 0x48), NOCHAR);
        // And the transducer is back to normal afterwards.
        assert_eq!(kbtoa(&mut st, A_KEY), u32::from(b'a'));
    }

    #[test]
    fn typed_ahead_bytes_satisfy_read_immediately() {
        let mut t = ProcTable::new();
        let mut k = KbdState::new();
        assert_eq!(k.open(), 0);
        k.input(&mut t, A_KEY);
        k.input(&mut t, C_KEY);

        let mut buf = [0u8; 8];
        let n = k.read(&mut t, 0, buf.as_mut_ptr() as usize, buf.len());
        assert_eq!(n, 2);
        assert_eq!(&buf[..2], b"ac");
    }

    #[test]
    fn empty_ring_blocks_then_line_completes() {
        let (mut t, ps) = crate::testutil::spawn(1);
        let p = ps[0];
        crate::testutil::run(&mut t, p);

        let mut k = KbdState::new();
        assert_eq!(k.open(), 0);
        let mut buf = [0u8; 8];
        let n = k.read(&mut t, p, buf.as_mut_ptr() as usize, buf.len());
        assert_eq!(n, -1);
        t[p].state = crate::proc::ProcState::BlockedDev;

        k.input(&mut t, A_KEY);
        k.input(&mut t, 0x1C); // enter
        assert_eq!(t[p].state(), crate::proc::ProcState::Ready);
        assert_eq!(t[p].rc, 2);
        assert_eq!(&buf[..2], b"a\n");
    }

    #[test]
    fn eof_char_terminates_input() {
        let (mut t, ps) = crate::testutil::spawn(1);
        let p = ps[0];
        crate::testutil::run(&mut t, p);

        let mut k = KbdState::new();
        assert_eq!(k.open(), 0);
        assert_eq!(k.ioctl(abi::DEV_IOCTL_SET_EOF, u32::from(b'x')), 0);

        let mut buf = [0u8; 8];
        assert_eq!(
            k.read(&mut t, p, buf.as_mut_ptr() as usize, buf.len()),
            -1
        );
        t[p].state = crate::proc::ProcState::BlockedDev;

        // The end-of-input character completes the read empty-handed...
        k.input(&mut t, 0x2D); // 'x'
        assert_eq!(t[p].rc, 0);
        // ...and every read after that reports end of input.
        assert_eq!(
            k.read(&mut t, p, buf.as_mut_ptr() as usize, buf.len()),
            0
        );
    }

    #[test]
    fn exclusive_open() {
        let mut k = KbdState::new();
        assert_eq!(k.open(), 0);
        assert_eq!(k.open(), -1);
        assert_eq!(k.close(), 0);
        assert_eq!(k.open(), 0);
    }
}
