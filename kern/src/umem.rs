// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Support for interacting with user memory.
//!
//! This kernel runs everything in ring 0 over a flat address space: process
//! stacks are kernel heap allocations and there is no MPU or paging between
//! the kernel and the processes it hosts. A pointer handed up through a
//! system call therefore *is* a kernel-dereferenceable address, and the only
//! checks that make sense are structural: alignment, null, and wraparound.
//!
//! [`USlice`] captures exactly that. Having a `USlice<T>` tells you:
//!
//! - The base is non-null and correctly aligned for `T`.
//! - The slice does not wrap around the end of the address space.
//!
//! It does *not* demonstrate that the referenced memory is sensible -- a
//! process can still name a wild address. The helpers at the bottom of this
//! module are the only places that actually dereference user pointers, and
//! each carries the flat-memory-model argument for why that is sound.

use core::marker::PhantomData;

use byteorder::{ByteOrder, LittleEndian};
use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::err::UsageError;

/// A (user, untrusted) slice: a base address and element count taken at a
/// process's word.
pub struct USlice<T> {
    /// Where the slice allegedly starts.
    base: usize,
    /// How many `T`s it allegedly holds.
    length: usize,
    /// `T` only shapes the checks; no `T` is stored here.
    _marker: PhantomData<*mut [T]>,
}

impl<T> USlice<T> {
    /// Runs the structural checks on a base/length pair from user code and,
    /// if they hold, vouches for them as a `USlice`.
    ///
    /// The checks: the base must be aligned for `T`, a non-empty slice must
    /// not start at null, and the slice's byte extent must fit below the top
    /// of the address space without wrapping. Zero-sized `T` is a kernel
    /// bug, not a user error, and halts.
    pub fn from_raw(base: usize, length: usize) -> Result<Self, UsageError> {
        uassert!(core::mem::size_of::<T>() != 0);

        if base % core::mem::align_of::<T>() != 0 {
            return Err(UsageError);
        }
        if base == 0 && length != 0 {
            return Err(UsageError);
        }
        // Total byte size, refusing lengths whose multiplication already
        // wraps.
        let size_in_bytes = length
            .checked_mul(core::mem::size_of::<T>())
            .ok_or(UsageError)?;
        // The slice's last byte must stay inside the address space, i.e.
        // base + size must not wrap. Phrased as a subtraction from the top
        // so the comparison itself can't overflow.
        if base > usize::MAX - size_in_bytes {
            return Err(UsageError);
        }
        Ok(Self {
            base,
            length,
            _marker: PhantomData,
        })
    }

    /// Whether the slice covers no elements at all.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Element count.
    pub fn len(&self) -> usize {
        self.length
    }

    /// Lowest address the slice claims.
    pub fn base_addr(&self) -> usize {
        self.base
    }
}

impl<T> USlice<T>
where
    T: FromBytes + Immutable + KnownLayout,
{
    /// Materializes the slice so the kernel can read through it.
    ///
    /// # Safety
    ///
    /// `USlice` only checks structure, so to use this you must convince
    /// yourself that the memory the slice describes is real memory the
    /// process is entitled to, and that it doesn't alias anything you intend
    /// to `&mut`-reference.
    pub unsafe fn assume_readable(&self) -> &[T] {
        // Safety: the caller has discharged this function's contract, which
        // is everything `from_raw` didn't already check.
        unsafe {
            core::slice::from_raw_parts(self.base as *const T, self.length)
        }
    }

    /// Materializes the slice so the kernel can read and write through it.
    ///
    /// # Safety
    ///
    /// As `assume_readable`, plus: the memory must not alias any other slice
    /// you intend to access during the borrow.
    pub unsafe fn assume_writable(&mut self) -> &mut [T] {
        // Safety: the caller has discharged this function's contract, which
        // is everything `from_raw` didn't already check.
        unsafe {
            core::slice::from_raw_parts_mut(self.base as *mut T, self.length)
        }
    }
}

impl<T> Clone for USlice<T> {
    fn clone(&self) -> Self {
        Self {
            base: self.base,
            length: self.length,
            _marker: PhantomData,
        }
    }
}

/// Hand-written so `Debug` doesn't get gated on `T: Debug`; the element
/// type never appears in the output anyway.
impl<T> core::fmt::Debug for USlice<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("USlice")
            .field("base", &self.base)
            .field("length", &self.length)
            .finish()
    }
}

/// Reads a request's argument record from the user stack.
///
/// The syscall shims deposit a `#[repr(C)]` record on their stack and pass
/// its address in the argument register; this copies it out. The copy goes
/// through `read_from_bytes`, so the record needn't be aligned in user
/// memory.
pub fn read_args<T>(addr: usize) -> Result<T, UsageError>
where
    T: FromBytes,
{
    let slice = USlice::<u8>::from_raw(addr, core::mem::size_of::<T>())?;
    // Safety: flat memory model; the structural checks in `from_raw` have
    // passed and we only read.
    let bytes = unsafe { slice.assume_readable() };
    T::read_from_bytes(bytes).map_err(|_| UsageError)
}

/// Reads a little-endian `u32` from user memory. Byte-based, so unaligned
/// user pointers are fine.
pub fn read_u32(addr: usize) -> Result<u32, UsageError> {
    let slice = USlice::<u8>::from_raw(addr, 4)?;
    // Safety: flat memory model, structural checks passed, read-only.
    let bytes = unsafe { slice.assume_readable() };
    Ok(LittleEndian::read_u32(bytes))
}

/// Writes a little-endian `u32` into user memory.
pub fn write_u32(addr: usize, value: u32) -> Result<(), UsageError> {
    let mut slice = USlice::<u8>::from_raw(addr, 4)?;
    // Safety: flat memory model, structural checks passed; the kernel holds
    // no other reference into user memory at this point.
    let bytes = unsafe { slice.assume_writable() };
    LittleEndian::write_u32(bytes, value);
    Ok(())
}

/// Writes a sequence of machine words into user memory, lowest address
/// first. Used to manufacture stack frames.
pub fn write_words(addr: usize, words: &[usize]) -> Result<(), UsageError> {
    let mut slice = USlice::<usize>::from_raw(addr, words.len())?;
    // Safety: flat memory model, structural checks passed; the kernel holds
    // no other reference into user memory at this point.
    let cells = unsafe { slice.assume_writable() };
    cells.copy_from_slice(words);
    Ok(())
}

/// Copies a NUL-terminated string out of user memory into `buf`, returning
/// the number of bytes copied (the terminator excluded). Stops quietly at
/// the capacity of `buf`.
pub fn read_cstr(addr: usize, buf: &mut [u8]) -> Result<usize, UsageError> {
    let mut n = 0;
    while n < buf.len() {
        let cell = USlice::<u8>::from_raw(addr + n, 1)?;
        // Safety: flat memory model, structural checks passed, read-only.
        let b = unsafe { cell.assume_readable()[0] };
        if b == 0 {
            break;
        }
        buf[n] = b;
        n += 1;
    }
    Ok(n)
}

/// Copies bytes between two user buffers, kernel-mediated.
///
/// The actual number of bytes copied is `min(from_len, to_len)`, and is
/// returned. Negative lengths have already been clamped to zero by callers.
pub fn copy_bytes(
    from: usize,
    from_len: usize,
    to: usize,
    to_len: usize,
) -> Result<usize, UsageError> {
    let n = from_len.min(to_len);
    if n == 0 {
        return Ok(0);
    }
    let src = USlice::<u8>::from_raw(from, n)?;
    let dst = USlice::<u8>::from_raw(to, n)?;
    // Safety: flat memory model, both slices structurally valid. `copy` has
    // memmove semantics, so even a process passing itself overlapping
    // buffers gets a defined (if unhelpful) result.
    unsafe {
        core::ptr::copy(src.base_addr() as *const u8, dst.base_addr() as *mut u8, n);
    }
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use abi::SendArgs;

    #[test]
    fn structural_checks() {
        assert!(USlice::<u8>::from_raw(0, 1).is_err());
        assert!(USlice::<u8>::from_raw(0, 0).is_ok());
        assert!(USlice::<u8>::from_raw(usize::MAX, 2).is_err());
        assert!(USlice::<u32>::from_raw(2, 1).is_err());
        assert!(USlice::<u32>::from_raw(4, 1).is_ok());
    }

    #[test]
    fn args_round_trip() {
        let buf = [0u8; 64];
        let args = SendArgs {
            buf: buf.as_ptr() as usize,
            dst_pid: 7,
            len: 3,
        };
        let read: SendArgs =
            read_args(core::ptr::addr_of!(args) as usize).unwrap();
        assert_eq!(read.dst_pid, 7);
        assert_eq!(read.len, 3);
        assert_eq!(read.buf, buf.as_ptr() as usize);
    }

    #[test]
    fn u32_round_trip() {
        let cell = [0u8; 4];
        let addr = cell.as_ptr() as usize;
        write_u32(addr, 0xdead_beef).unwrap();
        assert_eq!(read_u32(addr).unwrap(), 0xdead_beef);
    }

    #[test]
    fn cstr_stops_at_nul_and_cap() {
        let s = b"hello\0world";
        let mut buf = [0u8; 16];
        let n = read_cstr(s.as_ptr() as usize, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");

        let mut tiny = [0u8; 3];
        let n = read_cstr(s.as_ptr() as usize, &mut tiny).unwrap();
        assert_eq!(&tiny[..n], b"hel");
    }

    #[test]
    fn copy_takes_shorter_length() {
        let src = *b"abcdefgh";
        let mut dst = [0u8; 4];
        let n = copy_bytes(
            src.as_ptr() as usize,
            src.len(),
            dst.as_mut_ptr() as usize,
            dst.len(),
        )
        .unwrap();
        assert_eq!(n, 4);
        assert_eq!(&dst, b"abcd");
    }
}
