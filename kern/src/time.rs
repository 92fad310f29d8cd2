// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel timekeeping constants and conversions.
//!
//! Time is measured in PIT ticks; nothing in the kernel keeps an absolute
//! clock. The sleep queue stores tick deltas and these conversions define
//! how user milliseconds map onto them.

/// Timer interrupt rate.
pub const CLOCK_HZ: u32 = 100;

/// Milliseconds per tick.
pub const TICK_MS: u32 = 1000 / CLOCK_HZ;

/// The PIT's input oscillator frequency.
const PIT_HZ: u32 = 1_193_182;

/// Divisor programmed into the PIT to produce [`CLOCK_HZ`]; this is the
/// preemption quantum.
pub const CLOCK_DIVISOR: u32 = PIT_HZ / CLOCK_HZ;

/// Ticks to hold a process asleep for `ms` milliseconds. Rounds up, so the
/// process never wakes before the requested duration has fully elapsed.
pub fn ticks_for_ms(ms: u32) -> u32 {
    ms.div_ceil(TICK_MS)
}

/// Milliseconds represented by `ticks`, for reporting residual sleep time.
pub fn ms_for_ticks(ticks: u32) -> u32 {
    ticks.saturating_mul(TICK_MS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_conversion_rounds_up() {
        assert_eq!(ticks_for_ms(0), 0);
        assert_eq!(ticks_for_ms(1), 1);
        assert_eq!(ticks_for_ms(TICK_MS), 1);
        assert_eq!(ticks_for_ms(TICK_MS + 1), 2);
        assert_eq!(ticks_for_ms(100), 100 / TICK_MS);
    }

    #[test]
    fn residual_conversion() {
        assert_eq!(ms_for_ticks(0), 0);
        assert_eq!(ms_for_ticks(7), 7 * TICK_MS);
        assert_eq!(ms_for_ticks(u32::MAX), u32::MAX);
    }
}
