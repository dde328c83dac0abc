// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Utility functions used by several parts of this crate.
//!
//! This module is for anything that doesn't fit into the other top-level modules. Try not to add
//! new code here unless it really doesn't belong anywhere else.

/// Pipeline timestamps and durations, in nanoseconds.
pub type ClockTime = u64;

/// Number of `ClockTime` units in one second.
pub const SECOND: ClockTime = 1_000_000_000;

/// Number of component ticks in one second. Components express timestamps in microseconds.
pub const TICKS_PER_SECOND: u64 = 1_000_000;

/// Framerate assumed when a frame carries neither a timestamp nor a duration.
pub const DEFAULT_FRAMERATE: u64 = 30;

/// Computes `val * num / denom` without intermediate overflow.
///
/// The result saturates at `u64::MAX`, which is also what is returned when `denom` is zero.
pub fn scale(val: u64, num: u64, denom: u64) -> u64 {
    if denom == 0 {
        return u64::MAX;
    }

    let res = (val as u128 * num as u128) / denom as u128;
    u64::try_from(res).unwrap_or(u64::MAX)
}

/// Converts a pipeline timestamp into component ticks.
pub fn clock_time_to_ticks(time: ClockTime) -> u64 {
    scale(time, TICKS_PER_SECOND, SECOND)
}

/// Converts component ticks back into a pipeline timestamp.
pub fn ticks_to_clock_time(ticks: u64) -> ClockTime {
    scale(ticks, SECOND, TICKS_PER_SECOND)
}

/// Duration of one frame at `DEFAULT_FRAMERATE`.
pub fn default_frame_duration() -> ClockTime {
    SECOND / DEFAULT_FRAMERATE
}

/// Expresses the framerate `num/den` as a Q16 fixed point value, the way port definitions carry
/// it. A zero denominator means "unknown" and maps to zero.
pub fn framerate_to_q16(num: u32, den: u32) -> u32 {
    if den == 0 {
        return 0;
    }

    u32::try_from(((num as u64) << 16) / den as u64).unwrap_or(u32::MAX)
}

/// Aligns `value` up to the next multiple of `alignment`, which must be a power of two.
pub fn align_up(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}
