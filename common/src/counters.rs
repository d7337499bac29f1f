//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

use std::{
    convert::{TryFrom, TryInto},
    ops::Sub,
};

/// Expands a truncated counter value to the full length by using the previous largest value as
/// guide to rollover/rollunder. Updates this maximum.
///
/// RTP truncates most of its counters on the wire (sequence numbers to 16 bits, timestamps to
/// 32 bits, frame numbers to 16 bits), so every receive path funnels through this.
///
/// # Arguments
///
/// * `truncated` - The truncated counter value.
/// * `max` - The previously returned value from this function.
/// * `width` - The bit width the supplied value has been truncated to.
pub fn expand_truncated_counter<Truncated>(truncated: Truncated, max: &mut u64, width: usize) -> u64
where
    Truncated: TryFrom<u64> + Into<u64> + Sub<Truncated, Output = Truncated> + Ord + Copy,
    <Truncated as TryFrom<u64>>::Error: std::fmt::Debug,
{
    let mask: u64 = (1 << width) - 1;
    let really_big: Truncated = (1 << (width - 1)).try_into().unwrap();

    let truncated_max = (*max & mask).try_into().unwrap();
    let max_roc = *max >> width;
    let roc: u64 = if truncated_max > truncated && truncated_max - truncated > really_big {
        // Truncated is a lot smaller than the max;  It's likely a rollover.
        max_roc + 1
    } else if max_roc > 0 && truncated > truncated_max && truncated - truncated_max > really_big {
        // Truncated is a lot bigger than the max;  It's likely a rollunder.
        max_roc - 1
    } else {
        // Truncated is close to the max, so it's neither rollover nor rollunder.
        max_roc
    };
    let full = (roc << width) | (truncated.into() & mask);
    if full > *max {
        *max = full;
    }
    full
}
