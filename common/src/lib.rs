//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Common functionality for parsing and reassembling rtp, rtcp, and fec.

mod bits;
mod collections;
mod counters;
mod serialize;
mod slice;
mod time;

use std::convert::TryInto;

pub use bits::*;
pub use collections::*;
pub use counters::*;
pub use serialize::*;
pub use slice::*;
pub use time::*;

pub fn parse_u16(bytes: &[u8]) -> u16 {
    u16::from_be_bytes(bytes[0..2].try_into().unwrap())
}

pub fn parse_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes(bytes[0..4].try_into().unwrap())
}

pub fn parse_u64(bytes: &[u8]) -> u64 {
    u64::from_be_bytes(bytes[0..8].try_into().unwrap())
}

pub fn round_up_to_multiple_of<const M: usize>(n: usize) -> usize {
    (n + (M - 1)) / M * M
}

// Can be used for video resolution
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct PixelSize {
    pub width: u16,
    pub height: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_big_endian() {
        let input = [0x01u8, 0x02, 0x03, 0x04, 0x05, 0x06];

        assert_eq!(0x0102, parse_u16(&input));
        assert_eq!(0x0102_0304, parse_u32(&input));
        assert_eq!(
            0x0102_0304_0506_0708,
            parse_u64(&[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08])
        );
    }

    #[test]
    fn round_up_multiple_4() {
        assert_eq!(0, round_up_to_multiple_of::<4>(0));
        assert_eq!(4, round_up_to_multiple_of::<4>(1));
        assert_eq!(4, round_up_to_multiple_of::<4>(4));
        assert_eq!(8, round_up_to_multiple_of::<4>(5));
        assert_eq!(12, round_up_to_multiple_of::<4>(9));
    }
}
