//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Bit indexing over unsigned integers, counted from either end. Feedback
//! bitmasks number bits from the most significant end; FEC masks do too,
//! while NACK blp fields count from the least significant end.

use std::ops::{BitAnd, BitOr, Shl, Shr};

pub trait Bits: Sized + Copy {
    const BIT_WIDTH: u8 = (std::mem::size_of::<Self>() * 8) as u8;

    /// True when the bit at `index` is one, counting from the most
    /// significant bit down.
    fn ms_bit(self, index: u8) -> bool;

    /// Returns `self` with the bit at `index` set, counting from the most
    /// significant bit down.
    fn set_ms_bit(self, index: u8) -> Self;

    /// True when the bit at `index` is one, counting from the least
    /// significant bit up.
    fn ls_bit(self, index: u8) -> bool;

    /// Returns `self` with the bit at `index` set, counting from the least
    /// significant bit up.
    fn set_ls_bit(self, index: u8) -> Self;
}

impl<T> Bits for T
where
    T: Copy
        + Shr<u8, Output = T>
        + Shl<u8, Output = T>
        + BitAnd<T, Output = T>
        + BitOr<T, Output = T>
        + From<u8>
        + Eq,
{
    fn ms_bit(self, index: u8) -> bool {
        assert!(index < Self::BIT_WIDTH);

        self.ls_bit(Self::BIT_WIDTH - index - 1)
    }

    fn set_ms_bit(self, index: u8) -> Self {
        assert!(index < Self::BIT_WIDTH);

        self.set_ls_bit(Self::BIT_WIDTH - index - 1)
    }

    fn ls_bit(self, index: u8) -> bool {
        assert!(index < Self::BIT_WIDTH);

        (self >> index) & T::from(1) != T::from(0)
    }

    fn set_ls_bit(self, index: u8) -> Self {
        assert!(index < Self::BIT_WIDTH);

        self | (T::from(1) << index)
    }
}
