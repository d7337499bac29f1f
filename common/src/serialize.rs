//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Composable serialization of wire formats into byte vectors. Integers are
//! written big-endian; tuples and vectors concatenate their parts, so a
//! packet layout reads as one expression.

pub trait Writer {
    fn written_len(&self) -> usize;
    fn write_to(&self, out: &mut Vec<u8>);
    fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.written_len());
        self.write_to(&mut out);
        out
    }
}

impl<const N: usize> Writer for [u8; N] {
    fn written_len(&self) -> usize {
        N
    }
    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self);
    }
}

impl Writer for u16 {
    fn written_len(&self) -> usize {
        2
    }
    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_be_bytes());
    }
}

impl Writer for u32 {
    fn written_len(&self) -> usize {
        4
    }
    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_be_bytes());
    }
}

macro_rules! impl_writer_tuple {
    ($($name:ident)+) => (
    impl<$($name: Writer),+> Writer for ($($name,)+) {
        #[allow(non_snake_case)]
        fn written_len(&self) -> usize {
            let ($(ref $name,)+) = *self;
            let mut len = 0;
            $(len += $name.written_len();)+
            len
        }
        #[allow(non_snake_case)]
        fn write_to(&self, out: &mut Vec<u8>) {
            let ($(ref $name,)+) = *self;
            $($name.write_to(out);)+
        }
    });
}

impl_writer_tuple! { A }
impl_writer_tuple! { A B }
impl_writer_tuple! { A B C }
impl_writer_tuple! { A B C D }
impl_writer_tuple! { A B C D E }

impl<T: Writer> Writer for Vec<T> {
    fn written_len(&self) -> usize {
        self.iter().map(|item| item.written_len()).sum()
    }
    fn write_to(&self, out: &mut Vec<u8>) {
        for item in self {
            item.write_to(out);
        }
    }
}

// So borrowed values can slot into tuples.
impl<T: Writer + ?Sized> Writer for &T {
    fn written_len(&self) -> usize {
        T::written_len(self)
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        T::write_to(self, out)
    }
}
