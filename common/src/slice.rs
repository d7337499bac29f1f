//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

pub trait CheckedSplitAt {
    fn checked_split_at(&self, mid: usize) -> Option<(&[u8], &[u8])>;
}

impl CheckedSplitAt for [u8] {
    fn checked_split_at(&self, mid: usize) -> Option<(&[u8], &[u8])> {
        if self.len() < mid {
            None
        } else {
            Some(self.split_at(mid))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_within_bounds() {
        let packet = [1u8, 2, 3, 4];
        assert_eq!(
            Some((&packet[..2], &packet[2..])),
            packet.checked_split_at(2)
        );
        assert_eq!(
            Some((&packet[..4], &[] as &[u8])),
            packet.checked_split_at(4)
        );
        assert_eq!(
            Some((&[] as &[u8], &packet[..])),
            packet.checked_split_at(0)
        );
    }

    #[test]
    fn split_out_of_bounds() {
        let packet = [1u8, 2, 3, 4];
        assert_eq!(None, packet.checked_split_at(5));
        assert_eq!(None, [].checked_split_at(1));
    }
}
