//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! RED (RFC 2198) demultiplexing and ULPFEC (RFC 5109) recovery. Media
//! blocks are unwrapped back into plain RTP packets; FEC blocks are held
//! until exactly one of the packets they protect is missing, which is then
//! reconstructed by XOR.

use std::collections::VecDeque;

use log::*;
use metrics::event;
use video_common::{parse_u16, Bits, KeySortedCache};

use super::{
    FullSequenceNumber, PayloadType, RtpPacket, Ssrc, TruncatedSequenceNumber,
    RTP_MIN_HEADER_LEN,
};

/// FEC packets pending recovery; the oldest is dropped past this.
pub const MAX_FEC_PACKETS: usize = 48;
/// How many received media packets are retained for XOR.
pub const MAX_TRACKED_MEDIA_PACKETS: usize = 192;

const RED_HEADER_LEN: usize = 1;
const FEC_HEADER_LEN: usize = 10;
const PACKET_MASK_LEN_CLEAR: usize = 2;
const PACKET_MASK_LEN_SET: usize = 6;

pub enum RedPayload {
    /// The media packet that was wrapped inside the RED block.
    Media(RtpPacket),
    /// The block carried FEC and was queued for recovery.
    Fec,
}

struct PendingFecPacket {
    protected_seqnums: Vec<FullSequenceNumber>,
    protection_length: usize,
    /// Offset of the level-0 payload within `payload`.
    payload_start: usize,
    /// The FEC header and everything after it.
    payload: Vec<u8>,
}

pub struct UlpfecReceiver {
    ssrc: Ssrc,
    ulpfec_payload_type: Option<PayloadType>,
    pending_fec: VecDeque<PendingFecPacket>,
    /// Serialized media packets (RED header excised), keyed by expanded
    /// sequence number.
    media_window: KeySortedCache<FullSequenceNumber, Vec<u8>>,
}

impl UlpfecReceiver {
    pub fn new(ssrc: Ssrc, ulpfec_payload_type: Option<PayloadType>) -> Self {
        Self {
            ssrc,
            ulpfec_payload_type,
            pending_fec: VecDeque::new(),
            media_window: KeySortedCache::new(MAX_TRACKED_MEDIA_PACKETS),
        }
    }

    /// Unwraps one RED packet. `raw` must be the buffer `packet` was parsed
    /// from; the XOR window keeps original bytes, not reserialized ones.
    pub fn add_received_red_packet(
        &mut self,
        packet: &RtpPacket,
        raw: &[u8],
        seqnum: FullSequenceNumber,
    ) -> Option<RedPayload> {
        debug_assert!(packet.header_len <= raw.len());
        let Some((&red_header, block)) = packet.payload.split_first() else {
            event!("video.rtp.invalid.red_header");
            debug!("RED packet has no blocks");
            return None;
        };
        if red_header & 0x80 != 0 {
            event!("video.rtp.invalid.red_multiple_blocks");
            debug!("RED packets with more than one block are not supported");
            return None;
        }
        let block_payload_type = red_header & 0x7F;

        if self.ulpfec_payload_type == Some(block_payload_type) {
            self.add_fec_payload(seqnum, block);
            return Some(RedPayload::Fec);
        }

        // Rebuild the packet as it would have arrived without RED: the
        // original header with the block's payload type, then everything
        // after the RED header, padding included.
        let mut media_bytes = Vec::with_capacity(raw.len() - RED_HEADER_LEN);
        media_bytes.extend_from_slice(&raw[..packet.header_len]);
        media_bytes[1] = (media_bytes[1] & 0x80) | block_payload_type;
        media_bytes.extend_from_slice(&raw[packet.header_len + RED_HEADER_LEN..]);

        let media_packet = RtpPacket::parse(&media_bytes)?;
        self.media_window.insert(seqnum, media_bytes);
        Some(RedPayload::Media(media_packet))
    }

    fn add_fec_payload(&mut self, fec_seqnum: FullSequenceNumber, bytes: &[u8]) {
        let Some(pending) = parse_fec_payload(fec_seqnum, bytes) else {
            return;
        };
        if self.pending_fec.len() >= MAX_FEC_PACKETS {
            event!("video.fec.pending_overflow");
            self.pending_fec.pop_front();
        }
        self.pending_fec.push_back(pending);
    }

    /// Runs recovery over the pending FEC packets, repeating while each
    /// recovered packet may unblock another.
    pub fn process_received_fec(&mut self) -> Vec<RtpPacket> {
        let mut recovered_packets = vec![];
        let mut made_progress = true;
        while made_progress {
            made_progress = false;
            let mut index = 0;
            while index < self.pending_fec.len() {
                let missing: Vec<FullSequenceNumber> = self.pending_fec[index]
                    .protected_seqnums
                    .iter()
                    .copied()
                    .filter(|seqnum| !self.media_window.contains_key(seqnum))
                    .collect();
                match missing.as_slice() {
                    [] => {
                        // Everything it protects arrived; nothing left to do.
                        self.pending_fec.remove(index);
                    }
                    [missing_seqnum] => {
                        let missing_seqnum = *missing_seqnum;
                        if let Some(fec) = self.pending_fec.remove(index) {
                            if let Some((packet, bytes)) =
                                self.recover_packet(&fec, missing_seqnum)
                            {
                                event!("video.fec.recovered");
                                self.media_window.insert(missing_seqnum, bytes);
                                recovered_packets.push(packet);
                                made_progress = true;
                            }
                        }
                    }
                    _ => {
                        index += 1;
                    }
                }
            }
        }
        recovered_packets
    }

    fn recover_packet(
        &self,
        fec: &PendingFecPacket,
        missing_seqnum: FullSequenceNumber,
    ) -> Option<(RtpPacket, Vec<u8>)> {
        let fec_payload = &fec.payload;
        let mut header = [0u8; RTP_MIN_HEADER_LEN];
        header[0..2].copy_from_slice(&fec_payload[0..2]);
        header[4..8].copy_from_slice(&fec_payload[4..8]);
        let mut recovered_length = parse_u16(&fec_payload[8..10]);
        let mut payload =
            fec_payload[fec.payload_start..fec.payload_start + fec.protection_length].to_vec();

        for &seqnum in &fec.protected_seqnums {
            if seqnum == missing_seqnum {
                continue;
            }
            let media = self.media_window.get(&seqnum)?;
            header[0] ^= media[0];
            header[1] ^= media[1];
            for i in 4..8 {
                header[i] ^= media[i];
            }
            recovered_length ^= (media.len() - RTP_MIN_HEADER_LEN) as u16;
            for (byte, &media_byte) in payload.iter_mut().zip(&media[RTP_MIN_HEADER_LEN..]) {
                *byte ^= media_byte;
            }
        }

        // Force version 2 and fill in what XOR cannot reconstruct.
        header[0] = (header[0] | 0x80) & 0xBF;
        header[2..4].copy_from_slice(&(missing_seqnum as TruncatedSequenceNumber).to_be_bytes());
        header[8..12].copy_from_slice(&self.ssrc.to_be_bytes());

        let recovered_length = recovered_length as usize;
        if recovered_length > payload.len() {
            event!("video.rtp.invalid.fec_recovered_length");
            debug!(
                "recovered length {recovered_length} exceeds the protection length {}",
                payload.len()
            );
            return None;
        }

        let mut bytes = Vec::with_capacity(RTP_MIN_HEADER_LEN + recovered_length);
        bytes.extend_from_slice(&header);
        bytes.extend_from_slice(&payload[..recovered_length]);
        let mut packet = RtpPacket::parse(&bytes)?;
        packet.recovered = true;
        Some((packet, bytes))
    }
}

fn parse_fec_payload(
    fec_seqnum: FullSequenceNumber,
    bytes: &[u8],
) -> Option<PendingFecPacket> {
    if bytes.len() < FEC_HEADER_LEN {
        event!("video.rtp.invalid.fec_header");
        debug!("FEC payload too small: {} bytes", bytes.len());
        return None;
    }
    if bytes[0] & 0x80 != 0 {
        event!("video.rtp.invalid.fec_extension");
        debug!("FEC extension bit set");
        return None;
    }
    let mask_len = if bytes[0] & 0x40 != 0 {
        PACKET_MASK_LEN_SET
    } else {
        PACKET_MASK_LEN_CLEAR
    };
    let payload_start = FEC_HEADER_LEN + 2 + mask_len;
    if bytes.len() < payload_start {
        event!("video.rtp.invalid.fec_header");
        debug!("FEC payload too small for its level header");
        return None;
    }
    let protection_length = parse_u16(&bytes[FEC_HEADER_LEN..FEC_HEADER_LEN + 2]) as usize;
    if bytes.len() - payload_start < protection_length {
        event!("video.rtp.invalid.fec_truncated");
        debug!(
            "FEC payload has {} bytes but protects {protection_length}",
            bytes.len() - payload_start
        );
        return None;
    }

    let sn_base = expand_nearby(parse_u16(&bytes[2..4]), fec_seqnum);
    let mask = &bytes[FEC_HEADER_LEN + 2..payload_start];
    let mut protected_seqnums = vec![];
    for (byte_index, &mask_byte) in mask.iter().enumerate() {
        for bit_index in 0..8u8 {
            if mask_byte.ms_bit(bit_index) {
                protected_seqnums.push(sn_base + (byte_index * 8 + bit_index as usize) as u64);
            }
        }
    }
    if protected_seqnums.is_empty() {
        event!("video.rtp.invalid.fec_empty_mask");
        debug!("FEC packet protects nothing");
        return None;
    }

    Some(PendingFecPacket {
        protected_seqnums,
        protection_length,
        payload_start,
        payload: bytes.to_vec(),
    })
}

/// The expansion of `truncated` closest to `reference`, which may be behind
/// it. FEC masks refer to packets near the FEC packet's own seqnum, not
/// necessarily before the stream's maximum.
fn expand_nearby(
    truncated: TruncatedSequenceNumber,
    reference: FullSequenceNumber,
) -> FullSequenceNumber {
    let reference_truncated = reference as TruncatedSequenceNumber;
    let roc = reference >> 16;
    let roc = if truncated > reference_truncated && (truncated - reference_truncated) > 0x8000 {
        roc.saturating_sub(1)
    } else if reference_truncated > truncated && (reference_truncated - truncated) > 0x8000 {
        roc + 1
    } else {
        roc
    };
    (roc << 16) | (truncated as u64)
}
