//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Just enough RTCP for the receive pipeline: sender-report extraction on the
//! way in, NACK / PLI / FIR / loss-notification feedback on the way out.
//! Compound packets are plaintext; SRTCP is the transport's concern.

use byteorder::{ReadBytesExt, BE};
use log::*;
use metrics::event;
use video_common::{parse_u16, parse_u32, parse_u64, Bits, CheckedSplitAt, Writer};

use super::{FullSequenceNumber, Ssrc, TruncatedSequenceNumber, TruncatedTimestamp, VERSION};

const RTCP_COMMON_HEADER_LEN: usize = 4;
const RTCP_SENDER_REPORT_BODY_LEN: usize = 24;
pub const RTCP_TYPE_SENDER_REPORT: u8 = 200;
pub const RTCP_TYPE_GENERIC_FEEDBACK: u8 = 205;
pub const RTCP_FORMAT_NACK: u8 = 1;
pub const RTCP_TYPE_SPECIFIC_FEEDBACK: u8 = 206;
pub const RTCP_FORMAT_PLI: u8 = 1;
pub const RTCP_FORMAT_FIR: u8 = 4;
pub const RTCP_FORMAT_LOSS_NOTIFICATION: u8 = 15;

/// The NTP/RTP timestamp pairing from a sender report, which the embedder
/// needs for capture-time estimation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SenderReport {
    pub ssrc: Ssrc,
    /// Q32.32 NTP timestamp.
    pub ntp_timestamp: u64,
    pub rtp_timestamp: TruncatedTimestamp,
}

impl SenderReport {
    fn parse(body: &[u8]) -> Option<Self> {
        if body.len() < RTCP_SENDER_REPORT_BODY_LEN {
            return None;
        }
        Some(Self {
            ssrc: parse_u32(&body[0..4]),
            ntp_timestamp: parse_u64(&body[4..12]),
            rtp_timestamp: parse_u32(&body[12..16]),
            // The packet and octet counts and any report blocks are not
            // interesting to the receive pipeline.
        })
    }
}

/// Walks a compound RTCP packet and pulls out the sender reports. Packet
/// types the pipeline doesn't consume are skipped by length.
pub fn parse_compound_rtcp(packet: &[u8]) -> Option<Vec<SenderReport>> {
    let mut sender_reports = vec![];
    let mut remaining = packet;
    while !remaining.is_empty() {
        let Some((header, after_header)) = remaining.checked_split_at(RTCP_COMMON_HEADER_LEN)
        else {
            event!("video.rtcp.invalid.header_truncated");
            debug!("RTCP packet too small for a header: {} bytes", remaining.len());
            return None;
        };
        let version = header[0] >> 6;
        if version != VERSION {
            event!("video.rtcp.invalid.version");
            debug!("RTCP packet has unknown version: {version}");
            return None;
        }
        let pt = header[1];
        let payload_len = (parse_u16(&header[2..4]) as usize) * 4;
        let Some((payload, rest)) = after_header.checked_split_at(payload_len) else {
            event!("video.rtcp.invalid.payload_truncated");
            debug!("RTCP packet too small for {payload_len} payload bytes (pt {pt})");
            return None;
        };
        if pt == RTCP_TYPE_SENDER_REPORT {
            match SenderReport::parse(payload) {
                Some(sender_report) => sender_reports.push(sender_report),
                None => {
                    event!("video.rtcp.invalid.sender_report");
                    debug!("RTCP sender report too small: {} bytes", payload.len());
                }
            }
        }
        remaining = rest;
    }
    Some(sender_reports)
}

fn write_rtcp_packet(pt: u8, format: u8, payload: impl Writer) -> Vec<u8> {
    let payload_len = payload.written_len();
    debug_assert!(payload_len % 4 == 0);
    let length_in_words_minus_one = (payload_len / 4) as u16;
    (
        [(VERSION << 6) | (format & 0b11111), pt],
        length_in_words_minus_one,
        payload,
    )
        .to_vec()
}

pub fn write_pli(sender_ssrc: Ssrc, media_ssrc: Ssrc) -> Vec<u8> {
    write_rtcp_packet(
        RTCP_TYPE_SPECIFIC_FEEDBACK,
        RTCP_FORMAT_PLI,
        (sender_ssrc, media_ssrc),
    )
}

pub fn write_fir(sender_ssrc: Ssrc, media_ssrc: Ssrc, command_seqnum: u8) -> Vec<u8> {
    // The media ssrc field of a FIR is always zero; targets are named by the
    // FCI entries instead.
    write_rtcp_packet(
        RTCP_TYPE_SPECIFIC_FEEDBACK,
        RTCP_FORMAT_FIR,
        (sender_ssrc, 0u32, media_ssrc, [command_seqnum, 0, 0, 0]),
    )
}

pub fn write_nack_feedback(
    sender_ssrc: Ssrc,
    media_ssrc: Ssrc,
    seqnums: impl Iterator<Item = FullSequenceNumber>,
) -> Vec<u8> {
    write_rtcp_packet(
        RTCP_TYPE_GENERIC_FEEDBACK,
        RTCP_FORMAT_NACK,
        (sender_ssrc, write_nack(media_ssrc, seqnums)),
    )
}

/// None when the two sequence numbers are too far apart for the 15-bit delta.
pub fn write_loss_notification(
    sender_ssrc: Ssrc,
    media_ssrc: Ssrc,
    last_decoded: FullSequenceNumber,
    last_received: FullSequenceNumber,
    decodability_flag: bool,
) -> Option<Vec<u8>> {
    let delta = last_received.checked_sub(last_decoded)?;
    if delta > 0x7FFF {
        return None;
    }
    Some(write_rtcp_packet(
        RTCP_TYPE_SPECIFIC_FEEDBACK,
        RTCP_FORMAT_LOSS_NOTIFICATION,
        (
            sender_ssrc,
            media_ssrc,
            *b"LNTF",
            last_decoded as TruncatedSequenceNumber,
            ((delta as u16) << 1) | (decodability_flag as u16),
        ),
    ))
}

#[derive(Debug, PartialEq, Eq)]
pub struct Nack {
    pub ssrc: Ssrc,
    pub seqnums: Vec<TruncatedSequenceNumber>,
}

pub fn parse_nack(rtcp_payload: &[u8]) -> std::io::Result<Nack> {
    let mut reader = rtcp_payload;
    let ssrc = reader.read_u32::<BE>()?;
    let mut seqnums = Vec::new();
    while !reader.is_empty() {
        let first_seqnum = reader.read_u16::<BE>()?;
        let mask = reader.read_u16::<BE>()?;
        let entry_seqnums =
            std::iter::once(first_seqnum).chain((0..16u16).filter_map(move |index| {
                if mask.ls_bit(index as u8) {
                    Some(first_seqnum.wrapping_add(index + 1))
                } else {
                    None
                }
            }));
        seqnums.extend(entry_seqnums);
    }
    Ok(Nack { ssrc, seqnums })
}

// This will only work well if the iterator provides seqnums in order.
pub fn write_nack(
    ssrc: Ssrc,
    mut seqnums: impl Iterator<Item = FullSequenceNumber>,
) -> impl Writer {
    let mut items: Vec<(TruncatedSequenceNumber, u16)> = vec![];
    if let Some(mut first_seqnum) = seqnums.next() {
        let mut mask = 0u16;
        for seqnum in seqnums {
            let diff = seqnum.saturating_sub(first_seqnum);
            if (1..=16).contains(&diff) {
                let index = (diff - 1) as u8;
                mask = mask.set_ls_bit(index);
            } else {
                // Record this item and reset to another item
                items.push((first_seqnum as u16, mask));
                first_seqnum = seqnum;
                mask = 0u16;
            }
        }
        items.push((first_seqnum as u16, mask))
    }
    (ssrc, items)
}
