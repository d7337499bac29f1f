//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Turns RTP payloads back into codec bitstream fragments. Raw payloads
//! pass through untouched (framing comes from the dependency descriptor);
//! the generic and H.264 formats carry framing in the payload itself.

use log::*;

use crate::frame::{VideoCodec, VideoFrameType, VideoHeader};

pub mod h264;

use h264::H264PacketInfo;

const GENERIC_KEY_FRAME_BIT: u8 = 0x01;
const GENERIC_FIRST_PACKET_BIT: u8 = 0x02;
const GENERIC_EXTENDED_HEADER_BIT: u8 = 0x04;
const GENERIC_EXTENDED_HEADER_LEN: usize = 2;

/// One RTP payload after depacketization: the bitstream fragment plus
/// whatever the payload format revealed about the frame.
#[derive(Clone, Debug, Default)]
pub struct DepacketizedPayload {
    pub header: VideoHeader,
    /// Packetization details the SPS/PPS tracker and the packet buffer
    /// need; present only for H.264.
    pub h264: Option<H264PacketInfo>,
    pub payload: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Depacketizer {
    Raw,
    Generic,
    H264,
}

impl Depacketizer {
    pub fn for_codec(codec: VideoCodec, raw_payload: bool) -> Self {
        if raw_payload {
            return Self::Raw;
        }
        match codec {
            VideoCodec::H264 => Self::H264,
            VideoCodec::Generic => Self::Generic,
            _ => Self::Raw,
        }
    }

    pub fn parse(self, payload: &[u8]) -> Option<DepacketizedPayload> {
        match self {
            Self::Raw => Some(DepacketizedPayload {
                header: VideoHeader::default(),
                h264: None,
                payload: payload.to_vec(),
            }),
            Self::Generic => parse_generic(payload),
            Self::H264 => h264::parse_h264(payload),
        }
    }
}

fn parse_generic(payload: &[u8]) -> Option<DepacketizedPayload> {
    let Some((&generic_header, rest)) = payload.split_first() else {
        debug!("empty generic payload");
        return None;
    };

    let header = VideoHeader {
        frame_type: if generic_header & GENERIC_KEY_FRAME_BIT != 0 {
            VideoFrameType::Key
        } else {
            VideoFrameType::Delta
        },
        is_first_packet_in_frame: generic_header & GENERIC_FIRST_PACKET_BIT != 0,
        ..Default::default()
    };

    let rest = if generic_header & GENERIC_EXTENDED_HEADER_BIT != 0 {
        if rest.len() < GENERIC_EXTENDED_HEADER_LEN {
            debug!("generic payload too small for the extended header");
            return None;
        }
        // The extended header is a 15-bit picture id; the sequence-number
        // reference finder does not need it, so it is only skipped.
        &rest[GENERIC_EXTENDED_HEADER_LEN..]
    } else {
        rest
    };

    Some(DepacketizedPayload {
        header,
        h264: None,
        payload: rest.to_vec(),
    })
}

/// Concatenates the per-packet bitstream fragments of one assembled frame.
pub fn assemble(fragments: &[&[u8]]) -> Vec<u8> {
    let size = fragments.iter().map(|fragment| fragment.len()).sum();
    let mut bitstream = Vec::with_capacity(size);
    for fragment in fragments {
        bitstream.extend_from_slice(fragment);
    }
    bitstream
}
