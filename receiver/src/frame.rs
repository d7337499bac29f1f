//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Frame-level types: what the packet buffer assembles and what the
//! reference finder hands to the frame sink.

use video_common::{Instant, PixelSize};

use crate::rtp::{
    ColorSpace, FullFrameNumber, FullSequenceNumber, FullTimestamp, PlayoutDelay, RtpPacketInfo,
    VideoContentType, VideoRotation,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum_macros::Display, strum_macros::EnumString)]
pub enum VideoCodec {
    Generic,
    Vp8,
    Vp9,
    Av1,
    H264,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VideoFrameType {
    Key,
    #[default]
    Delta,
}

impl VideoFrameType {
    pub fn is_key(self) -> bool {
        self == Self::Key
    }
}

/// How a frame participates in each decode target, from the dependency
/// descriptor's two-bit encoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeTargetIndication {
    NotPresent,
    Discardable,
    Switch,
    Required,
}

impl DecodeTargetIndication {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => Self::NotPresent,
            1 => Self::Discardable,
            2 => Self::Switch,
            _ => Self::Required,
        }
    }
}

/// The frame's node in the dependency graph, from either descriptor
/// extension. Frame ids and dependencies are already unwrapped.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GenericFrameInfo {
    pub frame_id: FullFrameNumber,
    pub spatial_index: u8,
    pub temporal_index: u8,
    pub frame_dependencies: Vec<FullFrameNumber>,
    pub decode_target_indications: Vec<DecodeTargetIndication>,
    pub discardable: bool,
}

/// Per-packet video metadata: what the depacketizer learned from the payload
/// merged with what the header extensions carried.
#[derive(Clone, Debug, Default)]
pub struct VideoHeader {
    pub frame_type: VideoFrameType,
    pub is_first_packet_in_frame: bool,
    pub is_last_packet_in_frame: bool,
    pub generic: Option<GenericFrameInfo>,
    pub rotation: Option<VideoRotation>,
    pub content_type: Option<VideoContentType>,
    pub playout_delay: Option<PlayoutDelay>,
    pub color_space: Option<ColorSpace>,
    pub corruption_detection: Option<Vec<u8>>,
    pub resolution: Option<PixelSize>,
}

/// A complete video frame: every packet between first and last seqnum was
/// received and the bitstream is reassembled.
#[derive(Clone, Debug)]
pub struct Frame {
    pub first_seqnum: FullSequenceNumber,
    pub last_seqnum: FullSequenceNumber,
    pub timestamp: FullTimestamp,
    pub codec: VideoCodec,
    pub frame_type: VideoFrameType,
    pub generic: Option<GenericFrameInfo>,
    pub rotation: Option<VideoRotation>,
    pub content_type: Option<VideoContentType>,
    pub playout_delay: Option<PlayoutDelay>,
    pub color_space: Option<ColorSpace>,
    pub corruption_detection: Option<Vec<u8>>,
    pub resolution: Option<PixelSize>,
    /// Max over the frame's packets.
    pub times_nacked: u8,
    pub first_received: Instant,
    pub last_received: Instant,
    pub packet_infos: Vec<RtpPacketInfo>,
    pub bitstream: Vec<u8>,
    /// Assigned by the reference finder before delivery.
    pub picture_id: FullFrameNumber,
    pub references: Vec<FullFrameNumber>,
}

impl Frame {
    pub fn is_keyframe(&self) -> bool {
        self.frame_type.is_key()
    }
}
