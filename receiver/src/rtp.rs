//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Parsing of RTP packets and the header extensions the video pipeline
//! consumes. Everything here operates on plaintext packets; SRTP, if used,
//! is the transport's concern and has already been stripped.

use std::{collections::BTreeMap, ops::Range};

use log::*;
use metrics::event;
use video_common::{
    expand_truncated_counter, parse_u16, parse_u32, parse_u64, CheckedSplitAt, Duration, Instant,
};

pub mod fec;
pub mod nack;
pub mod rtcp;

pub type PayloadType = u8;
pub type FullSequenceNumber = u64;
// Not to be confused with a truncated RTP timestamp or a truncated frame number.
pub type TruncatedSequenceNumber = u16;
pub type FullTimestamp = u64;
pub type TruncatedTimestamp = u32;
pub type FullFrameNumber = u64;
pub type TruncatedFrameNumber = u16;
pub type Ssrc = u32;

pub const VERSION: u8 = 2;
const RTP_MIN_HEADER_LEN: usize = 12;
const RTP_PAYLOAD_TYPE_OFFSET: usize = 1;
const RTP_SEQNUM_RANGE: Range<usize> = 2..4;
const RTP_TIMESTAMP_RANGE: Range<usize> = 4..8;
const RTP_SSRC_RANGE: Range<usize> = 8..12;
const RTP_EXTENSIONS_HEADER_LEN: usize = 4;
const RTP_ONE_BYTE_EXTENSIONS_PROFILE: u16 = 0xBEDE;
const RTP_TWO_BYTE_EXTENSIONS_PROFILE: u16 = 0x1000;
const RTP_TWO_BYTE_EXTENSIONS_PROFILE_MASK: u16 = 0xFFF0;

// Extension ids are fixed; signaling always negotiates these values.
pub const RTP_EXT_ID_VIDEO_ORIENTATION: u8 = 4;
pub const RTP_EXT_ID_DEPENDENCY_DESCRIPTOR: u8 = 6;
pub const RTP_EXT_ID_GENERIC_FRAME_DESCRIPTOR: u8 = 7;
pub const RTP_EXT_ID_ABSOLUTE_CAPTURE_TIME: u8 = 8;
pub const RTP_EXT_ID_CONTENT_TYPE: u8 = 9;
pub const RTP_EXT_ID_PLAYOUT_DELAY: u8 = 10;
pub const RTP_EXT_ID_COLOR_SPACE: u8 = 11;
pub const RTP_EXT_ID_CORRUPTION_DETECTION: u8 = 12;

pub fn expand_seqnum(
    seqnum: TruncatedSequenceNumber,
    max_seqnum: &mut FullSequenceNumber,
) -> FullSequenceNumber {
    expand_truncated_counter(seqnum, max_seqnum, 16)
}

pub fn expand_timestamp(
    timestamp: TruncatedTimestamp,
    max_timestamp: &mut FullTimestamp,
) -> FullTimestamp {
    expand_truncated_counter(timestamp, max_timestamp, 32)
}

pub fn expand_frame_number(
    frame_number: TruncatedFrameNumber,
    max_frame_number: &mut FullFrameNumber,
) -> FullFrameNumber {
    expand_truncated_counter(frame_number, max_frame_number, 16)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum HeaderExtensionsProfile {
    OneByte,
    TwoByte,
}

impl TryFrom<u16> for HeaderExtensionsProfile {
    type Error = ();

    fn try_from(profile: u16) -> Result<Self, Self::Error> {
        match profile {
            RTP_ONE_BYTE_EXTENSIONS_PROFILE => Ok(Self::OneByte),
            profile
                if profile & RTP_TWO_BYTE_EXTENSIONS_PROFILE_MASK
                    == RTP_TWO_BYTE_EXTENSIONS_PROFILE =>
            {
                Ok(Self::TwoByte)
            }
            _ => Err(()),
        }
    }
}

impl HeaderExtensionsProfile {
    fn header_len(self) -> usize {
        match self {
            Self::OneByte => 1,
            Self::TwoByte => 2,
        }
    }
}

/// CVO (urn:3gpp:video-orientation); the low two bits of a one-byte value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VideoRotation {
    #[default]
    None,
    Clockwise90,
    Clockwise180,
    Clockwise270,
}

impl From<u8> for VideoRotation {
    fn from(cvo: u8) -> Self {
        match cvo & 0b11 {
            0 => Self::None,
            1 => Self::Clockwise90,
            2 => Self::Clockwise180,
            _ => Self::Clockwise270,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VideoContentType {
    #[default]
    Unspecified,
    Screenshare,
}

impl From<u8> for VideoContentType {
    fn from(value: u8) -> Self {
        if value & 0b1 != 0 {
            Self::Screenshare
        } else {
            Self::Unspecified
        }
    }
}

/// Sender-requested playout delay limits; two 12-bit values in 10ms units.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlayoutDelay {
    pub min: Duration,
    pub max: Duration,
}

impl PlayoutDelay {
    fn parse(value: &[u8]) -> Option<Self> {
        if value.len() < 3 {
            return None;
        }
        let min_10ms = ((value[0] as u64) << 4) | ((value[1] as u64) >> 4);
        let max_10ms = (((value[1] as u64) & 0b1111) << 8) | (value[2] as u64);
        Some(Self {
            min: Duration::from_millis(min_10ms * 10),
            max: Duration::from_millis(max_10ms * 10),
        })
    }
}

/// The base color description; HDR metadata, when present, is not retained.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ColorSpace {
    pub primaries: u8,
    pub transfer: u8,
    pub matrix: u8,
    pub range_and_chroma_siting: u8,
}

impl ColorSpace {
    fn parse(value: &[u8]) -> Option<Self> {
        // 4 bytes without HDR metadata, 28 with.
        if value.len() != 4 && value.len() != 28 {
            return None;
        }
        Some(Self {
            primaries: value[0],
            transfer: value[1],
            matrix: value[2],
            range_and_chroma_siting: value[3],
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AbsoluteCaptureTime {
    /// Q32.32 NTP timestamp of the original capture.
    pub ntp_timestamp: u64,
    /// Q31.32 offset between the capturing system's clock and the sender's, when known.
    pub estimated_capture_clock_offset: Option<i64>,
}

impl AbsoluteCaptureTime {
    fn parse(value: &[u8]) -> Option<Self> {
        match value.len() {
            8 => Some(Self {
                ntp_timestamp: parse_u64(value),
                estimated_capture_clock_offset: None,
            }),
            16 => Some(Self {
                ntp_timestamp: parse_u64(&value[..8]),
                estimated_capture_clock_offset: Some(parse_u64(&value[8..]) as i64),
            }),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RtpPacket {
    pub payload_type: PayloadType,
    pub ssrc: Ssrc,
    pub seqnum: TruncatedSequenceNumber,
    pub timestamp: TruncatedTimestamp,
    pub marker: bool,
    pub csrcs: Vec<Ssrc>,
    pub video_rotation: Option<VideoRotation>,
    pub content_type: Option<VideoContentType>,
    pub playout_delay: Option<PlayoutDelay>,
    pub color_space: Option<ColorSpace>,
    pub absolute_capture_time: Option<AbsoluteCaptureTime>,
    pub corruption_detection: Option<Vec<u8>>,
    /// Raw dependency descriptor bytes; decoding needs stream state and
    /// happens later in the pipeline.
    pub dependency_descriptor: Option<Vec<u8>>,
    pub generic_frame_descriptor: Option<Vec<u8>>,
    /// Offset of the payload within the serialized packet, so FEC can line
    /// the original bytes back up.
    pub header_len: usize,
    /// Everything after the header and extensions, padding stripped.
    pub payload: Vec<u8>,
    /// Reconstructed by FEC rather than received off the wire.
    pub recovered: bool,
}

impl RtpPacket {
    pub fn parse(packet: &[u8]) -> Option<Self> {
        if packet.len() < RTP_MIN_HEADER_LEN {
            event!("video.rtp.invalid.too_small");
            debug!("RTP packet too small: {}", packet.len());
            return None;
        }
        let version = packet[0] >> 6;
        if version != VERSION {
            event!("video.rtp.invalid.version");
            debug!("RTP packet has unknown version: {}", version);
            debug!("{}", hex::encode(&packet[..packet.len().min(100)]));
            return None;
        }
        let has_padding = (packet[0] & 0b0010_0000) != 0;
        let has_extensions = (packet[0] & 0b0001_0000) != 0;
        let csrc_count = (packet[0] & 0b0000_1111) as usize;
        let marker = (packet[RTP_PAYLOAD_TYPE_OFFSET] & 0b1000_0000) != 0;
        let payload_type = packet[RTP_PAYLOAD_TYPE_OFFSET] & 0b0111_1111;
        let seqnum = parse_u16(&packet[RTP_SEQNUM_RANGE]);
        let timestamp = parse_u32(&packet[RTP_TIMESTAMP_RANGE]);
        let ssrc = parse_u32(&packet[RTP_SSRC_RANGE]);

        let after_header = &packet[RTP_MIN_HEADER_LEN..];
        let Some((csrcs_bytes, after_csrcs)) = after_header.checked_split_at(csrc_count * 4)
        else {
            event!("video.rtp.invalid.csrcs_truncated");
            debug!("RTP packet too small for {} CSRCs", csrc_count);
            return None;
        };
        let csrcs = csrcs_bytes.chunks_exact(4).map(parse_u32).collect();

        let mut parsed = Self {
            payload_type,
            ssrc,
            seqnum,
            timestamp,
            marker,
            csrcs,
            video_rotation: None,
            content_type: None,
            playout_delay: None,
            color_space: None,
            absolute_capture_time: None,
            corruption_detection: None,
            dependency_descriptor: None,
            generic_frame_descriptor: None,
            header_len: 0,
            payload: Vec::new(),
            recovered: false,
        };

        let payload_bytes = if has_extensions {
            let Some((extensions_header, after_extensions_header)) =
                after_csrcs.checked_split_at(RTP_EXTENSIONS_HEADER_LEN)
            else {
                event!("video.rtp.invalid.extensions_header_truncated");
                debug!("RTP packet too small for extensions header");
                return None;
            };
            let profile_value = parse_u16(&extensions_header[0..2]);
            let extensions_len = (parse_u16(&extensions_header[2..4]) as usize) * 4;
            let Ok(profile) = HeaderExtensionsProfile::try_from(profile_value) else {
                event!("video.rtp.invalid.extensions_profile");
                debug!("RTP packet has unknown extensions profile: {profile_value:04x}");
                debug!("{}", hex::encode(&packet[..packet.len().min(100)]));
                return None;
            };
            let Some((extensions, payload_bytes)) =
                after_extensions_header.checked_split_at(extensions_len)
            else {
                event!("video.rtp.invalid.extensions_truncated");
                debug!("RTP packet too small for {extensions_len} bytes of extensions");
                return None;
            };
            parsed.parse_extensions(profile, extensions)?;
            payload_bytes
        } else {
            after_csrcs
        };
        parsed.header_len = packet.len() - payload_bytes.len();

        let payload = if has_padding {
            let Some(&last) = payload_bytes.last() else {
                event!("video.rtp.invalid.padding");
                debug!("RTP packet declares padding but has no bytes after the header");
                return None;
            };
            let padding_len = last as usize;
            if padding_len == 0 || padding_len > payload_bytes.len() {
                event!("video.rtp.invalid.padding");
                debug!("RTP packet has invalid padding length: {padding_len}");
                return None;
            }
            &payload_bytes[..payload_bytes.len() - padding_len]
        } else {
            payload_bytes
        };
        parsed.payload = payload.to_vec();
        Some(parsed)
    }

    fn parse_extensions(
        &mut self,
        profile: HeaderExtensionsProfile,
        extensions: &[u8],
    ) -> Option<()> {
        let mut extension_start = 0;
        while extension_start < extensions.len() {
            let remaining = &extensions[extension_start..];
            let (id, len) = match profile {
                HeaderExtensionsProfile::OneByte => {
                    let byte = remaining[0];
                    if byte == 0 {
                        // Padding between extensions.
                        extension_start += 1;
                        continue;
                    }
                    let id = byte >> 4;
                    if id == 15 {
                        // Reserved; everything after it must be ignored.
                        break;
                    }
                    (id, ((byte & 0b1111) as usize) + 1)
                }
                HeaderExtensionsProfile::TwoByte => {
                    let id = remaining[0];
                    if id == 0 {
                        extension_start += 1;
                        continue;
                    }
                    if remaining.len() < 2 {
                        event!("video.rtp.invalid.extension_truncated");
                        debug!("RTP extension {id} has no length byte");
                        return None;
                    }
                    (id, remaining[1] as usize)
                }
            };
            let header_len = profile.header_len();
            let Some(value) = remaining.get(header_len..header_len + len) else {
                event!("video.rtp.invalid.extension_truncated");
                debug!("RTP extension {id} truncated; wanted {len} bytes");
                return None;
            };
            match id {
                RTP_EXT_ID_VIDEO_ORIENTATION => {
                    if let Some(&cvo) = value.first() {
                        self.video_rotation = Some(VideoRotation::from(cvo));
                    }
                }
                RTP_EXT_ID_DEPENDENCY_DESCRIPTOR => {
                    self.dependency_descriptor = Some(value.to_vec());
                }
                RTP_EXT_ID_GENERIC_FRAME_DESCRIPTOR => {
                    self.generic_frame_descriptor = Some(value.to_vec());
                }
                RTP_EXT_ID_ABSOLUTE_CAPTURE_TIME => {
                    self.absolute_capture_time = AbsoluteCaptureTime::parse(value);
                }
                RTP_EXT_ID_CONTENT_TYPE => {
                    if let Some(&content_type) = value.first() {
                        self.content_type = Some(VideoContentType::from(content_type));
                    }
                }
                RTP_EXT_ID_PLAYOUT_DELAY => {
                    self.playout_delay = PlayoutDelay::parse(value);
                }
                RTP_EXT_ID_COLOR_SPACE => {
                    self.color_space = ColorSpace::parse(value);
                }
                RTP_EXT_ID_CORRUPTION_DETECTION => {
                    self.corruption_detection = Some(value.to_vec());
                }
                _ => {}
            }
            extension_start += header_len + len;
        }
        Some(())
    }

    pub fn is_padding_only(&self) -> bool {
        self.payload.is_empty()
    }
}

/// What arrived with each packet, retained until its frame is decoded so the
/// embedder can estimate capture times.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RtpPacketInfo {
    pub ssrc: Ssrc,
    pub csrcs: Vec<Ssrc>,
    pub rtp_timestamp: TruncatedTimestamp,
    pub receive_time: Instant,
    pub absolute_capture_time: Option<AbsoluteCaptureTime>,
}

impl RtpPacketInfo {
    pub fn new(packet: &RtpPacket, receive_time: Instant) -> Self {
        Self {
            ssrc: packet.ssrc,
            csrcs: packet.csrcs.clone(),
            rtp_timestamp: packet.timestamp,
            receive_time,
            absolute_capture_time: packet.absolute_capture_time,
        }
    }
}

#[derive(Default)]
pub struct PacketInfoTable {
    info_by_seqnum: BTreeMap<FullSequenceNumber, RtpPacketInfo>,
}

impl PacketInfoTable {
    pub fn insert(&mut self, seqnum: FullSequenceNumber, info: RtpPacketInfo) {
        self.info_by_seqnum.insert(seqnum, info);
    }

    pub fn get(&self, seqnum: FullSequenceNumber) -> Option<&RtpPacketInfo> {
        self.info_by_seqnum.get(&seqnum)
    }

    pub fn collect_range(
        &self,
        first_seqnum: FullSequenceNumber,
        last_seqnum: FullSequenceNumber,
    ) -> Vec<RtpPacketInfo> {
        self.info_by_seqnum
            .range(first_seqnum..=last_seqnum)
            .map(|(_, info)| info.clone())
            .collect()
    }

    /// Forgets everything up to and including the given sequence number.
    pub fn erase_up_through(&mut self, seqnum: FullSequenceNumber) {
        self.info_by_seqnum = self
            .info_by_seqnum
            .split_off(&(seqnum.saturating_add(1)));
    }

    pub fn len(&self) -> usize {
        self.info_by_seqnum.len()
    }

    pub fn is_empty(&self) -> bool {
        self.info_by_seqnum.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_one_byte_extension(extensions: &mut Vec<u8>, id: u8, value: &[u8]) {
        assert!((1..=16).contains(&value.len()));
        extensions.push((id << 4) | ((value.len() - 1) as u8));
        extensions.extend_from_slice(value);
    }

    fn packet_with_extensions(extensions: &[u8], payload: &[u8]) -> Vec<u8> {
        let mut padded = extensions.to_vec();
        while padded.len() % 4 != 0 {
            padded.push(0);
        }
        let mut packet = vec![
            0b10_0_1_0000, // v=2, extensions
            0b0_1101100,   // no marker, pt = 108
            0x12,
            0x34, // seqnum
            0x00,
            0x00,
            0x30,
            0x39, // timestamp
            0x00,
            0xBE,
            0xEF,
            0x00, // ssrc
        ];
        packet.extend_from_slice(&0xBEDEu16.to_be_bytes());
        packet.extend_from_slice(&((padded.len() / 4) as u16).to_be_bytes());
        packet.extend_from_slice(&padded);
        packet.extend_from_slice(payload);
        packet
    }

    #[test]
    fn parse_minimal_packet() {
        let packet = [
            0b10_0_0_0000,
            0b1_1101100,
            0x12,
            0x34,
            0x00,
            0x00,
            0x30,
            0x39,
            0x00,
            0xBE,
            0xEF,
            0x00,
            0xAA,
            0xBB,
        ];
        let parsed = RtpPacket::parse(&packet).unwrap();
        assert_eq!(108, parsed.payload_type);
        assert_eq!(0x1234, parsed.seqnum);
        assert_eq!(0x3039, parsed.timestamp);
        assert_eq!(0xBEEF00, parsed.ssrc);
        assert!(parsed.marker);
        assert_eq!(&[0xAA, 0xBB], &parsed.payload[..]);
        assert!(parsed.csrcs.is_empty());
        assert!(!parsed.is_padding_only());
    }

    #[test]
    fn parse_packet_with_padding_and_csrcs() {
        use hex_literal::hex;

        // v=2, padded, two csrcs, pt 96, then two payload bytes, two
        // padding bytes (the last one holds the padding length).
        let packet = hex!(
            "a2 60 0102 03040506 0708090a"
            "00000011 00000022"
            "aabb 0002"
        );
        let parsed = RtpPacket::parse(&packet).unwrap();
        assert_eq!(96, parsed.payload_type);
        assert_eq!(vec![0x11, 0x22], parsed.csrcs);
        assert_eq!(&[0xAA, 0xBB], &parsed.payload[..]);
        assert_eq!(20, parsed.header_len);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert_eq!(None, RtpPacket::parse(&[]));
        assert_eq!(None, RtpPacket::parse(&[0x80; 11]));
        // Version 1
        let mut packet = [0u8; 14];
        packet[0] = 0b01_0_0_0000;
        assert_eq!(None, RtpPacket::parse(&packet));
    }

    #[test]
    fn parse_csrcs() {
        let mut packet = vec![
            0b10_0_0_0010, // 2 CSRCs
            0b0_1101100,
            0x12,
            0x34,
            0x00,
            0x00,
            0x30,
            0x39,
            0x00,
            0xBE,
            0xEF,
            0x00,
        ];
        packet.extend_from_slice(&1001u32.to_be_bytes());
        packet.extend_from_slice(&1002u32.to_be_bytes());
        packet.push(0xFF);
        let parsed = RtpPacket::parse(&packet).unwrap();
        assert_eq!(vec![1001, 1002], parsed.csrcs);
        assert_eq!(&[0xFF], &parsed.payload[..]);

        // Truncated CSRC list
        assert_eq!(None, RtpPacket::parse(&packet[..14]));
    }

    #[test]
    fn parse_one_byte_extensions() {
        let mut extensions = vec![];
        push_one_byte_extension(&mut extensions, RTP_EXT_ID_VIDEO_ORIENTATION, &[2]);
        push_one_byte_extension(
            &mut extensions,
            RTP_EXT_ID_DEPENDENCY_DESCRIPTOR,
            &[0x80, 0x01, 0x02],
        );
        push_one_byte_extension(&mut extensions, RTP_EXT_ID_CONTENT_TYPE, &[1]);
        let packet = packet_with_extensions(&extensions, &[0xAA]);

        let parsed = RtpPacket::parse(&packet).unwrap();
        assert_eq!(Some(VideoRotation::Clockwise180), parsed.video_rotation);
        assert_eq!(
            Some(vec![0x80, 0x01, 0x02]),
            parsed.dependency_descriptor
        );
        assert_eq!(Some(VideoContentType::Screenshare), parsed.content_type);
        assert_eq!(&[0xAA], &parsed.payload[..]);
    }

    #[test]
    fn parse_playout_delay_and_capture_time() {
        let mut extensions = vec![];
        // min = 0x00A * 10ms, max = 0x3E8 * 10ms
        push_one_byte_extension(
            &mut extensions,
            RTP_EXT_ID_PLAYOUT_DELAY,
            &[0x00, 0xA3, 0xE8],
        );
        push_one_byte_extension(
            &mut extensions,
            RTP_EXT_ID_ABSOLUTE_CAPTURE_TIME,
            &[0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x02],
        );
        let packet = packet_with_extensions(&extensions, &[0xAA]);

        let parsed = RtpPacket::parse(&packet).unwrap();
        let playout_delay = parsed.playout_delay.unwrap();
        assert_eq!(Duration::from_millis(100), playout_delay.min);
        assert_eq!(Duration::from_millis(10_000), playout_delay.max);
        let capture_time = parsed.absolute_capture_time.unwrap();
        assert_eq!(0x1_0000_0002, capture_time.ntp_timestamp);
        assert_eq!(None, capture_time.estimated_capture_clock_offset);
    }

    #[test]
    fn parse_two_byte_extensions() {
        let value = [0x11u8; 17]; // too long for the one-byte profile
        let mut extensions = vec![RTP_EXT_ID_GENERIC_FRAME_DESCRIPTOR, value.len() as u8];
        extensions.extend_from_slice(&value);
        while extensions.len() % 4 != 0 {
            extensions.push(0);
        }
        let mut packet = vec![
            0b10_0_1_0000,
            0b0_1101100,
            0x12,
            0x34,
            0x00,
            0x00,
            0x30,
            0x39,
            0x00,
            0xBE,
            0xEF,
            0x00,
        ];
        packet.extend_from_slice(&RTP_TWO_BYTE_EXTENSIONS_PROFILE.to_be_bytes());
        packet.extend_from_slice(&((extensions.len() / 4) as u16).to_be_bytes());
        packet.extend_from_slice(&extensions);
        packet.push(0xAB);

        let parsed = RtpPacket::parse(&packet).unwrap();
        assert_eq!(Some(value.to_vec()), parsed.generic_frame_descriptor);
        assert_eq!(&[0xAB], &parsed.payload[..]);
    }

    #[test]
    fn parse_strips_padding() {
        let packet = [
            0b10_1_0_0000, // padding flag
            0b0_1101100,
            0x12,
            0x34,
            0x00,
            0x00,
            0x30,
            0x39,
            0x00,
            0xBE,
            0xEF,
            0x00,
            0xAA, // payload
            0x00,
            0x00,
            0x03, // 3 bytes of padding
        ];
        let parsed = RtpPacket::parse(&packet).unwrap();
        assert_eq!(&[0xAA], &parsed.payload[..]);

        let padding_only = [
            0b10_1_0_0000,
            0b0_1101100,
            0x12,
            0x34,
            0x00,
            0x00,
            0x30,
            0x39,
            0x00,
            0xBE,
            0xEF,
            0x00,
            0x00,
            0x02,
        ];
        let parsed = RtpPacket::parse(&padding_only).unwrap();
        assert!(parsed.is_padding_only());

        let bad_padding = [
            0b10_1_0_0000,
            0b0_1101100,
            0x12,
            0x34,
            0x00,
            0x00,
            0x30,
            0x39,
            0x00,
            0xBE,
            0xEF,
            0x00,
            0x09, // longer than what's left
        ];
        assert_eq!(None, RtpPacket::parse(&bad_padding));
    }

    #[test]
    fn expansion() {
        let mut max = 0;
        assert_eq!(65535, expand_seqnum(65535, &mut max));
        assert_eq!(65536, expand_seqnum(0, &mut max));
        assert_eq!(65535, expand_seqnum(65535, &mut max));

        let mut max = 0xFFFF_FFF0;
        assert_eq!(0x1_0000_0005, expand_timestamp(5, &mut max));

        let mut max = 65535;
        assert_eq!(65636, expand_frame_number(100, &mut max));
    }

    #[test]
    fn packet_info_table() {
        let mut table = PacketInfoTable::default();
        let now = Instant::now();
        for seqnum in 10u64..20 {
            table.insert(
                seqnum,
                RtpPacketInfo {
                    ssrc: 1,
                    csrcs: vec![],
                    rtp_timestamp: seqnum as u32,
                    receive_time: now,
                    absolute_capture_time: None,
                },
            );
        }
        assert_eq!(10, table.len());
        assert_eq!(3, table.collect_range(15, 17).len());

        table.erase_up_through(14);
        assert_eq!(5, table.len());
        assert_eq!(None, table.get(14));
        assert!(table.get(15).is_some());
    }
}
