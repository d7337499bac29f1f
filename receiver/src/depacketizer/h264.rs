//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! RFC 6184 H.264 depacketization: single NAL units, STAP-A aggregates,
//! and FU-A fragments, rewritten into Annex-B bitstream with start codes.
//! [`SpsPpsTracker`] keeps parameter sets seen in-band or supplied
//! out-of-band and prepends them to IDR slices that omit them.

use std::collections::HashMap;

use log::*;
use video_common::parse_u16;

use crate::depacketizer::DepacketizedPayload;
use crate::frame::{VideoFrameType, VideoHeader};

pub const NALU_TYPE_SLICE: u8 = 1;
pub const NALU_TYPE_IDR: u8 = 5;
pub const NALU_TYPE_SEI: u8 = 6;
pub const NALU_TYPE_SPS: u8 = 7;
pub const NALU_TYPE_PPS: u8 = 8;
pub const NALU_TYPE_AUD: u8 = 9;
pub const NALU_TYPE_END_OF_SEQUENCE: u8 = 10;
pub const NALU_TYPE_END_OF_STREAM: u8 = 11;
pub const NALU_TYPE_FILLER: u8 = 12;
pub const NALU_TYPE_STAP_A: u8 = 24;
pub const NALU_TYPE_FU_A: u8 = 28;

const NALU_TYPE_MASK: u8 = 0x1F;
/// F bit plus the two NRI bits.
const NALU_FNRI_MASK: u8 = 0xE0;
const FU_S_BIT: u8 = 0x80;

const NAL_HEADER_LEN: usize = 1;
const FU_A_HEADER_LEN: usize = 2;
const LENGTH_FIELD_LEN: usize = 2;
const STAP_A_HEADER_LEN: usize = NAL_HEADER_LEN + LENGTH_FIELD_LEN;

/// More NAL units in one packet than this and the ids of the extras are
/// not tracked.
pub const MAX_NALUS_PER_PACKET: usize = 10;

const START_CODE: [u8; 4] = [0, 0, 0, 1];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum H264Packetization {
    SingleNalu,
    StapA,
    FuA,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NaluInfo {
    pub nalu_type: u8,
    pub sps_id: Option<u32>,
    pub pps_id: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct H264PacketInfo {
    pub packetization: H264Packetization,
    pub nalus: Vec<NaluInfo>,
}

pub fn parse_h264(payload: &[u8]) -> Option<DepacketizedPayload> {
    let Some(&first_byte) = payload.first() else {
        debug!("empty H.264 payload");
        return None;
    };
    if first_byte & NALU_TYPE_MASK == NALU_TYPE_FU_A {
        parse_fu_a(payload)
    } else {
        parse_stap_a_or_single(payload)
    }
}

fn parse_fu_a(payload: &[u8]) -> Option<DepacketizedPayload> {
    if payload.len() < FU_A_HEADER_LEN {
        debug!("FU-A payload truncated");
        return None;
    }
    let fnri = payload[0] & NALU_FNRI_MASK;
    let original_nal_type = payload[1] & NALU_TYPE_MASK;
    let first_fragment = payload[1] & FU_S_BIT != 0;

    let mut nalus = vec![];
    let video_payload = if first_fragment {
        let pps_id = parse_pps_id_from_slice(&payload[FU_A_HEADER_LEN..]);
        if pps_id.is_none() {
            warn!(
                "failed to parse PPS id from the first fragment of a FU-A NAL unit of type {original_nal_type}"
            );
        }
        nalus.push(NaluInfo {
            nalu_type: original_nal_type,
            sps_id: None,
            pps_id,
        });
        // Drop the FU indicator and rebuild the original NAL header in
        // place of the FU header.
        let mut fixed = payload[NAL_HEADER_LEN..].to_vec();
        fixed[0] = fnri | original_nal_type;
        fixed
    } else {
        payload[FU_A_HEADER_LEN..].to_vec()
    };

    Some(DepacketizedPayload {
        header: VideoHeader {
            frame_type: if original_nal_type == NALU_TYPE_IDR {
                VideoFrameType::Key
            } else {
                VideoFrameType::Delta
            },
            is_first_packet_in_frame: first_fragment,
            ..Default::default()
        },
        h264: Some(H264PacketInfo {
            packetization: H264Packetization::FuA,
            nalus,
        }),
        payload: video_payload,
    })
}

fn parse_stap_a_or_single(payload: &[u8]) -> Option<DepacketizedPayload> {
    let mut start_offsets;
    let packetization;
    if payload[0] & NALU_TYPE_MASK == NALU_TYPE_STAP_A {
        if payload.len() <= STAP_A_HEADER_LEN {
            debug!("STAP-A payload too small");
            return None;
        }
        start_offsets = parse_stap_a_start_offsets(payload)?;
        packetization = H264Packetization::StapA;
    } else {
        start_offsets = vec![0];
        packetization = H264Packetization::SingleNalu;
    }
    // A sentinel so every real offset has a successor to compute its end.
    start_offsets.push(payload.len() + LENGTH_FIELD_LEN);

    let mut frame_type = VideoFrameType::Delta;
    let mut nalus = vec![];
    for window in start_offsets.windows(2) {
        let start_offset = window[0];
        let end_offset = window[1] - LENGTH_FIELD_LEN;
        if end_offset - start_offset < NAL_HEADER_LEN {
            debug!("STAP-A segment too small to hold a NAL header");
            return None;
        }
        let mut nalu = NaluInfo {
            nalu_type: payload[start_offset] & NALU_TYPE_MASK,
            ..Default::default()
        };
        let rbsp = &payload[start_offset + NAL_HEADER_LEN..end_offset];
        match nalu.nalu_type {
            NALU_TYPE_SPS => {
                nalu.sps_id = parse_sps_id(rbsp);
                if nalu.sps_id.is_none() {
                    warn!("failed to parse the id of an SPS NAL unit");
                }
                frame_type = VideoFrameType::Key;
            }
            NALU_TYPE_PPS => {
                if let Some((pps_id, sps_id)) = parse_pps_ids(rbsp) {
                    nalu.pps_id = Some(pps_id);
                    nalu.sps_id = Some(sps_id);
                } else {
                    warn!("failed to parse the ids of a PPS NAL unit");
                }
            }
            NALU_TYPE_IDR | NALU_TYPE_SLICE => {
                if nalu.nalu_type == NALU_TYPE_IDR {
                    frame_type = VideoFrameType::Key;
                }
                nalu.pps_id = parse_pps_id_from_slice(rbsp);
                if nalu.pps_id.is_none() {
                    warn!(
                        "failed to parse a PPS id from a slice of type {}",
                        nalu.nalu_type
                    );
                }
            }
            NALU_TYPE_AUD
            | NALU_TYPE_END_OF_SEQUENCE
            | NALU_TYPE_END_OF_STREAM
            | NALU_TYPE_FILLER
            | NALU_TYPE_SEI => {}
            NALU_TYPE_STAP_A | NALU_TYPE_FU_A => {
                debug!("aggregate packet nested inside a STAP-A packet");
                return None;
            }
            _ => {}
        }
        if nalus.len() == MAX_NALUS_PER_PACKET {
            warn!("out of space for NAL unit infos; the rest are not tracked");
        } else {
            nalus.push(nalu);
        }
    }

    Some(DepacketizedPayload {
        header: VideoHeader {
            frame_type,
            is_first_packet_in_frame: true,
            ..Default::default()
        },
        h264: Some(H264PacketInfo {
            packetization,
            nalus,
        }),
        // STAP-A payloads keep their length fields; the tracker converts
        // them to start codes once the parameter sets are resolved.
        payload: payload.to_vec(),
    })
}

/// Absolute offsets of each aggregated NAL header within a STAP-A payload.
fn parse_stap_a_start_offsets(payload: &[u8]) -> Option<Vec<usize>> {
    let mut offsets = vec![];
    let mut offset = 0;
    let mut rest = &payload[NAL_HEADER_LEN..];
    while !rest.is_empty() {
        if rest.len() < LENGTH_FIELD_LEN {
            debug!("STAP-A packet truncated in a length field");
            return None;
        }
        let nalu_size = parse_u16(&rest[..LENGTH_FIELD_LEN]) as usize;
        rest = &rest[LENGTH_FIELD_LEN..];
        if nalu_size > rest.len() {
            debug!("STAP-A packet truncated in a NAL unit");
            return None;
        }
        rest = &rest[nalu_size..];
        offsets.push(offset + STAP_A_HEADER_LEN);
        offset += LENGTH_FIELD_LEN + nalu_size;
    }
    Some(offsets)
}

/// MSB-first bit reader for exp-Golomb coded header fields.
struct BitReader<'a> {
    bytes: &'a [u8],
    bit_index: usize,
}

impl<'a> BitReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            bit_index: 0,
        }
    }

    fn read_bit(&mut self) -> Option<u32> {
        let byte = *self.bytes.get(self.bit_index / 8)?;
        let bit = (byte >> (7 - (self.bit_index % 8))) & 1;
        self.bit_index += 1;
        Some(bit as u32)
    }

    /// Reads one unsigned exp-Golomb value (`ue(v)` in the H.264 spec).
    fn read_ue(&mut self) -> Option<u32> {
        let mut zeros = 0;
        while self.read_bit()? == 0 {
            zeros += 1;
            if zeros > 31 {
                return None;
            }
        }
        let mut suffix = 0;
        for _ in 0..zeros {
            suffix = (suffix << 1) | self.read_bit()?;
        }
        Some((1u32 << zeros) - 1 + suffix)
    }
}

/// Strips emulation prevention bytes (00 00 03 -> 00 00).
fn parse_rbsp(bytes: &[u8]) -> Vec<u8> {
    let mut rbsp = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes.len() - i >= 3 && bytes[i] == 0 && bytes[i + 1] == 0 && bytes[i + 2] == 3 {
            rbsp.push(0);
            rbsp.push(0);
            i += 3;
        } else {
            rbsp.push(bytes[i]);
            i += 1;
        }
    }
    rbsp
}

/// `seq_parameter_set_id` follows the three profile/constraint/level bytes.
fn parse_sps_id(payload: &[u8]) -> Option<u32> {
    let rbsp = parse_rbsp(payload);
    if rbsp.len() < 3 {
        return None;
    }
    BitReader::new(&rbsp[3..]).read_ue()
}

/// The PPS id and the SPS id it references, the first two fields of a PPS.
fn parse_pps_ids(payload: &[u8]) -> Option<(u32, u32)> {
    let rbsp = parse_rbsp(payload);
    let mut reader = BitReader::new(&rbsp);
    let pps_id = reader.read_ue()?;
    let sps_id = reader.read_ue()?;
    Some((pps_id, sps_id))
}

/// The PPS id a slice references: the third field of the slice header.
fn parse_pps_id_from_slice(payload: &[u8]) -> Option<u32> {
    let rbsp = parse_rbsp(payload);
    let mut reader = BitReader::new(&rbsp);
    let _first_mb_in_slice = reader.read_ue()?;
    let _slice_type = reader.read_ue()?;
    reader.read_ue()
}

#[derive(Debug, PartialEq, Eq)]
pub enum FixedBitstream {
    Insert(Vec<u8>),
    Drop,
    RequestKeyframe,
}

#[derive(Default)]
struct PpsInfo {
    sps_id: u32,
    /// Raw PPS bytes when supplied out-of-band; empty when only seen
    /// in-band (the bitstream already carries it then).
    data: Vec<u8>,
}

/// Records SPS/PPS NAL units and fixes up slice bitstreams that depend on
/// them. IDR slices whose parameter sets were never received cannot be
/// decoded and turn into a key frame request instead.
#[derive(Default)]
pub struct SpsPpsTracker {
    sps_data: HashMap<u32, Vec<u8>>,
    pps_data: HashMap<u32, PpsInfo>,
}

struct ParameterSets {
    sps_id: u32,
    sps: Vec<u8>,
    pps_id: u32,
    pps: Vec<u8>,
}

impl SpsPpsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores parameter sets signaled out-of-band (SDP
    /// `sprop-parameter-sets`). These carry their NAL headers.
    pub fn insert_sps_pps_nalus(&mut self, sps: &[u8], pps: &[u8]) {
        if sps.first().map(|byte| byte & NALU_TYPE_MASK) != Some(NALU_TYPE_SPS) {
            warn!("out-of-band SPS is missing its NAL header");
            return;
        }
        if pps.first().map(|byte| byte & NALU_TYPE_MASK) != Some(NALU_TYPE_PPS) {
            warn!("out-of-band PPS is missing its NAL header");
            return;
        }
        let Some(sps_id) = parse_sps_id(&sps[NAL_HEADER_LEN..]) else {
            warn!("failed to parse the out-of-band SPS");
            return;
        };
        let Some((pps_id, pps_sps_id)) = parse_pps_ids(&pps[NAL_HEADER_LEN..]) else {
            warn!("failed to parse the out-of-band PPS");
            return;
        };
        self.sps_data.insert(sps_id, sps.to_vec());
        self.pps_data.insert(
            pps_id,
            PpsInfo {
                sps_id: pps_sps_id,
                data: pps.to_vec(),
            },
        );
        info!("inserted SPS id {sps_id} and PPS id {pps_id} (referencing SPS {pps_sps_id})");
    }

    /// Converts one depacketized payload to Annex-B, recording any
    /// parameter sets it carries and prepending stored ones to IDR slices
    /// that need them.
    pub fn copy_and_fix_bitstream(
        &mut self,
        is_first_packet_in_frame: bool,
        h264: &mut H264PacketInfo,
        payload: &[u8],
    ) -> FixedBitstream {
        let mut prepend: Option<ParameterSets> = None;
        for nalu in &h264.nalus {
            match nalu.nalu_type {
                NALU_TYPE_SPS => {
                    if let Some(sps_id) = nalu.sps_id {
                        // Keep any out-of-band bytes already stored.
                        self.sps_data.entry(sps_id).or_default();
                    }
                }
                NALU_TYPE_PPS => {
                    if let (Some(pps_id), Some(sps_id)) = (nalu.pps_id, nalu.sps_id) {
                        self.pps_data.entry(pps_id).or_default().sps_id = sps_id;
                    }
                }
                NALU_TYPE_IDR if is_first_packet_in_frame => {
                    let Some(pps_id) = nalu.pps_id else {
                        warn!("no PPS id in an IDR NAL unit");
                        return FixedBitstream::RequestKeyframe;
                    };
                    let Some(pps) = self.pps_data.get(&pps_id) else {
                        warn!("no PPS with id {pps_id} received");
                        return FixedBitstream::RequestKeyframe;
                    };
                    let Some(sps) = self.sps_data.get(&pps.sps_id) else {
                        warn!("no SPS with id {} received", pps.sps_id);
                        return FixedBitstream::RequestKeyframe;
                    };
                    // Only parameter sets stored with their bytes (supplied
                    // out-of-band) can be prepended; in-band ones are
                    // already part of the bitstream.
                    if !sps.is_empty() && !pps.data.is_empty() {
                        prepend = Some(ParameterSets {
                            sps_id: pps.sps_id,
                            sps: sps.clone(),
                            pps_id,
                            pps: pps.data.clone(),
                        });
                    }
                }
                _ => {}
            }
        }

        let segments = if h264.packetization == H264Packetization::StapA {
            match stap_a_segments(payload) {
                Some(segments) => segments,
                None => {
                    warn!("STAP-A packet truncated");
                    return FixedBitstream::Drop;
                }
            }
        } else {
            vec![]
        };

        let mut bitstream = vec![];
        if let Some(sets) = &prepend {
            bitstream.extend_from_slice(&START_CODE);
            bitstream.extend_from_slice(&sets.sps);
            bitstream.extend_from_slice(&START_CODE);
            bitstream.extend_from_slice(&sets.pps);
            if h264.nalus.len() + 2 <= MAX_NALUS_PER_PACKET {
                h264.nalus.push(NaluInfo {
                    nalu_type: NALU_TYPE_SPS,
                    sps_id: Some(sets.sps_id),
                    pps_id: None,
                });
                h264.nalus.push(NaluInfo {
                    nalu_type: NALU_TYPE_PPS,
                    sps_id: Some(sets.sps_id),
                    pps_id: Some(sets.pps_id),
                });
            } else {
                warn!("out of space for the prepended SPS/PPS NAL unit infos");
            }
        }

        if h264.packetization == H264Packetization::StapA {
            for segment in segments {
                bitstream.extend_from_slice(&START_CODE);
                bitstream.extend_from_slice(&payload[segment]);
            }
        } else {
            if is_first_packet_in_frame {
                bitstream.extend_from_slice(&START_CODE);
            }
            bitstream.extend_from_slice(payload);
        }
        FixedBitstream::Insert(bitstream)
    }
}

fn stap_a_segments(payload: &[u8]) -> Option<Vec<std::ops::Range<usize>>> {
    let mut segments = vec![];
    let mut index = NAL_HEADER_LEN;
    while index + LENGTH_FIELD_LEN <= payload.len() {
        let segment_length = parse_u16(&payload[index..index + LENGTH_FIELD_LEN]) as usize;
        index += LENGTH_FIELD_LEN;
        if index + segment_length > payload.len() {
            return None;
        }
        segments.push(index..index + segment_length);
        index += segment_length;
    }
    Some(segments)
}
