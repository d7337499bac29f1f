//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! The header extensions that place each frame in the dependency graph.
//! Two mutually exclusive encodings: the AV1 Dependency Descriptor and the
//! older generic frame descriptor. [`DependencyParser`] keeps the
//! cross-packet state (current template structure, frame number expansion)
//! and folds either encoding into the packet's video header.

use anyhow::{anyhow, bail, Result};
use log::*;
use metrics::event;
use thiserror::Error;
use video_common::{parse_u16, PixelSize};

use crate::frame::{DecodeTargetIndication, GenericFrameInfo, VideoFrameType, VideoHeader};
use crate::rtp::{expand_frame_number, FullFrameNumber, RtpPacket, TruncatedFrameNumber};

/// One entry of a dependency structure's template table: the layer position
/// and dependency shape frames referencing this template inherit.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameDependencyTemplate {
    pub spatial_index: u8,
    pub temporal_index: u8,
    pub decode_target_indications: Vec<DecodeTargetIndication>,
    pub frame_diffs: Vec<u16>,
    pub chain_diffs: Vec<u8>,
}

/// The decode-target/chain template table attached to a key frame's
/// descriptor. Delta descriptors only carry a template id and resolve
/// against the structure of the latest key frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DependencyStructure {
    /// Template id of the first entry; ids wrap modulo 64.
    pub structure_id: u8,
    pub decode_target_count: u8,
    pub num_chains: u8,
    pub decode_target_protected_by_chain: Vec<u8>,
    pub templates: Vec<FrameDependencyTemplate>,
    /// Render resolution per spatial layer; empty when not signaled.
    pub resolutions: Vec<PixelSize>,
}

/// https://aomediacodec.github.io/av1-rtp-spec/#dependency-descriptor-rtp-header-extension
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DependencyDescriptor {
    pub first_packet_in_frame: bool,
    pub last_packet_in_frame: bool,
    pub frame_number: TruncatedFrameNumber,
    pub attached_structure: Option<DependencyStructure>,
    pub active_decode_targets_bitmask: Option<u32>,
    /// The frame's resolved dependency info: template values with any
    /// per-frame customizations applied.
    pub frame_dependencies: FrameDependencyTemplate,
    pub resolution: Option<PixelSize>,
}

#[derive(Debug, Error)]
pub enum DescriptorReadError {
    /// The extended fields cannot be decoded without the structure from a
    /// key frame we have not seen (yet).
    #[error("no dependency structure to resolve against")]
    MissingStructure,
    #[error("{0}")]
    Malformed(#[from] anyhow::Error),
}

struct MandatoryFields {
    first_packet_in_frame: bool,
    last_packet_in_frame: bool,
    template_id: u8,
    frame_number: TruncatedFrameNumber,
}

/// Parser for DependencyDescriptor
#[derive(Debug)]
struct DependencyDescriptorReader<'a> {
    bytes: &'a [u8],
    /// The index into `bytes` of the next byte to read.
    byte_index: usize,
    /// The offset into `bytes[byte_index]` of the next bit to read. In the range 0..=7.
    bit_offset: u8,
}

impl<'a> DependencyDescriptorReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            byte_index: 0,
            bit_offset: 0,
        }
    }

    /// An implementation of the pseudocode from the following section of the spec:
    /// https://aomediacodec.github.io/av1-rtp-spec/#a82-syntax
    ///
    /// The meaning of each parsed field is here:
    /// https://aomediacodec.github.io/av1-rtp-spec/#a83-semantics
    fn read(
        mut self,
        stored_structure: Option<&DependencyStructure>,
    ) -> Result<DependencyDescriptor, DescriptorReadError> {
        let mandatory = self.read_mandatory()?;

        let mut attached_structure = None;
        let mut active_decode_targets_bitmask = None;
        let mut custom_dtis = false;
        let mut custom_fdiffs = false;
        let mut custom_chains = false;
        if self.bytes.len() > 3 {
            let template_structure_present = self.read_u8(1)? == 1;
            let active_decode_targets_present = self.read_u8(1)? == 1;
            custom_dtis = self.read_u8(1)? == 1;
            custom_fdiffs = self.read_u8(1)? == 1;
            custom_chains = self.read_u8(1)? == 1;

            if template_structure_present {
                attached_structure = Some(self.read_template_dependency_structure()?);
            }
            if active_decode_targets_present {
                let decode_target_count = attached_structure
                    .as_ref()
                    .or(stored_structure)
                    .ok_or(DescriptorReadError::MissingStructure)?
                    .decode_target_count;
                active_decode_targets_bitmask = Some(self.read_bits(decode_target_count)?);
            }
        }

        // frame_dependency_definition
        let structure = attached_structure
            .as_ref()
            .or(stored_structure)
            .ok_or(DescriptorReadError::MissingStructure)?;
        let template_index =
            (mandatory.template_id as usize + 64 - structure.structure_id as usize) % 64;
        let template = structure
            .templates
            .get(template_index)
            .cloned()
            .ok_or_else(|| {
                anyhow!(
                    "template index {template_index} out of range ({} templates)",
                    structure.templates.len()
                )
            })?;
        let decode_target_count = structure.decode_target_count;
        let num_chains = structure.num_chains;

        let mut frame_dependencies = template;
        if custom_dtis {
            let mut dtis = Vec::with_capacity(decode_target_count as usize);
            for _ in 0..decode_target_count {
                dtis.push(DecodeTargetIndication::from_bits(self.read_u8(2)?));
            }
            frame_dependencies.decode_target_indications = dtis;
        }
        if custom_fdiffs {
            let mut frame_diffs = vec![];
            loop {
                let next_fdiff_size = self.read_u8(2)?;
                if next_fdiff_size == 0 {
                    break;
                }
                let fdiff_minus_one = self.read_bits(4 * next_fdiff_size)?;
                frame_diffs.push(fdiff_minus_one as u16 + 1);
            }
            frame_dependencies.frame_diffs = frame_diffs;
        }
        if custom_chains {
            let mut chain_diffs = Vec::with_capacity(num_chains as usize);
            for _ in 0..num_chains {
                chain_diffs.push(self.read_u8(8)?);
            }
            frame_dependencies.chain_diffs = chain_diffs;
        }

        let resolution = structure
            .resolutions
            .get(frame_dependencies.spatial_index as usize)
            .copied();

        Ok(DependencyDescriptor {
            first_packet_in_frame: mandatory.first_packet_in_frame,
            last_packet_in_frame: mandatory.last_packet_in_frame,
            frame_number: mandatory.frame_number,
            attached_structure,
            active_decode_targets_bitmask,
            frame_dependencies,
            resolution,
        })
    }

    fn read_mandatory(&mut self) -> Result<MandatoryFields> {
        let first_packet_in_frame = self.read_u8(1)? == 1;
        let last_packet_in_frame = self.read_u8(1)? == 1;
        let template_id = self.read_u8(6)?;
        let frame_number = self.read_u16()?;
        Ok(MandatoryFields {
            first_packet_in_frame,
            last_packet_in_frame,
            template_id,
            frame_number,
        })
    }

    fn read_template_dependency_structure(&mut self) -> Result<DependencyStructure> {
        let structure_id = self.read_u8(6)?;
        let decode_target_count = self.read_u8(5)? + 1;

        // template_layers
        let mut templates: Vec<FrameDependencyTemplate> = vec![];
        let mut spatial_index = 0u8;
        let mut temporal_index = 0u8;
        let mut max_spatial_index = 0u8;
        loop {
            templates.push(FrameDependencyTemplate {
                spatial_index,
                temporal_index,
                ..Default::default()
            });
            // Template ids live in a 6-bit space.
            if templates.len() > 64 {
                bail!("too many templates");
            }
            match self.read_u8(2)? {
                0 => {}
                1 => temporal_index += 1,
                2 => {
                    temporal_index = 0;
                    spatial_index += 1;
                    max_spatial_index = spatial_index;
                }
                _ => break,
            }
        }

        // template_dtis
        for template in &mut templates {
            for _ in 0..decode_target_count {
                template
                    .decode_target_indications
                    .push(DecodeTargetIndication::from_bits(self.read_u8(2)?));
            }
        }

        // template_fdiffs
        for template in &mut templates {
            while self.read_u8(1)? == 1 {
                let fdiff_minus_one = self.read_u8(4)?;
                template.frame_diffs.push(fdiff_minus_one as u16 + 1);
            }
        }

        // template_chains
        let num_chains = self.read_non_symmetric(decode_target_count as u32 + 1)? as u8;
        let mut decode_target_protected_by_chain = vec![];
        if num_chains > 0 {
            for _ in 0..decode_target_count {
                decode_target_protected_by_chain
                    .push(self.read_non_symmetric(num_chains as u32)? as u8);
            }
            for template in &mut templates {
                for _ in 0..num_chains {
                    template.chain_diffs.push(self.read_u8(4)?);
                }
            }
        }

        // render_resolutions
        let mut resolutions = vec![];
        let resolutions_present_flag = self.read_u8(1)?;
        if resolutions_present_flag == 1 {
            for _ in 0..=max_spatial_index {
                let width = self.read_u16()?.saturating_add(1);
                let height = self.read_u16()?.saturating_add(1);
                resolutions.push(PixelSize { width, height });
            }
        }

        Ok(DependencyStructure {
            structure_id,
            decode_target_count,
            num_chains,
            decode_target_protected_by_chain,
            templates,
            resolutions,
        })
    }

    /// An implementation of the `f(n)` function in the spec, where 0 < n <= 8:
    /// https://aomediacodec.github.io/av1-rtp-spec/#a82-syntax
    fn read_u8(&mut self, bits: u8) -> Result<u8> {
        assert!(bits > 0 && bits <= 8);

        let last_byte = self.bytes.len().saturating_sub(1);
        if self.bytes.is_empty()
            || self.byte_index > last_byte
            || (self.byte_index == last_byte && self.bit_offset + bits > 8)
        {
            bail!(
                "out of bounds access: byte_index={}, bit_offset={}, bits={bits}, bytes_len={}",
                self.byte_index,
                self.bit_offset,
                self.bytes.len(),
            );
        }

        let mut byte: u8;
        if self.bit_offset + bits >= 8 {
            // Need to read the remainder of the current byte, and potentially some of the
            // following byte.
            byte = self.bytes[self.byte_index];

            let num_bits_in_current_byte = 8 - self.bit_offset;
            if num_bits_in_current_byte < 8 {
                byte &= (1 << num_bits_in_current_byte) - 1;
            }
            let num_bits_in_next_byte = bits - num_bits_in_current_byte;
            byte <<= num_bits_in_next_byte;

            if num_bits_in_next_byte > 0 {
                let next_byte = self.bytes[self.byte_index + 1];
                let mask = ((1 << num_bits_in_next_byte) - 1) << (8 - num_bits_in_next_byte);
                byte |= (next_byte & mask) >> (8 - num_bits_in_next_byte);
            }

            self.byte_index += 1;
            self.bit_offset = (self.bit_offset + bits) % 8;
        } else {
            // Only need to look at the current byte.
            byte = self.bytes[self.byte_index];
            byte &= ((1 << bits) - 1) << (8 - self.bit_offset - bits);
            byte >>= 8 - self.bit_offset - bits;

            self.bit_offset += bits;
        }

        Ok(byte)
    }

    /// A special case of the `f(n)` function where n = 16:
    /// https://aomediacodec.github.io/av1-rtp-spec/#a82-syntax
    fn read_u16(&mut self) -> Result<u16> {
        match (self.read_u8(8), self.read_u8(8)) {
            (Ok(upper), Ok(lower)) => Ok(u16::from_be_bytes([upper, lower])),
            (Err(err), _) => Err(err),
            (_, Err(err)) => Err(err),
        }
    }

    /// The `f(n)` function for 0 < n <= 32, assembled a byte at a time.
    fn read_bits(&mut self, bits: u8) -> Result<u32> {
        assert!(bits > 0 && bits <= 32);

        let mut remaining = bits;
        let mut value: u32 = 0;
        while remaining > 0 {
            let chunk = remaining.min(8);
            value = (value << chunk) | (self.read_u8(chunk)? as u32);
            remaining -= chunk;
        }
        Ok(value)
    }

    /// An implementation of the `ns(n)` function in the spec:
    /// https://aomediacodec.github.io/av1-rtp-spec/#a82-syntax
    fn read_non_symmetric(&mut self, n: u32) -> Result<u32> {
        let mut w = 0u8;
        let mut x = n;
        while x != 0 {
            x >>= 1;
            w += 1;
        }
        if w < 2 {
            // Zero or one possible value; no bits on the wire.
            return Ok(0);
        }

        let m = (1 << w) - n;
        let v = self.read_bits(w - 1)?;
        if v < m {
            return Ok(v);
        }

        let extra_bit = self.read_bits(1)?;
        Ok((v << 1) - m + extra_bit)
    }
}

/// The legacy generic frame descriptor:
///
/// ```text
///  byte 0: F L D x T T T x   F = first packet in frame, L = last packet
///                            in frame, D = discardable, x(bit 3) = frame
///                            diffs follow, T = temporal layer
///  byte 1: spatial layer bitmask
/// first packets only:
///  bytes 2-3: frame number, little endian
///  frame diff bytes while bit 3 of byte 0 was set:
///          D D D D D D X M   D = low six bits of the diff, X = one more
///                            diff byte holds bits 6..14, M = another diff
///                            follows
///  trailing 4 bytes, if present: width and height, big endian
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GenericFrameDescriptor {
    pub first_packet_in_frame: bool,
    pub last_packet_in_frame: bool,
    pub discardable: bool,
    pub temporal_index: u8,
    pub spatial_bitmask: u8,
    pub frame_number: Option<TruncatedFrameNumber>,
    pub frame_diffs: Vec<u16>,
    pub resolution: Option<PixelSize>,
}

pub fn parse_generic_frame_descriptor(bytes: &[u8]) -> Result<GenericFrameDescriptor> {
    if bytes.len() < 2 {
        bail!("generic frame descriptor too short: {} bytes", bytes.len());
    }
    let mut descriptor = GenericFrameDescriptor {
        first_packet_in_frame: bytes[0] & 0x80 != 0,
        last_packet_in_frame: bytes[0] & 0x40 != 0,
        discardable: bytes[0] & 0x20 != 0,
        temporal_index: bytes[0] & 0x07,
        spatial_bitmask: bytes[1],
        ..Default::default()
    };
    if !descriptor.first_packet_in_frame {
        return Ok(descriptor);
    }
    if bytes.len() < 4 {
        bail!("generic frame descriptor too short for a frame number");
    }
    descriptor.frame_number = Some(u16::from_le_bytes([bytes[2], bytes[3]]));

    let mut rest = &bytes[4..];
    if bytes[0] & 0x08 != 0 {
        loop {
            let Some((&diff_byte, tail)) = rest.split_first() else {
                bail!("generic frame descriptor ends mid frame diff");
            };
            rest = tail;
            let mut diff = (diff_byte >> 2) as u16;
            if diff_byte & 0x02 != 0 {
                let Some((&extended_byte, tail)) = rest.split_first() else {
                    bail!("generic frame descriptor ends mid extended frame diff");
                };
                rest = tail;
                diff |= (extended_byte as u16) << 6;
            }
            if diff == 0 {
                bail!("zero frame diff");
            }
            descriptor.frame_diffs.push(diff);
            if diff_byte & 0x01 == 0 {
                break;
            }
        }
    }

    match rest.len() {
        0 => {}
        4 => {
            descriptor.resolution = Some(PixelSize {
                width: parse_u16(&rest[0..2]),
                height: parse_u16(&rest[2..4]),
            });
        }
        trailing => bail!("generic frame descriptor has {trailing} trailing bytes"),
    }
    Ok(descriptor)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DependencyParseResult {
    /// The video header now carries the frame's dependency node.
    HasDescriptor,
    /// No descriptor extension; framing falls back to the payload.
    NoDescriptor,
    Drop,
    /// Cannot be resolved until a key frame delivers a structure; retry
    /// after one arrives.
    Stash,
}

/// Per-stream descriptor state machine.
pub struct DependencyParser {
    structure: Option<DependencyStructure>,
    /// Unwrapped frame number of the key frame that carried the structure.
    structure_frame_id: Option<FullFrameNumber>,
    frame_number_max: u64,
}

impl DependencyParser {
    pub fn new() -> Self {
        Self {
            structure: None,
            structure_frame_id: None,
            frame_number_max: 0,
        }
    }

    pub fn has_structure(&self) -> bool {
        self.structure.is_some()
    }

    pub fn parse(
        &mut self,
        packet: &RtpPacket,
        video_header: &mut VideoHeader,
    ) -> DependencyParseResult {
        if let Some(raw) = packet.dependency_descriptor.as_deref() {
            return self.parse_dependency_descriptor(raw, video_header);
        }
        if let Some(raw) = packet.generic_frame_descriptor.as_deref() {
            return self.parse_generic_descriptor(raw, video_header);
        }
        DependencyParseResult::NoDescriptor
    }

    fn parse_dependency_descriptor(
        &mut self,
        raw: &[u8],
        video_header: &mut VideoHeader,
    ) -> DependencyParseResult {
        let descriptor = match DependencyDescriptorReader::new(raw).read(self.structure.as_ref()) {
            Ok(descriptor) => descriptor,
            Err(DescriptorReadError::MissingStructure) => {
                // The structure this descriptor needs has not arrived, or
                // arrived and was replaced. Peek at the frame number to tell
                // a too-new packet (worth retrying) from a too-old one.
                let Ok(mandatory) = DependencyDescriptorReader::new(raw).read_mandatory() else {
                    event!("video.rtp.invalid.dependency_descriptor");
                    return DependencyParseResult::Drop;
                };
                let frame_id =
                    expand_frame_number(mandatory.frame_number, &mut self.frame_number_max);
                return match self.structure_frame_id {
                    Some(structure_frame_id) if frame_id < structure_frame_id => {
                        event!("video.rtp.invalid.dependency_descriptor_before_structure");
                        DependencyParseResult::Drop
                    }
                    _ => DependencyParseResult::Stash,
                };
            }
            Err(DescriptorReadError::Malformed(err)) => {
                event!("video.rtp.invalid.dependency_descriptor");
                debug!("Invalid RTP: bad dependency descriptor: {err}");
                return DependencyParseResult::Drop;
            }
        };

        let frame_id = expand_frame_number(descriptor.frame_number, &mut self.frame_number_max);
        if let Some(attached_structure) = descriptor.attached_structure {
            if !descriptor.first_packet_in_frame {
                event!("video.rtp.invalid.structure_on_non_first_packet");
                debug!("Invalid RTP: dependency structure on a non-first packet of a frame");
                return DependencyParseResult::Drop;
            }
            if self
                .structure_frame_id
                .is_some_and(|structure_frame_id| structure_frame_id > frame_id)
            {
                warn!(
                    "key frame {frame_id} is older than the key frame that delivered the current structure; dropping"
                );
                event!("video.rtp.invalid.stale_structure");
                return DependencyParseResult::Drop;
            }
            self.structure = Some(attached_structure);
            self.structure_frame_id = Some(frame_id);
            video_header.frame_type = VideoFrameType::Key;
        } else {
            video_header.frame_type = VideoFrameType::Delta;
        }

        video_header.is_first_packet_in_frame = descriptor.first_packet_in_frame;
        video_header.is_last_packet_in_frame = descriptor.last_packet_in_frame;

        let deps = descriptor.frame_dependencies;
        let discardable = deps
            .decode_target_indications
            .contains(&DecodeTargetIndication::Discardable);
        video_header.generic = Some(GenericFrameInfo {
            frame_id,
            spatial_index: deps.spatial_index,
            temporal_index: deps.temporal_index,
            frame_dependencies: deps
                .frame_diffs
                .iter()
                .map(|diff| frame_id.saturating_sub(*diff as u64))
                .collect(),
            decode_target_indications: deps.decode_target_indications,
            discardable,
        });
        if descriptor.resolution.is_some() {
            video_header.resolution = descriptor.resolution;
        }
        DependencyParseResult::HasDescriptor
    }

    fn parse_generic_descriptor(
        &mut self,
        raw: &[u8],
        video_header: &mut VideoHeader,
    ) -> DependencyParseResult {
        let descriptor = match parse_generic_frame_descriptor(raw) {
            Ok(descriptor) => descriptor,
            Err(err) => {
                event!("video.rtp.invalid.generic_frame_descriptor");
                debug!("Invalid RTP: bad generic frame descriptor: {err}");
                return DependencyParseResult::Drop;
            }
        };

        video_header.is_first_packet_in_frame = descriptor.first_packet_in_frame;
        video_header.is_last_packet_in_frame = descriptor.last_packet_in_frame;
        if let Some(frame_number) = descriptor.frame_number {
            let frame_id = expand_frame_number(frame_number, &mut self.frame_number_max);
            video_header.frame_type = if descriptor.frame_diffs.is_empty() {
                VideoFrameType::Key
            } else {
                VideoFrameType::Delta
            };
            let spatial_index = if descriptor.spatial_bitmask == 0 {
                0
            } else {
                descriptor.spatial_bitmask.trailing_zeros() as u8
            };
            video_header.generic = Some(GenericFrameInfo {
                frame_id,
                spatial_index,
                temporal_index: descriptor.temporal_index,
                frame_dependencies: descriptor
                    .frame_diffs
                    .iter()
                    .map(|diff| frame_id.saturating_sub(*diff as u64))
                    .collect(),
                decode_target_indications: vec![],
                discardable: descriptor.discardable,
            });
        }
        if descriptor.resolution.is_some() {
            video_header.resolution = descriptor.resolution;
        }
        DependencyParseResult::HasDescriptor
    }
}

impl Default for DependencyParser {
    fn default() -> Self {
        Self::new()
    }
}
