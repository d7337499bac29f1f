//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Buffers out-of-order packets until every packet of a frame has arrived,
//! then releases the frame's packets as one run. The buffer is a ring keyed
//! by sequence number; it grows geometrically under load and clears itself
//! completely when even the maximum size cannot hold the reorder window.

use std::collections::BTreeSet;

use log::*;
use metrics::event;
use video_common::Instant;

use crate::depacketizer::h264::{
    H264PacketInfo, MAX_NALUS_PER_PACKET, NALU_TYPE_IDR, NALU_TYPE_PPS, NALU_TYPE_SPS,
};
use crate::frame::{VideoCodec, VideoFrameType, VideoHeader};
use crate::rtp::{FullSequenceNumber, FullTimestamp};

pub const PACKET_BUFFER_START_SIZE: usize = 512;
pub const PACKET_BUFFER_MAX_SIZE: usize = 2048;

/// Missing sequence numbers further than this behind the newest insertion
/// are no longer tracked; a jump this large is a new stream, not a loss.
const MAX_MISSING_PACKET_AGE: u64 = 1000;

/// One depacketized payload unit waiting for the rest of its frame.
#[derive(Clone, Debug)]
pub struct Packet {
    pub seqnum: FullSequenceNumber,
    pub timestamp: FullTimestamp,
    pub codec: VideoCodec,
    pub header: VideoHeader,
    pub h264: Option<H264PacketInfo>,
    pub payload: Vec<u8>,
    pub times_nacked: u8,
    pub receive_time: Instant,
}

/// The packets of one complete frame, first to last, boundary flags set.
#[derive(Debug)]
pub struct AssembledFrame {
    pub packets: Vec<Packet>,
}

#[derive(Debug, Default)]
pub struct InsertResult {
    pub frames: Vec<AssembledFrame>,
    /// The buffer overflowed and dropped everything; the caller must request
    /// a key frame and reset sequence-derived state downstream.
    pub buffer_cleared: bool,
}

struct Slot {
    packet: Packet,
    /// Every packet from the frame's first packet through this one arrived.
    continuous: bool,
}

pub struct PacketBuffer {
    max_size: usize,
    slots: Vec<Option<Slot>>,
    /// Oldest sequence number the buffer may still hold.
    first_seqnum: FullSequenceNumber,
    first_packet_received: bool,
    cleared_to_first_seqnum: bool,
    newest_inserted_seqnum: Option<FullSequenceNumber>,
    missing_packets: BTreeSet<FullSequenceNumber>,
}

impl PacketBuffer {
    pub fn new(start_size: usize, max_size: usize) -> Self {
        debug_assert!(start_size.is_power_of_two());
        debug_assert!(max_size.is_power_of_two());
        let start_size = start_size.min(max_size);
        Self {
            max_size,
            slots: (0..start_size).map(|_| None).collect(),
            first_seqnum: 0,
            first_packet_received: false,
            cleared_to_first_seqnum: false,
            newest_inserted_seqnum: None,
            missing_packets: BTreeSet::new(),
        }
    }

    pub fn insert(&mut self, packet: Packet) -> InsertResult {
        let seqnum = packet.seqnum;

        if !self.first_packet_received {
            self.first_seqnum = seqnum;
            self.first_packet_received = true;
        } else if seqnum < self.first_seqnum {
            if self.cleared_to_first_seqnum {
                // The decoder moved past this packet already.
                return InsertResult::default();
            }
            self.first_seqnum = seqnum;
        }

        if let Some(existing) = &self.slots[self.index_of(seqnum)] {
            if existing.packet.seqnum == seqnum {
                // Duplicate, typically a retransmit that raced its NACK.
                return InsertResult::default();
            }
            while self.slots.len() < self.max_size && self.slots[self.index_of(seqnum)].is_some() {
                self.expand();
            }
            if self.slots[self.index_of(seqnum)].is_some() {
                warn!("packet buffer full at {} packets; clearing", self.slots.len());
                event!("video.packet_buffer.cleared");
                self.clear();
                return InsertResult {
                    frames: vec![],
                    buffer_cleared: true,
                };
            }
        }

        let index = self.index_of(seqnum);
        self.slots[index] = Some(Slot {
            packet,
            continuous: false,
        });
        self.update_missing_packets(seqnum);

        InsertResult {
            frames: self.find_frames(seqnum),
            buffer_cleared: false,
        }
    }

    /// Records a padding-only packet. It occupies no slot but unblocks
    /// completeness checks waiting on its sequence number.
    pub fn insert_padding(&mut self, seqnum: FullSequenceNumber) -> InsertResult {
        self.update_missing_packets(seqnum);
        InsertResult {
            frames: self.find_frames(seqnum + 1),
            buffer_cleared: false,
        }
    }

    /// Forgets all packets with sequence numbers below `seqnum`.
    pub fn clear_to(&mut self, seqnum: FullSequenceNumber) {
        if self.cleared_to_first_seqnum && self.first_seqnum >= seqnum {
            return;
        }
        if !self.first_packet_received {
            return;
        }
        let iterations = seqnum
            .saturating_sub(self.first_seqnum)
            .min(self.slots.len() as u64);
        for _ in 0..iterations {
            let index = self.index_of(self.first_seqnum);
            if self.slots[index]
                .as_ref()
                .is_some_and(|slot| slot.packet.seqnum < seqnum)
            {
                self.slots[index] = None;
            }
            self.first_seqnum += 1;
        }
        self.first_seqnum = self.first_seqnum.max(seqnum);
        self.cleared_to_first_seqnum = true;
        self.missing_packets = self.missing_packets.split_off(&seqnum);
    }

    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.first_packet_received = false;
        self.cleared_to_first_seqnum = false;
        self.newest_inserted_seqnum = None;
        self.missing_packets.clear();
    }

    fn index_of(&self, seqnum: FullSequenceNumber) -> usize {
        (seqnum % self.slots.len() as u64) as usize
    }

    fn slot_of(&self, seqnum: FullSequenceNumber) -> Option<&Slot> {
        let slot = self.slots[self.index_of(seqnum)].as_ref()?;
        (slot.packet.seqnum == seqnum).then_some(slot)
    }

    fn expand(&mut self) {
        let new_size = (self.slots.len() * 2).min(self.max_size);
        let mut new_slots: Vec<Option<Slot>> = (0..new_size).map(|_| None).collect();
        for slot in self.slots.drain(..).flatten() {
            let index = (slot.packet.seqnum % new_size as u64) as usize;
            new_slots[index] = Some(slot);
        }
        self.slots = new_slots;
        info!("packet buffer expanded to {new_size} packets");
    }

    fn update_missing_packets(&mut self, seqnum: FullSequenceNumber) {
        let Some(newest) = self.newest_inserted_seqnum else {
            self.newest_inserted_seqnum = Some(seqnum);
            return;
        };
        if seqnum <= newest {
            self.missing_packets.remove(&seqnum);
            return;
        }
        let old_seqnum = seqnum.saturating_sub(MAX_MISSING_PACKET_AGE);
        self.missing_packets = self.missing_packets.split_off(&old_seqnum);
        let first_missing = if old_seqnum > newest {
            // A jump, not a run of losses; track only the recent tail.
            old_seqnum + 1
        } else {
            newest + 1
        };
        for missing in first_missing..seqnum {
            self.missing_packets.insert(missing);
        }
        self.newest_inserted_seqnum = Some(seqnum);
    }

    /// The packet at `seqnum` is continuous when its frame's earlier packets
    /// all arrived, either because it starts a frame or because its
    /// predecessor in the same frame is continuous.
    fn potential_new_frame(&self, seqnum: FullSequenceNumber) -> bool {
        let Some(slot) = self.slot_of(seqnum) else {
            return false;
        };
        if slot.packet.header.is_first_packet_in_frame {
            return true;
        }
        let Some(prev) = seqnum.checked_sub(1).and_then(|prev| self.slot_of(prev)) else {
            return false;
        };
        prev.packet.timestamp == slot.packet.timestamp && prev.continuous
    }

    /// Advances continuity from `seqnum` onward and extracts every frame
    /// whose packets are now all present.
    fn find_frames(&mut self, mut seqnum: FullSequenceNumber) -> Vec<AssembledFrame> {
        let mut found_frames = vec![];
        for _ in 0..self.slots.len() {
            if !self.potential_new_frame(seqnum) {
                break;
            }
            let index = self.index_of(seqnum);
            let Some(slot) = &mut self.slots[index] else {
                break;
            };
            slot.continuous = true;
            let is_last = slot.packet.header.is_last_packet_in_frame;
            let is_h264 = slot.packet.codec == VideoCodec::H264;
            let frame_timestamp = slot.packet.timestamp;

            if is_last {
                let Some((start_seqnum, is_h264_keyframe)) =
                    self.find_frame_start(seqnum, is_h264, frame_timestamp)
                else {
                    return found_frames;
                };
                if is_h264
                    && !is_h264_keyframe
                    && self.missing_packets.range(..start_seqnum).next().is_some()
                {
                    // A delta frame after unresolved losses may reference
                    // packets we never saw; keep holding it.
                    return found_frames;
                }

                let mut packets = Vec::with_capacity((seqnum - start_seqnum + 1) as usize);
                for extract_seqnum in start_seqnum..=seqnum {
                    let index = self.index_of(extract_seqnum);
                    let Some(slot) = self.slots[index].take() else {
                        debug_assert!(false, "walked over a hole in a continuous frame");
                        return found_frames;
                    };
                    let mut packet = slot.packet;
                    packet.header.is_first_packet_in_frame = extract_seqnum == start_seqnum;
                    packet.header.is_last_packet_in_frame = extract_seqnum == seqnum;
                    if is_h264 && extract_seqnum == start_seqnum {
                        // The walk, not the payload framing, decides what
                        // kind of frame this is.
                        packet.header.frame_type = if is_h264_keyframe {
                            VideoFrameType::Key
                        } else {
                            VideoFrameType::Delta
                        };
                    }
                    packets.push(packet);
                }
                self.missing_packets = self.missing_packets.split_off(&(seqnum + 1));
                found_frames.push(AssembledFrame { packets });
            }
            seqnum += 1;
        }
        found_frames
    }

    /// Walks backward from the frame's last packet to its first. H.264
    /// payloads have no trustworthy first-packet flag, so the frame extends
    /// backward while the timestamp matches; for H.264 the walk also decides
    /// whether the frame is a keyframe (it contains an IDR).
    fn find_frame_start(
        &self,
        last_seqnum: FullSequenceNumber,
        is_h264: bool,
        frame_timestamp: FullTimestamp,
    ) -> Option<(FullSequenceNumber, bool)> {
        let mut start_seqnum = last_seqnum;
        let mut has_sps = false;
        let mut has_pps = false;
        let mut has_idr = false;
        loop {
            let slot = self.slot_of(start_seqnum)?;
            if is_h264 {
                let h264 = slot.packet.h264.as_ref()?;
                if h264.nalus.len() >= MAX_NALUS_PER_PACKET {
                    // NALU tracking overflowed; the frame cannot be classified.
                    return None;
                }
                for nalu in &h264.nalus {
                    match nalu.nalu_type {
                        NALU_TYPE_SPS => has_sps = true,
                        NALU_TYPE_PPS => has_pps = true,
                        NALU_TYPE_IDR => has_idr = true,
                        _ => {}
                    }
                }
                match start_seqnum
                    .checked_sub(1)
                    .and_then(|prev| self.slot_of(prev))
                {
                    Some(prev) if prev.packet.timestamp == frame_timestamp => {
                        if last_seqnum - start_seqnum + 1 >= self.slots.len() as u64 {
                            return None;
                        }
                        start_seqnum -= 1;
                    }
                    _ => break,
                }
            } else {
                if slot.packet.header.is_first_packet_in_frame {
                    break;
                }
                if last_seqnum - start_seqnum + 1 >= self.slots.len() as u64 {
                    return None;
                }
                start_seqnum = start_seqnum.checked_sub(1)?;
            }
        }
        if has_idr && (!has_sps || !has_pps) {
            warn!("H.264 IDR frame without SPS ({has_sps}) or PPS ({has_pps})");
        }
        Some((start_seqnum, has_idr))
    }
}
