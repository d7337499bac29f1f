//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! The receive side of one video RTP stream. Raw packets come in; complete,
//! dependency-ordered frames go out to the frame sink, and the feedback the
//! stream provokes (key frame requests, NACKs, loss notifications) goes out
//! through the feedback sink. Everything in between (depacketization, FEC,
//! loss tracking, reassembly, reference finding) lives behind
//! [`VideoReceiver`].

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::mpsc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use log::*;
use metrics::event;
use video_common::{Duration, Instant};

use crate::config::Config;
use crate::depacketizer::h264::{FixedBitstream, SpsPpsTracker};
use crate::depacketizer::{self, DepacketizedPayload, Depacketizer};
use crate::dependency_descriptor::{DependencyParseResult, DependencyParser};
use crate::feedback::{RtcpFeedbackBuffer, RtcpFeedbackWriter, VideoFeedbackSink, VideoFrameSink};
use crate::frame::{Frame, VideoCodec};
use crate::frame_reference::FrameReferenceFinder;
use crate::loss_notification::{FrameDetails, LossNotificationController};
use crate::packet_buffer::{
    AssembledFrame, InsertResult, Packet, PacketBuffer, PACKET_BUFFER_START_SIZE,
};
use crate::rtp::fec::{RedPayload, UlpfecReceiver};
use crate::rtp::nack::{NackRequester, NACK_PROCESS_INTERVAL};
use crate::rtp::rtcp::{parse_compound_rtcp, SenderReport};
use crate::rtp::{
    expand_seqnum, expand_timestamp, ColorSpace, FullFrameNumber, FullSequenceNumber,
    FullTimestamp, PacketInfoTable, PayloadType, RtpPacket, RtpPacketInfo,
};

/// Media packets waiting for a dependency structure; older ones are evicted
/// first once this fills up.
const MAX_STASHED_PACKETS: usize = 100;

/// Minimum spacing between key frame requests sent because the dependency
/// structure is missing.
const KEY_FRAME_REQUEST_INTERVAL: Duration = Duration::SECOND;

const PACKET_LOG_INTERVAL: Duration = Duration::from_secs(10);

const SPROP_PARAMETER_SETS: &str = "sprop-parameter-sets";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ReceiverState {
    Idle,
    Receiving,
}

/// One negotiated payload type and how to unpack it.
struct ReceiveCodec {
    codec: VideoCodec,
    depacketizer: Depacketizer,
    /// Format parameters from signaling, e.g. sprop-parameter-sets.
    params: HashMap<String, String>,
}

/// A media packet that can't be processed until a key frame delivers the
/// dependency structure it refers to.
struct StashedPacket {
    packet: RtpPacket,
    seqnum: FullSequenceNumber,
    receive_time: Instant,
}

pub struct VideoReceiver {
    config: Config,
    state: ReceiverState,

    codecs: HashMap<PayloadType, ReceiveCodec>,
    /// Payload type of the last media packet, to notice renegotiations.
    last_payload_type: Option<PayloadType>,

    max_seqnum: FullSequenceNumber,
    max_timestamp: FullTimestamp,
    packet_infos: PacketInfoTable,

    dependency_parser: DependencyParser,
    sps_pps_tracker: SpsPpsTracker,
    stashed_packets: VecDeque<StashedPacket>,
    retrying_stashed_packets: bool,
    next_structure_keyframe_request: Option<Instant>,

    ulpfec: UlpfecReceiver,
    packet_buffer: PacketBuffer,
    nack_requester: Option<NackRequester>,
    loss_notification: Option<LossNotificationController>,
    feedback: RtcpFeedbackBuffer,

    reference_finder: FrameReferenceFinder,
    current_codec: Option<VideoCodec>,
    last_assembled_frame_rtp_timestamp: Option<FullTimestamp>,
    last_completed_picture_id: FullFrameNumber,
    last_seqnum_by_picture_id: BTreeMap<FullFrameNumber, FullSequenceNumber>,
    has_received_frame: bool,
    last_color_space: Option<ColorSpace>,

    last_received_rtp_timestamp: Option<FullTimestamp>,
    last_received_time: Option<Instant>,
    last_received_keyframe_rtp_timestamp: Option<FullTimestamp>,
    last_received_keyframe_time: Option<Instant>,
    last_packet_log: Option<Instant>,
    last_nack_process: Option<Instant>,

    frame_transform: Option<mpsc::Sender<Frame>>,
    frame_sink: Box<dyn VideoFrameSink>,
    last_sender_report: Option<(SenderReport, Instant)>,
}

impl VideoReceiver {
    pub fn new(
        config: Config,
        feedback_sink: Box<dyn VideoFeedbackSink>,
        frame_sink: Box<dyn VideoFrameSink>,
    ) -> Self {
        let nack_requester = config.nack_enabled().then(NackRequester::new);
        let loss_notification = config.lntf_enabled.then(LossNotificationController::new);
        let packet_buffer =
            PacketBuffer::new(PACKET_BUFFER_START_SIZE, config.packet_buffer_max_size());
        let ulpfec = UlpfecReceiver::new(config.remote_ssrc, config.ulpfec_payload_type);
        Self {
            state: ReceiverState::Idle,
            codecs: HashMap::new(),
            last_payload_type: None,
            max_seqnum: 0,
            max_timestamp: 0,
            packet_infos: PacketInfoTable::default(),
            dependency_parser: DependencyParser::new(),
            sps_pps_tracker: SpsPpsTracker::new(),
            stashed_packets: VecDeque::new(),
            retrying_stashed_packets: false,
            next_structure_keyframe_request: None,
            ulpfec,
            packet_buffer,
            nack_requester,
            loss_notification,
            feedback: RtcpFeedbackBuffer::new(feedback_sink),
            reference_finder: FrameReferenceFinder::new(0),
            current_codec: None,
            last_assembled_frame_rtp_timestamp: None,
            last_completed_picture_id: 0,
            last_seqnum_by_picture_id: BTreeMap::new(),
            has_received_frame: false,
            last_color_space: None,
            last_received_rtp_timestamp: None,
            last_received_time: None,
            last_received_keyframe_rtp_timestamp: None,
            last_received_keyframe_time: None,
            last_packet_log: None,
            last_nack_process: None,
            frame_transform: None,
            frame_sink,
            last_sender_report: None,
            config,
        }
    }

    /// Like [`VideoReceiver::new`], with feedback serialized to RTCP packets
    /// and posted to `rtcp_outbox`.
    pub fn with_rtcp_outbox(
        config: Config,
        rtcp_outbox: mpsc::Sender<Vec<u8>>,
        frame_sink: Box<dyn VideoFrameSink>,
    ) -> Self {
        let writer = RtcpFeedbackWriter::new(
            config.local_ssrc,
            config.remote_ssrc,
            config.keyframe_request_method,
            rtcp_outbox,
        );
        Self::new(config, Box::new(writer), frame_sink)
    }

    pub fn start(&mut self) {
        self.state = ReceiverState::Receiving;
    }

    pub fn stop(&mut self) {
        self.state = ReceiverState::Idle;
    }

    pub fn is_receiving(&self) -> bool {
        self.state == ReceiverState::Receiving
    }

    /// Routes assembled frames through an external transform (e.g. frame
    /// decryption) instead of straight into reference finding. Transformed
    /// frames come back via [`VideoReceiver::on_decrypted_frame`].
    pub fn set_frame_transform(&mut self, transform: mpsc::Sender<Frame>) {
        self.frame_transform = Some(transform);
    }

    /// Registers a payload type. `raw_payload` skips depacketization for
    /// formats whose payloads arrive whole.
    pub fn add_receive_codec(
        &mut self,
        payload_type: PayloadType,
        codec: VideoCodec,
        params: HashMap<String, String>,
        raw_payload: bool,
    ) {
        info!("adding receive codec {codec} for payload type {payload_type}");
        let depacketizer = Depacketizer::for_codec(codec, raw_payload);
        self.codecs.insert(
            payload_type,
            ReceiveCodec {
                codec,
                depacketizer,
                params,
            },
        );
    }

    pub fn remove_receive_codecs(&mut self) {
        self.codecs.clear();
        self.last_payload_type = None;
    }

    /// Feeds one plaintext RTP packet into the pipeline. Any feedback the
    /// packet provokes is flushed before returning.
    pub fn receive_packet(&mut self, packet: &[u8], now: Instant) {
        if self.state != ReceiverState::Receiving {
            return;
        }
        let Some(parsed) = RtpPacket::parse(packet) else {
            return;
        };
        if parsed.ssrc != self.config.remote_ssrc {
            debug!(
                "dropping rtp packet for ssrc {}, expected {}",
                parsed.ssrc, self.config.remote_ssrc
            );
            return;
        }
        let seqnum = expand_seqnum(parsed.seqnum, &mut self.max_seqnum);
        if parsed.is_padding_only() {
            self.on_empty_packet(seqnum, now);
        } else if self.config.red_payload_type == Some(parsed.payload_type) {
            self.receive_red_packet(&parsed, packet, seqnum, now);
        } else {
            self.receive_media_packet(parsed, seqnum, now);
        }
        self.feedback.send_buffered_rtcp_feedback();
    }

    /// Hands the receiver a compound RTCP packet from the media sender.
    /// Sender reports are kept for timestamp alignment.
    pub fn deliver_rtcp(&mut self, packet: &[u8], now: Instant) {
        if self.state != ReceiverState::Receiving {
            return;
        }
        let Some(sender_reports) = parse_compound_rtcp(packet) else {
            return;
        };
        for report in sender_reports {
            if report.ssrc == self.config.remote_ssrc {
                self.last_sender_report = Some((report, now));
            }
        }
    }

    pub fn update_rtt(&mut self, rtt: Duration) {
        if let Some(nack) = &mut self.nack_requester {
            nack.update_rtt(rtt);
        }
    }

    /// Periodic work: re-requests retransmissions whose response is overdue.
    /// Call on a short timer while receiving.
    pub fn tick(&mut self, now: Instant) {
        if let Some(nack) = &mut self.nack_requester {
            let due = self
                .last_nack_process
                .map_or(true, |at| now.saturating_duration_since(at) >= NACK_PROCESS_INTERVAL);
            if due {
                self.last_nack_process = Some(now);
                nack.process(now, &mut self.feedback);
            }
        }
        self.feedback.send_buffered_rtcp_feedback();
    }

    /// Reinjects a frame that went out through the transform seam.
    pub fn on_decrypted_frame(&mut self, frame: Frame) {
        self.manage_assembled_frame(frame);
        self.feedback.send_buffered_rtcp_feedback();
    }

    /// The decoder finished the frame; everything at or before it can be
    /// dropped from the receive window.
    pub fn frame_decoded(&mut self, picture_id: FullFrameNumber) {
        let Some(&last_seqnum) = self.last_seqnum_by_picture_id.get(&picture_id) else {
            return;
        };
        self.last_seqnum_by_picture_id = self.last_seqnum_by_picture_id.split_off(&(picture_id + 1));
        self.packet_infos.erase_up_through(last_seqnum);
        self.packet_buffer.clear_to(last_seqnum);
        self.reference_finder.clear_to(last_seqnum);
    }

    /// The frame and all of its dependencies have been handed to the
    /// decoder; its packets no longer need retransmission.
    pub fn frame_continuous(&mut self, picture_id: FullFrameNumber) {
        let Some(nack) = &mut self.nack_requester else {
            return;
        };
        if let Some(&last_seqnum) = self.last_seqnum_by_picture_id.get(&picture_id) {
            nack.clear_up_to(last_seqnum);
        }
    }

    /// NACKs the given sequence numbers immediately, outside the regular gap
    /// tracking. Used when the decoder wants an incomplete frame's tail.
    pub fn request_packet_retransmit(
        &mut self,
        seqnums: impl IntoIterator<Item = FullSequenceNumber>,
    ) {
        self.feedback.send_nack(seqnums, false);
    }

    pub fn last_received_rtp_timestamp(&self) -> Option<FullTimestamp> {
        self.last_received_rtp_timestamp
    }

    pub fn last_received_time(&self) -> Option<Instant> {
        self.last_received_time
    }

    pub fn last_received_keyframe_rtp_timestamp(&self) -> Option<FullTimestamp> {
        self.last_received_keyframe_rtp_timestamp
    }

    pub fn last_received_keyframe_time(&self) -> Option<Instant> {
        self.last_received_keyframe_time
    }

    pub fn last_sender_report(&self) -> Option<(SenderReport, Instant)> {
        self.last_sender_report
    }

    fn receive_red_packet(
        &mut self,
        packet: &RtpPacket,
        raw: &[u8],
        seqnum: FullSequenceNumber,
        now: Instant,
    ) {
        match self.ulpfec.add_received_red_packet(packet, raw, seqnum) {
            Some(RedPayload::Media(media)) => self.receive_media_packet(media, seqnum, now),
            // The FEC block consumed this sequence number; without this the
            // gap trackers would NACK it.
            Some(RedPayload::Fec) => self.on_empty_packet(seqnum, now),
            None => return,
        }
        for recovered in self.ulpfec.process_received_fec() {
            let seqnum = expand_seqnum(recovered.seqnum, &mut self.max_seqnum);
            self.receive_media_packet(recovered, seqnum, now);
        }
    }

    /// Padding, keep-alive, and FEC packets hold a sequence number but no
    /// media. The gap trackers still need to see them.
    fn on_empty_packet(&mut self, seqnum: FullSequenceNumber, now: Instant) {
        let released = self.reference_finder.padding_received(seqnum);
        self.deliver_frames(released);
        let result = self.packet_buffer.insert_padding(seqnum);
        self.handle_insert_result(result);
        if let Some(nack) = &mut self.nack_requester {
            nack.on_received_packet(seqnum, false, false, now, &mut self.feedback);
        }
    }

    fn receive_media_packet(
        &mut self,
        packet: RtpPacket,
        seqnum: FullSequenceNumber,
        now: Instant,
    ) {
        let Some(receive_codec) = self.codecs.get(&packet.payload_type) else {
            debug!("no codec for payload type {}", packet.payload_type);
            return;
        };
        let codec = receive_codec.codec;
        let depacketizer = receive_codec.depacketizer;

        let Some(depacketized) = depacketizer.parse(&packet.payload) else {
            event!("video.rtp.invalid.codec_payload");
            debug!("dropping undepacketizable {codec} payload, seqnum {seqnum}");
            return;
        };
        let DepacketizedPayload {
            mut header,
            mut h264,
            payload,
        } = depacketized;

        self.packet_infos
            .insert(seqnum, RtpPacketInfo::new(&packet, now));

        header.is_last_packet_in_frame |= packet.marker;
        header.rotation = packet.video_rotation;
        header.content_type = packet.content_type;
        if !packet.recovered {
            header.playout_delay = packet.playout_delay;
        }
        header.corruption_detection = packet.corruption_detection.clone();

        let timestamp = expand_timestamp(packet.timestamp, &mut self.max_timestamp);
        let dependency_result = self.dependency_parser.parse(&packet, &mut header);
        if !packet.recovered {
            self.update_packet_receive_timestamps(
                &packet,
                header.frame_type.is_key(),
                timestamp,
                now,
            );
        }
        match dependency_result {
            DependencyParseResult::Drop => return,
            DependencyParseResult::Stash => {
                if !self.dependency_parser.has_structure() {
                    // Most likely part of the initial key frame was lost.
                    self.maybe_request_structure_keyframe(now);
                }
                if self.stashed_packets.len() >= MAX_STASHED_PACKETS {
                    self.stashed_packets.pop_front();
                }
                self.stashed_packets.push_back(StashedPacket {
                    packet,
                    seqnum,
                    receive_time: now,
                });
                return;
            }
            DependencyParseResult::HasDescriptor | DependencyParseResult::NoDescriptor => {}
        }

        // Color space is only sent when it changes or on (the last packet
        // of) key frames, and applies until replaced.
        if packet.marker {
            header.color_space = packet.color_space;
        }
        if header.color_space.is_some() || header.frame_type.is_key() {
            self.last_color_space = header.color_space;
        } else if self.last_color_space.is_some() {
            header.color_space = self.last_color_space;
        }

        if let Some(lntf) = &mut self.loss_notification {
            if packet.recovered {
                debug!("loss notification tracking skips recovered packets");
            } else if dependency_result == DependencyParseResult::NoDescriptor {
                warn!("loss notification tracking needs a dependency node, but none was present");
            } else {
                let details = header
                    .generic
                    .as_ref()
                    .filter(|_| header.is_first_packet_in_frame)
                    .map(|generic| FrameDetails {
                        is_keyframe: header.frame_type.is_key(),
                        frame_id: generic.frame_id,
                        frame_dependencies: &generic.frame_dependencies,
                    });
                lntf.on_received_packet(seqnum, details.as_ref(), &mut self.feedback);
            }
        }

        let times_nacked = if let Some(nack) = &mut self.nack_requester {
            nack.on_received_packet(
                seqnum,
                header.is_first_packet_in_frame && header.frame_type.is_key(),
                packet.recovered,
                now,
                &mut self.feedback,
            )
        } else {
            0
        };

        if payload.is_empty() {
            self.on_empty_packet(seqnum, now);
            return;
        }

        let bitstream = if let Some(h264_info) = &mut h264 {
            // Only once packets arrive do we know which payload type the
            // sender picked; pick up its out-of-band parameter sets then.
            if self.last_payload_type != Some(packet.payload_type) {
                self.last_payload_type = Some(packet.payload_type);
                self.insert_sprop_parameter_sets(packet.payload_type);
            }
            match self.sps_pps_tracker.copy_and_fix_bitstream(
                header.is_first_packet_in_frame,
                h264_info,
                &payload,
            ) {
                FixedBitstream::Insert(bitstream) => bitstream,
                FixedBitstream::Drop => return,
                FixedBitstream::RequestKeyframe => {
                    self.feedback.request_key_frame();
                    return;
                }
            }
        } else {
            payload
        };

        let result = self.packet_buffer.insert(Packet {
            seqnum,
            timestamp,
            codec,
            header,
            h264,
            payload: bitstream,
            times_nacked,
            receive_time: now,
        });
        self.handle_insert_result(result);
        self.retry_stashed_packets();
    }

    fn retry_stashed_packets(&mut self) {
        if self.retrying_stashed_packets
            || self.stashed_packets.is_empty()
            || !self.dependency_parser.has_structure()
        {
            return;
        }
        self.retrying_stashed_packets = true;
        let stashed: Vec<StashedPacket> = self.stashed_packets.drain(..).collect();
        for stashed_packet in stashed {
            self.receive_media_packet(
                stashed_packet.packet,
                stashed_packet.seqnum,
                stashed_packet.receive_time,
            );
        }
        self.retrying_stashed_packets = false;
    }

    fn maybe_request_structure_keyframe(&mut self, now: Instant) {
        let due = self
            .next_structure_keyframe_request
            .map_or(true, |at| now >= at);
        if due {
            self.feedback.request_key_frame();
            self.next_structure_keyframe_request = Some(now + KEY_FRAME_REQUEST_INTERVAL);
        }
    }

    fn update_packet_receive_timestamps(
        &mut self,
        packet: &RtpPacket,
        is_keyframe: bool,
        timestamp: FullTimestamp,
        now: Instant,
    ) {
        if is_keyframe || self.last_received_keyframe_rtp_timestamp == Some(timestamp) {
            self.last_received_keyframe_rtp_timestamp = Some(timestamp);
            self.last_received_keyframe_time = Some(now);
        }
        self.last_received_rtp_timestamp = Some(timestamp);
        self.last_received_time = Some(now);

        let log_due = self
            .last_packet_log
            .map_or(true, |at| now.saturating_duration_since(at) > PACKET_LOG_INTERVAL);
        if log_due {
            info!(
                "receiving video: ssrc {}, payload type {}, seqnum {}, timestamp {}",
                packet.ssrc, packet.payload_type, packet.seqnum, packet.timestamp
            );
            self.last_packet_log = Some(now);
        }
    }

    fn handle_insert_result(&mut self, result: InsertResult) {
        for assembled in result.frames {
            self.on_assembled_frame(assembled);
        }
        if result.buffer_cleared {
            self.last_received_rtp_timestamp = None;
            self.last_received_time = None;
            self.last_received_keyframe_rtp_timestamp = None;
            self.last_received_keyframe_time = None;
            self.packet_infos = PacketInfoTable::default();
            self.feedback.request_key_frame();
        }
    }

    fn on_assembled_frame(&mut self, assembled: AssembledFrame) {
        let Some(first) = assembled.packets.first() else {
            return;
        };
        let Some(last) = assembled.packets.last() else {
            return;
        };

        if let (Some(lntf), Some(generic)) = (&mut self.loss_notification, &first.header.generic) {
            lntf.on_assembled_frame(
                first.seqnum,
                generic.frame_id,
                generic.discardable,
                &generic.frame_dependencies,
            );
        }

        let mut times_nacked = 0;
        let mut first_received = first.receive_time;
        let mut last_received = last.receive_time;
        for packet in &assembled.packets {
            times_nacked = times_nacked.max(packet.times_nacked);
            first_received = first_received.min(packet.receive_time);
            last_received = last_received.max(packet.receive_time);
        }

        let fragments: Vec<&[u8]> = assembled
            .packets
            .iter()
            .map(|packet| packet.payload.as_slice())
            .collect();
        let bitstream = depacketizer::assemble(&fragments);

        let frame = Frame {
            first_seqnum: first.seqnum,
            last_seqnum: last.seqnum,
            timestamp: first.timestamp,
            codec: first.codec,
            frame_type: first.header.frame_type,
            generic: first.header.generic.clone(),
            rotation: last.header.rotation,
            content_type: last.header.content_type,
            playout_delay: first.header.playout_delay,
            color_space: last.header.color_space,
            corruption_detection: last.header.corruption_detection.clone(),
            resolution: first.header.resolution,
            times_nacked,
            first_received,
            last_received,
            packet_infos: self.packet_infos.collect_range(first.seqnum, last.seqnum),
            bitstream,
            picture_id: 0,
            references: vec![],
        };

        if !self.has_received_frame {
            self.has_received_frame = true;
            // The first frame after starting should be decodable on its own.
            // With loss notification enabled the request already went out
            // when the frame's first packet arrived.
            if !frame.is_keyframe() && self.loss_notification.is_none() {
                self.feedback.request_key_frame();
            }
        }

        let frame_is_newer = self
            .last_assembled_frame_rtp_timestamp
            .map_or(true, |newest| frame.timestamp > newest);
        if self.current_codec.is_some() && self.current_codec != Some(frame.codec) {
            if frame_is_newer {
                // Picture ids from the new finder must land above everything
                // already handed off, reordering included.
                self.reference_finder = FrameReferenceFinder::new(
                    self.last_completed_picture_id + u64::from(u16::MAX),
                );
            } else {
                debug!(
                    "dropping {} frame from before the codec switch, timestamp {}",
                    frame.codec, frame.timestamp
                );
                return;
            }
        }
        self.current_codec = Some(frame.codec);
        if frame_is_newer {
            self.last_assembled_frame_rtp_timestamp = Some(frame.timestamp);
        }

        if let Some(transform) = &self.frame_transform {
            if transform.send(frame).is_err() {
                warn!("frame transform disconnected; dropping frame");
            }
        } else {
            self.manage_assembled_frame(frame);
        }
    }

    fn manage_assembled_frame(&mut self, frame: Frame) {
        let released = self.reference_finder.manage_frame(frame);
        self.deliver_frames(released);
    }

    fn deliver_frames(&mut self, frames: Vec<Frame>) {
        if frames.is_empty() {
            return;
        }
        for frame in &frames {
            self.last_seqnum_by_picture_id
                .insert(frame.picture_id, frame.last_seqnum);
            self.last_completed_picture_id =
                self.last_completed_picture_id.max(frame.picture_id);
        }
        self.frame_sink.on_complete_frames(frames);
    }

    /// H.264 parameter sets can be signaled out-of-band, base64ed into the
    /// sprop-parameter-sets format parameter as "<sps>,<pps>".
    fn insert_sprop_parameter_sets(&mut self, payload_type: PayloadType) {
        let Some(receive_codec) = self.codecs.get(&payload_type) else {
            return;
        };
        let Some(sprop) = receive_codec.params.get(SPROP_PARAMETER_SETS) else {
            return;
        };
        let Some((sps, pps)) = sprop.split_once(',') else {
            warn!("malformed {SPROP_PARAMETER_SETS}: expected \"<sps>,<pps>\"");
            return;
        };
        let (Ok(sps), Ok(pps)) = (STANDARD.decode(sps), STANDARD.decode(pps)) else {
            warn!("undecodable {SPROP_PARAMETER_SETS}");
            return;
        };
        self.sps_pps_tracker.insert_sps_pps_nalus(&sps, &pps);
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::feedback::tests::{FeedbackEvent, RecordingSink};
    use crate::rtp::rtcp::write_nack_feedback;
    use crate::rtp::{Ssrc, RTP_EXT_ID_COLOR_SPACE, RTP_EXT_ID_DEPENDENCY_DESCRIPTOR};
    use video_common::round_up_to_multiple_of;

    const REMOTE_SSRC: Ssrc = 0x1234_5678;
    const LOCAL_SSRC: Ssrc = 0x9ABC_DEF0;

    const GENERIC_PT: PayloadType = 96;
    const H264_PT: PayloadType = 97;
    const RAW_PT: PayloadType = 98;
    const RED_PT: PayloadType = 99;
    const ULPFEC_PT: PayloadType = 100;

    // Generic payload descriptor bits.
    const KEY_AND_FIRST: u8 = 0x03;
    const FIRST: u8 = 0x02;
    const NEITHER: u8 = 0x00;

    // A descriptor carrying a one-template structure, and mandatory-only
    // descriptors referring back to it. Bytes 1-2 are the frame number.
    const DD_STRUCTURE_FRAME_5: &[u8] = &[0xC0, 0x00, 0x05, 0x80, 0x00, 0xE0];
    const DD_DELTA_FRAME_6: &[u8] = &[0xC0, 0x00, 0x06];
    const DD_DELTA_FRAME_7: &[u8] = &[0xC0, 0x00, 0x07];
    const DD_STALE_STRUCTURE_FRAME_3: &[u8] = &[0xC0, 0x00, 0x03, 0x80, 0x00, 0xE0];

    const SPS_NALU: &[u8] = &[0x67, 0x42, 0x00, 0x1E, 0x80];
    const PPS_NALU: &[u8] = &[0x68, 0xC0];
    const IDR_SLICE: &[u8] = &[0x65, 0xE0];

    #[derive(Clone, Default)]
    struct RecordingFrameSink {
        frames: Rc<RefCell<Vec<Frame>>>,
    }

    impl RecordingFrameSink {
        fn take_frames(&self) -> Vec<Frame> {
            self.frames.borrow_mut().drain(..).collect()
        }

        fn count(&self) -> usize {
            self.frames.borrow().len()
        }
    }

    impl VideoFrameSink for RecordingFrameSink {
        fn on_complete_frames(&mut self, mut frames: Vec<Frame>) {
            self.frames.borrow_mut().append(&mut frames);
        }
    }

    struct TestReceiver {
        receiver: VideoReceiver,
        feedback: RecordingSink,
        frames: RecordingFrameSink,
    }

    fn video_config() -> Config {
        Config {
            remote_ssrc: REMOTE_SSRC,
            local_ssrc: LOCAL_SSRC,
            ..Config::default()
        }
    }

    fn receiver_with(config: Config) -> TestReceiver {
        let _ = env_logger::builder().is_test(true).try_init();
        let feedback = RecordingSink::default();
        let frames = RecordingFrameSink::default();
        let mut receiver =
            VideoReceiver::new(config, Box::new(feedback.clone()), Box::new(frames.clone()));
        receiver.start();
        TestReceiver {
            receiver,
            feedback,
            frames,
        }
    }

    fn rtp_packet(
        payload_type: PayloadType,
        seqnum: u16,
        timestamp: u32,
        marker: bool,
        extension: Option<(u8, &[u8])>,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut packet = vec![];
        packet.push(if extension.is_some() { 0x90 } else { 0x80 });
        packet.push((if marker { 0x80 } else { 0x00 }) | payload_type);
        packet.extend_from_slice(&seqnum.to_be_bytes());
        packet.extend_from_slice(&timestamp.to_be_bytes());
        packet.extend_from_slice(&REMOTE_SSRC.to_be_bytes());
        if let Some((id, data)) = extension {
            assert!(!data.is_empty() && data.len() <= 16);
            let padded = round_up_to_multiple_of::<4>(1 + data.len());
            packet.extend_from_slice(&0xBEDEu16.to_be_bytes());
            packet.extend_from_slice(&((padded / 4) as u16).to_be_bytes());
            packet.push((id << 4) | (data.len() as u8 - 1));
            packet.extend_from_slice(data);
            packet.resize(packet.len() + padded - 1 - data.len(), 0);
        }
        packet.extend_from_slice(payload);
        packet
    }

    fn red_wrapped(
        media_pt: PayloadType,
        seqnum: u16,
        timestamp: u32,
        marker: bool,
        media_payload: &[u8],
    ) -> Vec<u8> {
        let mut payload = vec![media_pt];
        payload.extend_from_slice(media_payload);
        rtp_packet(RED_PT, seqnum, timestamp, marker, None, &payload)
    }

    fn picture_ids(frames: &[Frame]) -> Vec<u64> {
        frames.iter().map(|frame| frame.picture_id).collect()
    }

    #[test]
    fn a_late_packet_completes_the_frame_and_counts_retransmits() {
        let mut t = receiver_with(Config {
            nack_history: Duration::from_secs(1),
            ..video_config()
        });
        t.receiver
            .add_receive_codec(GENERIC_PT, VideoCodec::Generic, HashMap::new(), false);
        let now = Instant::now();

        t.receiver
            .receive_packet(&rtp_packet(GENERIC_PT, 1, 3000, false, None, &[KEY_AND_FIRST, 1]), now);
        t.receiver
            .receive_packet(&rtp_packet(GENERIC_PT, 2, 3000, false, None, &[NEITHER, 2]), now);
        t.receiver
            .receive_packet(&rtp_packet(GENERIC_PT, 4, 3000, false, None, &[NEITHER, 4]), now);
        t.receiver
            .receive_packet(&rtp_packet(GENERIC_PT, 5, 3000, true, None, &[NEITHER, 5]), now);
        assert_eq!(0, t.frames.count());
        assert!(t
            .feedback
            .take_events()
            .contains(&FeedbackEvent::Nack(vec![3], true)));

        t.receiver
            .receive_packet(&rtp_packet(GENERIC_PT, 3, 3000, false, None, &[NEITHER, 3]), now);
        let frames = t.frames.take_frames();
        assert_eq!(1, frames.len());
        assert_eq!(1, frames[0].first_seqnum);
        assert_eq!(5, frames[0].last_seqnum);
        assert!(frames[0].is_keyframe());
        assert!(frames[0].times_nacked >= 1);
        assert_eq!(vec![1, 2, 3, 4, 5], frames[0].bitstream);
        assert_eq!(5, frames[0].packet_infos.len());
    }

    #[test]
    fn a_bad_buffer_size_override_falls_back_to_the_default() {
        let mut t = receiver_with(Config {
            packet_buffer_max_size_override: Some("1500".to_string()),
            ..video_config()
        });
        t.receiver
            .add_receive_codec(GENERIC_PT, VideoCodec::Generic, HashMap::new(), false);
        let now = Instant::now();
        for seqnum in 0..2000u16 {
            t.receiver.receive_packet(
                &rtp_packet(
                    GENERIC_PT,
                    seqnum,
                    u32::from(seqnum) * 3000,
                    true,
                    None,
                    &[KEY_AND_FIRST, seqnum as u8],
                ),
                now,
            );
        }
        assert_eq!(2000, t.frames.count());
        assert!(!t
            .feedback
            .take_events()
            .contains(&FeedbackEvent::KeyFrameRequest));
    }

    #[test]
    fn stale_dependency_structures_are_rejected() {
        let mut t = receiver_with(video_config());
        t.receiver
            .add_receive_codec(RAW_PT, VideoCodec::Av1, HashMap::new(), true);
        let now = Instant::now();

        t.receiver.receive_packet(
            &rtp_packet(
                RAW_PT,
                10,
                1000,
                true,
                Some((RTP_EXT_ID_DEPENDENCY_DESCRIPTOR, DD_STRUCTURE_FRAME_5)),
                &[1],
            ),
            now,
        );
        t.receiver.receive_packet(
            &rtp_packet(
                RAW_PT,
                11,
                2000,
                true,
                Some((RTP_EXT_ID_DEPENDENCY_DESCRIPTOR, DD_DELTA_FRAME_6)),
                &[2],
            ),
            now,
        );
        let frames = t.frames.take_frames();
        assert_eq!(2, frames.len());
        assert!(frames[0].is_keyframe());
        assert!(!frames[1].is_keyframe());

        // A key frame carrying a structure older than the current one.
        t.receiver.receive_packet(
            &rtp_packet(
                RAW_PT,
                12,
                3000,
                true,
                Some((RTP_EXT_ID_DEPENDENCY_DESCRIPTOR, DD_STALE_STRUCTURE_FRAME_3)),
                &[3],
            ),
            now,
        );
        assert_eq!(0, t.frames.count());
    }

    #[test]
    fn missing_structure_stashes_packets_and_throttles_requests() {
        let mut t = receiver_with(video_config());
        t.receiver
            .add_receive_codec(RAW_PT, VideoCodec::Av1, HashMap::new(), true);
        let now = Instant::now();

        t.receiver.receive_packet(
            &rtp_packet(
                RAW_PT,
                11,
                2000,
                true,
                Some((RTP_EXT_ID_DEPENDENCY_DESCRIPTOR, DD_DELTA_FRAME_6)),
                &[2],
            ),
            now,
        );
        assert_eq!(vec![FeedbackEvent::KeyFrameRequest], t.feedback.take_events());

        t.receiver.receive_packet(
            &rtp_packet(
                RAW_PT,
                12,
                2000,
                true,
                Some((RTP_EXT_ID_DEPENDENCY_DESCRIPTOR, DD_DELTA_FRAME_7)),
                &[3],
            ),
            now + Duration::from_millis(500),
        );
        assert_eq!(0, t.feedback.take_events().len());

        // The key frame finally arrives; the stashed packets replay in order.
        t.receiver.receive_packet(
            &rtp_packet(
                RAW_PT,
                10,
                1000,
                true,
                Some((RTP_EXT_ID_DEPENDENCY_DESCRIPTOR, DD_STRUCTURE_FRAME_5)),
                &[1],
            ),
            now + Duration::SECOND,
        );
        let frames = t.frames.take_frames();
        assert_eq!(vec![5, 6, 7], picture_ids(&frames));
    }

    #[test]
    fn h264_idr_without_parameter_sets_requests_a_key_frame() {
        let mut t = receiver_with(video_config());
        t.receiver
            .add_receive_codec(H264_PT, VideoCodec::H264, HashMap::new(), false);
        let now = Instant::now();

        t.receiver
            .receive_packet(&rtp_packet(H264_PT, 1, 3000, true, None, IDR_SLICE), now);
        assert_eq!(0, t.frames.count());
        assert_eq!(vec![FeedbackEvent::KeyFrameRequest], t.feedback.take_events());

        // With out-of-band parameter sets the same slice becomes decodable.
        t.receiver.remove_receive_codecs();
        let params = HashMap::from([(
            SPROP_PARAMETER_SETS.to_string(),
            format!("{},{}", STANDARD.encode(SPS_NALU), STANDARD.encode(PPS_NALU)),
        )]);
        t.receiver
            .add_receive_codec(H264_PT, VideoCodec::H264, params, false);
        t.receiver
            .receive_packet(&rtp_packet(H264_PT, 2, 6000, true, None, IDR_SLICE), now);

        let frames = t.frames.take_frames();
        assert_eq!(1, frames.len());
        assert!(frames[0].is_keyframe());
        let mut expected = vec![];
        for nalu in [SPS_NALU, PPS_NALU, IDR_SLICE] {
            expected.extend_from_slice(&[0, 0, 0, 1]);
            expected.extend_from_slice(nalu);
        }
        assert_eq!(expected, frames[0].bitstream);
    }

    #[test]
    fn red_wrapped_media_flows_and_fec_blocks_are_not_nacked() {
        let mut t = receiver_with(Config {
            nack_history: Duration::from_secs(1),
            red_payload_type: Some(RED_PT),
            ulpfec_payload_type: Some(ULPFEC_PT),
            ..video_config()
        });
        t.receiver
            .add_receive_codec(GENERIC_PT, VideoCodec::Generic, HashMap::new(), false);
        let now = Instant::now();

        t.receiver
            .receive_packet(&red_wrapped(GENERIC_PT, 1, 3000, true, &[KEY_AND_FIRST, 0xAA]), now);
        let frames = t.frames.take_frames();
        assert_eq!(1, frames.len());
        assert_eq!(vec![0xAA], frames[0].bitstream);

        // An FEC block occupies seqnum 2 and protects seqnum 1.
        let mut fec_payload = vec![ULPFEC_PT];
        fec_payload.extend_from_slice(&[
            0x00, 0x00, // E/L, PT recovery
            0x00, 0x01, // SN base
            0x00, 0x00, 0x00, 0x00, // TS recovery
            0x00, 0x00, // length recovery
            0x00, 0x00, // protection length
            0x80, 0x00, // mask
        ]);
        t.receiver
            .receive_packet(&rtp_packet(RED_PT, 2, 3000, false, None, &fec_payload), now);

        // Media on seqnum 3 would expose a gap at 2 if the FEC block had
        // not been counted.
        t.receiver
            .receive_packet(&red_wrapped(GENERIC_PT, 3, 6000, true, &[KEY_AND_FIRST, 0xBB]), now);
        assert_eq!(1, t.frames.take_frames().len());
        let events = t.feedback.take_events();
        assert!(events
            .iter()
            .all(|event| !matches!(event, FeedbackEvent::Nack(..))));
    }

    #[test]
    fn packets_not_for_the_stream_are_ignored() {
        let mut t = receiver_with(video_config());
        let now = Instant::now();

        // No codec registered for this payload type.
        t.receiver
            .receive_packet(&rtp_packet(GENERIC_PT, 1, 3000, true, None, &[KEY_AND_FIRST, 1]), now);

        // Right codec, wrong ssrc.
        t.receiver
            .add_receive_codec(GENERIC_PT, VideoCodec::Generic, HashMap::new(), false);
        let mut packet = rtp_packet(GENERIC_PT, 2, 6000, true, None, &[KEY_AND_FIRST, 2]);
        packet[8..12].copy_from_slice(&999u32.to_be_bytes());
        t.receiver.receive_packet(&packet, now);

        assert_eq!(0, t.frames.count());
        assert_eq!(0, t.feedback.take_events().len());
    }

    #[test]
    fn packets_are_only_admitted_while_receiving() {
        let feedback = RecordingSink::default();
        let frames = RecordingFrameSink::default();
        let mut receiver = VideoReceiver::new(
            video_config(),
            Box::new(feedback.clone()),
            Box::new(frames.clone()),
        );
        receiver.add_receive_codec(GENERIC_PT, VideoCodec::Generic, HashMap::new(), false);
        let now = Instant::now();
        let packet = rtp_packet(GENERIC_PT, 1, 3000, true, None, &[KEY_AND_FIRST, 1]);

        receiver.receive_packet(&packet, now);
        assert_eq!(0, frames.count());
        assert!(!receiver.is_receiving());

        receiver.start();
        receiver.receive_packet(&packet, now);
        assert_eq!(1, frames.count());

        receiver.stop();
        receiver.receive_packet(&rtp_packet(GENERIC_PT, 2, 6000, true, None, &[KEY_AND_FIRST, 2]), now);
        assert_eq!(1, frames.count());
    }

    #[test]
    fn buffer_overflow_resets_and_requests_a_key_frame() {
        let mut t = receiver_with(Config {
            packet_buffer_max_size_override: Some("4".to_string()),
            ..video_config()
        });
        t.receiver
            .add_receive_codec(GENERIC_PT, VideoCodec::Generic, HashMap::new(), false);
        let now = Instant::now();

        t.receiver
            .receive_packet(&rtp_packet(GENERIC_PT, 0, 3000, false, None, &[KEY_AND_FIRST, 0]), now);
        for seqnum in 1..4u16 {
            t.receiver.receive_packet(
                &rtp_packet(GENERIC_PT, seqnum, 3000, false, None, &[NEITHER, seqnum as u8]),
                now,
            );
        }
        assert!(t.receiver.last_received_rtp_timestamp().is_some());

        // A fifth packet of the same frame wraps around the ring.
        t.receiver
            .receive_packet(&rtp_packet(GENERIC_PT, 4, 3000, false, None, &[NEITHER, 4]), now);
        assert_eq!(0, t.frames.count());
        assert_eq!(vec![FeedbackEvent::KeyFrameRequest], t.feedback.take_events());
        assert!(t.receiver.last_received_rtp_timestamp().is_none());
    }

    #[test]
    fn padding_packets_keep_the_sequence_continuous() {
        let mut t = receiver_with(video_config());
        t.receiver
            .add_receive_codec(GENERIC_PT, VideoCodec::Generic, HashMap::new(), false);
        let now = Instant::now();

        t.receiver
            .receive_packet(&rtp_packet(GENERIC_PT, 0, 3000, true, None, &[KEY_AND_FIRST, 0]), now);
        t.receiver
            .receive_packet(&rtp_packet(GENERIC_PT, 1, 3000, false, None, &[]), now);
        t.receiver
            .receive_packet(&rtp_packet(GENERIC_PT, 2, 6000, true, None, &[FIRST, 2]), now);

        let frames = t.frames.take_frames();
        assert_eq!(2, frames.len());
        // The delta frame references the key frame, not the padding.
        assert_eq!(vec![0], frames[1].references);
    }

    #[test]
    fn color_space_persists_until_replaced() {
        let mut t = receiver_with(video_config());
        t.receiver
            .add_receive_codec(GENERIC_PT, VideoCodec::Generic, HashMap::new(), false);
        let now = Instant::now();

        t.receiver.receive_packet(
            &rtp_packet(
                GENERIC_PT,
                0,
                3000,
                true,
                Some((RTP_EXT_ID_COLOR_SPACE, &[1, 2, 3, 4])),
                &[KEY_AND_FIRST, 0],
            ),
            now,
        );
        t.receiver
            .receive_packet(&rtp_packet(GENERIC_PT, 1, 6000, true, None, &[FIRST, 1]), now);

        let frames = t.frames.take_frames();
        assert_eq!(2, frames.len());
        assert!(frames[0].color_space.is_some());
        assert_eq!(frames[0].color_space, frames[1].color_space);
    }

    #[test]
    fn loss_notifications_are_emitted_for_gaps() {
        let mut t = receiver_with(Config {
            lntf_enabled: true,
            ..video_config()
        });
        t.receiver
            .add_receive_codec(RAW_PT, VideoCodec::Av1, HashMap::new(), true);
        let now = Instant::now();

        t.receiver.receive_packet(
            &rtp_packet(
                RAW_PT,
                10,
                1000,
                true,
                Some((RTP_EXT_ID_DEPENDENCY_DESCRIPTOR, DD_STRUCTURE_FRAME_5)),
                &[1],
            ),
            now,
        );
        assert_eq!(1, t.frames.take_frames().len());
        t.feedback.take_events();

        // Seqnum 11 never arrives.
        t.receiver.receive_packet(
            &rtp_packet(
                RAW_PT,
                12,
                2000,
                true,
                Some((RTP_EXT_ID_DEPENDENCY_DESCRIPTOR, DD_DELTA_FRAME_6)),
                &[2],
            ),
            now,
        );
        let events = t.feedback.take_events();
        assert!(events.contains(&FeedbackEvent::LossNotification(10, 12, true, false)));
    }

    #[test]
    fn frame_decoded_prunes_receive_state() {
        let mut t = receiver_with(video_config());
        t.receiver
            .add_receive_codec(GENERIC_PT, VideoCodec::Generic, HashMap::new(), false);
        let now = Instant::now();
        for seqnum in 0..3u16 {
            let descriptor = if seqnum == 0 { KEY_AND_FIRST } else { FIRST };
            t.receiver.receive_packet(
                &rtp_packet(
                    GENERIC_PT,
                    seqnum,
                    u32::from(seqnum) * 3000,
                    true,
                    None,
                    &[descriptor, seqnum as u8],
                ),
                now,
            );
        }
        assert_eq!(3, t.frames.take_frames().len());
        assert_eq!(3, t.receiver.packet_infos.len());

        t.receiver.frame_decoded(1);
        assert_eq!(1, t.receiver.packet_infos.len());
        assert_eq!(1, t.receiver.last_seqnum_by_picture_id.len());
    }

    #[test]
    fn sender_reports_are_captured_from_compound_rtcp() {
        let mut t = receiver_with(video_config());
        let now = Instant::now();

        let mut rtcp = vec![0x80, 200, 0, 6];
        rtcp.extend_from_slice(&REMOTE_SSRC.to_be_bytes());
        rtcp.extend_from_slice(&0x0011_2233_4455_6677u64.to_be_bytes());
        rtcp.extend_from_slice(&90_000u32.to_be_bytes());
        rtcp.extend_from_slice(&[0; 8]);
        t.receiver.deliver_rtcp(&rtcp, now);

        let (report, arrival) = t.receiver.last_sender_report().unwrap();
        assert_eq!(0x0011_2233_4455_6677, report.ntp_timestamp);
        assert_eq!(90_000, report.rtp_timestamp);
        assert_eq!(now, arrival);

        // Reports from other ssrcs are ignored.
        let mut other = vec![0x80, 200, 0, 6];
        other.extend_from_slice(&999u32.to_be_bytes());
        other.extend_from_slice(&[0; 20]);
        t.receiver.deliver_rtcp(&other, now + Duration::SECOND);
        assert_eq!(now, t.receiver.last_sender_report().unwrap().1);
    }

    #[test]
    fn tick_retransmits_stale_nacks() {
        let mut t = receiver_with(Config {
            nack_history: Duration::from_secs(1),
            ..video_config()
        });
        t.receiver
            .add_receive_codec(GENERIC_PT, VideoCodec::Generic, HashMap::new(), false);
        let now = Instant::now();

        t.receiver
            .receive_packet(&rtp_packet(GENERIC_PT, 0, 3000, true, None, &[KEY_AND_FIRST, 0]), now);
        t.receiver
            .receive_packet(&rtp_packet(GENERIC_PT, 2, 6000, true, None, &[FIRST, 2]), now);
        assert_eq!(vec![FeedbackEvent::Nack(vec![1], true)], t.feedback.take_events());

        // Not due for a resend yet: the default RTT has not passed.
        t.receiver.tick(now + Duration::from_millis(50));
        assert_eq!(0, t.feedback.take_events().len());

        t.receiver.tick(now + Duration::from_millis(200));
        assert_eq!(vec![FeedbackEvent::Nack(vec![1], true)], t.feedback.take_events());
    }

    #[test]
    fn frames_route_through_the_transform_seam() {
        let mut t = receiver_with(video_config());
        t.receiver
            .add_receive_codec(GENERIC_PT, VideoCodec::Generic, HashMap::new(), false);
        let (sender, transformed) = mpsc::channel();
        t.receiver.set_frame_transform(sender);
        let now = Instant::now();

        t.receiver
            .receive_packet(&rtp_packet(GENERIC_PT, 0, 3000, true, None, &[KEY_AND_FIRST, 0]), now);
        assert_eq!(0, t.frames.count());

        let frame = transformed.try_recv().unwrap();
        t.receiver.on_decrypted_frame(frame);
        assert_eq!(1, t.frames.count());
    }

    #[test]
    fn nack_feedback_reaches_the_rtcp_outbox() {
        let (outbox, inbox) = mpsc::channel();
        let frames = RecordingFrameSink::default();
        let mut receiver = VideoReceiver::with_rtcp_outbox(
            Config {
                nack_history: Duration::from_secs(1),
                ..video_config()
            },
            outbox,
            Box::new(frames.clone()),
        );
        receiver.add_receive_codec(GENERIC_PT, VideoCodec::Generic, HashMap::new(), false);
        receiver.start();
        let now = Instant::now();

        receiver.receive_packet(&rtp_packet(GENERIC_PT, 1, 3000, true, None, &[KEY_AND_FIRST, 1]), now);
        receiver.receive_packet(&rtp_packet(GENERIC_PT, 3, 6000, true, None, &[FIRST, 3]), now);

        let rtcp = inbox.try_recv().unwrap();
        assert_eq!(
            write_nack_feedback(LOCAL_SSRC, REMOTE_SSRC, [2u64].into_iter()),
            rtcp
        );
    }
}
