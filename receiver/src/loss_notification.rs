//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Loss notification (LNTF) feedback: tells the sender the last frame we can
//! decode from and whether the stream is still decodable past a loss, so it
//! can repair with a cheaper recovery frame instead of a full key frame.

use log::*;
use video_common::KeySortedCache;

use crate::feedback::RtcpFeedbackBuffer;
use crate::rtp::{FullFrameNumber, FullSequenceNumber};

/// How many decodable frame ids are remembered; dependencies older than the
/// window are assumed decodable.
pub const FRAME_ID_HISTORY: usize = 100;

/// What the controller needs to know about a frame when its first packet
/// arrives. Only available when the packet carries a dependency node.
pub struct FrameDetails<'a> {
    pub is_keyframe: bool,
    pub frame_id: FullFrameNumber,
    pub frame_dependencies: &'a [FullFrameNumber],
}

pub struct LossNotificationController {
    last_received_seqnum: Option<FullSequenceNumber>,
    last_received_frame_id: Option<FullFrameNumber>,
    current_frame_potentially_decodable: bool,
    /// First seqnum of the last frame added to the decodable set.
    last_decodable_first_seqnum: Option<FullSequenceNumber>,
    decodable_frame_ids: KeySortedCache<FullFrameNumber, ()>,
}

impl LossNotificationController {
    pub fn new() -> Self {
        Self {
            last_received_seqnum: None,
            last_received_frame_id: None,
            current_frame_potentially_decodable: false,
            last_decodable_first_seqnum: None,
            decodable_frame_ids: KeySortedCache::new(FRAME_ID_HISTORY),
        }
    }

    /// Call for every received media packet, in order of arrival, skipping
    /// recovered packets. `frame` accompanies the first packet of a frame.
    pub fn on_received_packet(
        &mut self,
        seqnum: FullSequenceNumber,
        frame: Option<&FrameDetails>,
        feedback: &mut RtcpFeedbackBuffer,
    ) {
        // Repeated or reordered packets are ignored.
        if self.last_received_seqnum.is_some_and(|last| seqnum <= last) {
            return;
        }
        let seqnum_gap = self
            .last_received_seqnum
            .is_some_and(|last| seqnum != last + 1);
        self.last_received_seqnum = Some(seqnum);

        if let Some(frame) = frame {
            if self
                .last_received_frame_id
                .is_some_and(|last| frame.frame_id <= last)
            {
                warn!("repeated or reordered frame id {}", frame.frame_id);
                return;
            }
            self.last_received_frame_id = Some(frame.frame_id);

            if frame.is_keyframe {
                // Everything before the key frame stops mattering.
                self.decodable_frame_ids.clear();
                self.current_frame_potentially_decodable = true;
            } else {
                self.current_frame_potentially_decodable =
                    self.all_dependencies_decodable(frame.frame_dependencies);
            }
            if seqnum_gap || !self.current_frame_potentially_decodable {
                self.handle_loss(seqnum, self.current_frame_potentially_decodable, feedback);
            }
        } else if seqnum_gap || !self.current_frame_potentially_decodable {
            self.current_frame_potentially_decodable = false;
            // One lost frame may produce several notifications, one per
            // packet that exposes the loss.
            self.handle_loss(seqnum, false, feedback);
        }
    }

    /// Call when a frame assembles completely.
    pub fn on_assembled_frame(
        &mut self,
        first_seqnum: FullSequenceNumber,
        frame_id: FullFrameNumber,
        discardable: bool,
        frame_dependencies: &[FullFrameNumber],
    ) {
        if discardable {
            return;
        }
        if !self.all_dependencies_decodable(frame_dependencies) {
            return;
        }
        self.last_decodable_first_seqnum = Some(first_seqnum);
        self.decodable_frame_ids.insert(frame_id, ());
    }

    fn all_dependencies_decodable(&self, frame_dependencies: &[FullFrameNumber]) -> bool {
        let oldest_tracked = self.decodable_frame_ids.iter().next().map(|(id, _)| *id);
        frame_dependencies.iter().all(|dep| {
            if self.decodable_frame_ids.contains_key(dep) {
                return true;
            }
            // Tracking for ids older than the window was discarded; assume
            // those were decodable.
            oldest_tracked.is_some_and(|oldest| *dep < oldest)
        })
    }

    fn handle_loss(
        &mut self,
        last_received: FullSequenceNumber,
        decodability_flag: bool,
        feedback: &mut RtcpFeedbackBuffer,
    ) {
        match self.last_decodable_first_seqnum {
            Some(last_decoded) => {
                feedback.send_loss_notification(last_decoded, last_received, decodability_flag, true)
            }
            // Nothing to decode from yet.
            None => feedback.request_key_frame(),
        }
    }
}

impl Default for LossNotificationController {
    fn default() -> Self {
        Self::new()
    }
}
