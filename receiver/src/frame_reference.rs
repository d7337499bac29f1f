//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Orders assembled frames for the decoder. A frame is released only when
//! everything it depends on has been released: by declared dependency ids
//! when the stream carries a descriptor, otherwise by sequence-number
//! continuity within a group of pictures.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use log::*;
use video_common::KeySortedCache;

use crate::frame::{Frame, VideoFrameType};
use crate::rtp::{FullFrameNumber, FullSequenceNumber};

/// Frames whose dependencies have not arrived wait here; the oldest is
/// dropped past this.
pub const MAX_STASHED_FRAMES: usize = 100;
/// How many released frame ids are remembered in descriptor mode;
/// dependencies older than the window are assumed released.
const RELEASED_FRAME_HISTORY: usize = 100;
/// Groups of pictures older than this many packets are forgotten.
const MAX_GOP_HISTORY: u64 = 100;
/// Padding packets older than this many packets are forgotten.
const MAX_PADDING_HISTORY: u64 = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    Descriptor,
    SeqnumOnly,
}

pub struct FrameReferenceFinder {
    /// Added to every emitted picture id and reference so a new instance
    /// (after a codec switch) cannot collide with ids already handed out.
    picture_id_offset: FullFrameNumber,
    cleared_to_seqnum: Option<FullSequenceNumber>,
    mode: Option<Mode>,
    descriptor: DescriptorRefFinder,
    seqnum_only: SeqnumRefFinder,
}

impl FrameReferenceFinder {
    pub fn new(picture_id_offset: FullFrameNumber) -> Self {
        Self {
            picture_id_offset,
            cleared_to_seqnum: None,
            mode: None,
            descriptor: DescriptorRefFinder::default(),
            seqnum_only: SeqnumRefFinder::default(),
        }
    }

    /// Takes one assembled frame and returns every frame that is now ready
    /// for the decoder, in decode order.
    pub fn manage_frame(&mut self, frame: Frame) -> Vec<Frame> {
        if self
            .cleared_to_seqnum
            .is_some_and(|cleared| frame.first_seqnum < cleared)
        {
            // The decoder moved past this frame while it was buffered.
            return vec![];
        }

        let mode = if frame.generic.is_some() {
            Mode::Descriptor
        } else {
            Mode::SeqnumOnly
        };
        if self.mode != Some(mode) {
            // Descriptors appearing or disappearing mid-stream restart the
            // bookkeeping; ids from the two modes do not relate.
            self.descriptor = DescriptorRefFinder::default();
            self.seqnum_only = SeqnumRefFinder::default();
            self.mode = Some(mode);
        }

        let released = match mode {
            Mode::Descriptor => self.descriptor.manage_frame(frame),
            Mode::SeqnumOnly => self.seqnum_only.manage_frame(frame),
        };
        self.apply_offset(released)
    }

    /// Padding carries no frame data but advances sequence continuity, which
    /// may release stashed frames.
    pub fn padding_received(&mut self, seqnum: FullSequenceNumber) -> Vec<Frame> {
        match self.mode {
            Some(Mode::SeqnumOnly) => {
                let released = self.seqnum_only.padding_received(seqnum);
                self.apply_offset(released)
            }
            _ => vec![],
        }
    }

    /// Forgets stashed frames with first sequence number below `seqnum`.
    pub fn clear_to(&mut self, seqnum: FullSequenceNumber) {
        self.cleared_to_seqnum = Some(seqnum);
        self.descriptor.clear_to(seqnum);
        self.seqnum_only.clear_to(seqnum);
    }

    fn apply_offset(&self, mut frames: Vec<Frame>) -> Vec<Frame> {
        for frame in &mut frames {
            frame.picture_id += self.picture_id_offset;
            for reference in &mut frame.references {
                *reference += self.picture_id_offset;
            }
        }
        frames
    }
}

/// Release by declared dependencies: the frame's descriptor names the frame
/// ids it needs, and each of them must have been released already.
struct DescriptorRefFinder {
    released_frame_ids: KeySortedCache<FullFrameNumber, ()>,
    stashed_frames: VecDeque<Frame>,
}

impl Default for DescriptorRefFinder {
    fn default() -> Self {
        Self {
            released_frame_ids: KeySortedCache::new(RELEASED_FRAME_HISTORY),
            stashed_frames: VecDeque::new(),
        }
    }
}

impl DescriptorRefFinder {
    fn manage_frame(&mut self, mut frame: Frame) -> Vec<Frame> {
        if !self.dependencies_met(&frame) {
            if self.stashed_frames.len() >= MAX_STASHED_FRAMES {
                self.stashed_frames.pop_front();
            }
            self.stashed_frames.push_back(frame);
            return vec![];
        }
        self.release(&mut frame);
        let mut released = vec![frame];
        self.retry_stashed_frames(&mut released);
        released
    }

    fn dependencies_met(&self, frame: &Frame) -> bool {
        let Some(generic) = &frame.generic else {
            return true;
        };
        let oldest_tracked = self.released_frame_ids.iter().next().map(|(id, _)| *id);
        generic.frame_dependencies.iter().all(|dep| {
            if self.released_frame_ids.contains_key(dep) {
                return true;
            }
            // Tracking for older ids was discarded; assume those made it out.
            oldest_tracked.is_some_and(|oldest| *dep < oldest)
        })
    }

    fn release(&mut self, frame: &mut Frame) {
        if let Some(generic) = &frame.generic {
            frame.picture_id = generic.frame_id;
            frame.references = generic.frame_dependencies.clone();
            self.released_frame_ids.insert(generic.frame_id, ());
        }
    }

    fn retry_stashed_frames(&mut self, released: &mut Vec<Frame>) {
        let mut made_progress = true;
        while made_progress {
            made_progress = false;
            let mut index = 0;
            while index < self.stashed_frames.len() {
                let ready = self
                    .stashed_frames
                    .get(index)
                    .is_some_and(|frame| self.dependencies_met(frame));
                if !ready {
                    index += 1;
                    continue;
                }
                if let Some(mut frame) = self.stashed_frames.remove(index) {
                    self.release(&mut frame);
                    released.push(frame);
                    made_progress = true;
                }
            }
        }
    }

    fn clear_to(&mut self, seqnum: FullSequenceNumber) {
        self.stashed_frames
            .retain(|frame| frame.first_seqnum >= seqnum);
    }
}

struct GopInfo {
    /// Last sequence number of the newest frame released from this group.
    last_seqnum: FullSequenceNumber,
    /// Same, but padding packets advance it too.
    last_seqnum_with_padding: FullSequenceNumber,
}

enum FrameDecision {
    HandOff,
    Stash,
    Drop,
}

/// Release by sequence continuity: without a descriptor, a delta frame is
/// decodable only if it directly extends the newest released frame of its
/// group of pictures. Picture ids are the frames' last sequence numbers.
struct SeqnumRefFinder {
    /// Keyed by each keyframe's last sequence number.
    gops: BTreeMap<FullSequenceNumber, GopInfo>,
    stashed_frames: VecDeque<Frame>,
    stashed_padding: BTreeSet<FullSequenceNumber>,
}

impl Default for SeqnumRefFinder {
    fn default() -> Self {
        Self {
            gops: BTreeMap::new(),
            stashed_frames: VecDeque::new(),
            stashed_padding: BTreeSet::new(),
        }
    }
}

impl SeqnumRefFinder {
    fn manage_frame(&mut self, mut frame: Frame) -> Vec<Frame> {
        match self.manage_frame_internal(&mut frame) {
            FrameDecision::HandOff => {
                let mut released = vec![frame];
                self.retry_stashed_frames(&mut released);
                released
            }
            FrameDecision::Stash => {
                if self.stashed_frames.len() >= MAX_STASHED_FRAMES {
                    self.stashed_frames.pop_front();
                }
                self.stashed_frames.push_back(frame);
                vec![]
            }
            FrameDecision::Drop => vec![],
        }
    }

    fn manage_frame_internal(&mut self, frame: &mut Frame) -> FrameDecision {
        if frame.frame_type.is_key() {
            // Keep the progress of a group we already track.
            self.gops.entry(frame.last_seqnum).or_insert(GopInfo {
                last_seqnum: frame.last_seqnum,
                last_seqnum_with_padding: frame.last_seqnum,
            });
        }
        if self.gops.is_empty() {
            // Nothing is decodable until the first keyframe.
            return FrameDecision::Stash;
        }

        self.prune_gops(frame.last_seqnum);

        // The group this frame belongs to starts at the newest keyframe at
        // or before it.
        let Some((_, gop)) = self.gops.range_mut(..=frame.last_seqnum).next_back() else {
            debug!(
                "frame [{}, {}] predates the oldest group of pictures; dropping",
                frame.first_seqnum, frame.last_seqnum
            );
            return FrameDecision::Drop;
        };

        let previous_frame_seqnum = gop.last_seqnum;
        if !frame.frame_type.is_key()
            && frame.first_seqnum.checked_sub(1) != Some(gop.last_seqnum_with_padding)
        {
            return FrameDecision::Stash;
        }
        gop.last_seqnum = frame.last_seqnum;
        gop.last_seqnum_with_padding = frame.last_seqnum;

        frame.picture_id = frame.last_seqnum;
        frame.references = if frame.frame_type.is_key() {
            vec![]
        } else {
            vec![previous_frame_seqnum]
        };

        self.advance_stashed_padding(frame.last_seqnum);
        FrameDecision::HandOff
    }

    fn padding_received(&mut self, seqnum: FullSequenceNumber) -> Vec<Frame> {
        let prune_to = seqnum.saturating_sub(MAX_PADDING_HISTORY);
        self.stashed_padding = self.stashed_padding.split_off(&prune_to);
        self.stashed_padding.insert(seqnum);
        self.advance_stashed_padding(seqnum);

        let mut released = vec![];
        self.retry_stashed_frames(&mut released);
        released
    }

    /// Extends the group containing `seqnum` over any stashed padding that
    /// directly follows its newest release.
    fn advance_stashed_padding(&mut self, seqnum: FullSequenceNumber) {
        let Some((_, gop)) = self.gops.range_mut(..=seqnum).next_back() else {
            return;
        };
        let mut next = gop.last_seqnum_with_padding + 1;
        while self.stashed_padding.remove(&next) {
            gop.last_seqnum_with_padding = next;
            next += 1;
        }
    }

    fn prune_gops(&mut self, newest_seqnum: FullSequenceNumber) {
        let prune_to = newest_seqnum.saturating_sub(MAX_GOP_HISTORY);
        while self.gops.len() > 1 {
            match self.gops.first_key_value() {
                Some((&oldest, _)) if oldest < prune_to => {
                    self.gops.pop_first();
                }
                _ => break,
            }
        }
    }

    fn retry_stashed_frames(&mut self, released: &mut Vec<Frame>) {
        let mut made_progress = true;
        while made_progress {
            made_progress = false;
            let mut index = 0;
            while index < self.stashed_frames.len() {
                let Some(mut frame) = self.stashed_frames.remove(index) else {
                    break;
                };
                match self.manage_frame_internal(&mut frame) {
                    FrameDecision::HandOff => {
                        released.push(frame);
                        made_progress = true;
                    }
                    FrameDecision::Stash => {
                        self.stashed_frames.insert(index, frame);
                        index += 1;
                    }
                    FrameDecision::Drop => {}
                }
            }
        }
    }

    fn clear_to(&mut self, seqnum: FullSequenceNumber) {
        self.stashed_frames
            .retain(|frame| frame.first_seqnum >= seqnum);
    }
}
