//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Tracks gaps in the received sequence number space and schedules
//! retransmission requests, pacing resends by RTT.

use std::collections::{BTreeMap, BTreeSet};

use log::*;
use metrics::event;
use video_common::{Duration, Instant};

use super::FullSequenceNumber;
use crate::feedback::RtcpFeedbackBuffer;

/// Packets further than this behind the newest received seqnum are not worth
/// retransmitting.
pub const MAX_PACKET_AGE_TO_NACK: u64 = 450;
pub const MAX_NACK_PACKETS: usize = 1000;
pub const MAX_NACK_RETRIES: u8 = 10;
pub const DEFAULT_RTT: Duration = Duration::from_millis(100);
/// How often the owner should call [`NackRequester::process`].
pub const NACK_PROCESS_INTERVAL: Duration = Duration::from_millis(20);

struct NackInfo {
    /// Request once the newest received seqnum reaches this, to give
    /// reordered packets a chance to arrive on their own.
    send_at_seqnum: FullSequenceNumber,
    sent_at: Option<Instant>,
    retries: u8,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum NackFilter {
    SeqnumOnly,
    TimeOnly,
}

pub struct NackRequester {
    nacks: BTreeMap<FullSequenceNumber, NackInfo>,
    keyframes: BTreeSet<FullSequenceNumber>,
    recovered: BTreeSet<FullSequenceNumber>,
    newest_seqnum: Option<FullSequenceNumber>,
    rtt: Duration,
}

impl NackRequester {
    pub fn new() -> Self {
        Self {
            nacks: BTreeMap::new(),
            keyframes: BTreeSet::new(),
            recovered: BTreeSet::new(),
            newest_seqnum: None,
            rtt: DEFAULT_RTT,
        }
    }

    /// Returns how many times the packet was requested before it arrived.
    pub fn on_received_packet(
        &mut self,
        seqnum: FullSequenceNumber,
        is_keyframe: bool,
        is_recovered: bool,
        now: Instant,
        feedback: &mut RtcpFeedbackBuffer,
    ) -> u8 {
        let Some(newest_seqnum) = self.newest_seqnum else {
            self.newest_seqnum = Some(seqnum);
            if is_keyframe {
                self.keyframes.insert(seqnum);
            }
            return 0;
        };
        if seqnum == newest_seqnum {
            return 0;
        }
        if seqnum < newest_seqnum {
            // Out of order, possibly a retransmission we asked for.
            return self.nacks.remove(&seqnum).map_or(0, |info| info.retries);
        }

        if is_keyframe {
            self.keyframes.insert(seqnum);
        }
        self.keyframes = self
            .keyframes
            .split_off(&seqnum.saturating_sub(MAX_PACKET_AGE_TO_NACK));

        if is_recovered {
            self.recovered.insert(seqnum);
            self.recovered = self
                .recovered
                .split_off(&seqnum.saturating_sub(MAX_PACKET_AGE_TO_NACK));
            // Recovered packets were never sent on their own; the gap they
            // fill is still accounted for when the packets around them arrive.
            return 0;
        }

        self.add_packets_to_nack(newest_seqnum + 1, seqnum, feedback);
        self.newest_seqnum = Some(seqnum);

        let batch = self.get_nack_batch(now, NackFilter::SeqnumOnly);
        if !batch.is_empty() {
            // More feedback may come from the same pass; let it batch.
            feedback.send_nack(batch, true);
        }
        0
    }

    /// Periodic resend pass; anything whose last request is an RTT stale goes
    /// out again, immediately.
    pub fn process(&mut self, now: Instant, feedback: &mut RtcpFeedbackBuffer) {
        let batch = self.get_nack_batch(now, NackFilter::TimeOnly);
        if !batch.is_empty() {
            feedback.send_nack(batch, false);
        }
    }

    pub fn update_rtt(&mut self, rtt: Duration) {
        self.rtt = rtt;
    }

    /// Forgets everything below `seqnum`.
    pub fn clear_up_to(&mut self, seqnum: FullSequenceNumber) {
        self.nacks = self.nacks.split_off(&seqnum);
        self.keyframes = self.keyframes.split_off(&seqnum);
        self.recovered = self.recovered.split_off(&seqnum);
    }

    fn add_packets_to_nack(
        &mut self,
        seqnum_start: FullSequenceNumber,
        seqnum_end: FullSequenceNumber,
        feedback: &mut RtcpFeedbackBuffer,
    ) {
        self.nacks = self
            .nacks
            .split_off(&seqnum_end.saturating_sub(MAX_PACKET_AGE_TO_NACK));

        let num_new = seqnum_end - seqnum_start;
        if self.nacks.len() as u64 + num_new > MAX_NACK_PACKETS as u64 {
            while self.remove_packets_until_keyframe()
                && self.nacks.len() as u64 + num_new > MAX_NACK_PACKETS as u64
            {}
            if self.nacks.len() as u64 + num_new > MAX_NACK_PACKETS as u64 {
                self.nacks.clear();
                warn!("nack list full; clearing it and requesting a key frame");
                event!("video.nack.list_overflow");
                feedback.request_key_frame();
                return;
            }
        }

        for seqnum in seqnum_start..seqnum_end {
            if self.recovered.contains(&seqnum) {
                continue;
            }
            debug_assert!(!self.nacks.contains_key(&seqnum));
            self.nacks.insert(
                seqnum,
                NackInfo {
                    send_at_seqnum: seqnum,
                    sent_at: None,
                    retries: 0,
                },
            );
        }
    }

    /// Drops entries older than the oldest keyframe that still helps.
    /// Returns false when no keyframe can shrink the list.
    fn remove_packets_until_keyframe(&mut self) -> bool {
        while let Some(keyframe) = self.keyframes.first().copied() {
            let newer = self.nacks.split_off(&keyframe);
            let removed_any = !self.nacks.is_empty();
            self.nacks = newer;
            if removed_any {
                return true;
            }
            // This keyframe predates every outstanding nack; try the next.
            self.keyframes.remove(&keyframe);
        }
        false
    }

    fn get_nack_batch(&mut self, now: Instant, filter: NackFilter) -> Vec<FullSequenceNumber> {
        let consider_seqnum = filter != NackFilter::TimeOnly;
        let consider_time = filter != NackFilter::SeqnumOnly;
        let newest_seqnum = self.newest_seqnum.unwrap_or(0);
        let rtt = self.rtt;

        let mut batch = vec![];
        self.nacks.retain(|seqnum, info| {
            let resend_after_rtt = info
                .sent_at
                .map_or(true, |sent_at| now.saturating_duration_since(sent_at) >= rtt);
            let send_on_seqnum =
                info.sent_at.is_none() && newest_seqnum >= info.send_at_seqnum;
            if (consider_seqnum && send_on_seqnum) || (consider_time && resend_after_rtt) {
                batch.push(*seqnum);
                info.retries += 1;
                info.sent_at = Some(now);
                if info.retries >= MAX_NACK_RETRIES {
                    debug!("giving up on seqnum {seqnum} after {} requests", info.retries);
                    event!("video.nack.max_retries");
                    return false;
                }
            }
            true
        });
        batch
    }
}

impl Default for NackRequester {
    fn default() -> Self {
        Self::new()
    }
}
