//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! How feedback and frames leave the pipeline. The feedback produced while
//! processing one packet is coalesced and flushed once per pass.

use std::collections::BTreeSet;
use std::sync::mpsc;

use log::*;

use crate::config::KeyFrameRequestMethod;
use crate::frame::Frame;
use crate::rtp::rtcp::{write_fir, write_loss_notification, write_nack_feedback, write_pli};
use crate::rtp::{FullSequenceNumber, Ssrc};

/// Where complete, dependency-ordered frames leave the pipeline.
pub trait VideoFrameSink {
    fn on_complete_frames(&mut self, frames: Vec<Frame>);
}

/// Receiver-side RTCP feedback. `buffering_allowed` tells the sink whether
/// the message may wait for more feedback from the same processing pass.
pub trait VideoFeedbackSink {
    fn request_key_frame(&mut self);
    fn send_nack(&mut self, seqnums: &[FullSequenceNumber], buffering_allowed: bool);
    fn send_loss_notification(
        &mut self,
        last_decoded: FullSequenceNumber,
        last_received: FullSequenceNumber,
        decodability_flag: bool,
        buffering_allowed: bool,
    );
}

#[derive(Clone, Copy)]
struct LossNotificationState {
    last_decoded: FullSequenceNumber,
    last_received: FullSequenceNumber,
    decodability_flag: bool,
}

/// Coalesces the feedback from one packet-processing pass into one flush.
/// A key frame request makes any buffered NACKs redundant, so a flush sends
/// either the request or the NACK list, never both.
pub struct RtcpFeedbackBuffer {
    sink: Box<dyn VideoFeedbackSink>,
    request_key_frame: bool,
    nacks: BTreeSet<FullSequenceNumber>,
    lntf: Option<LossNotificationState>,
}

impl RtcpFeedbackBuffer {
    pub fn new(sink: Box<dyn VideoFeedbackSink>) -> Self {
        Self {
            sink,
            request_key_frame: false,
            nacks: BTreeSet::new(),
            lntf: None,
        }
    }

    pub fn request_key_frame(&mut self) {
        self.request_key_frame = true;
    }

    pub fn send_nack(
        &mut self,
        seqnums: impl IntoIterator<Item = FullSequenceNumber>,
        buffering_allowed: bool,
    ) {
        self.nacks.extend(seqnums);
        if !buffering_allowed {
            // Buffering is not allowed but batching is; previously buffered
            // feedback rides along.
            self.send_buffered_rtcp_feedback();
        }
    }

    pub fn send_loss_notification(
        &mut self,
        last_decoded: FullSequenceNumber,
        last_received: FullSequenceNumber,
        decodability_flag: bool,
        buffering_allowed: bool,
    ) {
        debug_assert!(buffering_allowed);
        debug_assert!(
            self.lntf.is_none(),
            "send_loss_notification called twice with no flush in between"
        );
        self.lntf = Some(LossNotificationState {
            last_decoded,
            last_received,
            decodability_flag,
        });
    }

    pub fn send_buffered_rtcp_feedback(&mut self) {
        let request_key_frame = std::mem::take(&mut self.request_key_frame);
        let nacks = std::mem::take(&mut self.nacks);
        let lntf = self.lntf.take();

        if let Some(lntf) = lntf {
            let buffering_allowed = request_key_frame || !nacks.is_empty();
            self.sink.send_loss_notification(
                lntf.last_decoded,
                lntf.last_received,
                lntf.decodability_flag,
                buffering_allowed,
            );
        }
        if request_key_frame {
            self.sink.request_key_frame();
        } else if !nacks.is_empty() {
            let nacks: Vec<FullSequenceNumber> = nacks.into_iter().collect();
            self.sink.send_nack(&nacks, true);
        }
    }
}

/// Serializes feedback into RTCP packets and posts them to the embedder's
/// outbox. Posting never blocks; a disconnected outbox drops feedback.
pub struct RtcpFeedbackWriter {
    sender_ssrc: Ssrc,
    media_ssrc: Ssrc,
    keyframe_request_method: KeyFrameRequestMethod,
    fir_command_seqnum: u8,
    outbox: mpsc::Sender<Vec<u8>>,
}

impl RtcpFeedbackWriter {
    pub fn new(
        sender_ssrc: Ssrc,
        media_ssrc: Ssrc,
        keyframe_request_method: KeyFrameRequestMethod,
        outbox: mpsc::Sender<Vec<u8>>,
    ) -> Self {
        Self {
            sender_ssrc,
            media_ssrc,
            keyframe_request_method,
            fir_command_seqnum: 0,
            outbox,
        }
    }

    fn post(&self, packet: Vec<u8>) {
        if self.outbox.send(packet).is_err() {
            debug!("rtcp outbox disconnected; dropping feedback");
        }
    }
}

impl VideoFeedbackSink for RtcpFeedbackWriter {
    fn request_key_frame(&mut self) {
        match self.keyframe_request_method {
            KeyFrameRequestMethod::Pli => self.post(write_pli(self.sender_ssrc, self.media_ssrc)),
            KeyFrameRequestMethod::Fir => {
                self.fir_command_seqnum = self.fir_command_seqnum.wrapping_add(1);
                self.post(write_fir(
                    self.sender_ssrc,
                    self.media_ssrc,
                    self.fir_command_seqnum,
                ));
            }
            KeyFrameRequestMethod::None => {
                debug!("no key frame request method configured; dropping request")
            }
        }
    }

    fn send_nack(&mut self, seqnums: &[FullSequenceNumber], _buffering_allowed: bool) {
        if seqnums.is_empty() {
            return;
        }
        self.post(write_nack_feedback(
            self.sender_ssrc,
            self.media_ssrc,
            seqnums.iter().copied(),
        ));
    }

    fn send_loss_notification(
        &mut self,
        last_decoded: FullSequenceNumber,
        last_received: FullSequenceNumber,
        decodability_flag: bool,
        _buffering_allowed: bool,
    ) {
        match write_loss_notification(
            self.sender_ssrc,
            self.media_ssrc,
            last_decoded,
            last_received,
            decodability_flag,
        ) {
            Some(packet) => self.post(packet),
            None => warn!(
                "loss notification for {last_decoded}..{last_received} does not fit; dropping"
            ),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub(crate) enum FeedbackEvent {
        KeyFrameRequest,
        Nack(Vec<FullSequenceNumber>, bool),
        LossNotification(FullSequenceNumber, FullSequenceNumber, bool, bool),
    }

    /// A sink that records calls for inspection; clone the handle before
    /// boxing.
    #[derive(Clone, Default)]
    pub(crate) struct RecordingSink {
        pub(crate) events: Rc<RefCell<Vec<FeedbackEvent>>>,
    }

    impl RecordingSink {
        pub(crate) fn take_events(&self) -> Vec<FeedbackEvent> {
            self.events.borrow_mut().drain(..).collect()
        }
    }

    impl VideoFeedbackSink for RecordingSink {
        fn request_key_frame(&mut self) {
            self.events.borrow_mut().push(FeedbackEvent::KeyFrameRequest);
        }

        fn send_nack(&mut self, seqnums: &[FullSequenceNumber], buffering_allowed: bool) {
            self.events
                .borrow_mut()
                .push(FeedbackEvent::Nack(seqnums.to_vec(), buffering_allowed));
        }

        fn send_loss_notification(
            &mut self,
            last_decoded: FullSequenceNumber,
            last_received: FullSequenceNumber,
            decodability_flag: bool,
            buffering_allowed: bool,
        ) {
            self.events.borrow_mut().push(FeedbackEvent::LossNotification(
                last_decoded,
                last_received,
                decodability_flag,
                buffering_allowed,
            ));
        }
    }

    pub(crate) fn buffer_with_recorder() -> (RtcpFeedbackBuffer, RecordingSink) {
        let recorder = RecordingSink::default();
        let buffer = RtcpFeedbackBuffer::new(Box::new(recorder.clone()));
        (buffer, recorder)
    }

    #[test]
    fn key_frame_request_suppresses_nacks() {
        let (mut buffer, recorder) = buffer_with_recorder();
        buffer.send_nack([5, 6], true);
        buffer.request_key_frame();
        buffer.send_buffered_rtcp_feedback();
        assert_eq!(vec![FeedbackEvent::KeyFrameRequest], recorder.take_events());

        // Flushing again sends nothing.
        buffer.send_buffered_rtcp_feedback();
        assert_eq!(Vec::<FeedbackEvent>::new(), recorder.take_events());
    }

    #[test]
    fn nacks_are_merged_and_sorted() {
        let (mut buffer, recorder) = buffer_with_recorder();
        buffer.send_nack([9, 7], true);
        buffer.send_nack([7, 8], true);
        buffer.send_buffered_rtcp_feedback();
        assert_eq!(
            vec![FeedbackEvent::Nack(vec![7, 8, 9], true)],
            recorder.take_events()
        );
    }

    #[test]
    fn unbuffered_nack_flushes_with_batching() {
        let (mut buffer, recorder) = buffer_with_recorder();
        buffer.request_key_frame();
        buffer.send_nack([4], false);
        // The earlier key frame request rode along and won.
        assert_eq!(vec![FeedbackEvent::KeyFrameRequest], recorder.take_events());
    }

    #[test]
    fn loss_notification_goes_first() {
        let (mut buffer, recorder) = buffer_with_recorder();
        buffer.send_loss_notification(10, 20, true, true);
        buffer.send_nack([15], true);
        buffer.send_buffered_rtcp_feedback();
        assert_eq!(
            vec![
                FeedbackEvent::LossNotification(10, 20, true, true),
                FeedbackEvent::Nack(vec![15], true),
            ],
            recorder.take_events()
        );

        // Alone, the notification is the last message of the flush.
        buffer.send_loss_notification(10, 21, false, true);
        buffer.send_buffered_rtcp_feedback();
        assert_eq!(
            vec![FeedbackEvent::LossNotification(10, 21, false, false)],
            recorder.take_events()
        );
    }

    #[test]
    fn writer_serializes_key_frame_requests() {
        use crate::rtp::rtcp;

        let (outbox, inbox) = mpsc::channel();
        let mut writer = RtcpFeedbackWriter::new(1, 2, KeyFrameRequestMethod::Pli, outbox);
        writer.request_key_frame();
        assert_eq!(rtcp::write_pli(1, 2), inbox.try_recv().unwrap());

        let (outbox, inbox) = mpsc::channel();
        let mut writer = RtcpFeedbackWriter::new(1, 2, KeyFrameRequestMethod::Fir, outbox);
        writer.request_key_frame();
        writer.request_key_frame();
        assert_eq!(rtcp::write_fir(1, 2, 1), inbox.try_recv().unwrap());
        assert_eq!(rtcp::write_fir(1, 2, 2), inbox.try_recv().unwrap());

        let (outbox, inbox) = mpsc::channel();
        let mut writer = RtcpFeedbackWriter::new(1, 2, KeyFrameRequestMethod::None, outbox);
        writer.request_key_frame();
        assert!(inbox.try_recv().is_err());
    }

    #[test]
    fn writer_serializes_nacks_and_loss_notifications() {
        use crate::rtp::rtcp;

        let (outbox, inbox) = mpsc::channel();
        let mut writer = RtcpFeedbackWriter::new(1, 2, KeyFrameRequestMethod::Pli, outbox);

        writer.send_nack(&[5, 6], true);
        assert_eq!(
            rtcp::write_nack_feedback(1, 2, [5u64, 6u64].into_iter()),
            inbox.try_recv().unwrap()
        );

        writer.send_nack(&[], true);
        assert!(inbox.try_recv().is_err());

        writer.send_loss_notification(100, 108, true, false);
        assert_eq!(
            rtcp::write_loss_notification(1, 2, 100, 108, true).unwrap(),
            inbox.try_recv().unwrap()
        );

        // A gap too large for the 15-bit delta is dropped.
        writer.send_loss_notification(0, 0x9000, true, false);
        assert!(inbox.try_recv().is_err());
    }
}
