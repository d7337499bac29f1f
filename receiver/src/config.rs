//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Per-stream receive configuration.

use log::*;
use video_common::Duration;

use crate::packet_buffer::PACKET_BUFFER_MAX_SIZE;
use crate::rtp::{PayloadType, Ssrc};

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, strum_macros::Display, strum_macros::EnumString,
)]
pub enum KeyFrameRequestMethod {
    /// Picture Loss Indication
    #[default]
    Pli,
    /// Full Intra Request
    Fir,
    /// Key frame requests are swallowed.
    None,
}

#[derive(Clone, Debug)]
pub struct Config {
    /// SSRC of the media stream to receive.
    pub remote_ssrc: Ssrc,
    /// SSRC feedback is sent from.
    pub local_ssrc: Ssrc,
    pub keyframe_request_method: KeyFrameRequestMethod,
    /// Loss notification feedback (LNTF).
    pub lntf_enabled: bool,
    /// How long the sender keeps packets available for retransmission.
    /// Zero disables NACK entirely.
    pub nack_history: Duration,
    pub red_payload_type: Option<PayloadType>,
    pub ulpfec_payload_type: Option<PayloadType>,
    /// Override for the reassembly buffer's maximum size in packets. Must
    /// name a power of two or the default is used.
    pub packet_buffer_max_size_override: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            remote_ssrc: 0,
            local_ssrc: 0,
            keyframe_request_method: KeyFrameRequestMethod::default(),
            lntf_enabled: false,
            nack_history: Duration::ZERO,
            red_payload_type: None,
            ulpfec_payload_type: None,
            packet_buffer_max_size_override: None,
        }
    }
}

impl Config {
    pub fn nack_enabled(&self) -> bool {
        self.nack_history > Duration::ZERO
    }

    pub fn packet_buffer_max_size(&self) -> usize {
        match self.packet_buffer_max_size_override.as_deref() {
            None => PACKET_BUFFER_MAX_SIZE,
            Some(configured) => match configured.parse::<usize>() {
                Ok(size) if size.is_power_of_two() => size,
                _ => {
                    warn!("invalid packet buffer max size: {configured}");
                    PACKET_BUFFER_MAX_SIZE
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_buffer_max_size_fallback() {
        let mut config = Config::default();
        assert_eq!(PACKET_BUFFER_MAX_SIZE, config.packet_buffer_max_size());

        config.packet_buffer_max_size_override = Some("1024".to_string());
        assert_eq!(1024, config.packet_buffer_max_size());

        for bad in ["1500", "0", "-4", "lots"] {
            config.packet_buffer_max_size_override = Some(bad.to_string());
            assert_eq!(PACKET_BUFFER_MAX_SIZE, config.packet_buffer_max_size());
        }
    }

    #[test]
    fn nack_enabled_by_history() {
        let mut config = Config::default();
        assert!(!config.nack_enabled());
        config.nack_history = Duration::from_millis(1000);
        assert!(config.nack_enabled());
    }
}
