//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

pub mod config;
pub mod depacketizer;
pub mod dependency_descriptor;
pub mod feedback;
pub mod frame;
pub mod frame_reference;
pub mod loss_notification;
pub mod packet_buffer;
pub mod receiver;
pub mod rtp;
