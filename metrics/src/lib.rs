//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

use once_cell::sync::Lazy;

use crate::macros::Metrics;

pub static __METRICS: Lazy<Metrics> = Lazy::new(Metrics::new_enabled);

pub use crate::reporter::{EventCountReporter, EventReport};

#[macro_use]
mod macros;
mod reporter;
