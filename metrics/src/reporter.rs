//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

use std::sync::atomic::{AtomicUsize, Ordering};

/// Counts occurrences of one named event between reports.
pub struct EventCountReporter {
    name: &'static str,
    count: AtomicUsize,
}

impl EventCountReporter {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            count: AtomicUsize::new(0),
        }
    }

    pub fn count(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Grab the event count and reset to zero.
    pub fn report(&self) -> EventReport {
        EventReport {
            name: self.name,
            event_count: self.count.swap(0, Ordering::Relaxed),
        }
    }
}

#[derive(PartialEq, Eq, Debug)]
pub struct EventReport {
    name: &'static str,
    event_count: usize,
}

impl EventReport {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn event_count(&self) -> usize {
        self.event_count
    }
}
