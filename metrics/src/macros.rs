//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

use std::{collections::HashSet, sync::Arc};

use parking_lot::Mutex;

use crate::reporter::{EventCountReporter, EventReport};

/// A global structure that contains a map to each of the registered reporters.
///
/// The mutex lock is only used once to register a new reporter, and then once by the report
/// generation.
pub struct Metrics {
    registry: Mutex<Registry>,
}

#[derive(Default)]
struct Registry {
    registered_names: HashSet<&'static str>,
    event_reporters: Vec<Arc<EventCountReporter>>,
}

#[derive(Debug)]
pub struct Report {
    pub events: Vec<EventReport>,
}

impl Metrics {
    pub(crate) fn new_enabled() -> Metrics {
        Metrics {
            registry: Default::default(),
        }
    }

    #[cfg(test)]
    pub fn clear(&self) {
        let mut registry = self.registry.lock();
        *registry = Default::default();
    }

    /// Locks the internal structure and adds a new event.
    pub fn create_and_register_event(&self, name: &'static str) -> Arc<EventCountReporter> {
        let event_reporter = Arc::new(EventCountReporter::new(name));

        let mut registry = self.registry.lock();

        if !registry.registered_names.insert(name) {
            panic!("The metric name \"{}\" has been used elsewhere.", name);
        }

        registry.event_reporters.push(Arc::clone(&event_reporter));
        event_reporter
    }

    /// Returns reports and resets event reporters sorted by name.
    ///
    /// The lock is open this whole time, but the only other use of the lock is registering new
    /// reporters.
    pub fn report(&self) -> Report {
        let registry = self.registry.lock();

        let mut events = registry
            .event_reporters
            .iter()
            .map(|reporter| reporter.report())
            .collect::<Vec<_>>();
        events.sort_unstable_by_key(|report| report.name());

        Report { events }
    }
}

#[macro_export]
macro_rules! event_reporter {
    ($name:expr) => {{
        static __REPORTER: once_cell::sync::Lazy<
            std::sync::Arc<$crate::EventCountReporter>,
        > = once_cell::sync::Lazy::new(|| $crate::__METRICS.create_and_register_event($name));

        &__REPORTER
    }};
}

#[macro_export]
macro_rules! event {
    ($name:expr) => {
        $crate::event_reporter!($name).count()
    };
}

#[macro_export]
macro_rules! metrics {
    () => {{
        &$crate::__METRICS
    }};
}
