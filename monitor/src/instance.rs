//! Per-instance monitor: the surface the UI layer talks to
//!
//! Wires the event stream, reconciler, store, classifier and view selector
//! together. All methods run on the caller's task; nothing here blocks or
//! spawns.

use crate::classifier::{AlertEpisode, ConsoleClassifier, MatchSink, ViewerCapability};
use crate::reconciler::{FetchError, FetchTicket, ReconcileOutcome, Reconciler};
use crate::store::{LifecycleState, LifecycleStore};
use crate::stream::{ConnectionHandle, EventKind, StreamEvent, Subscription};
use crate::view::{select_view, LifecycleView};
use log::debug;
use shared::InstanceSnapshot;

/// What a pump pass asks of the driver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpOutcome {
    pub events: usize,
    pub refresh_requested: bool,
}

pub struct InstanceMonitor {
    stream: ConnectionHandle,
    reconciler: Reconciler,
    classifier: ConsoleClassifier,
    events: Option<Subscription>,
}

impl InstanceMonitor {
    pub fn new(instance_key: impl Into<String>, capability: ViewerCapability) -> Self {
        let instance_key = instance_key.into();
        let classifier = ConsoleClassifier::new(instance_key.clone(), capability);
        Self::with_classifier(instance_key, classifier)
    }

    pub fn with_sink(
        instance_key: impl Into<String>,
        capability: ViewerCapability,
        sink: Box<dyn MatchSink>,
    ) -> Self {
        let instance_key = instance_key.into();
        let classifier = ConsoleClassifier::with_sink(instance_key.clone(), capability, sink);
        Self::with_classifier(instance_key, classifier)
    }

    fn with_classifier(instance_key: String, classifier: ConsoleClassifier) -> Self {
        let stream = ConnectionHandle::connect(instance_key.clone());
        // Console lines are taken for the monitor's whole lifetime, in the
        // same queue as lifecycle events, so their order survives a batch.
        let events = Some(stream.subscribe(&EventKind::ALL));

        Self {
            reconciler: Reconciler::new(LifecycleStore::new(instance_key)),
            stream,
            classifier,
            events,
        }
    }

    pub fn instance_key(&self) -> &str {
        self.stream.instance_key()
    }

    pub fn stream(&self) -> &ConnectionHandle {
        &self.stream
    }

    pub fn store(&self) -> &LifecycleStore {
        self.reconciler.store()
    }

    pub fn state(&self) -> LifecycleState {
        self.store().current()
    }

    pub fn view(&self) -> LifecycleView {
        select_view(&self.state())
    }

    pub fn alert(&self) -> Option<&AlertEpisode> {
        self.classifier.episode()
    }

    pub fn classifier(&self) -> &ConsoleClassifier {
        &self.classifier
    }

    pub fn dismiss_alert(&mut self) {
        self.classifier.dismiss();
    }

    pub fn begin_fetch(&mut self) -> FetchTicket {
        self.reconciler.begin_fetch()
    }

    pub fn apply_fetch(
        &mut self,
        ticket: FetchTicket,
        result: Result<InstanceSnapshot, FetchError>,
    ) -> Result<ReconcileOutcome, FetchError> {
        let outcome = self.reconciler.apply_fetch(ticket, result)?;
        self.sync_classifier();
        Ok(outcome)
    }

    fn sync_classifier(&mut self) {
        let state = self.store().current();
        self.classifier.follow(&state);
    }

    /// Processes every queued stream event in publish order.
    pub fn pump(&mut self) -> PumpOutcome {
        let mut outcome = PumpOutcome::default();
        let batch = match self.events.as_mut() {
            Some(subscription) => subscription.drain(),
            None => return outcome,
        };

        for event in batch {
            outcome.events += 1;
            match event {
                StreamEvent::ConsoleOutput { session_id, line } => {
                    self.classifier.observe(session_id, &line);
                }
                other => {
                    if self.reconciler.handle_event(&other) == ReconcileOutcome::RefreshRequested {
                        outcome.refresh_requested = true;
                    }
                    self.sync_classifier();
                }
            }
        }

        // First pass after construction: nothing was queued yet, arm anyway.
        if outcome.events == 0 {
            self.sync_classifier();
        }
        outcome
    }

    /// Revokes every subscription and closes the stream. Later transport
    /// traffic is ignored.
    pub fn shutdown(&mut self) {
        debug!("Shutting down monitor for {}", self.instance_key());
        self.events = None;
        self.classifier.disarm();
        self.stream.close();
    }

    pub fn is_shut_down(&self) -> bool {
        self.events.is_none()
    }
}

impl Drop for InstanceMonitor {
    fn drop(&mut self) {
        if !self.is_shut_down() {
            self.shutdown();
        }
    }
}
