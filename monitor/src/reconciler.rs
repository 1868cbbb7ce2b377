//! Status reconciliation between polled snapshots and the event stream
//!
//! Two sources describe the same instance:
//! - snapshots fetched from the agent on load, on every poll and after every
//!   reconnect; they carry the transfer and maintenance flags
//! - `StatusChanged` events pushed over the live session; they carry only
//!   the status
//!
//! While a session is connected its pushed status is authoritative and is
//! laid over any snapshot that lands later in the same session. Once the
//! session drops the pushed status is forgotten and the next snapshot wins.
//! Fetch responses are ticketed so that a slow response to an old request
//! cannot overwrite a newer one.

use crate::store::LifecycleStore;
use crate::stream::{ConnectionState, StreamEvent};
use log::{debug, warn};
use shared::{InstanceSnapshot, InstanceStatus, SessionId};
use thiserror::Error;

/// Failure of a snapshot fetch. Always recoverable: the previous snapshot
/// stays in place and the next poll tries again.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("snapshot request timed out")]
    Timeout,
    #[error("agent rejected snapshot request: {0}")]
    Rejected(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("snapshot for {received} does not belong to {expected}")]
    InstanceMismatch { expected: String, received: String },
}

/// Orders fetch requests issued by one reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FetchTicket(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Unchanged,
    Updated,
    /// A new session started; flags must be re-read from a fresh snapshot.
    RefreshRequested,
}

pub struct Reconciler {
    store: LifecycleStore,
    pushed_status: Option<(SessionId, InstanceStatus)>,
    next_ticket: u64,
    applied_ticket: Option<FetchTicket>,
}

impl Reconciler {
    pub fn new(store: LifecycleStore) -> Self {
        Self {
            store,
            pushed_status: None,
            next_ticket: 1,
            applied_ticket: None,
        }
    }

    pub fn store(&self) -> &LifecycleStore {
        &self.store
    }

    /// Reserves a ticket for a fetch about to be issued.
    pub fn begin_fetch(&mut self) -> FetchTicket {
        let ticket = FetchTicket(self.next_ticket);
        self.next_ticket += 1;
        ticket
    }

    /// Status pushed during the live session, if any.
    fn live_status(&self) -> Option<&InstanceStatus> {
        let session = self.store.connection().active_session()?;
        match &self.pushed_status {
            Some((pushed_in, status)) if *pushed_in == session => Some(status),
            _ => None,
        }
    }

    /// Merges the outcome of a snapshot fetch.
    pub fn apply_fetch(
        &mut self,
        ticket: FetchTicket,
        result: Result<InstanceSnapshot, FetchError>,
    ) -> Result<ReconcileOutcome, FetchError> {
        let snapshot = result.map_err(|e| {
            warn!("Snapshot fetch failed, keeping previous snapshot: {}", e);
            e
        })?;

        let expected = self.store.instance_key();
        if snapshot.instance_key != expected {
            return Err(FetchError::InstanceMismatch {
                expected,
                received: snapshot.instance_key,
            });
        }

        if matches!(self.applied_ticket, Some(applied) if ticket < applied) {
            debug!("Ignoring snapshot for superseded fetch {:?}", ticket);
            return Ok(ReconcileOutcome::Unchanged);
        }
        self.applied_ticket = Some(ticket);

        let snapshot = match self.live_status() {
            Some(status) if *status != snapshot.status => {
                debug!(
                    "Snapshot says {} but live session pushed {}; keeping pushed status",
                    snapshot.status, status
                );
                snapshot.with_status(status.clone())
            }
            _ => snapshot,
        };

        self.store.replace_snapshot(snapshot);
        Ok(ReconcileOutcome::Updated)
    }

    /// Merges one stream event.
    pub fn handle_event(&mut self, event: &StreamEvent) -> ReconcileOutcome {
        match event {
            StreamEvent::ConnectionEstablished { session_id } => {
                self.pushed_status = None;
                self.store.set_connection(ConnectionState {
                    connected: true,
                    session_id: Some(*session_id),
                });
                ReconcileOutcome::RefreshRequested
            }

            StreamEvent::ConnectionLost { session_id, .. } => {
                self.pushed_status = None;
                self.store.set_connection(ConnectionState {
                    connected: false,
                    session_id: session_id.or(self.store.connection().session_id),
                });
                ReconcileOutcome::Updated
            }

            StreamEvent::StatusChanged { session_id, status } => {
                if self.store.connection().active_session() != Some(*session_id) {
                    debug!("Ignoring status {} from inactive session {}", status, session_id);
                    return ReconcileOutcome::Unchanged;
                }
                self.pushed_status = Some((*session_id, status.clone()));

                match self.store.snapshot() {
                    Some(current) if current.status == *status => ReconcileOutcome::Unchanged,
                    Some(current) => {
                        self.store.replace_snapshot(current.with_status(status.clone()));
                        ReconcileOutcome::Updated
                    }
                    // Held until the first snapshot lands; flags are unknown.
                    None => ReconcileOutcome::Unchanged,
                }
            }

            StreamEvent::ConsoleOutput { .. } => ReconcileOutcome::Unchanged,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reconciler() -> Reconciler {
        Reconciler::new(LifecycleStore::new("srv-1"))
    }

    fn snapshot(status: InstanceStatus) -> InstanceSnapshot {
        InstanceSnapshot::new("srv-1", status)
    }

    fn connect(reconciler: &mut Reconciler, id: u64) {
        let outcome = reconciler.handle_event(&StreamEvent::ConnectionEstablished {
            session_id: SessionId(id),
        });
        assert_eq!(outcome, ReconcileOutcome::RefreshRequested);
    }

    fn status_of(reconciler: &Reconciler) -> Option<InstanceStatus> {
        reconciler.store().snapshot().map(|s| s.status.clone())
    }

    #[test]
    fn test_stream_status_wins_while_connected() {
        let mut reconciler = reconciler();
        let ticket = reconciler.begin_fetch();
        reconciler
            .apply_fetch(ticket, Ok(snapshot(InstanceStatus::Suspended)))
            .unwrap();
        connect(&mut reconciler, 1);

        let outcome = reconciler.handle_event(&StreamEvent::StatusChanged {
            session_id: SessionId(1),
            status: InstanceStatus::Running,
        });

        assert_eq!(outcome, ReconcileOutcome::Updated);
        assert_eq!(status_of(&reconciler), Some(InstanceStatus::Running));
    }

    #[test]
    fn test_pushed_status_survives_later_snapshot_in_same_session() {
        let mut reconciler = reconciler();
        connect(&mut reconciler, 1);
        let ticket = reconciler.begin_fetch();

        reconciler.handle_event(&StreamEvent::StatusChanged {
            session_id: SessionId(1),
            status: InstanceStatus::Running,
        });
        assert_eq!(status_of(&reconciler), None);

        let mut fetched = snapshot(InstanceStatus::Suspended);
        fetched.is_node_under_maintenance = true;
        reconciler.apply_fetch(ticket, Ok(fetched)).unwrap();

        let current = reconciler.store().snapshot().unwrap();
        assert_eq!(current.status, InstanceStatus::Running);
        assert!(current.is_node_under_maintenance);
    }

    #[test]
    fn test_disconnect_retains_last_status() {
        let mut reconciler = reconciler();
        connect(&mut reconciler, 1);
        let ticket = reconciler.begin_fetch();
        reconciler
            .apply_fetch(ticket, Ok(snapshot(InstanceStatus::Installing)))
            .unwrap();

        reconciler.handle_event(&StreamEvent::ConnectionLost {
            session_id: Some(SessionId(1)),
            reason: "timeout".to_string(),
        });

        let state = reconciler.store().current();
        assert!(!state.connection.connected);
        assert_eq!(state.connection.session_id, Some(SessionId(1)));
        assert_eq!(state.status(), Some(&InstanceStatus::Installing));
    }

    #[test]
    fn test_snapshot_wins_after_disconnect() {
        let mut reconciler = reconciler();
        connect(&mut reconciler, 1);
        let first = reconciler.begin_fetch();
        reconciler
            .apply_fetch(first, Ok(snapshot(InstanceStatus::Installing)))
            .unwrap();
        reconciler.handle_event(&StreamEvent::StatusChanged {
            session_id: SessionId(1),
            status: InstanceStatus::Running,
        });
        reconciler.handle_event(&StreamEvent::ConnectionLost {
            session_id: Some(SessionId(1)),
            reason: "drop".to_string(),
        });

        let second = reconciler.begin_fetch();
        reconciler
            .apply_fetch(second, Ok(snapshot(InstanceStatus::Suspended)))
            .unwrap();
        assert_eq!(status_of(&reconciler), Some(InstanceStatus::Suspended));
    }

    #[test]
    fn test_status_push_does_not_touch_flags() {
        let mut reconciler = reconciler();
        connect(&mut reconciler, 1);
        let mut fetched = snapshot(InstanceStatus::Offline);
        fetched.is_transferring = true;
        let ticket = reconciler.begin_fetch();
        reconciler.apply_fetch(ticket, Ok(fetched)).unwrap();

        reconciler.handle_event(&StreamEvent::StatusChanged {
            session_id: SessionId(1),
            status: InstanceStatus::Running,
        });

        let current = reconciler.store().snapshot().unwrap();
        assert!(current.is_transferring);
        assert_eq!(current.status, InstanceStatus::Running);
    }

    #[test]
    fn test_fetch_failure_keeps_previous_snapshot() {
        let mut reconciler = reconciler();
        let ticket = reconciler.begin_fetch();
        reconciler
            .apply_fetch(ticket, Ok(snapshot(InstanceStatus::RestoringBackup)))
            .unwrap();

        let ticket = reconciler.begin_fetch();
        let result = reconciler.apply_fetch(ticket, Err(FetchError::Timeout));

        assert_eq!(result, Err(FetchError::Timeout));
        assert_eq!(status_of(&reconciler), Some(InstanceStatus::RestoringBackup));
    }

    #[test]
    fn test_superseded_fetch_is_ignored() {
        let mut reconciler = reconciler();
        let old = reconciler.begin_fetch();
        let new = reconciler.begin_fetch();

        reconciler
            .apply_fetch(new, Ok(snapshot(InstanceStatus::Running)))
            .unwrap();
        let outcome = reconciler
            .apply_fetch(old, Ok(snapshot(InstanceStatus::Installing)))
            .unwrap();

        assert_eq!(outcome, ReconcileOutcome::Unchanged);
        assert_eq!(status_of(&reconciler), Some(InstanceStatus::Running));
    }

    #[test]
    fn test_snapshot_for_other_instance_is_rejected() {
        let mut reconciler = reconciler();
        let ticket = reconciler.begin_fetch();
        let result = reconciler.apply_fetch(
            ticket,
            Ok(InstanceSnapshot::new("srv-2", InstanceStatus::Running)),
        );

        assert!(matches!(result, Err(FetchError::InstanceMismatch { .. })));
        assert_eq!(status_of(&reconciler), None);
    }

    #[test]
    fn test_status_from_inactive_session_is_ignored() {
        let mut reconciler = reconciler();
        let ticket = reconciler.begin_fetch();
        reconciler
            .apply_fetch(ticket, Ok(snapshot(InstanceStatus::Installing)))
            .unwrap();

        let outcome = reconciler.handle_event(&StreamEvent::StatusChanged {
            session_id: SessionId(4),
            status: InstanceStatus::Running,
        });

        assert_eq!(outcome, ReconcileOutcome::Unchanged);
        assert_eq!(status_of(&reconciler), Some(InstanceStatus::Installing));
    }

    #[test]
    fn test_reconnect_forgets_previous_push() {
        let mut reconciler = reconciler();
        connect(&mut reconciler, 1);
        reconciler.handle_event(&StreamEvent::StatusChanged {
            session_id: SessionId(1),
            status: InstanceStatus::Running,
        });
        connect(&mut reconciler, 2);

        let ticket = reconciler.begin_fetch();
        reconciler
            .apply_fetch(ticket, Ok(snapshot(InstanceStatus::Suspended)))
            .unwrap();
        assert_eq!(status_of(&reconciler), Some(InstanceStatus::Suspended));
    }
}
