//! Event stream client for a single instance's real-time channel
//!
//! The network driver feeds transport happenings into a [`ConnectionHandle`];
//! the handle tracks the connection level and fans named events out to
//! subscribers. Delivery rules:
//! - events reach only subscribers whose kind set includes the event kind
//! - `StatusChanged` and `ConsoleOutput` are delivered only while connected,
//!   and only when stamped with the current session id
//! - connectivity is a level: a failed connect is reported as
//!   `ConnectionLost`, never as an error
//!
//! Subscriptions are RAII guards. Dropping a [`Subscription`] revokes it, so
//! a component that stops listening cannot leak a handler.

use log::{debug, info};
use shared::{InstanceStatus, SessionId};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;

/// Names of the events a subscriber can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ConnectionEstablished,
    ConnectionLost,
    StatusChanged,
    ConsoleOutput,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::ConnectionEstablished,
        EventKind::ConnectionLost,
        EventKind::StatusChanged,
        EventKind::ConsoleOutput,
    ];
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    ConnectionEstablished {
        session_id: SessionId,
    },
    ConnectionLost {
        session_id: Option<SessionId>,
        reason: String,
    },
    StatusChanged {
        session_id: SessionId,
        status: InstanceStatus,
    },
    ConsoleOutput {
        session_id: SessionId,
        line: String,
    },
}

impl StreamEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            StreamEvent::ConnectionEstablished { .. } => EventKind::ConnectionEstablished,
            StreamEvent::ConnectionLost { .. } => EventKind::ConnectionLost,
            StreamEvent::StatusChanged { .. } => EventKind::StatusChanged,
            StreamEvent::ConsoleOutput { .. } => EventKind::ConsoleOutput,
        }
    }

    pub fn session_id(&self) -> Option<SessionId> {
        match self {
            StreamEvent::ConnectionEstablished { session_id }
            | StreamEvent::StatusChanged { session_id, .. }
            | StreamEvent::ConsoleOutput { session_id, .. } => Some(*session_id),
            StreamEvent::ConnectionLost { session_id, .. } => *session_id,
        }
    }
}

/// Connection level as seen by consumers.
///
/// `session_id` keeps the last established session after a drop so that
/// consumers can tell a reconnect from a flicker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectionState {
    pub connected: bool,
    pub session_id: Option<SessionId>,
}

impl ConnectionState {
    /// The live session, if any.
    pub fn active_session(&self) -> Option<SessionId> {
        if self.connected {
            self.session_id
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: SubscriptionId,
    kinds: Vec<EventKind>,
    sender: mpsc::UnboundedSender<(u64, StreamEvent)>,
}

struct StreamInner {
    connection: ConnectionState,
    loss_reported: bool,
    closed: bool,
    next_subscription: u64,
    next_sequence: u64,
    subscribers: Vec<Subscriber>,
}

impl StreamInner {
    fn publish(&mut self, event: StreamEvent) -> usize {
        let kind = event.kind();
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        // Receivers that went away without dropping the guard are pruned here.
        self.subscribers.retain(|s| !s.sender.is_closed());

        let mut delivered = 0;
        for subscriber in self.subscribers.iter().filter(|s| s.kinds.contains(&kind)) {
            if subscriber.sender.send((sequence, event.clone())).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    fn is_current(&self, session_id: SessionId) -> bool {
        self.connection.active_session() == Some(session_id)
    }
}

/// Handle to one instance's event channel. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionHandle {
    instance_key: Arc<str>,
    inner: Arc<Mutex<StreamInner>>,
}

impl ConnectionHandle {
    /// Opens the event channel for `instance_key`. The handle starts
    /// disconnected; the transport reports the first session through
    /// [`ConnectionHandle::establish`].
    pub fn connect(instance_key: impl Into<String>) -> Self {
        let instance_key: String = instance_key.into();
        debug!("Opening event stream for instance {}", instance_key);

        Self {
            instance_key: Arc::from(instance_key),
            inner: Arc::new(Mutex::new(StreamInner {
                connection: ConnectionState::default(),
                loss_reported: false,
                closed: false,
                next_subscription: 1,
                next_sequence: 0,
                subscribers: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StreamInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn instance_key(&self) -> &str {
        &self.instance_key
    }

    pub fn connection(&self) -> ConnectionState {
        self.lock().connection
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Registers interest in `kinds`. The returned guard revokes itself on drop.
    pub fn subscribe(&self, kinds: &[EventKind]) -> Subscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut inner = self.lock();

        let id = SubscriptionId(inner.next_subscription);
        inner.next_subscription += 1;

        if !inner.closed {
            inner.subscribers.push(Subscriber {
                id,
                kinds: kinds.to_vec(),
                sender,
            });
        }

        Subscription {
            id,
            receiver,
            stream: Arc::downgrade(&self.inner),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Records a freshly established session and announces it.
    pub fn establish(&self, session_id: SessionId) {
        let mut inner = self.lock();
        if inner.closed || inner.is_current(session_id) {
            return;
        }

        info!(
            "Event stream for {} connected (session {})",
            self.instance_key, session_id
        );
        inner.connection = ConnectionState {
            connected: true,
            session_id: Some(session_id),
        };
        inner.loss_reported = false;
        inner.publish(StreamEvent::ConnectionEstablished { session_id });
    }

    /// Drops to the disconnected level. Reported once per outage, including
    /// an outage that began with a failed connect.
    pub fn lose(&self, reason: impl Into<String>) {
        let mut inner = self.lock();
        if inner.closed || (!inner.connection.connected && inner.loss_reported) {
            return;
        }

        let reason = reason.into();
        info!("Event stream for {} lost: {}", self.instance_key, reason);

        let session_id = inner.connection.session_id;
        inner.connection.connected = false;
        inner.loss_reported = true;
        inner.publish(StreamEvent::ConnectionLost { session_id, reason });
    }

    /// Delivers a pushed status change. Returns false when the event was
    /// dropped for belonging to a stale or disconnected session.
    pub fn push_status(&self, session_id: SessionId, status: InstanceStatus) -> bool {
        let mut inner = self.lock();
        if inner.closed || !inner.is_current(session_id) {
            debug!("Dropping status {} from stale session {}", status, session_id);
            return false;
        }
        inner.publish(StreamEvent::StatusChanged { session_id, status });
        true
    }

    /// Delivers one console line under the same session rules as statuses.
    pub fn push_console(&self, session_id: SessionId, line: impl Into<String>) -> bool {
        let mut inner = self.lock();
        if inner.closed || !inner.is_current(session_id) {
            return false;
        }
        inner.publish(StreamEvent::ConsoleOutput {
            session_id,
            line: line.into(),
        });
        true
    }

    /// Tears the channel down: revokes every subscription and ignores all
    /// later traffic.
    pub fn close(&self) {
        let mut inner = self.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;
        inner.connection.connected = false;
        inner.subscribers.clear();
        debug!("Event stream for {} closed", self.instance_key);
    }
}

/// A revocable registration on a [`ConnectionHandle`].
pub struct Subscription {
    id: SubscriptionId,
    receiver: mpsc::UnboundedReceiver<(u64, StreamEvent)>,
    stream: Weak<Mutex<StreamInner>>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Next queued event, without waiting.
    pub fn try_next(&mut self) -> Option<StreamEvent> {
        self.receiver.try_recv().ok().map(|(_, event)| event)
    }

    /// Drains everything queued so far, in receipt order.
    pub fn drain(&mut self) -> Vec<StreamEvent> {
        self.drain_sequenced()
            .into_iter()
            .map(|(_, event)| event)
            .collect()
    }

    /// Like [`Subscription::drain`], keeping the stream-wide publish sequence
    /// so that batches from several subscriptions can be merged in order.
    pub fn drain_sequenced(&mut self) -> Vec<(u64, StreamEvent)> {
        let mut events = Vec::new();
        while let Ok(delivery) = self.receiver.try_recv() {
            events.push(delivery);
        }
        events
    }

    pub async fn next(&mut self) -> Option<StreamEvent> {
        self.receiver.recv().await.map(|(_, event)| event)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.stream.upgrade() {
            let mut inner = inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            inner.subscribers.retain(|s| s.id != self.id);
        }
    }
}
