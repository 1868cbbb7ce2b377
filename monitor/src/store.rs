//! Lifecycle state store
//!
//! Single source of truth for rendering one instance. The whole
//! [`LifecycleState`] is swapped on every write through a `watch` channel, so
//! a reader never observes half of an update.

use crate::stream::ConnectionState;
use shared::{InstanceSnapshot, InstanceStatus};
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleState {
    pub instance_key: String,
    pub snapshot: Option<Arc<InstanceSnapshot>>,
    pub connection: ConnectionState,
}

impl LifecycleState {
    pub fn new(instance_key: impl Into<String>) -> Self {
        Self {
            instance_key: instance_key.into(),
            snapshot: None,
            connection: ConnectionState::default(),
        }
    }

    pub fn status(&self) -> Option<&InstanceStatus> {
        self.snapshot.as_ref().map(|s| &s.status)
    }

    pub fn is_running(&self) -> bool {
        self.status().map(InstanceStatus::is_running).unwrap_or(false)
    }
}

#[derive(Clone)]
pub struct LifecycleStore {
    sender: Arc<watch::Sender<LifecycleState>>,
}

impl LifecycleStore {
    pub fn new(instance_key: impl Into<String>) -> Self {
        let (sender, _) = watch::channel(LifecycleState::new(instance_key));
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Copy of the current state.
    pub fn current(&self) -> LifecycleState {
        self.sender.borrow().clone()
    }

    pub fn instance_key(&self) -> String {
        self.sender.borrow().instance_key.clone()
    }

    pub fn snapshot(&self) -> Option<Arc<InstanceSnapshot>> {
        self.sender.borrow().snapshot.clone()
    }

    pub fn connection(&self) -> ConnectionState {
        self.sender.borrow().connection
    }

    /// Receiver that wakes on every replacement.
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.sender.subscribe()
    }

    pub fn replace_snapshot(&self, snapshot: InstanceSnapshot) {
        let mut next = self.current();
        next.snapshot = Some(Arc::new(snapshot));
        self.sender.send_replace(next);
    }

    pub fn set_connection(&self, connection: ConnectionState) {
        let current = self.sender.borrow().connection;
        if current == connection {
            return;
        }
        let mut next = self.current();
        next.connection = connection;
        self.sender.send_replace(next);
    }

    /// Discards everything known about the instance.
    pub fn clear(&self) {
        let next = LifecycleState::new(self.instance_key());
        self.sender.send_replace(next);
    }
}
