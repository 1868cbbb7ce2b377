//! Stream session management for the node agent
//!
//! This module tracks every monitor attached to an instance's event stream:
//! - Session lifecycle (connect, disconnect, timeout)
//! - Opaque, never-reused session ids, so monitors can tell a reconnect
//!   from a flicker
//! - Address and instance lookups for routing pushed events
//! - Capacity limits
//!
//! A monitor reconnecting from the same address always gets a fresh id.

use log::info;
use rand::Rng;
use shared::SessionId;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(5);

/// One attached monitor.
#[derive(Debug)]
pub struct Session {
    /// Id stamped on every event pushed over this session
    pub id: SessionId,
    /// Network address for pushed events and responses
    pub addr: SocketAddr,
    /// Instance whose stream this session follows
    pub instance_key: String,
    /// Last time we received any packet from this monitor
    pub last_seen: Instant,
}

impl Session {
    pub fn new(id: SessionId, addr: SocketAddr, instance_key: impl Into<String>) -> Self {
        Self {
            id,
            addr,
            instance_key: instance_key.into(),
            last_seen: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Returns true if nothing arrived from the monitor within `timeout`.
    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

/// Manages all attached sessions.
pub struct SessionManager {
    sessions: HashMap<SessionId, Session>,
    next_session_id: u64,
    max_sessions: usize,
    timeout: Duration,
}

impl SessionManager {
    /// Creates a manager whose ids start at a random point, so ids from a
    /// restarted agent do not collide with ones a monitor still remembers.
    pub fn new(max_sessions: usize) -> Self {
        let first = rand::thread_rng().gen::<u64>() >> 1;
        Self::with_first_id(max_sessions, first)
    }

    pub fn with_first_id(max_sessions: usize, first: u64) -> Self {
        Self {
            sessions: HashMap::new(),
            next_session_id: first,
            max_sessions,
            timeout: DEFAULT_SESSION_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Attaches a monitor. Returns None when at capacity.
    pub fn add_session(&mut self, addr: SocketAddr, instance_key: &str) -> Option<SessionId> {
        if self.sessions.len() >= self.max_sessions {
            return None;
        }

        let id = SessionId(self.next_session_id);
        self.next_session_id = self.next_session_id.wrapping_add(1);

        info!(
            "Session {} opened from {} for instance {}",
            id, addr, instance_key
        );
        self.sessions
            .insert(id, Session::new(id, addr, instance_key));

        Some(id)
    }

    pub fn remove_session(&mut self, id: &SessionId) -> bool {
        if let Some(session) = self.sessions.remove(id) {
            info!("Session {} closed", session.id);
            true
        } else {
            false
        }
    }

    pub fn find_session_by_addr(&self, addr: SocketAddr) -> Option<SessionId> {
        self.sessions
            .values()
            .find(|session| session.addr == addr)
            .map(|session| session.id)
    }

    pub fn get(&self, id: &SessionId) -> Option<&Session> {
        self.sessions.get(id)
    }

    /// Marks the session at `addr` as alive. Returns false for unknown addresses.
    pub fn touch(&mut self, addr: SocketAddr) -> bool {
        match self.sessions.values_mut().find(|s| s.addr == addr) {
            Some(session) => {
                session.touch();
                true
            }
            None => false,
        }
    }

    /// Removes and returns the ids of sessions that went silent.
    pub fn check_timeouts(&mut self) -> Vec<SessionId> {
        let timeout = self.timeout;
        let timed_out: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|session| session.is_timed_out(timeout))
            .map(|session| session.id)
            .collect();

        for id in &timed_out {
            self.remove_session(id);
        }

        timed_out
    }

    /// Sessions following `instance_key`, for routing pushed events.
    pub fn sessions_for_instance(&self, instance_key: &str) -> Vec<(SessionId, SocketAddr)> {
        self.sessions
            .values()
            .filter(|session| session.instance_key == instance_key)
            .map(|session| (session.id, session.addr))
            .collect()
    }

    pub fn session_addrs(&self) -> Vec<(SessionId, SocketAddr)> {
        self.sessions
            .values()
            .map(|session| (session.id, session.addr))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_addr() -> SocketAddr {
        "127.0.0.1:8080".parse().unwrap()
    }

    fn test_addr2() -> SocketAddr {
        "127.0.0.1:8081".parse().unwrap()
    }

    #[test]
    fn test_session_creation() {
        let session = Session::new(SessionId(1), test_addr(), "srv-1");
        assert_eq!(session.id, SessionId(1));
        assert_eq!(session.addr, test_addr());
        assert_eq!(session.instance_key, "srv-1");
        assert!(!session.is_timed_out(Duration::from_secs(1)));
    }

    #[test]
    fn test_session_timeout() {
        let mut session = Session::new(SessionId(1), test_addr(), "srv-1");
        session.last_seen = Instant::now() - Duration::from_secs(10);
        assert!(session.is_timed_out(Duration::from_secs(5)));

        session.touch();
        assert!(!session.is_timed_out(Duration::from_secs(5)));
    }

    #[test]
    fn test_add_session_assigns_increasing_ids() {
        let mut manager = SessionManager::with_first_id(4, 100);
        let first = manager.add_session(test_addr(), "srv-1").unwrap();
        let second = manager.add_session(test_addr2(), "srv-1").unwrap();

        assert_eq!(first, SessionId(100));
        assert_eq!(second, SessionId(101));
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn test_add_session_max_capacity() {
        let mut manager = SessionManager::with_first_id(1, 1);
        assert!(manager.add_session(test_addr(), "srv-1").is_some());
        assert!(manager.add_session(test_addr2(), "srv-1").is_none());
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_reconnect_gets_new_id() {
        let mut manager = SessionManager::with_first_id(4, 7);
        let first = manager.add_session(test_addr(), "srv-1").unwrap();
        assert!(manager.remove_session(&first));

        let second = manager.add_session(test_addr(), "srv-1").unwrap();
        assert_ne!(first, second);
        assert_eq!(manager.find_session_by_addr(test_addr()), Some(second));
    }

    #[test]
    fn test_remove_nonexistent_session() {
        let mut manager = SessionManager::with_first_id(4, 1);
        assert!(!manager.remove_session(&SessionId(99)));
        assert!(manager.is_empty());
    }

    #[test]
    fn test_touch_unknown_address() {
        let mut manager = SessionManager::with_first_id(4, 1);
        assert!(!manager.touch(test_addr()));
        manager.add_session(test_addr(), "srv-1");
        assert!(manager.touch(test_addr()));
    }

    #[test]
    fn test_sessions_for_instance() {
        let mut manager = SessionManager::with_first_id(4, 1);
        let a = manager.add_session(test_addr(), "srv-1").unwrap();
        manager.add_session(test_addr2(), "srv-2").unwrap();

        let routed = manager.sessions_for_instance("srv-1");
        assert_eq!(routed, vec![(a, test_addr())]);
        assert!(manager.sessions_for_instance("srv-3").is_empty());
        assert_eq!(manager.session_addrs().len(), 2);
    }

    #[test]
    fn test_check_timeouts_removes_silent_sessions() {
        let mut manager =
            SessionManager::with_first_id(4, 1).with_timeout(Duration::from_millis(50));
        let stale = manager.add_session(test_addr(), "srv-1").unwrap();
        let fresh = manager.add_session(test_addr2(), "srv-1").unwrap();

        if let Some(session) = manager.sessions.get_mut(&stale) {
            session.last_seen = Instant::now() - Duration::from_secs(1);
        }

        let timed_out = manager.check_timeouts();
        assert_eq!(timed_out, vec![stale]);
        assert!(manager.get(&stale).is_none());
        assert!(manager.get(&fresh).is_some());
    }

    #[test]
    fn test_random_first_id_leaves_headroom() {
        let manager = SessionManager::new(1);
        assert!(manager.next_session_id < u64::MAX / 2 + 1);
    }
}
