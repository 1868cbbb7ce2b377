//! # Node Agent Library
//!
//! The agent is the authoritative side of the instance monitor. It owns the
//! lifecycle record of every instance hosted on the node, answers snapshot
//! and reinstall requests, and pushes status changes and console output to
//! each attached monitor over its event stream session.
//!
//! ## Core Responsibilities
//!
//! ### Authoritative Lifecycle
//! Each instance follows a scripted scenario (install, transfer, suspension,
//! thread exhaustion and so on). The agent advances every scenario on a fixed
//! tick and is the only place an instance's status changes.
//!
//! ### Session Management
//! Every monitor that connects gets an opaque session id. Pushed events carry
//! the id of the session they were sent over, so a monitor can discard traffic
//! from a session it has already left. Silent monitors are dropped after a
//! timeout and a reconnect always gets a fresh id.
//!
//! ### Request Handling
//! Snapshot fetches and reinstall requests are plain request/response pairs
//! keyed by a monitor-chosen request id. They do not need a session.
//!
//! ## Module Organization
//!
//! ### Instance Module (`instance`)
//! - Scenario timelines and the instance registry
//! - Reinstall rules (refused while suspended, transferring or under maintenance)
//!
//! ### Session Manager Module (`session_manager`)
//! - Session id assignment, capacity and timeouts
//! - Routing lookups by address and instance
//!
//! ### Network Module (`network`)
//! - UDP socket management and bincode framing
//! - Receiver, sender and timeout tasks feeding one event loop
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use agent::instance::{InstanceRegistry, Scenario};
//! use agent::network::{Server, ServerConfig};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let mut instances = InstanceRegistry::new();
//!     instances.add("srv-1", Scenario::PidLimit);
//!
//!     let config = ServerConfig {
//!         tick_duration: Duration::from_millis(100),
//!         ..ServerConfig::default()
//!     };
//!     let mut server = Server::new(config, instances).await?;
//!
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod instance;
pub mod network;
pub mod session_manager;
