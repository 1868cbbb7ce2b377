//! # Instance Monitor Library
//!
//! Client-side lifecycle and live-console monitoring for one managed
//! instance. The monitor attaches to the node agent's event stream, keeps a
//! consistent view of the instance's operational state, decides which
//! full-screen block (if any) the panel must show, and watches console
//! output for resource-exhaustion failures while the instance is not running.
//!
//! ## Architecture Overview
//!
//! Data flows one way through five components:
//!
//! ```text
//! network ──> stream ──> reconciler ──> store ──> view ──> render
//!                   └──> classifier ──> alert episode ──────┘
//! ```
//!
//! ### Event Stream (`stream`)
//! A [`stream::ConnectionHandle`] holds the connection level and session id
//! for the instance's channel and fans out named events to RAII
//! [`stream::Subscription`]s. Traffic from a stale session never gets past it.
//!
//! ### Lifecycle Store (`store`)
//! The single source of truth for rendering. Every write replaces the whole
//! state, so readers never see a torn update.
//!
//! ### Status Reconciler (`reconciler`)
//! Merges fetched snapshots with pushed status changes. The live session's
//! push is authoritative; snapshots carry the transfer and maintenance flags
//! and are re-fetched after every reconnect.
//!
//! ### Console Classifier (`classifier`)
//! Armed while the instance is connected and not running. Opens at most one
//! alert episode per instance on the first line matching a known
//! thread-exhaustion signature.
//!
//! ### View Selector (`view`)
//! Pure mapping from lifecycle state to one of the blocking screens or the
//! normal UI, in fixed precedence order.
//!
//! ## Usage Example
//!
//! ```rust
//! use monitor::classifier::ViewerCapability;
//! use monitor::instance::InstanceMonitor;
//! use monitor::view::LifecycleView;
//! use shared::{InstanceSnapshot, InstanceStatus, SessionId};
//!
//! let mut monitor = InstanceMonitor::new("srv-1", ViewerCapability::Standard);
//!
//! let ticket = monitor.begin_fetch();
//! monitor
//!     .apply_fetch(ticket, Ok(InstanceSnapshot::new("srv-1", InstanceStatus::Installing)))
//!     .unwrap();
//! assert_eq!(monitor.view(), LifecycleView::Installing);
//!
//! monitor.stream().establish(SessionId(1));
//! monitor.pump();
//! monitor.stream().push_status(SessionId(1), InstanceStatus::Running);
//! monitor.pump();
//! assert_eq!(monitor.view(), LifecycleView::PassThrough);
//! ```
//!
//! The network driver in [`network`] does the same against a real agent:
//! every datagram is fed to the stream and followed by a pump, and a pump
//! that reports a new session triggers a fresh snapshot fetch.

pub mod classifier;
pub mod instance;
pub mod network;
pub mod reconciler;
pub mod render;
pub mod store;
pub mod stream;
pub mod view;
