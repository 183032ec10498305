//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (bound addresses, shared port)
//!     → workers.rs (round-robin pick, sticky worker thread)
//!     → connection.rs (connection id, drain guard)
//!     → Hand off to handshake and dispatch loop
//!
//! Task States:
//!     Accepted → Handshaking → Dispatching → Draining → Closed
//! ```
//!
//! # Design Decisions
//! - Each connection task is counted by the drain tracker for its whole life
//! - Cancellation flows root → worker → connection → query

pub mod connection;
pub mod listener;
pub mod workers;

pub use connection::{ConnectionId, DrainGuard, DrainTracker};
pub use listener::{Listener, ListenerError};
pub use workers::WorkerPool;
