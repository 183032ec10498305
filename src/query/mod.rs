//! Query dispatch.
//!
//! # Data Flow
//! ```text
//! Negotiated stream
//!     → connection_loop.rs (frame, admit, order)
//!     → handler.rs (QueryHandler backend)
//!     → connection_loop.rs (write response)
//! ```
//!
//! # Design Decisions
//! - The backend is a trait with an associated cache type, so each session's
//!   state is typed and owned by the gateway
//! - One dispatch loop per connection, no shared state between connections

pub mod connection_loop;
pub mod echo;
pub mod handler;

pub use connection_loop::{dispatch_one, ConnectionError, ConnectionLoop, LoopExit};
pub use echo::{EchoCache, EchoQueryHandler};
pub use handler::{QueryError, QueryHandler, QueryId};
