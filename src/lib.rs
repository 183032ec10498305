//! Client-driver front end for a query server.
//!
//! Accepts driver connections over TCP and one-shot requests over HTTP,
//! negotiates the wire protocol, authenticates the client, and hands each
//! query to a [`QueryHandler`] backend.
//!
//! ```text
//!   driver ──TCP──▶ net::Listener ──▶ worker ──▶ protocol::negotiate
//!                                                  │
//!                                                  ▼
//!                                        query::ConnectionLoop ──▶ QueryHandler
//!
//!   browser ─HTTP─▶ http::server ──▶ session::ConnectionCache ──▶ QueryHandler
//! ```

pub mod auth;
pub mod config;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod protocol;
pub mod query;
pub mod server;
pub mod session;

pub use auth::{AuthKey, CredentialStore, SharedCredentials};
pub use config::GatewayConfig;
pub use lifecycle::Shutdown;
pub use query::{EchoQueryHandler, QueryError, QueryHandler, QueryId};
pub use server::{QueryServer, ServerError};
