//! HTTP query endpoint.
//!
//! # Data Flow
//! ```text
//! HTTP request
//!     → server.rs (Axum setup, request ID, body limit)
//!     → request.rs (token + payload split)
//!     → session cache lookup / creation
//!     → query dispatch (one query per request)
//!     → request.rs (token + response JSON)
//! ```

pub mod error;
pub mod request;
pub mod server;

pub use error::HttpError;
pub use request::{UuidRequestId, X_AUTH_KEY, X_SESSION_ID};
pub use server::{build_router, HttpServer, HttpState};
