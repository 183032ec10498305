//! HTTP session state.
//!
//! Driver connections keep their query cache inside the dispatch loop; HTTP
//! clients get one per session, looked up by id on every request.

pub mod cache;
pub mod http_conn;

pub use cache::{CacheError, ConnectionCache};
pub use http_conn::HttpConn;
