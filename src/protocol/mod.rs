//! Driver wire protocol.
//!
//! # Data Flow
//! ```text
//! Accepted TCP stream
//!     → handshake.rs (version marker, auth key, wire format)
//!     → version.rs (ProtocolVariant, fixed for the connection)
//!     → framing.rs (Framing strategy wrapped in WireCodec)
//!     → message.rs (payload → Query, Response → payload)
//! ```
//!
//! # Design Decisions
//! - All integers on the wire are little-endian
//! - The token lives in the frame so unparseable payloads can still be answered
//! - Framing is a runtime-selected strategy object, chosen once per connection

pub mod framing;
pub mod handshake;
pub mod message;
pub mod version;

pub use framing::{Framing, JsonFraming, PackedFraming, RawRequest, WireCodec, WireError};
pub use handshake::{negotiate, read_sized_string, HandshakeError, HandshakeLimits};
pub use message::{ParseError, Query, QueryType, Response, ResponseType};
pub use version::{ProtocolVariant, ProtocolVersion, WireFormat};
