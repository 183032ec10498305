//! Credential checks for driver handshakes and HTTP sessions.
//!
//! # Data Flow
//! ```text
//! config (auth.auth_key) ──▶ SharedCredentials (ArcSwap<AuthKey>)
//!                                   ▲            │
//!           ConfigWatcher reload ───┘            ▼
//!                          handshake / HTTP open reads current()
//! ```
//!
//! # Design Decisions
//! - The store is read-only from the gateway's point of view
//! - Every check reads the latest snapshot; nothing caches a key past one check

pub mod credentials;

pub use credentials::{AuthKey, CredentialStore, SharedCredentials};
