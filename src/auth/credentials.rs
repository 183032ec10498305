//! Auth key type and credential store implementations.

use arc_swap::ArcSwap;
use std::fmt;
use std::sync::Arc;

/// An authorization key presented by a client or required by the server.
///
/// An empty key means "no authorization configured".
#[derive(Clone, Default, PartialEq, Eq)]
pub struct AuthKey(String);

impl AuthKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// Keys never show up in logs.
impl fmt::Debug for AuthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("AuthKey(<none>)")
        } else {
            f.write_str("AuthKey(<redacted>)")
        }
    }
}

/// Read-only view of the authentication metadata.
///
/// Implementations may be updated concurrently by something outside the
/// gateway; callers must ask for [`CredentialStore::current`] on every check.
pub trait CredentialStore: Send + Sync + 'static {
    /// Latest snapshot of the required key.
    fn current(&self) -> Arc<AuthKey>;

    /// Check a presented key against the latest snapshot.
    fn validate(&self, presented: &AuthKey) -> bool {
        *self.current() == *presented
    }
}

/// Credential store backed by an atomically swappable key.
#[derive(Debug, Clone)]
pub struct SharedCredentials {
    inner: Arc<ArcSwap<AuthKey>>,
}

impl SharedCredentials {
    pub fn new(key: AuthKey) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(key)),
        }
    }

    /// Replace the required key. Handshakes already past validation are unaffected.
    pub fn update(&self, key: AuthKey) {
        let changed = *self.inner.load_full() != key;
        self.inner.store(Arc::new(key));
        if changed {
            tracing::info!("Auth key updated");
        }
    }
}

impl Default for SharedCredentials {
    fn default() -> Self {
        Self::new(AuthKey::default())
    }
}

impl CredentialStore for SharedCredentials {
    fn current(&self) -> Arc<AuthKey> {
        self.inner.load_full()
    }
}
