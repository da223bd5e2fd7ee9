//! Error types for the trellis extension controller

use thiserror::Error;

/// Main error type for trellis operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Transient store/API error reading or writing a record
    #[error("store error: {0}")]
    Store(String),

    /// Target object vanished between enqueue and reconcile
    #[error("object gone: {0}")]
    ObjectGone(String),

    /// No tenant owns the namespace of the reconciled object
    #[error("no tenant for namespace: {0}")]
    TenantUnresolved(String),

    /// A queued key could not be parsed back into an object identity
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Event sources did not report initial sync within the startup timeout
    #[error("timeout waiting for extension event sources to sync")]
    CacheSyncTimeout,
}

impl Error {
    /// Create a transient store error with the given message
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create an object-gone error for the given key
    pub fn object_gone(key: impl Into<String>) -> Self {
        Self::ObjectGone(key.into())
    }

    /// Create a tenant-unresolved error for the given namespace
    pub fn tenant_unresolved(namespace: impl Into<String>) -> Self {
        Self::TenantUnresolved(namespace.into())
    }

    /// Create an invalid-key error with the given message
    pub fn invalid_key(msg: impl Into<String>) -> Self {
        Self::InvalidKey(msg.into())
    }

    /// Whether the worker runtime should treat this error as success.
    ///
    /// Benign errors (the object is gone, the owning tenant cannot be
    /// resolved) are logged and forgotten instead of retried; everything
    /// else is considered transient and re-enqueued with backoff.
    pub fn is_benign(&self) -> bool {
        matches!(self, Self::ObjectGone(_) | Self::TenantUnresolved(_))
    }
}
