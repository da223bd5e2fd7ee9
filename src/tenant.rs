//! Tenant resolution for extension namespaces
//!
//! Every tenant-owned extension object lives in a namespace that maps back
//! to exactly one tenant record. Resolution is an external concern (the
//! management cluster knows the mapping); this module defines the boundary
//! trait and a read-through cache over it, since the mapping is stable for
//! the lifetime of a namespace.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::Result;

/// The tenant owning a set of seed namespaces
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tenant {
    /// Unique tenant identifier, keys the persisted snapshot
    pub name: String,
}

impl Tenant {
    /// Create a tenant with the given identifier
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Resolves the tenant owning a seed namespace.
///
/// `Ok(None)` means the namespace is not part of any tracked tenant (system
/// namespaces, foreign workloads); callers skip such objects without error.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TenantRetriever: Send + Sync {
    /// Resolve the owning tenant for `namespace`
    async fn resolve(&self, namespace: &str) -> Result<Option<Tenant>>;
}

/// Read-through cache over an inner [`TenantRetriever`].
///
/// Only successful resolutions are cached: a namespace without a tenant may
/// gain one later (tenant creation races object creation), and transient
/// errors must stay retryable.
pub struct CachedTenantRetriever {
    inner: Arc<dyn TenantRetriever>,
    cache: RwLock<HashMap<String, Tenant>>,
}

impl CachedTenantRetriever {
    /// Wrap `inner` with a namespace-keyed cache
    pub fn new(inner: Arc<dyn TenantRetriever>) -> Self {
        Self {
            inner,
            cache: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl TenantRetriever for CachedTenantRetriever {
    async fn resolve(&self, namespace: &str) -> Result<Option<Tenant>> {
        if let Some(tenant) = self.cache.read().await.get(namespace) {
            return Ok(Some(tenant.clone()));
        }

        let resolved = self.inner.resolve(namespace).await?;
        if let Some(tenant) = &resolved {
            debug!(namespace, tenant = %tenant.name, "caching tenant resolution");
            self.cache
                .write()
                .await
                .insert(namespace.to_string(), tenant.clone());
        }
        Ok(resolved)
    }
}
