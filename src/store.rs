//! External store interfaces consumed by the reconcilers
//!
//! The controller never talks to an API server directly. It reads extension
//! objects from the seed through [`ExtensionStore`] and writes installation
//! flags and tenant snapshots to the management cluster through
//! [`RecordStore`]. Both traits surface "not found" as `Ok(None)` so callers
//! can distinguish a vanished object from a transient failure.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[cfg(test)]
use mockall::automock;

use crate::extension::{ExtensionKind, ExtensionObject, ObjectKey, ResourceRef};
use crate::Result;

/// Read access to extension objects in the seed cluster.
///
/// Reconcilers always re-read through this trait instead of trusting event
/// payloads, so stale or coalesced events collapse into one correct read.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ExtensionStore: Send + Sync {
    /// Fetch one extension object; `Ok(None)` when it no longer exists
    async fn get(&self, kind: ExtensionKind, key: &ObjectKey) -> Result<Option<ExtensionObject>>;

    /// List all live extension objects of a kind across the seed
    async fn list(&self, kind: ExtensionKind) -> Result<Vec<ExtensionObject>>;
}

/// One mirrored extension status inside a tenant snapshot.
///
/// Snapshots hold at most one entry per (kind, name, purpose) key; writes
/// replace an existing entry rather than appending a duplicate.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct SnapshotEntry {
    /// Extension kind the entry was mirrored from
    pub kind: ExtensionKind,
    /// Name of the source extension object
    pub name: String,
    /// Optional discriminator carried into the snapshot key
    pub purpose: Option<String>,
    /// Last observed opaque provider state
    pub state: Option<Value>,
    /// Last observed managed resource references
    pub resources: Vec<ResourceRef>,
}

impl SnapshotEntry {
    /// Build the entry mirroring an extension object's observed status
    pub fn from_object(object: &ExtensionObject) -> Self {
        Self {
            kind: object.kind,
            name: object.name.clone(),
            purpose: object.purpose.clone(),
            state: object.observed_state.clone(),
            resources: object.observed_resources.clone(),
        }
    }

    /// Whether another entry mirrors the same observed status.
    ///
    /// State compares by value, resources order-insensitively, matching the
    /// update predicates on the event path.
    pub fn same_observation(&self, other: &SnapshotEntry) -> bool {
        let mut ours: Vec<&ResourceRef> = self.resources.iter().collect();
        let mut theirs: Vec<&ResourceRef> = other.resources.iter().collect();
        ours.sort();
        theirs.sort();
        self.state == other.state && ours == theirs
    }
}

/// Write access to installation records and tenant snapshots in the
/// management cluster.
///
/// `upsert_snapshot_entry` is a single atomic update; the implementation is
/// responsible for read-modify-write with optimistic-concurrency retry when
/// different kinds of the same tenant race.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Current `required` flag of the installation record for (kind, type);
    /// `Ok(None)` when no record exists
    async fn installation_required(&self, kind: ExtensionKind, type_: &str)
        -> Result<Option<bool>>;

    /// Patch the `required` flag of an existing installation record
    async fn patch_installation_required(
        &self,
        kind: ExtensionKind,
        type_: &str,
        required: bool,
    ) -> Result<()>;

    /// Current snapshot entry of a tenant for (kind, name, purpose);
    /// `Ok(None)` when the tenant has no entry under that key
    async fn snapshot_entry(
        &self,
        tenant: &str,
        kind: ExtensionKind,
        name: &str,
        purpose: Option<String>,
    ) -> Result<Option<SnapshotEntry>>;

    /// Replace-or-append a tenant's snapshot entry under its
    /// (kind, name, purpose) key
    async fn upsert_snapshot_entry(&self, tenant: &str, entry: SnapshotEntry) -> Result<()>;
}
