//! Required-type tracking and installation-record reconciliation
//!
//! For every extension kind the controller derives which provider types are
//! currently in use anywhere in the seed. That derived set drives the
//! `required` flag on the matching installation records in the management
//! cluster: a record is required iff at least one live object of its
//! (kind, type) exists.
//!
//! The derived index is a cache, never a source of truth. Recomputation
//! re-lists the live objects of a kind from the store, so any burst of
//! add/update/delete events collapses into one correct recomputation no
//! matter how the events were coalesced or reordered.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

use crate::extension::{distinct_types, ExtensionKind};
use crate::queue::RateLimitingQueue;
use crate::registry::InstallationKey;
use crate::store::{ExtensionStore, RecordStore};
use crate::worker::Reconciler;
use crate::Result;

/// Concurrency-safe index of the provider types in use per kind.
///
/// Readers (installation reconciles) and the per-kind writer (recomputation)
/// go through a single reader/writer lock; recomputation is infrequent
/// relative to reads, so one lock over the whole map is acceptable.
#[derive(Default)]
pub struct RequiredTypeTracker {
    kind_to_required_types: RwLock<HashMap<ExtensionKind, BTreeSet<String>>>,
}

impl RequiredTypeTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically replace the recorded type set for `kind`.
    ///
    /// Returns every type that was added or removed relative to the previous
    /// set, i.e. exactly the installation records whose `required` flag may
    /// now be stale.
    pub async fn replace(&self, kind: ExtensionKind, types: BTreeSet<String>) -> Vec<String> {
        let mut index = self.kind_to_required_types.write().await;
        let previous = index.get(&kind).cloned().unwrap_or_default();
        let changed: Vec<String> = previous
            .symmetric_difference(&types)
            .cloned()
            .collect();
        index.insert(kind, types);
        changed
    }

    /// Whether at least one live object of (kind, type) was recorded
    pub async fn is_required(&self, kind: ExtensionKind, type_: &str) -> bool {
        self.kind_to_required_types
            .read()
            .await
            .get(&kind)
            .is_some_and(|types| types.contains(type_))
    }
}

/// Reconciliation logic keeping installation records in line with the
/// tracker
pub struct InstallationControl {
    seed: Arc<dyn ExtensionStore>,
    records: Arc<dyn RecordStore>,
    tracker: RequiredTypeTracker,
    installation_queue: Arc<RateLimitingQueue<InstallationKey>>,
}

impl InstallationControl {
    /// Create the control around its collaborators and the shared
    /// installation queue
    pub fn new(
        seed: Arc<dyn ExtensionStore>,
        records: Arc<dyn RecordStore>,
        installation_queue: Arc<RateLimitingQueue<InstallationKey>>,
    ) -> Self {
        Self {
            seed,
            records,
            tracker: RequiredTypeTracker::new(),
            installation_queue,
        }
    }

    /// Recompute the in-use type set for `kind` from the live object store.
    ///
    /// The triggering key only says "something of this kind changed"; the
    /// actual truth is re-derived by listing. The stored set is replaced
    /// before the diff is enqueued so installation reconciles triggered by
    /// the diff always read the new set.
    #[instrument(skip(self), fields(kind = %kind))]
    pub async fn on_extension_kind_changed(&self, kind: ExtensionKind) -> Result<()> {
        let objects = self.seed.list(kind).await?;
        let types = distinct_types(&objects);
        debug!(types = ?types, objects = objects.len(), "recomputed in-use types");

        for type_ in self.tracker.replace(kind, types).await {
            info!(%type_, "in-use types changed, scheduling installation reconcile");
            self.installation_queue.add(InstallationKey::new(kind, type_));
        }
        Ok(())
    }

    /// Converge one installation record's `required` flag onto the tracker.
    ///
    /// A missing record is a successful no-op (there is nothing to flag);
    /// a record already carrying the right flag is left untouched.
    #[instrument(skip(self), fields(installation = %key))]
    pub async fn reconcile_installation(&self, key: InstallationKey) -> Result<()> {
        let want = self.tracker.is_required(key.kind, &key.type_).await;

        match self.records.installation_required(key.kind, &key.type_).await? {
            None => {
                debug!("no installation record registered, nothing to flag");
                Ok(())
            }
            Some(current) if current == want => {
                debug!(required = want, "installation record already correct");
                Ok(())
            }
            Some(_) => {
                info!(required = want, "patching installation record");
                self.records
                    .patch_installation_required(key.kind, &key.type_, want)
                    .await
            }
        }
    }
}

/// Adapter draining a required-type queue into
/// [`InstallationControl::on_extension_kind_changed`].
///
/// The queue is keyed by the kind, so the queue's at-most-one-in-flight
/// guarantee serializes recomputations of one kind: a stale listing can
/// never replace the tracker after a fresher one.
pub struct KindChangedReconciler {
    control: Arc<InstallationControl>,
}

impl KindChangedReconciler {
    /// Create the adapter
    pub fn new(control: Arc<InstallationControl>) -> Self {
        Self { control }
    }
}

#[async_trait]
impl Reconciler<ExtensionKind> for KindChangedReconciler {
    async fn reconcile(&self, kind: ExtensionKind) -> Result<()> {
        self.control.on_extension_kind_changed(kind).await
    }
}

/// Adapter draining the shared installation queue into
/// [`InstallationControl::reconcile_installation`]
pub struct InstallationReconciler {
    control: Arc<InstallationControl>,
}

impl InstallationReconciler {
    /// Create the adapter
    pub fn new(control: Arc<InstallationControl>) -> Self {
        Self { control }
    }
}

#[async_trait]
impl Reconciler<InstallationKey> for InstallationReconciler {
    async fn reconcile(&self, key: InstallationKey) -> Result<()> {
        self.control.reconcile_installation(key).await
    }
}
