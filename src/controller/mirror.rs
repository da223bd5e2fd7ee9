//! Mirroring extension status into tenant snapshots
//!
//! Every tenant-owned extension object's observed status (opaque state blob
//! plus managed resource references) is mirrored into the owning tenant's
//! persisted snapshot, keyed by (kind, name, purpose). The snapshot is what
//! backup/restore and cluster migration replay, so entries are upserted and
//! never duplicated.
//!
//! An object that vanished between enqueue and reconcile is not an error and
//! does not purge its snapshot entry: absence from the seed must not erase
//! restore-relevant history. Snapshot cleanup belongs to the tenant
//! lifecycle, not to this reconciler.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use crate::extension::{ExtensionKind, ObjectKey};
use crate::store::{ExtensionStore, RecordStore, SnapshotEntry};
use crate::tenant::TenantRetriever;
use crate::worker::Reconciler;
use crate::Result;

/// Reconciliation logic mirroring one extension object into its tenant's
/// snapshot
pub struct StateMirrorControl {
    seed: Arc<dyn ExtensionStore>,
    records: Arc<dyn RecordStore>,
    tenants: Arc<dyn TenantRetriever>,
}

impl StateMirrorControl {
    /// Create the control around its collaborators
    pub fn new(
        seed: Arc<dyn ExtensionStore>,
        records: Arc<dyn RecordStore>,
        tenants: Arc<dyn TenantRetriever>,
    ) -> Self {
        Self {
            seed,
            records,
            tenants,
        }
    }

    /// Mirror the current status of (kind, key) into its tenant's snapshot.
    ///
    /// Re-reads the object, resolves the owning tenant, and upserts the
    /// snapshot entry, skipping the write entirely when the persisted entry
    /// already matches the observation, so repeated reconciles of an
    /// unchanged object write nothing.
    #[instrument(skip(self), fields(kind = %kind, object = %key))]
    pub async fn sync_extension_state(&self, kind: ExtensionKind, key: ObjectKey) -> Result<()> {
        let Some(object) = self.seed.get(kind, &key).await? else {
            // Gone between enqueue and reconcile; nothing to mirror.
            debug!("extension object no longer observable, skipping");
            return Ok(());
        };

        let Some(tenant) = self.tenants.resolve(&object.namespace).await? else {
            debug!("namespace belongs to no tracked tenant, skipping");
            return Ok(());
        };

        let entry = SnapshotEntry::from_object(&object);
        let current = self
            .records
            .snapshot_entry(&tenant.name, kind, &entry.name, entry.purpose.clone())
            .await?;
        if current.as_ref().is_some_and(|c| c.same_observation(&entry)) {
            debug!(tenant = %tenant.name, "snapshot entry already up to date");
            return Ok(());
        }

        info!(tenant = %tenant.name, purpose = ?entry.purpose, "updating tenant snapshot entry");
        self.records.upsert_snapshot_entry(&tenant.name, entry).await
    }
}

/// Adapter draining one kind's state-mirror queue into
/// [`StateMirrorControl::sync_extension_state`]
pub struct StateMirrorReconciler {
    control: Arc<StateMirrorControl>,
    kind: ExtensionKind,
}

impl StateMirrorReconciler {
    /// Create the per-kind adapter
    pub fn new(control: Arc<StateMirrorControl>, kind: ExtensionKind) -> Self {
        Self { control, kind }
    }
}

#[async_trait]
impl Reconciler<ObjectKey> for StateMirrorReconciler {
    async fn reconcile(&self, key: ObjectKey) -> Result<()> {
        self.control.sync_extension_state(self.kind, key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extension::{ExtensionObject, ResourceRef};
    use crate::store::{MockExtensionStore, MockRecordStore};
    use crate::tenant::{MockTenantRetriever, Tenant};
    use mockall::predicate::eq;
    use serde_json::json;

    fn object() -> ExtensionObject {
        ExtensionObject {
            kind: ExtensionKind::Infrastructure,
            namespace: "shoot--dev--app".to_string(),
            name: "infra".to_string(),
            type_: "aws".to_string(),
            purpose: None,
            observed_state: Some(json!({"vpc": "vpc-1"})),
            observed_resources: vec![ResourceRef {
                name: "cloudprovider".to_string(),
                api_version: "v1".to_string(),
                kind: "Secret".to_string(),
                resource_name: "cloudprovider".to_string(),
            }],
        }
    }

    fn resolving_tenants() -> MockTenantRetriever {
        let mut tenants = MockTenantRetriever::new();
        tenants
            .expect_resolve()
            .with(eq("shoot--dev--app"))
            .returning(|_| Ok(Some(Tenant::new("garden-dev/app"))));
        tenants
    }

    fn control(
        seed: MockExtensionStore,
        records: MockRecordStore,
        tenants: MockTenantRetriever,
    ) -> StateMirrorControl {
        StateMirrorControl::new(Arc::new(seed), Arc::new(records), Arc::new(tenants))
    }

    #[tokio::test]
    async fn observed_status_is_upserted_under_the_tenant() {
        let mut seed = MockExtensionStore::new();
        seed.expect_get().returning(|_, _| Ok(Some(object())));

        let mut records = MockRecordStore::new();
        records
            .expect_snapshot_entry()
            .returning(|_, _, _, _| Ok(None));
        records
            .expect_upsert_snapshot_entry()
            .withf(|tenant, entry| {
                tenant == "garden-dev/app"
                    && entry.kind == ExtensionKind::Infrastructure
                    && entry.name == "infra"
                    && entry.state == Some(json!({"vpc": "vpc-1"}))
                    && entry.resources.len() == 1
            })
            .times(1)
            .returning(|_, _| Ok(()));

        control(seed, records, resolving_tenants())
            .sync_extension_state(ExtensionKind::Infrastructure, object().key())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unchanged_observation_writes_nothing() {
        let mut seed = MockExtensionStore::new();
        seed.expect_get().returning(|_, _| Ok(Some(object())));

        let mut records = MockRecordStore::new();
        records
            .expect_snapshot_entry()
            .returning(|_, _, _, _| Ok(Some(SnapshotEntry::from_object(&object()))));
        // No expect_upsert_snapshot_entry: a write would panic.

        control(seed, records, resolving_tenants())
            .sync_extension_state(ExtensionKind::Infrastructure, object().key())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn reordered_resources_do_not_trigger_a_write() {
        let mut stored = SnapshotEntry::from_object(&object());
        stored.resources = vec![
            ResourceRef {
                name: "b".to_string(),
                api_version: "v1".to_string(),
                kind: "Secret".to_string(),
                resource_name: "b".to_string(),
            },
            ResourceRef {
                name: "a".to_string(),
                api_version: "v1".to_string(),
                kind: "Secret".to_string(),
                resource_name: "a".to_string(),
            },
        ];
        let mut live = object();
        live.observed_resources = {
            let mut refs = stored.resources.clone();
            refs.reverse();
            refs
        };

        let mut seed = MockExtensionStore::new();
        seed.expect_get().returning(move |_, _| Ok(Some(live.clone())));

        let mut records = MockRecordStore::new();
        records
            .expect_snapshot_entry()
            .returning(move |_, _, _, _| Ok(Some(stored.clone())));

        control(seed, records, resolving_tenants())
            .sync_extension_state(ExtensionKind::Infrastructure, object().key())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn vanished_object_is_success_and_purges_nothing() {
        let mut seed = MockExtensionStore::new();
        seed.expect_get().returning(|_, _| Ok(None));

        // Neither tenant resolution nor any record access may happen.
        let records = MockRecordStore::new();
        let tenants = MockTenantRetriever::new();

        control(seed, records, tenants)
            .sync_extension_state(ExtensionKind::Infrastructure, object().key())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn untracked_namespace_is_skipped_without_error() {
        let mut seed = MockExtensionStore::new();
        seed.expect_get().returning(|_, _| Ok(Some(object())));

        let mut tenants = MockTenantRetriever::new();
        tenants.expect_resolve().returning(|_| Ok(None));

        control(seed, MockRecordStore::new(), tenants)
            .sync_extension_state(ExtensionKind::Infrastructure, object().key())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn store_errors_propagate_for_retry() {
        let mut seed = MockExtensionStore::new();
        seed.expect_get().returning(|_, _| Ok(Some(object())));

        let mut records = MockRecordStore::new();
        records
            .expect_snapshot_entry()
            .returning(|_, _, _, _| Ok(None));
        records
            .expect_upsert_snapshot_entry()
            .returning(|_, _| Err(crate::Error::store("optimistic lock conflict")));

        let err = control(seed, records, resolving_tenants())
            .sync_extension_state(ExtensionKind::Infrastructure, object().key())
            .await
            .unwrap_err();
        assert!(!err.is_benign());
    }

    #[tokio::test]
    async fn purpose_participates_in_the_snapshot_key() {
        let mut exposure = object();
        exposure.kind = ExtensionKind::ControlPlane;
        exposure.purpose = Some("exposure".to_string());
        let lookup = exposure.clone();

        let mut seed = MockExtensionStore::new();
        seed.expect_get()
            .returning(move |_, _| Ok(Some(lookup.clone())));

        let mut records = MockRecordStore::new();
        records
            .expect_snapshot_entry()
            .with(
                eq("garden-dev/app"),
                eq(ExtensionKind::ControlPlane),
                eq("infra"),
                eq(Some("exposure".to_string())),
            )
            .returning(|_, _, _, _| Ok(None));
        records
            .expect_upsert_snapshot_entry()
            .withf(|_, entry| entry.purpose.as_deref() == Some("exposure"))
            .times(1)
            .returning(|_, _| Ok(()));

        control(seed, records, resolving_tenants())
            .sync_extension_state(ExtensionKind::ControlPlane, exposure.key())
            .await
            .unwrap();
    }
}
