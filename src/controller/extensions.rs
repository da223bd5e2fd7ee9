//! Extension controller wiring: registry, controls, and worker lifecycles
//!
//! The [`Controller`] owns the artifact registry, both reconciliation
//! controls, and every worker pool. `start` gates on initial cache sync of
//! all connected event sources and then launches the pools; `stop` shuts the
//! queues down and blocks until every worker has drained and exited.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::controller::mirror::{StateMirrorControl, StateMirrorReconciler};
use crate::controller::required::{
    InstallationControl, InstallationReconciler, KindChangedReconciler,
};
use crate::extension::ExtensionKind;
use crate::registry::{ArtifactRegistry, EventSource};
use crate::store::{ExtensionStore, RecordStore};
use crate::tenant::{CachedTenantRetriever, TenantRetriever};
use crate::worker::{run_workers, WorkerPool};
use crate::Result;

/// Tunables for the extension controller
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ControllerConfig {
    /// Workers per installation-related queue (the shared installation queue
    /// and each per-kind required-type queue)
    pub installation_workers: usize,
    /// Workers per state-mirror queue
    pub mirror_workers: usize,
    /// How long startup may wait for event sources to report initial sync
    #[serde(with = "duration_secs")]
    pub cache_sync_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            installation_workers: 1,
            mirror_workers: 2,
            cache_sync_timeout: Duration::from_secs(120),
        }
    }
}

mod duration_secs {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> std::result::Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

/// The extension reconciliation controller
pub struct Controller {
    registry: ArtifactRegistry,
    installation_control: Arc<InstallationControl>,
    mirror_control: Arc<StateMirrorControl>,
    config: ControllerConfig,
    pools: Mutex<Vec<WorkerPool>>,
}

impl Controller {
    /// Create a builder over the controller's external collaborators
    pub fn builder(
        seed: Arc<dyn ExtensionStore>,
        records: Arc<dyn RecordStore>,
        tenants: Arc<dyn TenantRetriever>,
    ) -> ControllerBuilder {
        ControllerBuilder::new(seed, records, tenants)
    }

    /// Wait for all event sources to sync, then launch the worker pools.
    ///
    /// Returns immediately after launching; reconciliation continues in the
    /// background until [`Controller::stop`]. Failing to sync within the
    /// configured timeout is fatal and launches nothing.
    pub async fn start(&self) -> Result<()> {
        self.registry
            .wait_for_sync(self.config.cache_sync_timeout)
            .await?;

        let mut pools = self.pools.lock().expect("pool lock poisoned");
        if !pools.is_empty() {
            warn!("controller already started");
            return Ok(());
        }

        pools.push(run_workers(
            Arc::clone(self.registry.installation_queue()),
            Arc::new(InstallationReconciler::new(Arc::clone(
                &self.installation_control,
            ))),
            self.config.installation_workers,
        ));

        for artifact in self.registry.artifacts() {
            pools.push(run_workers(
                Arc::clone(artifact.required_queue()),
                Arc::new(KindChangedReconciler::new(Arc::clone(
                    &self.installation_control,
                ))),
                self.config.installation_workers,
            ));

            if let Some(queue) = artifact.mirror_queue() {
                pools.push(run_workers(
                    Arc::clone(queue),
                    Arc::new(StateMirrorReconciler::new(
                        Arc::clone(&self.mirror_control),
                        artifact.kind(),
                    )),
                    self.config.mirror_workers,
                ));
            }
        }

        let workers: usize = pools.iter().map(WorkerPool::len).sum();
        info!(pools = pools.len(), workers, "extension controller initialized");
        Ok(())
    }

    /// Gracefully drain and stop.
    ///
    /// Shuts every queue down, then blocks until each worker has finished
    /// its in-flight key and observed closure. In-flight reconciles are
    /// never interrupted mid-step.
    pub async fn stop(&self) {
        self.registry.shut_down_queues();
        let pools: Vec<WorkerPool> = {
            let mut guard = self.pools.lock().expect("pool lock poisoned");
            guard.drain(..).collect()
        };
        for pool in pools {
            pool.join().await;
        }
        info!("extension controller stopped");
    }

    /// The artifact registry, for inspecting queues in tests and callers
    /// that enqueue synthetic keys
    pub fn registry(&self) -> &ArtifactRegistry {
        &self.registry
    }
}

/// Builder for [`Controller`] instances
///
/// ```ignore
/// let controller = Controller::builder(seed, records, tenants)
///     .event_source(ExtensionKind::Infrastructure, infra_watch)
///     .event_source(ExtensionKind::Worker, worker_watch)
///     .config(ControllerConfig::default())
///     .build();
/// ```
pub struct ControllerBuilder {
    seed: Arc<dyn ExtensionStore>,
    records: Arc<dyn RecordStore>,
    tenants: Arc<dyn TenantRetriever>,
    sources: HashMap<ExtensionKind, Arc<dyn EventSource>>,
    config: ControllerConfig,
}

impl ControllerBuilder {
    fn new(
        seed: Arc<dyn ExtensionStore>,
        records: Arc<dyn RecordStore>,
        tenants: Arc<dyn TenantRetriever>,
    ) -> Self {
        Self {
            seed,
            records,
            tenants,
            sources: HashMap::new(),
            config: ControllerConfig::default(),
        }
    }

    /// Register the event source watching `kind`
    pub fn event_source(mut self, kind: ExtensionKind, source: Arc<dyn EventSource>) -> Self {
        self.sources.insert(kind, source);
        self
    }

    /// Override the default configuration
    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Wire the registry, controls, and tenant cache into a [`Controller`]
    pub fn build(self) -> Controller {
        let mut registry = ArtifactRegistry::new();
        for (kind, source) in self.sources {
            registry.connect(kind, source);
        }

        let installation_control = Arc::new(InstallationControl::new(
            Arc::clone(&self.seed),
            Arc::clone(&self.records),
            Arc::clone(registry.installation_queue()),
        ));
        let tenants: Arc<dyn TenantRetriever> =
            Arc::new(CachedTenantRetriever::new(Arc::clone(&self.tenants)));
        let mirror_control = Arc::new(StateMirrorControl::new(
            Arc::clone(&self.seed),
            self.records,
            tenants,
        ));

        Controller {
            registry,
            installation_control,
            mirror_control,
            config: self.config,
            pools: Mutex::new(Vec::new()),
        }
    }
}
