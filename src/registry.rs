//! Per-kind artifact registry and event wiring
//!
//! The registry binds every [`ExtensionKind`] to its queues and to the event
//! source delivering informer callbacks for it. Event handlers do exactly one
//! thing: decide which queue(s) a change belongs to and enqueue the object
//! key. They never perform I/O and never touch reconciliation state, which
//! keeps event delivery fast and makes deadlock impossible on this path.
//!
//! Two reconciliation concerns hang off each kind:
//! - the required-type queue feeds per-kind recomputation of which provider
//!   types are in use (all kinds participate);
//! - the state-mirror queue feeds tenant snapshot updates (all kinds except
//!   the seed-scoped BackupBucket).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::extension::{ExtensionKind, ExtensionObject, ObjectKey};
use crate::queue::RateLimitingQueue;
use crate::{Error, Result};

/// Key of the shared installation-reconcile queue
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct InstallationKey {
    /// Extension kind of the installation record
    pub kind: ExtensionKind,
    /// Provider type of the installation record
    pub type_: String,
}

impl InstallationKey {
    /// Create a key for the installation record of (kind, type)
    pub fn new(kind: ExtensionKind, type_: impl Into<String>) -> Self {
        Self {
            kind,
            type_: type_.into(),
        }
    }
}

impl std::fmt::Display for InstallationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.type_)
    }
}

/// An informer callback delivered by an event source.
///
/// Update events carry the previous object solely for predicate evaluation;
/// reconcilers never see event payloads.
#[derive(Clone, Debug)]
pub enum ExtensionEvent {
    /// Object appeared in the watch
    Added(ExtensionObject),
    /// Object changed
    Updated {
        /// Previously observed object
        old: ExtensionObject,
        /// Currently observed object
        new: ExtensionObject,
    },
    /// Object disappeared from the watch
    Deleted(ExtensionObject),
}

/// Callback installed on an event source; must be non-blocking
pub type EventHandler = Arc<dyn Fn(ExtensionEvent) + Send + Sync>;

/// A per-kind watch delivering add/update/delete callbacks.
///
/// Implementations must deliver events per key in order, at least once, and
/// report readiness through `has_synced` once the initial listing has been
/// replayed.
pub trait EventSource: Send + Sync {
    /// Install the handler invoked for every event of this kind
    fn subscribe(&self, handler: EventHandler);

    /// Whether the initial cache fill has been delivered
    fn has_synced(&self) -> bool;
}

/// Queues and wiring for one extension kind
#[derive(Clone)]
pub struct Artifact {
    kind: ExtensionKind,
    required_queue: Arc<RateLimitingQueue<ExtensionKind>>,
    mirror_queue: Option<Arc<RateLimitingQueue<ObjectKey>>>,
}

impl Artifact {
    fn new(kind: ExtensionKind) -> Self {
        Self {
            kind,
            required_queue: RateLimitingQueue::new(format!("installation-required-{kind}")),
            mirror_queue: kind
                .mirrors_state()
                .then(|| RateLimitingQueue::new(format!("state-mirror-{kind}"))),
        }
    }

    /// The kind this artifact serves
    pub fn kind(&self) -> ExtensionKind {
        self.kind
    }

    /// Queue feeding required-type recomputation for this kind.
    ///
    /// Keyed by the kind itself: recomputation is whole-kind, so events
    /// coalesce into one queued recompute and the at-most-one-in-flight
    /// guarantee keeps two recomputations of the same kind from
    /// interleaving. An event arriving mid-recompute marks the key dirty
    /// and triggers a fresh recompute afterwards.
    pub fn required_queue(&self) -> &Arc<RateLimitingQueue<ExtensionKind>> {
        &self.required_queue
    }

    /// Queue feeding state mirroring, absent for kinds without tenant state
    pub fn mirror_queue(&self) -> Option<&Arc<RateLimitingQueue<ObjectKey>>> {
        self.mirror_queue.as_ref()
    }

    /// Route one event into the queues it belongs to.
    ///
    /// Adds and deletes enqueue unconditionally into every configured queue:
    /// aggregation must notice the first and last user of a type either way,
    /// and deletes may be the only signal that a relist is due. Updates are
    /// filtered by what actually changed.
    pub fn handle(&self, event: ExtensionEvent) {
        match event {
            ExtensionEvent::Added(object) | ExtensionEvent::Deleted(object) => {
                self.required_queue.add(self.kind);
                if let Some(queue) = &self.mirror_queue {
                    queue.add(object.key());
                }
            }
            ExtensionEvent::Updated { old, new } => {
                if new.type_ != old.type_ {
                    self.required_queue.add(self.kind);
                }
                if let Some(queue) = &self.mirror_queue {
                    if !new.state_equal(&old) || !new.resources_equal(&old) {
                        queue.add(new.key());
                    }
                }
            }
        }
    }
}

/// Registry of artifacts for all supported kinds, plus the shared
/// installation-reconcile queue fed by required-type recomputation
pub struct ArtifactRegistry {
    artifacts: HashMap<ExtensionKind, Artifact>,
    installation_queue: Arc<RateLimitingQueue<InstallationKey>>,
    sources: Vec<Arc<dyn EventSource>>,
}

impl ArtifactRegistry {
    /// Create a registry with one artifact per supported kind
    pub fn new() -> Self {
        Self {
            artifacts: ExtensionKind::ALL
                .into_iter()
                .map(|kind| (kind, Artifact::new(kind)))
                .collect(),
            installation_queue: RateLimitingQueue::new("installation-required"),
            sources: Vec::new(),
        }
    }

    /// The artifact registered for `kind`
    pub fn artifact(&self, kind: ExtensionKind) -> &Artifact {
        // The map is total over the closed kind enum.
        &self.artifacts[&kind]
    }

    /// All registered artifacts
    pub fn artifacts(&self) -> impl Iterator<Item = &Artifact> {
        self.artifacts.values()
    }

    /// The shared queue of (kind, type) installation keys
    pub fn installation_queue(&self) -> &Arc<RateLimitingQueue<InstallationKey>> {
        &self.installation_queue
    }

    /// Subscribe the artifact of `kind` to its event source.
    ///
    /// The installed handler only enqueues keys; the source is retained so
    /// startup can wait for its initial sync.
    pub fn connect(&mut self, kind: ExtensionKind, source: Arc<dyn EventSource>) {
        let artifact = self.artifact(kind).clone();
        source.subscribe(Arc::new(move |event| artifact.handle(event)));
        self.sources.push(source);
        debug!(kind = %kind, "event source connected");
    }

    /// Block until every connected source reports its initial sync, up to
    /// `timeout`. Expiry is a fatal startup error.
    pub async fn wait_for_sync(&self, timeout: Duration) -> Result<()> {
        let all_synced = async {
            loop {
                if self.sources.iter().all(|source| source.has_synced()) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        };
        tokio::time::timeout(timeout, all_synced)
            .await
            .map_err(|_| Error::CacheSyncTimeout)
    }

    /// Shut down every queue so workers drain and exit
    pub fn shut_down_queues(&self) {
        self.installation_queue.shut_down();
        for artifact in self.artifacts.values() {
            artifact.required_queue.shut_down();
            if let Some(queue) = &artifact.mirror_queue {
                queue.shut_down();
            }
        }
    }
}

impl Default for ArtifactRegistry {
    fn default() -> Self {
        Self::new()
    }
}
