//! Extension object model: kinds, identities, and observed status
//!
//! Extension objects are custom resources owned by the seed cluster API and
//! written by per-provider extension controllers. This controller only reads
//! the handful of fields reconciliation depends on: the kind, the provider
//! `type`, an optional `purpose` discriminator, and the observed status
//! (opaque state blob plus managed resource references).

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The closed set of extension kinds watched by this controller
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[non_exhaustive]
pub enum ExtensionKind {
    /// Seed-scoped backup bucket provisioning
    BackupBucket,
    /// Per-tenant backup entry within a bucket
    BackupEntry,
    /// Container runtime installation on worker nodes
    ContainerRuntime,
    /// Provider-specific control plane components
    ControlPlane,
    /// DNS record management
    #[serde(rename = "DNSRecord")]
    DnsRecord,
    /// Generic extension hook
    Extension,
    /// Infrastructure provisioning (VPCs, subnets, ...)
    Infrastructure,
    /// Pod/service network provisioning
    Network,
    /// Operating system configuration for nodes
    OperatingSystemConfig,
    /// Worker node pool management
    Worker,
}

impl ExtensionKind {
    /// All kinds, in registry order
    pub const ALL: [ExtensionKind; 10] = [
        ExtensionKind::BackupBucket,
        ExtensionKind::BackupEntry,
        ExtensionKind::ContainerRuntime,
        ExtensionKind::ControlPlane,
        ExtensionKind::DnsRecord,
        ExtensionKind::Extension,
        ExtensionKind::Infrastructure,
        ExtensionKind::Network,
        ExtensionKind::OperatingSystemConfig,
        ExtensionKind::Worker,
    ];

    /// The kind name as it appears on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BackupBucket => "BackupBucket",
            Self::BackupEntry => "BackupEntry",
            Self::ContainerRuntime => "ContainerRuntime",
            Self::ControlPlane => "ControlPlane",
            Self::DnsRecord => "DNSRecord",
            Self::Extension => "Extension",
            Self::Infrastructure => "Infrastructure",
            Self::Network => "Network",
            Self::OperatingSystemConfig => "OperatingSystemConfig",
            Self::Worker => "Worker",
        }
    }

    /// BackupBucket is seed-scoped and never belongs to a tenant, so its
    /// observed state is not mirrored into tenant snapshots.
    pub fn mirrors_state(&self) -> bool {
        !matches!(self, Self::BackupBucket)
    }
}

impl std::fmt::Display for ExtensionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExtensionKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|k| k.as_str() == s)
            .copied()
            .ok_or_else(|| crate::Error::invalid_key(format!("unknown extension kind: {s}")))
    }
}

/// Namespaced identity of an extension object
///
/// Queues carry only identities, never object payloads: reconcilers must
/// re-read current state from the store so that coalesced or out-of-order
/// events cannot make them act on stale data.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    /// Namespace of the object
    pub namespace: String,
    /// Name of the object
    pub name: String,
}

impl ObjectKey {
    /// Create a key from namespace and name
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl std::str::FromStr for ObjectKey {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() => Ok(Self::new(ns, name)),
            _ => Err(crate::Error::invalid_key(format!(
                "expected namespace/name, got {s:?}"
            ))),
        }
    }
}

/// Named reference to an external resource managed by an extension
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct ResourceRef {
    /// Logical name of the reference within the extension status
    pub name: String,
    /// API version of the referenced resource
    pub api_version: String,
    /// Kind of the referenced resource
    pub kind: String,
    /// Name of the referenced resource
    pub resource_name: String,
}

/// The slice of an extension custom resource this controller reads
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct ExtensionObject {
    /// Category of the extension
    pub kind: ExtensionKind,
    /// Namespace of the object in the seed
    pub namespace: String,
    /// Name of the object
    pub name: String,
    /// Provider implementation identifier (e.g. "aws", "azure")
    #[serde(rename = "type")]
    pub type_: String,
    /// Optional discriminator (e.g. ControlPlane "exposure")
    pub purpose: Option<String>,
    /// Opaque provider state from the object status, compared by value
    pub observed_state: Option<Value>,
    /// Managed external resource references from the object status
    pub observed_resources: Vec<ResourceRef>,
}

impl ExtensionObject {
    /// The namespaced identity of this object
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace.clone(), self.name.clone())
    }

    /// Whether two observed states are semantically equal.
    ///
    /// States are opaque blobs; equality is deep value equality, so two
    /// re-serializations of the same document compare equal.
    pub fn state_equal(&self, other: &ExtensionObject) -> bool {
        self.observed_state == other.observed_state
    }

    /// Whether two observed resource lists reference the same resources.
    ///
    /// Resource lists are compared order-insensitively.
    pub fn resources_equal(&self, other: &ExtensionObject) -> bool {
        resource_set(&self.observed_resources) == resource_set(&other.observed_resources)
    }
}

fn resource_set(refs: &[ResourceRef]) -> BTreeSet<&ResourceRef> {
    refs.iter().collect()
}

/// The distinct provider types present in a list of extension objects
pub fn distinct_types(objects: &[ExtensionObject]) -> BTreeSet<String> {
    objects.iter().map(|o| o.type_.clone()).collect()
}
