//! Trellis - extension-reconciliation core for a multi-cluster control plane
//!
//! Trellis runs inside a "seed" cluster of a multi-cluster Kubernetes control
//! plane. It watches the per-kind extension custom resources written there by
//! provider extension controllers and reconciles two things out of them:
//!
//! - per kind, the set of provider *types* currently in use, mirrored into
//!   the `required` flag of the matching installation records in the central
//!   management cluster;
//! - per object, the observed runtime state and managed-resource references,
//!   mirrored into the owning tenant's persisted snapshot for backup/restore
//!   and cluster migration.
//!
//! # Architecture
//!
//! Informer callbacks only enqueue object keys; fixed worker pools drain the
//! queues and re-derive truth from the live stores, so reconciliation stays
//! idempotent under event coalescing and arbitrary interleaving. Failures
//! are retried with per-key exponential backoff until success or shutdown.
//!
//! # Modules
//!
//! - [`extension`] - Extension kinds, object identities, observed status
//! - [`queue`] - Rate-limited work queues with dedup and backoff
//! - [`worker`] - Worker pools draining queues through reconcilers
//! - [`registry`] - Per-kind artifacts, event sources, and enqueue predicates
//! - [`store`] - Seed and management-cluster store interfaces
//! - [`tenant`] - Tenant resolution for extension namespaces
//! - [`controller`] - The two reconciliation controls and controller wiring
//! - [`error`] - Error types and the retry/skip classification

#![deny(missing_docs)]

pub mod controller;
pub mod error;
pub mod extension;
pub mod queue;
pub mod registry;
pub mod store;
pub mod tenant;
pub mod worker;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
