//! Reconciliation logic for seed extension resources
//!
//! Two independent concerns share the event-dispatch mechanism: keeping
//! installation records' `required` flags in line with the extension types
//! actually in use, and mirroring extension status into tenant snapshots.
//! Both follow the controller pattern of re-deriving truth from current
//! state on every reconcile.

mod extensions;
mod mirror;
mod required;

pub use extensions::{Controller, ControllerBuilder, ControllerConfig};
pub use mirror::{StateMirrorControl, StateMirrorReconciler};
pub use required::{
    InstallationControl, InstallationReconciler, KindChangedReconciler, RequiredTypeTracker,
};
