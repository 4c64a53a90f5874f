//! Applying hub work onto the spoke and tracking what was created.

pub mod applier;
pub mod controller;
pub mod source;
pub mod tracker;

pub use applier::{owner_reference, KubeManifestApplier, ManifestApplier};
pub use controller::ApplyController;
pub use source::{KubeWorkSource, WorkSource};
pub use tracker::{dropped_entries, request_deletion, sync_applied_resources};
