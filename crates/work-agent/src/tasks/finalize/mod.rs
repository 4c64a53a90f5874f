//! Finalization of `AppliedManifestWork` records.

pub mod controller;
pub mod resolve;

pub use controller::FinalizeController;
pub use resolve::{resolve_applied_resources, resolve_entry, EntryState, Resolution};
