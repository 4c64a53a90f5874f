pub mod applied_manifest_work;
pub mod manifest_work;

pub use applied_manifest_work::*;
pub use manifest_work::*;
