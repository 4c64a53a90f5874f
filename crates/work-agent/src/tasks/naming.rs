use sha2::{Digest, Sha256};

pub struct RecordNaming;

impl RecordNaming {
    /// Hub hash: hex sha256 of the hub API server URL.
    /// Stable across agent restarts, distinct per hub.
    #[must_use]
    pub fn hub_hash(hub_server_url: &str) -> String {
        let digest = Sha256::digest(hub_server_url.trim_end_matches('/').as_bytes());
        hex::encode(digest)
    }

    /// Name of the `AppliedManifestWork` tracking a hub `ManifestWork`.
    /// Format: {hub_hash}-{work_name}
    #[must_use]
    pub fn record_name(hub_hash: &str, work_name: &str) -> String {
        format!("{hub_hash}-{work_name}")
    }
}
