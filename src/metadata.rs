//! Metadata structures shared by the acquisition engine and the manager.
//!
//! Metadata travels as loosely-typed JSON maps: each source contributes a
//! map of its own keys, and the aggregate keyed by source name is attached
//! to every stored and broadcast frame. Rich, per-frame metadata is what
//! makes the raw frames interpretable months later, so the engine collects
//! it concurrently with the exposure rather than after it.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A flat key/value metadata map as produced by one source.
pub type MetaMap = serde_json::Map<String, serde_json::Value>;

/// Current UTC time as an RFC 3339 string, the stamp format used for
/// `acquisition_start` / `acquisition_end` and scan records.
pub fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Result of a single per-source metadata fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchReply {
    /// The source's metadata map.
    pub meta: MetaMap,
    /// How long the fetch took.
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
}

/// Merge `extra` into `base`, overwriting existing keys.
pub fn merge(base: &mut MetaMap, extra: MetaMap) {
    for (k, v) in extra {
        base.insert(k, v);
    }
}
