//! Installed image records.
//!
//! The installed-images table maps backend image ids to the source they were
//! built from plus a staleness token. Two token schemes coexist across
//! versions of the format: the canonical content hash of the source
//! directory, and the legacy human-readable `last-update-time`. Both are
//! accepted on read; only the hash is ever written.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct InstalledImage {
    pub image_source: String,
    pub source_repo: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_source_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<String>,
}

impl InstalledImage {
    pub fn matches_source(&self, repo: &str, image: &str) -> bool {
        self.source_repo == repo && self.image_source == image
    }
}

/// image id -> record
pub type InstalledImages = BTreeMap<String, InstalledImage>;

/// The most recently installed image for a source.
///
/// Hash-token records are canonical and outrank legacy timestamp records.
/// Among legacy records the timestamp orders meaningfully (the scheme the
/// "most recent wins" rule was written for); the image id tiebreak keeps the
/// choice deterministic for hash-token records, whose tokens are unordered.
pub fn latest_installed<'a>(
    table: &'a InstalledImages,
    repo: &str,
    image: &str,
) -> Option<(&'a str, &'a InstalledImage)> {
    table
        .iter()
        .filter(|(_, record)| record.matches_source(repo, image))
        .max_by(|(id_a, a), (id_b, b)| {
            let ka = (a.image_source_hash.is_some(), a.last_update_time.as_deref());
            let kb = (b.image_source_hash.is_some(), b.last_update_time.as_deref());
            ka.cmp(&kb).then_with(|| id_a.cmp(id_b))
        })
        .map(|(id, record)| (id.as_str(), record))
}
