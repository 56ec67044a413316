//! Lineage resolution.
//!
//! A lineage is the ordered ancestor chain of an image, root ancestor first.
//! The target lineage follows the dependency declarations of image sources;
//! the installed lineage follows the backend's layer-parent pointers. Both
//! are resolved into immutable lists up front so the reconciliation algorithm
//! runs over plain values.

use std::collections::BTreeSet;

use anyhow::{bail, Context, Result};

use crate::backend::BuildBackend;
use crate::paths::Paths;
use crate::repository::{self, Repositories};
use crate::source::ImageSource;

/// Looks up image sources across the registry's repositories.
pub struct SourceResolver<'a> {
    pub repositories: &'a Repositories,
    pub paths: &'a Paths,
}

impl SourceResolver<'_> {
    pub fn lookup(&self, repo_name: &str, image_name: &str) -> Result<ImageSource> {
        let config = self
            .repositories
            .get(repo_name)
            .with_context(|| format!("no repository named '{repo_name}'"))?;
        let checkout = repository::checkout_dir(repo_name, config, self.paths);
        ImageSource::open(repo_name, &checkout, image_name)
    }

    /// The target lineage of a source, from the most distant ancestor to the
    /// source itself. A dependency on a nonexistent image, a malformed
    /// declaration, or a dependency cycle is fatal to this lineage only.
    pub fn target_lineage(&self, source: &ImageSource) -> Result<Vec<ImageSource>> {
        let mut chain = vec![source.clone()];
        let mut seen = BTreeSet::from([source.key()]);
        let mut current = source.clone();

        while let Some(dep) = current.dependency()? {
            let repo = dep.repo.unwrap_or_else(|| current.repo_name.clone());
            let next = self
                .lookup(&repo, &dep.image)
                .with_context(|| format!("resolving the dependency of '{}'", current.key()))?;
            if !seen.insert(next.key()) {
                bail!(
                    "dependency cycle detected at '{}' while resolving '{}'",
                    next.key(),
                    source.key()
                );
            }
            chain.push(next.clone());
            current = next;
        }

        chain.reverse();
        Ok(chain)
    }
}

/// The installed lineage of an image id, root to leaf, following the
/// backend's layer-parent pointers. An id the backend no longer recognizes
/// yields an empty lineage: the image is gone, not an error.
pub fn installed_lineage(backend: &dyn BuildBackend, image_id: &str) -> Result<Vec<String>> {
    let mut chain = Vec::new();
    let mut seen = BTreeSet::new();
    let mut current = Some(image_id.to_string());

    while let Some(id) = current {
        if !seen.insert(id.clone()) {
            bail!("layer parent cycle detected at image '{id}'");
        }
        let Some(props) = backend.image_properties(&id)? else {
            if chain.is_empty() {
                return Ok(Vec::new());
            }
            // A recorded ancestor the backend lost truncates the chain here.
            break;
        };
        chain.push(props.id);
        current = props.parent;
    }

    chain.reverse();
    Ok(chain)
}
