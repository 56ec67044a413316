//! Image source repositories.
//!
//! A repository is either a git remote (checked out under the managed
//! `repositories/` directory) or a plain local directory that bypasses git
//! entirely. Named repositories are created explicitly; referencing a bare
//! URI or path allocates a temporary repository under a small numeric id,
//! garbage-collected by verification once nothing references it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::git;
use crate::paths::Paths;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct RepositoryConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_origin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_dir: Option<PathBuf>,
    #[serde(default)]
    pub temporary: bool,
}

/// Mutable per-repository runtime state, persisted separately from the
/// repository definition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct RepositoryState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_commit_hash: Option<String>,
}

pub type Repositories = BTreeMap<String, RepositoryConfig>;
pub type RepositoryStates = BTreeMap<String, RepositoryState>;

/// Where this repository's image sources live on disk.
pub fn checkout_dir(name: &str, config: &RepositoryConfig, paths: &Paths) -> PathBuf {
    match &config.source_dir {
        Some(dir) => dir.clone(),
        None => paths.repository_checkout_dir(name),
    }
}

/// Make sure the checkout exists, cloning git repositories on first use.
pub fn ensure_checkout(name: &str, config: &RepositoryConfig, paths: &Paths) -> Result<PathBuf> {
    let dir = checkout_dir(name, config, paths);
    if dir.is_dir() {
        return Ok(dir);
    }
    match &config.git_origin {
        Some(origin) => {
            git::ensure_available()?;
            std::fs::create_dir_all(paths.repositories_dir())
                .context("creating the repository checkouts directory")?;
            git::clone(origin, &dir)?;
            Ok(dir)
        }
        None => bail!(
            "repository '{}' points at missing directory '{}'",
            name,
            dir.display()
        ),
    }
}

/// Pull a git-backed repository and return the new commit hash when it moved.
pub fn update_checkout(
    name: &str,
    config: &RepositoryConfig,
    paths: &Paths,
    states: &mut RepositoryStates,
) -> Result<Option<String>> {
    if config.git_origin.is_none() {
        return Ok(None);
    }
    let dir = ensure_checkout(name, config, paths)?;
    git::pull(&dir)?;
    let head = git::current_commit_hash(&dir)?;
    let state = states.entry(name.to_string()).or_default();
    if state.git_commit_hash.as_deref() == Some(head.as_str()) {
        return Ok(None);
    }
    state.git_commit_hash = Some(head.clone());
    Ok(Some(head))
}

/// Split an `image[@repository]` identifier.
pub fn parse_identifier(identifier: &str) -> (String, Option<String>) {
    match identifier.split_once('@') {
        Some((image, repo)) => (image.to_string(), Some(repo.to_string())),
        None => (identifier.to_string(), None),
    }
}

fn looks_like_uri(spec: &str) -> bool {
    spec.contains("://")
}

fn looks_like_path(spec: &str) -> bool {
    spec.starts_with('/') || spec.starts_with("./") || spec.starts_with("~/")
}

/// Resolve a repository specifier to a repository id.
///
/// An existing name wins. A URI or path first matches an existing repository
/// with the same origin; otherwise a temporary repository is allocated under
/// the smallest unused numeric id and its checkout materialized. Returns the
/// id and whether an entry was newly added.
pub fn resolve_spec(
    repositories: &mut Repositories,
    paths: &Paths,
    spec: &str,
) -> Result<(String, bool)> {
    if repositories.contains_key(spec) {
        return Ok((spec.to_string(), false));
    }

    if looks_like_uri(spec) {
        if let Some(name) = find_by_origin(repositories, |c| c.git_origin.as_deref() == Some(spec))
        {
            return Ok((name, false));
        }
        let name = allocate_temporary_id(repositories);
        let config = RepositoryConfig {
            git_origin: Some(spec.to_string()),
            source_dir: None,
            temporary: true,
        };
        ensure_checkout(&name, &config, paths)?;
        repositories.insert(name.clone(), config);
        return Ok((name, true));
    }

    if looks_like_path(spec) {
        let dir = PathBuf::from(spec);
        if !dir.is_dir() {
            bail!("repository directory '{}' does not exist", dir.display());
        }
        if let Some(name) =
            find_by_origin(repositories, |c| c.source_dir.as_deref() == Some(dir.as_path()))
        {
            return Ok((name, false));
        }
        let name = allocate_temporary_id(repositories);
        repositories.insert(
            name.clone(),
            RepositoryConfig {
                git_origin: None,
                source_dir: Some(dir),
                temporary: true,
            },
        );
        return Ok((name, true));
    }

    bail!(
        "unknown repository '{spec}'. Add it with `subuser repository add`, or reference \
         a git URI or an absolute path directly."
    )
}

fn find_by_origin(
    repositories: &Repositories,
    matches: impl Fn(&RepositoryConfig) -> bool,
) -> Option<String> {
    repositories
        .iter()
        .find(|(_, config)| matches(config))
        .map(|(name, _)| name.clone())
}

fn allocate_temporary_id(repositories: &Repositories) -> String {
    let mut id: u64 = 0;
    while repositories.contains_key(&id.to_string()) {
        id += 1;
    }
    id.to_string()
}

/// A checkout managed by us lives under `repositories/`; a local-directory
/// repository belongs to the user and is never deleted.
pub fn is_managed_checkout(dir: &Path, paths: &Paths) -> bool {
    dir.starts_with(paths.repositories_dir())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn identifier_splits_on_at() {
        assert_eq!(parse_identifier("vim"), ("vim".to_string(), None));
        assert_eq!(
            parse_identifier("vim@default"),
            ("vim".to_string(), Some("default".to_string()))
        );
        assert_eq!(
            parse_identifier("vim@https://example.com/repo.git"),
            (
                "vim".to_string(),
                Some("https://example.com/repo.git".to_string())
            )
        );
    }

    #[test]
    fn local_path_spec_allocates_a_temporary_repository_once() {
        let tmp = TempDir::new().unwrap();
        let paths = Paths::with_root(tmp.path().join("root"));
        let repo_dir = tmp.path().join("sources");
        std::fs::create_dir_all(&repo_dir).unwrap();
        let spec = repo_dir.to_string_lossy().to_string();

        let mut repositories = Repositories::new();
        let (first, added) = resolve_spec(&mut repositories, &paths, &spec).unwrap();
        assert!(added);
        assert_eq!(first, "0");
        assert!(repositories.get("0").unwrap().temporary);

        let (second, added_again) = resolve_spec(&mut repositories, &paths, &spec).unwrap();
        assert!(!added_again, "same origin reuses the existing entry");
        assert_eq!(second, "0");
    }

    #[test]
    fn unknown_name_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let paths = Paths::with_root(tmp.path());
        let mut repositories = Repositories::new();
        assert!(resolve_spec(&mut repositories, &paths, "nope").is_err());
    }

    #[test]
    fn temporary_ids_skip_taken_numbers() {
        let mut repositories = Repositories::new();
        repositories.insert(
            "0".to_string(),
            RepositoryConfig {
                git_origin: None,
                source_dir: None,
                temporary: true,
            },
        );
        assert_eq!(allocate_temporary_id(&repositories), "1");
    }
}
