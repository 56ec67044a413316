//! Operation entry points behind the CLI.
//!
//! Every mutating operation follows the same sequence: acquire the registry
//! lock, mutate in-memory state, run the verification pass, commit. Listing
//! and history operations are read-only and take no lock; they may observe a
//! snapshot a concurrent writer is about to supersede.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{bail, Context, Result};

use crate::backend::BuildBackend;
use crate::images::InstalledImage;
use crate::lineage::{installed_lineage, SourceResolver};
use crate::live_log;
use crate::lock::RegistryLock;
use crate::paths::{Paths, SUBUSERS_FILE};
use crate::permissions::{self, Permissions};
use crate::registry::Registry;
use crate::repository::{self, RepositoryConfig};
use crate::source::ImageSource;
use crate::subuser::{self, SubuserRecord, Subusers};
use crate::verify::verify;

/// Per-invocation context: one of these exists per process, wired up in
/// `main`. The backend is injected so tests run against the in-memory fake.
pub struct Environment {
    pub paths: Paths,
    pub backend: Box<dyn BuildBackend>,
}

fn open_locked(paths: &Paths) -> Result<(RegistryLock, Registry)> {
    let lock = RegistryLock::acquire(&paths.lock_file())?;
    let registry = Registry::load(paths.clone())?;
    Ok((lock, registry))
}

fn finish(
    registry: &mut Registry,
    backend: &dyn BuildBackend,
    check_external: bool,
    targets: Option<&[String]>,
) -> Result<()> {
    let failed = verify(registry, backend, check_external, targets)?;
    registry.commit()?;
    if !failed.is_empty() {
        let names: Vec<&str> = failed.iter().map(String::as_str).collect();
        bail!("failed to build: {}", names.join(", "));
    }
    Ok(())
}

/// `subuser subuser add <name> <image>[@<repo|uri|path>]`
pub fn add_subuser(env: &Environment, name: &str, image_ref: &str) -> Result<()> {
    subuser::validate_name(name)?;
    let (_lock, mut registry) = open_locked(&env.paths)?;
    if registry.subuser(name).is_some() {
        bail!("a subuser named '{name}' already exists");
    }

    let (image, repo_spec) = repository::parse_identifier(image_ref);
    let repo_name = match repo_spec {
        Some(spec) => {
            let (repo_name, added) =
                repository::resolve_spec(&mut registry.repositories, &env.paths, &spec)?;
            if added {
                registry.log_change(&format!("Adding new temporary repository {repo_name}"));
            }
            repo_name
        }
        None if registry.repositories.contains_key("default") => "default".to_string(),
        None => bail!(
            "no repository specified for '{image}' and no 'default' repository is configured"
        ),
    };

    // Resolve the source now so a bad reference fails before any state lands.
    let source = {
        let resolver = SourceResolver {
            repositories: &registry.repositories,
            paths: &env.paths,
        };
        resolver.lookup(&repo_name, &image)?
    };
    let defaults = source.permissions()?;

    // A new subuser starts with no overrides: the sparse difference of the
    // defaults against themselves.
    let override_path = env.paths.permissions_file(name);
    if let Some(parent) = override_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating '{}'", parent.display()))?;
    }
    let sparse = defaults.sparse_against(&defaults)?;
    let mut override_text = serde_json::to_string_pretty(&sparse)?;
    override_text.push('\n');
    std::fs::write(&override_path, override_text)
        .with_context(|| format!("writing '{}'", override_path.display()))?;

    let effective = defaults.apply_override(&permissions::load_override(&override_path)?)?;
    registry.subusers.insert(
        name.to_string(),
        SubuserRecord {
            source_repo: repo_name.clone(),
            image_source: image.clone(),
            executable_shortcut_installed: effective.executable.is_some(),
            docker_image: None,
            service_subusers: Vec::new(),
        },
    );
    registry.log_change(&format!("Adding new subuser {name} {image}@{repo_name}"));

    finish(&mut registry, env.backend.as_ref(), false, None)
}

/// `subuser subuser remove <name>...`
pub fn remove_subusers(env: &Environment, names: &[String]) -> Result<()> {
    let (_lock, mut registry) = open_locked(&env.paths)?;

    // Expand to service subusers and fail on unknown names before mutating.
    let mut to_remove = Vec::new();
    for name in names {
        let Some((record, _)) = registry.subuser(name) else {
            bail!("no subuser named '{name}'");
        };
        to_remove.extend(record.service_subusers.clone());
        to_remove.push(name.clone());
    }

    for name in &to_remove {
        if registry.subusers.remove(name).is_none()
            && registry.locked_subusers.remove(name).is_none()
        {
            continue;
        }
        let permissions_dir = env.paths.permissions_dir(name);
        if permissions_dir.is_dir() {
            std::fs::remove_dir_all(&permissions_dir)
                .with_context(|| format!("removing '{}'", permissions_dir.display()))?;
        }
        registry.log_change(&format!("Removing subuser {name}"));
    }

    finish(&mut registry, env.backend.as_ref(), false, None)
}

/// `subuser update all`
pub fn update_all(env: &Environment) -> Result<()> {
    let (_lock, mut registry) = open_locked(&env.paths)?;
    pull_repositories(&mut registry, None)?;
    finish(&mut registry, env.backend.as_ref(), true, None)
}

/// `subuser update subusers <name>...`
pub fn update_subusers(env: &Environment, names: &[String]) -> Result<()> {
    let (_lock, mut registry) = open_locked(&env.paths)?;

    let mut repos = BTreeSet::new();
    for name in names {
        let Some((record, _)) = registry.subuser(name) else {
            bail!("no subuser named '{name}'");
        };
        repos.insert(record.source_repo.clone());
    }
    pull_repositories(&mut registry, Some(&repos))?;
    finish(&mut registry, env.backend.as_ref(), true, Some(names))
}

/// Pull git-backed checkouts, recording moved commit hashes. A repository
/// that cannot be reached is a warning, not a fatal error: stale sources
/// still reconcile against what is checked out.
fn pull_repositories(registry: &mut Registry, only: Option<&BTreeSet<String>>) -> Result<()> {
    let names: Vec<String> = registry
        .repositories
        .iter()
        .filter(|(name, config)| {
            config.git_origin.is_some() && only.map_or(true, |set| set.contains(name.as_str()))
        })
        .map(|(name, _)| name.clone())
        .collect();

    for name in names {
        let config = registry.repositories[&name].clone();
        let paths = registry.paths().clone();
        match repository::update_checkout(&name, &config, &paths, &mut registry.repository_states)
        {
            Ok(Some(hash)) => {
                registry.log_change(&format!("Updated repository {name} to commit {hash}"));
            }
            Ok(None) => {}
            Err(e) => registry.log(&format!("Warning: could not update repository {name}: {e:#}")),
        }
    }
    Ok(())
}

/// `subuser update lock-subuser-to <name> <commit>`
///
/// Freezes the subuser to the image id and permissions recorded at a past
/// registry commit.
pub fn lock_subuser_to(env: &Environment, name: &str, commit: &str) -> Result<()> {
    let (_lock, mut registry) = open_locked(&env.paths)?;
    if !registry.subusers.contains_key(name) {
        if registry.locked_subusers.contains_key(name) {
            bail!("subuser '{name}' is already locked");
        }
        bail!("no subuser named '{name}'");
    }

    let historical: Subusers = registry
        .table_at_commit(commit, SUBUSERS_FILE)
        .with_context(|| format!("reading the subuser table at commit {commit}"))?;
    let snapshot = historical
        .get(name)
        .with_context(|| format!("subuser '{name}' did not exist at commit {commit}"))?
        .clone();

    // Restore the permission override as of that commit too, when present.
    let override_rel = format!("permissions/{name}/permissions.json");
    if let Ok(text) = crate::git::show_file(&env.paths.registry_dir(), commit, &override_rel) {
        std::fs::write(env.paths.permissions_file(name), text)
            .with_context(|| format!("restoring permission override of '{name}'"))?;
    }

    registry.subusers.remove(name);
    registry.locked_subusers.insert(name.to_string(), snapshot);
    registry.log_change(&format!("Locking subuser {name} to commit {commit}"));

    finish(&mut registry, env.backend.as_ref(), false, None)
}

/// `subuser update unlock-subuser <name>`
pub fn unlock_subuser(env: &Environment, name: &str) -> Result<()> {
    let (_lock, mut registry) = open_locked(&env.paths)?;
    let Some(record) = registry.locked_subusers.remove(name) else {
        if registry.subusers.contains_key(name) {
            bail!("subuser '{name}' is not locked");
        }
        bail!("no subuser named '{name}'");
    };
    registry.subusers.insert(name.to_string(), record);
    registry.log_change(&format!("Unlocking subuser {name}"));

    finish(&mut registry, env.backend.as_ref(), false, None)
}

/// `subuser repair` - run verification over everything and commit whatever
/// it had to fix.
pub fn repair(env: &Environment) -> Result<()> {
    let (_lock, mut registry) = open_locked(&env.paths)?;
    finish(&mut registry, env.backend.as_ref(), false, None)
}

/// `subuser remove-old-images [--dry-run] [--repo=ID]`
///
/// Removes installed images no subuser is bound to and no bound image
/// depends on, children before parents.
pub fn remove_old_images(env: &Environment, dry_run: bool, repo: Option<&str>) -> Result<()> {
    let (_lock, mut registry) = open_locked(&env.paths)?;
    let backend = env.backend.as_ref();

    let mut needed: BTreeSet<String> = BTreeSet::new();
    for record in registry
        .subusers
        .values()
        .chain(registry.locked_subusers.values())
    {
        if let Some(id) = &record.docker_image {
            needed.insert(id.clone());
            for ancestor in installed_lineage(backend, id)? {
                needed.insert(ancestor);
            }
        }
    }

    let mut candidates: Vec<(String, InstalledImage)> = registry
        .installed_images
        .iter()
        .filter(|(id, record)| {
            !needed.contains(id.as_str()) && repo.map_or(true, |r| record.source_repo == r)
        })
        .map(|(id, record)| (id.clone(), record.clone()))
        .collect();

    // Children first, so the backend never sees a dependent-layers error for
    // images we are about to remove anyway.
    let mut depth = BTreeMap::new();
    for (id, _) in &candidates {
        depth.insert(id.clone(), installed_lineage(backend, id)?.len());
    }
    candidates.sort_by_key(|(id, _)| std::cmp::Reverse(depth.get(id).copied().unwrap_or(0)));

    for (id, record) in candidates {
        let line = format!(
            "Removing unneeded image {id} : {}@{}",
            record.image_source, record.source_repo
        );
        if dry_run {
            registry.log(&line);
            continue;
        }
        if backend.image_properties(&id)?.is_some() {
            if let Err(e) = backend.remove_image(&id) {
                registry.log(&format!("Could not remove image {id}: {e:#}"));
                continue;
            }
        }
        registry.installed_images.remove(&id);
        registry.log_change(&line);
    }

    if dry_run {
        return Ok(());
    }
    finish(&mut registry, backend, false, None)
}

/// A subuser's effective permission set: the image source's defaults with
/// the per-subuser sparse override layered on top.
pub fn effective_permissions(registry: &Registry, name: &str) -> Result<Permissions> {
    let (record, _) = registry
        .subuser(name)
        .with_context(|| format!("no subuser named '{name}'"))?;
    let resolver = SourceResolver {
        repositories: &registry.repositories,
        paths: registry.paths(),
    };
    let source = resolver.lookup(&record.source_repo, &record.image_source)?;
    let override_object = permissions::load_override(&registry.paths().permissions_file(name))?;
    source.permissions()?.apply_override(&override_object)
}

/// `subuser registry log`
pub fn registry_history(paths: &Paths) -> Result<String> {
    let registry = Registry::load(paths.clone())?;
    registry.history()
}

/// `subuser registry rollback <commit>`
pub fn rollback(env: &Environment, commit: &str) -> Result<()> {
    let (_lock, mut registry) = open_locked(&env.paths)?;
    registry.rollback(commit)?;
    registry.log_change(&format!("Rolled back to commit {commit}"));
    finish(&mut registry, env.backend.as_ref(), false, None)
}

/// `subuser registry live-log`
pub fn live_log(paths: &Paths) -> Result<()> {
    live_log::follow(paths)
}

/// `subuser repository add <name> <uri|path>`
pub fn add_repository(env: &Environment, name: &str, origin: &str) -> Result<()> {
    let (_lock, mut registry) = open_locked(&env.paths)?;
    if registry.repositories.contains_key(name) {
        bail!("a repository named '{name}' already exists");
    }

    let config = if origin.contains("://") {
        RepositoryConfig {
            git_origin: Some(origin.to_string()),
            source_dir: None,
            temporary: false,
        }
    } else {
        let dir = std::path::PathBuf::from(origin);
        if !dir.is_dir() {
            bail!("repository directory '{}' does not exist", dir.display());
        }
        RepositoryConfig {
            git_origin: None,
            source_dir: Some(dir),
            temporary: false,
        }
    };
    repository::ensure_checkout(name, &config, &env.paths)?;
    registry.repositories.insert(name.to_string(), config);
    registry.log_change(&format!("Adding new repository {name}"));

    finish(&mut registry, env.backend.as_ref(), false, None)
}

/// `subuser repository remove <name>`
pub fn remove_repository(env: &Environment, name: &str) -> Result<()> {
    let (_lock, mut registry) = open_locked(&env.paths)?;
    let Some(config) = registry.repositories.get(name).cloned() else {
        bail!("no repository named '{name}'");
    };
    let referenced = registry
        .subusers
        .values()
        .chain(registry.locked_subusers.values())
        .any(|record| record.source_repo == name);
    if referenced {
        bail!("repository '{name}' is still referenced by a subuser");
    }

    registry.repositories.remove(name);
    registry.repository_states.remove(name);
    let checkout = repository::checkout_dir(name, &config, &env.paths);
    if checkout.is_dir() && repository::is_managed_checkout(&checkout, &env.paths) {
        std::fs::remove_dir_all(&checkout)
            .with_context(|| format!("removing checkout '{}'", checkout.display()))?;
    }
    registry.log_change(&format!("Removing repository {name}"));

    finish(&mut registry, env.backend.as_ref(), false, None)
}

/// `subuser list subusers [--json]`
pub fn list_subusers(paths: &Paths, json: bool) -> Result<String> {
    let registry = Registry::load(paths.clone())?;
    if json {
        let mut all = registry.subusers.clone();
        all.extend(registry.locked_subusers.clone());
        return Ok(serde_json::to_string_pretty(&all)?);
    }

    let mut out = String::new();
    for name in registry.all_subuser_names() {
        if subuser::is_service_name(&name) {
            continue;
        }
        let Some((record, locked)) = registry.subuser(&name) else {
            continue;
        };
        // Launch target comes from the effective permissions; a vanished
        // source just leaves it blank.
        let exec = effective_permissions(&registry, &name)
            .ok()
            .and_then(|p| p.executable)
            .map(|e| format!("  exec: {e}"))
            .unwrap_or_default();
        out.push_str(&format!(
            "{name}  {}@{}  image: {}{exec}{}\n",
            record.image_source,
            record.source_repo,
            record.docker_image.as_deref().unwrap_or("(not built)"),
            if locked { "  [locked]" } else { "" },
        ));
    }
    Ok(out)
}

/// `subuser list available [--json]` - image sources across all named
/// repositories.
pub fn list_available(paths: &Paths, json: bool) -> Result<String> {
    let registry = Registry::load(paths.clone())?;
    let mut by_repo: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, config) in &registry.repositories {
        let checkout = repository::checkout_dir(name, config, paths);
        by_repo.insert(name.clone(), ImageSource::list(&checkout)?);
    }

    if json {
        return Ok(serde_json::to_string_pretty(&by_repo)?);
    }
    let mut out = String::new();
    for (repo, sources) in &by_repo {
        for source in sources {
            out.push_str(&format!("{source}@{repo}\n"));
        }
    }
    Ok(out)
}

/// `subuser list installed-images [--json]`
pub fn list_installed_images(paths: &Paths, json: bool) -> Result<String> {
    let registry = Registry::load(paths.clone())?;
    if json {
        return Ok(serde_json::to_string_pretty(&registry.installed_images)?);
    }
    let mut out = String::new();
    for (id, record) in &registry.installed_images {
        out.push_str(&format!(
            "{id}  {}@{}\n",
            record.image_source, record.source_repo
        ));
    }
    Ok(out)
}

/// `subuser list repositories [--json]`
pub fn list_repositories(paths: &Paths, json: bool) -> Result<String> {
    let registry = Registry::load(paths.clone())?;
    if json {
        return Ok(serde_json::to_string_pretty(&registry.repositories)?);
    }
    let mut out = String::new();
    for (name, config) in &registry.repositories {
        let origin = config
            .git_origin
            .clone()
            .or_else(|| {
                config
                    .source_dir
                    .as_ref()
                    .map(|d| d.display().to_string())
            })
            .unwrap_or_default();
        out.push_str(&format!(
            "{name}  {origin}{}\n",
            if config.temporary { "  [temporary]" } else { "" }
        ));
    }
    Ok(out)
}
