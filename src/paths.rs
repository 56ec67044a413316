//! On-disk layout of a user's subuser installation.
//!
//! Everything lives under one root (default `~/.subuser`, overridable with
//! the `SUBUSER_ROOT` environment variable so tests and sandboxed installs
//! can relocate it):
//!
//! - `registry/` - the version-controlled state directory (JSON tables and
//!   per-subuser permission files; one git commit per registry commit)
//! - `repositories/<id>/` - managed checkouts of git-backed repositories
//! - `bin/` - launcher shortcuts, rebuilt from scratch by verification
//! - `live-log/` - named pipes of live-log subscribers
//! - `registry.lock` - the advisory lock gating registry mutation

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub const ROOT_ENV_VAR: &str = "SUBUSER_ROOT";

/// Names of the JSON tables inside the registry state directory.
pub const SUBUSERS_FILE: &str = "subusers.json";
pub const LOCKED_SUBUSERS_FILE: &str = "locked-subusers.json";
pub const REPOSITORIES_FILE: &str = "repositories.json";
pub const REPOSITORY_STATES_FILE: &str = "repository-states.json";
pub const INSTALLED_IMAGES_FILE: &str = "installed-images.json";

#[derive(Debug, Clone)]
pub struct Paths {
    root: PathBuf,
}

impl Paths {
    /// Resolve the installation root for this invocation.
    pub fn resolve() -> Result<Self> {
        if let Some(root) = std::env::var_os(ROOT_ENV_VAR) {
            return Ok(Self { root: PathBuf::from(root) });
        }
        let home = dirs::home_dir().context("resolving the user's home directory")?;
        Ok(Self { root: home.join(".subuser") })
    }

    /// Root at an explicit location. Used by tests.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn registry_dir(&self) -> PathBuf {
        self.root.join("registry")
    }

    pub fn registry_file(&self, name: &str) -> PathBuf {
        self.registry_dir().join(name)
    }

    /// Directory of per-subuser sparse permission override files, inside the
    /// registry so overrides are versioned together with the tables.
    pub fn permissions_dir(&self, subuser_name: &str) -> PathBuf {
        self.registry_dir().join("permissions").join(subuser_name)
    }

    pub fn permissions_file(&self, subuser_name: &str) -> PathBuf {
        self.permissions_dir(subuser_name).join("permissions.json")
    }

    /// Managed checkouts of git-backed repositories, keyed by repository id.
    pub fn repositories_dir(&self) -> PathBuf {
        self.root.join("repositories")
    }

    pub fn repository_checkout_dir(&self, repository_name: &str) -> PathBuf {
        self.repositories_dir().join(repository_name)
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.root.join("bin")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.root.join("registry.lock")
    }

    pub fn live_log_dir(&self) -> PathBuf {
        self.root.join("live-log")
    }
}
