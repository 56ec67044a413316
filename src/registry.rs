//! The registry: the versioned aggregate root of all subuser state.
//!
//! Owns the subuser tables (unlocked and locked), the repository tables, and
//! the installed-images table, plus a pending change-log buffer. The state
//! directory is itself a git repository: every `commit()` is one VCS commit
//! whose message is the accumulated change log, and `rollback()` restores a
//! prior commit's files as a new forward commit. History is never rewritten.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::git;
use crate::images::InstalledImages;
use crate::live_log;
use crate::paths::{
    Paths, INSTALLED_IMAGES_FILE, LOCKED_SUBUSERS_FILE, REPOSITORIES_FILE,
    REPOSITORY_STATES_FILE, SUBUSERS_FILE,
};
use crate::repository::{Repositories, RepositoryStates};
use crate::subuser::{SubuserRecord, Subusers};

pub struct Registry {
    paths: Paths,
    pub repositories: Repositories,
    pub repository_states: RepositoryStates,
    pub subusers: Subusers,
    pub locked_subusers: Subusers,
    pub installed_images: InstalledImages,
    change_log: Vec<String>,
    dirty: bool,
}

impl Registry {
    /// Load the registry, initializing the state directory on first use.
    pub fn load(paths: Paths) -> Result<Self> {
        git::ensure_available()?;
        git::init_if_needed(&paths.registry_dir())?;

        let mut registry = Self {
            paths,
            repositories: Repositories::new(),
            repository_states: RepositoryStates::new(),
            subusers: Subusers::new(),
            locked_subusers: Subusers::new(),
            installed_images: InstalledImages::new(),
            change_log: Vec::new(),
            dirty: false,
        };
        registry.reload_tables()?;
        Ok(registry)
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    fn reload_tables(&mut self) -> Result<()> {
        self.repositories = read_table(&self.paths.registry_file(REPOSITORIES_FILE))?;
        self.repository_states = read_table(&self.paths.registry_file(REPOSITORY_STATES_FILE))?;
        self.subusers = read_table(&self.paths.registry_file(SUBUSERS_FILE))?;
        self.locked_subusers = read_table(&self.paths.registry_file(LOCKED_SUBUSERS_FILE))?;
        self.installed_images = read_table(&self.paths.registry_file(INSTALLED_IMAGES_FILE))?;
        Ok(())
    }

    /// Print a line and forward it to live-log subscribers. Does not dirty
    /// the pending commit.
    pub fn log(&self, message: &str) {
        println!("{message}");
        let stamp = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_default();
        live_log::broadcast(&self.paths, &format!("[{stamp}] {message}"));
    }

    /// Log a state-changing event: printed, forwarded, and accumulated into
    /// the message of the next commit.
    pub fn log_change(&mut self, message: &str) {
        self.log(message);
        self.change_log.push(message.to_string());
        self.dirty = true;
    }

    /// Look up a subuser in either table. The flag reports whether the
    /// record came from the locked table.
    pub fn subuser(&self, name: &str) -> Option<(&SubuserRecord, bool)> {
        if let Some(record) = self.subusers.get(name) {
            return Some((record, false));
        }
        self.locked_subusers.get(name).map(|record| (record, true))
    }

    pub fn subuser_mut(&mut self, name: &str) -> Option<&mut SubuserRecord> {
        if let Some(record) = self.subusers.get_mut(name) {
            return Some(record);
        }
        self.locked_subusers.get_mut(name)
    }

    /// All subuser names across both tables, lexicographically sorted so
    /// batch processing is reproducible.
    pub fn all_subuser_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .subusers
            .keys()
            .chain(self.locked_subusers.keys())
            .cloned()
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Persist all tables to their on-disk JSON forms.
    pub fn write_tables(&self) -> Result<()> {
        write_table(&self.paths.registry_file(REPOSITORIES_FILE), &self.repositories)?;
        write_table(
            &self.paths.registry_file(REPOSITORY_STATES_FILE),
            &self.repository_states,
        )?;
        write_table(&self.paths.registry_file(SUBUSERS_FILE), &self.subusers)?;
        write_table(
            &self.paths.registry_file(LOCKED_SUBUSERS_FILE),
            &self.locked_subusers,
        )?;
        self.write_installed_images()
    }

    pub fn write_installed_images(&self) -> Result<()> {
        write_table(
            &self.paths.registry_file(INSTALLED_IMAGES_FILE),
            &self.installed_images,
        )
    }

    /// Commit the pending state. A no-op when no change was logged this
    /// session. Returns the new commit hash, broadcast to live-log
    /// subscribers.
    pub fn commit(&mut self) -> Result<Option<String>> {
        if !self.dirty {
            return Ok(None);
        }
        self.write_tables()?;

        let dir = self.paths.registry_dir();
        git::add_all(&dir)?;
        let message = self.change_log.join("\n");
        let hash = git::commit(&dir, &message)?;

        live_log::broadcast(&self.paths, &format!("commit {hash}"));
        self.change_log.clear();
        self.dirty = false;
        Ok(Some(hash))
    }

    /// Restore the registry files to a prior commit and reload all in-memory
    /// state from disk. The caller re-runs verification and commits the
    /// result forward.
    pub fn rollback(&mut self, commit: &str) -> Result<()> {
        let dir = self.paths.registry_dir();
        if !git::has_commits(&dir) {
            bail!("the registry has no commits to roll back to");
        }
        git::restore_to(&dir, commit)?;
        self.reload_tables()
            .context("reloading registry state after rollback")?;
        Ok(())
    }

    pub fn history(&self) -> Result<String> {
        let dir = self.paths.registry_dir();
        if !git::has_commits(&dir) {
            return Ok(String::new());
        }
        git::log(&dir)
    }

    /// A table file's contents as of a given commit.
    pub fn table_at_commit<T: DeserializeOwned>(&self, commit: &str, file: &str) -> Result<T> {
        let text = git::show_file(&self.paths.registry_dir(), commit, file)?;
        serde_json::from_str(&text)
            .with_context(|| format!("parsing '{file}' at commit {commit}"))
    }
}

fn read_table<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    let bytes =
        std::fs::read(path).with_context(|| format!("reading table '{}'", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("parsing table '{}'", path.display()))
}

fn write_table<T: Serialize>(path: &Path, table: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating '{}'", parent.display()))?;
    }
    let mut bytes = serde_json::to_vec_pretty(table)?;
    bytes.push(b'\n');
    std::fs::write(path, bytes).with_context(|| format!("writing table '{}'", path.display()))
}
