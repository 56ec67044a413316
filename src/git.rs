//! Shell-out git client.
//!
//! Covers the two git consumers in this crate: fetching image source
//! repositories (clone/pull) and version-stamping the registry state
//! directory (init/add/commit/log/show/restore). Plain local-directory
//! repositories bypass this module entirely.

use std::path::Path;
use std::process::Command;

use anyhow::{bail, Context, Result};

/// Fail eagerly, with setup guidance, when git is not installed.
pub fn ensure_available() -> Result<()> {
    if which::which("git").is_err() {
        bail!(
            "git is not installed or not on PATH. Install git (e.g. `apt install git`) \
             and retry."
        );
    }
    Ok(())
}

pub fn clone(uri: &str, dest: &Path) -> Result<()> {
    let output = Command::new("git")
        .args(["clone", "-q", uri])
        .arg(dest)
        .output()
        .with_context(|| format!("running git clone for '{uri}'"))?;
    if !output.status.success() {
        bail!(
            "cloning '{}' into '{}' failed: {}",
            uri,
            dest.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

pub fn pull(dir: &Path) -> Result<()> {
    run(dir, &["pull", "-q"]).with_context(|| format!("pulling '{}'", dir.display()))?;
    Ok(())
}

pub fn current_commit_hash(dir: &Path) -> Result<String> {
    let out = run(dir, &["rev-parse", "HEAD"])
        .with_context(|| format!("reading HEAD of '{}'", dir.display()))?;
    Ok(out.trim().to_string())
}

/// Initialize the registry state directory as a git repository if it is not
/// one already.
pub fn init_if_needed(dir: &Path) -> Result<()> {
    if dir.join(".git").exists() {
        return Ok(());
    }
    std::fs::create_dir_all(dir)
        .with_context(|| format!("creating registry directory '{}'", dir.display()))?;
    run(dir, &["init", "-q"])
        .with_context(|| format!("initializing registry repository '{}'", dir.display()))?;
    Ok(())
}

pub fn add_all(dir: &Path) -> Result<()> {
    run(dir, &["add", "-A"]).with_context(|| format!("staging '{}'", dir.display()))?;
    Ok(())
}

/// Create one commit and return its hash. The committer identity is pinned so
/// commits work without per-user git configuration.
pub fn commit(dir: &Path, message: &str) -> Result<String> {
    run(
        dir,
        &[
            "-c",
            "user.name=subuser registry",
            "-c",
            "user.email=subuser@localhost",
            "commit",
            "-q",
            "--allow-empty",
            "-m",
            message,
        ],
    )
    .with_context(|| format!("committing registry '{}'", dir.display()))?;
    current_commit_hash(dir)
}

pub fn log(dir: &Path) -> Result<String> {
    run(dir, &["log", "--no-color"]).with_context(|| format!("reading log of '{}'", dir.display()))
}

pub fn has_commits(dir: &Path) -> bool {
    run(dir, &["rev-parse", "HEAD"]).is_ok()
}

/// Read one file's contents as of a given commit.
pub fn show_file(dir: &Path, commit: &str, rel_path: &str) -> Result<String> {
    run(dir, &["show", &format!("{commit}:{rel_path}")]).with_context(|| {
        format!(
            "reading '{}' at commit {} from '{}'",
            rel_path,
            commit,
            dir.display()
        )
    })
}

/// Restore the working tree to the tracked state at `commit`, discarding
/// uncommitted working files entirely. History is not rewritten; the caller
/// records the restore as a new forward commit.
pub fn restore_to(dir: &Path, commit: &str) -> Result<()> {
    // Drop every currently tracked working file, then everything untracked,
    // then materialize the tree as of the requested commit.
    let tracked = run(dir, &["ls-files"])
        .with_context(|| format!("listing tracked files of '{}'", dir.display()))?;
    for rel in tracked.lines().filter(|l| !l.is_empty()) {
        let path = dir.join(rel);
        if path.is_file() {
            std::fs::remove_file(&path)
                .with_context(|| format!("removing '{}'", path.display()))?;
        }
    }
    run(dir, &["clean", "-fdq"])
        .with_context(|| format!("removing untracked files in '{}'", dir.display()))?;
    run(dir, &["checkout", commit, "--", "."])
        .with_context(|| format!("restoring '{}' to commit {commit}", dir.display()))?;
    Ok(())
}

fn run(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .current_dir(dir)
        .args(args)
        .output()
        .with_context(|| format!("running git {:?} in '{}'", args, dir.display()))?;
    if !output.status.success() {
        bail!(
            "git {:?} failed in '{}': {}",
            args,
            dir.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
