//! Image sources: the buildable units inside a repository checkout.
//!
//! On disk, a source named `foo` is the directory `<checkout>/foo/` holding
//! `permissions.json` (its permission defaults) and `image/SubuserImagefile`
//! (its build file). The first meaningful build-file line is either a plain
//! `FROM <base>` or `FROM-SUBUSER-IMAGE <image>[@<repository>]`, the latter
//! declaring the source's single dependency.
//!
//! Sources are derived transiently from checkout contents and never persisted
//! themselves.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::hash;
use crate::permissions::Permissions;

pub const IMAGE_DIR: &str = "image";
pub const BUILD_FILE: &str = "SubuserImagefile";
pub const PERMISSIONS_FILE: &str = "permissions.json";
pub const DEPENDENCY_KEYWORD: &str = "FROM-SUBUSER-IMAGE";

/// Composite identity of an image source: name plus owning repository.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SourceKey {
    pub repo: String,
    pub image: String,
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.image, self.repo)
    }
}

/// A dependency reference as written in a build file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRef {
    pub image: String,
    pub repo: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ImageSource {
    pub name: String,
    pub repo_name: String,
    dir: PathBuf,
}

impl ImageSource {
    /// Open a source inside a repository checkout.
    pub fn open(repo_name: &str, checkout_dir: &Path, name: &str) -> Result<Self> {
        let dir = checkout_dir.join(name);
        let build_file = dir.join(IMAGE_DIR).join(BUILD_FILE);
        if !build_file.is_file() {
            bail!(
                "no image source '{}' in repository '{}' (missing '{}')",
                name,
                repo_name,
                build_file.display()
            );
        }
        Ok(Self {
            name: name.to_string(),
            repo_name: repo_name.to_string(),
            dir,
        })
    }

    /// Names of all image sources in a checkout, sorted.
    pub fn list(checkout_dir: &Path) -> Result<Vec<String>> {
        if !checkout_dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in std::fs::read_dir(checkout_dir)
            .with_context(|| format!("reading repository checkout '{}'", checkout_dir.display()))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            if entry.path().join(IMAGE_DIR).join(BUILD_FILE).is_file() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn key(&self) -> SourceKey {
        SourceKey {
            repo: self.repo_name.clone(),
            image: self.name.clone(),
        }
    }

    /// The build context directory passed to the backend.
    pub fn image_dir(&self) -> PathBuf {
        self.dir.join(IMAGE_DIR)
    }

    pub fn build_file_path(&self) -> PathBuf {
        self.image_dir().join(BUILD_FILE)
    }

    pub fn build_file_text(&self) -> Result<String> {
        let path = self.build_file_path();
        std::fs::read_to_string(&path)
            .with_context(|| format!("reading build file '{}'", path.display()))
    }

    /// Permission defaults of this source. A missing or malformed file is a
    /// source-definition error, fatal to this lineage only.
    pub fn permissions(&self) -> Result<Permissions> {
        Permissions::load(&self.dir.join(PERMISSIONS_FILE))
    }

    /// The source's single declared dependency, if any.
    ///
    /// Malformed declarations are reported with file and line context.
    pub fn dependency(&self) -> Result<Option<SourceRef>> {
        let text = self.build_file_text()?;
        let Some((line_no, line)) = first_meaningful_line(&text) else {
            bail!(
                "build file '{}' is empty; expected a FROM or {} line",
                self.build_file_path().display(),
                DEPENDENCY_KEYWORD
            );
        };

        // The keyword must be a whole token: `FROM-SUBUSER-IMAGEfoo` is a
        // syntax error, not a dependency on `foo`.
        let mut words = line.split_whitespace();
        match words.next() {
            Some(DEPENDENCY_KEYWORD) => {}
            Some("FROM") => return Ok(None),
            _ => bail!(
                "invalid build file '{}' line {}: expected FROM or {}, found '{}'",
                self.build_file_path().display(),
                line_no,
                DEPENDENCY_KEYWORD,
                line
            ),
        }

        let tokens: Vec<&str> = words.collect();
        let [identifier] = tokens.as_slice() else {
            bail!(
                "invalid dependency declaration in '{}' line {}: expected exactly one \
                 image[@repository] argument",
                self.build_file_path().display(),
                line_no
            );
        };

        let (image, repo) = match identifier.split_once('@') {
            Some((image, repo)) => (image, Some(repo.to_string())),
            None => (*identifier, None),
        };
        if image.is_empty() || repo.as_deref() == Some("") {
            bail!(
                "invalid dependency declaration in '{}' line {}: empty image or repository name",
                self.build_file_path().display(),
                line_no
            );
        }

        Ok(Some(SourceRef {
            image: image.to_string(),
            repo,
        }))
    }

    /// Content hash of the source directory; the canonical staleness token.
    pub fn content_hash(&self) -> Result<String> {
        hash::hash_directory(&self.dir)
            .with_context(|| format!("hashing image source '{}'", self.key()))
    }

    /// The build-file text with the dependency line replaced by a `FROM` on
    /// the freshly built parent image.
    pub fn build_file_with_parent(&self, parent: Option<&str>) -> Result<String> {
        let text = self.build_file_text()?;
        if self.dependency()?.is_none() {
            return Ok(text);
        }
        let parent = parent.with_context(|| {
            format!(
                "image source '{}' declares a dependency but no parent image was built",
                self.key()
            )
        })?;

        let mut replaced = false;
        let mut out = String::with_capacity(text.len());
        for line in text.lines() {
            if !replaced && line.split_whitespace().next() == Some(DEPENDENCY_KEYWORD) {
                out.push_str(&format!("FROM {parent}"));
                replaced = true;
            } else {
                out.push_str(line);
            }
            out.push('\n');
        }
        Ok(out)
    }
}

fn first_meaningful_line(text: &str) -> Option<(usize, &str)> {
    text.lines()
        .enumerate()
        .map(|(i, l)| (i + 1, l.trim()))
        .find(|(_, l)| !l.is_empty() && !l.starts_with('#'))
}
