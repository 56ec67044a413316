//! The container build/runtime backend boundary.
//!
//! The reconciliation engine consumes this trait and never talks to a
//! container daemon directly; the real client and the in-memory fake are
//! selected by dependency injection at startup.

pub mod docker;
pub mod fake;

use std::path::Path;

use anyhow::Result;

pub use docker::DockerBackend;
pub use fake::FakeBackend;

/// Layer metadata of one installed image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageProperties {
    pub id: String,
    /// The backend's layer-parent pointer; `None` for a root image.
    pub parent: Option<String>,
}

pub trait BuildBackend {
    /// Build an image from a build context directory and build-file text.
    /// Returns the new image id.
    fn build(
        &self,
        context_dir: &Path,
        build_file: &str,
        use_cache: bool,
        tag: Option<&str>,
    ) -> Result<String>;

    /// Look up an image; `None` when the backend has no record of the id.
    fn image_properties(&self, image_id: &str) -> Result<Option<ImageProperties>>;

    /// Remove an image. Errors when the image has dependent layers or does
    /// not exist.
    fn remove_image(&self, image_id: &str) -> Result<()>;

    /// Run a backend command, returning its exit code.
    fn execute(&self, argv: &[String]) -> Result<i32>;

    /// External staleness signal: has the upstream base image named in a
    /// plain `FROM` line changed even though local metadata agrees?
    fn newer_base_available(&self, build_file: &str) -> Result<bool>;
}

/// The plain `FROM` base reference of a build file, if any. Dependency lines
/// (`FROM-SUBUSER-IMAGE`) are not upstream bases and are skipped.
pub fn base_image_reference(build_file: &str) -> Option<&str> {
    for line in build_file.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut words = line.split_whitespace();
        return match words.next() {
            Some("FROM") => words.next(),
            _ => None,
        };
    }
    None
}
