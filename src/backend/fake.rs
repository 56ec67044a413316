//! In-memory build backend for tests.
//!
//! Simulates the daemon's layer parentage: a build whose `FROM` line names an
//! image id this backend produced earlier records that id as the new image's
//! parent, exactly as the real daemon chains layers. Failures can be forced
//! per build-file marker to exercise partial-failure paths.
//!
//! Clones share one daemon state, so a test can keep a handle to the backend
//! it injected behind a `Box<dyn BuildBackend>`.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::Path;
use std::rc::Rc;

use anyhow::{bail, Result};

use super::{base_image_reference, BuildBackend, ImageProperties};

#[derive(Debug, Clone)]
struct FakeImage {
    parent: Option<String>,
    build_file: String,
}

#[derive(Debug, Default)]
struct Inner {
    images: BTreeMap<String, FakeImage>,
    next_id: u64,
    build_count: u64,
    fail_markers: Vec<String>,
    upstream_changed: bool,
}

#[derive(Debug, Clone, Default)]
pub struct FakeBackend {
    inner: Rc<RefCell<Inner>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Force every build whose build-file text contains `marker` to fail.
    pub fn fail_builds_containing(&self, marker: &str) {
        self.inner.borrow_mut().fail_markers.push(marker.to_string());
    }

    pub fn clear_forced_failures(&self) {
        self.inner.borrow_mut().fail_markers.clear();
    }

    /// Make `newer_base_available` report an upstream change.
    pub fn set_upstream_changed(&self, changed: bool) {
        self.inner.borrow_mut().upstream_changed = changed;
    }

    /// Total number of successful builds so far.
    pub fn build_count(&self) -> u64 {
        self.inner.borrow().build_count
    }

    /// Successful builds whose build-file text contains `needle`.
    pub fn builds_containing(&self, needle: &str) -> u64 {
        self.inner
            .borrow()
            .images
            .values()
            .filter(|img| img.build_file.contains(needle))
            .count() as u64
    }
}

impl BuildBackend for FakeBackend {
    fn build(
        &self,
        _context_dir: &Path,
        build_file: &str,
        _use_cache: bool,
        _tag: Option<&str>,
    ) -> Result<String> {
        let mut inner = self.inner.borrow_mut();
        for marker in &inner.fail_markers {
            if build_file.contains(marker) {
                bail!("simulated build failure (marker '{marker}')");
            }
        }

        let parent = base_image_reference(build_file)
            .filter(|base| inner.images.contains_key(*base))
            .map(str::to_string);

        inner.next_id += 1;
        let id = format!("fake-image-{:04}", inner.next_id);

        inner.images.insert(
            id.clone(),
            FakeImage {
                parent,
                build_file: build_file.to_string(),
            },
        );
        inner.build_count += 1;
        Ok(id)
    }

    fn image_properties(&self, image_id: &str) -> Result<Option<ImageProperties>> {
        Ok(self
            .inner
            .borrow()
            .images
            .get(image_id)
            .map(|img| ImageProperties {
                id: image_id.to_string(),
                parent: img.parent.clone(),
            }))
    }

    fn remove_image(&self, image_id: &str) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        if !inner.images.contains_key(image_id) {
            bail!("no such image: {image_id}");
        }
        let has_dependents = inner
            .images
            .values()
            .any(|img| img.parent.as_deref() == Some(image_id));
        if has_dependents {
            bail!("image {image_id} has dependent child images");
        }
        inner.images.remove(image_id);
        Ok(())
    }

    fn execute(&self, _argv: &[String]) -> Result<i32> {
        Ok(0)
    }

    fn newer_base_available(&self, _build_file: &str) -> Result<bool> {
        Ok(self.inner.borrow().upstream_changed)
    }
}
