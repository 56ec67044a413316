//! The installation task: reconciling subusers against their image sources.
//!
//! For each subuser the target lineage (declared dependency chain) is
//! compared against the installed lineage (backend layer parents); stale
//! sources are rebuilt bottom-up, carrying the freshly built parent id so
//! dependents rebase onto it. Classification results are memoized across the
//! whole batch, so an ancestor shared by many subusers is evaluated - and
//! built - at most once per pass.
//!
//! A build failure aborts only the owning subuser's lineage walk; the
//! subuser lands in the returned failed set and the batch continues.

use std::collections::BTreeSet;

use anyhow::{bail, Context, Result};

use crate::backend::BuildBackend;
use crate::images::{latest_installed, InstalledImage};
use crate::lineage::{installed_lineage, SourceResolver};
use crate::registry::Registry;
use crate::source::{ImageSource, SourceKey};

pub struct InstallationTask<'a> {
    backend: &'a dyn BuildBackend,
    /// Also consult the external staleness signal (upstream base images).
    check_external: bool,
    up_to_date: BTreeSet<SourceKey>,
    out_of_date: BTreeSet<SourceKey>,
}

impl<'a> InstallationTask<'a> {
    pub fn new(backend: &'a dyn BuildBackend, check_external: bool) -> Self {
        Self {
            backend,
            check_external,
            up_to_date: BTreeSet::new(),
            out_of_date: BTreeSet::new(),
        }
    }

    /// Reconcile the given subusers, lexicographically sorted. Returns the
    /// names that failed to check or build; the rest are up to date when
    /// this returns.
    pub fn reconcile(
        &mut self,
        registry: &mut Registry,
        targets: &[String],
    ) -> Result<BTreeSet<String>> {
        let mut names: Vec<String> = targets.to_vec();
        names.sort();
        names.dedup();

        let mut failed = BTreeSet::new();
        let mut stale = Vec::new();

        for name in &names {
            let Some((record, locked)) = registry.subuser(name) else {
                bail!("no subuser named '{name}'");
            };
            if locked && record.docker_image.is_some() {
                // Frozen to a snapshot; exempt from reconciliation.
                continue;
            }
            let record = record.clone();

            match self.subuser_up_to_date(registry, &record.source_repo, &record.image_source) {
                Ok(true) => {
                    // The source is current, but the subuser may still be
                    // bound to an older image (or none at all).
                    let latest = latest_installed(
                        &registry.installed_images,
                        &record.source_repo,
                        &record.image_source,
                    )
                    .map(|(id, _)| id.to_string());
                    if record.docker_image != latest {
                        stale.push(name.clone());
                    }
                }
                Ok(false) => stale.push(name.clone()),
                Err(e) => {
                    registry.log(&format!("Could not check {name}: {e:#}"));
                    failed.insert(name.clone());
                }
            }
        }

        for name in &stale {
            if let Err(e) = self.update_subuser(registry, name) {
                registry.log(&format!("Building image for {name} failed: {e:#}"));
                failed.insert(name.clone());
            }
        }

        Ok(failed)
    }

    fn subuser_up_to_date(
        &mut self,
        registry: &Registry,
        repo: &str,
        image: &str,
    ) -> Result<bool> {
        let resolver = SourceResolver {
            repositories: &registry.repositories,
            paths: registry.paths(),
        };
        let source = resolver.lookup(repo, image)?;
        self.source_up_to_date(registry, &source)
    }

    /// Memoized per-source staleness classification.
    fn source_up_to_date(&mut self, registry: &Registry, source: &ImageSource) -> Result<bool> {
        let key = source.key();
        if self.up_to_date.contains(&key) {
            return Ok(true);
        }
        if self.out_of_date.contains(&key) {
            return Ok(false);
        }
        let fresh = self.classify(registry, source)?;
        if fresh {
            self.up_to_date.insert(key);
        } else {
            self.out_of_date.insert(key);
        }
        Ok(fresh)
    }

    fn classify(&mut self, registry: &Registry, source: &ImageSource) -> Result<bool> {
        // 1. Never installed.
        let Some((installed_id, installed)) =
            latest_installed(&registry.installed_images, &source.repo_name, &source.name)
        else {
            return Ok(false);
        };
        let installed = installed.clone();
        let installed_id = installed_id.to_string();

        // 2. The backend lost the image.
        if self.backend.image_properties(&installed_id)?.is_none() {
            return Ok(false);
        }

        // 3. Dependency chain shape changed.
        let resolver = SourceResolver {
            repositories: &registry.repositories,
            paths: registry.paths(),
        };
        let target = resolver.target_lineage(source)?;
        let installed_chain = installed_lineage(self.backend, &installed_id)?;
        if target.len() != installed_chain.len() {
            return Ok(false);
        }

        // 4. Pairwise comparison, root to leaf. Every ancestor is classified
        // in its own right (memoized, so at most once per pass); a stale
        // ancestor, or an installed layer that is no longer the latest for
        // its source, means this image was not rebased after an ancestor
        // rebuild.
        let own_key = source.key();
        for (target_source, installed_layer_id) in target.iter().zip(&installed_chain) {
            if target_source.key() != own_key
                && !self.source_up_to_date(registry, target_source)?
            {
                return Ok(false);
            }
            let Some((latest_id, _)) = latest_installed(
                &registry.installed_images,
                &target_source.repo_name,
                &target_source.name,
            ) else {
                return Ok(false);
            };
            if latest_id != installed_layer_id {
                return Ok(false);
            }
        }

        // 5. Staleness token. The content hash is canonical; the legacy
        // last-update-time comparison only applies to records predating it.
        if let Some(hash) = &installed.image_source_hash {
            if *hash != source.content_hash()? {
                return Ok(false);
            }
        } else if let Some(stamp) = &installed.last_update_time {
            let declared = source.permissions()?.last_update_time;
            if declared.as_deref() != Some(stamp.as_str()) {
                return Ok(false);
            }
        } else {
            return Ok(false);
        }

        // 6. External staleness signal.
        if self.check_external
            && self
                .backend
                .newer_base_available(&source.build_file_text()?)?
        {
            return Ok(false);
        }

        Ok(true)
    }

    /// Rebuild one out-of-date subuser's lineage, root to leaf, reusing
    /// up-to-date ancestors and rebasing everything below a rebuilt one.
    fn update_subuser(&mut self, registry: &mut Registry, name: &str) -> Result<()> {
        let (record, _) = registry
            .subuser(name)
            .with_context(|| format!("no subuser named '{name}'"))?;
        let record = record.clone();

        let lineage = {
            let resolver = SourceResolver {
                repositories: &registry.repositories,
                paths: registry.paths(),
            };
            let source = resolver.lookup(&record.source_repo, &record.image_source)?;
            resolver.target_lineage(&source)?
        };

        let mut parent: Option<String> = None;
        for source in &lineage {
            let key = source.key();
            if self.source_up_to_date(registry, source)? {
                let (latest_id, _) =
                    latest_installed(&registry.installed_images, &source.repo_name, &source.name)
                        .with_context(|| {
                            format!("up-to-date source '{key}' has no installed image")
                        })?;
                parent = Some(latest_id.to_string());
                continue;
            }

            let build_file = source.build_file_with_parent(parent.as_deref())?;
            let image_id = self
                .backend
                .build(&source.image_dir(), &build_file, true, None)
                .with_context(|| format!("building '{key}'"))?;

            registry.installed_images.insert(
                image_id.clone(),
                InstalledImage {
                    image_source: source.name.clone(),
                    source_repo: source.repo_name.clone(),
                    image_source_hash: Some(source.content_hash()?),
                    last_update_time: None,
                },
            );
            registry.log_change(&format!("Installed new image {image_id} for {key}"));

            self.out_of_date.remove(&key);
            self.up_to_date.insert(key);
            parent = Some(image_id);
        }

        let final_id = parent.context("target lineage was empty")?;
        if record.docker_image.as_deref() != Some(final_id.as_str()) {
            if let Some(record) = registry.subuser_mut(name) {
                record.docker_image = Some(final_id.clone());
            }
            registry.log_change(&format!("Set image of subuser {name} to {final_id}"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::FakeBackend;
    use crate::paths::Paths;
    use crate::repository::RepositoryConfig;
    use crate::source::{BUILD_FILE, IMAGE_DIR, PERMISSIONS_FILE};
    use crate::subuser::SubuserRecord;
    use std::path::Path;
    use tempfile::TempDir;

    fn write_source(checkout: &Path, name: &str, build_file: &str) {
        let dir = checkout.join(name);
        std::fs::create_dir_all(dir.join(IMAGE_DIR)).unwrap();
        std::fs::write(dir.join(IMAGE_DIR).join(BUILD_FILE), build_file).unwrap();
        std::fs::write(dir.join(PERMISSIONS_FILE), "{}").unwrap();
    }

    fn setup(tmp: &TempDir) -> (Registry, std::path::PathBuf) {
        let checkout = tmp.path().join("sources");
        std::fs::create_dir_all(&checkout).unwrap();
        let mut registry = Registry::load(Paths::with_root(tmp.path().join("root"))).unwrap();
        registry.repositories.insert(
            "default".to_string(),
            RepositoryConfig {
                git_origin: None,
                source_dir: Some(checkout.clone()),
                temporary: false,
            },
        );
        (registry, checkout)
    }

    fn add_subuser(registry: &mut Registry, name: &str, image: &str) {
        registry.subusers.insert(
            name.to_string(),
            SubuserRecord {
                source_repo: "default".to_string(),
                image_source: image.to_string(),
                executable_shortcut_installed: false,
                docker_image: None,
                service_subusers: Vec::new(),
            },
        );
    }

    #[test]
    fn fresh_subuser_builds_its_whole_lineage_bottom_up() {
        let tmp = TempDir::new().unwrap();
        let (mut registry, checkout) = setup(&tmp);
        write_source(&checkout, "foo", "FROM alpine\nRUN echo foo\n");
        write_source(&checkout, "bar", "FROM-SUBUSER-IMAGE foo\nRUN echo bar\n");
        add_subuser(&mut registry, "x", "bar");

        let backend = FakeBackend::new();
        let mut task = InstallationTask::new(&backend, false);
        let failed = task.reconcile(&mut registry, &["x".to_string()]).unwrap();

        assert!(failed.is_empty());
        assert_eq!(backend.build_count(), 2, "foo then bar");

        let bound = registry.subuser("x").unwrap().0.docker_image.clone().unwrap();
        let chain = installed_lineage(&backend, &bound).unwrap();
        assert_eq!(chain.len(), 2, "bar sits on foo's layer");
        assert!(registry.installed_images.contains_key(&bound));
    }

    #[test]
    fn shared_ancestor_is_built_at_most_once_per_pass() {
        let tmp = TempDir::new().unwrap();
        let (mut registry, checkout) = setup(&tmp);
        write_source(&checkout, "base", "FROM alpine\nRUN echo base\n");
        write_source(&checkout, "left", "FROM-SUBUSER-IMAGE base\nRUN echo left\n");
        write_source(&checkout, "right", "FROM-SUBUSER-IMAGE base\nRUN echo right\n");
        add_subuser(&mut registry, "l", "left");
        add_subuser(&mut registry, "r", "right");

        let backend = FakeBackend::new();
        let mut task = InstallationTask::new(&backend, false);
        let failed = task
            .reconcile(&mut registry, &["l".to_string(), "r".to_string()])
            .unwrap();

        assert!(failed.is_empty());
        assert_eq!(backend.builds_containing("echo base"), 1);
        assert_eq!(backend.build_count(), 3);

        // Both dependents share the single base layer.
        let l_image = registry.subuser("l").unwrap().0.docker_image.clone().unwrap();
        let r_image = registry.subuser("r").unwrap().0.docker_image.clone().unwrap();
        let l_chain = installed_lineage(&backend, &l_image).unwrap();
        let r_chain = installed_lineage(&backend, &r_image).unwrap();
        assert_eq!(l_chain[0], r_chain[0]);
    }

    #[test]
    fn second_pass_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let (mut registry, checkout) = setup(&tmp);
        write_source(&checkout, "foo", "FROM alpine\n");
        add_subuser(&mut registry, "x", "foo");

        let backend = FakeBackend::new();
        InstallationTask::new(&backend, false)
            .reconcile(&mut registry, &["x".to_string()])
            .unwrap();
        let builds_after_first = backend.build_count();
        let bound = registry.subuser("x").unwrap().0.docker_image.clone();

        // Fresh task, same as a new process invocation.
        InstallationTask::new(&backend, false)
            .reconcile(&mut registry, &["x".to_string()])
            .unwrap();
        assert_eq!(backend.build_count(), builds_after_first);
        assert_eq!(registry.subuser("x").unwrap().0.docker_image, bound);
    }

    #[test]
    fn source_change_rebuilds_dependents_on_the_new_ancestor() {
        let tmp = TempDir::new().unwrap();
        let (mut registry, checkout) = setup(&tmp);
        write_source(&checkout, "foo", "FROM alpine\nRUN echo v1\n");
        write_source(&checkout, "bar", "FROM-SUBUSER-IMAGE foo\nRUN echo bar\n");
        add_subuser(&mut registry, "x", "bar");

        let backend = FakeBackend::new();
        InstallationTask::new(&backend, false)
            .reconcile(&mut registry, &["x".to_string()])
            .unwrap();
        assert_eq!(backend.build_count(), 2);

        // Ancestor source changes; both layers must rebuild and the subuser
        // must be rebased onto the new chain.
        write_source(&checkout, "foo", "FROM alpine\nRUN echo v2\n");
        InstallationTask::new(&backend, false)
            .reconcile(&mut registry, &["x".to_string()])
            .unwrap();
        assert_eq!(backend.build_count(), 4);

        let bound = registry.subuser("x").unwrap().0.docker_image.clone().unwrap();
        let chain = installed_lineage(&backend, &bound).unwrap();
        let (foo_latest, _) = latest_installed(&registry.installed_images, "default", "foo").unwrap();
        assert_eq!(chain[0], foo_latest);
    }

    #[test]
    fn changed_ancestor_deep_in_the_chain_is_detected() {
        let tmp = TempDir::new().unwrap();
        let (mut registry, checkout) = setup(&tmp);
        write_source(&checkout, "base", "FROM alpine\nRUN echo base\n");
        write_source(&checkout, "mid", "FROM-SUBUSER-IMAGE base\nRUN echo mid v1\n");
        write_source(&checkout, "leaf", "FROM-SUBUSER-IMAGE mid\nRUN echo leaf\n");
        add_subuser(&mut registry, "x", "leaf");

        let backend = FakeBackend::new();
        InstallationTask::new(&backend, false)
            .reconcile(&mut registry, &["x".to_string()])
            .unwrap();
        assert_eq!(backend.build_count(), 3);
        let base_id = latest_installed(&registry.installed_images, "default", "base")
            .unwrap()
            .0
            .to_string();

        // Only the middle source changes; its own leaf token is untouched.
        write_source(&checkout, "mid", "FROM-SUBUSER-IMAGE base\nRUN echo mid v2\n");
        InstallationTask::new(&backend, false)
            .reconcile(&mut registry, &["x".to_string()])
            .unwrap();

        // base is reused, mid and leaf are rebuilt and rebased.
        assert_eq!(backend.build_count(), 5);
        let bound = registry.subuser("x").unwrap().0.docker_image.clone().unwrap();
        let chain = installed_lineage(&backend, &bound).unwrap();
        assert_eq!(chain.len(), 3);
        assert_eq!(chain[0], base_id, "unchanged root layer is shared");
        assert_eq!(backend.builds_containing("mid v2"), 1);
    }

    #[test]
    fn lineage_length_invariant_holds_for_up_to_date_subusers() {
        let tmp = TempDir::new().unwrap();
        let (mut registry, checkout) = setup(&tmp);
        write_source(&checkout, "foo", "FROM alpine\n");
        write_source(&checkout, "bar", "FROM-SUBUSER-IMAGE foo\n");
        add_subuser(&mut registry, "x", "bar");

        let backend = FakeBackend::new();
        InstallationTask::new(&backend, false)
            .reconcile(&mut registry, &["x".to_string()])
            .unwrap();

        let resolver = SourceResolver {
            repositories: &registry.repositories,
            paths: registry.paths(),
        };
        let source = resolver.lookup("default", "bar").unwrap();
        let target = resolver.target_lineage(&source).unwrap();
        let bound = registry.subuser("x").unwrap().0.docker_image.clone().unwrap();
        let installed = installed_lineage(&backend, &bound).unwrap();

        assert_eq!(target.len(), installed.len());
        for (source, layer_id) in target.iter().zip(&installed) {
            let (latest, _) = latest_installed(
                &registry.installed_images,
                &source.repo_name,
                &source.name,
            )
            .unwrap();
            assert_eq!(latest, layer_id);
        }
    }

    #[test]
    fn unbound_subuser_reuses_an_up_to_date_image() {
        let tmp = TempDir::new().unwrap();
        let (mut registry, checkout) = setup(&tmp);
        write_source(&checkout, "foo", "FROM alpine\n");
        add_subuser(&mut registry, "x", "foo");

        let backend = FakeBackend::new();
        InstallationTask::new(&backend, false)
            .reconcile(&mut registry, &["x".to_string()])
            .unwrap();
        let bound = registry.subuser("x").unwrap().0.docker_image.clone();

        // A second subuser of the same source binds to the existing image
        // without another build.
        add_subuser(&mut registry, "y", "foo");
        InstallationTask::new(&backend, false)
            .reconcile(&mut registry, &["x".to_string(), "y".to_string()])
            .unwrap();
        assert_eq!(backend.build_count(), 1);
        assert_eq!(registry.subuser("y").unwrap().0.docker_image, bound);
    }

    #[test]
    fn build_failure_is_isolated_to_one_subuser() {
        let tmp = TempDir::new().unwrap();
        let (mut registry, checkout) = setup(&tmp);
        write_source(&checkout, "a", "FROM alpine\nRUN echo a\n");
        write_source(&checkout, "b", "FROM alpine\nRUN echo b-broken\n");
        write_source(&checkout, "c", "FROM alpine\nRUN echo c\n");
        add_subuser(&mut registry, "a", "a");
        add_subuser(&mut registry, "b", "b");
        add_subuser(&mut registry, "c", "c");

        let backend = FakeBackend::new();
        backend.fail_builds_containing("b-broken");

        let names: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        let failed = InstallationTask::new(&backend, false)
            .reconcile(&mut registry, &names)
            .unwrap();

        assert_eq!(failed, BTreeSet::from(["b".to_string()]));
        assert!(registry.subuser("a").unwrap().0.docker_image.is_some());
        assert!(registry.subuser("b").unwrap().0.docker_image.is_none());
        assert!(registry.subuser("c").unwrap().0.docker_image.is_some());

        // Fixing b's source brings it up to date without rebuilding a or c.
        backend.clear_forced_failures();
        write_source(&checkout, "b", "FROM alpine\nRUN echo b-fixed\n");
        let builds_before = backend.build_count();
        let failed = InstallationTask::new(&backend, false)
            .reconcile(&mut registry, &names)
            .unwrap();
        assert!(failed.is_empty());
        assert_eq!(backend.build_count(), builds_before + 1);
    }

    #[test]
    fn locked_subuser_with_an_image_is_left_alone() {
        let tmp = TempDir::new().unwrap();
        let (mut registry, checkout) = setup(&tmp);
        write_source(&checkout, "foo", "FROM alpine\nRUN echo v1\n");
        add_subuser(&mut registry, "x", "foo");

        let backend = FakeBackend::new();
        InstallationTask::new(&backend, false)
            .reconcile(&mut registry, &["x".to_string()])
            .unwrap();
        let bound = registry.subuser("x").unwrap().0.docker_image.clone();

        // Freeze, then change the source.
        let record = registry.subusers.remove("x").unwrap();
        registry.locked_subusers.insert("x".to_string(), record);
        write_source(&checkout, "foo", "FROM alpine\nRUN echo v2\n");

        InstallationTask::new(&backend, false)
            .reconcile(&mut registry, &["x".to_string()])
            .unwrap();
        assert_eq!(registry.subuser("x").unwrap().0.docker_image, bound);
        assert_eq!(backend.build_count(), 1, "no rebuild of a locked subuser");
    }

    #[test]
    fn locked_subuser_without_an_image_is_installed_once() {
        let tmp = TempDir::new().unwrap();
        let (mut registry, checkout) = setup(&tmp);
        write_source(&checkout, "foo", "FROM alpine\n");
        registry.locked_subusers.insert(
            "x".to_string(),
            SubuserRecord {
                source_repo: "default".to_string(),
                image_source: "foo".to_string(),
                executable_shortcut_installed: false,
                docker_image: None,
                service_subusers: Vec::new(),
            },
        );

        let backend = FakeBackend::new();
        InstallationTask::new(&backend, false)
            .reconcile(&mut registry, &["x".to_string()])
            .unwrap();
        assert!(registry.subuser("x").unwrap().0.docker_image.is_some());
    }

    #[test]
    fn broken_source_definition_does_not_sink_the_batch() {
        let tmp = TempDir::new().unwrap();
        let (mut registry, checkout) = setup(&tmp);
        write_source(&checkout, "good", "FROM alpine\n");
        write_source(&checkout, "bad", "FROM-SUBUSER-IMAGE one two three\n");
        add_subuser(&mut registry, "g", "good");
        add_subuser(&mut registry, "b", "bad");

        let backend = FakeBackend::new();
        let failed = InstallationTask::new(&backend, false)
            .reconcile(&mut registry, &["b".to_string(), "g".to_string()])
            .unwrap();

        assert_eq!(failed, BTreeSet::from(["b".to_string()]));
        assert!(registry.subuser("g").unwrap().0.docker_image.is_some());
    }

    #[test]
    fn external_staleness_signal_forces_a_rebuild() {
        let tmp = TempDir::new().unwrap();
        let (mut registry, checkout) = setup(&tmp);
        write_source(&checkout, "foo", "FROM alpine\n");
        add_subuser(&mut registry, "x", "foo");

        let backend = FakeBackend::new();
        InstallationTask::new(&backend, true)
            .reconcile(&mut registry, &["x".to_string()])
            .unwrap();
        assert_eq!(backend.build_count(), 1);

        backend.set_upstream_changed(true);
        InstallationTask::new(&backend, true)
            .reconcile(&mut registry, &["x".to_string()])
            .unwrap();
        assert_eq!(backend.build_count(), 2, "upstream change rebuilds");
    }

    #[test]
    fn legacy_timestamp_records_still_compare() {
        let tmp = TempDir::new().unwrap();
        let (mut registry, checkout) = setup(&tmp);
        write_source(&checkout, "foo", "FROM alpine\n");
        std::fs::write(
            checkout.join("foo").join(PERMISSIONS_FILE),
            r#"{"last-update-time": "2016-01-01-0000"}"#,
        )
        .unwrap();
        add_subuser(&mut registry, "x", "foo");

        let backend = FakeBackend::new();
        let id = backend
            .build(Path::new("/nowhere"), "FROM alpine\n", true, None)
            .unwrap();
        registry.installed_images.insert(
            id.clone(),
            InstalledImage {
                image_source: "foo".to_string(),
                source_repo: "default".to_string(),
                image_source_hash: None,
                last_update_time: Some("2016-01-01-0000".to_string()),
            },
        );
        registry.subuser_mut("x").unwrap().docker_image = Some(id.clone());

        // Tokens agree: no rebuild.
        InstallationTask::new(&backend, false)
            .reconcile(&mut registry, &["x".to_string()])
            .unwrap();
        assert_eq!(backend.build_count(), 1);

        // Declared time moves: legacy comparison detects staleness.
        std::fs::write(
            checkout.join("foo").join(PERMISSIONS_FILE),
            r#"{"last-update-time": "2017-01-01-0000"}"#,
        )
        .unwrap();
        InstallationTask::new(&backend, false)
            .reconcile(&mut registry, &["x".to_string()])
            .unwrap();
        assert_eq!(backend.build_count(), 2);
    }
}
