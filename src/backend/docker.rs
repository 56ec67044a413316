//! Docker CLI client.
//!
//! Talks to the local daemon through the `docker` executable. Availability is
//! checked eagerly at construction so operations fail with setup guidance
//! before any registry state is touched. Build output is streamed line by
//! line; builds are synchronous, blocking round-trips.

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{bail, Context, Result};

use super::{base_image_reference, BuildBackend, ImageProperties};

#[derive(Debug, Clone)]
pub struct DockerBackend {
    docker: PathBuf,
}

impl DockerBackend {
    /// Locate the docker executable and verify the daemon is reachable.
    pub fn connect() -> Result<Self> {
        let docker = which::which("docker").map_err(|_| {
            anyhow::anyhow!(
                "docker is not installed or not on PATH. Install docker and ensure \
                 your user may reach the daemon (e.g. membership in the docker group)."
            )
        })?;

        let status = Command::new(&docker)
            .arg("info")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .context("running `docker info`")?;
        if !status.success() {
            bail!(
                "the docker daemon is not reachable. Start it (e.g. \
                 `systemctl start docker`) or check that your user may access it."
            );
        }

        Ok(Self { docker })
    }

    fn image_id_of(&self, reference: &str) -> Result<Option<String>> {
        let output = Command::new(&self.docker)
            .args(["image", "inspect", "--format", "{{.Id}}", reference])
            .output()
            .with_context(|| format!("inspecting image '{reference}'"))?;
        if !output.status.success() {
            return Ok(None);
        }
        Ok(Some(
            String::from_utf8_lossy(&output.stdout).trim().to_string(),
        ))
    }
}

impl BuildBackend for DockerBackend {
    fn build(
        &self,
        context_dir: &Path,
        build_file: &str,
        use_cache: bool,
        tag: Option<&str>,
    ) -> Result<String> {
        let iid_file = context_dir.join(".subuser-iid");

        let mut cmd = Command::new(&self.docker);
        cmd.arg("build")
            .arg("-f")
            .arg("-")
            .arg("--iidfile")
            .arg(&iid_file);
        if !use_cache {
            cmd.arg("--no-cache");
        }
        if let Some(tag) = tag {
            cmd.args(["-t", tag]);
        }
        cmd.arg(context_dir);
        cmd.stdin(Stdio::piped()).stdout(Stdio::piped());

        let mut child = cmd
            .spawn()
            .with_context(|| format!("starting docker build in '{}'", context_dir.display()))?;

        child
            .stdin
            .take()
            .context("opening docker build stdin")?
            .write_all(build_file.as_bytes())
            .context("sending build file to docker")?;

        // Forward progress incrementally so long builds stay observable.
        if let Some(stdout) = child.stdout.take() {
            for line in BufReader::new(stdout).lines() {
                let line = line.context("reading docker build output")?;
                println!("{line}");
            }
        }

        let status = child.wait().context("waiting for docker build")?;
        if !status.success() {
            let _ = std::fs::remove_file(&iid_file);
            bail!(
                "docker build failed in '{}' with status {status}",
                context_dir.display()
            );
        }

        let id = std::fs::read_to_string(&iid_file)
            .with_context(|| format!("reading image id file '{}'", iid_file.display()))?
            .trim()
            .to_string();
        let _ = std::fs::remove_file(&iid_file);
        if id.is_empty() {
            bail!("docker build produced no image id");
        }
        Ok(id)
    }

    fn image_properties(&self, image_id: &str) -> Result<Option<ImageProperties>> {
        let output = Command::new(&self.docker)
            .args([
                "image",
                "inspect",
                "--format",
                "{{.Id}}\t{{.Parent}}",
                image_id,
            ])
            .output()
            .with_context(|| format!("inspecting image '{image_id}'"))?;
        if !output.status.success() {
            return Ok(None);
        }

        let text = String::from_utf8_lossy(&output.stdout);
        let mut parts = text.trim().splitn(2, '\t');
        let id = parts.next().unwrap_or_default().to_string();
        let parent = parts
            .next()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string);
        Ok(Some(ImageProperties { id, parent }))
    }

    fn remove_image(&self, image_id: &str) -> Result<()> {
        let output = Command::new(&self.docker)
            .args(["rmi", image_id])
            .output()
            .with_context(|| format!("removing image '{image_id}'"))?;
        if !output.status.success() {
            bail!(
                "removing image '{}' failed: {}",
                image_id,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    fn execute(&self, argv: &[String]) -> Result<i32> {
        let status = Command::new(&self.docker)
            .args(argv)
            .status()
            .with_context(|| format!("running docker {argv:?}"))?;
        Ok(status.code().unwrap_or(-1))
    }

    fn newer_base_available(&self, build_file: &str) -> Result<bool> {
        let Some(reference) = base_image_reference(build_file) else {
            return Ok(false);
        };

        let before = self.image_id_of(reference)?;
        let status = Command::new(&self.docker)
            .args(["pull", reference])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .with_context(|| format!("pulling base image '{reference}'"))?;
        if !status.success() {
            // Unreachable registry is not staleness evidence.
            return Ok(false);
        }
        let after = self.image_id_of(reference)?;
        Ok(before != after)
    }
}
