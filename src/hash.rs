//! Deterministic content hashing of image source build directories.
//!
//! The hash covers relative paths, file modes, and file contents, walked in
//! sorted order, so two checkouts with identical contents hash identically
//! regardless of directory iteration order or timestamps.

use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::Path;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

/// Hash a build directory into a hex sha256 string.
pub fn hash_directory(dir: &Path) -> Result<String> {
    let mut entries: Vec<_> = WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.path() != dir)
        .map(|e| e.path().to_path_buf())
        .collect();

    entries.sort_by(|a, b| {
        let ra = a.strip_prefix(dir).unwrap_or(a).to_string_lossy().to_string();
        let rb = b.strip_prefix(dir).unwrap_or(b).to_string_lossy().to_string();
        ra.cmp(&rb)
    });

    let mut hasher = Sha256::new();
    for path in entries {
        let rel = path
            .strip_prefix(dir)
            .unwrap_or(&path)
            .to_string_lossy()
            .replace('\\', "/");

        let md = fs::symlink_metadata(&path)
            .with_context(|| format!("reading metadata of '{}'", path.display()))?;

        hasher.update(rel.as_bytes());
        hasher.update([0u8]);
        hasher.update(mode_of(&md).to_le_bytes());

        if md.file_type().is_symlink() {
            let target = fs::read_link(&path)
                .with_context(|| format!("reading symlink '{}'", path.display()))?;
            hasher.update(target.to_string_lossy().as_bytes());
        } else if md.is_file() {
            hash_file_into(&mut hasher, &path)?;
        }
        hasher.update([0u8]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

fn hash_file_into(hasher: &mut Sha256, path: &Path) -> Result<()> {
    let f = File::open(path).with_context(|| format!("opening '{}'", path.display()))?;
    let mut r = BufReader::new(f);
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = r
            .read(&mut buf)
            .with_context(|| format!("reading '{}'", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(())
}

#[cfg(unix)]
fn mode_of(md: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    md.permissions().mode()
}

#[cfg(not(unix))]
fn mode_of(md: &fs::Metadata) -> u32 {
    if md.is_dir() {
        0o755
    } else {
        0o644
    }
}
