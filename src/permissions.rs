//! The declarative permission set governing a subuser's sandbox.
//!
//! A permission file is a sparse JSON object: unspecified keys take the
//! static defaults below, unknown keys are rejected with the offending file
//! named. Per-subuser overrides are stored as the sparse difference against
//! the image source's defaults and layered back on load.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Sub-permissions of GUI access.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct GuiPermissions {
    pub clipboard: bool,
    pub system_tray: bool,
    pub cursors: bool,
    pub border_color: Option<String>,
}

/// The full permission vocabulary, one typed field per known key.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct Permissions {
    pub description: String,
    pub maintainer: String,
    /// Legacy staleness token; read for compatibility, never set by new
    /// image sources (content hashing superseded it).
    pub last_update_time: Option<String>,
    /// Path of the executable to launch inside the image.
    pub executable: Option<String>,
    pub stateful_home: bool,
    pub inherit_locale: bool,
    pub inherit_timezone: bool,
    pub gui: Option<GuiPermissions>,
    pub user_dirs: Vec<String>,
    pub inherit_envvars: Vec<String>,
    pub sound_card: bool,
    pub webcam: bool,
    pub access_working_directory: bool,
    pub allow_network_access: bool,
    pub x11: bool,
    /// Host directory -> in-container mount point.
    pub system_dirs: BTreeMap<String, String>,
    pub graphics_card: bool,
    pub serial_devices: bool,
    pub system_dbus: bool,
    pub as_root: bool,
    pub sudo: bool,
    pub privileged: bool,
}

impl Permissions {
    /// Load a permission file, filling unspecified keys from the defaults and
    /// rejecting unknown keys.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("reading permission file '{}'", path.display()))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing permission file '{}'", path.display()))
    }

    /// Layer a sparse override object over these permissions.
    ///
    /// Keys present in the override replace the corresponding field; the
    /// merged result is re-validated so an unknown or ill-typed override key
    /// fails with context rather than being silently dropped.
    pub fn apply_override(&self, override_object: &serde_json::Value) -> Result<Self> {
        let serde_json::Value::Object(overrides) = override_object else {
            bail!("permission override must be a JSON object");
        };
        let mut merged = match serde_json::to_value(self)? {
            serde_json::Value::Object(map) => map,
            _ => unreachable!("Permissions serializes to an object"),
        };
        for (key, value) in overrides {
            merged.insert(key.clone(), value.clone());
        }
        serde_json::from_value(serde_json::Value::Object(merged))
            .context("validating merged permission override")
    }

    /// The sparse difference of `self` against `defaults`: only keys whose
    /// value differs are emitted. This is the on-disk form of a per-subuser
    /// override file.
    pub fn sparse_against(&self, defaults: &Self) -> Result<serde_json::Value> {
        let mine = object_of(self)?;
        let base = object_of(defaults)?;
        let mut sparse = serde_json::Map::new();
        for (key, value) in mine {
            if base.get(&key) != Some(&value) {
                sparse.insert(key, value);
            }
        }
        Ok(serde_json::Value::Object(sparse))
    }
}

fn object_of(p: &Permissions) -> Result<serde_json::Map<String, serde_json::Value>> {
    match serde_json::to_value(p)? {
        serde_json::Value::Object(map) => Ok(map),
        _ => unreachable!("Permissions serializes to an object"),
    }
}

/// Read a sparse override file; a missing file means "no overrides".
pub fn load_override(path: &Path) -> Result<serde_json::Value> {
    if !path.exists() {
        return Ok(serde_json::Value::Object(serde_json::Map::new()));
    }
    let bytes = std::fs::read(path)
        .with_context(|| format!("reading permission override '{}'", path.display()))?;
    let value: serde_json::Value = serde_json::from_slice(&bytes)
        .with_context(|| format!("parsing permission override '{}'", path.display()))?;
    if !value.is_object() {
        bail!("permission override '{}' must be a JSON object", path.display());
    }
    Ok(value)
}
