//! Subuser records.
//!
//! A subuser binds a name to one image source, an optional installed image,
//! and a permission override. Unlocked and locked subusers live in two
//! parallel tables: a locked record freezes its image id and permissions and
//! is exempt from reconciliation (unless it has no image at all, in which
//! case it is still installed once). Names beginning with `!` belong to
//! system-managed service subusers and are hidden from normal listings.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const SERVICE_PREFIX: char = '!';

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct SubuserRecord {
    pub source_repo: String,
    pub image_source: String,
    #[serde(default)]
    pub executable_shortcut_installed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_image: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub service_subusers: Vec<String>,
}

/// name -> record
pub type Subusers = BTreeMap<String, SubuserRecord>;

pub fn is_service_name(name: &str) -> bool {
    name.starts_with(SERVICE_PREFIX)
}

/// Validate a user-chosen subuser name.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("subuser names must not be empty");
    }
    if is_service_name(name) {
        bail!("subuser names starting with '{SERVICE_PREFIX}' are reserved for service subusers");
    }
    if name.contains('/') || name.contains(char::is_whitespace) {
        bail!("subuser name '{name}' must not contain slashes or whitespace");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_names_are_validated() {
        assert!(validate_name("vim").is_ok());
        assert!(validate_name("img-viewer_2").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("!service").is_err());
        assert!(validate_name("a b").is_err());
        assert!(validate_name("a/b").is_err());
    }

    #[test]
    fn records_round_trip_in_kebab_case() {
        let record = SubuserRecord {
            source_repo: "default".to_string(),
            image_source: "vim".to_string(),
            executable_shortcut_installed: true,
            docker_image: Some("abc".to_string()),
            service_subusers: vec!["!x11-bridge-vim".to_string()],
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"source-repo\""));
        assert!(json.contains("\"docker-image\""));
        let back: SubuserRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
