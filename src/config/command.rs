use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};

/// Ownership and permission override for a retained path.
///
/// `uid`/`gid` of -1 leave the owner unchanged. `flags` carries the mode
/// bits; with `perms_only` only the permission bits (not setuid/setgid/sticky)
/// are applied.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct AccessInfo {
    #[serde(default)]
    pub flags: u32,
    #[serde(default)]
    pub perms_only: bool,
    #[serde(default = "unset_id")]
    pub uid: i64,
    #[serde(default = "unset_id")]
    pub gid: i64,
}

fn unset_id() -> i64 {
    -1
}

impl Default for AccessInfo {
    fn default() -> Self {
        AccessInfo {
            flags: 0,
            perms_only: false,
            uid: -1,
            gid: -1,
        }
    }
}

/// Path keyed policy map; a `None` value means "include, keep source access"
pub type PathPolicy = BTreeMap<String, Option<AccessInfo>>;

/// The policy handed to the sensor when monitoring starts.
///
/// Read-only to the artifact engine. Field names follow the wire format used
/// by the controlling process.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct StartCommand {
    #[serde(default)]
    pub app_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub app_args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub app_entrypoint: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub app_cmd: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub app_user: String,

    #[serde(default)]
    pub obfuscate_metadata: bool,
    #[serde(default)]
    pub keep_perms: bool,
    #[serde(default)]
    pub perms: BTreeMap<String, AccessInfo>,
    #[serde(default)]
    pub excludes: Vec<String>,
    #[serde(default)]
    pub exclude_varlock_files: bool,
    #[serde(default)]
    pub preserves: PathPolicy,
    #[serde(default)]
    pub includes: PathPolicy,
    #[serde(default)]
    pub include_bins: Vec<String>,
    #[serde(default)]
    pub include_dir_bins_list: PathPolicy,
    #[serde(default)]
    pub include_exes: Vec<String>,
    #[serde(default)]
    pub include_shell: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_workdir: Option<String>,

    #[serde(default)]
    pub include_cert_all: bool,
    #[serde(default)]
    pub include_cert_bundles: bool,
    #[serde(default)]
    pub include_cert_dirs: bool,
    #[serde(default)]
    pub include_cert_pk_all: bool,
    #[serde(default)]
    pub include_cert_pk_dirs: bool,

    #[serde(default)]
    pub include_ssh_client: bool,
    #[serde(default, rename = "include_oslibs_net")]
    pub include_os_libs_net: bool,
    #[serde(default)]
    pub include_zoneinfo: bool,

    #[serde(default)]
    pub include_app_nuxt_dir: bool,
    #[serde(default, rename = "include_app_nuxt_build")]
    pub include_app_nuxt_build_dir: bool,
    #[serde(default, rename = "include_app_nuxt_dist")]
    pub include_app_nuxt_dist_dir: bool,
    #[serde(default, rename = "include_app_nuxt_static")]
    pub include_app_nuxt_static_dir: bool,
    #[serde(default, rename = "include_app_nuxt_nm")]
    pub include_app_nuxt_node_modules_dir: bool,

    #[serde(default)]
    pub include_app_next_dir: bool,
    #[serde(default, rename = "include_app_next_build")]
    pub include_app_next_build_dir: bool,
    #[serde(default, rename = "include_app_next_dist")]
    pub include_app_next_dist_dir: bool,
    #[serde(default, rename = "include_app_next_static")]
    pub include_app_next_static_dir: bool,
    #[serde(default, rename = "include_app_next_nm")]
    pub include_app_next_node_modules_dir: bool,

    #[serde(default)]
    pub include_node_packages: Vec<String>,
}

impl StartCommand {
    /// Load the command from a JSON or YAML file, picked by extension
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .context(format!("Failed to read command file: {}", path.display()))?;

        let command = if is_yaml_path(path) {
            serde_yaml::from_str(&content).context("Failed to parse YAML command")?
        } else {
            serde_json::from_str(&content).context("Failed to parse JSON command")?
        };

        debug!("Loaded start command from {}", path.display());
        Ok(command)
    }

    /// Save the command as JSON or YAML, picked by extension
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let content = if is_yaml_path(path) {
            serde_yaml::to_string(self).context("Failed to serialize command to YAML")?
        } else {
            serde_json::to_string_pretty(self).context("Failed to serialize command to JSON")?
        };

        fs::write(path, content)
            .context(format!("Failed to write command to {}", path.display()))?;

        info!("Saved start command to {}", path.display());
        Ok(())
    }

    /// Include entries that carry an access override, overlaid by `perms`
    pub fn permission_overrides(&self) -> BTreeMap<String, AccessInfo> {
        let mut overrides: BTreeMap<String, AccessInfo> = self
            .includes
            .iter()
            .filter_map(|(path, access)| access.map(|a| (path.clone(), a)))
            .collect();

        for (path, access) in &self.perms {
            overrides.insert(path.clone(), *access);
        }

        overrides
    }

    /// Preserve entries that carry an access override
    pub fn preserve_overrides(&self) -> BTreeMap<String, AccessInfo> {
        self.preserves
            .iter()
            .filter_map(|(path, access)| access.map(|a| (path.clone(), a)))
            .collect()
    }

    /// True when any Nuxt directory toggle is set
    pub fn wants_nuxt_dirs(&self) -> bool {
        self.include_app_nuxt_dir
            || self.include_app_nuxt_build_dir
            || self.include_app_nuxt_dist_dir
            || self.include_app_nuxt_static_dir
            || self.include_app_nuxt_node_modules_dir
    }

    /// True when any Next.js directory toggle is set
    pub fn wants_next_dirs(&self) -> bool {
        self.include_app_next_dir
            || self.include_app_next_build_dir
            || self.include_app_next_dist_dir
            || self.include_app_next_static_dir
            || self.include_app_next_node_modules_dir
    }
}

fn is_yaml_path(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yaml") | Some("yml")
    )
}
