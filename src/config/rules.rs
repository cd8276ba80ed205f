use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::constants::DEFAULT_SYMLINK_FIXPOINT_ROUNDS;

/// Byte-level patch applied to copied executables when metadata
/// obfuscation is enabled.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct BinaryPatchRule {
    /// Applies when the source path ends with this suffix
    pub path_suffix: String,
    /// Bytes to search for
    pub find: String,
    /// Replacement bytes, same length as `find`
    pub replace: String,
}

/// Lookup tables that drive the artifact engine.
///
/// Everything the store would otherwise hardcode lives here so a run can
/// be tuned (or tested) without touching the engine.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ArtifactRules {
    /// Dependency manifests renamed when obfuscating metadata
    pub app_metadata_files: Vec<String>,
    /// Well-known PID file path suffixes
    pub pid_file_paths: Vec<String>,
    /// Any path with this suffix is treated as a PID file
    pub pid_file_suffix: String,
    /// Paths under these prefixes lose dedup ties to their real locations
    pub redirect_prefixes: Vec<String>,
    pub binary_patch_rules: Vec<BinaryPatchRule>,
    /// Upper bound on symlink fixpoint rounds
    pub symlink_fixpoint_rounds: usize,

    pub cert_bundle_files: Vec<String>,
    pub ca_bundle_files: Vec<String>,
    pub cert_dirs: Vec<String>,
    pub ca_cert_dirs: Vec<String>,
    pub cert_extra_dirs: Vec<String>,
    pub cert_pk_files: Vec<String>,
    pub cert_pk_dirs: Vec<String>,
    pub ca_pk_files: Vec<String>,
    pub ca_pk_dirs: Vec<String>,
    /// Vendored bundle location under a Python package root
    pub python_cert_bundle: String,
    /// Ruby gem directory prefix for the vendored certifi gem
    pub ruby_cert_gem_prefix: String,
    /// Vendored bundle location under the Ruby certifi gem dir
    pub ruby_cert_bundle: String,

    pub zoneinfo_files: Vec<String>,
    pub zoneinfo_dirs: Vec<String>,

    pub ssh_config_dirs: Vec<String>,
    pub ssh_bins: Vec<String>,
    pub ssh_lib_dirs: Vec<String>,
    pub ssh_bin_fallback_dir: String,

    pub net_config_files: Vec<String>,
    /// Library name fragments selected from the pre-run snapshot
    pub net_lib_names: Vec<String>,
    pub net_lib_dirs: Vec<String>,
    pub net_lib_ext: String,

    pub nginx_dirs: Vec<String>,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for ArtifactRules {
    fn default() -> Self {
        ArtifactRules {
            app_metadata_files: strings(&[
                "package.json",
                "package-lock.json",
                "yarn.lock",
                "requirements.txt",
                "Pipfile",
                "Pipfile.lock",
                "pyproject.toml",
                "poetry.lock",
                "Gemfile",
                "Gemfile.lock",
                "composer.json",
                "composer.lock",
                "go.mod",
                "go.sum",
            ]),
            pid_file_paths: strings(&[
                "/var/run/nginx.pid",
                "/run/nginx.pid",
                "/tmp/nginx.pid",
                "/tmp/pids/server.pid",
            ]),
            pid_file_suffix: ".pid".to_string(),
            redirect_prefixes: strings(&["/usr/local/cuda/"]),
            binary_patch_rules: vec![BinaryPatchRule {
                path_suffix: "/node".to_string(),
                find: "node.js/v".to_string(),
                replace: "done,xu/v".to_string(),
            }],
            symlink_fixpoint_rounds: DEFAULT_SYMLINK_FIXPOINT_ROUNDS,

            cert_bundle_files: strings(&[
                "/etc/ssl/certs/ca-certificates.crt",
                "/etc/pki/tls/certs/ca-bundle.crt",
                "/etc/ssl/ca-bundle.pem",
                "/etc/pki/tls/cacert.pem",
                "/etc/pki/ca-trust/extracted/pem/tls-ca-bundle.pem",
                "/etc/ssl/cert.pem",
            ]),
            ca_bundle_files: strings(&[
                "/etc/ca-certificates.conf",
                "/etc/pki/ca-trust/extracted/openssl/ca-bundle.trust.crt",
            ]),
            cert_dirs: strings(&["/etc/ssl/certs", "/etc/pki/tls/certs"]),
            ca_cert_dirs: strings(&[
                "/usr/share/ca-certificates",
                "/usr/local/share/ca-certificates",
                "/etc/pki/ca-trust/source/anchors",
            ]),
            cert_extra_dirs: strings(&["/etc/ca-certificates"]),
            cert_pk_files: strings(&[]),
            cert_pk_dirs: strings(&["/etc/ssl/private", "/etc/pki/tls/private"]),
            ca_pk_files: strings(&["/etc/pki/CA/private/cakey.pem"]),
            ca_pk_dirs: strings(&["/etc/pki/CA/private"]),
            python_cert_bundle: "certifi/cacert.pem".to_string(),
            ruby_cert_gem_prefix: "certifi-".to_string(),
            ruby_cert_bundle: "lib/certifi/vendor/cacert.pem".to_string(),

            zoneinfo_files: strings(&["/etc/timezone", "/etc/localtime"]),
            zoneinfo_dirs: strings(&[
                "/usr/lib/zoneinfo",
                "/usr/share/zoneinfo",
                "/usr/share/zoneinfo-icu",
            ]),

            ssh_config_dirs: strings(&["/etc/ssh"]),
            ssh_bins: strings(&[
                "ssh",
                "ssh-add",
                "ssh-agent",
                "ssh-keygen",
                "ssh-keyscan",
                "ssh-argv0",
                "ssh-copy-id",
            ]),
            ssh_lib_dirs: strings(&["/usr/lib/openssh"]),
            ssh_bin_fallback_dir: "/usr/bin".to_string(),

            net_config_files: strings(&[
                "/etc/resolv.conf",
                "/etc/nsswitch.conf",
                "/etc/host.conf",
            ]),
            net_lib_names: strings(&["/libnss_dns", "/libresolv", "/libnss_files"]),
            net_lib_dirs: strings(&["/lib/", "/usr/lib/", "/usr/lib64/"]),
            net_lib_ext: ".so".to_string(),

            nginx_dirs: strings(&["/var/lib/nginx", "/var/log/nginx", "/var/cache/nginx"]),
        }
    }
}

impl ArtifactRules {
    /// Load rules from a YAML file; missing keys take their defaults
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .context(format!("Failed to read rules file: {}", path.display()))?;

        let rules: ArtifactRules =
            serde_yaml::from_str(&content).context("Failed to parse YAML rules")?;

        debug!("Loaded artifact rules from {}", path.display());
        Ok(rules)
    }

    /// True for a file name that is an application dependency manifest
    pub fn is_app_metadata_file(&self, file_name: &str) -> bool {
        self.app_metadata_files.iter().any(|name| name == file_name)
    }

    /// True for a known or generic PID file path
    pub fn is_pid_file(&self, path: &str) -> bool {
        self.pid_file_paths.iter().any(|p| path.ends_with(p.as_str()))
            || (!self.pid_file_suffix.is_empty() && path.ends_with(self.pid_file_suffix.as_str()))
    }

    /// Patch rules whose suffix matches `path`
    pub fn patch_rules_for<'a>(
        &'a self,
        path: &'a str,
    ) -> impl Iterator<Item = &'a BinaryPatchRule> + 'a {
        self.binary_patch_rules
            .iter()
            .filter(move |rule| path.ends_with(rule.path_suffix.as_str()))
    }

    /// True for a snapshot path that looks like an OS network library
    pub fn is_net_lib(&self, path: &str) -> bool {
        self.net_lib_names.iter().any(|n| path.contains(n.as_str()))
            && self.net_lib_dirs.iter().any(|d| path.contains(d.as_str()))
            && path.contains(self.net_lib_ext.as_str())
    }
}
