//! Metadata obfuscation for copied artifacts.
//!
//! Dependency manifests are stored under a hidden name with the original
//! name left as a relative symlink, `package.json` versions are bumped and
//! copied executables get a marker appended plus optional byte patches.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::debug;
use serde_json::Value;

use crate::artifacts::fsutil;
use crate::config::BinaryPatchRule;

/// Appended to every obfuscated executable
pub const BIN_MARKER: &[u8] = b"KCQ";

const NODE_PACKAGE_FILE: &str = "package.json";
const VERSION_KEY: &str = "version";

/// Hidden data file name used for an obfuscated metadata file.
///
/// The extension is kept so app stacks that key on it still load the file.
pub fn obfuscated_name(file_name: &str) -> String {
    let ext = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e))
        .unwrap_or_default();

    format!(".d.{}{}", file_name.replace('.', ".."), ext)
}

/// Copy `src` to the hidden name next to `dst` and make `dst` a relative
/// symlink to it. Returns the data file path.
pub fn copy_and_obfuscate(clone: bool, src: &Path, dst: &Path) -> Result<PathBuf> {
    let file_name = dst
        .file_name()
        .and_then(|n| n.to_str())
        .context(format!("No file name in {}", dst.display()))?;
    let hidden = obfuscated_name(file_name);
    let data_path = dst.with_file_name(&hidden);

    fsutil::copy_regular_file(clone, src, &data_path)?;

    if fsutil::exists(dst) {
        fs::remove_file(dst).context(format!("Failed to replace: {}", dst.display()))?;
    }
    symlink(&hidden, dst).context(format!(
        "Failed to create link {} -> {}",
        dst.display(),
        hidden
    ))?;

    Ok(data_path)
}

/// Prefix the `version` of a `package.json` document with `1`.
///
/// Returns `None` when the document has no string version.
pub fn bump_package_version(data: &[u8]) -> Result<Option<Vec<u8>>> {
    let mut info: Value = serde_json::from_slice(data).context("Failed to parse package data")?;

    let version = match info.get(VERSION_KEY).and_then(Value::as_str) {
        Some(v) => format!("1{}", v),
        None => return Ok(None),
    };
    info[VERSION_KEY] = Value::String(version);

    let mut out =
        serde_json::to_vec_pretty(&info).context("Failed to encode updated package data")?;
    out.push(b'\n');
    Ok(Some(out))
}

/// Rewrite an obfuscated `package.json` data file in place
pub fn update_package_file(source_name: &str, data_path: &Path) -> Result<()> {
    if source_name != NODE_PACKAGE_FILE {
        return Ok(());
    }

    let data = fs::read(data_path).context(format!("Failed to read {}", data_path.display()))?;
    match bump_package_version(&data)? {
        Some(updated) => {
            fs::write(data_path, updated)
                .context(format!("Failed to write {}", data_path.display()))?;
            debug!("Updated package version in {}", data_path.display());
        }
        None => debug!("No version field in {}, left as-is", data_path.display()),
    }
    Ok(())
}

pub fn append_marker(target: &Path) -> Result<()> {
    let mut file = OpenOptions::new()
        .append(true)
        .open(target)
        .context(format!("Failed to open {} for append", target.display()))?;
    file.write_all(BIN_MARKER)
        .context(format!("Failed to append to {}", target.display()))
}

/// Apply byte patches to `target`; returns true when the file was rewritten
pub fn apply_patch_rules<'a, I>(target: &Path, rules: I) -> Result<bool>
where
    I: IntoIterator<Item = &'a BinaryPatchRule>,
{
    let mut rules = rules.into_iter().peekable();
    if rules.peek().is_none() {
        return Ok(false);
    }

    let mut raw = fs::read(target).context(format!("Failed to read {}", target.display()))?;
    let mut replaced = false;
    for rule in rules {
        if rule.find.is_empty() || rule.replace.is_empty() {
            continue;
        }
        raw = replace_all(&raw, rule.find.as_bytes(), rule.replace.as_bytes());
        replaced = true;
    }

    if replaced {
        fs::write(target, &raw).context(format!("Failed to write {}", target.display()))?;
    }
    Ok(replaced)
}

fn replace_all(haystack: &[u8], find: &[u8], replace: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(haystack.len());
    let mut i = 0;
    while i < haystack.len() {
        if haystack[i..].starts_with(find) {
            out.extend_from_slice(replace);
            i += find.len();
        } else {
            out.push(haystack[i]);
            i += 1;
        }
    }
    out
}
