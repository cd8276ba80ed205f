//! Shared-library dependency resolution.
//!
//! The external listing tool (`ldd`) is hidden behind [`DependencyResolver`];
//! its output is parsed by pure functions so the protocol can be tested
//! without a toolchain in the loop. The closure over symlinked dependency
//! files runs on the real filesystem.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use log::debug;

use crate::constants::{DEP_RESOLVER_EXE_NAME, MAX_DEP_RESOLVE_ROUNDS};
use crate::error::{Result, SensorError};
use crate::inspect::binfile;
use crate::utils::paths::{absolute_path, find_executable, link_target_to_full_path};

const EXIT_STATUS_NOT_FOUND: i32 = 127;
const ERROR_RELOCATING: &str = "Error relocating";
const SYMBOL_NOT_FOUND: &str = "symbol not found";
const STATICALLY_LINKED: &str = "statically linked";
const NOT_FOUND: &str = "not found";
const VDSO_PREFIXES: &[&str] = &["linux-vdso", "linux-gate"];

/// Lists the direct shared-library dependencies of a binary.
#[cfg_attr(test, mockall::automock)]
pub trait DependencyResolver: Send + Sync {
    /// Names reported by the tool, excluding the binary itself
    fn direct_dependencies(&self, bin_path: &Path) -> Result<Vec<String>>;
}

/// Resolver backed by the system `ldd`
#[derive(Debug, Clone)]
pub struct LddResolver {
    exe_name: String,
}

impl Default for LddResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl LddResolver {
    pub fn new() -> Self {
        LddResolver {
            exe_name: DEP_RESOLVER_EXE_NAME.to_string(),
        }
    }

    fn locate(&self) -> Result<PathBuf> {
        find_executable(&self.exe_name).ok_or_else(|| {
            debug!("Dependency resolver '{}' not found on PATH", self.exe_name);
            SensorError::ResolverNotFound(self.exe_name.clone())
        })
    }
}

impl DependencyResolver for LddResolver {
    fn direct_dependencies(&self, bin_path: &Path) -> Result<Vec<String>> {
        let resolver = self.locate()?;

        let output = Command::new(&resolver)
            .arg(bin_path)
            .output()
            .map_err(|e| SensorError::io(&resolver, e))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        let mut deps = Vec::new();
        if !output.status.success() {
            if !is_broken_dependency_failure(output.status.code(), &stderr) {
                debug!(
                    "Resolver failed for {} (status {:?}): {}",
                    bin_path.display(),
                    output.status.code(),
                    stderr.trim()
                );
                return Err(SensorError::ResolverFailed {
                    path: bin_path.to_path_buf(),
                    status: output.status.code(),
                    stderr: stderr.into_owned(),
                });
            }
            deps.extend(parse_relocation_errors(&stderr));
        }

        deps.extend(parse_stdout(&stdout, &self.exe_name));
        Ok(deps)
    }
}

/// True for the "binary references a missing symbol" failure mode, which
/// still yields usable output.
pub fn is_broken_dependency_failure(status: Option<i32>, stderr: &str) -> bool {
    status == Some(EXIT_STATUS_NOT_FOUND)
        && stderr.contains(ERROR_RELOCATING)
        && stderr.contains(SYMBOL_NOT_FOUND)
}

/// Libraries named in `Error relocating <lib>: <symbol>: symbol not found` lines
pub fn parse_relocation_errors(stderr: &str) -> Vec<String> {
    let mut deps = Vec::new();
    for line in stderr.lines() {
        let clean = line.trim();
        if clean.is_empty() || !clean.contains(ERROR_RELOCATING) {
            continue;
        }

        let parts: Vec<&str> = clean.split_whitespace().collect();
        if parts.len() != 7 {
            debug!("Skipping relocation line '{}'", clean);
            continue;
        }

        if let Some(lib) = parts[2].strip_suffix(':') {
            let lib = lib.to_string();
            if !deps.contains(&lib) {
                deps.push(lib);
            }
        }
    }
    deps
}

/// Dependency paths from the tool's standard output
pub fn parse_stdout(stdout: &str, resolver_name: &str) -> Vec<String> {
    let mut deps = Vec::new();
    for line in stdout.lines() {
        let clean = line.trim();
        if clean.is_empty() {
            continue;
        }

        if clean.contains(STATICALLY_LINKED) {
            debug!("Statically linked binary: '{}'", clean);
            continue;
        }

        let parts: Vec<&str> = clean.split_whitespace().collect();
        match parts.len() {
            4 => {
                if parts[1] != "=>" {
                    debug!("Unexpected line format '{}'", clean);
                    continue;
                }

                if clean.contains(NOT_FOUND) {
                    debug!("Unresolved dependency '{}'", clean);
                    continue;
                }

                let is_resolver = parts[2] == resolver_name
                    || Path::new(parts[2])
                        .file_name()
                        .map_or(false, |name| name == resolver_name);
                if is_resolver {
                    debug!("Ignoring resolver dependency '{}'", clean);
                    continue;
                }

                deps.push(parts[2].to_string());
            }
            2 => {
                let name = parts[0];
                if name.starts_with('/') {
                    // dynamic linker
                    deps.push(name.to_string());
                } else if VDSO_PREFIXES.iter().any(|p| name.starts_with(p)) {
                    continue;
                } else if name.starts_with(resolver_name) {
                    debug!("Ignoring resolver dependency '{}'", clean);
                } else {
                    debug!("Unexpected line '{}'", clean);
                }
            }
            _ => {
                if clean.contains(NOT_FOUND) {
                    debug!("Unresolved dependency '{}'", clean);
                } else {
                    debug!("Unexpected line '{}'", clean);
                }
            }
        }
    }
    deps
}

/// Full dependency closure of a binary: the binary first, then every
/// dependency file and every file a dependency symlink leads to.
pub fn all_dependencies(resolver: &dyn DependencyResolver, bin_path: &Path) -> Result<Vec<String>> {
    if !bin_path.is_absolute() {
        return Err(SensorError::PathNotAbsolute(bin_path.to_path_buf()));
    }

    if let Err(e) = fs::metadata(bin_path) {
        debug!("Missing dependency target {}: {}", bin_path.display(), e);
        return Err(SensorError::io(bin_path, e));
    }

    if binfile::detect(bin_path)?.is_none() {
        return Err(SensorError::NotBinary(bin_path.to_path_buf()));
    }

    let mut names = vec![bin_path.to_string_lossy().into_owned()];
    names.extend(resolver.direct_dependencies(bin_path)?);

    Ok(resolve_closure(&bin_path.display().to_string(), names))
}

/// Like [`all_dependencies`], but a bare name is looked up on `PATH` first
pub fn exe_dependencies(resolver: &dyn DependencyResolver, name: &str) -> Result<Vec<String>> {
    if Path::new(name).is_absolute() {
        return all_dependencies(resolver, Path::new(name));
    }

    let exe_path = find_executable(name).ok_or_else(|| {
        SensorError::io(
            name,
            std::io::Error::new(std::io::ErrorKind::NotFound, "executable not found on PATH"),
        )
    })?;

    all_dependencies(resolver, &exe_path)
}

fn resolve_closure(label: &str, names: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut all = Vec::new();
    let mut pending = names;

    for round in 0.. {
        if pending.is_empty() {
            break;
        }

        if round >= MAX_DEP_RESOLVE_ROUNDS {
            debug!(
                "Dependency link chain for {} too deep, stopping after {} rounds",
                label, MAX_DEP_RESOLVE_ROUNDS
            );
            break;
        }

        let (files, links) = resolve_dep_artifacts(&pending);
        for file in files {
            if seen.insert(file.clone()) {
                all.push(file);
            }
        }

        pending = links.into_iter().filter(|l| !seen.contains(l)).collect();
    }

    all
}

/// Existing names from `names` (made absolute) plus the absolute targets of
/// the symlinks among them
fn resolve_dep_artifacts(names: &[String]) -> (Vec<String>, Vec<String>) {
    let mut files = Vec::new();
    let mut links = Vec::new();

    for name in names {
        let path = absolute_path(Path::new(name));
        let metadata = match fs::symlink_metadata(&path) {
            Ok(m) => m,
            Err(e) => {
                debug!("Skipping dependency {}: {}", name, e);
                continue;
            }
        };

        files.push(path.to_string_lossy().into_owned());

        if metadata.file_type().is_symlink() {
            match fs::read_link(&path) {
                Ok(target) => {
                    let full = link_target_to_full_path(&path, &target);
                    links.push(full.to_string_lossy().into_owned());
                }
                Err(e) => debug!("Error reading link {}: {}", path.display(), e),
            }
        }
    }

    (files, links)
}
