//! Per-file hooks run after a retained file has been copied.
//!
//! Framework config files pull in their app directories, Ruby gem specs
//! and Node packages pull in files the runtime checks for without opening
//! them, and compiled Python files pull in their sources.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::Context;
use log::debug;
use serde::Deserialize;

use crate::artifacts::fsutil;
use crate::artifacts::save::CopyContext;

const NUXT_CONFIG_FILE: &str = "nuxt.config.js";
const NUXT_BUILD_DIR: &str = ".nuxt";
const NUXT_DIST_DIR: &str = ".nuxt/dist";
const NUXT_STATIC_DIR: &str = "static";

const NEXT_CONFIG_FILES: &[&str] = &["next.config.js", "next.config.mjs"];
const NEXT_BUILD_DIR: &str = ".next";
const NEXT_DIST_DIR: &str = "out";
const NEXT_STATIC_DIR: &str = "public";

const NODE_MODULES_DIR: &str = "node_modules";
const NODE_PACKAGE_FILE: &str = "package.json";
const NODE_GYP_PACKAGE: &str = "/npm/node_modules/node-gyp/package.json";
const NODE_GYP_FILE: &str = "bin/node-gyp.js";

const RB_SPEC_DIR: &str = "/specifications/";
const RB_DEFAULT_SPEC_DIR: &str = "/specifications/default/";
const RB_GEMSPEC_EXT: &str = "gemspec";
const RB_EXT_DIR: &str = "extensions";
const RB_BUILD_FLAG: &str = "gem.build_complete";

const NGINX_SUB_DIR: &str = "/nginx/";
const NGINX_BIN_SUFFIX: &str = "/nginx";

const PYCACHE: &str = "__pycache__";

/// Which app directories a framework config asks for
struct FrameworkDirs<'d> {
    app: bool,
    /// (enabled, directory relative to the app dir)
    subdirs: [(bool, &'d str); 4],
}

#[derive(Deserialize)]
struct NodePackageInfo {
    #[serde(default)]
    name: String,
}

/// Stateful post-copy hook runner for one save pass
#[derive(Debug, Default)]
pub struct PostProcessor {
    nginx_done: bool,
    /// Directories to copy recursively with the other include paths
    include_dirs: BTreeSet<String>,
}

impl PostProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn include_dirs(&self) -> &BTreeSet<String> {
        &self.include_dirs
    }

    pub fn into_include_dirs(self) -> BTreeSet<String> {
        self.include_dirs
    }

    /// Run the hooks for a copied file
    pub fn process(&mut self, ctx: &CopyContext<'_>, source: &str, dst: &Path) {
        let cmd = ctx.cmd;

        if cmd.wants_nuxt_dirs() && file_name(source) == NUXT_CONFIG_FILE {
            let dirs = FrameworkDirs {
                app: cmd.include_app_nuxt_dir,
                subdirs: [
                    (cmd.include_app_nuxt_static_dir, NUXT_STATIC_DIR),
                    (cmd.include_app_nuxt_build_dir, NUXT_BUILD_DIR),
                    (cmd.include_app_nuxt_dist_dir, NUXT_DIST_DIR),
                    (cmd.include_app_nuxt_node_modules_dir, NODE_MODULES_DIR),
                ],
            };
            self.include_framework_dirs("nuxt", source, &dirs);
            return;
        }

        if cmd.wants_next_dirs() && NEXT_CONFIG_FILES.contains(&file_name(source)) {
            let dirs = FrameworkDirs {
                app: cmd.include_app_next_dir,
                subdirs: [
                    (cmd.include_app_next_static_dir, NEXT_STATIC_DIR),
                    (cmd.include_app_next_build_dir, NEXT_BUILD_DIR),
                    (cmd.include_app_next_dist_dir, NEXT_DIST_DIR),
                    (cmd.include_app_next_node_modules_dir, NODE_MODULES_DIR),
                ],
            };
            self.include_framework_dirs("next", source, &dirs);
            return;
        }

        if is_gemspec_file(source) {
            ensure_gem_build_flags(ctx, source);
        } else if file_name(source) == NODE_PACKAGE_FILE {
            ensure_node_package_files(ctx, source);
            self.include_node_package(ctx, source);
        } else if is_nginx_artifact(source) {
            if !self.nginx_done {
                ensure_nginx_dirs(ctx);
                self.nginx_done = true;
            }
        } else {
            restore_py_source(ctx, source, dst);
        }
    }

    fn include_framework_dirs(&mut self, label: &str, config_file: &str, dirs: &FrameworkDirs<'_>) {
        let app_dir = match Path::new(config_file).parent() {
            Some(dir) => dir,
            None => return,
        };
        let app_dir_name = app_dir.to_string_lossy().into_owned();

        if dirs.app {
            debug!("[{}] including app dir {}", label, app_dir_name);
            self.include_dirs.insert(app_dir_name);
        }

        for (enabled, rel) in dirs.subdirs.iter() {
            if !enabled {
                continue;
            }

            let dir = app_dir.join(rel);
            if !dir.is_dir() {
                debug!("[{}] {} does not exist", label, dir.display());
                continue;
            }

            // subdirs are always below the app dir, so it already covers them
            if dirs.app {
                debug!("[{}] {} already included with the app dir", label, dir.display());
                continue;
            }

            debug!("[{}] including {}", label, dir.display());
            self.include_dirs.insert(dir.to_string_lossy().into_owned());
        }
    }

    fn include_node_package(&mut self, ctx: &CopyContext<'_>, source: &str) {
        if ctx.cmd.include_node_packages.is_empty() {
            return;
        }

        let info: NodePackageInfo = match fs::read(source)
            .ok()
            .and_then(|data| serde_json::from_slice(&data).ok())
        {
            Some(info) => info,
            None => {
                debug!("Unable to read package info from {}", source);
                return;
            }
        };

        let wanted = ctx
            .cmd
            .include_node_packages
            .iter()
            .any(|name| !name.is_empty() && *name == info.name);
        if wanted {
            if let Some(dir) = Path::new(source).parent() {
                debug!("[node] including package {} dir {}", info.name, dir.display());
                self.include_dirs.insert(dir.to_string_lossy().into_owned());
            }
        }
    }
}

fn file_name(path: &str) -> &str {
    Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
}

fn is_gemspec_file(path: &str) -> bool {
    Path::new(path).extension().and_then(|e| e.to_str()) == Some(RB_GEMSPEC_EXT)
        && path.contains(RB_SPEC_DIR)
}

fn is_nginx_artifact(path: &str) -> bool {
    path.contains(NGINX_SUB_DIR) || path.ends_with(NGINX_BIN_SUFFIX)
}

/// Copy `extensions/<platform>/<version>/<gem>/gem.build_complete` markers
fn ensure_gem_build_flags(ctx: &CopyContext<'_>, spec: &str) {
    if spec.contains(RB_DEFAULT_SPEC_DIR) {
        return;
    }

    let idx = match spec.rfind(RB_SPEC_DIR) {
        Some(idx) => idx,
        None => return,
    };
    let base = Path::new(&spec[..idx]);
    let gem_name = match Path::new(spec).file_stem().and_then(|s| s.to_str()) {
        Some(name) => name,
        None => return,
    };

    let ext_base = base.join(RB_EXT_DIR);
    let platforms = match fs::read_dir(&ext_base) {
        Ok(entries) => entries,
        Err(e) => {
            debug!("No gem extensions under {}: {}", ext_base.display(), e);
            return;
        }
    };

    for platform in platforms.flatten().filter(|e| e.path().is_dir()) {
        let versions = match fs::read_dir(platform.path()) {
            Ok(entries) => entries,
            Err(_) => continue,
        };

        for version in versions.flatten().filter(|e| e.path().is_dir()) {
            let flag = version.path().join(gem_name).join(RB_BUILD_FLAG);
            if !flag.is_file() {
                continue;
            }

            let flag_name = flag.to_string_lossy().into_owned();
            ctx.copy_missing(&flag_name);
        }
    }
}

fn ensure_node_package_files(ctx: &CopyContext<'_>, source: &str) {
    if !source.ends_with(NODE_GYP_PACKAGE) {
        return;
    }

    if let Some(dir) = Path::new(source).parent() {
        let gyp = dir.join(NODE_GYP_FILE);
        if gyp.is_file() {
            ctx.copy_missing(&gyp.to_string_lossy());
        }
    }
}

fn ensure_nginx_dirs(ctx: &CopyContext<'_>) {
    for dir in &ctx.rules.nginx_dirs {
        if !Path::new(dir).is_dir() {
            continue;
        }

        let dst = ctx.dst(dir);
        if dst.is_dir() {
            continue;
        }
        if let Err(e) = ctx.write_dst(dir).and_then(|dst| {
            fs::create_dir_all(&dst).context(format!("Failed to create directory: {}", dst.display()))
        }) {
            debug!("Error creating nginx dir {}: {:#}", dst.display(), e);
        }
    }
}

/// Source file for a `__pycache__/<name>.<tag>.pyc` path
pub fn py_source_for_cache(path: &str) -> Option<String> {
    let p = Path::new(path);
    let ext = p.extension().and_then(|e| e.to_str())?;
    if ext != "pyc" && ext != "pyo" {
        return None;
    }

    let cache_dir = p.parent()?;
    if cache_dir.file_name().and_then(|n| n.to_str()) != Some(PYCACHE) {
        return None;
    }

    let file_name = p.file_name()?.to_str()?;
    let parts: Vec<&str> = file_name.split('.').collect();
    if parts.len() < 3 {
        return None;
    }

    let module = parts[..parts.len() - 2].join(".");
    let source = cache_dir.parent()?.join(format!("{}.py", module));
    Some(source.to_string_lossy().into_owned())
}

fn restore_py_source(ctx: &CopyContext<'_>, source: &str, dst: &Path) {
    let src_py = match py_source_for_cache(source) {
        Some(p) => p,
        None => return,
    };
    let dst_py = match py_source_for_cache(&dst.to_string_lossy()) {
        Some(p) => p,
        None => return,
    };

    if fsutil::exists(Path::new(&dst_py)) || !Path::new(&src_py).is_file() {
        return;
    }

    if let Err(e) = fsutil::copy_regular_file(true, Path::new(&src_py), Path::new(&dst_py)) {
        debug!("Error restoring python source {}: {:#}", src_py, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::matcher::PathMatcher;
    use crate::config::{ArtifactRules, StartCommand};
    use crate::inspect::sodeps::MockDependencyResolver;
    use tempfile::TempDir;

    fn context<'c>(
        files_dir: &Path,
        cmd: &'c StartCommand,
        rules: &'c ArtifactRules,
        resolver: &'c MockDependencyResolver,
    ) -> CopyContext<'c> {
        CopyContext {
            files_dir: files_dir.to_path_buf(),
            clone: false,
            excludes: PathMatcher::default(),
            cmd,
            rules,
            resolver,
        }
    }

    #[test]
    fn test_py_source_for_cache() {
        assert_eq!(
            py_source_for_cache("/app/pkg/__pycache__/mod.cpython-311.pyc").as_deref(),
            Some("/app/pkg/mod.py")
        );
        assert_eq!(
            py_source_for_cache("/app/__pycache__/a.b.cpython-311.opt-1.pyc").as_deref(),
            Some("/app/a.b.cpython-311.py")
        );
        assert!(py_source_for_cache("/app/mod.pyc").is_none());
        assert!(py_source_for_cache("/app/__pycache__/mod.pyc").is_none());
        assert!(py_source_for_cache("/app/__pycache__/mod.py").is_none());
    }

    #[test]
    fn test_classifiers() {
        assert!(is_gemspec_file("/usr/lib/ruby/gems/3.1.0/specifications/rack-2.2.gemspec"));
        assert!(!is_gemspec_file("/app/rack.gemspec"));
        assert!(is_nginx_artifact("/etc/nginx/nginx.conf"));
        assert!(is_nginx_artifact("/usr/sbin/nginx"));
        assert!(!is_nginx_artifact("/usr/sbin/nginxctl"));
    }

    #[test]
    fn test_next_dirs_included_only_when_present() {
        let temp_dir = TempDir::new().unwrap();
        let app = temp_dir.path().join("app");
        fs::create_dir_all(app.join(".next")).unwrap();
        fs::create_dir_all(app.join("node_modules")).unwrap();
        let config = app.join("next.config.js");
        fs::write(&config, b"module.exports = {}").unwrap();

        let cmd = StartCommand {
            include_app_next_build_dir: true,
            include_app_next_static_dir: true,
            include_app_next_node_modules_dir: true,
            ..Default::default()
        };
        let rules = ArtifactRules::default();
        let resolver = MockDependencyResolver::new();
        let files_dir = temp_dir.path().join("out");
        let ctx = context(&files_dir, &cmd, &rules, &resolver);

        let mut post = PostProcessor::new();
        let source = config.to_string_lossy().into_owned();
        post.process(&ctx, &source, &ctx.dst(&source));

        let dirs = post.include_dirs();
        assert!(dirs.contains(&app.join(".next").to_string_lossy().into_owned()));
        assert!(dirs.contains(&app.join("node_modules").to_string_lossy().into_owned()));
        assert!(!dirs.contains(&app.join("public").to_string_lossy().into_owned()));
        assert_eq!(dirs.len(), 2);
    }

    #[test]
    fn test_node_package_by_name() {
        let temp_dir = TempDir::new().unwrap();
        let pkg_dir = temp_dir.path().join("node_modules/left-pad");
        fs::create_dir_all(&pkg_dir).unwrap();
        let package = pkg_dir.join("package.json");
        fs::write(&package, br#"{"name": "left-pad", "version": "1.3.0"}"#).unwrap();

        let cmd = StartCommand {
            include_node_packages: vec!["left-pad".to_string()],
            ..Default::default()
        };
        let rules = ArtifactRules::default();
        let resolver = MockDependencyResolver::new();
        let files_dir = temp_dir.path().join("out");
        let ctx = context(&files_dir, &cmd, &rules, &resolver);

        let mut post = PostProcessor::new();
        let source = package.to_string_lossy().into_owned();
        post.process(&ctx, &source, &ctx.dst(&source));

        assert!(post
            .include_dirs()
            .contains(&pkg_dir.to_string_lossy().into_owned()));
    }

    #[test]
    fn test_py_source_restored_next_to_cache() {
        let temp_dir = TempDir::new().unwrap();
        let src_dir = temp_dir.path().join("src/pkg");
        fs::create_dir_all(src_dir.join("__pycache__")).unwrap();
        fs::write(src_dir.join("mod.py"), b"x = 1\n").unwrap();
        let pyc = src_dir.join("__pycache__/mod.cpython-311.pyc");
        fs::write(&pyc, b"\x00\x01").unwrap();

        let cmd = StartCommand::default();
        let rules = ArtifactRules::default();
        let resolver = MockDependencyResolver::new();
        let files_dir = temp_dir.path().join("out");
        let ctx = context(&files_dir, &cmd, &rules, &resolver);

        let source = pyc.to_string_lossy().into_owned();
        let dst = ctx.dst(&source);
        fsutil::copy_regular_file(false, &pyc, &dst).unwrap();

        PostProcessor::new().process(&ctx, &source, &dst);
        let restored = ctx.dst(&src_dir.join("mod.py").to_string_lossy());
        assert_eq!(fs::read(restored).unwrap(), b"x = 1\n");
    }
}
