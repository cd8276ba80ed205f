//! Feature-toggled includes that are not driven by observed file access:
//! shell, working directory, SSH client, OS network libraries,
//! certificates and timezone data.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::artifacts::app_stack::{AppStacks, Language};
use crate::artifacts::fsutil;
use crate::artifacts::matcher::PathMatcher;
use crate::artifacts::save::CopyContext;
use crate::artifacts::walker::{is_filtered_path, TreeWalker, WalkAction};
use crate::constants::{PASSWD_FILE_PATH, SHELL_COMMANDS, SHELL_NAMES};
use crate::inspect::{binfile, sodeps};
use crate::utils::paths::{find_executable, link_target_to_full_path};

const SSH_USER_DIR: &str = ".ssh";
const ROOT_HOME: &str = "/root";
const HOME_BASE: &str = "/home";
const NO_LOGIN_SHELLS: &[&str] = &["nologin", "false"];

/// A shell found on `PATH` plus the basic commands, with dependencies
pub fn save_shell(ctx: &CopyContext<'_>) {
    let shell = SHELL_NAMES.iter().find_map(|name| {
        match sodeps::exe_dependencies(ctx.resolver, name) {
            Ok(deps) => Some(deps),
            Err(e) => {
                debug!("Shell '{}' not usable: {}", name, e);
                None
            }
        }
    });

    let deps = match shell {
        Some(deps) => deps,
        None => {
            debug!("No shell found");
            return;
        }
    };
    ctx.copy_all(&deps);

    for name in SHELL_COMMANDS {
        match sodeps::exe_dependencies(ctx.resolver, name) {
            Ok(deps) => ctx.copy_all(&deps),
            Err(e) => debug!("Shell command '{}' not usable: {}", name, e),
        }
    }
}

pub fn save_workdir(ctx: &CopyContext<'_>) {
    let workdir = match ctx.cmd.include_workdir.as_deref() {
        Some(dir) if !dir.is_empty() => dir,
        _ => return,
    };

    if is_filtered_path(Path::new(workdir)) {
        debug!("Skipping filtered workdir {}", workdir);
        return;
    }
    if !Path::new(workdir).is_dir() {
        debug!("Workdir does not exist: {}", workdir);
        return;
    }

    debug!("Including workdir {}", workdir);
    ctx.copy_tree(workdir, true);
}

pub fn save_zoneinfo(ctx: &CopyContext<'_>) {
    if !ctx.cmd.include_zoneinfo {
        return;
    }

    for file in &ctx.rules.zoneinfo_files {
        ctx.copy_missing(file);
    }

    for dir in &ctx.rules.zoneinfo_dirs {
        if Path::new(dir).is_dir() {
            ctx.copy_tree(dir, false);
        } else {
            debug!("No zoneinfo directory {}", dir);
        }
    }
}

/// Home directories of users that can log in
pub fn home_dirs(passwd: &Path) -> Vec<String> {
    let mut dirs = BTreeSet::new();

    match fs::read_to_string(passwd) {
        Ok(content) => {
            dirs.extend(parse_passwd_homes(&content));
        }
        Err(e) => {
            debug!("Unable to read {}: {}", passwd.display(), e);
            if Path::new(ROOT_HOME).is_dir() {
                dirs.insert(ROOT_HOME.to_string());
            }
            match fs::read_dir(HOME_BASE) {
                Ok(entries) => {
                    for entry in entries.flatten().filter(|e| e.path().is_dir()) {
                        dirs.insert(entry.path().to_string_lossy().into_owned());
                    }
                }
                Err(e) => debug!("Unable to list {}: {}", HOME_BASE, e),
            }
        }
    }

    dirs.into_iter().collect()
}

/// Home fields of passwd records with a login shell
pub fn parse_passwd_homes(content: &str) -> Vec<String> {
    content
        .lines()
        .filter(|line| !line.trim().is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() < 7 {
                return None;
            }
            let (home, shell) = (fields[5], fields[6]);
            let no_login = NO_LOGIN_SHELLS.iter().any(|s| shell.ends_with(s));
            if home.is_empty() || no_login {
                None
            } else {
                Some(home.to_string())
            }
        })
        .collect()
}

/// Absolute and fully evaluated targets of a symlink; empty for other files
pub fn resolve_link(path: &str) -> Vec<String> {
    let link_ref = match fs::symlink_metadata(path) {
        Ok(m) if m.file_type().is_symlink() => match fs::read_link(path) {
            Ok(target) => target,
            Err(e) => {
                debug!("Error reading link {}: {}", path, e);
                return Vec::new();
            }
        },
        _ => return Vec::new(),
    };

    let target = link_target_to_full_path(Path::new(path), &link_ref);
    let mut out = vec![target.to_string_lossy().into_owned()];
    if let Ok(eval) = fs::canonicalize(&target) {
        if eval != target {
            out.push(eval.to_string_lossy().into_owned());
        }
    }
    out
}

/// Dependency closure of a binary, falling back to the binary alone
fn bin_with_dependencies(ctx: &CopyContext<'_>, bin: &str, out: &mut BTreeSet<String>) {
    match sodeps::all_dependencies(ctx.resolver, Path::new(bin)) {
        Ok(deps) => {
            for dep in deps {
                out.extend(resolve_link(&dep).into_iter().filter(|p| fsutil::exists(Path::new(p))));
                out.insert(dep);
            }
        }
        Err(e) => {
            debug!("Error getting dependencies for {}: {}", bin, e);
            out.insert(bin.to_string());
        }
    }
}

pub fn save_ssh_client(ctx: &CopyContext<'_>) {
    if !ctx.cmd.include_ssh_client {
        return;
    }

    let mut config_dirs: Vec<String> = ctx.rules.ssh_config_dirs.clone();
    for home in home_dirs(Path::new(PASSWD_FILE_PATH)) {
        let dir = Path::new(&home).join(SSH_USER_DIR);
        if dir.is_dir() {
            config_dirs.push(dir.to_string_lossy().into_owned());
        }
    }

    for dir in &config_dirs {
        if Path::new(dir).is_dir() {
            ctx.copy_tree(dir, false);
        } else {
            debug!("No ssh config directory {}", dir);
        }
    }

    let mut paths = BTreeSet::new();
    for name in &ctx.rules.ssh_bins {
        let exe = find_executable(name)
            .unwrap_or_else(|| PathBuf::from(&ctx.rules.ssh_bin_fallback_dir).join(name));
        if !fsutil::exists(&exe) {
            debug!("ssh exe not found: {}", exe.display());
            continue;
        }
        bin_with_dependencies(ctx, &exe.to_string_lossy(), &mut paths);
    }

    let none = PathMatcher::default();
    for dir in &ctx.rules.ssh_lib_dirs {
        let root = Path::new(dir);
        if !root.is_dir() {
            debug!("No ssh lib directory {}", dir);
            continue;
        }
        ctx.copy_tree(dir, false);

        let mut dir_files = Vec::new();
        TreeWalker::new(root, &none).walk(|entry, metadata| {
            if !metadata.is_dir() {
                dir_files.push(entry.path().to_string_lossy().into_owned());
            }
            WalkAction::Continue
        });

        for file in dir_files {
            if matches!(binfile::detect(Path::new(&file)), Ok(Some(_))) {
                bin_with_dependencies(ctx, &file, &mut paths);
            } else {
                paths.insert(file);
            }
        }
    }

    debug!("ssh client paths: {}", paths.len());
    for path in &paths {
        ctx.copy_missing(path);
    }
}

/// Network related shared libraries from the pre-run snapshot
pub fn net_lib_candidates<'p>(
    ctx: &CopyContext<'_>,
    orig_paths: &'p BTreeSet<String>,
) -> Vec<&'p String> {
    orig_paths
        .iter()
        .filter(|p| ctx.rules.is_net_lib(p))
        .collect()
}

pub fn save_os_libs_net(ctx: &CopyContext<'_>, orig_paths: &BTreeSet<String>) {
    if !ctx.cmd.include_os_libs_net {
        return;
    }

    for file in &ctx.rules.net_config_files {
        ctx.copy_missing(file);
    }

    if orig_paths.is_empty() {
        debug!("No filesystem snapshot, skipping network libraries");
        return;
    }

    let mut paths = BTreeSet::new();
    for lib in net_lib_candidates(ctx, orig_paths) {
        if !fsutil::exists(Path::new(lib)) {
            continue;
        }

        let mut candidates = resolve_link(lib);
        candidates.push(lib.clone());
        for candidate in candidates {
            if !fsutil::exists(Path::new(&candidate)) {
                continue;
            }

            if matches!(binfile::detect(Path::new(&candidate)), Ok(Some(_))) {
                match sodeps::all_dependencies(ctx.resolver, Path::new(&candidate)) {
                    Ok(deps) => {
                        for dep in deps {
                            paths.extend(
                                resolve_link(&dep)
                                    .into_iter()
                                    .filter(|p| fsutil::exists(Path::new(p))),
                            );
                            paths.insert(dep);
                        }
                    }
                    Err(e) if e.is_resolver_not_found() => {
                        debug!("No dependency resolver for {}", candidate)
                    }
                    Err(e) => debug!("Error getting dependencies for {}: {}", candidate, e),
                }
            }
            paths.insert(candidate);
        }
    }

    info!("Including {} network library paths", paths.len());
    for path in &paths {
        ctx.copy_missing(path);
    }
}

fn copy_cert_files(ctx: &CopyContext<'_>, files: &[String]) {
    for file in files {
        ctx.copy_missing(file);
    }
}

/// Copy cert directories; with `link_targets`, also copy the files that
/// top-level symlinks with a path in their link text point to
fn copy_cert_dirs(ctx: &CopyContext<'_>, dirs: &[String], link_targets: bool) {
    for dir in dirs {
        // a link to a directory is copied with its content
        if !Path::new(dir).is_dir() {
            match fs::symlink_metadata(dir) {
                Ok(metadata) if metadata.file_type().is_symlink() => {
                    if let Err(e) = ctx
                        .write_dst(dir)
                        .and_then(|dst| fsutil::copy_symlink(ctx.clone, Path::new(dir), &dst))
                    {
                        debug!("Error copying cert dir link {}: {:#}", dir, e);
                    }
                }
                Ok(_) => debug!("Unexpected object type for cert dir {}", dir),
                Err(_) => {}
            }
            continue;
        }

        ctx.copy_tree(dir, false);
        if !link_targets {
            continue;
        }

        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("Unable to list {}: {}", dir, e);
                continue;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let link_ref = match fs::read_link(&path) {
                Ok(r) => r,
                Err(_) => continue,
            };
            if !link_ref.to_string_lossy().contains('/') {
                continue;
            }

            let target = link_target_to_full_path(&path, &link_ref);
            if fsutil::exists(&target) {
                ctx.copy_missing(&target.to_string_lossy());
            } else {
                debug!("Cert link target does not exist: {}", target.display());
            }
        }
    }
}

/// Vendored CA bundles shipped inside application packages
pub fn app_cert_files(ctx: &CopyContext<'_>, stacks: &AppStacks) -> Vec<String> {
    let mut files = Vec::new();

    if let Some(py) = stacks.get(Language::Python) {
        for dir in &py.package_dirs {
            files.push(format!("{}{}", dir, ctx.rules.python_cert_bundle));
        }
    }

    if let Some(rb) = stacks.get(Language::Ruby) {
        for dir in &rb.package_dirs {
            let gem = fs::read_dir(dir).ok().and_then(|entries| {
                entries
                    .flatten()
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .find(|name| name.starts_with(&ctx.rules.ruby_cert_gem_prefix))
            });
            if let Some(gem) = gem {
                files.push(format!("{}{}/{}", dir, gem, ctx.rules.ruby_cert_bundle));
            }
        }
    }

    files.retain(|f| Path::new(f).is_file());
    files
}

pub fn save_certs(ctx: &CopyContext<'_>, stacks: &AppStacks) {
    let cmd = ctx.cmd;
    let rules = ctx.rules;

    if cmd.include_cert_all || cmd.include_cert_bundles {
        copy_cert_files(ctx, &rules.cert_bundle_files);
        copy_cert_files(ctx, &rules.ca_bundle_files);
        copy_cert_files(ctx, &app_cert_files(ctx, stacks));
    }

    if cmd.include_cert_all || cmd.include_cert_dirs {
        copy_cert_dirs(ctx, &rules.cert_dirs, true);
        copy_cert_dirs(ctx, &rules.ca_cert_dirs, true);
        copy_cert_dirs(ctx, &rules.cert_extra_dirs, false);
    }

    if cmd.include_cert_pk_all {
        copy_cert_files(ctx, &rules.cert_pk_files);
        copy_cert_files(ctx, &rules.ca_pk_files);
    }

    if cmd.include_cert_pk_all || cmd.include_cert_pk_dirs {
        copy_cert_dirs(ctx, &rules.cert_pk_dirs, true);
        copy_cert_dirs(ctx, &rules.ca_pk_dirs, true);
    }
}
