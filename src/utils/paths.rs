use std::env;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

/// Lexically normalize a path: drop `.`, fold `..`, collapse separators.
///
/// Never touches the filesystem, so symlinks are not resolved. `..` at the
/// root stays at the root.
pub fn clean_path(path: &Path) -> PathBuf {
    let mut parts: Vec<Component> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match parts.last() {
                Some(Component::Normal(_)) => {
                    parts.pop();
                }
                Some(Component::RootDir) => {}
                _ => parts.push(component),
            },
            other => parts.push(other),
        }
    }

    if parts.is_empty() {
        return PathBuf::from(".");
    }
    parts.iter().collect()
}

/// Absolute form of a symlink's target text, resolved against the link's directory
pub fn link_target_to_full_path(link_path: &Path, target: &Path) -> PathBuf {
    if target.is_absolute() {
        return clean_path(target);
    }

    let base = link_path.parent().unwrap_or_else(|| Path::new("/"));
    clean_path(&base.join(target))
}

/// Make a path absolute against the working directory, lexically cleaned
pub fn absolute_path(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return clean_path(path);
    }

    match env::current_dir() {
        Ok(cwd) => clean_path(&cwd.join(path)),
        Err(_) => clean_path(path),
    }
}

/// Location of a source path inside a mirrored output tree
pub fn dest_path(root: &Path, source: &Path) -> PathBuf {
    let relative = source.strip_prefix("/").unwrap_or(source);
    root.join(relative)
}

/// Search `PATH` for an executable regular file with the given name
pub fn find_executable(name: &str) -> Option<PathBuf> {
    let search = env::var_os("PATH")?;
    env::split_paths(&search)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable_file(candidate))
}

fn is_executable_file(path: &Path) -> bool {
    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// True when `path` equals `root` or lies below it
pub fn is_under(path: &str, root: &str) -> bool {
    let root = root.trim_end_matches('/');
    if root.is_empty() {
        return path.starts_with('/');
    }
    path == root || path.strip_prefix(root).map_or(false, |rest| rest.starts_with('/'))
}
