//! Filesystem helpers for mirroring source paths into the output tree.
//!
//! `clone` copies carry the source mode bits (including setuid, setgid and
//! sticky) and ownership; plain copies keep only the permission bits that
//! `fs::copy` transfers. Ownership changes are best effort: they fail
//! without privileges and are logged, not returned.
//!
//! Symlinks already copied into an output tree keep their original link
//! text, so an absolute one points back at the live filesystem. Output
//! locations are therefore resolved with [`output_path`], which treats the
//! output root as `/`, and checked with [`ensure_contained`] before writing.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::fs;
use std::os::unix::fs::{chown, lchown, symlink, MetadataExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use log::{debug, warn};

use crate::artifacts::matcher::PathMatcher;
use crate::artifacts::walker::{TreeWalker, WalkAction};
use crate::config::AccessInfo;
use crate::constants::MAX_OUTPUT_LINK_HOPS;

const PERM_BITS: u32 = 0o777;
const SPECIAL_BITS: u32 = 0o7000;

/// Copy a regular file or a symlink, picked by lstat
pub fn copy_file(clone: bool, src: &Path, dst: &Path) -> Result<()> {
    let metadata = fs::symlink_metadata(src)
        .context(format!("Failed to stat source: {}", src.display()))?;

    let file_type = metadata.file_type();
    if file_type.is_file() {
        copy_regular_file(clone, src, dst)
    } else if file_type.is_symlink() {
        copy_symlink(clone, src, dst)
    } else {
        bail!("Unsupported file object type: {}", src.display())
    }
}

/// Copy file data, creating the destination's parent directories
pub fn copy_regular_file(clone: bool, src: &Path, dst: &Path) -> Result<()> {
    let metadata = fs::metadata(src).context(format!("Failed to stat source: {}", src.display()))?;
    if !metadata.is_file() {
        bail!("Source is not a regular file: {}", src.display());
    }

    ensure_parent_dir(clone, src, dst)?;

    if fs::symlink_metadata(dst).is_ok() {
        fs::remove_file(dst).context(format!("Failed to replace: {}", dst.display()))?;
    }

    let written = fs::copy(src, dst).context(format!(
        "Failed to copy {} to {}",
        src.display(),
        dst.display()
    ))?;

    if written != metadata.len() {
        bail!(
            "{} -> {}: partial copy - {}/{}",
            src.display(),
            dst.display(),
            written,
            metadata.len()
        );
    }

    if clone {
        fs::set_permissions(dst, fs::Permissions::from_mode(metadata.mode() & (PERM_BITS | SPECIAL_BITS)))
            .context(format!("Failed to set mode on {}", dst.display()))?;
        if let Err(e) = chown(dst, Some(metadata.uid()), Some(metadata.gid())) {
            warn!("Unable to change owner of {}: {}", dst.display(), e);
        }
    }

    Ok(())
}

/// Recreate a symlink with the same link text
pub fn copy_symlink(clone: bool, src: &Path, dst: &Path) -> Result<()> {
    ensure_parent_dir(false, src, dst)?;

    let link_ref =
        fs::read_link(src).context(format!("Failed to read link: {}", src.display()))?;

    symlink(&link_ref, dst).context(format!(
        "Failed to create link {} -> {}",
        dst.display(),
        link_ref.display()
    ))?;

    if clone {
        if let Ok(metadata) = fs::symlink_metadata(src) {
            if let Err(e) = lchown(dst, Some(metadata.uid()), Some(metadata.gid())) {
                warn!("Unable to change owner of {}: {}", dst.display(), e);
            }
        }
    }

    Ok(())
}

/// Create `dst` as an empty directory mirroring `src`
pub fn copy_dir_only(clone: bool, src: &Path, dst: &Path) -> Result<()> {
    let metadata = fs::metadata(src).context(format!("Failed to stat source: {}", src.display()))?;
    if !metadata.is_dir() {
        bail!("Source is not a directory: {}", src.display());
    }

    if dst.is_dir() {
        return Ok(());
    }

    if clone {
        clone_dir_path(src, dst)
    } else {
        fs::create_dir_all(dst).context(format!("Failed to create directory: {}", dst.display()))
    }
}

/// Copy a directory tree into the output tree at `root`, honoring exclude
/// patterns. A symlinked `src` is followed.
///
/// Entry locations are resolved inside `root`, so links already present
/// under `dst` never lead outside of it. Per-entry failures are collected
/// and returned; only a bad source aborts.
pub fn copy_dir(
    clone: bool,
    src: &Path,
    root: &Path,
    dst: &Path,
    excludes: &PathMatcher,
) -> Result<Vec<anyhow::Error>> {
    if src == dst {
        bail!("Source and destination are the same: {}", src.display());
    }

    let metadata = fs::metadata(src).context(format!("Failed to stat source: {}", src.display()))?;
    if !metadata.is_dir() {
        bail!("Source is not a directory: {}", src.display());
    }

    let base = dst
        .strip_prefix(root)
        .map_err(|_| anyhow!("{} is not under {}", dst.display(), root.display()))?
        .to_path_buf();
    ensure_contained(root, dst)?;
    copy_dir_only(clone, src, dst)?;

    let mut errors = Vec::new();
    TreeWalker::new(src, excludes).walk(|entry, entry_meta| {
        let path = entry.path();
        let relative = match path.strip_prefix(src) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel,
            _ => return WalkAction::Continue,
        };

        let target = output_path(root, &base.join(relative));
        if let Err(e) = ensure_contained(root, &target) {
            errors.push(e);
            return WalkAction::Continue;
        }

        let result = if entry_meta.is_dir() {
            copy_dir_only(clone, path, &target)
        } else if entry_meta.file_type().is_symlink() && fs::symlink_metadata(&target).is_ok() {
            Ok(())
        } else {
            copy_file(clone, path, &target)
        };

        if let Err(e) = result {
            debug!("copy_dir: skipping {}: {}", path.display(), e);
            errors.push(e);
        }
        WalkAction::Continue
    });

    Ok(errors)
}

/// Apply a permission and ownership override to an output path
pub fn set_access(dst: &Path, access: &AccessInfo) -> Result<()> {
    if access.flags != 0 {
        let metadata = fs::metadata(dst).context(format!("Failed to stat: {}", dst.display()))?;

        let mut mode = metadata.mode() & (PERM_BITS | SPECIAL_BITS);
        mode = (mode & !PERM_BITS) | (access.flags & PERM_BITS);
        if !access.perms_only {
            mode = (mode & !SPECIAL_BITS) | (access.flags & SPECIAL_BITS);
        }

        fs::set_permissions(dst, fs::Permissions::from_mode(mode))
            .context(format!("Failed to set mode on {}", dst.display()))?;
    }

    if access.uid > -1 || access.gid > -1 {
        let uid = u32::try_from(access.uid).ok();
        let gid = u32::try_from(access.gid).ok();
        chown(dst, uid, gid).context(format!("Failed to change owner of {}", dst.display()))?;
    }

    Ok(())
}

/// Create an empty directory with an explicit mode
pub fn create_dir_with_mode(path: &Path, mode: u32) -> Result<()> {
    fs::create_dir_all(path).context(format!("Failed to create directory: {}", path.display()))?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .context(format!("Failed to set mode on {}", path.display()))
}

/// lstat-based existence check (dangling links exist)
pub fn exists(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

/// Location of `source` inside the output tree at `root`, resolved the way
/// a chroot at `root` sees it: symlinked directories on the way are
/// followed with `root` as `/`, and `..` stops at `root`. The last
/// component is never followed.
pub fn output_path(root: &Path, source: &Path) -> PathBuf {
    let mut pending: VecDeque<OsString> = path_parts(source).collect();
    let mut resolved: Vec<OsString> = Vec::new();
    let mut hops = 0;

    while let Some(name) = pending.pop_front() {
        if name == ".." {
            resolved.pop();
            continue;
        }
        if pending.is_empty() {
            resolved.push(name);
            break;
        }

        let candidate = root.join(resolved.iter().collect::<PathBuf>()).join(&name);
        let link_ref = match fs::symlink_metadata(&candidate) {
            Ok(m) if m.file_type().is_symlink() && hops < MAX_OUTPUT_LINK_HOPS => {
                fs::read_link(&candidate).ok()
            }
            _ => None,
        };

        match link_ref {
            Some(target) => {
                hops += 1;
                if target.is_absolute() {
                    resolved.clear();
                }
                let parts: Vec<OsString> = path_parts(&target).collect();
                for part in parts.into_iter().rev() {
                    pending.push_front(part);
                }
            }
            None => resolved.push(name),
        }
    }

    let mut out = root.to_path_buf();
    out.extend(&resolved);
    out
}

fn path_parts(path: &Path) -> impl Iterator<Item = OsString> + '_ {
    path.components().filter_map(|component| match component {
        Component::Normal(name) => Some(name.to_os_string()),
        Component::ParentDir => Some(OsString::from("..")),
        _ => None,
    })
}

/// Fail unless the nearest existing ancestor of `path` resolves inside `root`.
///
/// The root is created when missing.
pub fn ensure_contained(root: &Path, path: &Path) -> Result<()> {
    fs::create_dir_all(root).context(format!("Failed to create output root: {}", root.display()))?;
    let real_root = fs::canonicalize(root)
        .context(format!("Failed to resolve output root: {}", root.display()))?;

    let mut ancestor = path.parent();
    while let Some(dir) = ancestor {
        if let Ok(real) = fs::canonicalize(dir) {
            if real.starts_with(&real_root) {
                return Ok(());
            }
            bail!(
                "Refusing to write {}: {} resolves to {} outside the output tree",
                path.display(),
                dir.display(),
                real.display()
            );
        }
        ancestor = dir.parent();
    }

    bail!("Refusing to write {}: no resolvable parent", path.display())
}

fn ensure_parent_dir(clone: bool, src: &Path, dst: &Path) -> Result<()> {
    let dst_dir = match dst.parent() {
        Some(dir) => dir,
        None => return Ok(()),
    };

    if dst_dir.is_dir() {
        return Ok(());
    }

    match (clone, src.parent()) {
        (true, Some(src_dir)) => clone_dir_path(src_dir, dst_dir),
        _ => fs::create_dir_all(dst_dir)
            .context(format!("Failed to create directory: {}", dst_dir.display())),
    }
}

/// Create the missing tail of `dst`, copying mode and ownership from the
/// matching directories of `src`. Walks up while the base names agree.
fn clone_dir_path(src: &Path, dst: &Path) -> Result<()> {
    let mut pending: Vec<(PathBuf, PathBuf)> = Vec::new();
    let mut src_cur = src.to_path_buf();
    let mut dst_cur = dst.to_path_buf();

    while src_cur != Path::new("/") && src_cur.file_name() == dst_cur.file_name() {
        if dst_cur.exists() {
            break;
        }
        pending.push((src_cur.clone(), dst_cur.clone()));

        match (src_cur.parent(), dst_cur.parent()) {
            (Some(s), Some(d)) => {
                src_cur = s.to_path_buf();
                dst_cur = d.to_path_buf();
            }
            _ => break,
        }
    }

    // anything above the matching tail is created plainly
    fs::create_dir_all(dst).context(format!("Failed to create directory: {}", dst.display()))?;

    for (src_dir, dst_dir) in pending.iter().rev() {
        let metadata = fs::metadata(src_dir)
            .map_err(|e| anyhow!("Failed to stat {}: {}", src_dir.display(), e))?;
        if let Err(e) = fs::set_permissions(dst_dir, fs::Permissions::from_mode(metadata.mode() & (PERM_BITS | SPECIAL_BITS))) {
            warn!("Unable to set mode on {}: {}", dst_dir.display(), e);
        }
        if let Err(e) = chown(dst_dir, Some(metadata.uid()), Some(metadata.gid())) {
            debug!("Unable to change owner of {}: {}", dst_dir.display(), e);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::create_test_file_structure;
    use tempfile::TempDir;

    fn mode_of(path: &Path) -> u32 {
        fs::symlink_metadata(path).unwrap().mode() & 0o7777
    }

    #[test]
    fn test_copy_regular_file_creates_parents() {
        let src_dir = create_test_file_structure().unwrap();
        let out = TempDir::new().unwrap();

        let src = src_dir.path().join("dir1/subdir1/file4.txt");
        let dst = out.path().join("a/b/file4.txt");
        copy_file(false, &src, &dst).unwrap();

        assert_eq!(fs::read(&dst).unwrap(), b"Test content 4");
    }

    #[test]
    fn test_clone_copies_mode() {
        let src_dir = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();

        let src = src_dir.path().join("tool");
        fs::write(&src, b"#!/bin/sh\n").unwrap();
        fs::set_permissions(&src, fs::Permissions::from_mode(0o750)).unwrap();

        let dst = out.path().join("tool");
        copy_regular_file(true, &src, &dst).unwrap();
        assert_eq!(mode_of(&dst), 0o750);
    }

    #[test]
    fn test_copy_symlink_keeps_link_text() {
        let src_dir = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();

        let link = src_dir.path().join("current");
        symlink("releases/v2", &link).unwrap();

        let dst = out.path().join("app/current");
        copy_file(false, &link, &dst).unwrap();
        assert_eq!(fs::read_link(&dst).unwrap(), PathBuf::from("releases/v2"));
    }

    #[test]
    fn test_copy_dir_honors_excludes() {
        let src_dir = create_test_file_structure().unwrap();
        let out = TempDir::new().unwrap();
        let dst = out.path().join("copy");

        let excludes = PathMatcher::new(&[format!("{}/dir1/**", src_dir.path().display())]);
        let errors = copy_dir(false, src_dir.path(), out.path(), &dst, &excludes).unwrap();

        assert!(errors.is_empty());
        assert!(dst.join("file1.txt").exists());
        assert!(dst.join("dir2/file5.log").exists());
        assert!(!dst.join("dir1").exists());
    }

    #[test]
    fn test_set_access_mode_bits() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data");
        fs::write(&path, b"x").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        set_access(
            &path,
            &AccessInfo {
                flags: 0o1600,
                perms_only: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(mode_of(&path), 0o600);

        set_access(
            &path,
            &AccessInfo {
                flags: 0o1700,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(mode_of(&path), 0o1700);

        // unchanged owner, zero flags: no-op
        set_access(&path, &AccessInfo::default()).unwrap();
        assert_eq!(mode_of(&path), 0o1700);
    }

    #[test]
    fn test_create_dir_with_mode() {
        let dir = TempDir::new().unwrap();
        let tmp = dir.path().join("files/tmp");
        create_dir_with_mode(&tmp, 0o1777).unwrap();
        assert_eq!(mode_of(&tmp), 0o1777);
    }

    #[test]
    fn test_exists_sees_dangling_links() {
        let dir = TempDir::new().unwrap();
        let link = dir.path().join("dangling");
        symlink("/nonexistent/target", &link).unwrap();
        assert!(exists(&link));
        assert!(!link.exists());
    }

    #[test]
    fn test_output_path_follows_links_inside_root() {
        let out = TempDir::new().unwrap();
        let root = out.path();
        fs::create_dir_all(root.join("usr/lib")).unwrap();
        symlink("usr/lib", root.join("lib")).unwrap();
        symlink("/usr/lib", root.join("lib64")).unwrap();

        let expected = root.join("usr/lib/libc.so.6");
        assert_eq!(output_path(root, Path::new("/lib/libc.so.6")), expected);
        assert_eq!(output_path(root, Path::new("/lib64/libc.so.6")), expected);

        // the last component is left alone
        assert_eq!(output_path(root, Path::new("/lib")), root.join("lib"));
    }

    #[test]
    fn test_output_path_stays_under_root() {
        let out = TempDir::new().unwrap();
        let root = out.path();
        fs::create_dir_all(root.join("data")).unwrap();
        symlink("../../../../etc", root.join("data/up")).unwrap();
        symlink("loop", root.join("loop")).unwrap();

        assert_eq!(
            output_path(root, Path::new("/data/up/passwd")),
            root.join("etc/passwd")
        );
        assert!(output_path(root, Path::new("/loop/x")).starts_with(root));
    }

    #[test]
    fn test_ensure_contained_rejects_escaping_parent() {
        let live = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        fs::write(live.path().join("asset.txt"), b"live").unwrap();
        symlink(live.path(), out.path().join("alias")).unwrap();

        let through_link = out.path().join("alias/asset.txt");
        assert!(ensure_contained(out.path(), &through_link).is_err());
        assert!(ensure_contained(out.path(), &out.path().join("a/b/c.txt")).is_ok());
    }

    #[test]
    fn test_copy_dir_never_writes_through_output_links() {
        let live = TempDir::new().unwrap();
        let real = live.path().join("real");
        let alias = live.path().join("alias");
        fs::create_dir_all(&real).unwrap();
        fs::write(real.join("asset.txt"), b"live").unwrap();
        symlink(&real, &alias).unwrap();

        let out = TempDir::new().unwrap();
        let root = out.path();
        let dst = dest_in(root, &alias);
        fs::create_dir_all(dst.parent().unwrap()).unwrap();
        // copied earlier with its absolute link text
        symlink(&real, &dst).unwrap();

        let errors = copy_dir(false, &alias, root, &dst, &PathMatcher::default()).unwrap();
        assert!(errors.is_empty());

        assert_eq!(fs::read(real.join("asset.txt")).unwrap(), b"live");
        assert_eq!(fs::read(dest_in(root, &real).join("asset.txt")).unwrap(), b"live");
    }

    #[test]
    fn test_copy_dir_refuses_escaping_target() {
        let live = TempDir::new().unwrap();
        let real = live.path().join("real");
        fs::create_dir_all(&real).unwrap();
        fs::write(real.join("asset.txt"), b"live").unwrap();

        let out = TempDir::new().unwrap();
        let root = out.path();
        let dst = dest_in(root, &real);
        fs::create_dir_all(dst.parent().unwrap()).unwrap();
        symlink(&real, &dst).unwrap();

        let errors = copy_dir(false, &real, root, &dst, &PathMatcher::default()).unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(fs::read(real.join("asset.txt")).unwrap(), b"live");
    }

    fn dest_in(root: &Path, source: &Path) -> PathBuf {
        root.join(source.strip_prefix("/").unwrap())
    }
}
