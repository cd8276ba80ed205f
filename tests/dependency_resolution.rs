//! Integration tests for shared-library dependency closure.

use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use anyhow::Result;
use tempfile::TempDir;

use artifact_sensor::error::SensorError;
use artifact_sensor::inspect::binfile::{self, BinKind};
use artifact_sensor::inspect::sodeps::{all_dependencies, DependencyResolver};

/// Resolver that reports a fixed list for every binary
struct FixedResolver {
    deps: Vec<String>,
}

impl DependencyResolver for FixedResolver {
    fn direct_dependencies(&self, _bin_path: &Path) -> artifact_sensor::error::Result<Vec<String>> {
        Ok(self.deps.clone())
    }
}

/// Resolver that behaves like a system without `ldd`
struct MissingResolver;

impl DependencyResolver for MissingResolver {
    fn direct_dependencies(&self, _bin_path: &Path) -> artifact_sensor::error::Result<Vec<String>> {
        Err(SensorError::ResolverNotFound("ldd".to_string()))
    }
}

fn elf64_header(e_type: u16) -> Vec<u8> {
    let mut header = vec![0u8; 64];
    header[..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
    header[4] = 2;
    header[5] = 1;
    header[6] = 1;
    header[16..18].copy_from_slice(&e_type.to_le_bytes());
    header
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn setup() -> Result<(TempDir, PathBuf)> {
    let dir = TempDir::new()?;
    let root = fs::canonicalize(dir.path())?;
    fs::create_dir_all(root.join("bin"))?;
    fs::create_dir_all(root.join("lib"))?;
    fs::write(root.join("bin/app"), elf64_header(2))?;
    Ok((dir, root))
}

#[test]
fn test_classifier() -> Result<()> {
    let (_dir, root) = setup()?;
    fs::write(root.join("lib/libfoo.so.1"), elf64_header(3))?;
    fs::write(root.join("notes.txt"), b"plain text")?;

    let exe = binfile::detect(&root.join("bin/app"))?.map(|p| p.kind);
    let so = binfile::detect(&root.join("lib/libfoo.so.1"))?.map(|p| p.kind);
    assert_eq!(exe, Some(BinKind::Executable));
    assert_eq!(so, Some(BinKind::SharedObject));
    assert!(binfile::detect(&root.join("notes.txt"))?.is_none());
    Ok(())
}

#[test]
fn test_dependency_links_are_followed() -> Result<()> {
    let (_dir, root) = setup()?;
    let lib = root.join("lib");
    fs::write(lib.join("libfoo.so.1.0.0"), elf64_header(3))?;
    symlink("libfoo.so.1.0.0", lib.join("libfoo.so.1"))?;

    let resolver = FixedResolver {
        deps: vec![path_str(&lib.join("libfoo.so.1")), "/nonexistent/libgone.so".to_string()],
    };
    let deps = all_dependencies(&resolver, &root.join("bin/app"))?;

    assert_eq!(
        deps,
        vec![
            path_str(&root.join("bin/app")),
            path_str(&lib.join("libfoo.so.1")),
            path_str(&lib.join("libfoo.so.1.0.0")),
        ]
    );
    Ok(())
}

#[test]
fn test_cyclic_dependency_links_terminate() -> Result<()> {
    let (_dir, root) = setup()?;
    let lib = root.join("lib");
    symlink("libloop.so.b", lib.join("libloop.so.a"))?;
    symlink("libloop.so.a", lib.join("libloop.so.b"))?;

    let resolver = FixedResolver {
        deps: vec![path_str(&lib.join("libloop.so.a"))],
    };
    let deps = all_dependencies(&resolver, &root.join("bin/app"))?;

    assert!(deps.contains(&path_str(&lib.join("libloop.so.a"))));
    assert!(deps.contains(&path_str(&lib.join("libloop.so.b"))));
    assert_eq!(deps.len(), 3);
    Ok(())
}

#[test]
fn test_caller_contract_errors() -> Result<()> {
    let (_dir, root) = setup()?;
    fs::write(root.join("script.sh"), b"#!/bin/sh\necho hi\n")?;
    let resolver = FixedResolver { deps: Vec::new() };

    let relative = all_dependencies(&resolver, Path::new("bin/app"));
    assert!(matches!(relative, Err(SensorError::PathNotAbsolute(_))));

    let script = all_dependencies(&resolver, &root.join("script.sh"));
    assert!(matches!(script, Err(SensorError::NotBinary(_))));
    Ok(())
}

#[test]
fn test_missing_resolver_is_reported() -> Result<()> {
    let (_dir, root) = setup()?;
    let err = all_dependencies(&MissingResolver, &root.join("bin/app")).unwrap_err();
    assert!(err.is_resolver_not_found());
    Ok(())
}
