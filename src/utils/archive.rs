use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, info};
use tar::Builder;
use walkdir::WalkDir;

/// One top-level item to place in an archive
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    pub source: PathBuf,
    /// Name inside the archive
    pub name: String,
}

/// Write a tar archive holding `entries`; directories are added recursively.
///
/// Symlinks are stored as links, never followed.
pub fn write_tar(output: &Path, entries: &[ArchiveEntry]) -> Result<usize> {
    let file = File::create(output)
        .context(format!("Failed to create archive: {}", output.display()))?;
    let mut builder = Builder::new(file);
    builder.follow_symlinks(false);

    let mut count = 0;
    for entry in entries {
        count += append_tree(&mut builder, &entry.source, &entry.name)?;
    }

    builder
        .into_inner()
        .context(format!("Failed to finish archive: {}", output.display()))?;

    info!("Wrote {} entries to {}", count, output.display());
    Ok(count)
}

/// Archive the contents of `dir` with paths relative to it
pub fn write_dir_tar(output: &Path, dir: &Path) -> Result<usize> {
    let file = File::create(output)
        .context(format!("Failed to create archive: {}", output.display()))?;
    let mut builder = Builder::new(file);
    builder.follow_symlinks(false);

    let mut count = 0;
    for entry in WalkDir::new(dir)
        .follow_links(false)
        .min_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.context(format!("Failed to walk {}", dir.display()))?;
        let relative = entry
            .path()
            .strip_prefix(dir)
            .context(format!("Unexpected path {}", entry.path().display()))?;

        builder
            .append_path_with_name(entry.path(), relative)
            .context(format!("Failed to archive {}", entry.path().display()))?;
        count += 1;
    }

    builder
        .into_inner()
        .context(format!("Failed to finish archive: {}", output.display()))?;

    info!("Wrote {} entries to {}", count, output.display());
    Ok(count)
}

fn append_tree(builder: &mut Builder<File>, source: &Path, name: &str) -> Result<usize> {
    let mut count = 0;
    for entry in WalkDir::new(source).follow_links(false).sort_by_file_name() {
        let entry = entry.context(format!("Failed to walk {}", source.display()))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .context(format!("Unexpected path {}", entry.path().display()))?;
        let archive_name = if relative.as_os_str().is_empty() {
            PathBuf::from(name)
        } else {
            Path::new(name).join(relative)
        };

        debug!("Archiving {} as {}", entry.path().display(), archive_name.display());
        builder
            .append_path_with_name(entry.path(), &archive_name)
            .context(format!("Failed to archive {}", entry.path().display()))?;
        count += 1;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::create_test_file_structure;
    use std::collections::BTreeSet;
    use tar::Archive;

    fn names(archive_path: &Path) -> BTreeSet<String> {
        let mut archive = Archive::new(File::open(archive_path).unwrap());
        archive
            .entries()
            .unwrap()
            .map(|e| {
                e.unwrap()
                    .path()
                    .unwrap()
                    .to_string_lossy()
                    .trim_end_matches('/')
                    .to_string()
            })
            .collect()
    }

    #[test]
    fn test_dir_tar_uses_relative_names() {
        let temp_dir = create_test_file_structure().unwrap();
        let out_dir = tempfile::TempDir::new().unwrap();
        let output = out_dir.path().join("files.tar");

        write_dir_tar(&output, temp_dir.path()).unwrap();
        let names = names(&output);

        assert!(names.contains("file1.txt"));
        assert!(names.contains("dir1/subdir1/file4.txt"));
        assert!(names.contains("dir2"));
    }

    #[test]
    fn test_named_entries() {
        let temp_dir = create_test_file_structure().unwrap();
        let out_dir = tempfile::TempDir::new().unwrap();
        let output = out_dir.path().join("run.tar");

        let entries = vec![
            ArchiveEntry {
                source: temp_dir.path().join("file1.txt"),
                name: "file1.txt".to_string(),
            },
            ArchiveEntry {
                source: temp_dir.path().join("dir2"),
                name: "logs".to_string(),
            },
        ];
        let count = write_tar(&output, &entries).unwrap();
        assert_eq!(count, 3);

        let names = names(&output);
        assert!(names.contains("file1.txt"));
        assert!(names.contains("logs/file5.log"));
    }
}
