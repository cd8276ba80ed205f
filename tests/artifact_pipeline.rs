//! End-to-end tests for a processor run over a small mounted tree.

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use anyhow::Result;
use tempfile::TempDir;

use artifact_sensor::artifacts::Processor;
use artifact_sensor::config::{ArtifactRules, StartCommand};
use artifact_sensor::constants::{CONTAINER_REPORT_FILE_NAME, FILES_DIR_NAME};
use artifact_sensor::inspect::DependencyResolver;
use artifact_sensor::models::{AccessFlag, ArtifactType, FanMonitorReport, FileAccessInfo};
use artifact_sensor::report::{ContainerReport, MonitorReports, SensorInfo};
use artifact_sensor::utils::paths::dest_path;

/// Every binary depends on the same single library
struct SingleLibResolver {
    lib: String,
}

impl DependencyResolver for SingleLibResolver {
    fn direct_dependencies(&self, _bin_path: &Path) -> artifact_sensor::error::Result<Vec<String>> {
        Ok(vec![self.lib.clone()])
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

struct Scenario {
    _dir: TempDir,
    root: PathBuf,
    artifacts: PathBuf,
}

impl Scenario {
    fn new() -> Result<Self> {
        let dir = TempDir::new()?;
        let base = fs::canonicalize(dir.path())?;
        let root = base.join("rootfs");
        let artifacts = base.join("artifacts");

        fs::create_dir_all(root.join("app"))?;
        fs::create_dir_all(root.join("libs"))?;
        fs::create_dir_all(root.join("var/run"))?;

        fs::write(root.join("app/server"), elf64_header(2))?;
        fs::write(root.join("app/config.json"), br#"{"port": 8080}"#)?;
        fs::write(root.join("app/unused.txt"), b"never read")?;
        fs::write(root.join("libs/libdep.so.1"), elf64_header(3))?;
        fs::write(root.join("var/run/nginx.pid"), b"42")?;
        symlink("server", root.join("app/current"))?;

        Ok(Scenario {
            _dir: dir,
            root,
            artifacts,
        })
    }

    fn path(&self, rel: &str) -> String {
        path_str(&self.root.join(rel))
    }

    fn output(&self, rel: &str) -> PathBuf {
        dest_path(&self.artifacts.join(FILES_DIR_NAME), &self.root.join(rel))
    }

    fn monitors(&self) -> MonitorReports {
        let mut files = BTreeMap::new();
        files.insert(
            self.path("app/server"),
            FileAccessInfo {
                event_count: 1,
                exe_count: 1,
                ..Default::default()
            },
        );
        files.insert(
            self.path("app/config.json"),
            FileAccessInfo {
                event_count: 2,
                read_count: 2,
                ..Default::default()
            },
        );
        files.insert(
            self.path("var/run/nginx.pid"),
            FileAccessInfo {
                event_count: 1,
                write_count: 1,
                ..Default::default()
            },
        );

        let mut process_files = BTreeMap::new();
        process_files.insert("100".to_string(), files);

        MonitorReports {
            fan: FanMonitorReport {
                process_files,
                ..Default::default()
            },
            pt: None,
        }
    }

    fn run(&self, cmd: &StartCommand) -> Result<ContainerReport> {
        self.run_with(cmd, self.monitors(), &ArtifactRules::default())
    }

    fn run_with(
        &self,
        cmd: &StartCommand,
        monitors: MonitorReports,
        rules: &ArtifactRules,
    ) -> Result<ContainerReport> {
        let processor = Processor::new(&self.artifacts, Vec::new()).with_sensor_info(SensorInfo {
            version: "test".to_string(),
            args: vec!["artifact-sensor".to_string(), "process".to_string()],
        });
        processor.prepare_env(cmd)?;

        let resolver = SingleLibResolver {
            lib: self.path("libs/libdep.so.1"),
        };
        processor.process(cmd, &self.root, &monitors, rules, &resolver)
    }

    /// `data/real/asset.txt` plus `data/alias`, an absolute link to `data/real`
    fn add_linked_data(&self) -> Result<()> {
        fs::create_dir_all(self.root.join("data/real"))?;
        fs::write(self.root.join("data/real/asset.txt"), b"live")?;
        symlink(self.root.join("data/real"), self.root.join("data/alias"))?;
        Ok(())
    }
}

#[test]
fn test_observed_files_are_retained() -> Result<()> {
    let scenario = Scenario::new()?;
    let cmd = StartCommand {
        app_name: scenario.path("app/server"),
        ..Default::default()
    };
    scenario.run(&cmd)?;

    assert!(scenario.output("app/server").is_file());
    assert_eq!(
        fs::read(scenario.output("app/config.json"))?,
        br#"{"port": 8080}"#.to_vec()
    );
    assert!(!scenario.output("app/unused.txt").exists());

    let link = scenario.output("app/current");
    assert!(fs::symlink_metadata(&link)?.file_type().is_symlink());
    assert_eq!(fs::read_link(&link)?, PathBuf::from("server"));

    assert!(scenario.output("libs/libdep.so.1").is_file());
    Ok(())
}

#[test]
fn test_pid_files_leave_their_directory() -> Result<()> {
    let scenario = Scenario::new()?;
    scenario.run(&StartCommand::default())?;

    assert!(!scenario.output("var/run/nginx.pid").exists());
    assert!(scenario.output("var/run").is_dir());
    Ok(())
}

#[test]
fn test_report_is_sorted_and_complete() -> Result<()> {
    let scenario = Scenario::new()?;
    let cmd = StartCommand {
        app_name: scenario.path("app/server"),
        app_args: vec!["--port".to_string(), "8080".to_string()],
        ..Default::default()
    };
    let report = scenario.run(&cmd)?;

    let names: Vec<&str> = report.image.files.iter().map(|p| p.file_path.as_str()).collect();
    let mut sorted = names.clone();
    sorted.sort();
    assert_eq!(names, sorted);

    let find = |rel: &str| {
        let path = scenario.path(rel);
        report.image.files.iter().find(|p| p.file_path == path).cloned()
    };

    let server = find("app/server").expect("server in report");
    assert_eq!(server.file_type, ArtifactType::File);
    assert!(server.flags.contains(&AccessFlag::Execute));
    assert!(server.sha256_hash.is_some());

    let config = find("app/config.json").expect("config in report");
    assert!(config.flags.contains(&AccessFlag::Read));

    let current = find("app/current").expect("link in report");
    assert_eq!(current.file_type, ArtifactType::Symlink);
    assert_eq!(current.link_ref.as_deref(), Some("server"));

    assert!(find("libs/libdep.so.1").is_some());
    assert!(find("app/unused.txt").is_none());

    let start = report.start_command.as_ref().expect("start command");
    assert_eq!(start.app_args, vec!["--port", "8080"]);
    assert_eq!(report.sensor.version, "test");

    let saved: ContainerReport = serde_json::from_slice(&fs::read(
        scenario.artifacts.join(CONTAINER_REPORT_FILE_NAME),
    )?)?;
    assert_eq!(saved.image.files.len(), report.image.files.len());
    Ok(())
}

#[test]
fn test_excludes_and_preserves() -> Result<()> {
    let scenario = Scenario::new()?;
    fs::create_dir_all(scenario.root.join("data"))?;
    fs::write(scenario.root.join("data/seed.db"), b"original")?;

    let mut cmd = StartCommand {
        excludes: vec![format!("{}/app/config.json", scenario.root.display())],
        ..Default::default()
    };
    cmd.preserves.insert(scenario.path("data/seed.db"), None);

    let processor = Processor::new(&scenario.artifacts, Vec::new());
    processor.prepare_env(&cmd)?;

    // the app overwrites the preserved file during the run
    fs::write(scenario.root.join("data/seed.db"), b"modified")?;

    let resolver = SingleLibResolver {
        lib: scenario.path("libs/libdep.so.1"),
    };
    processor.process(
        &cmd,
        &scenario.root,
        &scenario.monitors(),
        &ArtifactRules::default(),
        &resolver,
    )?;

    assert!(!scenario.output("app/config.json").exists());
    assert_eq!(fs::read(scenario.output("data/seed.db"))?, b"original".to_vec());
    Ok(())
}

#[test]
fn test_archives() -> Result<()> {
    let scenario = Scenario::new()?;
    scenario.run(&StartCommand::default())?;

    let processor = Processor::new(&scenario.artifacts, Vec::new());
    let files_tar = processor.archive_files()?;
    let run_tar = processor.archive()?;

    let mut archive = tar::Archive::new(fs::File::open(&run_tar)?);
    let mut names = Vec::new();
    for entry in archive.entries()? {
        names.push(path_str(&entry?.path()?));
    }
    assert!(names.contains(&CONTAINER_REPORT_FILE_NAME.to_string()));
    assert!(names.iter().all(|n| !n.starts_with(FILES_DIR_NAME)));

    let mut archive = tar::Archive::new(fs::File::open(&files_tar)?);
    let server = scenario.root.join("app/server");
    let server_rel = path_str(server.strip_prefix("/")?);
    let mut found = false;
    for entry in archive.entries()? {
        if path_str(&entry?.path()?) == server_rel {
            found = true;
        }
    }
    assert!(found);
    Ok(())
}

#[test]
fn test_linked_include_dir_is_copied_with_content() -> Result<()> {
    let scenario = Scenario::new()?;
    scenario.add_linked_data()?;

    let mut cmd = StartCommand::default();
    cmd.includes.insert(scenario.path("data/alias"), None);
    cmd.includes.insert(scenario.path("data/alias/asset.txt"), None);
    scenario.run(&cmd)?;

    assert_eq!(fs::read(scenario.root.join("data/real/asset.txt"))?, b"live".to_vec());

    let alias = scenario.output("data/alias");
    assert!(fs::symlink_metadata(&alias)?.is_dir());
    assert_eq!(fs::read(alias.join("asset.txt"))?, b"live".to_vec());
    Ok(())
}

#[test]
fn test_include_through_copied_link_stays_in_output() -> Result<()> {
    let scenario = Scenario::new()?;
    scenario.add_linked_data()?;

    // the link itself was observed, so it is copied before the includes
    let mut monitors = scenario.monitors();
    if let Some(files) = monitors.fan.process_files.get_mut("100") {
        files.insert(
            scenario.path("data/alias"),
            FileAccessInfo {
                event_count: 1,
                read_count: 1,
                ..Default::default()
            },
        );
    }

    let mut cmd = StartCommand::default();
    cmd.includes.insert(scenario.path("data/alias"), None);
    cmd.includes.insert(scenario.path("data/alias/asset.txt"), None);
    scenario.run_with(&cmd, monitors, &ArtifactRules::default())?;

    let live = scenario.root.join("data/real/asset.txt");
    assert!(fs::symlink_metadata(&live)?.is_file());
    assert_eq!(fs::read(&live)?, b"live".to_vec());

    let alias = scenario.output("data/alias");
    assert!(fs::symlink_metadata(&alias)?.file_type().is_symlink());
    assert_eq!(fs::read(scenario.output("data/real/asset.txt"))?, b"live".to_vec());
    Ok(())
}

#[test]
fn test_overlapping_includes() -> Result<()> {
    let scenario = Scenario::new()?;
    fs::create_dir_all(scenario.root.join("data/sub"))?;
    fs::write(scenario.root.join("data/top.txt"), b"top")?;
    fs::write(scenario.root.join("data/sub/inner.txt"), b"inner")?;

    let mut cmd = StartCommand::default();
    cmd.includes.insert(scenario.path("data"), None);
    cmd.includes.insert(scenario.path("data/sub"), None);
    cmd.includes.insert(scenario.path("data/sub/inner.txt"), None);
    scenario.run(&cmd)?;

    assert_eq!(fs::read(scenario.output("data/top.txt"))?, b"top".to_vec());
    assert_eq!(fs::read(scenario.output("data/sub/inner.txt"))?, b"inner".to_vec());
    assert_eq!(
        fs::read(scenario.root.join("data/sub/inner.txt"))?,
        b"inner".to_vec()
    );
    Ok(())
}

#[test]
fn test_linked_cert_dir_is_copied_with_content() -> Result<()> {
    let scenario = Scenario::new()?;
    fs::create_dir_all(scenario.root.join("usr/share/ca"))?;
    fs::write(scenario.root.join("usr/share/ca/root.pem"), b"cert")?;
    fs::create_dir_all(scenario.root.join("etc/ssl"))?;
    symlink(
        scenario.root.join("usr/share/ca"),
        scenario.root.join("etc/ssl/certs"),
    )?;

    let cmd = StartCommand {
        include_cert_dirs: true,
        ..Default::default()
    };
    let rules = ArtifactRules {
        cert_dirs: vec![scenario.path("etc/ssl/certs")],
        ca_cert_dirs: Vec::new(),
        cert_extra_dirs: Vec::new(),
        ..Default::default()
    };
    scenario.run_with(&cmd, scenario.monitors(), &rules)?;

    let certs = scenario.output("etc/ssl/certs");
    assert!(fs::symlink_metadata(&certs)?.is_dir());
    assert_eq!(fs::read(certs.join("root.pem"))?, b"cert".to_vec());
    Ok(())
}
