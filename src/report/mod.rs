//! Container report: what ran, what was observed and what was kept.
//!
//! The report is written as pretty JSON to `creport.json` in the artifacts
//! directory once the output tree is final.

pub mod enumerate;
pub mod system;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::artifacts::store::{ArtifactStore, StorePhase};
use crate::config::StartCommand;
use crate::constants::CONTAINER_REPORT_FILE_NAME;
use crate::models::{ArtifactProps, FanMonitorReport, PtMonitorReport};

pub use system::{DistroInfo, SystemReport};

/// Sensor build and invocation
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct SensorInfo {
    pub version: String,
    pub args: Vec<String>,
}

impl SensorInfo {
    /// The running binary's version and command line
    pub fn current() -> Self {
        SensorInfo {
            version: env!("CARGO_PKG_VERSION").to_string(),
            args: std::env::args().collect(),
        }
    }
}

/// Monitor outputs the store consumes
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct MonitorReports {
    pub fan: FanMonitorReport,
    pub pt: Option<PtMonitorReport>,
}

impl MonitorReports {
    /// Load the file-access report and, if given, the syscall-trace report
    pub fn from_files(fan_path: &Path, pt_path: Option<&Path>) -> Result<Self> {
        let fan: FanMonitorReport = read_json(fan_path)?;
        let pt = match pt_path {
            Some(path) => Some(read_json::<PtMonitorReport>(path)?),
            None => None,
        };

        info!(
            "Loaded monitor reports: {} processes with file events, trace monitor {}",
            fan.process_files.len(),
            if pt.as_ref().map_or(false, |p| p.enabled) {
                "enabled"
            } else {
                "disabled"
            }
        );
        Ok(MonitorReports { fan, pt })
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let data = fs::read(path)
        .with_context(|| format!("Failed to read monitor report: {}", path.display()))?;
    serde_json::from_slice(&data)
        .with_context(|| format!("Failed to parse monitor report: {}", path.display()))
}

/// Start command summary carried in the report
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct StartCommandInfo {
    pub app_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub app_args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub app_entrypoint: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub app_cmd: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub app_user: String,
}

impl From<&StartCommand> for StartCommandInfo {
    fn from(cmd: &StartCommand) -> Self {
        StartCommandInfo {
            app_name: cmd.app_name.clone(),
            app_args: cmd.app_args.clone(),
            app_entrypoint: cmd.app_entrypoint.clone(),
            app_cmd: cmd.app_cmd.clone(),
            app_user: cmd.app_user.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct ImageReport {
    pub files: Vec<ArtifactProps>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct ContainerReport {
    pub start_command: Option<StartCommandInfo>,
    pub sensor: SensorInfo,
    pub system: SystemReport,
    pub monitors: MonitorReports,
    pub image: ImageReport,
}

/// Write the report as pretty JSON, creating the artifacts directory if needed
pub fn write_report(artifacts_dir: &Path, report: &ContainerReport) -> Result<PathBuf> {
    if !artifacts_dir.exists() {
        fs::create_dir_all(artifacts_dir).with_context(|| {
            format!("Failed to create artifacts directory: {}", artifacts_dir.display())
        })?;
    }

    let path = artifacts_dir.join(CONTAINER_REPORT_FILE_NAME);
    let mut data =
        serde_json::to_vec_pretty(report).context("Failed to serialize container report")?;
    data.push(b'\n');

    fs::write(&path, data)
        .with_context(|| format!("Failed to write container report: {}", path.display()))?;

    info!(
        "Container report with {} files saved to {}",
        report.image.files.len(),
        path.display()
    );
    Ok(path)
}

impl<'a> ArtifactStore<'a> {
    /// Build the report from the final name list and write it
    pub fn save_report(&mut self, sensor: SensorInfo) -> Result<ContainerReport> {
        self.advance(StorePhase::Reporting)?;

        let mut files = Vec::with_capacity(self.name_list.len());
        for name in self.sorted_names() {
            match self.known.get(&name) {
                Some(props) => files.push(props.clone()),
                None => debug!("Name {} has no recorded properties", name),
            }
        }

        let report = ContainerReport {
            start_command: Some(StartCommandInfo::from(self.env.cmd)),
            sensor,
            system: SystemReport::collect(),
            monitors: MonitorReports {
                fan: self.env.fan.clone(),
                pt: self.env.pt.cloned(),
            },
            image: ImageReport { files },
        };

        write_report(self.env.artifacts_dir, &report)?;
        self.advance(StorePhase::Done)?;
        Ok(report)
    }
}
