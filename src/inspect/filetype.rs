use std::path::{Path, PathBuf};
use std::process::Command;

use log::debug;

use crate::constants::FILE_TYPE_EXE_NAME;
use crate::utils::paths::find_executable;

/// Data type sniffer backed by the `file` command.
///
/// The tool is located once; when it is missing every lookup returns `None`.
#[derive(Debug, Clone, Default)]
pub struct DataTypeSniffer {
    tool: Option<PathBuf>,
}

impl DataTypeSniffer {
    pub fn new() -> Self {
        let tool = find_executable(FILE_TYPE_EXE_NAME);
        if tool.is_none() {
            debug!("'{}' not found on PATH, data types will be omitted", FILE_TYPE_EXE_NAME);
        }
        DataTypeSniffer { tool }
    }

    /// A sniffer that never reports a data type
    pub fn disabled() -> Self {
        DataTypeSniffer { tool: None }
    }

    pub fn is_available(&self) -> bool {
        self.tool.is_some()
    }

    /// Data type label for a regular file
    pub fn data_type(&self, path: &Path) -> Option<String> {
        let tool = self.tool.as_ref()?;

        let output = match Command::new(tool).arg(path).output() {
            Ok(output) => output,
            Err(e) => {
                debug!("Failed to run {} on {}: {}", tool.display(), path.display(), e);
                return None;
            }
        };

        if !output.status.success() {
            debug!(
                "{} failed on {}: {}",
                tool.display(),
                path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return None;
        }

        Some(parse_file_output(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Extract the label from `<path>: <label>` output
pub fn parse_file_output(stdout: &str) -> String {
    let mut parts = stdout.trim().split(':');
    parts.next();
    match parts.next() {
        Some(label) => label.trim().to_string(),
        None => "unknown".to_string(),
    }
}
