use log::debug;
use serde::{Deserialize, Serialize};
use sysinfo::{System, SystemExt};

/// Distribution details of the running system
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct DistroInfo {
    pub name: String,
    pub version: String,
    pub display_name: String,
}

/// Host system section of the container report
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct SystemReport {
    #[serde(rename = "type")]
    pub os_type: String,
    pub release: String,
    pub distro: DistroInfo,
}

impl SystemReport {
    /// Collect the host description. Fields the platform cannot report stay empty.
    pub fn collect() -> Self {
        let system = System::new();

        let report = SystemReport {
            os_type: std::env::consts::OS.to_string(),
            release: system.kernel_version().unwrap_or_default(),
            distro: DistroInfo {
                name: system.name().unwrap_or_default(),
                version: system.os_version().unwrap_or_default(),
                display_name: system.long_os_version().unwrap_or_default(),
            },
        };

        debug!(
            "System: {} {} ({})",
            report.os_type, report.release, report.distro.display_name
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_fills_os_type() {
        let report = SystemReport::collect();
        assert_eq!(report.os_type, std::env::consts::OS);
    }

    #[test]
    fn test_type_field_name() {
        let report = SystemReport {
            os_type: "linux".to_string(),
            release: "6.1.0".to_string(),
            distro: DistroInfo {
                name: "Debian GNU/Linux".to_string(),
                version: "12".to_string(),
                display_name: "Debian GNU/Linux 12 (bookworm)".to_string(),
            },
        };

        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["type"], "linux");
        assert_eq!(value["distro"]["display_name"], "Debian GNU/Linux 12 (bookworm)");
    }
}
