use std::collections::{BTreeMap, BTreeSet};
use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;

use serde::{Deserialize, Serialize};

/// Kind of filesystem object an artifact refers to
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactType {
    Dir,
    File,
    Symlink,
    Unknown,
}

impl ArtifactType {
    /// Classify from lstat metadata
    pub fn from_metadata(metadata: &Metadata) -> Self {
        let file_type = metadata.file_type();
        if file_type.is_symlink() {
            ArtifactType::Symlink
        } else if file_type.is_file() {
            ArtifactType::File
        } else if file_type.is_dir() {
            ArtifactType::Dir
        } else {
            ArtifactType::Unknown
        }
    }
}

/// Observed access kind
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AccessFlag {
    #[serde(rename = "R")]
    Read,
    #[serde(rename = "W")]
    Write,
    #[serde(rename = "X")]
    Execute,
}

/// Filesystem activity summary from the syscall trace monitor
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct FsActivityInfo {
    #[serde(default)]
    pub ops_all: u64,
    #[serde(default)]
    pub ops_checkfile: u64,
    #[serde(default)]
    pub syscalls: BTreeSet<i32>,
    #[serde(default)]
    pub pids: BTreeSet<i32>,
    #[serde(default)]
    pub is_subdir: bool,
}

/// Properties of one retained path
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ArtifactProps {
    pub file_type: ArtifactType,
    pub file_path: String,
    #[serde(skip)]
    pub mode: u32,
    #[serde(rename = "mode")]
    pub mode_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_ref: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub flags: BTreeSet<AccessFlag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
    pub file_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_type: Option<String>,
    #[serde(skip)]
    pub fs_activity: Option<FsActivityInfo>,
}

impl ArtifactProps {
    /// Base properties from lstat metadata; type-specific fields stay empty
    pub fn from_metadata(path: &str, metadata: &Metadata) -> Self {
        let mode = metadata.mode();
        ArtifactProps {
            file_type: ArtifactType::from_metadata(metadata),
            file_path: path.to_string(),
            mode,
            mode_text: mode_text(mode),
            link_ref: None,
            flags: BTreeSet::new(),
            data_type: None,
            file_size: metadata.len(),
            sha256_hash: None,
            app_type: None,
            fs_activity: None,
        }
    }

    pub fn has_flags(&self) -> bool {
        !self.flags.is_empty()
    }
}

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;
const S_IFLNK: u32 = 0o120000;
const S_IFIFO: u32 = 0o010000;
const S_IFSOCK: u32 = 0o140000;
const S_IFCHR: u32 = 0o020000;
const S_IFBLK: u32 = 0o060000;

/// Render raw st_mode bits the way `ls -l` does
pub fn mode_text(mode: u32) -> String {
    let kind = match mode & S_IFMT {
        S_IFDIR => 'd',
        S_IFLNK => 'l',
        S_IFIFO => 'p',
        S_IFSOCK => 's',
        S_IFCHR => 'c',
        S_IFBLK => 'b',
        _ => '-',
    };

    let mut out = String::with_capacity(10);
    out.push(kind);

    let special = [(0o4000, 's', 'S'), (0o2000, 's', 'S'), (0o1000, 't', 'T')];
    for (idx, shift) in [6u32, 3, 0].iter().enumerate() {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });

        let (mask, set_exec, set_noexec) = special[idx];
        let exec = bits & 0o1 != 0;
        out.push(match (mode & mask != 0, exec) {
            (true, true) => set_exec,
            (true, false) => set_noexec,
            (false, true) => 'x',
            (false, false) => '-',
        });
    }

    out
}

/// Per-path counters from the file access monitor
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct FileAccessInfo {
    #[serde(default)]
    pub event_count: u32,
    #[serde(default, rename = "first_eid")]
    pub first_event_id: u32,
    #[serde(default, rename = "reads", skip_serializing_if = "is_zero")]
    pub read_count: u32,
    #[serde(default, rename = "writes", skip_serializing_if = "is_zero")]
    pub write_count: u32,
    #[serde(default, rename = "execs", skip_serializing_if = "is_zero")]
    pub exe_count: u32,
}

fn is_zero(value: &u32) -> bool {
    *value == 0
}

/// Process details captured by the file access monitor
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ProcessInfo {
    pub pid: i32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub cmd: String,
    #[serde(default)]
    pub cwd: String,
    #[serde(default)]
    pub root: String,
    #[serde(default, rename = "ppid")]
    pub parent_pid: i32,
}

/// File access monitor output
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct FanMonitorReport {
    #[serde(default)]
    pub monitor_pid: i32,
    #[serde(default, rename = "monitor_ppid")]
    pub monitor_parent_pid: i32,
    #[serde(default)]
    pub event_count: u32,
    #[serde(default)]
    pub main_process: Option<ProcessInfo>,
    #[serde(default)]
    pub processes: BTreeMap<String, ProcessInfo>,
    #[serde(default)]
    pub process_files: BTreeMap<String, BTreeMap<String, FileAccessInfo>>,
}

impl FanMonitorReport {
    /// Every observed path, across all processes
    pub fn observed_paths(&self) -> BTreeSet<String> {
        self.process_files
            .values()
            .flat_map(|files| files.keys().cloned())
            .collect()
    }

    /// Access flags for a path, aggregated over all processes
    pub fn access_flags(&self, path: &str) -> BTreeSet<AccessFlag> {
        let mut flags = BTreeSet::new();
        for files in self.process_files.values() {
            if let Some(info) = files.get(path) {
                if info.read_count > 0 {
                    flags.insert(AccessFlag::Read);
                }
                if info.write_count > 0 {
                    flags.insert(AccessFlag::Write);
                }
                if info.exe_count > 0 {
                    flags.insert(AccessFlag::Execute);
                }
            }
        }
        flags
    }
}

/// Per-syscall counters from the trace monitor
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct SyscallStatInfo {
    #[serde(rename = "num")]
    pub number: u32,
    pub name: String,
    pub count: u64,
}

/// Syscall trace monitor output
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct PtMonitorReport {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub arch_name: String,
    #[serde(default)]
    pub syscall_count: u64,
    #[serde(default)]
    pub syscall_num: u32,
    #[serde(default)]
    pub syscall_stats: BTreeMap<String, SyscallStatInfo>,
    #[serde(default)]
    pub fs_activity: BTreeMap<String, FsActivityInfo>,
}
