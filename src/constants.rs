//! Global constants for the artifact sensor.
//!
//! Layout names of the artifacts directory, pseudo-filesystem roots and
//! the bounds used by the closure algorithms live here so the store,
//! processor and report code agree on them.

// Buffer sizes
/// Default buffer size for hashing and copying (1MB)
pub const DEFAULT_BUFFER_SIZE: usize = 1024 * 1024;

// Pseudo filesystems that are never walked or copied
pub const PROC_PATH: &str = "/proc";
pub const SYS_PATH: &str = "/sys";
pub const DEV_PATH: &str = "/dev";

/// Roots skipped by every walk and copy pass
pub const FILTERED_PATHS: &[&str] = &[PROC_PATH, SYS_PATH, DEV_PATH];

// Artifacts directory layout
/// Default artifacts directory inside the instrumented container
pub const DEFAULT_ARTIFACTS_DIR: &str = "/opt/_slim/artifacts";

/// Sensor-owned directory that must never end up in the output tree
pub const SENSOR_ROOT_DIR: &str = "/opt/_slim";

/// Mirrored file tree under the artifacts directory
pub const FILES_DIR_NAME: &str = "files";

/// Archive of the mirrored file tree
pub const FILES_ARCHIVE_NAME: &str = "files.tar";

/// Archive of everything else in the artifacts directory
pub const RUN_ARCHIVE_NAME: &str = "run.tar";

/// Snapshot of preserved paths taken before the application runs
pub const PRESERVED_DIR_NAME: &str = "preserved";

/// Structured report written at the end of a run
pub const CONTAINER_REPORT_FILE_NAME: &str = "creport.json";

/// Raw monitor event log, streamed out of band
pub const MONITOR_EVENT_LOG_FILE_NAME: &str = "mondel.ndjson";

// External tools
/// Dependency listing tool
pub const DEP_RESOLVER_EXE_NAME: &str = "ldd";

/// Data type sniffing tool
pub const FILE_TYPE_EXE_NAME: &str = "file";

// Closure bounds
/// Maximum dependency resolution rounds
pub const MAX_DEP_RESOLVE_ROUNDS: usize = 6;

/// Default cap on symlink fixpoint rounds
pub const DEFAULT_SYMLINK_FIXPOINT_ROUNDS: usize = 8;

/// Symlinks followed while resolving one path inside the output tree
pub const MAX_OUTPUT_LINK_HOPS: usize = 40;

// Well-known files
pub const PASSWD_FILE_PATH: &str = "/etc/passwd";
pub const TMP_DIR_PATH: &str = "/tmp";
pub const RUN_DIR_PATH: &str = "/run";

/// Mode for the recreated /tmp (sticky, world writable)
pub const TMP_DIR_MODE: u32 = 0o1777;

/// Mode for the recreated /run
pub const RUN_DIR_MODE: u32 = 0o755;

/// Shells considered by the shell include toggle, first found wins
pub const SHELL_NAMES: &[&str] = &["bash", "sh", "ash", "dash"];

/// Basic commands added alongside the shell
pub const SHELL_COMMANDS: &[&str] = &["ls", "cat", "env", "ps", "grep", "which"];
