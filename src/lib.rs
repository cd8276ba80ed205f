//! # artifact-sensor
//!
//! The artifact engine of a container minification sensor, written in Rust.
//!
//! ## Overview
//!
//! While an application runs inside a container, monitors record every file it
//! touches. After the run, the sensor turns those observations into the
//! minimal set of filesystem paths the application needs:
//!
//! - close the observed set over symlinks and shared-library dependencies,
//! - drop duplicate hardlink names,
//! - mirror the retained paths into `files/` under the artifacts directory,
//!   applying include, exclude, permission and preserve policies,
//! - write `creport.json` describing every retained path.
//!
//! ## Usage
//!
//! ```no_run
//! use artifact_sensor::artifacts::Processor;
//! use artifact_sensor::config::{ArtifactRules, StartCommand};
//! use artifact_sensor::inspect::LddResolver;
//! use artifact_sensor::report::MonitorReports;
//! use std::path::Path;
//!
//! # fn main() -> anyhow::Result<()> {
//! let cmd = StartCommand::from_file(Path::new("/opt/_slim/commands.json"))?;
//! let monitors = MonitorReports::from_files(Path::new("/tmp/fan.json"), None)?;
//!
//! let processor = Processor::new(Path::new("/opt/_slim/artifacts"), Vec::new());
//! processor.prepare_env(&cmd)?;
//! let report = processor.process(
//!     &cmd,
//!     Path::new("/"),
//!     &monitors,
//!     &ArtifactRules::default(),
//!     &LddResolver::new(),
//! )?;
//!
//! println!("Retained {} artifacts", report.image.files.len());
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Organization
//!
//! - [`cli`]: Command-line interface definitions and argument parsing
//! - [`models`]: Artifact properties and monitor report models
//! - [`config`]: Start command policy and engine lookup tables
//! - [`inspect`]: ELF classification, dependency resolution, data type sniffing
//! - [`artifacts`]: Symlink closure, dedup, the artifact store and processor
//! - [`report`]: Output enumeration and the container report
//! - [`utils`]: Hashing, path helpers and tar archives
//! - [`error`]: Typed component errors
//! - [`constants`]: Application-wide constants

/// Command-line interface definitions and argument parsing
pub mod cli;

/// Core data models and structures used throughout the application
pub mod models;

/// Start command and lookup table configuration
pub mod config;

/// File inspection helpers
pub mod inspect;

/// The artifact engine
pub mod artifacts;

/// Container report
pub mod report;

/// Utility functions for hashing, paths and archives
pub mod utils;

/// Typed component errors
pub mod error;

/// Application constants and configuration values
pub mod constants;

/// Test utilities and helpers
#[cfg(test)]
pub mod test_utils;
