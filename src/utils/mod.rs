//! Utility functions shared by the store, processor and report code.
//!
//! ## Components
//!
//! - **Hashing**: SHA-256 calculation for artifact properties
//! - **Paths**: lexical path cleaning, link target resolution and `PATH` lookup
//! - **Archive**: tar archives of the artifacts directory
//!
//! ### Generating File Hashes
//!
//! ```no_run
//! use artifact_sensor::utils::hash::calculate_sha256;
//! use std::path::Path;
//!
//! # fn example() -> anyhow::Result<()> {
//! let hash = calculate_sha256(Path::new("/usr/bin/env"))?;
//! println!("SHA-256: {}", hash);
//! # Ok(())
//! # }
//! ```

/// Cryptographic hash calculation utilities
pub mod hash;

/// Path manipulation helpers
pub mod paths;

/// Tar archive creation
pub mod archive;
