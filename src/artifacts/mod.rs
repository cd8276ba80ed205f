//! Artifact engine: decides which filesystem paths a container needs and
//! mirrors them into the artifacts directory.
//!
//! The [`processor::Processor`] drives a run. It closes the observed path set
//! over symlinks, hands it to an [`store::ArtifactStore`] which classifies,
//! resolves shared-library dependencies, deduplicates, copies and finally
//! writes the container report.

/// Glob exclude patterns
pub mod matcher;

/// Directory traversal with exclude pruning
pub mod walker;

/// Symlink closure and root backfill
pub mod symlinks;

/// Hardlink group deduplication
pub mod dedup;

/// Low level copy and access helpers
pub mod fsutil;

/// Language runtime detection
pub mod app_stack;

/// Metadata file obfuscation and binary patching
pub mod obfuscate;

pub mod store;
pub mod save;
pub mod postprocess;
pub mod extras;
pub mod processor;

pub use matcher::PathMatcher;
pub use processor::Processor;
pub use save::CopyContext;
pub use store::{ArtifactStore, StoreEnv, StorePhase};
pub use symlinks::{SymlinkCloser, SymlinkClosure};
