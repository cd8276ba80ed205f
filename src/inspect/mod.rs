//! File inspection: ELF classification, shared-library dependency
//! resolution and data type sniffing.

/// ELF header classification
pub mod binfile;

/// Shared-library dependency closure
pub mod sodeps;

/// `file` command data type sniffing
pub mod filetype;

pub use binfile::{BinKind, BinProps};
pub use sodeps::{DependencyResolver, LddResolver};
