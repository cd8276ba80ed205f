// Policy and lookup-table configuration
mod command;
mod rules;

// Re-export the start command types
pub use command::{
    AccessInfo,
    PathPolicy,
    StartCommand,
};

// Re-export the engine lookup tables
pub use rules::{
    ArtifactRules,
    BinaryPatchRule,
};
