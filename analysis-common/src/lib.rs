pub mod config;
pub mod snapshot;
pub mod vecmath;

// Re-export key types for easier use by dependent crates
pub use config::{
    AnalysisConfig, EosChoice, FeedbackParams, FiducialConfig, GridConfig, InputConfig,
    OutputConfig, ProfilesConfig, StabilityConfig,
};
pub use snapshot::{SnapshotData, SnapshotHeader, Species, SpeciesData};
pub use vecmath::Vec3;
