use crate::fiducial::{FiducialMeasurement, RadialCounts, RadialSeries};
use crate::gridder::SpeciesGrid;
use crate::profiles::ProfileFit;
use crate::stability::StabilityField;
use serde::{Deserialize, Serialize};

/// Outcome of one profile fit. Non-convergence is recorded, never replaced
/// by a default scale that would look like valid data.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum FitOutcome {
    Converged(ProfileFit),
    Failed { reason: String },
}

impl FitOutcome {
    pub fn converged(&self) -> Option<&ProfileFit> {
        match self {
            FitOutcome::Converged(fit) => Some(fit),
            FitOutcome::Failed { .. } => None,
        }
    }
}

/// A snapshot-level failure, kept in the run record so a hole in the time
/// series is visibly a failure and not a zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub index: usize,
    pub error: String,
}

/// The persisted output of a whole run: completed snapshot results in time
/// order plus the failures encountered along the way.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub results: Vec<SnapshotResult>,
    pub failures: Vec<FailureRecord>,
}

/// Everything the pipeline derives from one snapshot. Constructed once and
/// handed to the driver by value; immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotResult {
    /// Position of the snapshot in the run's time ordering.
    pub index: usize,
    /// Simulation time of the snapshot.
    pub time: f64,
    pub gas_grid: SpeciesGrid,
    pub star_grid: SpeciesGrid,
    pub stability: StabilityField,
    /// Gas surface density per cell, M_sun / kpc^2, for the map consumers.
    pub surface_density_map: Vec<f64>,
    pub fiducial: FiducialMeasurement,
    pub stability_profile: RadialSeries,
    pub surface_density_profile: RadialSeries,
    pub radial_counts: RadialCounts,
    pub radial_fit: FitOutcome,
    pub vertical_fit: FitOutcome,
}
