use analysis_common::Species;
use thiserror::Error;

/// Error taxonomy for the per-snapshot analysis pipeline.
///
/// Configuration and domain errors are fatal for the snapshot being
/// processed; fit non-convergence is recoverable and recorded alongside the
/// rest of the snapshot's results. Empty cells and empty shells are *not*
/// errors (they are represented by zeros and masks), with one exception: a
/// Poisson uncertainty cannot be formed from an empty shell, and that is
/// surfaced rather than silently masked.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("invalid grid configuration: {0}")]
    Config(String),

    #[error("particle {index} of species '{species}' sits at the origin; |v|/r is undefined")]
    ZeroRadiusParticle { species: Species, index: usize },

    #[error("negative density {density} passed to the {model} equation of state")]
    NegativeDensity { model: &'static str, density: f64 },

    #[error(
        "no '{species}' particles in shell [{:.3}, {:.3}]; Poisson uncertainty is undefined",
        .radius - .half_width,
        .radius + .half_width
    )]
    EmptyShell {
        species: Species,
        radius: f64,
        half_width: f64,
    },

    #[error("profile fit did not converge after {iterations} iterations (cost {cost:.3e})")]
    FitDidNotConverge { iterations: usize, cost: f64 },
}

pub type Result<T> = std::result::Result<T, AnalysisError>;
