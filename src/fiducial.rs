use crate::eos::EquationOfState;
use crate::error::{AnalysisError, Result};
use crate::stability::GRAVITATIONAL_CONSTANT;
use analysis_common::{SnapshotData, Species, SpeciesData};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::f64::consts::PI;

/// Scalar diagnostics evaluated over a thin annular shell `[R-dR, R+dR]`
/// around one reference radius.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FiducialMeasurement {
    pub radius: f64,
    pub half_width: f64,
    /// Surface density per species, M_sun / kpc^2.
    pub surface_densities: BTreeMap<Species, f64>,
    /// One-sigma Poisson uncertainties, present when requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uncertainties: Option<BTreeMap<Species, f64>>,
    /// Shell-averaged stability value; `None` when no tracer particle falls
    /// in the shell (no data, not zero).
    pub stability: Option<f64>,
}

/// An ordered sequence of (radius, value) samples covering radius 0 to a
/// caller-specified maximum in fixed steps. A `None` value marks a shell
/// with no data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RadialSeries {
    /// Shell full width (the fixed radial step).
    pub step: f64,
    pub points: Vec<(f64, Option<f64>)>,
}

impl RadialSeries {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Histogram of particle counts per radial bin `[k*w, (k+1)*w)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RadialCounts {
    pub bin_width: f64,
    pub counts: Vec<u64>,
}

/// Aggregates over the particles whose 3D radius falls within a shell.
struct ShellStats {
    count: usize,
    mean_speed_over_radius: f64,
    mean_density: f64,
}

fn shell_stats(
    species: Species,
    data: &SpeciesData,
    radius: f64,
    half_width: f64,
) -> Result<ShellStats> {
    let lo = radius - half_width;
    let hi = radius + half_width;

    let mut count = 0usize;
    let mut vel_sum = 0.0f64;
    let mut density_sum = 0.0f64;
    let densities = data.densities();

    for (i, pos) in data.positions().iter().enumerate() {
        let r = pos.length();
        if r < lo || r > hi {
            continue;
        }
        if r == 0.0 {
            return Err(AnalysisError::ZeroRadiusParticle { species, index: i });
        }
        count += 1;
        vel_sum += data.velocities()[i].length() / r;
        density_sum += densities.get(i).copied().unwrap_or(0.0);
    }

    let divisor = count.max(1) as f64;
    Ok(ShellStats {
        count,
        mean_speed_over_radius: vel_sum / divisor,
        mean_density: density_sum / divisor,
    })
}

/// Area of a thin annulus of half-width dR at radius R. The shell spans
/// `[R-dR, R+dR]`, a full width of 2dR, hence 4 pi R dR.
#[inline(always)]
fn annulus_area(radius: f64, half_width: f64) -> f64 {
    4.0 * PI * radius * half_width
}

/// Measures per-species surface density and a shell-averaged stability value
/// at one reference radius.
///
/// The Poisson uncertainty `sigma / sqrt(count)` is undefined for an empty
/// shell; when uncertainties are requested that condition is surfaced as an
/// error rather than smuggled out as NaN.
pub fn measure(
    snapshot: &SnapshotData,
    radius: f64,
    half_width: f64,
    eos: &dyn EquationOfState,
    secondary_weight: f64,
    with_uncertainty: bool,
) -> Result<FiducialMeasurement> {
    if radius <= 0.0 || half_width <= 0.0 {
        return Err(AnalysisError::Config(format!(
            "fiducial radius ({}) and half-width ({}) must be positive",
            radius, half_width
        )));
    }

    let area = annulus_area(radius, half_width);
    let mut surface_densities = BTreeMap::new();
    let mut uncertainties = if with_uncertainty {
        Some(BTreeMap::new())
    } else {
        None
    };

    let mut sigma_total = 0.0f64;
    let mut gas_stats: Option<ShellStats> = None;

    for species in snapshot.species_present() {
        let Some(data) = snapshot.species(species) else {
            continue;
        };
        let reference_mass = snapshot
            .header
            .reference_mass(species)
            .map_err(|e| AnalysisError::Config(e.to_string()))?;

        let stats = shell_stats(species, data, radius, half_width)?;
        let sigma = stats.count as f64 * reference_mass / area;
        surface_densities.insert(species, sigma);

        if let Some(map) = uncertainties.as_mut() {
            if stats.count == 0 {
                return Err(AnalysisError::EmptyShell {
                    species,
                    radius,
                    half_width,
                });
            }
            map.insert(species, sigma / (stats.count as f64).sqrt());
        }

        sigma_total += if species.is_hydro() {
            sigma
        } else {
            secondary_weight * sigma
        };
        if species.is_hydro() {
            gas_stats = Some(stats);
        }
    }

    // Shell-averaged analogue of the per-cell Q: sound speed from the mean
    // density, kinematics from the mean |v|/r.
    let stability = match gas_stats {
        Some(stats) if stats.count > 0 && sigma_total > 0.0 => {
            let cs = eos.sound_speed(stats.mean_density)?;
            Some(cs * stats.mean_speed_over_radius / (PI * GRAVITATIONAL_CONSTANT * sigma_total))
        }
        _ => None,
    };

    Ok(FiducialMeasurement {
        radius,
        half_width,
        surface_densities,
        uncertainties,
        stability,
    })
}

/// Shell radii tiling `[0, r_max]`: centers at dR, 3dR, 5dR, ...
fn shell_centers(half_width: f64, r_max: f64) -> Vec<f64> {
    let step = 2.0 * half_width;
    let mut centers = Vec::new();
    let mut center = half_width;
    while center + half_width <= r_max {
        centers.push(center);
        center += step;
    }
    centers
}

/// Stability value as a function of radius, sampled over contiguous shells.
pub fn stability_series(
    snapshot: &SnapshotData,
    half_width: f64,
    r_max: f64,
    eos: &dyn EquationOfState,
    secondary_weight: f64,
) -> Result<RadialSeries> {
    let mut points = Vec::new();
    for center in shell_centers(half_width, r_max) {
        let m = measure(snapshot, center, half_width, eos, secondary_weight, false)?;
        points.push((center, m.stability));
    }
    Ok(RadialSeries {
        step: 2.0 * half_width,
        points,
    })
}

/// Surface density of one species as a function of radius.
pub fn surface_density_series(
    snapshot: &SnapshotData,
    species: Species,
    half_width: f64,
    r_max: f64,
) -> Result<RadialSeries> {
    let data = snapshot.species(species).ok_or_else(|| {
        AnalysisError::Config(format!("species '{}' absent from snapshot", species))
    })?;
    let reference_mass = snapshot
        .header
        .reference_mass(species)
        .map_err(|e| AnalysisError::Config(e.to_string()))?;

    let mut points = Vec::new();
    for center in shell_centers(half_width, r_max) {
        let stats = shell_stats(species, data, center, half_width)?;
        let sigma = stats.count as f64 * reference_mass / annulus_area(center, half_width);
        points.push((center, Some(sigma)));
    }
    Ok(RadialSeries {
        step: 2.0 * half_width,
        points,
    })
}

/// Counts particles per radial bin out to `r_max`.
pub fn radial_counts(data: &SpeciesData, bin_width: f64, r_max: f64) -> Result<RadialCounts> {
    if bin_width <= 0.0 || r_max <= 0.0 {
        return Err(AnalysisError::Config(format!(
            "bin width ({}) and r_max ({}) must be positive",
            bin_width, r_max
        )));
    }
    let num_bins = (r_max / bin_width).ceil() as usize;
    let mut counts = vec![0u64; num_bins];
    for pos in data.positions() {
        let bin = (pos.length() / bin_width).floor() as usize;
        if bin < num_bins {
            counts[bin] += 1;
        }
    }
    Ok(RadialCounts { bin_width, counts })
}
