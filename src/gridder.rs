use crate::error::{AnalysisError, Result};
use analysis_common::{Species, SpeciesData};
use log::debug;
use serde::{Deserialize, Serialize};

/// Geometry of the analysis grid: a fixed `bins_x x bins_y` rectangular
/// lattice over a caller-chosen bounding box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridSpec {
    pub bins_x: usize,
    pub bins_y: usize,
    pub xmin: f64,
    pub xmax: f64,
    pub ymin: f64,
    pub ymax: f64,
}

impl GridSpec {
    /// Validates the bounding box and resolution once, up front. A malformed
    /// box is a configuration error, never a per-particle one.
    pub fn new(
        bins_x: usize,
        bins_y: usize,
        xmin: f64,
        xmax: f64,
        ymin: f64,
        ymax: f64,
    ) -> Result<Self> {
        if bins_x == 0 || bins_y == 0 {
            return Err(AnalysisError::Config(format!(
                "grid resolution must be positive, got {}x{}",
                bins_x, bins_y
            )));
        }
        if xmax <= xmin || ymax <= ymin {
            return Err(AnalysisError::Config(format!(
                "degenerate bounding box [{}, {}] x [{}, {}]",
                xmin, xmax, ymin, ymax
            )));
        }
        Ok(Self {
            bins_x,
            bins_y,
            xmin,
            xmax,
            ymin,
            ymax,
        })
    }

    /// Derives the resolution from a target element size, as the original
    /// smoothing-length convention does.
    pub fn from_element_size(
        element_size: f64,
        xmin: f64,
        xmax: f64,
        ymin: f64,
        ymax: f64,
    ) -> Result<Self> {
        if element_size <= 0.0 {
            return Err(AnalysisError::Config(format!(
                "element size must be positive, got {}",
                element_size
            )));
        }
        let bins_x = ((xmax - xmin) / element_size).floor() as usize;
        let bins_y = ((ymax - ymin) / element_size).floor() as usize;
        Self::new(bins_x, bins_y, xmin, xmax, ymin, ymax)
    }

    #[inline(always)]
    pub fn cell_width_x(&self) -> f64 {
        (self.xmax - self.xmin) / self.bins_x as f64
    }

    #[inline(always)]
    pub fn cell_width_y(&self) -> f64 {
        (self.ymax - self.ymin) / self.bins_y as f64
    }

    /// Projected area of one cell.
    #[inline(always)]
    pub fn cell_area(&self) -> f64 {
        self.cell_width_x() * self.cell_width_y()
    }

    pub fn num_cells(&self) -> usize {
        self.bins_x * self.bins_y
    }

    /// Maps a position to its flat cell index, or `None` if the particle
    /// falls outside the bounding box. Edge loss is expected and benign;
    /// bounding boxes rarely cover the whole simulation volume.
    #[inline(always)]
    pub fn cell_index(&self, x: f64, y: f64) -> Option<usize> {
        let ix = ((x - self.xmin) / self.cell_width_x()).floor();
        let iy = ((y - self.ymin) / self.cell_width_y()).floor();
        if ix < 0.0 || iy < 0.0 {
            return None;
        }
        let (ix, iy) = (ix as usize, iy as usize);
        if ix >= self.bins_x || iy >= self.bins_y {
            return None;
        }
        Some(iy * self.bins_x + ix)
    }

    /// The (ix, iy) pair for a flat index.
    #[inline(always)]
    pub fn cell_coords(&self, idx: usize) -> (usize, usize) {
        (idx % self.bins_x, idx / self.bins_x)
    }
}

/// Selects which optional per-cell fields the aggregation collects. One
/// parameterized binning pass serves every species; there are no duplicated
/// hydro/non-hydro code paths.
#[derive(Debug, Clone, Copy, Default)]
pub struct GridRequest {
    /// Accumulate per-cell mean density (hydrodynamic species).
    pub density: bool,
    /// Collect per-cell particle id lists (slow).
    pub ids: bool,
}

/// Per-cell aggregates for one species over one snapshot.
///
/// Every cell holds finite, well-defined values: a cell no particle landed in
/// reports exactly zero mass, velocity and density.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeciesGrid {
    pub spec: GridSpec,
    pub species: Species,
    /// Shared per-particle mass for this species, M_sun.
    pub reference_mass: f64,
    /// Particles binned into each cell.
    pub counts: Vec<u32>,
    /// `count x reference_mass` per cell.
    pub masses: Vec<f64>,
    /// Mean |v|/r per cell (zero for empty cells).
    pub velocities: Vec<f64>,
    /// Mean density per cell; present only when requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub densities: Option<Vec<f64>>,
    /// Particle ids per cell; present only when requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cell_ids: Option<Vec<Vec<u64>>>,
}

impl SpeciesGrid {
    /// Number of particles that landed inside the bounding box.
    pub fn total_count(&self) -> u64 {
        self.counts.iter().map(|&c| c as u64).sum()
    }

    /// Total binned mass.
    pub fn total_mass(&self) -> f64 {
        self.masses.iter().sum()
    }

    #[inline(always)]
    pub fn mass_at(&self, ix: usize, iy: usize) -> f64 {
        self.masses[iy * self.spec.bins_x + ix]
    }

    #[inline(always)]
    pub fn count_at(&self, ix: usize, iy: usize) -> u32 {
        self.counts[iy * self.spec.bins_x + ix]
    }

    /// Per-cell surface density, mass over projected cell area.
    pub fn surface_densities(&self) -> Vec<f64> {
        let inv_area = 1.0 / self.spec.cell_area();
        self.masses.iter().map(|m| m * inv_area).collect()
    }
}

/// Bins one species' particles onto the grid, accumulating count, mean
/// |v|/r, total mass, and optionally mean density and id lists per cell.
///
/// Particles outside the bounding box are discarded silently. A particle at
/// the exact origin is a domain error: |v|/r is undefined there and no
/// physical simulation particle should sit at the exact center.
pub fn bin_species(
    spec: &GridSpec,
    species: Species,
    data: &SpeciesData,
    reference_mass: f64,
    request: GridRequest,
) -> Result<SpeciesGrid> {
    let num_cells = spec.num_cells();
    let mut counts = vec![0u32; num_cells];
    let mut vel_sums = vec![0.0f64; num_cells];
    let mut density_sums = if request.density {
        Some(vec![0.0f64; num_cells])
    } else {
        None
    };
    let mut cell_ids = if request.ids {
        Some(vec![Vec::new(); num_cells])
    } else {
        None
    };

    let positions = data.positions();
    let velocities = data.velocities();
    let densities = data.densities();
    let ids = data.ids();

    let mut discarded = 0usize;
    for (i, pos) in positions.iter().enumerate() {
        let Some(cell) = spec.cell_index(pos.x, pos.y) else {
            discarded += 1;
            continue;
        };

        let r = pos.length();
        if r == 0.0 {
            return Err(AnalysisError::ZeroRadiusParticle { species, index: i });
        }

        counts[cell] += 1;
        vel_sums[cell] += velocities[i].length() / r;
        if let Some(sums) = density_sums.as_mut() {
            sums[cell] += densities.get(i).copied().unwrap_or(0.0);
        }
        if let Some(lists) = cell_ids.as_mut() {
            lists[cell].push(ids[i]);
        }
    }

    if discarded > 0 {
        debug!(
            "{} of {} '{}' particles fell outside the grid bounding box",
            discarded,
            positions.len(),
            species
        );
    }

    // Finalize: mass from counts, then means. The divisor substitutes 1 for
    // empty cells purely to avoid dividing by zero; the stored count stays 0
    // and the sums are 0 there, so empty cells report exact zeros.
    let masses: Vec<f64> = counts
        .iter()
        .map(|&c| c as f64 * reference_mass)
        .collect();
    let velocities_mean: Vec<f64> = vel_sums
        .iter()
        .zip(counts.iter())
        .map(|(&sum, &c)| sum / c.max(1) as f64)
        .collect();
    let densities_mean = density_sums.map(|sums| {
        sums.iter()
            .zip(counts.iter())
            .map(|(&sum, &c)| sum / c.max(1) as f64)
            .collect()
    });

    Ok(SpeciesGrid {
        spec: *spec,
        species,
        reference_mass,
        counts,
        masses,
        velocities: velocities_mean,
        densities: densities_mean,
        cell_ids,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use analysis_common::Vec3;
    use approx::assert_relative_eq;

    fn species_from_particles(particles: &[(Vec3, Vec3, f64)]) -> SpeciesData {
        let positions = particles.iter().map(|p| p.0).collect();
        let velocities = particles.iter().map(|p| p.1).collect();
        let densities = particles.iter().map(|p| p.2).collect();
        let ids = (0..particles.len() as u64).collect();
        SpeciesData::new(positions, velocities, densities, ids).unwrap()
    }

    fn default_spec() -> GridSpec {
        GridSpec::new(40, 40, -100.0, 100.0, -100.0, 100.0).unwrap()
    }

    #[test]
    fn degenerate_spec_is_rejected() {
        assert!(GridSpec::new(0, 40, -100.0, 100.0, -100.0, 100.0).is_err());
        assert!(GridSpec::new(40, 40, 100.0, -100.0, -100.0, 100.0).is_err());
        assert!(GridSpec::from_element_size(0.0, -100.0, 100.0, -100.0, 100.0).is_err());
    }

    #[test]
    fn element_size_matches_explicit_resolution() {
        let spec = GridSpec::from_element_size(5.0, -100.0, 100.0, -100.0, 100.0).unwrap();
        assert_eq!((spec.bins_x, spec.bins_y), (40, 40));
        assert_relative_eq!(spec.cell_area(), 25.0);
    }

    #[test]
    fn particle_maps_to_expected_cell() {
        // (50, 50) over [-100, 100]^2 at 40x40 resolution lands in (30, 30):
        // floor((50 + 100) / 5) = 30 on both axes.
        let spec = default_spec();
        let idx = spec.cell_index(50.0, 50.0).unwrap();
        assert_eq!(spec.cell_coords(idx), (30, 30));
        // Outside the box: discarded.
        assert!(spec.cell_index(150.0, 0.0).is_none());
        assert!(spec.cell_index(-100.1, 0.0).is_none());
    }

    #[test]
    fn binning_accumulates_mass_and_velocity() {
        let spec = default_spec();
        let data = species_from_particles(&[
            (Vec3::new(50.0, 50.0, 0.0), Vec3::new(0.0, 141.4, 0.0), 2.0),
            (Vec3::new(51.0, 51.0, 0.0), Vec3::new(141.4, 0.0, 0.0), 4.0),
            (Vec3::new(150.0, 0.0, 0.0), Vec3::new(1.0, 0.0, 0.0), 1.0),
        ]);
        let grid = bin_species(
            &spec,
            Species::Gas,
            &data,
            1.0e5,
            GridRequest { density: true, ids: true },
        )
        .unwrap();

        // The out-of-box particle is discarded, the other two share a cell.
        assert_eq!(grid.total_count(), 2);
        assert_relative_eq!(grid.total_mass(), 2.0e5);
        assert_eq!(grid.count_at(30, 30), 2);
        assert_relative_eq!(grid.mass_at(30, 30), 2.0e5);

        let cell = spec.cell_index(50.0, 50.0).unwrap();
        let r0 = (50.0f64 * 50.0 + 50.0 * 50.0).sqrt();
        let r1 = (51.0f64 * 51.0 + 51.0 * 51.0).sqrt();
        let expected_vel = (141.4 / r0 + 141.4 / r1) / 2.0;
        assert_relative_eq!(grid.velocities[cell], expected_vel, epsilon = 1e-12);
        assert_relative_eq!(grid.densities.as_ref().unwrap()[cell], 3.0);
        assert_eq!(grid.cell_ids.as_ref().unwrap()[cell], vec![0, 1]);
    }

    #[test]
    fn empty_cells_report_exact_zeros() {
        let spec = default_spec();
        let data = species_from_particles(&[(
            Vec3::new(10.0, 10.0, 0.0),
            Vec3::new(0.0, 100.0, 0.0),
            1.0,
        )]);
        let grid = bin_species(
            &spec,
            Species::Gas,
            &data,
            1.0e5,
            GridRequest { density: true, ids: false },
        )
        .unwrap();

        for idx in 0..spec.num_cells() {
            if grid.counts[idx] == 0 {
                assert_eq!(grid.masses[idx], 0.0);
                assert_eq!(grid.velocities[idx], 0.0);
                assert_eq!(grid.densities.as_ref().unwrap()[idx], 0.0);
                assert!(grid.velocities[idx].is_finite());
            }
        }
    }

    #[test]
    fn empty_species_yields_all_zero_grid() {
        let spec = default_spec();
        let grid = bin_species(
            &spec,
            Species::Stars,
            &SpeciesData::empty(),
            2.0e5,
            GridRequest::default(),
        )
        .unwrap();
        assert_eq!(grid.total_count(), 0);
        assert_relative_eq!(grid.total_mass(), 0.0);
        assert!(grid.masses.iter().all(|&m| m == 0.0));
        assert!(grid.velocities.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn cell_masses_are_multiples_of_reference_mass() {
        let spec = GridSpec::new(8, 8, -20.0, 20.0, -20.0, 20.0).unwrap();
        let particles: Vec<(Vec3, Vec3, f64)> = (0..200)
            .map(|i| {
                let angle = i as f64 * 0.173;
                let r = 1.0 + (i % 23) as f64;
                (
                    Vec3::new(r * angle.cos(), r * angle.sin(), 0.1),
                    Vec3::new(-angle.sin() * 200.0, angle.cos() * 200.0, 0.0),
                    1.0,
                )
            })
            .collect();
        let data = species_from_particles(&particles);
        let reference_mass = 3.0e4;
        let grid = bin_species(&spec, Species::Gas, &data, reference_mass, GridRequest::default())
            .unwrap();

        for (idx, &mass) in grid.masses.iter().enumerate() {
            let multiple = mass / reference_mass;
            assert_relative_eq!(multiple, grid.counts[idx] as f64, epsilon = 1e-9);
        }
        assert!(grid.total_count() <= particles.len() as u64);
    }

    #[test]
    fn particle_at_origin_is_a_domain_error() {
        let spec = default_spec();
        let data = species_from_particles(&[(Vec3::zero(), Vec3::new(1.0, 0.0, 0.0), 1.0)]);
        let err = bin_species(&spec, Species::Gas, &data, 1.0e5, GridRequest::default())
            .unwrap_err();
        assert!(matches!(
            err,
            AnalysisError::ZeroRadiusParticle { species: Species::Gas, index: 0 }
        ));
    }
}
