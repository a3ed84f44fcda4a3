use crate::eos::EquationOfState;
use crate::error::{AnalysisError, Result};
use crate::gridder::SpeciesGrid;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Gravitational constant in simulation units: kpc M_sun^-1 (km/s)^2.
pub const GRAVITATIONAL_CONSTANT: f64 = 4.302e-6;

/// Per-cell Toomre-Q-like stability values with an explicit validity mask.
///
/// A cell is masked exactly where the combined surface density of both
/// species is zero; downstream consumers must treat masked cells as "no
/// data", never as zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StabilityField {
    pub bins_x: usize,
    pub bins_y: usize,
    values: Vec<f64>,
    mask: Vec<bool>,
}

impl StabilityField {
    /// The stability value at a cell, or `None` where the cell is masked.
    pub fn value_at(&self, ix: usize, iy: usize) -> Option<f64> {
        let idx = iy * self.bins_x + ix;
        if self.mask[idx] {
            None
        } else {
            Some(self.values[idx])
        }
    }

    pub fn is_masked(&self, ix: usize, iy: usize) -> bool {
        self.mask[iy * self.bins_x + ix]
    }

    pub fn masked_count(&self) -> usize {
        self.mask.iter().filter(|&&m| m).count()
    }

    pub fn num_cells(&self) -> usize {
        self.values.len()
    }

    /// Raw values; entries at masked positions are meaningless.
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn mask(&self) -> &[bool] {
        &self.mask
    }
}

/// Computes the per-cell stability field from the primary (gas) grid and the
/// secondary (stars) grid.
///
/// Per cell: `sigma = gas_mass/area + weight * star_mass/area` and
/// `Q = cs(rho) * v / (pi G sigma)`, with v the cell's mean |v|/r. Cells
/// where sigma is exactly zero are masked and the sound-speed model is never
/// consulted there, so masking is independent of the equation of state.
pub fn evaluate(
    gas: &SpeciesGrid,
    stars: &SpeciesGrid,
    eos: &dyn EquationOfState,
    secondary_weight: f64,
) -> Result<StabilityField> {
    if gas.spec != stars.spec {
        return Err(AnalysisError::Config(format!(
            "species grids disagree on geometry: {}x{} vs {}x{}",
            gas.spec.bins_x, gas.spec.bins_y, stars.spec.bins_x, stars.spec.bins_y
        )));
    }
    let densities = gas.densities.as_ref().ok_or_else(|| {
        AnalysisError::Config("primary species grid was binned without densities".into())
    })?;

    let num_cells = gas.spec.num_cells();
    let inv_area = 1.0 / gas.spec.cell_area();
    let mut values = vec![0.0f64; num_cells];
    let mut mask = vec![false; num_cells];

    for idx in 0..num_cells {
        let surface_density =
            (gas.masses[idx] + secondary_weight * stars.masses[idx]) * inv_area;
        if surface_density == 0.0 {
            mask[idx] = true;
            continue;
        }
        let cs = eos.sound_speed(densities[idx])?;
        values[idx] = cs * gas.velocities[idx] / (PI * GRAVITATIONAL_CONSTANT * surface_density);
    }

    Ok(StabilityField {
        bins_x: gas.spec.bins_x,
        bins_y: gas.spec.bins_y,
        values,
        mask,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eos::{FeedbackPolytrope, Isothermal};
    use crate::gridder::{bin_species, GridRequest, GridSpec};
    use analysis_common::{Species, SpeciesData, Vec3};
    use approx::assert_relative_eq;

    fn disk_species(n: usize, with_density: bool) -> SpeciesData {
        let mut positions = Vec::with_capacity(n);
        let mut velocities = Vec::with_capacity(n);
        let mut densities = Vec::with_capacity(n);
        for i in 0..n {
            let angle = i as f64 * 0.37;
            let r = 2.0 + (i % 17) as f64;
            positions.push(Vec3::new(r * angle.cos(), r * angle.sin(), 0.05));
            velocities.push(Vec3::new(-angle.sin() * 220.0, angle.cos() * 220.0, 0.0));
            densities.push(0.5 + (i % 5) as f64 * 0.1);
        }
        let ids = (0..n as u64).collect();
        let densities = if with_density { densities } else { Vec::new() };
        SpeciesData::new(positions, velocities, densities, ids).unwrap()
    }

    fn grids() -> (SpeciesGrid, SpeciesGrid) {
        let spec = GridSpec::new(20, 20, -25.0, 25.0, -25.0, 25.0).unwrap();
        let gas = bin_species(
            &spec,
            Species::Gas,
            &disk_species(400, true),
            1.0e5,
            GridRequest { density: true, ids: false },
        )
        .unwrap();
        let stars = bin_species(
            &spec,
            Species::Stars,
            &disk_species(300, false),
            2.0e5,
            GridRequest::default(),
        )
        .unwrap();
        (gas, stars)
    }

    #[test]
    fn masking_follows_combined_surface_density() {
        let (gas, stars) = grids();
        let field = evaluate(&gas, &stars, &Isothermal::default(), 2.0 / 3.0).unwrap();

        for idx in 0..field.num_cells() {
            let empty = gas.masses[idx] == 0.0 && stars.masses[idx] == 0.0;
            let (ix, iy) = gas.spec.cell_coords(idx);
            assert_eq!(field.is_masked(ix, iy), empty);
            assert_eq!(field.value_at(ix, iy).is_none(), empty);
            if !empty {
                assert!(field.values()[idx].is_finite());
            }
        }
    }

    #[test]
    fn eos_swap_changes_values_but_not_mask() {
        let (gas, stars) = grids();
        let iso = evaluate(&gas, &stars, &Isothermal::default(), 2.0 / 3.0).unwrap();
        let poly = evaluate(&gas, &stars, &FeedbackPolytrope::default(), 2.0 / 3.0).unwrap();

        assert_eq!(iso.mask(), poly.mask());
        let differs = iso
            .values()
            .iter()
            .zip(poly.values())
            .zip(iso.mask())
            .any(|((a, b), &masked)| !masked && (a - b).abs() > 1e-12);
        assert!(differs);
    }

    #[test]
    fn single_cell_value_matches_hand_computation() {
        let spec = GridSpec::new(4, 4, -10.0, 10.0, -10.0, 10.0).unwrap();
        let gas_data = SpeciesData::new(
            vec![Vec3::new(2.5, 2.5, 0.0)],
            vec![Vec3::new(0.0, 200.0, 0.0)],
            vec![0.8],
            vec![0],
        )
        .unwrap();
        let gas = bin_species(
            &spec,
            Species::Gas,
            &gas_data,
            1.0e6,
            GridRequest { density: true, ids: false },
        )
        .unwrap();
        let stars = bin_species(
            &spec,
            Species::Stars,
            &SpeciesData::empty(),
            2.0e6,
            GridRequest::default(),
        )
        .unwrap();

        let eos = Isothermal::default();
        let field = evaluate(&gas, &stars, &eos, 2.0 / 3.0).unwrap();

        let cell = spec.cell_index(2.5, 2.5).unwrap();
        let (ix, iy) = spec.cell_coords(cell);
        let sigma = 1.0e6 / spec.cell_area();
        let r = (2.5f64 * 2.5 + 2.5 * 2.5).sqrt();
        let v = 200.0 / r;
        let cs = eos.sound_speed(0.8).unwrap();
        let expected = cs * v / (PI * GRAVITATIONAL_CONSTANT * sigma);
        assert_relative_eq!(field.value_at(ix, iy).unwrap(), expected, epsilon = 1e-12);
    }

    #[test]
    fn empty_snapshot_is_fully_masked() {
        let spec = GridSpec::new(10, 10, -10.0, 10.0, -10.0, 10.0).unwrap();
        let gas = bin_species(
            &spec,
            Species::Gas,
            &SpeciesData::empty(),
            1.0e5,
            GridRequest { density: true, ids: false },
        )
        .unwrap();
        let stars = bin_species(
            &spec,
            Species::Stars,
            &SpeciesData::empty(),
            2.0e5,
            GridRequest::default(),
        )
        .unwrap();
        let field = evaluate(&gas, &stars, &FeedbackPolytrope::default(), 2.0 / 3.0).unwrap();
        assert_eq!(field.masked_count(), field.num_cells());
    }

    #[test]
    fn mismatched_grids_are_a_config_error() {
        let (gas, _) = grids();
        let other_spec = GridSpec::new(10, 10, -25.0, 25.0, -25.0, 25.0).unwrap();
        let stars = bin_species(
            &other_spec,
            Species::Stars,
            &SpeciesData::empty(),
            2.0e5,
            GridRequest::default(),
        )
        .unwrap();
        assert!(matches!(
            evaluate(&gas, &stars, &Isothermal::default(), 2.0 / 3.0),
            Err(AnalysisError::Config(_))
        ));
    }
}
