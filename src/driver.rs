use crate::eos::build_eos;
use crate::error::AnalysisError;
use crate::fiducial;
use crate::gridder::{bin_species, GridRequest, GridSpec};
use crate::profiles::{self, ProfileFit};
use crate::results::{FitOutcome, SnapshotResult};
use crate::stability;
use analysis_common::{AnalysisConfig, SnapshotData, Species, SpeciesData};
use anyhow::Result;
use log::{debug, error, info};
use rayon::prelude::*;
use std::time::Instant;

/// Hard ceiling on concurrent snapshot workers. Each worker holds a full
/// snapshot's particle arrays, so more parallelism than this trades speed
/// for memory pressure.
pub const MAX_WORKERS: usize = 8;

/// Terminal state of one snapshot's pipeline. A failed snapshot stays in the
/// run record; it is never dropped or replaced by defaults.
#[derive(Debug)]
pub enum SnapshotOutcome {
    Completed(Box<SnapshotResult>),
    Failed { index: usize, error: AnalysisError },
}

impl SnapshotOutcome {
    pub fn result(&self) -> Option<&SnapshotResult> {
        match self {
            SnapshotOutcome::Completed(r) => Some(r),
            SnapshotOutcome::Failed { .. } => None,
        }
    }
}

/// Maps fit non-convergence into a recorded outcome while letting every
/// other error class escalate to snapshot failure.
fn fit_outcome(
    result: Result<ProfileFit, AnalysisError>,
) -> Result<FitOutcome, AnalysisError> {
    match result {
        Ok(fit) => Ok(FitOutcome::Converged(fit)),
        Err(e @ AnalysisError::FitDidNotConverge { .. }) => Ok(FitOutcome::Failed {
            reason: e.to_string(),
        }),
        Err(e) => Err(e),
    }
}

/// Runs the full sequential pipeline for a single snapshot:
/// grid aggregation -> stability evaluation -> fiducial extraction ->
/// radial series -> profile fits.
pub fn analyze_snapshot(
    index: usize,
    snapshot: &SnapshotData,
    config: &AnalysisConfig,
) -> Result<SnapshotResult, AnalysisError> {
    let spec = GridSpec::from_element_size(
        config.grid.element_size,
        config.grid.xmin,
        config.grid.xmax,
        config.grid.ymin,
        config.grid.ymax,
    )?;

    let empty = SpeciesData::empty();
    let gas = snapshot.species(Species::Gas).unwrap_or(&empty);
    let stars = snapshot.species(Species::Stars).unwrap_or(&empty);
    // A species absent from the snapshot contributes an all-zero grid; its
    // reference mass is irrelevant then.
    let gas_mass = snapshot.header.reference_mass(Species::Gas).unwrap_or(0.0);
    let star_mass = snapshot.header.reference_mass(Species::Stars).unwrap_or(0.0);

    let gas_grid = bin_species(
        &spec,
        Species::Gas,
        gas,
        gas_mass,
        GridRequest {
            density: true,
            ids: config.grid.collect_ids,
        },
    )?;
    let star_grid = bin_species(
        &spec,
        Species::Stars,
        stars,
        star_mass,
        GridRequest {
            density: false,
            ids: config.grid.collect_ids,
        },
    )?;

    let eos = build_eos(&config.stability);
    let weight = config.stability.secondary_weight;
    let field = stability::evaluate(&gas_grid, &star_grid, eos.as_ref(), weight)?;

    let fid = &config.fiducial;
    let fiducial_measurement = fiducial::measure(
        snapshot,
        fid.radius,
        fid.half_width,
        eos.as_ref(),
        weight,
        fid.with_uncertainty,
    )?;

    let r_max = config.profile_r_max();
    let stability_profile =
        fiducial::stability_series(snapshot, fid.half_width, r_max, eos.as_ref(), weight)?;
    let surface_density_profile =
        fiducial::surface_density_series(snapshot, Species::Gas, fid.half_width, r_max)?;
    let radial_counts = fiducial::radial_counts(gas, config.profiles.bin_width, r_max)?;

    let gas_radii: Vec<f64> = gas.positions().iter().map(|p| p.length()).collect();
    let gas_z: Vec<f64> = gas.positions().iter().map(|p| p.z).collect();
    let radial_fit = fit_outcome(profiles::fit_radial_profile(
        &gas_radii,
        config.profiles.bin_width,
        r_max,
    ))?;
    let vertical_fit = fit_outcome(profiles::fit_vertical_profile(
        &gas_z,
        config.profiles.vertical_bin_width,
        config.profiles.z_max,
    ))?;

    debug!(
        "snapshot {} (t = {:.4}): {} gas / {} star particles binned, {} cells masked ({} eos)",
        index,
        snapshot.header.time,
        gas_grid.total_count(),
        star_grid.total_count(),
        field.masked_count(),
        eos.name()
    );

    let surface_density_map = gas_grid.surface_densities();
    Ok(SnapshotResult {
        index,
        time: snapshot.header.time,
        gas_grid,
        star_grid,
        stability: field,
        surface_density_map,
        fiducial: fiducial_measurement,
        stability_profile,
        surface_density_profile,
        radial_counts,
        radial_fit,
        vertical_fit,
    })
}

/// Processes every snapshot on a bounded worker pool, one task per snapshot.
///
/// No state is shared between tasks and results come back as owned values,
/// re-associated with their snapshot index regardless of completion order.
/// A snapshot failure is logged and recorded; the run continues.
pub fn run(config: &AnalysisConfig, snapshots: &[SnapshotData]) -> Result<Vec<SnapshotOutcome>> {
    let available = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let workers = available.min(MAX_WORKERS).min(snapshots.len().max(1));
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .build()
        .map_err(|e| anyhow::anyhow!("failed to build worker pool: {}", e))?;

    info!(
        "Processing {} snapshots on {} workers...",
        snapshots.len(),
        workers
    );
    let start_time = Instant::now();

    let outcomes: Vec<SnapshotOutcome> = pool.install(|| {
        snapshots
            .par_iter()
            .enumerate()
            .map(|(index, snapshot)| {
                let snap_start = Instant::now();
                match analyze_snapshot(index, snapshot, config) {
                    Ok(result) => {
                        info!(
                            "Snapshot [{}/{}] done in {:.2} ms",
                            index + 1,
                            snapshots.len(),
                            snap_start.elapsed().as_secs_f64() * 1000.0
                        );
                        SnapshotOutcome::Completed(Box::new(result))
                    }
                    Err(e) => {
                        error!("Snapshot {} failed: {}", index, e);
                        SnapshotOutcome::Failed { index, error: e }
                    }
                }
            })
            .collect()
    });

    let failures = outcomes.iter().filter(|o| o.result().is_none()).count();
    info!(
        "Run finished in {:.3} s ({} completed, {} failed).",
        start_time.elapsed().as_secs_f64(),
        outcomes.len() - failures,
        failures
    );
    Ok(outcomes)
}
