use anyhow::Result;
use log::{error, info, warn};
use std::fs::File;
use std::io::Write;
use std::time::Instant;

// Define modules used by main
mod driver;
mod eos;
mod error;
mod fiducial;
mod gridder;
mod profiles;
mod results;
mod stability;
mod synthetic;

use analysis_common::{AnalysisConfig, Species};
use driver::SnapshotOutcome;
use results::{FailureRecord, RunRecord};

fn main() -> Result<()> {
    // Initialize the logger
    env_logger::init();

    info!("Starting Disk Stability Analysis Engine...");

    // --- Load Configuration ---
    let config = AnalysisConfig::load("config.toml")?;
    info!(
        "Grid: {:?} cells over [{}, {}] x [{}, {}]",
        config.grid.resolution(),
        config.grid.xmin,
        config.grid.xmax,
        config.grid.ymin,
        config.grid.ymax
    );

    // --- Build Snapshot Sequence ---
    // Snapshot file decoding is an adapter concern; this binary drives the
    // pipeline over the deterministic synthetic disk source.
    info!(
        "Generating {} synthetic snapshots ({} gas + {} star particles each)...",
        config.input.snapshot_count, config.input.gas_particles, config.input.star_particles
    );
    let gen_start = Instant::now();
    let snapshots = (0..config.input.snapshot_count)
        .map(|i| synthetic::generate_snapshot(&config.input, i))
        .collect::<Result<Vec<_>>>()?;
    let total_particles: usize = snapshots.iter().map(|s| s.total_particles()).sum();
    info!(
        "Snapshots ready in {:.2} s ({} particles total).",
        gen_start.elapsed().as_secs_f64(),
        total_particles
    );

    // --- Run the Analysis ---
    let outcomes = driver::run(&config, &snapshots)?;

    // --- Assemble the Run Record ---
    let mut record = RunRecord {
        results: Vec::new(),
        failures: Vec::new(),
    };
    for outcome in outcomes {
        match outcome {
            SnapshotOutcome::Completed(result) => record.results.push(*result),
            SnapshotOutcome::Failed { index, error } => {
                warn!("Recording failure for snapshot {}: {}", index, error);
                record.failures.push(FailureRecord {
                    index,
                    error: error.to_string(),
                });
            }
        }
    }
    if record.results.is_empty() {
        anyhow::bail!("Every snapshot failed; nothing to save.");
    }

    // --- Save Results ---
    if config.output.save_results {
        let output_format = config.output.format.as_deref().unwrap_or("json");
        match output_format {
            "json" => save_json(&config, &record),
            "bincode" => {
                let filename = format!("{}_results.bin", config.output.base_filename);
                match File::create(&filename) {
                    Ok(file) => match bincode::serialize_into(file, &record) {
                        Ok(_) => info!("Results saved to {} (binary format)", filename),
                        Err(e) => error!("Error serializing results to bincode: {}", e),
                    },
                    Err(e) => error!("Error creating result file '{}': {}", filename, e),
                }
            }
            "messagepack" => {
                let filename = format!("{}_results.msgpack", config.output.base_filename);
                match &mut File::create(&filename) {
                    Ok(file) => match rmp_serde::encode::write(file, &record) {
                        Ok(_) => info!("Results saved to {} (MessagePack format)", filename),
                        Err(e) => error!("Error serializing results to MessagePack: {}", e),
                    },
                    Err(e) => error!("Error creating result file '{}': {}", filename, e),
                }
            }
            _ => {
                error!("Unknown output format: {}. Using JSON instead.", output_format);
                save_json(&config, &record);
            }
        }
    } else {
        info!("Skipping result persistence as per config (save_results is false).");
    }

    // --- Save the Fiducial Time Series ---
    if config.output.save_fiducial_csv {
        let filename = format!("{}_fiducial.csv", config.output.base_filename);
        match csv::Writer::from_path(&filename) {
            Ok(mut writer) => {
                writer.write_record(["time", "sd_gas", "sd_stars", "toomre_q"])?;
                for result in &record.results {
                    let sd_gas = result
                        .fiducial
                        .surface_densities
                        .get(&Species::Gas)
                        .copied()
                        .unwrap_or(0.0);
                    let sd_stars = result
                        .fiducial
                        .surface_densities
                        .get(&Species::Stars)
                        .copied()
                        .unwrap_or(0.0);
                    // An empty fiducial shell has no Q value; leave the
                    // field blank rather than writing a fake zero.
                    let q = result
                        .fiducial
                        .stability
                        .map(|q| format!("{:.6}", q))
                        .unwrap_or_default();
                    writer.write_record(&[
                        format!("{:.6}", result.time),
                        format!("{:.4}", sd_gas),
                        format!("{:.4}", sd_stars),
                        q,
                    ])?;
                }
                writer.flush()?;
                info!("Fiducial time series saved to {}", filename);
            }
            Err(e) => error!("Error saving CSV file '{}': {}", filename, e),
        }
    } else {
        info!("Skipping fiducial CSV as per config.");
    }

    info!(
        "Analysis Complete: {} snapshots processed, {} failed.",
        record.results.len(),
        record.failures.len()
    );
    Ok(())
}

fn save_json(config: &AnalysisConfig, record: &RunRecord) {
    let filename = format!("{}_results.json", config.output.base_filename);
    match File::create(&filename) {
        Ok(mut file) => match serde_json::to_string(record) {
            Ok(json_string) => {
                if let Err(e) = file.write_all(json_string.as_bytes()) {
                    error!("Error writing result JSON to file '{}': {}", filename, e);
                } else {
                    info!(
                        "Results saved to {} ({} MB)",
                        filename,
                        json_string.len() / 1_048_576
                    );
                }
            }
            Err(e) => error!("Error serializing results to JSON: {}", e),
        },
        Err(e) => error!("Error creating result file '{}': {}", filename, e),
    }
}
