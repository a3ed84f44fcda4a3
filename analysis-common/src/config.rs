use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

// Configuration for the analysis grid: bounding box plus target element size.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct GridConfig {
    pub xmin: f64,
    pub xmax: f64,
    pub ymin: f64,
    pub ymax: f64,
    /// Target cell edge length, kpc. Should be comparable to the smoothing
    /// length used in the simulation.
    pub element_size: f64,
    /// Collect per-cell particle id lists (slow, off by default).
    #[serde(default)]
    pub collect_ids: bool,
}

impl GridConfig {
    /// Number of grid cells along each axis implied by the element size.
    pub fn resolution(&self) -> (usize, usize) {
        let bins = |min: f64, max: f64| ((max - min) / self.element_size).floor() as usize;
        (bins(self.xmin, self.xmax), bins(self.ymin, self.ymax))
    }
}

// Configuration for the fiducial-radius measurement.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct FiducialConfig {
    /// Reference radius at which scalar diagnostics are reported, kpc.
    /// The solar radius is the conventional choice.
    #[serde(default = "default_fiducial_radius")]
    pub radius: f64,
    /// Half-width of the annular shell, kpc.
    #[serde(default = "default_half_width")]
    pub half_width: f64,
    /// Also report the one-sigma Poisson uncertainty on surface density.
    #[serde(default)]
    pub with_uncertainty: bool,
}

fn default_fiducial_radius() -> f64 {
    8.0
}

fn default_half_width() -> f64 {
    0.4
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EosChoice {
    Isothermal,
    Feedback,
}

// Tuning parameters for the supernova-feedback equation of state
// (Martizzi et al. 2015 constant-entropy model).
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct FeedbackParams {
    #[serde(default = "default_feedback_f")]
    pub f: f64,
    #[serde(default = "default_feedback_f_ref")]
    pub f_ref: f64,
    #[serde(default = "default_gas_fraction")]
    pub gas_fraction: f64,
    #[serde(default = "default_pressure")]
    pub pressure: f64,
}

impl Default for FeedbackParams {
    fn default() -> Self {
        Self {
            f: default_feedback_f(),
            f_ref: default_feedback_f_ref(),
            gas_fraction: default_gas_fraction(),
            pressure: default_pressure(),
        }
    }
}

fn default_feedback_f() -> f64 {
    0.4
}

fn default_feedback_f_ref() -> f64 {
    0.477
}

fn default_gas_fraction() -> f64 {
    0.1
}

fn default_pressure() -> f64 {
    3.0e5
}

// Configuration for the stability (Toomre Q) evaluation.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct StabilityConfig {
    /// Which sound-speed model to plug into the evaluator.
    #[serde(default = "default_eos")]
    pub eos: EosChoice,
    /// Dimensionless weight applied to the secondary species' surface
    /// density contribution. 2/3 is the literature value.
    #[serde(default = "default_secondary_weight")]
    pub secondary_weight: f64,
    /// Isothermal gas temperature, K.
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default)]
    pub feedback: FeedbackParams,
}

fn default_eos() -> EosChoice {
    EosChoice::Feedback
}

fn default_secondary_weight() -> f64 {
    2.0 / 3.0
}

fn default_temperature() -> f64 {
    1.0e4
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            eos: default_eos(),
            secondary_weight: default_secondary_weight(),
            temperature: default_temperature(),
            feedback: FeedbackParams::default(),
        }
    }
}

// Configuration for radial/vertical profile fitting.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ProfilesConfig {
    /// Histogram bin width, kpc.
    #[serde(default = "default_bin_width")]
    pub bin_width: f64,
    /// Maximum radius for the radial histogram; defaults to the grid xmax.
    #[serde(default)]
    pub r_max: Option<f64>,
    /// Maximum |z| for the vertical histogram, kpc.
    #[serde(default = "default_z_max")]
    pub z_max: f64,
    /// Vertical histogram bin width, kpc. Finer than the radial one since
    /// scale heights are a small fraction of scale lengths.
    #[serde(default = "default_vertical_bin_width")]
    pub vertical_bin_width: f64,
}

fn default_bin_width() -> f64 {
    0.5
}

fn default_z_max() -> f64 {
    5.0
}

fn default_vertical_bin_width() -> f64 {
    0.05
}

impl Default for ProfilesConfig {
    fn default() -> Self {
        Self {
            bin_width: default_bin_width(),
            r_max: None,
            z_max: default_z_max(),
            vertical_bin_width: default_vertical_bin_width(),
        }
    }
}

// Configuration for the synthetic snapshot source used when no decoded
// snapshot stream is supplied.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct InputConfig {
    pub snapshot_count: usize,
    pub gas_particles: usize,
    pub star_particles: usize,
    /// Exponential scale length of the generated disk, kpc.
    #[serde(default = "default_radial_scale")]
    pub radial_scale: f64,
    /// sech^2 scale height of the generated disk, kpc.
    #[serde(default = "default_vertical_scale")]
    pub vertical_scale: f64,
    /// Reference mass per gas particle, M_sun.
    pub gas_particle_mass: f64,
    /// Reference mass per star particle, M_sun.
    pub star_particle_mass: f64,
    /// Time between consecutive snapshots, simulation units.
    #[serde(default = "default_time_step")]
    pub time_step: f64,
    pub seed: u64,
}

fn default_radial_scale() -> f64 {
    5.0
}

fn default_vertical_scale() -> f64 {
    0.4
}

fn default_time_step() -> f64 {
    0.01
}

// Configuration for output settings.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct OutputConfig {
    pub base_filename: String,
    /// Output format for the full result set: "json", "bincode", "messagepack".
    pub format: Option<String>,
    #[serde(default = "default_save_results")]
    pub save_results: bool,
    /// Write the fiducial time series as a CSV alongside the result set.
    #[serde(default = "default_save_fiducial_csv")]
    pub save_fiducial_csv: bool,
}

fn default_save_results() -> bool {
    true
}

fn default_save_fiducial_csv() -> bool {
    true
}

// Main analysis configuration structure, loaded from config.toml.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct AnalysisConfig {
    pub grid: GridConfig,
    #[serde(default)]
    pub fiducial: FiducialConfig,
    #[serde(default)]
    pub stability: StabilityConfig,
    #[serde(default)]
    pub profiles: ProfilesConfig,
    pub input: InputConfig,
    pub output: OutputConfig,
}

impl Default for FiducialConfig {
    fn default() -> Self {
        Self {
            radius: default_fiducial_radius(),
            half_width: default_half_width(),
            with_uncertainty: false,
        }
    }
}

impl AnalysisConfig {
    /// Loads the analysis configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();

        let config_str = std::fs::read_to_string(path_ref)
            .map_err(|e| anyhow::anyhow!("Failed to read config file '{}': {}", path_ref.display(), e))?;
        let config: AnalysisConfig = toml::from_str(&config_str)
            .map_err(|e| anyhow::anyhow!("Failed to parse TOML from '{}': {}", path_ref.display(), e))?;

        config.validate()?;
        Ok(config)
    }

    /// Checks the configuration invariants once, up front, before any
    /// snapshot is touched.
    pub fn validate(&self) -> Result<()> {
        if self.grid.xmax <= self.grid.xmin {
            anyhow::bail!(
                "grid xmax ({}) must exceed xmin ({})",
                self.grid.xmax,
                self.grid.xmin
            );
        }
        if self.grid.ymax <= self.grid.ymin {
            anyhow::bail!(
                "grid ymax ({}) must exceed ymin ({})",
                self.grid.ymax,
                self.grid.ymin
            );
        }
        if self.grid.element_size <= 0.0 {
            anyhow::bail!("grid element_size must be positive.");
        }
        let (bins_x, bins_y) = self.grid.resolution();
        if bins_x == 0 || bins_y == 0 {
            anyhow::bail!(
                "element_size {} yields an empty grid for the given bounding box",
                self.grid.element_size
            );
        }
        if self.fiducial.radius <= 0.0 || self.fiducial.half_width <= 0.0 {
            anyhow::bail!("fiducial radius and half_width must be positive.");
        }
        if self.stability.secondary_weight < 0.0 {
            anyhow::bail!("secondary_weight must be non-negative.");
        }
        if self.profiles.bin_width <= 0.0 || self.profiles.vertical_bin_width <= 0.0 {
            anyhow::bail!("profile bin widths must be positive.");
        }
        if self.input.snapshot_count == 0 {
            anyhow::bail!("snapshot_count must be greater than 0.");
        }
        if self.input.gas_particle_mass <= 0.0 || self.input.star_particle_mass <= 0.0 {
            anyhow::bail!("particle reference masses must be positive.");
        }
        Ok(())
    }

    /// Maximum radius the radial profile histogram should cover.
    pub fn profile_r_max(&self) -> f64 {
        self.profiles.r_max.unwrap_or(self.grid.xmax)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AnalysisConfig {
        AnalysisConfig {
            grid: GridConfig {
                xmin: -100.0,
                xmax: 100.0,
                ymin: -100.0,
                ymax: 100.0,
                element_size: 5.0,
                collect_ids: false,
            },
            fiducial: FiducialConfig::default(),
            stability: StabilityConfig::default(),
            profiles: ProfilesConfig::default(),
            input: InputConfig {
                snapshot_count: 1,
                gas_particles: 1000,
                star_particles: 1000,
                radial_scale: 5.0,
                vertical_scale: 0.4,
                gas_particle_mass: 1.0e5,
                star_particle_mass: 2.0e5,
                time_step: 0.01,
                seed: 1,
            },
            output: OutputConfig {
                base_filename: "run".into(),
                format: None,
                save_results: false,
                save_fiducial_csv: false,
            },
        }
    }

    #[test]
    fn resolution_follows_element_size() {
        let config = base_config();
        assert_eq!(config.grid.resolution(), (40, 40));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn inverted_bounding_box_is_rejected() {
        let mut config = base_config();
        config.grid.xmax = -200.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_element_size_is_rejected() {
        let mut config = base_config();
        config.grid.element_size = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn defaults_cover_optional_sections() {
        let toml_str = r#"
            [grid]
            xmin = -100.0
            xmax = 100.0
            ymin = -100.0
            ymax = 100.0
            element_size = 5.0

            [input]
            snapshot_count = 4
            gas_particles = 10000
            star_particles = 10000
            gas_particle_mass = 1.0e5
            star_particle_mass = 2.0e5
            seed = 7

            [output]
            base_filename = "disk_run"
        "#;
        let config: AnalysisConfig = toml::from_str(toml_str).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.stability.eos, EosChoice::Feedback);
        assert!((config.stability.secondary_weight - 2.0 / 3.0).abs() < 1e-12);
        assert!((config.fiducial.radius - 8.0).abs() < 1e-12);
    }
}
