use crate::error::{AnalysisError, Result};
use crate::stability::GRAVITATIONAL_CONSTANT;
use analysis_common::{EosChoice, StabilityConfig};

/// Sound speed as a function of local density, km/s.
///
/// The stability evaluator is agnostic to which model is plugged in; swapping
/// implementations must not touch the binning or masking logic.
pub trait EquationOfState: Send + Sync {
    fn sound_speed(&self, density: f64) -> Result<f64>;
    fn name(&self) -> &'static str;
}

/// Isothermal gas: the sound speed is independent of density.
#[derive(Debug, Clone)]
pub struct Isothermal {
    /// Gas temperature, K.
    pub temperature: f64,
}

impl Default for Isothermal {
    fn default() -> Self {
        Self { temperature: 1.0e4 }
    }
}

impl EquationOfState for Isothermal {
    fn sound_speed(&self, _density: f64) -> Result<f64> {
        const GAMMA: f64 = 5.0 / 3.0;
        const GAS_CONSTANT: f64 = 8.314; // J / (mol K)
        const MOLAR_MASS: f64 = 0.001; // kg / mol, atomic hydrogen
        let speed_m_s = (GAMMA * GAS_CONSTANT * self.temperature / MOLAR_MASS).sqrt();
        Ok(speed_m_s * 1.0e-3) // km/s
    }

    fn name(&self) -> &'static str {
        "isothermal"
    }
}

/// Supernova-feedback-driven polytrope (Martizzi et al. 2015): constant
/// entropy, sound speed scaling as density^(1/4).
#[derive(Debug, Clone)]
pub struct FeedbackPolytrope {
    pub f: f64,
    pub f_ref: f64,
    pub gas_fraction: f64,
    pub pressure: f64,
}

impl Default for FeedbackPolytrope {
    fn default() -> Self {
        Self {
            f: 0.4,
            f_ref: 0.477,
            gas_fraction: 0.1,
            pressure: 3.0e5,
        }
    }
}

impl FeedbackPolytrope {
    /// The entropy constant set by the four tuning parameters.
    fn entropy(&self) -> f64 {
        4.5 * (self.f / self.f_ref).powf(1.5)
            * GRAVITATIONAL_CONSTANT.powf(0.75)
            * self.pressure.sqrt()
            / self.gas_fraction
    }
}

impl EquationOfState for FeedbackPolytrope {
    fn sound_speed(&self, density: f64) -> Result<f64> {
        // Negative density is a data-quality problem and must stay visible;
        // zero is the expected value in cells no gas particle landed in.
        if density < 0.0 {
            return Err(AnalysisError::NegativeDensity {
                model: "feedback-polytrope",
                density,
            });
        }
        Ok((1.25 * self.entropy() * density.powf(0.25)).sqrt())
    }

    fn name(&self) -> &'static str {
        "feedback-polytrope"
    }
}

/// Builds the configured sound-speed model.
pub fn build_eos(config: &StabilityConfig) -> Box<dyn EquationOfState> {
    match config.eos {
        EosChoice::Isothermal => Box::new(Isothermal {
            temperature: config.temperature,
        }),
        EosChoice::Feedback => Box::new(FeedbackPolytrope {
            f: config.feedback.f,
            f_ref: config.feedback.f_ref,
            gas_fraction: config.feedback.gas_fraction,
            pressure: config.feedback.pressure,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn isothermal_speed_is_density_independent() {
        let eos = Isothermal::default();
        let a = eos.sound_speed(1.0e-3).unwrap();
        let b = eos.sound_speed(7.3).unwrap();
        assert_relative_eq!(a, b);
        // sqrt(5/3 * 8.314 * 1e4 / 1e-3) m/s = ~11.77 km/s
        assert_relative_eq!(a, 11.772, epsilon = 1e-2);
    }

    #[test]
    fn polytrope_scales_as_eighth_root() {
        let eos = FeedbackPolytrope::default();
        let c1 = eos.sound_speed(1.0).unwrap();
        let c16 = eos.sound_speed(16.0).unwrap();
        // cs ~ density^(1/8) once the square root is applied.
        assert_relative_eq!(c16 / c1, 16.0f64.powf(0.125), epsilon = 1e-12);
    }

    #[test]
    fn polytrope_rejects_negative_density() {
        let eos = FeedbackPolytrope::default();
        assert!(matches!(
            eos.sound_speed(-1.0),
            Err(AnalysisError::NegativeDensity { .. })
        ));
        // Zero density is an expected empty-cell value, not an error.
        assert_relative_eq!(eos.sound_speed(0.0).unwrap(), 0.0);
    }
}
