use crate::error::{AnalysisError, Result};
use log::debug;
use nalgebra::{Matrix2, Vector2};
use serde::{Deserialize, Serialize};

const MAX_ITERATIONS: usize = 100;
const COST_TOLERANCE: f64 = 1.0e-8;

/// Result of a converged profile fit: the scale parameter of the analytic
/// form and its standard error from the fit covariance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileFit {
    /// Fitted scale length (radial) or scale height (vertical), kpc.
    pub scale: f64,
    /// Standard error on the scale: sqrt of the covariance diagonal.
    pub scale_err: f64,
    /// Fitted normalization.
    pub norm: f64,
    pub iterations: usize,
}

/// The two fixed functional forms the fitter supports.
#[derive(Debug, Clone, Copy)]
enum ProfileModel {
    /// n(r) = A * r * exp(-r / R_s)
    RadialExponential,
    /// n(z) = A * sech^2(z / Z_s)
    VerticalSech2,
}

impl ProfileModel {
    /// Model value at `x` for parameters `[norm, scale]`.
    fn eval(self, p: [f64; 2], x: f64) -> f64 {
        let [norm, scale] = p;
        match self {
            ProfileModel::RadialExponential => norm * x * (-x / scale).exp(),
            ProfileModel::VerticalSech2 => {
                let s = 1.0 / (x / scale).cosh();
                norm * s * s
            }
        }
    }

    /// Partial derivatives with respect to `[norm, scale]` at `x`.
    fn jacobian(self, p: [f64; 2], x: f64) -> [f64; 2] {
        let [norm, scale] = p;
        match self {
            ProfileModel::RadialExponential => {
                let e = (-x / scale).exp();
                [x * e, norm * x * e * x / (scale * scale)]
            }
            ProfileModel::VerticalSech2 => {
                let u = x / scale;
                let s = 1.0 / u.cosh();
                let s2 = s * s;
                [s2, norm * 2.0 * s2 * u.tanh() * x / (scale * scale)]
            }
        }
    }
}

/// Fixed-width histogram over `[lo, hi]`. Bin centers carry the counts as
/// real values so they can feed the least-squares machinery directly.
fn histogram(values: &[f64], bin_width: f64, lo: f64, hi: f64) -> Result<(Vec<f64>, Vec<f64>)> {
    if bin_width <= 0.0 || hi <= lo {
        return Err(AnalysisError::Config(format!(
            "histogram range [{}, {}] with bin width {} is degenerate",
            lo, hi, bin_width
        )));
    }
    let num_bins = ((hi - lo) / bin_width).ceil() as usize;
    let mut counts = vec![0.0f64; num_bins];
    for &v in values {
        if v < lo || v >= hi {
            continue;
        }
        let bin = ((v - lo) / bin_width).floor() as usize;
        if bin < num_bins {
            counts[bin] += 1.0;
        }
    }
    let centers = (0..num_bins)
        .map(|k| lo + (k as f64 + 0.5) * bin_width)
        .collect();
    Ok((centers, counts))
}

fn cost(model: ProfileModel, p: [f64; 2], xs: &[f64], ys: &[f64]) -> f64 {
    xs.iter()
        .zip(ys)
        .map(|(&x, &y)| {
            let e = y - model.eval(p, x);
            e * e
        })
        .sum()
}

/// Levenberg-Marquardt over the two-parameter models, with analytic
/// Jacobians and the normal equations solved as 2x2 systems.
///
/// Returns the fitted parameters, their covariance, and the iteration count,
/// or `FitDidNotConverge` when the damping loop exhausts its budget.
fn levenberg_marquardt(
    model: ProfileModel,
    xs: &[f64],
    ys: &[f64],
    initial: [f64; 2],
) -> Result<([f64; 2], Matrix2<f64>, usize)> {
    let n = xs.len();
    if n < 3 {
        return Err(AnalysisError::FitDidNotConverge {
            iterations: 0,
            cost: f64::INFINITY,
        });
    }

    let mut params = initial;
    let mut current_cost = cost(model, params, xs, ys);
    let mut lambda = 1.0e-3;

    for iteration in 1..=MAX_ITERATIONS {
        // Accumulate J^T J and J^T e over the histogram points.
        let mut jtj: Matrix2<f64> = Matrix2::zeros();
        let mut jte: Vector2<f64> = Vector2::zeros();
        for (&x, &y) in xs.iter().zip(ys) {
            let j = model.jacobian(params, x);
            let e = y - model.eval(params, x);
            jtj[(0, 0)] += j[0] * j[0];
            jtj[(0, 1)] += j[0] * j[1];
            jtj[(1, 1)] += j[1] * j[1];
            jte[0] += j[0] * e;
            jte[1] += j[1] * e;
        }
        jtj[(1, 0)] = jtj[(0, 1)];

        // Damped step; increase lambda until the step reduces the cost.
        let mut stepped = false;
        for _ in 0..20 {
            let mut damped = jtj;
            damped[(0, 0)] += lambda * jtj[(0, 0)].max(1.0e-12);
            damped[(1, 1)] += lambda * jtj[(1, 1)].max(1.0e-12);

            let Some(inv) = damped.try_inverse() else {
                lambda *= 10.0;
                continue;
            };
            let delta = inv * jte;
            let candidate = [params[0] + delta[0], params[1] + delta[1]];

            // A non-positive scale is outside the model's domain; treat the
            // step as failed and increase damping.
            if candidate[1] <= 0.0 {
                lambda *= 10.0;
                continue;
            }

            let candidate_cost = cost(model, candidate, xs, ys);
            if candidate_cost < current_cost {
                let improvement = current_cost - candidate_cost;
                params = candidate;
                current_cost = candidate_cost;
                lambda = (lambda * 0.1).max(1.0e-12);
                stepped = true;

                if improvement <= COST_TOLERANCE * current_cost.max(1.0e-300) {
                    let cov = fit_covariance(model, params, xs, current_cost)?;
                    return Ok((params, cov, iteration));
                }
                break;
            }
            lambda *= 10.0;
        }

        if !stepped {
            // No damping level produced progress: either we are at the
            // minimum already or the residuals cannot be reduced further.
            let gradient_norm = jte.norm();
            if gradient_norm < 1.0e-10 {
                let cov = fit_covariance(model, params, xs, current_cost)?;
                return Ok((params, cov, iteration));
            }
            return Err(AnalysisError::FitDidNotConverge {
                iterations: iteration,
                cost: current_cost,
            });
        }
    }

    Err(AnalysisError::FitDidNotConverge {
        iterations: MAX_ITERATIONS,
        cost: current_cost,
    })
}

/// Parameter covariance at the solution: sigma^2 (J^T J)^-1 with the
/// residual variance estimated from the final cost.
fn fit_covariance(
    model: ProfileModel,
    params: [f64; 2],
    xs: &[f64],
    final_cost: f64,
) -> Result<Matrix2<f64>> {
    let mut jtj = Matrix2::zeros();
    for &x in xs {
        let j = model.jacobian(params, x);
        jtj[(0, 0)] += j[0] * j[0];
        jtj[(0, 1)] += j[0] * j[1];
        jtj[(1, 1)] += j[1] * j[1];
    }
    jtj[(1, 0)] = jtj[(0, 1)];

    let dof = (xs.len().saturating_sub(2)).max(1) as f64;
    let sigma2 = final_cost / dof;
    jtj.try_inverse()
        .map(|inv| inv * sigma2)
        .ok_or(AnalysisError::FitDidNotConverge {
            iterations: MAX_ITERATIONS,
            cost: final_cost,
        })
}

fn populated(counts: &[f64]) -> usize {
    counts.iter().filter(|&&c| c > 0.0).count()
}

/// Fits `n(r) = A r exp(-r/R_s)` to a histogram of particle radii and
/// returns the scale length.
pub fn fit_radial_profile(radii: &[f64], bin_width: f64, r_max: f64) -> Result<ProfileFit> {
    let (centers, counts) = histogram(radii, bin_width, 0.0, r_max)?;
    if populated(&counts) < 3 {
        return Err(AnalysisError::FitDidNotConverge {
            iterations: 0,
            cost: f64::INFINITY,
        });
    }

    // For n(r) ~ r exp(-r/R_s) the mean radius is 2 R_s; peak count sits at
    // r = R_s with value A R_s / e.
    let total: f64 = counts.iter().sum();
    let mean_r: f64 = centers.iter().zip(&counts).map(|(&r, &c)| r * c).sum::<f64>() / total;
    let scale0 = (mean_r / 2.0).max(bin_width);
    let peak = counts.iter().cloned().fold(0.0f64, f64::max);
    let norm0 = peak * std::f64::consts::E / scale0;

    let (params, cov, iterations) =
        levenberg_marquardt(ProfileModel::RadialExponential, &centers, &counts, [norm0, scale0])?;
    debug!(
        "radial profile fit: R_s = {:.4} +- {:.4} after {} iterations",
        params[1],
        cov[(1, 1)].sqrt(),
        iterations
    );
    Ok(ProfileFit {
        scale: params[1],
        scale_err: cov[(1, 1)].sqrt(),
        norm: params[0],
        iterations,
    })
}

/// Fits `n(z) = A sech^2(z/Z_s)` to a histogram of out-of-plane offsets and
/// returns the scale height.
pub fn fit_vertical_profile(z_offsets: &[f64], bin_width: f64, z_max: f64) -> Result<ProfileFit> {
    let (centers, counts) = histogram(z_offsets, bin_width, -z_max, z_max)?;
    if populated(&counts) < 3 {
        return Err(AnalysisError::FitDidNotConverge {
            iterations: 0,
            cost: f64::INFINITY,
        });
    }

    // For the sech^2 profile, mean |z| = Z_s ln 2.
    let total: f64 = counts.iter().sum();
    let mean_abs_z: f64 =
        centers.iter().zip(&counts).map(|(&z, &c)| z.abs() * c).sum::<f64>() / total;
    let scale0 = (mean_abs_z / std::f64::consts::LN_2).max(bin_width);
    let norm0 = counts.iter().cloned().fold(0.0f64, f64::max);

    let (params, cov, iterations) =
        levenberg_marquardt(ProfileModel::VerticalSech2, &centers, &counts, [norm0, scale0])?;
    debug!(
        "vertical profile fit: Z_s = {:.4} +- {:.4} after {} iterations",
        params[1],
        cov[(1, 1)].sqrt(),
        iterations
    );
    Ok(ProfileFit {
        scale: params[1],
        scale_err: cov[(1, 1)].sqrt(),
        norm: params[0],
        iterations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::prelude::*;
    use rand_distr::Gamma;

    #[test]
    fn radial_fit_recovers_known_scale_length() {
        // n(r) ~ r exp(-r/R_s) is a Gamma(shape 2, scale R_s) distribution.
        let r_scale = 5.0;
        let mut rng = StdRng::seed_from_u64(42);
        let gamma = Gamma::new(2.0, r_scale).unwrap();
        let radii: Vec<f64> = (0..10_000).map(|_| rng.sample(gamma)).collect();

        let fit = fit_radial_profile(&radii, 0.5, 40.0).unwrap();
        assert_relative_eq!(fit.scale, r_scale, max_relative = 0.1);
        assert!(fit.scale_err > 0.0);
        assert!(fit.scale_err < fit.scale);
    }

    #[test]
    fn vertical_fit_recovers_known_scale_height() {
        // Inverse-CDF sampling of the sech^2 distribution.
        let z_scale = 0.4;
        let mut rng = StdRng::seed_from_u64(7);
        let z_offsets: Vec<f64> = (0..10_000)
            .map(|_| {
                let u: f64 = rng.random();
                z_scale * (2.0 * u - 1.0).atanh()
            })
            .collect();

        let fit = fit_vertical_profile(&z_offsets, 0.05, 3.0).unwrap();
        assert_relative_eq!(fit.scale, z_scale, max_relative = 0.1);
        assert!(fit.scale_err > 0.0);
    }

    #[test]
    fn sparse_histogram_fails_as_non_convergence() {
        // Two populated bins cannot constrain a two-parameter model.
        let radii = vec![1.0, 1.1, 6.0];
        let err = fit_radial_profile(&radii, 1.0, 10.0).unwrap_err();
        assert!(matches!(err, AnalysisError::FitDidNotConverge { .. }));
    }

    #[test]
    fn degenerate_histogram_range_is_a_config_error() {
        let radii = vec![1.0, 2.0, 3.0];
        assert!(matches!(
            fit_radial_profile(&radii, 0.0, 10.0),
            Err(AnalysisError::Config(_))
        ));
        assert!(matches!(
            fit_radial_profile(&radii, 1.0, 0.0),
            Err(AnalysisError::Config(_))
        ));
    }

    #[test]
    fn model_jacobians_match_finite_differences() {
        let p = [120.0, 3.5];
        let eps = 1.0e-6;
        for model in [ProfileModel::RadialExponential, ProfileModel::VerticalSech2] {
            for &x in &[0.5, 2.0, 7.0] {
                let j = model.jacobian(p, x);
                let dn = (model.eval([p[0] + eps, p[1]], x) - model.eval(p, x)) / eps;
                let ds = (model.eval([p[0], p[1] + eps], x) - model.eval(p, x)) / eps;
                assert_relative_eq!(j[0], dn, max_relative = 1e-4);
                assert_relative_eq!(j[1], ds, max_relative = 1e-4);
            }
        }
    }
}
