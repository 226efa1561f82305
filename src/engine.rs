//! Alternating-projection update rules and the single-step driver.

use std::fmt;

use ndarray::{Array3, Zip};
use num_complex::Complex64;
use serde::{Deserialize, Serialize};

use crate::data::{MeasuredModulus, SupportMask};
use crate::error::{PhaseError, Result};
use crate::fft::Fft3d;
use crate::projection::{fourier_error, impose_modulus};

/// Feedback parameter used by hybrid input-output when none is given.
pub const DEFAULT_BETA: f64 = 0.9;

/// Update applied to the object estimate at every iteration.
///
/// With `p` the modulus projection of the current estimate, every rule keeps
/// `p` inside the support and differs only outside it.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum UpdateRule {
    /// Outside the support: `0`.
    ErrorReduction,
    /// Outside the support: `current - beta * p`.
    HybridInputOutput { beta: f64 },
    /// Outside the support: `-p`.
    SolventFlipping,
}

impl UpdateRule {
    /// Hybrid input-output with the default feedback parameter.
    pub fn hybrid_input_output() -> Self {
        Self::HybridInputOutput { beta: DEFAULT_BETA }
    }

    /// Short conventional name, used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ErrorReduction => "ER",
            Self::HybridInputOutput { .. } => "HIO",
            Self::SolventFlipping => "SF",
        }
    }

    /// Rejects a non-finite feedback parameter.
    pub fn validate(&self) -> Result<()> {
        if let Self::HybridInputOutput { beta } = self {
            if !beta.is_finite() {
                return Err(PhaseError::invalid_parameter("beta", *beta, "finite"));
            }
        }
        Ok(())
    }

    /// Next value of one voxel given its current value and modulus projection.
    #[inline]
    pub fn combine(&self, current: Complex64, projected: Complex64, inside: bool) -> Complex64 {
        if inside {
            return projected;
        }
        match self {
            Self::ErrorReduction => Complex64::new(0.0, 0.0),
            Self::HybridInputOutput { beta } => current - projected * *beta,
            Self::SolventFlipping => -projected,
        }
    }
}

impl fmt::Display for UpdateRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Applies `rule` voxel by voxel, overwriting `estimate` with the next iterate.
pub fn apply_rule(
    rule: UpdateRule,
    estimate: &mut Array3<Complex64>,
    projected: &Array3<Complex64>,
    support: &SupportMask,
    epsilon: f64,
) {
    Zip::from(estimate)
        .and(projected)
        .and(support.values())
        .par_for_each(|current, &p, &weight| {
            *current = rule.combine(*current, p, weight > epsilon);
        });
}

/// Performs one iteration of `rule` in place.
///
/// Returns the reconstruction error of the spectrum computed inside the step,
/// i.e. of the estimate that entered it. Reusing that transform keeps the cost
/// at two transforms per step.
pub fn step(
    rule: UpdateRule,
    estimate: &mut Array3<Complex64>,
    support: &SupportMask,
    modulus: &MeasuredModulus,
    fft: &Fft3d,
    epsilon: f64,
) -> Result<f64> {
    let mut projected = fft.forward(estimate)?;
    let error = fourier_error(&projected, modulus.values());
    impose_modulus(&mut projected, modulus.values());
    fft.inverse_inplace(&mut projected)?;
    apply_rule(rule, estimate, &projected, support, epsilon);
    Ok(error)
}
