//! Solver configuration: feedback strength, support binarization and shrinkwrap defaults.

use serde::{Deserialize, Serialize};

use crate::engine::DEFAULT_BETA;
use crate::error::{PhaseError, Result};

/// Controls the shrinkwrap support update.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShrinkwrapOptions {
    /// Fraction of the smoothed maximum at or above which a voxel stays in the support.
    pub threshold: f64,
    /// Gaussian kernel half-width, in units of sigma.
    pub truncate: f64,
}

impl Default for ShrinkwrapOptions {
    fn default() -> Self {
        Self {
            threshold: 0.1,
            truncate: 4.0,
        }
    }
}

/// Aggregated configuration used when building a [`Solver`](crate::Solver).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverOptions {
    /// Feedback parameter for hybrid input-output.
    pub beta: f64,
    /// Support weights at or below this value are treated as outside the support.
    pub support_epsilon: f64,
    /// Defaults for the shrinkwrap update.
    pub shrinkwrap: ShrinkwrapOptions,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            beta: DEFAULT_BETA,
            support_epsilon: 1e-6,
            shrinkwrap: ShrinkwrapOptions::default(),
        }
    }
}

impl SolverOptions {
    /// Override the hybrid input-output feedback parameter.
    pub fn with_beta(mut self, beta: f64) -> Self {
        self.beta = beta;
        self
    }

    /// Override the support binarization epsilon.
    pub fn with_support_epsilon(mut self, epsilon: f64) -> Self {
        self.support_epsilon = epsilon;
        self
    }

    /// Override the default shrinkwrap threshold.
    pub fn with_shrinkwrap_threshold(mut self, threshold: f64) -> Self {
        self.shrinkwrap.threshold = threshold;
        self
    }

    /// Override the Gaussian truncation radius (in sigmas).
    pub fn with_truncate(mut self, truncate: f64) -> Self {
        self.shrinkwrap.truncate = truncate;
        self
    }

    /// Checks every field against its admissible range.
    pub fn validate(&self) -> Result<()> {
        if !self.beta.is_finite() {
            return Err(PhaseError::invalid_parameter("beta", self.beta, "finite"));
        }
        if !(self.support_epsilon.is_finite() && self.support_epsilon >= 0.0) {
            return Err(PhaseError::invalid_parameter(
                "support_epsilon",
                self.support_epsilon,
                "finite and non-negative",
            ));
        }
        if !(self.shrinkwrap.threshold > 0.0 && self.shrinkwrap.threshold < 1.0) {
            return Err(PhaseError::invalid_parameter(
                "threshold",
                self.shrinkwrap.threshold,
                "inside the open interval (0, 1)",
            ));
        }
        if !(self.shrinkwrap.truncate.is_finite() && self.shrinkwrap.truncate > 0.0) {
            return Err(PhaseError::invalid_parameter(
                "truncate",
                self.shrinkwrap.truncate,
                "finite and positive",
            ));
        }
        Ok(())
    }
}
