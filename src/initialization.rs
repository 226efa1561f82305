//! Explicit construction of the first object estimate.

use std::f64::consts::PI;

use ndarray::Array3;
use num_complex::Complex64;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Uniform};

use crate::data::{shape_of, MeasuredModulus, SupportMask};
use crate::error::{PhaseError, Result};
use crate::fft::Fft3d;
use crate::projection::project_support;

/// Strategy used to seed the object estimate when a session starts.
#[derive(Clone, Debug)]
pub enum InitialGuess {
    /// Unit amplitude and zero phase on the active support voxels.
    Support,
    /// Measured modulus with uniformly random phases, transformed back to real
    /// space and restricted to the support. Deterministic for a given seed.
    RandomPhase { seed: u64 },
    /// Estimate supplied by the caller, used as is.
    Provided(Array3<Complex64>),
}

impl Default for InitialGuess {
    fn default() -> Self {
        Self::RandomPhase { seed: 0 }
    }
}

impl InitialGuess {
    /// Builds the starting estimate for the given inputs.
    pub fn build(
        &self,
        modulus: &MeasuredModulus,
        support: &SupportMask,
        fft: &Fft3d,
        epsilon: f64,
    ) -> Result<Array3<Complex64>> {
        match self {
            Self::Support => Ok(support
                .binarized(epsilon)
                .mapv(|w| Complex64::new(w, 0.0))),
            Self::RandomPhase { seed } => {
                let mut rng = SmallRng::seed_from_u64(*seed);
                let phases = Uniform::new(-PI, PI);
                let mut spectrum = modulus
                    .values()
                    .mapv(|m| Complex64::from_polar(m, phases.sample(&mut rng)));
                fft.inverse_inplace(&mut spectrum)?;
                Ok(project_support(&spectrum, support, epsilon))
            }
            Self::Provided(estimate) => {
                let found = shape_of(estimate);
                if found != modulus.shape() {
                    return Err(PhaseError::shape_mismatch(
                        "initial estimate",
                        modulus.shape(),
                        found,
                    ));
                }
                if let Some(((i, j, k), _)) = estimate
                    .indexed_iter()
                    .find(|(_, c)| !(c.re.is_finite() && c.im.is_finite()))
                {
                    return Err(PhaseError::NonFiniteInput {
                        context: "initial estimate",
                        index: [i, j, k],
                    });
                }
                Ok(estimate.clone())
            }
        }
    }
}
