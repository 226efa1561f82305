//! Execution backends behind the solver facade.

use std::fmt;

use ndarray::Array3;
use num_complex::Complex64;
use serde::{Deserialize, Serialize};

use crate::data::{MeasuredModulus, SupportMask};
use crate::engine::{self, UpdateRule};
use crate::error::Result;
use crate::fft::Fft3d;
use crate::options::SolverOptions;
use crate::shrinkwrap;

/// Where a session's volumes live and its arithmetic runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionTarget {
    /// Host memory, rayon-parallel `f64` arithmetic.
    #[default]
    Cpu,
    /// Device-resident `f32` buffers driven through wgpu (feature `gpu`).
    Gpu,
}

impl fmt::Display for ExecutionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => f.write_str("cpu"),
            Self::Gpu => f.write_str("gpu"),
        }
    }
}

/// Operations a backend must provide to host a phase-retrieval session.
///
/// A backend owns the object estimate and the support mask exclusively.
pub trait Backend: Send {
    fn target(&self) -> ExecutionTarget;

    /// Whether `rule` can run on this backend.
    fn supports(&self, rule: &UpdateRule) -> bool;

    /// Performs one iteration and returns its reconstruction error.
    fn step(&mut self, rule: UpdateRule) -> Result<f64>;

    /// Performs `iterations` steps, appending one error per completed step to `errors`.
    ///
    /// On failure, `errors` still holds every step that completed before it.
    fn run(&mut self, rule: UpdateRule, iterations: usize, errors: &mut Vec<f64>) -> Result<()> {
        for _ in 0..iterations {
            errors.push(self.step(rule)?);
        }
        Ok(())
    }

    /// Replaces the support from the current estimate; returns the active voxel count.
    fn shrinkwrap(&mut self, sigma: f64, threshold: f64, truncate: f64) -> Result<usize>;

    /// Copies the current estimate and support into host arrays.
    fn snapshot(&self) -> Result<(Array3<Complex64>, Array3<f64>)>;
}

/// Host-memory backend; transform lanes and element-wise updates run on rayon.
#[derive(Debug)]
pub struct CpuBackend {
    modulus: MeasuredModulus,
    support: SupportMask,
    estimate: Array3<Complex64>,
    fft: Fft3d,
    epsilon: f64,
}

impl CpuBackend {
    pub fn new(
        modulus: MeasuredModulus,
        support: SupportMask,
        estimate: Array3<Complex64>,
        fft: Fft3d,
        options: &SolverOptions,
    ) -> Self {
        Self {
            modulus,
            support,
            estimate,
            fft,
            epsilon: options.support_epsilon,
        }
    }

    pub fn estimate(&self) -> &Array3<Complex64> {
        &self.estimate
    }

    pub fn support(&self) -> &SupportMask {
        &self.support
    }
}

impl Backend for CpuBackend {
    fn target(&self) -> ExecutionTarget {
        ExecutionTarget::Cpu
    }

    fn supports(&self, _rule: &UpdateRule) -> bool {
        true
    }

    fn step(&mut self, rule: UpdateRule) -> Result<f64> {
        engine::step(
            rule,
            &mut self.estimate,
            &self.support,
            &self.modulus,
            &self.fft,
            self.epsilon,
        )
    }

    fn shrinkwrap(&mut self, sigma: f64, threshold: f64, truncate: f64) -> Result<usize> {
        self.support = shrinkwrap::shrinkwrap(&self.estimate, sigma, threshold, truncate)?;
        Ok(self.support.active_voxels(self.epsilon))
    }

    fn snapshot(&self) -> Result<(Array3<Complex64>, Array3<f64>)> {
        Ok((self.estimate.clone(), self.support.values().clone()))
    }
}
