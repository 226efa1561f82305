//! Unitary 3-D discrete Fourier transform over complex volumes.

use std::fmt;
use std::sync::Arc;

use ndarray::{Array3, Axis, Zip};
use num_complex::Complex64;
use rustfft::{Fft, FftPlanner};

use crate::data::{shape_of, Shape};
use crate::error::{PhaseError, Result};

/// Planned forward and inverse transforms for one volume shape.
///
/// Each axis is scaled by `1/sqrt(n)`, so the 3-D transform preserves energy and
/// `inverse(forward(x)) == x` up to rounding. Lengths need not be powers of two.
#[derive(Clone)]
pub struct Fft3d {
    shape: Shape,
    forward: [Arc<dyn Fft<f64>>; 3],
    inverse: [Arc<dyn Fft<f64>>; 3],
}

impl fmt::Debug for Fft3d {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fft3d").field("shape", &self.shape).finish()
    }
}

impl Fft3d {
    /// Plans transforms for volumes of the given shape.
    pub fn new(shape: Shape) -> Self {
        let mut planner = FftPlanner::<f64>::new();
        let forward = shape.map(|n| planner.plan_fft_forward(n));
        let inverse = shape.map(|n| planner.plan_fft_inverse(n));
        Self {
            shape,
            forward,
            inverse,
        }
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    /// Forward transform, returning a new volume.
    pub fn forward(&self, volume: &Array3<Complex64>) -> Result<Array3<Complex64>> {
        let mut out = volume.to_owned();
        self.forward_inplace(&mut out)?;
        Ok(out)
    }

    /// Inverse transform, returning a new volume.
    pub fn inverse(&self, volume: &Array3<Complex64>) -> Result<Array3<Complex64>> {
        let mut out = volume.to_owned();
        self.inverse_inplace(&mut out)?;
        Ok(out)
    }

    pub fn forward_inplace(&self, volume: &mut Array3<Complex64>) -> Result<()> {
        self.check_shape(volume)?;
        for (axis, plan) in self.forward.iter().enumerate() {
            transform_axis(volume, axis, self.shape[axis], plan.as_ref());
        }
        Ok(())
    }

    pub fn inverse_inplace(&self, volume: &mut Array3<Complex64>) -> Result<()> {
        self.check_shape(volume)?;
        for (axis, plan) in self.inverse.iter().enumerate() {
            transform_axis(volume, axis, self.shape[axis], plan.as_ref());
        }
        Ok(())
    }

    fn check_shape(&self, volume: &Array3<Complex64>) -> Result<()> {
        let found = shape_of(volume);
        if found != self.shape {
            return Err(PhaseError::shape_mismatch("fft input", self.shape, found));
        }
        Ok(())
    }
}

/// Runs a 1-D transform over every lane along `axis`, lanes in parallel.
fn transform_axis(volume: &mut Array3<Complex64>, axis: usize, n: usize, plan: &dyn Fft<f64>) {
    if n <= 1 {
        return;
    }
    let scale = 1.0 / (n as f64).sqrt();
    Zip::from(volume.lanes_mut(Axis(axis))).par_for_each(|mut lane| {
        let mut buffer: Vec<Complex64> = lane.iter().copied().collect();
        plan.process(&mut buffer);
        for (dst, src) in lane.iter_mut().zip(buffer) {
            *dst = src * scale;
        }
    });
}
