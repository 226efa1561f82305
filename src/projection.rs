//! Fourier-modulus and support projections, and the reconstruction-error metric.

use ndarray::{Array3, Axis, Zip};
use num_complex::Complex64;
use rayon::prelude::*;

use crate::data::{MeasuredModulus, SupportMask};
use crate::error::Result;
use crate::fft::Fft3d;

/// Replaces the magnitude of the estimate's spectrum with the measured modulus,
/// keeping the phase, and transforms back to real space.
pub fn project_modulus(
    estimate: &Array3<Complex64>,
    modulus: &MeasuredModulus,
    fft: &Fft3d,
) -> Result<Array3<Complex64>> {
    let mut spectrum = fft.forward(estimate)?;
    impose_modulus(&mut spectrum, modulus.values());
    fft.inverse_inplace(&mut spectrum)?;
    Ok(spectrum)
}

/// Zeroes the estimate wherever the support weight is not above `epsilon`.
pub fn project_support(
    estimate: &Array3<Complex64>,
    support: &SupportMask,
    epsilon: f64,
) -> Array3<Complex64> {
    let mut out = estimate.to_owned();
    Zip::from(&mut out)
        .and(support.values())
        .par_for_each(|value, &weight| {
            if weight <= epsilon {
                *value = Complex64::new(0.0, 0.0);
            }
        });
    out
}

/// Sets `|F| = M` voxel by voxel. A zero amplitude has no phase, so it takes phase 0.
pub(crate) fn impose_modulus(spectrum: &mut Array3<Complex64>, modulus: &Array3<f64>) {
    Zip::from(spectrum)
        .and(modulus)
        .par_for_each(|value, &target| {
            let amplitude = value.norm();
            *value = if amplitude > 0.0 {
                *value * (target / amplitude)
            } else {
                Complex64::new(target, 0.0)
            };
        });
}

/// Normalized L2 distance between `|F|` and the measured modulus.
///
/// With an all-zero modulus the denominator vanishes and the plain L2 distance is returned.
pub fn fourier_error(spectrum: &Array3<Complex64>, modulus: &Array3<f64>) -> f64 {
    let (mismatch, energy) = spectrum
        .axis_iter(Axis(0))
        .into_par_iter()
        .zip(modulus.axis_iter(Axis(0)).into_par_iter())
        .map(|(plane, targets)| {
            plane.iter().zip(targets.iter()).fold(
                (0.0_f64, 0.0_f64),
                |(mismatch, energy), (value, &target)| {
                    let gap = value.norm() - target;
                    (mismatch + gap * gap, energy + target * target)
                },
            )
        })
        .reduce(|| (0.0, 0.0), |a, b| (a.0 + b.0, a.1 + b.1));
    if energy > 0.0 {
        (mismatch / energy).sqrt()
    } else {
        mismatch.sqrt()
    }
}

/// Reconstruction error of a real-space estimate against the measured modulus.
pub fn reconstruction_error(
    estimate: &Array3<Complex64>,
    modulus: &MeasuredModulus,
    fft: &Fft3d,
) -> Result<f64> {
    let spectrum = fft.forward(estimate)?;
    Ok(fourier_error(&spectrum, modulus.values()))
}
