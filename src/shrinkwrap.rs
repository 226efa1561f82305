//! Support refinement by smoothing the estimate's magnitude and thresholding it.
//!
//! The Gaussian convolution is circular along every axis, matching the
//! periodicity implied by the discrete Fourier transform.

use ndarray::{Array3, Axis, Zip};
use num_complex::Complex64;

use crate::data::SupportMask;
use crate::error::{PhaseError, Result};

/// Checks that `sigma` and `threshold` are usable for a shrinkwrap call.
pub fn validate_parameters(sigma: f64, threshold: f64) -> Result<()> {
    if !sigma.is_finite() || sigma < 0.0 {
        return Err(PhaseError::invalid_parameter(
            "sigma",
            sigma,
            "finite and non-negative",
        ));
    }
    if !(threshold > 0.0 && threshold < 1.0) {
        return Err(PhaseError::invalid_parameter(
            "threshold",
            threshold,
            "inside the open interval (0, 1)",
        ));
    }
    Ok(())
}

/// Kernel half-width along an axis of length `n`.
///
/// Capped at `(n - 1) / 2` so that no wrapped tap is counted twice.
pub fn kernel_radius(n: usize, sigma: f64, truncate: f64) -> usize {
    let radius = (truncate * sigma).ceil().max(0.0) as usize;
    radius.min(n.saturating_sub(1) / 2)
}

/// Normalized taps `(offset, weight)` of a sampled 1-D Gaussian.
fn gaussian_taps(n: usize, sigma: f64, truncate: f64) -> Vec<(isize, f64)> {
    let radius = kernel_radius(n, sigma, truncate) as isize;
    let mut taps: Vec<(isize, f64)> = (-radius..=radius)
        .map(|d| {
            // Center tap stays 1 even when the variance underflows to zero.
            if d == 0 {
                return (d, 1.0);
            }
            let d2 = (d * d) as f64;
            (d, (-d2 / (2.0 * sigma * sigma)).exp())
        })
        .collect();
    let norm: f64 = taps.iter().map(|(_, w)| w).sum();
    for (_, w) in taps.iter_mut() {
        *w /= norm;
    }
    taps
}

/// Separable circular Gaussian smoothing. `sigma == 0` returns the input unchanged.
pub fn gaussian_smooth(volume: &Array3<f64>, sigma: f64, truncate: f64) -> Array3<f64> {
    let mut out = volume.to_owned();
    if sigma == 0.0 {
        return out;
    }
    for axis in 0..3 {
        let n = out.len_of(Axis(axis));
        let taps = gaussian_taps(n, sigma, truncate);
        if taps.len() == 1 {
            continue;
        }
        Zip::from(out.lanes_mut(Axis(axis))).par_for_each(|mut lane| {
            let source = lane.to_vec();
            for (i, dst) in lane.iter_mut().enumerate() {
                *dst = taps
                    .iter()
                    .map(|&(d, w)| {
                        let j = (i as isize + d).rem_euclid(n as isize) as usize;
                        w * source[j]
                    })
                    .sum();
            }
        });
    }
    out
}

/// Derives a new support from the current estimate.
///
/// Voxels whose smoothed magnitude is at least `threshold * max` become 1, the
/// rest 0. An estimate with no magnitude anywhere yields an empty support.
pub fn shrinkwrap(
    estimate: &Array3<Complex64>,
    sigma: f64,
    threshold: f64,
    truncate: f64,
) -> Result<SupportMask> {
    validate_parameters(sigma, threshold)?;
    let magnitude = estimate.mapv(|c| c.norm());
    let smoothed = gaussian_smooth(&magnitude, sigma, truncate);
    let peak = smoothed.iter().copied().fold(0.0_f64, f64::max);
    let cutoff = threshold * peak;
    let values = smoothed.mapv(|v| if peak > 0.0 && v >= cutoff { 1.0 } else { 0.0 });
    SupportMask::new(values)
}
