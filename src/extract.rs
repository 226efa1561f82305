//! Recentering of the final object and support on the peak-amplitude voxel.

use ndarray::Array3;
use num_complex::Complex64;
use serde::{Deserialize, Serialize};

use crate::data::{shape_of, Shape};
use crate::diagnostics::ErrorHistory;

/// Object and support after recentering, with the applied circular shift.
#[derive(Clone, Debug, PartialEq)]
pub struct Centered {
    pub image: Array3<Complex64>,
    pub support: Array3<f64>,
    /// Shift applied along each axis, in `[0, n)`.
    pub shift: [usize; 3],
}

/// Final output of a session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reconstruction {
    /// Recentered complex object.
    pub image: Array3<Complex64>,
    /// Support, shifted with the image.
    pub support: Array3<f64>,
    /// Circular shift that moved the peak to the center.
    pub shift: [usize; 3],
    /// Every reconstruction error of the session.
    pub history: ErrorHistory,
}

/// Magnitudes within this fraction of the maximum count as tied for the peak.
///
/// Wide enough that `f32` and `f64` renditions of the same estimate agree on
/// which voxel is the peak.
pub const PEAK_TOLERANCE: f64 = 1e-3;

/// Voxel treated as the peak of `image`.
///
/// Every voxel whose magnitude is within [`PEAK_TOLERANCE`] of the maximum is a
/// candidate. The geometric center `n / 2` wins when it is a candidate;
/// otherwise the candidate with the smallest circular distance to the center,
/// then the first in C order.
pub fn peak_index(image: &Array3<Complex64>) -> Shape {
    let shape = shape_of(image);
    let center = shape.map(|n| n / 2);
    let peak = image.iter().map(|c| c.norm()).fold(0.0_f64, f64::max);
    let floor = peak * (1.0 - PEAK_TOLERANCE);
    if image[center].norm() >= floor {
        return center;
    }
    let mut best = (center, usize::MAX);
    for ((i, j, k), value) in image.indexed_iter() {
        if value.norm() < floor {
            continue;
        }
        let distance: usize = [i, j, k]
            .iter()
            .zip(shape.iter().zip(center.iter()))
            .map(|(&x, (&n, &c))| {
                let d = x.abs_diff(c);
                let d = d.min(n - d);
                d * d
            })
            .sum();
        if distance < best.1 {
            best = ([i, j, k], distance);
        }
    }
    best.0
}

/// Circularly rolls `volume` so that `out[(i + shift) % n] == volume[i]` on every axis.
pub fn roll<T: Clone>(volume: &Array3<T>, shift: [usize; 3]) -> Array3<T> {
    let [n0, n1, n2] = shape_of(volume);
    Array3::from_shape_fn((n0, n1, n2), |(i, j, k)| {
        volume[[
            (i + n0 - shift[0] % n0) % n0,
            (j + n1 - shift[1] % n1) % n1,
            (k + n2 - shift[2] % n2) % n2,
        ]]
        .clone()
    })
}

/// Moves the peak voxel of `image` (see [`peak_index`]) to the geometric center
/// `n / 2` of every axis, shifting `support` identically.
///
/// Calling it again on its own output applies a zero shift, ties included.
pub fn center_on_peak(image: &Array3<Complex64>, support: &Array3<f64>) -> Centered {
    let shape = shape_of(image);
    let peak = peak_index(image);
    let mut shift = [0usize; 3];
    for axis in 0..3 {
        let n = shape[axis];
        shift[axis] = (n / 2 + n - peak[axis]) % n;
    }
    Centered {
        image: roll(image, shift),
        support: roll(support, shift),
        shift,
    }
}
