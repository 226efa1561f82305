//! Validated input volumes: the measured Fourier modulus and the real-space support mask.

use ndarray::{Array3, Zip};

use crate::error::{PhaseError, Result};

/// Extent of a volume along its three axes.
pub type Shape = [usize; 3];

/// Returns the shape of a 3-D array as a fixed-size array.
pub fn shape_of<T>(volume: &Array3<T>) -> Shape {
    let (n0, n1, n2) = volume.dim();
    [n0, n1, n2]
}

fn ensure_non_empty<T>(context: &'static str, volume: &Array3<T>) -> Result<()> {
    let shape = shape_of(volume);
    if shape.iter().any(|&n| n == 0) {
        return Err(PhaseError::EmptyVolume { context, shape });
    }
    Ok(())
}

fn find_non_finite(volume: &Array3<f64>) -> Option<Shape> {
    volume
        .indexed_iter()
        .find(|(_, value)| !value.is_finite())
        .map(|((i, j, k), _)| [i, j, k])
}

/// Square root of a measured diffraction intensity, fixed for a whole session.
///
/// Values are expected on the scale of the unitary transform used by
/// [`Fft3d`](crate::fft::Fft3d), i.e. directly comparable to `|forward(x)|`.
#[derive(Clone, Debug)]
pub struct MeasuredModulus {
    values: Array3<f64>,
}

impl MeasuredModulus {
    /// Validates a modulus volume: non-empty, finite and non-negative.
    pub fn new(values: Array3<f64>) -> Result<Self> {
        ensure_non_empty("measured modulus", &values)?;
        if let Some(index) = find_non_finite(&values) {
            return Err(PhaseError::NonFiniteInput {
                context: "measured modulus",
                index,
            });
        }
        if let Some(((i, j, k), value)) = values.indexed_iter().find(|(_, value)| **value < 0.0) {
            return Err(PhaseError::NegativeModulus {
                index: [i, j, k],
                value: *value,
            });
        }
        Ok(Self { values })
    }

    /// Builds the modulus from a measured intensity volume by taking the square root.
    pub fn from_intensity(intensity: &Array3<f64>) -> Result<Self> {
        if let Some(((i, j, k), value)) = intensity.indexed_iter().find(|(_, value)| **value < 0.0)
        {
            return Err(PhaseError::NegativeModulus {
                index: [i, j, k],
                value: *value,
            });
        }
        Self::new(intensity.mapv(f64::sqrt))
    }

    pub fn shape(&self) -> Shape {
        shape_of(&self.values)
    }

    /// Total number of voxels.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Returns a read-only view of the modulus values.
    pub fn values(&self) -> &Array3<f64> {
        &self.values
    }

    /// Sum of squared modulus values, the denominator of the reconstruction error.
    pub fn energy(&self) -> f64 {
        self.values.iter().map(|m| m * m).sum()
    }
}

/// Region of real space where the object may be nonzero.
///
/// The mask is stored as real weights; projections treat any value above the
/// session's support epsilon as active.
#[derive(Clone, Debug)]
pub struct SupportMask {
    values: Array3<f64>,
}

impl SupportMask {
    /// Validates a support volume: non-empty and finite.
    pub fn new(values: Array3<f64>) -> Result<Self> {
        ensure_non_empty("support mask", &values)?;
        if let Some(index) = find_non_finite(&values) {
            return Err(PhaseError::NonFiniteInput {
                context: "support mask",
                index,
            });
        }
        Ok(Self { values })
    }

    /// Axis-aligned box of active voxels centered in the volume, `extent` voxels wide per axis.
    pub fn centered_box(shape: Shape, extent: Shape) -> Result<Self> {
        let bounds: Vec<(usize, usize)> = shape
            .iter()
            .zip(extent.iter())
            .map(|(&n, &e)| {
                let e = e.min(n);
                let start = (n - e) / 2;
                (start, start + e)
            })
            .collect();
        let values = Array3::from_shape_fn((shape[0], shape[1], shape[2]), |(i, j, k)| {
            let inside = [i, j, k]
                .iter()
                .zip(bounds.iter())
                .all(|(&x, &(lo, hi))| x >= lo && x < hi);
            if inside {
                1.0
            } else {
                0.0
            }
        });
        Self::new(values)
    }

    /// Sphere of the given radius (in voxels) around the volume center.
    pub fn centered_sphere(shape: Shape, radius: f64) -> Result<Self> {
        let center = shape.map(|n| (n / 2) as f64);
        let values = Array3::from_shape_fn((shape[0], shape[1], shape[2]), |(i, j, k)| {
            let d2 = (i as f64 - center[0]).powi(2)
                + (j as f64 - center[1]).powi(2)
                + (k as f64 - center[2]).powi(2);
            if d2 <= radius * radius {
                1.0
            } else {
                0.0
            }
        });
        Self::new(values)
    }

    pub fn shape(&self) -> Shape {
        shape_of(&self.values)
    }

    /// Returns a read-only view of the support weights.
    pub fn values(&self) -> &Array3<f64> {
        &self.values
    }

    /// Consumes the mask, returning the underlying weights.
    pub fn into_values(self) -> Array3<f64> {
        self.values
    }

    /// Number of voxels whose weight exceeds `epsilon`.
    pub fn active_voxels(&self, epsilon: f64) -> usize {
        self.values.iter().filter(|&&w| w > epsilon).count()
    }

    /// 0/1 version of the mask using the `> epsilon` rule.
    pub fn binarized(&self, epsilon: f64) -> Array3<f64> {
        let mut binary = Array3::zeros(self.values.raw_dim());
        Zip::from(&mut binary)
            .and(&self.values)
            .for_each(|b, &w| *b = if w > epsilon { 1.0 } else { 0.0 });
        binary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modulus_rejects_negative_values() {
        let mut values = Array3::from_elem((2, 2, 2), 1.0);
        values[[1, 0, 1]] = -0.5;
        let result = MeasuredModulus::new(values);
        match result {
            Err(PhaseError::NegativeModulus { index, value }) => {
                assert_eq!(index, [1, 0, 1]);
                assert_eq!(value, -0.5);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn modulus_rejects_non_finite_and_empty_volumes() {
        let mut values = Array3::from_elem((2, 2, 2), 1.0);
        values[[0, 1, 0]] = f64::NAN;
        assert!(matches!(
            MeasuredModulus::new(values),
            Err(PhaseError::NonFiniteInput { .. })
        ));

        let empty = Array3::<f64>::zeros((0, 4, 4));
        assert!(matches!(
            MeasuredModulus::new(empty),
            Err(PhaseError::EmptyVolume { .. })
        ));
    }

    #[test]
    fn intensity_is_square_rooted() {
        let intensity = Array3::from_elem((2, 3, 4), 9.0);
        let modulus = MeasuredModulus::from_intensity(&intensity).unwrap();
        assert_eq!(modulus.shape(), [2, 3, 4]);
        assert!(modulus.values().iter().all(|&m| m == 3.0));
        assert_eq!(modulus.energy(), 9.0 * 24.0);
    }

    #[test]
    fn centered_box_counts_active_voxels() {
        let support = SupportMask::centered_box([8, 8, 8], [4, 2, 3]).unwrap();
        assert_eq!(support.active_voxels(1e-6), 24);
        assert_eq!(support.values()[[4, 4, 4]], 1.0);
        assert_eq!(support.values()[[0, 0, 0]], 0.0);
    }

    #[test]
    fn binarized_uses_epsilon() {
        let mut values = Array3::zeros((1, 1, 3));
        values[[0, 0, 0]] = 0.2;
        values[[0, 0, 1]] = 1e-9;
        let support = SupportMask::new(values).unwrap();
        let binary = support.binarized(1e-6);
        assert_eq!(binary.as_slice().unwrap(), &[1.0, 0.0, 0.0]);
    }
}
