//! Iterative 3-D phase retrieval for coherent X-ray diffraction imaging.
//!
//! Given the measured Fourier modulus of an object and an initial support
//! estimate, `phaseret` recovers the complex object by alternating projections
//! between the Fourier-modulus constraint and the real-space support
//! constraint. It offers
//!
//! - error reduction, hybrid input-output and solvent flipping update rules
//!   (`engine` module),
//! - shrinkwrap support refinement (`shrinkwrap` module),
//! - a stateful [`Solver`] that runs on the host (`rayon` + `rustfft`) or, with
//!   the `gpu` feature, on a wgpu device with volumes kept resident between calls,
//! - caller-side recipes chaining runs and shrinkwrap calls (`recipe` module), and
//! - recentering of the final object on its peak-amplitude voxel (`extract` module).
//!
//! # Quick start
//!
//! ```no_run
//! use ndarray::Array3;
//! use phaseret::recipe::{sigma_schedule, Recipe};
//! use phaseret::{ExecutionTarget, Solver, UpdateRule};
//!
//! let modulus: Array3<f64> = Array3::zeros((64, 64, 64)); // |F| of the measurement
//! let support = phaseret::data::SupportMask::centered_box([64, 64, 64], [24, 24, 24])
//!     .expect("valid support")
//!     .into_values();
//!
//! let mut solver = Solver::new(modulus, support, ExecutionTarget::Cpu).expect("valid inputs");
//!
//! let sigmas = sigma_schedule(3.0, 1.0, 5).expect("positive sigmas");
//! let recipe = Recipe::new()
//!     .error_reduction(50)
//!     .shrinkwrap_cycle(&sigmas, UpdateRule::hybrid_input_output(), 100)
//!     .error_reduction(50);
//! recipe.apply(&mut solver).expect("recipe runs");
//!
//! let result = solver.finalize().expect("final estimate");
//! println!("final error: {:?}", result.history.last());
//! ```

pub mod backend;
pub mod data;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod extract;
pub mod fft;
#[cfg(feature = "gpu")]
pub mod gpu;
pub mod initialization;
pub mod options;
pub mod projection;
pub mod recipe;
pub mod shrinkwrap;
pub mod solver;

pub use backend::ExecutionTarget;
pub use diagnostics::{ErrorHistory, RunSummary, ShrinkwrapSummary};
pub use engine::UpdateRule;
pub use error::{PhaseError, Result};
pub use extract::Reconstruction;
pub use initialization::InitialGuess;
pub use num_complex::Complex64;
pub use options::{ShrinkwrapOptions, SolverOptions};
pub use solver::{Solver, SolverBuilder};
