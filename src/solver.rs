//! Stateful phase-retrieval session shared by every backend.

use ndarray::Array3;
use num_complex::Complex64;

use crate::backend::{Backend, CpuBackend, ExecutionTarget};
use crate::data::{MeasuredModulus, Shape, SupportMask};
use crate::diagnostics::{DegeneracyKind, ErrorHistory, RunSummary, ShrinkwrapSummary};
use crate::engine::UpdateRule;
use crate::error::{PhaseError, Result};
use crate::extract::{center_on_peak, Reconstruction};
use crate::fft::Fft3d;
use crate::initialization::InitialGuess;
use crate::options::SolverOptions;

/// One reconstruction session.
///
/// The solver owns the measured modulus, the object estimate and the support
/// for its whole lifetime. Calls run strictly in order; [`finalize`](Self::finalize)
/// consumes the session so no further mutation is possible.
pub struct Solver {
    backend: Box<dyn Backend>,
    options: SolverOptions,
    history: ErrorHistory,
    shape: Shape,
}

impl std::fmt::Debug for Solver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Solver")
            .field("target", &self.backend.target())
            .field("shape", &self.shape)
            .field("steps", &self.history.len())
            .finish()
    }
}

impl Solver {
    /// Builds a session with default options and initial guess.
    pub fn new(modulus: Array3<f64>, support: Array3<f64>, target: ExecutionTarget) -> Result<Self> {
        Self::builder(modulus, support).target(target).build()
    }

    /// Starts a builder from the measured modulus and the initial support.
    pub fn builder(modulus: Array3<f64>, support: Array3<f64>) -> SolverBuilder {
        SolverBuilder::new(modulus, support)
    }

    pub fn target(&self) -> ExecutionTarget {
        self.backend.target()
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    pub fn options(&self) -> &SolverOptions {
        &self.options
    }

    /// Every reconstruction error recorded so far, with degeneracy flags.
    pub fn history(&self) -> &ErrorHistory {
        &self.history
    }

    pub fn errors(&self) -> &[f64] {
        self.history.errors()
    }

    /// Applies `rule` for `iterations` steps without touching the support.
    pub fn run(&mut self, rule: UpdateRule, iterations: usize) -> Result<RunSummary> {
        rule.validate()?;
        if !self.backend.supports(&rule) {
            return Err(PhaseError::UnsupportedOperation {
                operation: rule.name(),
                target: self.backend.target(),
            });
        }

        let first_step = self.history.len();
        let mut errors = Vec::with_capacity(iterations);
        let outcome = self.backend.run(rule, iterations, &mut errors);
        let mut degenerate = false;
        for error in &errors {
            degenerate |= self.history.record(*error);
        }
        if degenerate {
            log::warn!(
                "{rule} run starting at step {first_step} produced a non-finite reconstruction error"
            );
        }
        if let Err(err) = outcome {
            log::warn!(
                "{rule} run starting at step {first_step} stopped after {} of {iterations} steps: {err}",
                errors.len()
            );
            return Err(err);
        }
        let summary = RunSummary {
            rule,
            iterations: errors.len(),
            first_step,
            final_error: errors.last().copied(),
            degenerate,
        };
        log::debug!(
            "{} x{} on {}: error {:?}",
            rule,
            summary.iterations,
            self.backend.target(),
            summary.final_error
        );
        Ok(summary)
    }

    pub fn error_reduction(&mut self, iterations: usize) -> Result<RunSummary> {
        self.run(UpdateRule::ErrorReduction, iterations)
    }

    /// Hybrid input-output with the session's `beta`.
    pub fn hybrid_input_output(&mut self, iterations: usize) -> Result<RunSummary> {
        let beta = self.options.beta;
        self.run(UpdateRule::HybridInputOutput { beta }, iterations)
    }

    /// Solvent flipping; unavailable on the GPU backend.
    pub fn solvent_flipping(&mut self, iterations: usize) -> Result<RunSummary> {
        self.run(UpdateRule::SolventFlipping, iterations)
    }

    /// Recomputes the support from the current estimate.
    ///
    /// An empty result is flagged in the history rather than returned as an error;
    /// later support projections then zero the estimate.
    pub fn shrinkwrap(&mut self, sigma: f64, threshold: f64) -> Result<ShrinkwrapSummary> {
        let truncate = self.options.shrinkwrap.truncate;
        let active_voxels = self.backend.shrinkwrap(sigma, threshold, truncate)?;
        let degenerate = active_voxels == 0;
        if degenerate {
            self.history.flag(DegeneracyKind::EmptySupport);
            log::warn!(
                "shrinkwrap (sigma {sigma}, threshold {threshold}) left an empty support at step {}",
                self.history.len()
            );
        } else {
            log::debug!("shrinkwrap (sigma {sigma}, threshold {threshold}): {active_voxels} voxels");
        }
        Ok(ShrinkwrapSummary {
            sigma,
            threshold,
            active_voxels,
            degenerate,
        })
    }

    /// Shrinkwrap with the session's default threshold.
    pub fn shrinkwrap_default(&mut self, sigma: f64) -> Result<ShrinkwrapSummary> {
        let threshold = self.options.shrinkwrap.threshold;
        self.shrinkwrap(sigma, threshold)
    }

    /// Copies the current estimate and support to host arrays without ending the session.
    pub fn estimate(&self) -> Result<(Array3<Complex64>, Array3<f64>)> {
        self.backend.snapshot()
    }

    /// Ends the session: fetches the estimate and support, recenters them on the
    /// peak-amplitude voxel and returns them with the full error history.
    pub fn finalize(self) -> Result<Reconstruction> {
        let (image, support) = self.backend.snapshot()?;
        let centered = center_on_peak(&image, &support);
        log::info!(
            "finalized {} session after {} steps, shift {:?}",
            self.backend.target(),
            self.history.len(),
            centered.shift
        );
        Ok(Reconstruction {
            image: centered.image,
            support: centered.support,
            shift: centered.shift,
            history: self.history,
        })
    }
}

/// Builder that validates inputs before any backend state is created.
#[derive(Debug)]
pub struct SolverBuilder {
    modulus: Array3<f64>,
    support: Array3<f64>,
    target: ExecutionTarget,
    options: SolverOptions,
    initial_guess: InitialGuess,
}

impl SolverBuilder {
    pub fn new(modulus: Array3<f64>, support: Array3<f64>) -> Self {
        Self {
            modulus,
            support,
            target: ExecutionTarget::default(),
            options: SolverOptions::default(),
            initial_guess: InitialGuess::default(),
        }
    }

    /// Sets where the session runs.
    pub fn target(mut self, target: ExecutionTarget) -> Self {
        self.target = target;
        self
    }

    /// Replaces the solver options.
    pub fn options(mut self, options: SolverOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets how the first object estimate is produced.
    pub fn initial_guess(mut self, guess: InitialGuess) -> Self {
        self.initial_guess = guess;
        self
    }

    /// Validates inputs, builds the initial estimate and hands everything to the backend.
    pub fn build(self) -> Result<Solver> {
        self.options.validate()?;
        let modulus = MeasuredModulus::new(self.modulus)?;
        let support = SupportMask::new(self.support)?;
        let shape = modulus.shape();
        if support.shape() != shape {
            return Err(PhaseError::shape_mismatch(
                "support mask",
                shape,
                support.shape(),
            ));
        }

        let fft = Fft3d::new(shape);
        let epsilon = self.options.support_epsilon;
        let active = support.active_voxels(epsilon);
        let estimate = self
            .initial_guess
            .build(&modulus, &support, &fft, epsilon)?;

        let backend: Box<dyn Backend> = match self.target {
            ExecutionTarget::Cpu => Box::new(CpuBackend::new(
                modulus,
                support,
                estimate,
                fft,
                &self.options,
            )),
            ExecutionTarget::Gpu => gpu_backend(&modulus, &support, &estimate, &self.options)?,
        };

        log::info!(
            "phase retrieval session on {} with shape {:?}, {} support voxels",
            backend.target(),
            shape,
            active
        );

        Ok(Solver {
            backend,
            options: self.options,
            history: ErrorHistory::new(),
            shape,
        })
    }
}

#[cfg(feature = "gpu")]
fn gpu_backend(
    modulus: &MeasuredModulus,
    support: &SupportMask,
    estimate: &Array3<Complex64>,
    options: &SolverOptions,
) -> Result<Box<dyn Backend>> {
    Ok(Box::new(crate::gpu::GpuBackend::new(
        modulus, support, estimate, options,
    )?))
}

#[cfg(not(feature = "gpu"))]
fn gpu_backend(
    _modulus: &MeasuredModulus,
    _support: &SupportMask,
    _estimate: &Array3<Complex64>,
    _options: &SolverOptions,
) -> Result<Box<dyn Backend>> {
    Err(PhaseError::UnsupportedTarget {
        target: ExecutionTarget::Gpu,
        reason: "phaseret was built without the `gpu` feature".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::DEFAULT_BETA;

    fn object(shape: Shape) -> Array3<Complex64> {
        let [n0, n1, n2] = shape;
        Array3::from_shape_fn((n0, n1, n2), |(i, j, k)| {
            if (2..5).contains(&i) && (2..5).contains(&j) && (2..4).contains(&k) {
                Complex64::new(1.0 + 0.1 * (i + k) as f64, 0.2 * j as f64)
            } else {
                Complex64::new(0.0, 0.0)
            }
        })
    }

    fn inputs() -> (Array3<f64>, Array3<f64>) {
        let shape = [8, 8, 6];
        let truth = object(shape);
        let modulus = Fft3d::new(shape).forward(&truth).unwrap().mapv(|c| c.norm());
        let support = truth.mapv(|c| if c.norm() > 0.0 { 1.0 } else { 0.0 });
        (modulus, support)
    }

    #[test]
    fn runs_accumulate_history_in_order() {
        let (modulus, support) = inputs();
        let mut solver = Solver::new(modulus, support, ExecutionTarget::Cpu).unwrap();
        let first = solver.error_reduction(3).unwrap();
        let second = solver.hybrid_input_output(2).unwrap();
        assert_eq!(first.first_step, 0);
        assert_eq!(second.first_step, 3);
        assert_eq!(
            second.rule,
            UpdateRule::HybridInputOutput { beta: DEFAULT_BETA }
        );
        assert_eq!(solver.errors().len(), 5);
        assert_eq!(second.final_error, solver.history().last());
    }

    #[test]
    fn zero_iterations_is_a_no_op() {
        let (modulus, support) = inputs();
        let mut solver = Solver::new(modulus, support, ExecutionTarget::Cpu).unwrap();
        let before = solver.estimate().unwrap();
        let summary = solver.solvent_flipping(0).unwrap();
        assert_eq!(summary.iterations, 0);
        assert_eq!(summary.final_error, None);
        assert_eq!(solver.estimate().unwrap(), before);
    }

    #[test]
    fn invalid_beta_is_rejected_before_stepping() {
        let (modulus, support) = inputs();
        let mut solver = Solver::new(modulus, support, ExecutionTarget::Cpu).unwrap();
        let result = solver.run(UpdateRule::HybridInputOutput { beta: f64::NAN }, 4);
        assert!(matches!(result, Err(PhaseError::InvalidParameter { .. })));
        assert!(solver.history().is_empty());
    }

    #[test]
    fn mismatched_support_shape_is_rejected() {
        let (modulus, _) = inputs();
        let result = Solver::new(modulus, Array3::ones((8, 8, 5)), ExecutionTarget::Cpu);
        assert!(matches!(result, Err(PhaseError::ShapeMismatch { .. })));
    }

    #[test]
    fn empty_shrinkwrap_is_flagged() {
        let (modulus, support) = inputs();
        let mut solver = Solver::builder(modulus, support)
            .initial_guess(InitialGuess::Provided(Array3::zeros((8, 8, 6))))
            .build()
            .unwrap();
        let summary = solver.shrinkwrap(1.0, 0.2).unwrap();
        assert!(summary.degenerate);
        assert_eq!(summary.active_voxels, 0);
        assert!(solver.history().is_degenerate());
        let (_, support) = solver.estimate().unwrap();
        assert!(support.iter().all(|&w| w == 0.0));

        // The modulus projection of the zero estimate is non-zero everywhere the
        // modulus is; the empty support then collapses it back to zero.
        let run = solver.error_reduction(1).unwrap();
        assert_eq!(run.iterations, 1);
        let (estimate, _) = solver.estimate().unwrap();
        assert!(estimate.iter().all(|c| c.norm() == 0.0));

        let later = solver.hybrid_input_output(2).unwrap();
        assert_eq!(later.first_step, 1);
        assert!(later.final_error.is_some_and(f64::is_finite));
        assert_eq!(solver.errors().len(), 3);
    }

    /// Backend whose device fails once a fixed number of steps have run.
    struct FailingBackend {
        steps_left: usize,
    }

    impl Backend for FailingBackend {
        fn target(&self) -> ExecutionTarget {
            ExecutionTarget::Cpu
        }

        fn supports(&self, _rule: &UpdateRule) -> bool {
            true
        }

        fn step(&mut self, _rule: UpdateRule) -> Result<f64> {
            if self.steps_left == 0 {
                return Err(PhaseError::device("lost device"));
            }
            self.steps_left -= 1;
            Ok(0.5)
        }

        fn shrinkwrap(&mut self, _sigma: f64, _threshold: f64, _truncate: f64) -> Result<usize> {
            Ok(1)
        }

        fn snapshot(&self) -> Result<(Array3<Complex64>, Array3<f64>)> {
            Ok((Array3::zeros((1, 1, 1)), Array3::ones((1, 1, 1))))
        }
    }

    #[test]
    fn failed_run_keeps_completed_steps() {
        let mut solver = Solver {
            backend: Box::new(FailingBackend { steps_left: 3 }),
            options: SolverOptions::default(),
            history: ErrorHistory::new(),
            shape: [1, 1, 1],
        };
        let result = solver.error_reduction(5);
        assert!(matches!(result, Err(PhaseError::Device(_))));
        assert_eq!(solver.errors(), &[0.5, 0.5, 0.5]);
        assert!(!solver.history().is_degenerate());
    }

    #[test]
    fn shrinkwrap_default_uses_configured_threshold() {
        let (modulus, support) = inputs();
        let options = SolverOptions::default().with_shrinkwrap_threshold(0.3);
        let mut solver = Solver::builder(modulus, support)
            .options(options)
            .initial_guess(InitialGuess::Support)
            .build()
            .unwrap();
        let summary = solver.shrinkwrap_default(0.0).unwrap();
        assert_eq!(summary.threshold, 0.3);
        assert_eq!(summary.active_voxels, 18);
    }

    #[cfg(not(feature = "gpu"))]
    #[test]
    fn gpu_target_needs_feature() {
        let (modulus, support) = inputs();
        let result = Solver::new(modulus, support, ExecutionTarget::Gpu);
        assert!(matches!(
            result,
            Err(PhaseError::UnsupportedTarget {
                target: ExecutionTarget::Gpu,
                ..
            })
        ));
    }

    #[test]
    fn finalize_centers_the_peak() {
        let (modulus, support) = inputs();
        let mut solver = Solver::new(modulus, support, ExecutionTarget::Cpu).unwrap();
        solver.error_reduction(5).unwrap();
        let result = solver.finalize().unwrap();
        assert_eq!(crate::extract::peak_index(&result.image), [4, 4, 3]);
        assert_eq!(result.history.len(), 5);
    }
}
