use approx::assert_relative_eq;
use ndarray::Array3;
use phaseret::extract::{center_on_peak, peak_index, roll};
use phaseret::fft::Fft3d;
use phaseret::recipe::{sigma_schedule, Recipe, StepOutcome};
use phaseret::{Complex64, ExecutionTarget, InitialGuess, PhaseError, Solver, UpdateRule};

const N: usize = 8;

/// Compact complex object filling `[2, 5)` on every axis.
fn truth() -> Array3<Complex64> {
    Array3::from_shape_fn((N, N, N), |(i, j, k)| {
        let inside = [i, j, k].iter().all(|&x| (2..5).contains(&x));
        if inside {
            let amplitude = 1.0 + 0.15 * i as f64 + 0.1 * j as f64 - 0.05 * k as f64;
            Complex64::from_polar(amplitude, 0.1 * (i as f64 - j as f64 + 0.5 * k as f64))
        } else {
            Complex64::new(0.0, 0.0)
        }
    })
}

fn modulus_of(object: &Array3<Complex64>) -> Array3<f64> {
    Fft3d::new([N, N, N])
        .forward(object)
        .unwrap()
        .mapv(|c| c.norm())
}

fn support_of(object: &Array3<Complex64>) -> Array3<f64> {
    object.mapv(|c| if c.norm() > 0.0 { 1.0 } else { 0.0 })
}

/// Truth with a small deterministic amplitude perturbation, still inside the support.
fn perturbed(object: &Array3<Complex64>) -> Array3<Complex64> {
    let mut out = object.clone();
    for (n, value) in out.iter_mut().enumerate() {
        *value *= 1.0 + 0.01 * (n as f64 * 0.7).sin();
    }
    out
}

/// Relative distance between `estimate` and `reference` after removing the global phase.
fn phase_aligned_distance(estimate: &Array3<Complex64>, reference: &Array3<Complex64>) -> f64 {
    let overlap: Complex64 = estimate
        .iter()
        .zip(reference.iter())
        .map(|(e, r)| e.conj() * r)
        .sum();
    let phase = if overlap.norm() > 0.0 {
        overlap / overlap.norm()
    } else {
        Complex64::new(1.0, 0.0)
    };
    let gap: f64 = estimate
        .iter()
        .zip(reference.iter())
        .map(|(e, r)| (e * phase - r).norm_sqr())
        .sum();
    let norm: f64 = reference.iter().map(|r| r.norm_sqr()).sum();
    (gap / norm).sqrt()
}

#[test]
fn error_reduction_recovers_a_compact_object() {
    let object = truth();
    let mut solver = Solver::builder(modulus_of(&object), support_of(&object))
        .initial_guess(InitialGuess::Provided(perturbed(&object)))
        .build()
        .unwrap();

    let summary = solver.error_reduction(200).unwrap();
    assert_eq!(summary.iterations, 200);
    assert!(!summary.degenerate);

    let errors = solver.errors();
    for pair in errors.windows(2) {
        assert!(pair[1] <= pair[0] + 1e-12, "ER error increased: {pair:?}");
    }
    assert!(errors[errors.len() - 1] < 1e-3);

    let (estimate, _) = solver.estimate().unwrap();
    assert!(phase_aligned_distance(&estimate, &object) < 1e-2);

    let result = solver.finalize().unwrap();
    assert_eq!(peak_index(&result.image), [N / 2, N / 2, N / 2]);
    assert_eq!(result.history.len(), 200);
    assert_eq!(center_on_peak(&result.image, &result.support).shift, [0, 0, 0]);
}

/// Box `[1, 6)` on every axis: one voxel of slack around the object.
fn loose_support() -> Array3<f64> {
    Array3::from_shape_fn((N, N, N), |(i, j, k)| {
        if [i, j, k].iter().all(|&x| (1..6).contains(&x)) {
            1.0
        } else {
            0.0
        }
    })
}

/// Smallest relative distance between `|estimate|` and `|reference|` over all
/// circular voxel shifts of the reference, with the shift that achieves it.
fn best_shift_magnitude_distance(
    estimate: &Array3<Complex64>,
    reference: &Array3<Complex64>,
) -> (f64, [usize; 3]) {
    let found = estimate.mapv(|c| c.norm());
    let expected = reference.mapv(|c| c.norm());
    let norm: f64 = expected.iter().map(|m| m * m).sum();
    let mut best = (f64::INFINITY, [0, 0, 0]);
    for s0 in 0..N {
        for s1 in 0..N {
            for s2 in 0..N {
                let shifted = roll(&expected, [s0, s1, s2]);
                let gap: f64 = shifted
                    .iter()
                    .zip(found.iter())
                    .map(|(a, b)| (a - b).powi(2))
                    .sum();
                let distance = (gap / norm).sqrt();
                if distance < best.0 {
                    best = (distance, [s0, s1, s2]);
                }
            }
        }
    }
    best
}

/// The loose support admits every translate of the object that fits inside it,
/// so the start fixes which one ER converges to: the object displaced by one
/// voxel along the first axis with a 1% amplitude perturbation. A random-phase
/// start does not settle within 200 steps on a support this loose.
#[test]
fn error_reduction_with_loose_support_recovers_up_to_a_shift() {
    let object = truth();
    let start = perturbed(&roll(&object, [1, 0, 0]));
    let mut solver = Solver::builder(modulus_of(&object), loose_support())
        .initial_guess(InitialGuess::Provided(start))
        .build()
        .unwrap();

    solver.error_reduction(200).unwrap();
    let errors = solver.errors();
    assert!(errors[errors.len() - 1] < 1e-3, "final error {}", errors[errors.len() - 1]);

    let (estimate, _) = solver.estimate().unwrap();
    let (distance, shift) = best_shift_magnitude_distance(&estimate, &object);
    assert!(distance < 1e-2, "magnitude distance {distance} at shift {shift:?}");
    assert_eq!(shift, [1, 0, 0]);
}

#[test]
fn all_zero_modulus_keeps_the_estimate_zero() {
    let modulus = Array3::zeros((6, 6, 6));
    let support = phaseret::data::SupportMask::centered_box([6, 6, 6], [3, 3, 3])
        .unwrap()
        .into_values();
    let mut solver = Solver::new(modulus, support, ExecutionTarget::Cpu).unwrap();

    solver.error_reduction(3).unwrap();
    solver.hybrid_input_output(3).unwrap();
    solver.solvent_flipping(3).unwrap();

    let (estimate, _) = solver.estimate().unwrap();
    assert!(estimate.iter().all(|c| c.norm() == 0.0));
    assert!(solver.errors().iter().all(|&e| e == 0.0));
    assert!(!solver.history().is_degenerate());

    let result = solver.finalize().unwrap();
    assert_eq!(result.shift, [0, 0, 0]);
    assert_eq!(center_on_peak(&result.image, &result.support).shift, [0, 0, 0]);
}

#[test]
fn invalid_inputs_fail_construction() {
    let support = Array3::ones((4, 4, 4));

    let mut negative = Array3::ones((4, 4, 4));
    negative[[1, 2, 3]] = -0.5;
    assert!(matches!(
        Solver::new(negative, support.clone(), ExecutionTarget::Cpu),
        Err(PhaseError::NegativeModulus {
            index: [1, 2, 3],
            ..
        })
    ));

    let mut nan_support = support.clone();
    nan_support[[0, 0, 0]] = f64::NAN;
    assert!(matches!(
        Solver::new(Array3::ones((4, 4, 4)), nan_support, ExecutionTarget::Cpu),
        Err(PhaseError::NonFiniteInput { .. })
    ));

    assert!(matches!(
        Solver::new(Array3::zeros((0, 4, 4)), Array3::zeros((0, 4, 4)), ExecutionTarget::Cpu),
        Err(PhaseError::EmptyVolume { .. })
    ));

    assert!(matches!(
        Solver::new(Array3::ones((4, 4, 4)), Array3::ones((4, 4, 3)), ExecutionTarget::Cpu),
        Err(PhaseError::ShapeMismatch {
            expected: [4, 4, 4],
            found: [4, 4, 3],
            ..
        })
    ));
}

#[test]
fn shrinkwrap_recipe_runs_in_order() {
    let object = truth();
    let mut solver = Solver::builder(modulus_of(&object), Array3::ones((N, N, N)))
        .initial_guess(InitialGuess::Provided(perturbed(&object)))
        .build()
        .unwrap();

    let sigmas = sigma_schedule(2.0, 0.5, 3).unwrap();
    let recipe = Recipe::new()
        .error_reduction(5)
        .shrinkwrap_cycle(&sigmas, UpdateRule::hybrid_input_output(), 10)
        .error_reduction(5);
    let outcomes = recipe.apply(&mut solver).unwrap();

    assert_eq!(outcomes.len(), recipe.len());
    assert_eq!(solver.errors().len(), recipe.total_iterations());

    let mut expected_first = 0;
    for outcome in &outcomes {
        match outcome {
            StepOutcome::Run(run) => {
                assert_eq!(run.first_step, expected_first);
                expected_first += run.iterations;
            }
            StepOutcome::Shrinkwrap(wrap) => {
                assert!(!wrap.degenerate);
                assert!(wrap.active_voxels > 0);
            }
        }
    }
}

#[test]
fn history_survives_serialization() {
    let object = truth();
    let mut solver = Solver::builder(modulus_of(&object), support_of(&object))
        .initial_guess(InitialGuess::Support)
        .build()
        .unwrap();
    solver.error_reduction(4).unwrap();
    let result = solver.finalize().unwrap();

    let json = serde_json::to_string(&result.history).unwrap();
    let history: phaseret::ErrorHistory = serde_json::from_str(&json).unwrap();
    assert_eq!(history.len(), 4);
    for (a, b) in history.errors().iter().zip(result.history.errors()) {
        assert_relative_eq!(*a, *b, epsilon = 1e-12);
    }
}
