//! Caller-side reconstruction recipes: ordered lists of runs and shrinkwrap calls.
//!
//! A recipe never lives inside a [`Solver`]; it only drives one through its
//! public operations, so any recipe can also be written out by hand.

use serde::{Deserialize, Serialize};

use crate::backend::ExecutionTarget;
use crate::diagnostics::{RunSummary, ShrinkwrapSummary};
use crate::engine::UpdateRule;
use crate::error::{PhaseError, Result};
use crate::shrinkwrap::validate_parameters;
use crate::solver::Solver;

/// One entry of a [`Recipe`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RecipeStep {
    ErrorReduction {
        iterations: usize,
    },
    /// Uses the solver's configured `beta` when none is given.
    HybridInputOutput {
        iterations: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        beta: Option<f64>,
    },
    SolventFlipping {
        iterations: usize,
    },
    /// Uses the solver's configured threshold when none is given.
    Shrinkwrap {
        sigma: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        threshold: Option<f64>,
    },
}

/// What one executed step reported.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Run(RunSummary),
    Shrinkwrap(ShrinkwrapSummary),
}

/// Ordered sequence of steps applied to a solver.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Recipe {
    pub steps: Vec<RecipeStep>,
}

impl Recipe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn error_reduction(mut self, iterations: usize) -> Self {
        self.steps.push(RecipeStep::ErrorReduction { iterations });
        self
    }

    pub fn hybrid_input_output(mut self, iterations: usize) -> Self {
        self.steps.push(RecipeStep::HybridInputOutput {
            iterations,
            beta: None,
        });
        self
    }

    pub fn hybrid_input_output_with_beta(mut self, iterations: usize, beta: f64) -> Self {
        self.steps.push(RecipeStep::HybridInputOutput {
            iterations,
            beta: Some(beta),
        });
        self
    }

    pub fn solvent_flipping(mut self, iterations: usize) -> Self {
        self.steps.push(RecipeStep::SolventFlipping { iterations });
        self
    }

    pub fn shrinkwrap(mut self, sigma: f64) -> Self {
        self.steps.push(RecipeStep::Shrinkwrap {
            sigma,
            threshold: None,
        });
        self
    }

    pub fn shrinkwrap_with_threshold(mut self, sigma: f64, threshold: f64) -> Self {
        self.steps.push(RecipeStep::Shrinkwrap {
            sigma,
            threshold: Some(threshold),
        });
        self
    }

    /// Appends one shrinkwrap per sigma, each followed by `iterations` steps of `rule`.
    pub fn shrinkwrap_cycle(mut self, sigmas: &[f64], rule: UpdateRule, iterations: usize) -> Self {
        for &sigma in sigmas {
            self = self.shrinkwrap(sigma);
            self.steps.push(match rule {
                UpdateRule::ErrorReduction => RecipeStep::ErrorReduction { iterations },
                UpdateRule::HybridInputOutput { beta } => RecipeStep::HybridInputOutput {
                    iterations,
                    beta: Some(beta),
                },
                UpdateRule::SolventFlipping => RecipeStep::SolventFlipping { iterations },
            });
        }
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Total number of iterations across all run steps.
    pub fn total_iterations(&self) -> usize {
        self.steps
            .iter()
            .map(|step| match step {
                RecipeStep::ErrorReduction { iterations }
                | RecipeStep::HybridInputOutput { iterations, .. }
                | RecipeStep::SolventFlipping { iterations } => *iterations,
                RecipeStep::Shrinkwrap { .. } => 0,
            })
            .sum()
    }

    /// Checks every step against `target` before anything runs.
    pub fn validate_for(&self, target: ExecutionTarget) -> Result<()> {
        for step in &self.steps {
            match step {
                RecipeStep::HybridInputOutput {
                    beta: Some(beta), ..
                } => UpdateRule::HybridInputOutput { beta: *beta }.validate()?,
                RecipeStep::SolventFlipping { .. } if target == ExecutionTarget::Gpu => {
                    return Err(PhaseError::UnsupportedOperation {
                        operation: UpdateRule::SolventFlipping.name(),
                        target,
                    });
                }
                RecipeStep::Shrinkwrap {
                    sigma,
                    threshold: Some(threshold),
                } => validate_parameters(*sigma, *threshold)?,
                RecipeStep::Shrinkwrap {
                    sigma,
                    threshold: None,
                } => validate_parameters(*sigma, 0.5)?,
                _ => {}
            }
        }
        Ok(())
    }

    /// Validates the recipe for the solver's target, then executes it in order.
    pub fn apply(&self, solver: &mut Solver) -> Result<Vec<StepOutcome>> {
        self.validate_for(solver.target())?;
        let mut outcomes = Vec::with_capacity(self.steps.len());
        for step in &self.steps {
            let outcome = match step {
                RecipeStep::ErrorReduction { iterations } => {
                    StepOutcome::Run(solver.error_reduction(*iterations)?)
                }
                RecipeStep::HybridInputOutput {
                    iterations,
                    beta: Some(beta),
                } => StepOutcome::Run(
                    solver.run(UpdateRule::HybridInputOutput { beta: *beta }, *iterations)?,
                ),
                RecipeStep::HybridInputOutput {
                    iterations,
                    beta: None,
                } => StepOutcome::Run(solver.hybrid_input_output(*iterations)?),
                RecipeStep::SolventFlipping { iterations } => {
                    StepOutcome::Run(solver.solvent_flipping(*iterations)?)
                }
                RecipeStep::Shrinkwrap {
                    sigma,
                    threshold: Some(threshold),
                } => StepOutcome::Shrinkwrap(solver.shrinkwrap(*sigma, *threshold)?),
                RecipeStep::Shrinkwrap {
                    sigma,
                    threshold: None,
                } => StepOutcome::Shrinkwrap(solver.shrinkwrap_default(*sigma)?),
            };
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }
}

/// Geometric sequence of `count` sigmas from `start` to `end`, both included.
pub fn sigma_schedule(start: f64, end: f64, count: usize) -> Result<Vec<f64>> {
    for (name, value) in [("start", start), ("end", end)] {
        if !(value.is_finite() && value > 0.0) {
            return Err(PhaseError::invalid_parameter(
                name,
                value,
                "finite and positive",
            ));
        }
    }
    Ok(match count {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let ratio = (end / start).powf(1.0 / (count - 1) as f64);
            (0..count)
                .map(|i| {
                    if i == count - 1 {
                        end
                    } else {
                        start * ratio.powi(i as i32)
                    }
                })
                .collect()
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn typical() -> Recipe {
        Recipe::new()
            .error_reduction(20)
            .shrinkwrap(2.0)
            .hybrid_input_output_with_beta(50, 0.8)
            .shrinkwrap_with_threshold(1.5, 0.15)
            .error_reduction(10)
    }

    #[test]
    fn json_round_trip() {
        let recipe = typical().solvent_flipping(5);
        let json = serde_json::to_string(&recipe).unwrap();
        let back: Recipe = serde_json::from_str(&json).unwrap();
        assert_eq!(back, recipe);
    }

    #[test]
    fn reads_hand_written_json() {
        let json = r#"{"steps": [
            {"op": "error_reduction", "iterations": 5},
            {"op": "hybrid_input_output", "iterations": 7},
            {"op": "shrinkwrap", "sigma": 1.0}
        ]}"#;
        let recipe: Recipe = serde_json::from_str(json).unwrap();
        assert_eq!(
            recipe,
            Recipe::new()
                .error_reduction(5)
                .hybrid_input_output(7)
                .shrinkwrap(1.0)
        );
        assert_eq!(recipe.total_iterations(), 12);
    }

    #[test]
    fn solvent_flipping_is_rejected_for_gpu_only() {
        let recipe = typical().solvent_flipping(3);
        assert!(recipe.validate_for(ExecutionTarget::Cpu).is_ok());
        assert!(matches!(
            recipe.validate_for(ExecutionTarget::Gpu),
            Err(PhaseError::UnsupportedOperation { operation: "SF", .. })
        ));
    }

    #[test]
    fn bad_parameters_fail_validation() {
        let negative_sigma = Recipe::new().shrinkwrap(-1.0);
        assert!(negative_sigma.validate_for(ExecutionTarget::Cpu).is_err());
        let bad_threshold = Recipe::new().shrinkwrap_with_threshold(1.0, 1.0);
        assert!(bad_threshold.validate_for(ExecutionTarget::Cpu).is_err());
        let bad_beta = Recipe::new().hybrid_input_output_with_beta(1, f64::INFINITY);
        assert!(bad_beta.validate_for(ExecutionTarget::Cpu).is_err());
    }

    #[test]
    fn shrinkwrap_cycle_interleaves_steps() {
        let recipe = Recipe::new().shrinkwrap_cycle(&[3.0, 2.0], UpdateRule::ErrorReduction, 4);
        assert_eq!(
            recipe.steps,
            vec![
                RecipeStep::Shrinkwrap {
                    sigma: 3.0,
                    threshold: None
                },
                RecipeStep::ErrorReduction { iterations: 4 },
                RecipeStep::Shrinkwrap {
                    sigma: 2.0,
                    threshold: None
                },
                RecipeStep::ErrorReduction { iterations: 4 },
            ]
        );
    }

    #[test]
    fn sigma_schedule_is_geometric() {
        let sigmas = sigma_schedule(4.0, 1.0, 3).unwrap();
        assert_eq!(sigmas.len(), 3);
        assert_relative_eq!(sigmas[0], 4.0);
        assert_relative_eq!(sigmas[1], 2.0, epsilon = 1e-12);
        assert_eq!(sigmas[2], 1.0);
        assert_eq!(sigma_schedule(2.0, 1.0, 1).unwrap(), vec![2.0]);
        assert!(sigma_schedule(2.0, 1.0, 0).unwrap().is_empty());
        assert!(sigma_schedule(0.0, 1.0, 4).is_err());
    }
}
