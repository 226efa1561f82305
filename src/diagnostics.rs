//! Per-step error history, degeneracy flags and call summaries.

use serde::{Deserialize, Serialize};

use crate::engine::UpdateRule;

/// Condition that makes further iterations meaningless but does not abort the session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegeneracyKind {
    /// A shrinkwrap call left no active voxel in the support.
    EmptySupport,
    /// The reconstruction error became NaN or infinite.
    NonFiniteError,
}

/// A flagged degeneracy, located by the number of steps completed when it was seen.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Degeneracy {
    pub step: usize,
    pub kind: DegeneracyKind,
}

/// Ordered record of every reconstruction error produced during a session.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorHistory {
    errors: Vec<f64>,
    degeneracies: Vec<Degeneracy>,
}

impl ErrorHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one step's error, flagging it when it is not finite.
    ///
    /// Returns `true` when the value was flagged.
    pub fn record(&mut self, error: f64) -> bool {
        self.errors.push(error);
        if error.is_finite() {
            return false;
        }
        self.flag(DegeneracyKind::NonFiniteError);
        true
    }

    /// Flags a degeneracy at the current step count.
    pub fn flag(&mut self, kind: DegeneracyKind) {
        self.degeneracies.push(Degeneracy {
            step: self.errors.len(),
            kind,
        });
    }

    /// All recorded errors, oldest first.
    pub fn errors(&self) -> &[f64] {
        &self.errors
    }

    pub fn degeneracies(&self) -> &[Degeneracy] {
        &self.degeneracies
    }

    /// Number of steps recorded so far.
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn last(&self) -> Option<f64> {
        self.errors.last().copied()
    }

    /// Whether any degeneracy has been flagged.
    pub fn is_degenerate(&self) -> bool {
        !self.degeneracies.is_empty()
    }
}

/// Diagnostics returned by a `run` call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Rule that was applied.
    pub rule: UpdateRule,
    /// Number of steps performed.
    pub iterations: usize,
    /// Index in the session history of the first step of this run.
    pub first_step: usize,
    /// Error of the last step, if any step ran.
    pub final_error: Option<f64>,
    /// Whether a non-finite error was seen during the run.
    pub degenerate: bool,
}

/// Diagnostics returned by a shrinkwrap call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ShrinkwrapSummary {
    pub sigma: f64,
    pub threshold: f64,
    /// Number of voxels left in the new support.
    pub active_voxels: usize,
    /// Set when the new support is empty.
    pub degenerate: bool,
}
