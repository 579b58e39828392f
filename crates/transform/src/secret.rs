//! Whole-function driver.
//!
//! Runs the relaxer over every natural loop (innermost first) and then
//! linearizes the remaining secret-dependent branching. All surgery happens
//! on a scratch copy of the function; a structural failure leaves the
//! original body untouched.
use veil_ir::Function;

use super::{
    linearize::LinearizeSolver,
    relax::RelaxSolver,
    taint::TaintSet,
    TransformError,
};

/// Read-only taint query, exposed for diagnostics and printing.
pub fn taint_of(func: &Function) -> TaintSet {
    TaintSet::compute(func)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TransformReport {
    /// Loops whose trip count was fixed to an array extent.
    pub relaxed_loops: usize,
    /// Loops with a secret-dependent exit left conditional. Coverage
    /// limitation, not a failure.
    pub unrelaxed_loops: usize,
    /// Size of the taint closure the run started from.
    pub tainted_values: usize,
}

#[derive(Debug, Default)]
pub struct SecretFlowSolver {
    relax: RelaxSolver,
    linearize: LinearizeSolver,
}

impl SecretFlowSolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transform(&mut self, func: &mut Function) -> Result<TransformReport, TransformError> {
        let taint = TaintSet::compute(func);
        if taint.is_empty() {
            // No secret arguments, nothing to hide.
            return Ok(TransformReport::default());
        }

        let mut scratch = func.clone();
        let relax_report = self.relax.run(&mut scratch, &taint);

        // Relaxation rewires use-def edges: a widened exit comparison is no
        // longer secret-derived. The linearizer works from a fresh closure so
        // it only sees the divergence that is still observable.
        let remaining = TaintSet::compute(&scratch);
        self.linearize.run(&mut scratch, &remaining)?;

        *func = scratch;
        Ok(TransformReport {
            relaxed_loops: relax_report.relaxed,
            unrelaxed_loops: relax_report.unrelaxed,
            tainted_values: taint.value_num(),
        })
    }
}
