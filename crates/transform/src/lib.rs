pub mod cfg;
pub mod domtree;
pub mod linearize;
pub mod loop_analysis;
pub mod post_domtree;
pub mod relax;
pub mod secret;
pub mod taint;

use thiserror::Error;
use veil_ir::Block;

pub use secret::{taint_of, SecretFlowSolver, TransformReport};
pub use taint::TaintSet;

/// Structural precondition violations. Any of these aborts the whole
/// per-function run before a partially mutated body is committed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransformError {
    #[error("function has no entry block")]
    NoEntryBlock,

    #[error("no reconvergence point found for the branch in {0}")]
    UnresolvedReconvergence(Block),

    #[error("loop with header {0} is not in simplified form")]
    LoopNotSimplified(Block),

    #[error("phi in {0} has incoming blocks that no branch condition distinguishes")]
    AmbiguousPhiMerge(Block),
}
