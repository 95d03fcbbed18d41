//! Error types for the training controller.

use crate::mode::Mode;
use crate::stats::StatsError;
use bprim_data::{CheckpointError, PlyError};
use thiserror::Error;

/// Errors that stop a training run.
///
/// Everything here is fatal: the controller never continues on inconsistent
/// state. Recoverable conditions (a dropped client, an unsupported view) are
/// logged where they happen instead.
#[derive(Debug, Error)]
pub enum TrainError {
    #[error("Statistics error: {0}")]
    Stats(#[from] StatsError),

    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Population edit at iteration {iteration} would leave no primitives")]
    EmptyPopulation { iteration: u32 },

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("PLY error: {0}")]
    Ply(#[from] PlyError),

    #[error("Non-finite {what} at iteration {iteration} (mode {mode}, {primitives} primitives)")]
    NumericalDivergence {
        what: &'static str,
        iteration: u32,
        mode: Mode,
        primitives: usize,
    },

    #[error("Image size mismatch: expected {expected:?}, found {found:?}")]
    ImageSize {
        expected: (u32, u32),
        found: (u32, u32),
    },

    #[error("Scene has no training viewpoints")]
    NoViewpoints,

    #[error("Renderer error: {0}")]
    Render(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
