//! Application-level errors.

use bprim_data::CheckpointError;
use bprim_train::TrainError;
use thiserror::Error;

use crate::scene::SceneError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Train(#[from] TrainError),

    #[error("Scene error: {0}")]
    Scene(#[from] SceneError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Failed to bind viewer on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("No primitives could be seeded from {points} points")]
    NoPrimitives { points: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
