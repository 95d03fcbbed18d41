//! bprim Data Crate
//!
//! Parameter layouts for the trainable primitives, point cloud loading, patch
//! seeding and the checkpoint file format. This crate knows nothing about the
//! training loop; it only defines what gets trained and how it is stored.

pub mod checkpoint;
pub mod ply;
pub mod triangulation;
pub mod types;

pub use checkpoint::{Checkpoint, CheckpointError, OptimizerSnapshot};
pub use ply::{PlyError, load_points_from_ply, write_splats_ply};
pub use triangulation::{ProjectionPlane, best_projection_plane, seed_patches, triangulate_points};
pub use types::{
    BPrimitive, MAX_SH_DEGREE, ParamGroup, Parameters, Point, SH_REST, Splat, inverse_sigmoid, sigmoid,
};
