//! PLY point cloud loading and splat export

mod loader;
mod writer;

pub use loader::{PlyError, load_points_from_ply};
pub use writer::write_splats_ply;
