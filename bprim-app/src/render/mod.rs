//! Reference CPU backends.

mod patch;
mod splat;

pub use patch::SoftwarePatchBackend;
pub use splat::SoftwareSplatBackend;
