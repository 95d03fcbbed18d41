//! Renderer and gradient engine interface.
//!
//! The controller never rasterizes or differentiates anything itself. It hands
//! the population and a viewpoint to a [`PrimitiveBackend`] and receives the
//! rendered image plus the per-pixel buffers the statistics are built from.

use glam::Vec3;
use image::{ImageBuffer, Luma, Rgb32FImage};

use crate::error::TrainError;
use crate::loss::LossSpec;
use crate::population::PrimitiveSet;
use crate::viewpoint::Viewpoint;

/// Single-channel float image.
pub type ScalarMap = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Per-pixel primitive index; `None` where nothing was hit.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexMap {
    width: u32,
    height: u32,
    data: Vec<Option<u32>>,
}

impl IndexMap {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![None; width as usize * height as usize],
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn get(&self, x: u32, y: u32) -> Option<u32> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.data[(y * self.width + x) as usize]
    }

    /// Out-of-bounds writes are ignored.
    pub fn set(&mut self, x: u32, y: u32, index: Option<u32>) {
        if x < self.width && y < self.height {
            self.data[(y * self.width + x) as usize] = index;
        }
    }

    /// Row-major pixel entries.
    pub fn data(&self) -> &[Option<u32>] {
        &self.data
    }
}

/// Representation-specific values forwarded to the renderer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderControls {
    pub boundary_scale: f32,
    pub primitive_scale: f32,
    pub segments_per_edge: u32,
    pub active_sh_degree: u32,
    /// Renderer debug output (`--debug-from`).
    pub debug: bool,
}

/// Optional buffers a backend may produce alongside the image.
///
/// A `None` buffer means the backend cannot provide that view.
#[derive(Debug, Clone, Default)]
pub struct DebugBuffers {
    pub depth: Option<ScalarMap>,
    /// Boundary intensity in 0..1 at every pixel.
    pub boundary: Option<ScalarMap>,
    pub uvw: Option<Rgb32FImage>,
    pub surface_normal: Option<Rgb32FImage>,
    pub depth_normal: Option<Rgb32FImage>,
}

/// Result of rendering one viewpoint.
#[derive(Debug, Clone)]
pub struct RenderOutput {
    pub image: Rgb32FImage,
    pub visibility: IndexMap,
    pub debug: DebugBuffers,
}

impl RenderOutput {
    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }
}

/// Renderer plus gradient engine for the patch population.
pub trait PrimitiveBackend {
    fn render(
        &mut self,
        set: &PrimitiveSet,
        view: &Viewpoint,
        background: Vec3,
        controls: &RenderControls,
    ) -> Result<RenderOutput, TrainError>;

    /// Differentiate `loss` for the frame in `output` and add the parameter
    /// gradients into `set`. Returns the per-pixel gradient magnitude.
    fn backward(
        &mut self,
        set: &mut PrimitiveSet,
        output: &RenderOutput,
        view: &Viewpoint,
        loss: &LossSpec,
    ) -> Result<ScalarMap, TrainError>;

    /// Drop cached device memory.
    fn release_cache(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_map_bounds() {
        let mut map = IndexMap::new(3, 2);
        map.set(2, 1, Some(7));
        map.set(3, 0, Some(1));
        assert_eq!(map.get(2, 1), Some(7));
        assert_eq!(map.get(3, 0), None);
        assert_eq!(map.data().iter().flatten().count(), 1);
        assert_eq!(map.data()[5], Some(7));
    }
}
