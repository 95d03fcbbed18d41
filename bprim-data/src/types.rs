//! Core parameter types for the trainable primitives.
//!
//! Both primitive kinds are plain `#[repr(C)]` float structs so that parameter,
//! gradient and optimizer-moment buffers share one layout and can be written to
//! disk byte for byte.

use bytemuck::{Pod, Zeroable};
use glam::Vec3;
use std::ops::Range;

/// Number of higher-order spherical-harmonic coefficients per color channel (degree 3).
pub const SH_REST: usize = 15;

/// Highest supported spherical-harmonic degree.
pub const MAX_SH_DEGREE: u32 = 3;

/// A colored point in 3D space, used to seed populations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    /// Position in world space.
    pub position: Vec3,
    /// RGB color (linear, 0-1 range).
    pub color: Vec3,
}

impl Point {
    pub fn new(position: Vec3, color: Vec3) -> Self {
        Self { position, color }
    }
}

impl Default for Point {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            color: Vec3::splat(0.8),
        }
    }
}

/// Named slice of a parameter layout that shares one learning rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamGroup {
    Position,
    Color,
    FeaturesRest,
    Opacity,
    Scale,
    Rotation,
}

impl ParamGroup {
    pub fn name(self) -> &'static str {
        match self {
            ParamGroup::Position => "position",
            ParamGroup::Color => "color",
            ParamGroup::FeaturesRest => "features_rest",
            ParamGroup::Opacity => "opacity",
            ParamGroup::Scale => "scale",
            ParamGroup::Rotation => "rotation",
        }
    }
}

/// A POD parameter record whose floats are partitioned into learning-rate groups.
pub trait Parameters: Pod {
    /// Float ranges of each group inside the record.
    const GROUPS: &'static [(ParamGroup, Range<usize>)];

    /// Number of floats in one record.
    const FLOATS: usize = std::mem::size_of::<Self>() / std::mem::size_of::<f32>();

    fn floats(&self) -> &[f32] {
        bytemuck::cast_slice(std::slice::from_ref(self))
    }

    fn floats_mut(&mut self) -> &mut [f32] {
        bytemuck::cast_slice_mut(std::slice::from_mut(self))
    }

    fn is_finite(&self) -> bool {
        self.floats().iter().all(|v| v.is_finite())
    }

    fn group_range(group: ParamGroup) -> Option<Range<usize>> {
        Self::GROUPS
            .iter()
            .find(|(g, _)| *g == group)
            .map(|(_, range)| range.clone())
    }
}

/// A quadratic triangular Bezier patch.
///
/// Control points 0..3 are the corners, 3..6 the edge controls of the edges
/// (0,1), (1,2) and (2,0).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct BPrimitive {
    pub control_points: [[f32; 3]; 6],
    /// Spherical-harmonic DC color.
    pub color: [f32; 3],
    pub features_rest: [[f32; 3]; SH_REST],
    pub opacity: f32,
}

impl Parameters for BPrimitive {
    const GROUPS: &'static [(ParamGroup, Range<usize>)] = &[
        (ParamGroup::Position, 0..18),
        (ParamGroup::Color, 18..21),
        (ParamGroup::FeaturesRest, 21..66),
        (ParamGroup::Opacity, 66..67),
    ];
}

impl BPrimitive {
    /// A flat patch over a triangle; edge controls sit on the edge midpoints.
    pub fn flat(corners: [Vec3; 3], color: Vec3, opacity: f32) -> Self {
        let [a, b, c] = corners;
        let mut prim = Self::zeroed();
        let points = [a, b, c, (a + b) * 0.5, (b + c) * 0.5, (c + a) * 0.5];
        for (slot, p) in prim.control_points.iter_mut().zip(points) {
            *slot = p.to_array();
        }
        prim.color = color.to_array();
        prim.opacity = opacity;
        prim
    }

    pub fn control_point(&self, index: usize) -> Vec3 {
        Vec3::from_array(self.control_points[index])
    }

    pub fn corners(&self) -> [Vec3; 3] {
        [self.control_point(0), self.control_point(1), self.control_point(2)]
    }

    /// Symmetric quadratic control net indexed by corner pairs.
    fn net(&self, i: usize, j: usize) -> Vec3 {
        match (i.min(j), i.max(j)) {
            (0, 0) => self.control_point(0),
            (1, 1) => self.control_point(1),
            (2, 2) => self.control_point(2),
            (0, 1) => self.control_point(3),
            (1, 2) => self.control_point(4),
            _ => self.control_point(5),
        }
    }

    /// Polar form of the patch for two barycentric arguments.
    pub fn blossom(&self, p: Vec3, q: Vec3) -> Vec3 {
        let p = p.to_array();
        let q = q.to_array();
        let mut out = Vec3::ZERO;
        for i in 0..3 {
            for j in 0..3 {
                out += self.net(i, j) * (p[i] * q[j]);
            }
        }
        out
    }

    /// Surface point at barycentric coordinates `uvw`.
    pub fn evaluate(&self, uvw: Vec3) -> Vec3 {
        self.blossom(uvw, uvw)
    }

    /// Exact sub-patch over a triangle given in this patch's barycentric coordinates.
    /// Appearance is copied from the parent.
    pub fn sub_patch(&self, corners: [Vec3; 3]) -> Self {
        let [p, q, r] = corners;
        let points = [
            self.blossom(p, p),
            self.blossom(q, q),
            self.blossom(r, r),
            self.blossom(p, q),
            self.blossom(q, r),
            self.blossom(r, p),
        ];
        let mut child = *self;
        for (slot, point) in child.control_points.iter_mut().zip(points) {
            *slot = point.to_array();
        }
        child
    }

    /// Area of the corner triangle.
    pub fn corner_area(&self) -> f32 {
        let [a, b, c] = self.corners();
        (b - a).cross(c - a).length() * 0.5
    }

    /// Index of the longest corner edge: 0 = (0,1), 1 = (1,2), 2 = (2,0).
    pub fn longest_edge(&self) -> usize {
        let [a, b, c] = self.corners();
        let lengths = [a.distance_squared(b), b.distance_squared(c), c.distance_squared(a)];
        let mut best = 0;
        for (i, len) in lengths.iter().enumerate() {
            if *len > lengths[best] {
                best = i;
            }
        }
        best
    }

    /// Split into two patches across the midpoint of corner edge `edge`.
    pub fn bisect(&self, edge: usize) -> [Self; 2] {
        let bary = [Vec3::X, Vec3::Y, Vec3::Z];
        let a = bary[edge % 3];
        let b = bary[(edge + 1) % 3];
        let o = bary[(edge + 2) % 3];
        let m = (a + b) * 0.5;
        [self.sub_patch([a, m, o]), self.sub_patch([m, b, o])]
    }

    /// Midpoint subdivision into four patches.
    pub fn subdivide(&self) -> [Self; 4] {
        let (c0, c1, c2) = (Vec3::X, Vec3::Y, Vec3::Z);
        let m01 = (c0 + c1) * 0.5;
        let m12 = (c1 + c2) * 0.5;
        let m20 = (c2 + c0) * 0.5;
        [
            self.sub_patch([c0, m01, m20]),
            self.sub_patch([m01, c1, m12]),
            self.sub_patch([m20, m12, c2]),
            self.sub_patch([m01, m12, m20]),
        ]
    }

    pub fn centroid(&self) -> Vec3 {
        self.evaluate(Vec3::splat(1.0 / 3.0))
    }
}

/// A 3D Gaussian splat used by the baseline point-based path.
///
/// Scale is stored as log-scale, opacity as a logit.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Splat {
    pub position: [f32; 3],
    pub scale: [f32; 3],
    /// Rotation quaternion (x, y, z, w).
    pub rotation: [f32; 4],
    pub color: [f32; 3],
    pub features_rest: [[f32; 3]; SH_REST],
    pub opacity: f32,
}

impl Parameters for Splat {
    const GROUPS: &'static [(ParamGroup, Range<usize>)] = &[
        (ParamGroup::Position, 0..3),
        (ParamGroup::Scale, 3..6),
        (ParamGroup::Rotation, 6..10),
        (ParamGroup::Color, 10..13),
        (ParamGroup::FeaturesRest, 13..58),
        (ParamGroup::Opacity, 58..59),
    ];
}

impl Splat {
    /// Isotropic splat from a point with the given world-space radius.
    pub fn from_point(point: &Point, radius: f32, opacity: f32) -> Self {
        let mut splat = Self::zeroed();
        splat.position = point.position.to_array();
        splat.scale = [radius.max(1e-7).ln(); 3];
        splat.rotation = [0.0, 0.0, 0.0, 1.0];
        splat.color = point.color.to_array();
        splat.opacity = inverse_sigmoid(opacity);
        splat
    }

    pub fn position(&self) -> Vec3 {
        Vec3::from_array(self.position)
    }

    /// World-space scale (exponentiated).
    pub fn world_scale(&self) -> Vec3 {
        Vec3::from_array(self.scale).exp()
    }

    /// Activated opacity in 0..1.
    pub fn alpha(&self) -> f32 {
        sigmoid(self.opacity)
    }
}

pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

pub fn inverse_sigmoid(y: f32) -> f32 {
    let y = y.clamp(1e-6, 1.0 - 1e-6);
    (y / (1.0 - y)).ln()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_patch() -> BPrimitive {
        BPrimitive::flat([Vec3::ZERO, Vec3::X, Vec3::Y], Vec3::new(0.2, 0.4, 0.6), 1.0)
    }

    #[test]
    fn test_group_ranges_cover_layout() {
        let covered: usize = BPrimitive::GROUPS.iter().map(|(_, r)| r.len()).sum();
        assert_eq!(covered, BPrimitive::FLOATS);
        let covered: usize = Splat::GROUPS.iter().map(|(_, r)| r.len()).sum();
        assert_eq!(covered, Splat::FLOATS);
    }

    #[test]
    fn test_flat_patch_area() {
        let patch = unit_patch();
        assert!((patch.corner_area() - 0.5).abs() < 1e-6);
        assert_eq!(patch.control_point(3), Vec3::new(0.5, 0.0, 0.0));
    }

    #[test]
    fn test_evaluate_corners() {
        let patch = unit_patch();
        assert_eq!(patch.evaluate(Vec3::X), Vec3::ZERO);
        assert_eq!(patch.evaluate(Vec3::Y), Vec3::X);
        assert_eq!(patch.evaluate(Vec3::Z), Vec3::Y);
    }

    #[test]
    fn test_bisect_preserves_area_of_flat_patch() {
        let patch = unit_patch();
        let edge = patch.longest_edge();
        assert_eq!(edge, 1);
        let [a, b] = patch.bisect(edge);
        assert!((a.corner_area() + b.corner_area() - patch.corner_area()).abs() < 1e-6);
        assert_eq!(a.color, patch.color);
    }

    #[test]
    fn test_bisect_follows_curved_edge() {
        let mut patch = unit_patch();
        // Bend edge (0,1) upward.
        patch.control_points[3] = [0.5, 0.0, 1.0];
        let [a, _] = patch.bisect(0);
        // The split point lies on the curve: 0.25*c0 + 0.5*e + 0.25*c1.
        assert_eq!(a.control_point(1), Vec3::new(0.5, 0.0, 0.5));
    }

    #[test]
    fn test_subdivide_quarters_area() {
        let patch = unit_patch();
        let children = patch.subdivide();
        for child in &children {
            assert!((child.corner_area() - 0.125).abs() < 1e-6);
        }
    }

    #[test]
    fn test_floats_roundtrip_layout() {
        let mut patch = unit_patch();
        patch.floats_mut()[66] = 0.25;
        assert_eq!(patch.opacity, 0.25);
        assert_eq!(patch.floats()[18], 0.2);
    }

    #[test]
    fn test_splat_activation() {
        let splat = Splat::from_point(&Point::default(), 0.5, 0.1);
        assert!((splat.alpha() - 0.1).abs() < 1e-5);
        assert!((splat.world_scale().x - 0.5).abs() < 1e-5);
    }
}
