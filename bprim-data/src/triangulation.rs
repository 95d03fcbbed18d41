//! Delaunay triangulation and patch seeding for point clouds.
//!
//! The initial primitive population is a triangulated surface over the
//! structure-from-motion points: each Delaunay triangle becomes one flat patch.

use crate::types::{BPrimitive, Point};
use delaunator::{Point as DelaunayPoint, triangulate};
use glam::Vec3;
use tracing::{debug, info, warn};

/// Plane a point cloud is projected onto before 2D triangulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectionPlane {
    XY,
    XZ,
    YZ,
}

/// Analyze point cloud and determine the best projection plane for triangulation.
///
/// Returns the plane with the largest spread in the point cloud.
pub fn best_projection_plane(positions: &[Vec3]) -> ProjectionPlane {
    if positions.is_empty() {
        return ProjectionPlane::XY;
    }

    let mut min = Vec3::splat(f32::MAX);
    let mut max = Vec3::splat(f32::MIN);

    for pos in positions {
        min = min.min(*pos);
        max = max.max(*pos);
    }

    let extent = max - min;

    // Drop the axis with the smallest extent.
    if extent.z <= extent.x && extent.z <= extent.y {
        ProjectionPlane::XY
    } else if extent.y <= extent.x && extent.y <= extent.z {
        ProjectionPlane::XZ
    } else {
        ProjectionPlane::YZ
    }
}

/// Perform 2D Delaunay triangulation on a set of 3D points.
///
/// Automatically selects the best projection plane based on point distribution.
///
/// Returns a list of triangle index triplets `[i0, i1, i2]`.
pub fn triangulate_points(positions: &[Vec3]) -> Vec<[usize; 3]> {
    if positions.len() < 3 {
        warn!("Not enough points for triangulation (need at least 3)");
        return Vec::new();
    }

    let plane = best_projection_plane(positions);
    debug!("Using projection plane: {:?}", plane);

    let points: Vec<DelaunayPoint> = positions
        .iter()
        .map(|p| {
            let (x, y) = match plane {
                ProjectionPlane::XY => (p.x, p.y),
                ProjectionPlane::XZ => (p.x, p.z),
                ProjectionPlane::YZ => (p.y, p.z),
            };
            DelaunayPoint {
                x: x as f64,
                y: y as f64,
            }
        })
        .collect();

    let result = triangulate(&points);

    let triangles: Vec<[usize; 3]> = result
        .triangles
        .chunks_exact(3)
        .map(|chunk| [chunk[0], chunk[1], chunk[2]])
        .collect();

    info!(
        "Triangulated {} points into {} triangles (plane: {:?})",
        positions.len(),
        triangles.len(),
        plane
    );

    triangles
}

/// Seed flat patches from a point cloud.
///
/// Each triangle is colored with the mean of its vertex colors. Triangles whose
/// area is not above `min_area` are skipped.
pub fn seed_patches(points: &[Point], opacity: f32, min_area: f32) -> Vec<BPrimitive> {
    let positions: Vec<Vec3> = points.iter().map(|p| p.position).collect();
    let patches: Vec<BPrimitive> = triangulate_points(&positions)
        .into_iter()
        .map(|[a, b, c]| {
            let color = (points[a].color + points[b].color + points[c].color) / 3.0;
            BPrimitive::flat([positions[a], positions[b], positions[c]], color, opacity)
        })
        .filter(|patch| patch.corner_area() > min_area)
        .collect();
    debug!("Seeded {} patches from {} points", patches.len(), points.len());
    patches
}
